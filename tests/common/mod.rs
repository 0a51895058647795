#![allow(dead_code)]
//! Shared integration test utilities.
//!
//! Import with:
//! ```
//! mod common;
//! use common::*;
//! ```

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Once};
use std::time::Duration;

use stepflow::{Reactor, VirtualClock};

static INIT_LOGGING: Once = Once::new();

/// Initializes test logging once per process.
///
/// Honors `RUST_LOG`; silent by default. Lib-side events only appear when
/// the `tracing-integration` feature is enabled.
pub fn init_test_logging() {
    INIT_LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A reactor on virtual time plus the clock driving it.
pub fn virtual_reactor() -> (Reactor, Arc<VirtualClock>) {
    init_test_logging();
    let clock = Arc::new(VirtualClock::new());
    (Reactor::with_clock(clock.clone()), clock)
}

/// Drives the reactor until no work remains, advancing virtual time by the
/// reported delay between cycles.
pub fn drive(reactor: &Reactor, clock: &Arc<VirtualClock>) {
    loop {
        let cycle = reactor.iterate();
        if !cycle.have_work {
            break;
        }
        if cycle.delay > Duration::ZERO {
            clock.advance(cycle.delay);
        }
    }
}

/// Drives the reactor without advancing time past `budget`.
///
/// Returns the unspent remainder of the budget. Useful for asserting that
/// nothing fires before a deadline.
pub fn drive_for(reactor: &Reactor, clock: &Arc<VirtualClock>, budget: Duration) -> Duration {
    let mut remaining = budget;
    loop {
        let cycle = reactor.iterate();
        if !cycle.have_work {
            return remaining;
        }
        if cycle.delay == Duration::ZERO {
            continue;
        }
        if cycle.delay > remaining {
            return remaining;
        }
        remaining -= cycle.delay;
        clock.advance(cycle.delay);
    }
}

/// Shared event log recording observable execution order.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Rc<RefCell<Vec<String>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: impl Into<String>) {
        self.events.borrow_mut().push(event.into());
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.events.borrow().clone()
    }

    pub fn assert_eq(&self, expected: &[&str]) {
        assert_eq!(self.snapshot(), expected);
    }
}
