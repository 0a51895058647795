//! Cooperative rate throttle.
//!
//! Admits at most `max` entries per time window. The window tumbles: a
//! periodic timer resets the permit counter and advances queued waiters in
//! FIFO order. `unlock` is a no-op, the throttle measures entry rate, not
//! holding time.
//!
//! The window timer is armed on first use and re-armed only while there is
//! activity (permits spent or waiters queued), so an idle throttle costs
//! nothing on the reactor.

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use crate::engine::{AsyncSteps, CompletionHandle};
use crate::errors::{codes, StepResult};
use crate::reactor::{Handle, Reactor};
use crate::tracing_compat::trace;

use super::Gate;

#[derive(Debug)]
struct ThrottleInner {
    used: usize,
    timer: Option<Handle>,
    waiters: VecDeque<CompletionHandle>,
}

/// N-entries-per-window rate gate.
#[derive(Debug)]
pub struct Throttle {
    reactor: Reactor,
    max: usize,
    window: Duration,
    queue_cap: Option<usize>,
    state: StdMutex<ThrottleInner>,
}

impl Throttle {
    /// Creates a throttle admitting `max` entries per `window`.
    #[must_use]
    pub fn new(reactor: &Reactor, max: usize, window: Duration) -> Self {
        Self::with_queue_cap(reactor, max, window, None)
    }

    /// As [`Throttle::new`], additionally rejecting waiters beyond
    /// `queue_cap` with `DefenseRejected`.
    #[must_use]
    pub fn with_queue_cap(
        reactor: &Reactor,
        max: usize,
        window: Duration,
        queue_cap: Option<usize>,
    ) -> Self {
        assert!(max > 0, "throttle must admit at least one entry per window");
        Self {
            reactor: reactor.clone(),
            max,
            window,
            queue_cap,
            state: StdMutex::new(ThrottleInner {
                used: 0,
                timer: None,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Permits spent in the current window.
    #[must_use]
    pub fn used(&self) -> usize {
        self.state.lock().expect("throttle state lock poisoned").used
    }

    /// Number of queued waiters.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state
            .lock()
            .expect("throttle state lock poisoned")
            .waiters
            .len()
    }

    fn ensure_timer(gate: &Rc<Self>, inner: &mut ThrottleInner) {
        let armed = inner.timer.as_ref().is_some_and(Handle::is_valid);
        if !armed {
            let fire = gate.clone();
            inner.timer = Some(
                gate.reactor
                    .deferred(gate.window, move || fire.on_window()),
            );
        }
    }

    fn on_window(self: Rc<Self>) {
        let grants = {
            let mut inner = self.state.lock().expect("throttle state lock poisoned");
            inner.timer = None;
            inner.used = 0;
            let mut grants = Vec::new();
            while inner.used < self.max {
                match inner.waiters.pop_front() {
                    Some(handle) if handle.is_valid() => {
                        inner.used += 1;
                        grants.push(handle);
                    }
                    // Cancelled while queued.
                    Some(_) => {}
                    None => break,
                }
            }
            if inner.used > 0 || !inner.waiters.is_empty() {
                Self::ensure_timer(&self, &mut inner);
            }
            grants
        };
        trace!(grants = grants.len(), "throttle window reset");
        for handle in grants {
            handle.success();
        }
    }

    fn dequeue(&self, handle: &CompletionHandle) {
        let mut inner = self.state.lock().expect("throttle state lock poisoned");
        if let Some(pos) = inner.waiters.iter().position(|w| w == handle) {
            inner.waiters.remove(pos);
        }
    }
}

impl Gate for Throttle {
    fn lock(self: Rc<Self>, asi: &mut AsyncSteps) -> StepResult {
        let mut inner = self.state.lock().expect("throttle state lock poisoned");
        Self::ensure_timer(&self, &mut inner);
        if inner.used < self.max {
            inner.used += 1;
            drop(inner);
            asi.success();
            return Ok(());
        }
        if self
            .queue_cap
            .is_some_and(|cap| inner.waiters.len() >= cap)
        {
            drop(inner);
            return asi.error_with(codes::DEFENSE_REJECTED, "throttle queue limit reached");
        }
        let handle = asi.completion_handle();
        inner.waiters.push_back(handle.clone());
        drop(inner);
        asi.wait_external();
        let gate = self.clone();
        asi.set_cancel(move |_asi| gate.dequeue(&handle));
        Ok(())
    }

    fn unlock(self: Rc<Self>, _asi: &mut AsyncSteps) {
        // Rate gates measure entry, not holding time.
    }

    fn release_on_cancel(self: Rc<Self>, asi: &mut AsyncSteps) {
        // No per-root resource is held past entry; just deregister a
        // queued waiter of this root, if any.
        let root = asi.root_id();
        let mut inner = self.state.lock().expect("throttle state lock poisoned");
        if let Some(pos) = inner
            .waiters
            .iter()
            .position(|w| w.root_id() == Some(root))
        {
            inner.waiters.remove(pos);
        }
    }
}
