//! Cooperative admission limiter.
//!
//! Combines a concurrency cap with a bounded FIFO queue and an optional
//! rate gate. A step region synchronized on a limiter is admitted when a
//! concurrency slot is free (and, when configured, a rate permit is
//! available in the current window); otherwise it queues, up to `queue_cap`.
//! Overflow rejects with `DefenseRejected`; a waiter whose `queue_timeout`
//! expires is rejected with `Timeout`.

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use crate::engine::{AsyncSteps, CompletionHandle, RootId};
use crate::errors::{codes, StepResult};
use crate::reactor::{Handle, Reactor};
use crate::tracing_compat::trace;

use super::Gate;

/// Construction parameters for a [`Limiter`].
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    /// Concurrent entries admitted into the region.
    pub concurrency: usize,
    /// Queue bound; `None` is unbounded. Overflow → `DefenseRejected`.
    pub queue_cap: Option<usize>,
    /// Per-waiter queue timeout; expiry → `Timeout` for that waiter.
    pub queue_timeout: Option<Duration>,
    /// Optional rate cap (entries per `rate_window`), composed as a
    /// throttle in front of the concurrency slots.
    pub rate: Option<usize>,
    /// Window for the rate cap.
    pub rate_window: Duration,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            queue_cap: None,
            queue_timeout: None,
            rate: None,
            rate_window: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct LimWaiter {
    root: RootId,
    resume: CompletionHandle,
    timeout: Option<Handle>,
}

#[derive(Debug)]
struct LimiterInner {
    active: usize,
    rate_used: usize,
    timer: Option<Handle>,
    holders: Vec<RootId>,
    waiters: VecDeque<LimWaiter>,
}

/// Concurrency and rate admission control for a step region.
#[derive(Debug)]
pub struct Limiter {
    reactor: Reactor,
    options: LimiterOptions,
    state: StdMutex<LimiterInner>,
}

impl Limiter {
    /// Creates a limiter with the given options.
    #[must_use]
    pub fn new(reactor: &Reactor, options: LimiterOptions) -> Self {
        assert!(options.concurrency > 0, "limiter must admit at least one entry");
        if let Some(rate) = options.rate {
            assert!(rate > 0, "limiter rate must admit at least one entry per window");
        }
        Self {
            reactor: reactor.clone(),
            options,
            state: StdMutex::new(LimiterInner {
                active: 0,
                rate_used: 0,
                timer: None,
                holders: Vec::new(),
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Entries currently admitted.
    #[must_use]
    pub fn active(&self) -> usize {
        self.state.lock().expect("limiter state lock poisoned").active
    }

    /// Number of queued waiters.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state
            .lock()
            .expect("limiter state lock poisoned")
            .waiters
            .len()
    }

    fn admissible(&self, inner: &LimiterInner) -> bool {
        inner.active < self.options.concurrency
            && self
                .options
                .rate
                .map_or(true, |rate| inner.rate_used < rate)
    }

    fn ensure_rate_timer(gate: &Rc<Self>, inner: &mut LimiterInner) {
        if gate.options.rate.is_none() {
            return;
        }
        let armed = inner.timer.as_ref().is_some_and(Handle::is_valid);
        if !armed {
            let fire = gate.clone();
            inner.timer = Some(
                gate.reactor
                    .deferred(gate.options.rate_window, move || fire.on_rate_window()),
            );
        }
    }

    fn on_rate_window(self: Rc<Self>) {
        {
            let mut inner = self.state.lock().expect("limiter state lock poisoned");
            inner.timer = None;
            inner.rate_used = 0;
            if inner.active > 0 || !inner.waiters.is_empty() {
                Self::ensure_rate_timer(&self, &mut inner);
            }
        }
        Self::drain(&self);
    }

    /// Advances queued waiters while admission allows.
    fn drain(gate: &Rc<Self>) {
        let grants = {
            let mut inner = gate.state.lock().expect("limiter state lock poisoned");
            let mut grants = Vec::new();
            while gate.admissible(&inner) {
                match inner.waiters.pop_front() {
                    Some(waiter) => {
                        if let Some(timeout) = waiter.timeout {
                            timeout.cancel();
                        }
                        if waiter.resume.is_valid() {
                            inner.active += 1;
                            inner.rate_used += 1;
                            inner.holders.push(waiter.root);
                            Self::ensure_rate_timer(gate, &mut inner);
                            grants.push(waiter.resume);
                        }
                        // Stale waiters (cancelled while queued) are skipped.
                    }
                    None => break,
                }
            }
            grants
        };
        for resume in grants {
            trace!("limiter admitted waiter");
            resume.success();
        }
    }

    fn on_queue_timeout(self: Rc<Self>, handle: CompletionHandle) {
        let expired = {
            let mut inner = self.state.lock().expect("limiter state lock poisoned");
            match inner.waiters.iter().position(|w| w.resume == handle) {
                Some(pos) => {
                    inner.waiters.remove(pos);
                    true
                }
                None => false,
            }
        };
        if expired {
            trace!("limiter waiter timed out in queue");
            handle.error_with(codes::TIMEOUT, "limiter queue wait expired");
        }
    }

    fn dequeue(&self, handle: &CompletionHandle) {
        let mut inner = self.state.lock().expect("limiter state lock poisoned");
        if let Some(pos) = inner.waiters.iter().position(|w| w.resume == *handle) {
            if let Some(waiter) = inner.waiters.remove(pos) {
                if let Some(timeout) = waiter.timeout {
                    timeout.cancel();
                }
            }
        }
    }
}

impl Gate for Limiter {
    fn lock(self: Rc<Self>, asi: &mut AsyncSteps) -> StepResult {
        let root = asi.root_id();
        let mut inner = self.state.lock().expect("limiter state lock poisoned");
        if self.admissible(&inner) {
            inner.active += 1;
            inner.rate_used += 1;
            inner.holders.push(root);
            Self::ensure_rate_timer(&self, &mut inner);
            drop(inner);
            asi.success();
            return Ok(());
        }
        if self
            .options
            .queue_cap
            .is_some_and(|cap| inner.waiters.len() >= cap)
        {
            drop(inner);
            return asi.error_with(codes::DEFENSE_REJECTED, "limiter queue limit reached");
        }

        let handle = asi.completion_handle();
        let timeout = self.options.queue_timeout.map(|after| {
            let gate = self.clone();
            let expired = handle.clone();
            self.reactor
                .deferred(after, move || gate.on_queue_timeout(expired))
        });
        inner.waiters.push_back(LimWaiter {
            root,
            resume: handle.clone(),
            timeout,
        });
        drop(inner);

        asi.wait_external();
        let gate = self.clone();
        asi.set_cancel(move |_asi| gate.dequeue(&handle));
        Ok(())
    }

    fn unlock(self: Rc<Self>, asi: &mut AsyncSteps) {
        let root = asi.root_id();
        {
            let mut inner = self.state.lock().expect("limiter state lock poisoned");
            let pos = inner
                .holders
                .iter()
                .position(|h| *h == root)
                .expect("limiter unlock by a root that was not admitted");
            inner.holders.swap_remove(pos);
            inner.active -= 1;
        }
        Self::drain(&self);
    }

    fn release_on_cancel(self: Rc<Self>, asi: &mut AsyncSteps) {
        let root = asi.root_id();
        let was_holding = {
            let mut inner = self.state.lock().expect("limiter state lock poisoned");
            if let Some(pos) = inner.holders.iter().position(|h| *h == root) {
                inner.holders.swap_remove(pos);
                inner.active -= 1;
                true
            } else {
                if let Some(pos) = inner.waiters.iter().position(|w| w.root == root) {
                    if let Some(waiter) = inner.waiters.remove(pos) {
                        if let Some(timeout) = waiter.timeout {
                            timeout.cancel();
                        }
                    }
                }
                false
            }
        };
        if was_holding {
            trace!("limiter slot released by cancelled holder");
            Self::drain(&self);
        }
    }
}
