//! The cooperative reactor driving step execution.
//!
//! The reactor schedules zero-delay (immediate) and delayed (deferred)
//! callbacks on a single driving thread. Callbacks never run concurrently
//! with each other. Pending callbacks are referenced through [`Handle`]s
//! whose generation cookie detects use after the underlying slot was fired,
//! cancelled, or reused.
//!
//! # Embedding
//!
//! [`Reactor::iterate`] runs one cycle and reports whether work remains and
//! the delay until the next deadline, for integration with an external loop.
//! [`Reactor::run`] is the built-in wall-clock driver.
//!
//! # Thread safety
//!
//! All scheduling operations are single-thread: they must be called from the
//! thread that created the reactor. The one documented cross-thread producer
//! is [`RemoteReactor::post`], which enqueues a `Send` callback that the next
//! cycle drains into the immediate queue.

pub mod clock;

pub use clock::{Time, TimeSource, VirtualClock, WallClock};

use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::{Arc, Mutex, Weak as ArcWeak};
use std::thread::ThreadId;
use std::time::Duration;

use crate::tracing_compat::{debug, trace};
use crate::util::{Arena, ArenaIndex};

type Callback = Box<dyn FnOnce()>;
type RemoteCallback = Box<dyn FnOnce() + Send>;

/// Reactor tuning knobs.
#[derive(Debug, Clone)]
pub struct ReactorConfig {
    /// Maximum number of immediates run per cycle. Immediates queued while a
    /// cycle runs are held over to the next cycle regardless.
    pub immediate_burst: usize,
}

impl Default for ReactorConfig {
    fn default() -> Self {
        Self {
            immediate_burst: 128,
        }
    }
}

impl ReactorConfig {
    /// Returns a config with the given immediate burst limit.
    #[must_use]
    pub const fn with_immediate_burst(mut self, burst: usize) -> Self {
        self.immediate_burst = burst;
        self
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct TimerEntry {
    deadline: Time,
    seq: u64,
    slot: ArenaIndex,
}

struct Inner {
    slots: Arena<Callback>,
    immediates: VecDeque<ArenaIndex>,
    timers: BinaryHeap<Reverse<TimerEntry>>,
    seq: u64,
}

#[derive(Default)]
struct Injector {
    queue: Mutex<Vec<RemoteCallback>>,
}

impl Injector {
    fn drain(&self) -> Vec<RemoteCallback> {
        let mut queue = self.queue.lock().expect("injector lock poisoned");
        std::mem::take(&mut *queue)
    }
}

struct ReactorCore {
    inner: RefCell<Inner>,
    injector: Arc<Injector>,
    clock: Arc<dyn TimeSource>,
    thread: ThreadId,
    config: ReactorConfig,
}

/// Result of one reactor cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleResult {
    /// Whether any callbacks remain scheduled.
    pub have_work: bool,
    /// Delay until the next deadline; zero while immediates remain.
    pub delay: Duration,
}

/// Handle to a pending reactor callback.
///
/// The handle stays safe to use after the callback has fired or been
/// cancelled: `cancel` becomes a no-op and `is_valid` reports false, backed
/// by the slot's generation cookie.
#[derive(Debug)]
pub struct Handle {
    core: Weak<ReactorCore>,
    slot: ArenaIndex,
}

impl Handle {
    /// Cancels the pending callback. Idempotent; never invokes the callback.
    pub fn cancel(&self) {
        if let Some(core) = self.core.upgrade() {
            let mut inner = core.inner.borrow_mut();
            if inner.slots.remove(self.slot).is_some() {
                trace!(slot = ?self.slot, "reactor callback cancelled");
            }
        }
    }

    /// Returns true iff the handle still refers to a pending callback.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.core
            .upgrade()
            .is_some_and(|core| core.inner.borrow().slots.contains(self.slot))
    }
}

/// Cross-thread producer handle for a reactor.
///
/// This is the minimum viable cross-thread surface: posted callbacks are
/// drained into the immediate queue at the start of the next cycle.
#[derive(Clone)]
pub struct RemoteReactor {
    injector: ArcWeak<Injector>,
}

impl RemoteReactor {
    /// Posts a callback onto the reactor from any thread.
    ///
    /// Returns false when the reactor no longer exists.
    pub fn post(&self, callback: impl FnOnce() + Send + 'static) -> bool {
        match self.injector.upgrade() {
            Some(injector) => {
                let mut queue = injector.queue.lock().expect("injector lock poisoned");
                queue.push(Box::new(callback));
                true
            }
            None => false,
        }
    }
}

/// The cooperative event loop.
///
/// Cheap to clone; all clones share the same queues.
#[derive(Clone)]
pub struct Reactor {
    core: Rc<ReactorCore>,
}

impl std::fmt::Debug for Reactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reactor").finish_non_exhaustive()
    }
}

impl Reactor {
    /// Creates a reactor driven by the wall clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_parts(ReactorConfig::default(), Arc::new(WallClock::new()))
    }

    /// Creates a reactor with a custom clock (virtual time in tests).
    #[must_use]
    pub fn with_clock(clock: Arc<dyn TimeSource>) -> Self {
        Self::with_parts(ReactorConfig::default(), clock)
    }

    /// Creates a reactor from explicit parts.
    #[must_use]
    pub fn with_parts(config: ReactorConfig, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            core: Rc::new(ReactorCore {
                inner: RefCell::new(Inner {
                    slots: Arena::new(),
                    immediates: VecDeque::new(),
                    timers: BinaryHeap::new(),
                    seq: 0,
                }),
                injector: Arc::new(Injector::default()),
                clock,
                thread: std::thread::current().id(),
                config,
            }),
        }
    }

    /// Queues `callback` to run as soon as the current dispatch returns.
    ///
    /// FIFO among immediates queued during the same cycle.
    pub fn immediate(&self, callback: impl FnOnce() + 'static) -> Handle {
        let mut inner = self.core.inner.borrow_mut();
        let slot = inner.slots.insert(Box::new(callback));
        inner.immediates.push_back(slot);
        Handle {
            core: Rc::downgrade(&self.core),
            slot,
        }
    }

    /// Queues `callback` to run after at least `delay`.
    ///
    /// Ready deferreds run in deadline order; ties break FIFO.
    pub fn deferred(&self, delay: Duration, callback: impl FnOnce() + 'static) -> Handle {
        let mut inner = self.core.inner.borrow_mut();
        let slot = inner.slots.insert(Box::new(callback));
        let deadline = self.core.clock.now().saturating_add(delay);
        let seq = inner.seq;
        inner.seq += 1;
        inner.timers.push(Reverse(TimerEntry {
            deadline,
            seq,
            slot,
        }));
        Handle {
            core: Rc::downgrade(&self.core),
            slot,
        }
    }

    /// Cancels a pending callback. Idempotent; safe after the callback fired.
    pub fn cancel(&self, handle: &Handle) {
        handle.cancel();
    }

    /// Returns true iff `handle` still refers to a pending callback.
    #[must_use]
    pub fn is_valid(&self, handle: &Handle) -> bool {
        handle.is_valid()
    }

    /// Returns true iff called from the reactor's driving thread.
    #[must_use]
    pub fn is_same_thread(&self) -> bool {
        std::thread::current().id() == self.core.thread
    }

    /// Returns a `Send + Sync` producer handle for cross-thread posting.
    #[must_use]
    pub fn remote(&self) -> RemoteReactor {
        RemoteReactor {
            injector: Arc::downgrade(&self.core.injector),
        }
    }

    /// Returns the current time from the reactor's clock.
    #[must_use]
    pub fn now(&self) -> Time {
        self.core.clock.now()
    }

    /// Runs one cycle: all immediates present at entry (bounded by the burst
    /// limit), then all deferreds due by now.
    pub fn iterate(&self) -> CycleResult {
        // Cross-thread posts become ordinary immediates of this cycle.
        for callback in self.core.injector.drain() {
            let mut inner = self.core.inner.borrow_mut();
            let callback: Callback = callback;
            let slot = inner.slots.insert(callback);
            inner.immediates.push_back(slot);
        }

        let burst = {
            let inner = self.core.inner.borrow();
            inner.immediates.len().min(self.core.config.immediate_burst)
        };

        for _ in 0..burst {
            let callback = {
                let mut inner = self.core.inner.borrow_mut();
                match inner.immediates.pop_front() {
                    Some(slot) => inner.slots.remove(slot),
                    None => None,
                }
            };
            if let Some(callback) = callback {
                run_guarded(callback);
            }
        }

        loop {
            let callback = {
                let mut inner = self.core.inner.borrow_mut();
                let now = self.core.clock.now();
                let due = inner
                    .timers
                    .peek()
                    .is_some_and(|Reverse(entry)| entry.deadline <= now);
                if !due {
                    break;
                }
                let entry = inner.timers.pop().expect("due timer entry").0;
                inner.slots.remove(entry.slot)
            };
            // A stale entry means the handle was cancelled; skip it.
            if let Some(callback) = callback {
                run_guarded(callback);
            }
        }

        let mut inner = self.core.inner.borrow_mut();
        if !inner.immediates.is_empty() {
            return CycleResult {
                have_work: true,
                delay: Duration::ZERO,
            };
        }

        // Prune cancelled timers so the reported delay is accurate.
        loop {
            let head = inner
                .timers
                .peek()
                .map(|Reverse(entry)| (entry.deadline, entry.slot));
            let Some((deadline, slot)) = head else { break };
            if inner.slots.contains(slot) {
                let delay = deadline.saturating_since(self.core.clock.now());
                return CycleResult {
                    have_work: true,
                    delay,
                };
            }
            inner.timers.pop();
        }

        CycleResult {
            have_work: false,
            delay: Duration::ZERO,
        }
    }

    /// Drives the reactor until no work remains, sleeping between cycles.
    ///
    /// Only meaningful with a wall clock; with a virtual clock, drive
    /// [`Reactor::iterate`] manually and advance the clock.
    pub fn run(&self) {
        loop {
            let cycle = self.iterate();
            if !cycle.have_work {
                break;
            }
            if cycle.delay > Duration::ZERO {
                std::thread::sleep(cycle.delay);
            }
        }
        debug!("reactor idle");
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

/// The reactor itself never fails: a panicking callback is caught and the
/// cycle continues. Engine-owned callbacks route errors through the engine's
/// unwind before they reach this boundary. The one exception is a fatal
/// argument-channel mismatch, which is a programming error and is re-raised.
fn run_guarded(callback: Callback) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
        if payload.is::<crate::args::FatalMismatch>() {
            std::panic::resume_unwind(payload);
        }
        crate::tracing_compat::error!("reactor callback panicked");
    }
}
