//! Cooperative synchronization primitives.
//!
//! Unlike hardware-level locking, these primitives serve logical purposes:
//! limiting concurrency of execution, limiting the rate of entry, or both.
//! They are cooperative gates guarding a step region, shareable across
//! roots on the same reactor.
//!
//! All variants implement one interface, [`Gate`]: `lock` may suspend the
//! current step (it registers a waiter and waits externally), `unlock` must
//! not. Steps are synchronized with [`crate::AsyncSteps::sync`], which locks
//! the gate before the body and releases it afterwards, on error, and on
//! cancellation.
//!
//! - [`Mutex`] — exclusive entry, reentrant per root, FIFO waiters.
//! - [`Throttle`] — at most N entries per tumbling time window.
//! - [`Limiter`] — admission control: concurrency cap, bounded queue with
//!   optional per-waiter timeout, optional composed rate gate.

mod limiter;
mod mutex;
mod throttle;

pub use limiter::{Limiter, LimiterOptions};
pub use mutex::Mutex;
pub use throttle::Throttle;

use std::rc::Rc;

use crate::engine::AsyncSteps;
use crate::errors::StepResult;

/// A cooperative gate guarding a step region.
///
/// Implementations are driven by the engine's `sync` wrapper. Each waiter is
/// resumed exactly once; waiters that were cancelled while queued are
/// detected through their stale completion handles and skipped.
pub trait Gate {
    /// Acquires the gate for the current step's root.
    ///
    /// Grants either synchronously (completing the current step) or later,
    /// by resuming the registered waiter. May arm a cancel hook so a waiter
    /// cancelled in the queue is deregistered.
    ///
    /// # Errors
    ///
    /// Admission-control variants reject with `DefenseRejected` (queue
    /// overflow) or `Timeout` (queue wait expired).
    fn lock(self: Rc<Self>, asi: &mut AsyncSteps) -> StepResult;

    /// Releases the gate. Must not suspend.
    fn unlock(self: Rc<Self>, asi: &mut AsyncSteps);

    /// Releases whatever `asi`'s root holds or awaits on this gate.
    ///
    /// Invoked by the `sync` wrapper's cancel hook when the synchronized
    /// region is cancelled or unwound, in which case the regular unlock step
    /// never runs. Must be safe to call when the root neither holds nor
    /// awaits the gate. The default does nothing, for gates that hold no
    /// per-root resource past entry.
    fn release_on_cancel(self: Rc<Self>, asi: &mut AsyncSteps) {
        let _ = asi;
    }
}
