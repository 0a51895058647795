//! External completion handles.
//!
//! A step that called [`crate::AsyncSteps::wait_external`] is completed by
//! external code through a [`CompletionHandle`]. The handle carries the
//! step's generation-validated identity, so completions that arrive after
//! the step was cancelled, timed out, or unwound are detected and ignored
//! rather than corrupting a reused slot.
//!
//! Handles are single-thread, like the root they refer to; cross-thread
//! completion goes through [`crate::reactor::RemoteReactor`] by posting a
//! callback that uses the handle on the reactor thread.

use std::rc::Weak;

use crate::args::IntoArgs;
use crate::errors::{CaughtException, Error, ErrorCode};
use crate::tracing_compat::debug;

use super::root::{RootCore, RootStatus, StepId};
use super::RootId;

/// Handle completing one awaiting step from outside the engine.
#[derive(Clone)]
pub struct CompletionHandle {
    core: Weak<RootCore>,
    step: StepId,
}

impl CompletionHandle {
    pub(crate) fn new(core: Weak<RootCore>, step: StepId) -> Self {
        Self { core, step }
    }

    /// A handle that is never valid.
    pub(crate) fn dead() -> Self {
        Self {
            core: Weak::new(),
            step: StepId::new(u32::MAX, u32::MAX),
        }
    }

    /// True while the step can still be completed through this handle.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let Some(core) = self.core.upgrade() else {
            return false;
        };
        let inner = core.inner.borrow();
        inner.status == RootStatus::Running && inner.steps.contains(self.step)
    }

    /// The id of the root this handle belongs to, while it is alive.
    #[must_use]
    pub fn root_id(&self) -> Option<RootId> {
        self.core.upgrade().map(|core| core.root_id)
    }

    /// Completes the step successfully, leaving the argument channel
    /// untouched. Returns false when the completion was stale and ignored.
    pub fn success(&self) -> bool {
        self.complete(None)
    }

    /// Completes the step, storing 1–4 values for the next step.
    pub fn success_with<A: IntoArgs>(&self, args: A) -> bool {
        self.complete(Some(args.into_slots()))
    }

    fn complete(&self, args: Option<[crate::value::Value; crate::args::MAX_NEXT_ARGS]>) -> bool {
        let Some(core) = self.core.upgrade() else {
            debug!("late completion on a dropped root ignored");
            return false;
        };
        {
            let mut inner = core.inner.borrow_mut();
            if inner.status != RootStatus::Running || inner.stack.last() != Some(&self.step) {
                debug!(step = ?self.step, "late completion ignored");
                return false;
            }
            if !inner.steps.contains(self.step) {
                debug!(step = ?self.step, "completion for a reused slot ignored");
                return false;
            }
            if let Some(slots) = args {
                inner.args.assign(slots);
            }
        }
        core.finish_current();
        true
    }

    /// Fails the step with `code`. Returns false when stale and ignored.
    pub fn error(&self, code: impl Into<ErrorCode>) -> bool {
        self.error_impl(code.into(), None)
    }

    /// Fails the step with `code`, recording `info` in `error_info`.
    pub fn error_with(&self, code: impl Into<ErrorCode>, info: impl Into<String>) -> bool {
        self.error_impl(code.into(), Some(info.into()))
    }

    fn error_impl(&self, code: ErrorCode, info: Option<String>) -> bool {
        let Some(core) = self.core.upgrade() else {
            debug!("late error on a dropped root ignored");
            return false;
        };
        {
            let inner = core.inner.borrow();
            if inner.status != RootStatus::Running || inner.stack.last() != Some(&self.step) {
                debug!(step = ?self.step, "late error ignored");
                return false;
            }
        }
        {
            let mut state = core.state.borrow_mut();
            state.error_info = info.unwrap_or_default();
            state.last_exception = Some(CaughtException::Error(Error::new(code.clone())));
        }
        core.handle_error(code);
        true
    }
}

impl PartialEq for CompletionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.step == other.step && Weak::ptr_eq(&self.core, &other.core)
    }
}

impl Eq for CompletionHandle {}

impl core::fmt::Debug for CompletionHandle {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("step", &self.step)
            .field("valid", &self.is_valid())
            .finish()
    }
}
