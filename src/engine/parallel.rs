//! Parallel sub-flow driver.
//!
//! [`Parallel`] turns one parent step into N sub-roots executed concurrently
//! on the reactor (cooperatively interleaved, one step at a time per
//! sub-flow). Sub-flows share the parent root's state. The parent step
//! completes when every sub-flow completed successfully; the first sub-flow
//! to error cancels the others and fails the parent step with that code,
//! recoverable by the parent's on-error handler.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::errors::StepResult;
use crate::step::{ErrorHandler, ExecHandler, ExecSlot};
use crate::tracing_compat::{debug, error, trace};

use super::{AsyncSteps, CompletionHandle, RootCore, RootOutcome};

struct ParEntry {
    exec: ExecHandler,
    on_error: Option<ErrorHandler>,
}

/// Handle registering sub-flows of a parallel block.
///
/// Obtained from [`AsyncSteps::parallel`]; sub-flows added after the block
/// started executing are ignored with a diagnostic.
pub struct Parallel {
    entries: Rc<RefCell<Option<Vec<ParEntry>>>>,
}

impl Parallel {
    /// Registers a sub-flow.
    pub fn add<F>(&self, func: F) -> &Self
    where
        F: FnOnce(&mut AsyncSteps) -> StepResult + 'static,
    {
        self.push(Box::new(func), None);
        self
    }

    /// Registers a sub-flow with its own on-error handler.
    pub fn add_catch<F, H>(&self, func: F, on_error: H) -> &Self
    where
        F: FnOnce(&mut AsyncSteps) -> StepResult + 'static,
        H: FnOnce(&mut AsyncSteps, &crate::errors::ErrorCode) -> StepResult + 'static,
    {
        self.push(Box::new(func), Some(Box::new(on_error)));
        self
    }

    fn push(&self, exec: ExecHandler, on_error: Option<ErrorHandler>) {
        match self.entries.borrow_mut().as_mut() {
            Some(entries) => entries.push(ParEntry { exec, on_error }),
            None => error!("parallel sub-flow added after execution is ignored"),
        }
    }
}

impl core::fmt::Debug for Parallel {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let pending = self.entries.borrow().as_ref().map(Vec::len);
        f.debug_struct("Parallel").field("pending", &pending).finish()
    }
}

struct Group {
    remaining: Cell<usize>,
    failed: Cell<bool>,
    roots: RefCell<Vec<Rc<RootCore>>>,
    parent: CompletionHandle,
}

impl Group {
    fn cancel_all(&self) {
        for core in self.roots.borrow().iter() {
            core.cancel_root();
        }
    }

    fn on_sub_finish(&self, outcome: RootOutcome) {
        match outcome {
            RootOutcome::Success => {
                let left = self.remaining.get() - 1;
                self.remaining.set(left);
                trace!(remaining = left, "parallel sub-flow finished");
                if left == 0 && !self.failed.get() {
                    self.parent.success();
                }
            }
            RootOutcome::Error(code) => {
                if !self.failed.replace(true) {
                    debug!(code = %code, "parallel sub-flow errored; cancelling siblings");
                    self.cancel_all();
                    self.parent.error(code);
                }
            }
            RootOutcome::Cancelled => {}
        }
    }
}

/// Builds the parallel parent step and returns its registration handle.
pub(super) fn make(asi: &mut AsyncSteps, on_error: Option<ErrorHandler>) -> Parallel {
    let entries: Rc<RefCell<Option<Vec<ParEntry>>>> = Rc::new(RefCell::new(Some(Vec::new())));

    let exec_entries = entries.clone();
    let exec = move |asi: &mut AsyncSteps| -> StepResult {
        let list = exec_entries.borrow_mut().take().unwrap_or_default();
        run_block(asi, list)
    };
    asi.push_step(ExecSlot::Once(Some(Box::new(exec))), on_error);

    Parallel { entries }
}

fn run_block(asi: &mut AsyncSteps, list: Vec<ParEntry>) -> StepResult {
    if list.is_empty() {
        return Ok(());
    }

    let group = Rc::new(Group {
        remaining: Cell::new(list.len()),
        failed: Cell::new(false),
        roots: RefCell::new(Vec::with_capacity(list.len())),
        parent: asi.completion_handle(),
    });

    let reactor = asi.reactor().clone();
    let shared_state = asi.core().state.clone();
    for entry in list {
        let mut sub = AsyncSteps::sub_flow(&reactor, shared_state.clone());
        match entry.on_error {
            Some(handler) => {
                sub.push_step(ExecSlot::Once(Some(entry.exec)), Some(handler));
            }
            None => {
                sub.push_step(ExecSlot::Once(Some(entry.exec)), None);
            }
        }
        let sink_group = group.clone();
        sub.core().inner.borrow_mut().finish_sink =
            Some(Box::new(move |outcome| sink_group.on_sub_finish(outcome)));
        group.roots.borrow_mut().push(sub.core().clone());
        sub.execute();
    }

    let cancel_group = group.clone();
    asi.wait_external();
    asi.set_cancel(move |_asi| {
        cancel_group.failed.set(true);
        cancel_group.cancel_all();
    });
    Ok(())
}
