//! Per-step records.
//!
//! A [`StepData`] is one node of the execution tree: the executor callback,
//! the optional on-error callback, the ordered child queue, the armed cancel
//! hook and timeout handle, and optional loop bookkeeping. Records live in
//! the root's arena and are recycled through the configured
//! [`crate::pool::StepPool`].

use std::any::Any;
use std::collections::VecDeque;

use crate::engine::AsyncSteps;
use crate::errors::{ErrorCode, StepResult};
use crate::reactor::Handle;
use crate::util::ArenaIndex;

/// Label naming a loop frame for targeted break/continue.
pub type LoopLabel = &'static str;

pub(crate) type ExecHandler = Box<dyn FnOnce(&mut AsyncSteps) -> StepResult>;
pub(crate) type ErrorHandler = Box<dyn FnOnce(&mut AsyncSteps, &ErrorCode) -> StepResult>;
pub(crate) type CancelHandler = Box<dyn FnOnce(&mut AsyncSteps)>;
pub(crate) type LoopHandler = Box<dyn FnMut(&mut AsyncSteps, &mut LoopState) -> StepResult>;
pub(crate) type LoopCondition = Box<dyn FnMut(&mut LoopState) -> bool>;

/// Bookkeeping for a step acting as a loop frame.
///
/// The frame is iterated by reinserting the same step at the head of its
/// parent's queue until the condition fails or a break signal is observed.
pub struct LoopState {
    /// Loop label for targeted break/continue.
    pub(crate) label: Option<LoopLabel>,
    /// Iteration counter.
    pub(crate) i: usize,
    /// Type-erased iteration data (the live iterator for `for_each`).
    pub(crate) data: Option<Box<dyn Any>>,
    /// The body callback. Taken while running, put back after.
    pub(crate) handler: Option<LoopHandler>,
    /// Optional precondition, checked before every iteration.
    pub(crate) cond: Option<LoopCondition>,
}

impl LoopState {
    pub(crate) fn new(label: Option<LoopLabel>) -> Self {
        Self {
            label,
            i: 0,
            data: None,
            handler: None,
            cond: None,
        }
    }
}

impl core::fmt::Debug for LoopState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("LoopState")
            .field("label", &self.label)
            .field("i", &self.i)
            .finish_non_exhaustive()
    }
}

/// The executor stored in a step record.
pub(crate) enum ExecSlot {
    /// Blank record (pool storage).
    Idle,
    /// Run-once executor; taken when the step is dispatched.
    Once(Option<ExecHandler>),
    /// Repeating loop frame.
    Loop(LoopState),
}

/// One node of the execution tree.
pub struct StepData {
    pub(crate) parent: Option<ArenaIndex>,
    pub(crate) exec: ExecSlot,
    pub(crate) on_error: Option<ErrorHandler>,
    pub(crate) on_cancel: Option<CancelHandler>,
    pub(crate) queue: VecDeque<ArenaIndex>,
    pub(crate) limit_handle: Option<Handle>,
    pub(crate) wait_external: bool,
    pub(crate) completed: bool,
    pub(crate) loop_broken: bool,
}

impl StepData {
    /// Creates a blank record, for pool implementations.
    #[must_use]
    pub fn blank() -> Self {
        Self {
            parent: None,
            exec: ExecSlot::Idle,
            on_error: None,
            on_cancel: None,
            queue: VecDeque::new(),
            limit_handle: None,
            wait_external: false,
            completed: false,
            loop_broken: false,
        }
    }

    /// Clears the record back to its blank shape, keeping allocations.
    pub fn reset(&mut self) {
        self.parent = None;
        self.exec = ExecSlot::Idle;
        self.on_error = None;
        self.on_cancel = None;
        self.queue.clear();
        if let Some(handle) = self.limit_handle.take() {
            handle.cancel();
        }
        self.wait_external = false;
        self.completed = false;
        self.loop_broken = false;
    }

    /// True when the step may complete implicitly after its body returns:
    /// no external wait, no armed timeout, no queued children. A cancel hook
    /// on its own does not defer completion; it is simply cleared when the
    /// step completes.
    pub(crate) fn is_plain(&self) -> bool {
        !self.wait_external && self.limit_handle.is_none() && self.queue.is_empty()
    }
}

impl core::fmt::Debug for StepData {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let exec = match &self.exec {
            ExecSlot::Idle => "idle",
            ExecSlot::Once(_) => "once",
            ExecSlot::Loop(_) => "loop",
        };
        f.debug_struct("StepData")
            .field("parent", &self.parent)
            .field("exec", &exec)
            .field("children", &self.queue.len())
            .field("wait_external", &self.wait_external)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}
