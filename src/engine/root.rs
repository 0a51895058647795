//! Root execution state machine.
//!
//! A root drives one tree of steps to completion on its reactor. The
//! dispatcher pops the next pending child of the current frame, runs its
//! executor, and applies the resulting transition: descend into children,
//! await an external completion, complete implicitly, or unwind an error.
//!
//! All user callbacks run with no internal borrow held, so a callback is
//! free to call back into the engine (add children, complete, cancel).
//! Panics escaping a callback are caught here and re-enter the unwind as
//! `InternalError`; fatal argument-channel mismatches are re-raised.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::args::{FatalMismatch, NextArgs};
use crate::errors::{codes, CaughtException, ErrorCode, PanicPayload, StepResult};
use crate::pool::StepPool;
use crate::reactor::{Handle, Reactor};
use crate::state::State;
use crate::step::{CancelHandler, ErrorHandler, ExecHandler, ExecSlot, LoopState, StepData};
use crate::tracing_compat::{debug, error, trace};
use crate::util::{Arena, ArenaIndex};

use super::{AsyncSteps, Scope};

pub(crate) type StepId = ArenaIndex;

/// Execution status of a root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootStatus {
    /// Steps may be added; `execute` has not been called.
    Idle,
    /// The reactor is driving the tree.
    Running,
    /// `cancel` was called; no further step bodies run.
    Cancelled,
    /// The tree ran to completion or an unrecovered error.
    Finished,
}

/// Identifier of a root, used by sync primitives to detect reentry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootId(u64);

static NEXT_ROOT_ID: AtomicU64 = AtomicU64::new(1);

impl RootId {
    fn next() -> Self {
        Self(NEXT_ROOT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// How a root finished, reported to the internal finish sink.
pub(crate) enum RootOutcome {
    Success,
    Error(ErrorCode),
    Cancelled,
}

pub(crate) type FinishSink = Box<dyn FnOnce(RootOutcome)>;

pub(crate) struct RootInner {
    pub(crate) steps: Arena<Box<StepData>>,
    pub(crate) root_queue: VecDeque<StepId>,
    pub(crate) stack: Vec<StepId>,
    pub(crate) args: NextArgs,
    pub(crate) status: RootStatus,
    pub(crate) exec_handle: Option<Handle>,
    pub(crate) finish_sink: Option<FinishSink>,
    pub(crate) pool: Rc<dyn StepPool>,
    torn_down: bool,
}

pub(crate) struct RootCore {
    pub(crate) inner: RefCell<RootInner>,
    pub(crate) state: Rc<RefCell<State>>,
    pub(crate) reactor: Reactor,
    pub(crate) root_id: RootId,
    weak_self: Weak<RootCore>,
}

/// Result of invoking a user callback.
enum CallOutcome {
    Ok,
    Err(ErrorCode),
}

/// Transition chosen after a step body returned.
enum AfterBody {
    Finish,
    Descend,
    Await,
    Stale,
}

impl RootCore {
    pub(crate) fn create(
        reactor: Reactor,
        state: Rc<RefCell<State>>,
        pool: Rc<dyn StepPool>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            inner: RefCell::new(RootInner {
                steps: Arena::new(),
                root_queue: VecDeque::new(),
                stack: Vec::new(),
                args: NextArgs::new(),
                status: RootStatus::Idle,
                exec_handle: None,
                finish_sink: None,
                pool,
                torn_down: false,
            }),
            state,
            reactor,
            root_id: RootId::next(),
            weak_self: weak_self.clone(),
        })
    }

    /// A fresh owning reference to this core.
    fn rc(&self) -> Rc<Self> {
        self.weak_self.upgrade().expect("root core alive")
    }

    /// Starts execution of the root tree.
    pub(crate) fn execute_root(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            match inner.status {
                RootStatus::Idle => {}
                _ => {
                    error!("execute() on a non-idle root is ignored");
                    return;
                }
            }
            if inner.root_queue.is_empty() {
                error!("execute() on a root with no steps is ignored");
                return;
            }
            inner.status = RootStatus::Running;
            trace!(root = ?self.root_id, "root executing");
        }
        self.schedule();
    }

    /// Schedules the next dispatch turn, deduplicating pending turns.
    pub(crate) fn schedule(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.status != RootStatus::Running {
            return;
        }
        if inner.exec_handle.as_ref().is_some_and(Handle::is_valid) {
            return;
        }
        let core = self.rc();
        let handle = self.reactor.immediate(move || core.dispatch());
        inner.exec_handle = Some(handle);
    }

    /// Runs one dispatch turn: pop and execute the next pending step.
    fn dispatch(&self) {
        let step_id = {
            let mut inner = self.inner.borrow_mut();
            if inner.status != RootStatus::Running {
                return;
            }
            inner.exec_handle = None;
            let next = match inner.stack.last().copied() {
                Some(top) => inner
                    .steps
                    .get_mut(top)
                    .and_then(|rec| rec.queue.pop_front()),
                None => inner.root_queue.pop_front(),
            };
            let Some(id) = next else {
                if inner.stack.is_empty() && inner.root_queue.is_empty() {
                    drop(inner);
                    self.finish_root(RootOutcome::Success);
                }
                return;
            };
            inner.stack.push(id);
            id
        };
        self.run_step(step_id);
    }

    fn run_step(&self, id: StepId) {
        enum Body {
            Once(ExecHandler),
            Loop(LoopState),
        }

        let body = {
            let mut inner = self.inner.borrow_mut();
            let Some(rec) = inner.steps.get_mut(id) else {
                error!(step = ?id, "dispatched step record is missing");
                return;
            };
            match &mut rec.exec {
                ExecSlot::Once(slot) => match slot.take() {
                    Some(exec) => Body::Once(exec),
                    None => {
                        error!(step = ?id, "step executor already consumed");
                        return;
                    }
                },
                ExecSlot::Loop(_) => {
                    let ExecSlot::Loop(ls) =
                        std::mem::replace(&mut rec.exec, ExecSlot::Idle)
                    else {
                        unreachable!()
                    };
                    Body::Loop(ls)
                }
                ExecSlot::Idle => {
                    error!(step = ?id, "blank step record dispatched");
                    return;
                }
            }
        };

        match body {
            Body::Once(exec) => {
                trace!(root = ?self.root_id, step = ?id, "dispatch step");
                let outcome = self.invoke_exec(id, exec);
                self.after_body(id, outcome);
            }
            Body::Loop(mut ls) => {
                let proceed = match ls.cond.take() {
                    Some(mut cond) => {
                        let p = cond(&mut ls);
                        ls.cond = Some(cond);
                        p
                    }
                    None => true,
                };
                if !proceed {
                    let mut inner = self.inner.borrow_mut();
                    if let Some(rec) = inner.steps.get_mut(id) {
                        rec.loop_broken = true;
                        rec.exec = ExecSlot::Loop(ls);
                    }
                    drop(inner);
                    self.finish_current();
                    return;
                }
                trace!(root = ?self.root_id, step = ?id, i = ls.i, "dispatch loop iteration");
                let mut handler = ls.handler.take().expect("loop frame has a handler");
                let outcome = {
                    let mut asi = AsyncSteps::scoped(self.rc(), Scope::Step(id));
                    let result = catch_unwind(AssertUnwindSafe(|| handler(&mut asi, &mut ls)));
                    self.settle_call(result)
                };
                ls.handler = Some(handler);
                {
                    let mut inner = self.inner.borrow_mut();
                    if let Some(rec) = inner.steps.get_mut(id) {
                        rec.exec = ExecSlot::Loop(ls);
                    }
                }
                self.after_body(id, outcome);
            }
        }
    }

    fn invoke_exec(&self, id: StepId, exec: ExecHandler) -> CallOutcome {
        let mut asi = AsyncSteps::scoped(self.rc(), Scope::Step(id));
        let result = catch_unwind(AssertUnwindSafe(move || exec(&mut asi)));
        self.settle_call(result)
    }

    /// Converts a guarded callback result into a transition, recording the
    /// caught exception. Fatal argument mismatches are re-raised.
    fn settle_call(
        &self,
        result: Result<StepResult, Box<dyn std::any::Any + Send>>,
    ) -> CallOutcome {
        match result {
            Ok(Ok(())) => CallOutcome::Ok,
            Ok(Err(step_error)) => {
                let code = step_error.code().clone();
                self.state.borrow_mut().last_exception =
                    Some(CaughtException::Error(step_error));
                CallOutcome::Err(code)
            }
            Err(payload) => {
                if payload.is::<FatalMismatch>() {
                    resume_unwind(payload);
                }
                let panic = PanicPayload::from_panic(payload.as_ref());
                error!(root = ?self.root_id, panic = %panic, "callback panicked");
                self.state.borrow_mut().last_exception = Some(CaughtException::Panic(panic));
                CallOutcome::Err(codes::INTERNAL_ERROR)
            }
        }
    }

    fn after_body(&self, id: StepId, outcome: CallOutcome) {
        match outcome {
            CallOutcome::Err(code) => {
                self.handle_error(code);
                return;
            }
            CallOutcome::Ok => {}
        }

        let action = {
            let mut inner = self.inner.borrow_mut();
            if inner.status != RootStatus::Running || inner.stack.last() != Some(&id) {
                AfterBody::Stale
            } else {
                match inner.steps.get_mut(id) {
                    None => AfterBody::Stale,
                    Some(rec) if rec.completed => {
                        if !rec.queue.is_empty() {
                            error!(step = ?id, "children added after success() are discarded");
                            clear_queued_children(&mut inner, id);
                        }
                        AfterBody::Finish
                    }
                    Some(rec) if !rec.queue.is_empty() => AfterBody::Descend,
                    Some(rec) if !rec.is_plain() => AfterBody::Await,
                    Some(_) => AfterBody::Finish,
                }
            }
        };

        match action {
            AfterBody::Finish => self.finish_current(),
            AfterBody::Descend => self.schedule(),
            AfterBody::Await | AfterBody::Stale => {}
        }
    }

    /// Completes the current (stack-top) step and propagates success upward
    /// until a frame with more pending work is found.
    pub(crate) fn finish_current(&self) {
        loop {
            let mut inner = self.inner.borrow_mut();
            if inner.status != RootStatus::Running {
                return;
            }
            let Some(&id) = inner.stack.last() else {
                // Root-level continuation.
                if inner.root_queue.is_empty() {
                    drop(inner);
                    self.finish_root(RootOutcome::Success);
                } else {
                    drop(inner);
                    self.schedule();
                }
                return;
            };
            inner.stack.pop();

            let (parent, reinsert) = {
                let rec = inner.steps.get_mut(id).expect("finishing step record");
                if let Some(handle) = rec.limit_handle.take() {
                    handle.cancel();
                }
                rec.on_cancel = None;
                rec.wait_external = false;
                rec.completed = false;
                let reinsert = matches!(rec.exec, ExecSlot::Loop(_)) && !rec.loop_broken;
                (rec.parent, reinsert)
            };

            if reinsert {
                // The loop frame goes back to the head of its parent's queue
                // for the next iteration.
                match parent {
                    Some(p) => {
                        inner
                            .steps
                            .get_mut(p)
                            .expect("loop parent record")
                            .queue
                            .push_front(id);
                    }
                    None => inner.root_queue.push_front(id),
                }
                drop(inner);
                self.schedule();
                return;
            }

            if let Some(record) = inner.steps.remove(id) {
                let pool = inner.pool.clone();
                pool.release(record);
            }

            let more = match parent {
                Some(p) => !inner
                    .steps
                    .get(p)
                    .expect("parent record")
                    .queue
                    .is_empty(),
                None => !inner.root_queue.is_empty(),
            };
            if more {
                drop(inner);
                self.schedule();
                return;
            }
            // The parent has no more pending children: it completes too.
            drop(inner);
        }
    }

    /// Error unwind: walks the active path from the erroring step upward,
    /// running cancel hooks, stripping loop sentinels at matching frames,
    /// and trying on-error handlers until one recovers.
    pub(crate) fn handle_error(&self, mut code: ErrorCode) {
        #[derive(PartialEq)]
        enum LoopDecision {
            NotLoop,
            Recover,
            Discard,
        }

        {
            let mut inner = self.inner.borrow_mut();
            if inner.status != RootStatus::Running {
                return;
            }
            if let Some(handle) = inner.exec_handle.take() {
                handle.cancel();
            }
        }
        debug!(root = ?self.root_id, code = %code, "error unwind");

        loop {
            let top = {
                let inner = self.inner.borrow();
                inner.stack.last().copied()
            };
            let Some(id) = top else {
                self.finish_root(RootOutcome::Error(code));
                return;
            };

            let (on_cancel, loop_decision) = {
                let mut inner = self.inner.borrow_mut();
                clear_queued_children(&mut inner, id);
                let loop_label = self.state.borrow().error_loop_label;
                let rec = inner.steps.get_mut(id).expect("unwinding step record");
                if let Some(handle) = rec.limit_handle.take() {
                    handle.cancel();
                }
                rec.wait_external = false;
                rec.completed = false;
                let on_cancel = rec.on_cancel.take();

                let loop_decision = match &rec.exec {
                    ExecSlot::Loop(ls)
                        if code == codes::LOOP_BREAK || code == codes::LOOP_CONT =>
                    {
                        if loop_label.is_none() || loop_label == ls.label {
                            if code == codes::LOOP_BREAK {
                                rec.loop_broken = true;
                            }
                            LoopDecision::Recover
                        } else {
                            LoopDecision::Discard
                        }
                    }
                    _ => LoopDecision::NotLoop,
                };
                (on_cancel, loop_decision)
            };

            if let Some(hook) = on_cancel {
                self.run_cancel_hook(id, hook);
            }

            if loop_decision == LoopDecision::Recover {
                // Break completes the frame; Continue reinserts it for the
                // next iteration. Either way the sentinel stops here.
                self.finish_current();
                return;
            }

            // Loop sentinels never reach user on-error handlers; they are
            // only consumed by matching loop frames (or surface at the root).
            let is_sentinel = code == codes::LOOP_BREAK || code == codes::LOOP_CONT;
            let handler = if is_sentinel {
                None
            } else {
                let mut inner = self.inner.borrow_mut();
                inner.steps.get_mut(id).and_then(|rec| rec.on_error.take())
            };
            if let Some(handler) = handler {
                match self.invoke_on_error(id, handler, &code) {
                    CallOutcome::Ok => {
                        enum Recovery {
                            Finish,
                            Children,
                            No,
                        }
                        let recovery = {
                            let inner = self.inner.borrow();
                            match inner.steps.get(id) {
                                Some(rec) if rec.completed => Recovery::Finish,
                                Some(rec) if !rec.queue.is_empty() => Recovery::Children,
                                _ => Recovery::No,
                            }
                        };
                        match recovery {
                            Recovery::Finish => {
                                self.finish_current();
                                return;
                            }
                            Recovery::Children => {
                                self.schedule();
                                return;
                            }
                            Recovery::No => {}
                        }
                    }
                    CallOutcome::Err(new_code) => {
                        code = new_code;
                    }
                }
            }

            // Not recovered here: discard the frame and try the parent.
            let mut inner = self.inner.borrow_mut();
            if inner.stack.last() == Some(&id) {
                inner.stack.pop();
            }
            if let Some(record) = inner.steps.remove(id) {
                let pool = inner.pool.clone();
                pool.release(record);
            }
        }
    }

    fn invoke_on_error(&self, id: StepId, handler: ErrorHandler, code: &ErrorCode) -> CallOutcome {
        let mut asi = AsyncSteps::scoped(self.rc(), Scope::Step(id));
        let code = code.clone();
        let result = catch_unwind(AssertUnwindSafe(move || handler(&mut asi, &code)));
        self.settle_call(result)
    }

    fn run_cancel_hook(&self, id: StepId, hook: CancelHandler) {
        let mut asi = AsyncSteps::scoped(self.rc(), Scope::Step(id));
        if let Err(payload) = catch_unwind(AssertUnwindSafe(move || hook(&mut asi))) {
            if payload.is::<FatalMismatch>() {
                resume_unwind(payload);
            }
            let panic = PanicPayload::from_panic(payload.as_ref());
            error!(root = ?self.root_id, panic = %panic, "cancel hook panicked");
        }
    }

    /// Cancels the root: no further step bodies run; every armed cancel hook
    /// along the active path fires exactly once, leaf to root.
    pub(crate) fn cancel_root(&self) {
        let hooks = {
            let mut inner = self.inner.borrow_mut();
            match inner.status {
                RootStatus::Idle | RootStatus::Running => {}
                _ => return,
            }
            inner.status = RootStatus::Cancelled;
            if let Some(handle) = inner.exec_handle.take() {
                handle.cancel();
            }
            let path: Vec<StepId> = inner.stack.iter().rev().copied().collect();
            let mut hooks = Vec::new();
            for id in path {
                if let Some(rec) = inner.steps.get_mut(id) {
                    if let Some(handle) = rec.limit_handle.take() {
                        handle.cancel();
                    }
                    if let Some(hook) = rec.on_cancel.take() {
                        hooks.push((id, hook));
                    }
                }
            }
            hooks
        };
        debug!(root = ?self.root_id, hooks = hooks.len(), "root cancelled");
        for (id, hook) in hooks {
            self.run_cancel_hook(id, hook);
        }
        self.finish_root(RootOutcome::Cancelled);
    }

    /// Final transition: tears the tree down and reports the outcome once.
    pub(crate) fn finish_root(&self, outcome: RootOutcome) {
        let (sink, records, pool) = {
            let mut inner = self.inner.borrow_mut();
            if inner.torn_down {
                return;
            }
            inner.torn_down = true;
            inner.status = match outcome {
                RootOutcome::Cancelled => RootStatus::Cancelled,
                _ => RootStatus::Finished,
            };
            if let Some(handle) = inner.exec_handle.take() {
                handle.cancel();
            }
            inner.root_queue.clear();
            inner.stack.clear();
            let records = inner.steps.drain();
            (inner.finish_sink.take(), records, inner.pool.clone())
        };
        for mut record in records {
            if let Some(handle) = record.limit_handle.take() {
                handle.cancel();
            }
            pool.release(record);
        }

        match outcome {
            RootOutcome::Success => {
                trace!(root = ?self.root_id, "root finished");
                if let Some(sink) = sink {
                    sink(RootOutcome::Success);
                }
            }
            RootOutcome::Cancelled => {
                if let Some(sink) = sink {
                    sink(RootOutcome::Cancelled);
                }
            }
            RootOutcome::Error(code) => {
                debug!(root = ?self.root_id, code = %code, "root errored");
                if let Some(sink) = sink {
                    sink(RootOutcome::Error(code));
                    return;
                }
                let hook = self.state.borrow_mut().unhandled_error.take();
                match hook {
                    Some(mut hook) => {
                        hook(&code);
                        self.state.borrow_mut().unhandled_error = Some(hook);
                    }
                    None => {
                        let info = self.state.borrow().error_info.clone();
                        panic!("unhandled step error: {code} ({info})");
                    }
                }
            }
        }
    }

}

/// Discards queued (never-run) children of `id`, releasing their records.
fn clear_queued_children(inner: &mut RootInner, id: StepId) {
    let queued: Vec<StepId> = match inner.steps.get_mut(id) {
        Some(rec) => rec.queue.drain(..).collect(),
        None => return,
    };
    let pool = inner.pool.clone();
    for child in queued {
        if let Some(mut record) = inner.steps.remove(child) {
            if let Some(handle) = record.limit_handle.take() {
                handle.cancel();
            }
            pool.release(record);
        }
    }
}
