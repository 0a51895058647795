//! The step execution engine.
//!
//! [`AsyncSteps`] composes sequential, nested, parallel, and loop-structured
//! asynchronous procedures as a tree of steps. Each step is a user callback
//! that either completes synchronously, signals an error, defers completion
//! to an external event, or schedules child steps. The engine drives the
//! tree on a single cooperative [`Reactor`], with structured error
//! unwinding, timeouts, cancellation, loop control, parallel sub-flows, and
//! cooperative synchronization.
//!
//! # Execution model
//!
//! Step bodies run in program order determined by tree traversal: a parent
//! body runs, then its children in add order, then the parent's
//! continuation. Children added during a body run after the body returns
//! and before the parent's success propagates. A body that returns `Ok(())`
//! without completing, adding children, arming a timeout, or calling
//! [`AsyncSteps::wait_external`] completes implicitly.
//!
//! # Example
//!
//! ```
//! use stepflow::{AsyncSteps, Reactor};
//!
//! let reactor = Reactor::new();
//! let mut root = AsyncSteps::new(&reactor);
//!
//! root.add(|asi| {
//!     asi.success_with((123_i64, true));
//!     Ok(())
//! });
//! root.add_with_args(|asi: &mut AsyncSteps, (a, b): (i64, bool)| {
//!     assert_eq!(a, 123);
//!     assert!(b);
//!     asi.state_mut().set("seen", true);
//!     Ok(())
//! });
//!
//! root.execute();
//! reactor.run();
//! assert_eq!(root.state().get::<bool>("seen"), Some(true));
//! ```

mod bridge;
mod handle;
mod parallel;
mod root;

pub use bridge::StepPromise;
pub use handle::CompletionHandle;
pub use parallel::Parallel;
pub use root::{RootId, RootStatus};

pub(crate) use root::{RootCore, RootOutcome, StepId};

use std::cell::{Ref, RefCell, RefMut};
use std::iter::Peekable;
use std::rc::Rc;
use std::time::Duration;

use crate::args::{ArgTuple, FatalMismatch, IntoArgs};
use crate::errors::{codes, Error, ErrorCode, StepResult};
use crate::pool::{PassthroughPool, StepPool};
use crate::reactor::Reactor;
use crate::state::State;
use crate::step::{ErrorHandler, ExecHandler, ExecSlot, LoopLabel, LoopState};
use crate::sync::Gate;
use crate::tracing_compat::error;

/// What a handle refers to: the root composition surface or one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    Root,
    Step(StepId),
}

/// A root of step execution and the in-step context handle.
///
/// The same type serves both roles: user code builds the tree on a root
/// instance, and every callback receives an `&mut AsyncSteps` scoped to the
/// step being executed, on which `add` creates child steps.
pub struct AsyncSteps {
    core: Rc<RootCore>,
    scope: Scope,
}

impl AsyncSteps {
    /// Creates a new root on `reactor` with fresh state.
    #[must_use]
    pub fn new(reactor: &Reactor) -> Self {
        Self::with_pool(reactor, Rc::new(PassthroughPool))
    }

    /// Creates a new root using `pool` for step-record allocation.
    #[must_use]
    pub fn with_pool(reactor: &Reactor, pool: Rc<dyn StepPool>) -> Self {
        Self::assemble(reactor, Rc::new(RefCell::new(State::new())), pool)
    }

    /// Creates a sub-flow root sharing `state` (parallel driver).
    pub(crate) fn sub_flow(reactor: &Reactor, state: Rc<RefCell<State>>) -> Self {
        Self::assemble(reactor, state, Rc::new(PassthroughPool))
    }

    fn assemble(reactor: &Reactor, state: Rc<RefCell<State>>, pool: Rc<dyn StepPool>) -> Self {
        Self {
            core: RootCore::create(reactor.clone(), state, pool),
            scope: Scope::Root,
        }
    }

    pub(crate) fn scoped(core: Rc<RootCore>, scope: Scope) -> Self {
        Self { core, scope }
    }

    pub(crate) fn core(&self) -> &Rc<RootCore> {
        &self.core
    }

    // === Composition API ===

    /// Adds a step.
    pub fn add<F>(&mut self, func: F) -> &mut Self
    where
        F: FnOnce(&mut AsyncSteps) -> StepResult + 'static,
    {
        self.push_step(ExecSlot::Once(Some(Box::new(func))), None);
        self
    }

    /// Adds a step with an on-error handler.
    ///
    /// The handler is tried once if the step (or an unrecovered descendant)
    /// errors. Calling `success*` inside the handler converts the error into
    /// ordinary success; adding child steps retries with those children;
    /// returning an `Err` re-raises; returning `Ok(())` without either
    /// propagates the original error to the parent.
    pub fn add_catch<F, H>(&mut self, func: F, on_error: H) -> &mut Self
    where
        F: FnOnce(&mut AsyncSteps) -> StepResult + 'static,
        H: FnOnce(&mut AsyncSteps, &ErrorCode) -> StepResult + 'static,
    {
        self.push_step(
            ExecSlot::Once(Some(Box::new(func))),
            Some(Box::new(on_error)),
        );
        self
    }

    /// Adds a step whose body receives the previous step's results, typed.
    ///
    /// The tuple (arity 1–4) is moved out of the argument channel. A type
    /// mismatch is a fatal programming error: the engine fails fast with a
    /// diagnostic naming the expected and actual types.
    pub fn add_with_args<T, F>(&mut self, func: F) -> &mut Self
    where
        T: ArgTuple + 'static,
        F: FnOnce(&mut AsyncSteps, T) -> StepResult + 'static,
    {
        self.add(Self::args_adapter(func))
    }

    /// [`AsyncSteps::add_with_args`] with an on-error handler.
    pub fn add_with_args_catch<T, F, H>(&mut self, func: F, on_error: H) -> &mut Self
    where
        T: ArgTuple + 'static,
        F: FnOnce(&mut AsyncSteps, T) -> StepResult + 'static,
        H: FnOnce(&mut AsyncSteps, &ErrorCode) -> StepResult + 'static,
    {
        self.add_catch(Self::args_adapter(func), on_error)
    }

    fn args_adapter<T, F>(func: F) -> impl FnOnce(&mut AsyncSteps) -> StepResult + 'static
    where
        T: ArgTuple + 'static,
        F: FnOnce(&mut AsyncSteps, T) -> StepResult + 'static,
    {
        move |asi: &mut AsyncSteps| {
            let taken = {
                let mut inner = asi.core.inner.borrow_mut();
                T::take_from(&mut inner.args)
            };
            match taken {
                Ok(tuple) => func(asi, tuple),
                Err(mismatch) => {
                    error!(%mismatch, "argument channel type mismatch");
                    std::panic::panic_any(FatalMismatch(mismatch));
                }
            }
        }
    }

    /// Adds a step synchronized on `gate`: the gate is locked before `body`
    /// and released after it, including on error and cancellation.
    pub fn sync<F>(&mut self, gate: Rc<dyn Gate>, body: F) -> &mut Self
    where
        F: FnOnce(&mut AsyncSteps) -> StepResult + 'static,
    {
        self.sync_impl(gate, Box::new(body), None)
    }

    /// [`AsyncSteps::sync`] with an on-error handler.
    pub fn sync_catch<F, H>(&mut self, gate: Rc<dyn Gate>, body: F, on_error: H) -> &mut Self
    where
        F: FnOnce(&mut AsyncSteps) -> StepResult + 'static,
        H: FnOnce(&mut AsyncSteps, &ErrorCode) -> StepResult + 'static,
    {
        self.sync_impl(gate, Box::new(body), Some(Box::new(on_error)))
    }

    fn sync_impl(
        &mut self,
        gate: Rc<dyn Gate>,
        body: ExecHandler,
        on_error: Option<ErrorHandler>,
    ) -> &mut Self {
        let outer = move |asi: &mut AsyncSteps| -> StepResult {
            // On cancellation or unwinding the regular unlock step below
            // never runs; the gate releases whatever this root holds or
            // awaits. The hook fires for error unwinds too, before the
            // region's on-error handler.
            let hook_gate = gate.clone();
            asi.set_cancel(move |asi| hook_gate.release_on_cancel(asi));

            let lock_gate = gate.clone();
            asi.add(move |asi| lock_gate.lock(asi));
            asi.add(move |asi| body(asi));
            let unlock_gate = gate;
            asi.add(move |asi| {
                unlock_gate.unlock(asi);
                Ok(())
            });
            Ok(())
        };

        self.push_step(ExecSlot::Once(Some(Box::new(outer))), on_error);
        self
    }

    /// Adds an infinite loop step running `body` each iteration.
    ///
    /// Terminated from inside with [`AsyncSteps::break_loop`]; an optional
    /// `label` makes the frame addressable from nested loops.
    pub fn loop_<F>(&mut self, mut body: F, label: Option<LoopLabel>) -> &mut Self
    where
        F: FnMut(&mut AsyncSteps) -> StepResult + 'static,
    {
        let mut ls = LoopState::new(label);
        ls.handler = Some(Box::new(move |asi, _ls| body(asi)));
        self.push_step(ExecSlot::Loop(ls), None);
        self
    }

    /// Adds a loop running `body(i)` for `i` in `0..count`.
    pub fn repeat<F>(&mut self, count: usize, mut body: F, label: Option<LoopLabel>) -> &mut Self
    where
        F: FnMut(&mut AsyncSteps, usize) -> StepResult + 'static,
    {
        let mut ls = LoopState::new(label);
        ls.cond = Some(Box::new(move |ls| ls.i < count));
        ls.handler = Some(Box::new(move |asi, ls| {
            let i = ls.i;
            ls.i += 1;
            body(asi, i)
        }));
        self.push_step(ExecSlot::Loop(ls), None);
        self
    }

    /// Adds a loop over a sequence, running `body(i, item)` per element.
    ///
    /// The collection is moved into the loop frame and owned for the loop's
    /// lifetime.
    pub fn for_each<C, F>(&mut self, collection: C, mut body: F, label: Option<LoopLabel>) -> &mut Self
    where
        C: IntoIterator + 'static,
        C::IntoIter: 'static,
        C::Item: 'static,
        F: FnMut(&mut AsyncSteps, usize, C::Item) -> StepResult + 'static,
    {
        let mut ls = LoopState::new(label);
        ls.data = Some(Box::new(collection.into_iter().peekable()));
        ls.cond = Some(Box::new(|ls| {
            ls.data
                .as_mut()
                .and_then(|data| data.downcast_mut::<Peekable<C::IntoIter>>())
                .is_some_and(|iter| iter.peek().is_some())
        }));
        ls.handler = Some(Box::new(move |asi, ls| {
            let item = ls
                .data
                .as_mut()
                .and_then(|data| data.downcast_mut::<Peekable<C::IntoIter>>())
                .and_then(Iterator::next);
            match item {
                Some(item) => {
                    let i = ls.i;
                    ls.i += 1;
                    body(asi, i, item)
                }
                None => Ok(()),
            }
        }));
        self.push_step(ExecSlot::Loop(ls), None);
        self
    }

    /// Adds a loop over a map-like sequence of pairs, running
    /// `body(key, value)` per entry.
    pub fn for_each_kv<C, K, V, F>(
        &mut self,
        collection: C,
        mut body: F,
        label: Option<LoopLabel>,
    ) -> &mut Self
    where
        C: IntoIterator<Item = (K, V)> + 'static,
        C::IntoIter: 'static,
        K: 'static,
        V: 'static,
        F: FnMut(&mut AsyncSteps, K, V) -> StepResult + 'static,
    {
        self.for_each(collection, move |asi, _i, (key, value)| {
            body(asi, key, value)
        }, label)
    }

    /// Adds a parallel block; sub-flows are registered on the returned
    /// handle and share this root's state.
    pub fn parallel(&mut self) -> Parallel {
        parallel::make(self, None)
    }

    /// [`AsyncSteps::parallel`] with an on-error handler, invoked when the
    /// first sub-flow errors (after the remaining sub-flows are cancelled).
    pub fn parallel_catch<H>(&mut self, on_error: H) -> Parallel
    where
        H: FnOnce(&mut AsyncSteps, &ErrorCode) -> StepResult + 'static,
    {
        parallel::make(self, Some(Box::new(on_error)))
    }

    // === Execution API (inside a step body) ===

    /// Completes the current step successfully, leaving the argument
    /// channel untouched.
    pub fn success(&mut self) {
        let Scope::Step(id) = self.scope else {
            error!("success() outside a step body is ignored");
            return;
        };
        let mut inner = self.core.inner.borrow_mut();
        if inner.status != RootStatus::Running {
            return;
        }
        let Some(rec) = inner.steps.get_mut(id) else {
            error!("success() on a finished step is ignored");
            return;
        };
        if rec.completed {
            error!("second completion of a step is ignored");
            return;
        }
        rec.completed = true;
    }

    /// Completes the current step, storing 1–4 values for the next step.
    pub fn success_with<A: IntoArgs>(&mut self, args: A) {
        {
            let mut inner = self.core.inner.borrow_mut();
            let slots = args.into_slots();
            inner.args.assign(slots);
        }
        self.success();
    }

    /// Raises an error with the given code, clearing `error_info`.
    ///
    /// Returns the `Err` to propagate from the step body:
    /// `return asi.error("MyError");`
    pub fn error(&mut self, code: impl Into<ErrorCode>) -> StepResult {
        self.core.state.borrow_mut().error_info.clear();
        Err(Error::new(code.into()))
    }

    /// Raises an error carrying a human-readable detail in `error_info`.
    pub fn error_with(&mut self, code: impl Into<ErrorCode>, info: impl Into<String>) -> StepResult {
        self.core.state.borrow_mut().error_info = info.into();
        Err(Error::new(code.into()))
    }

    /// Breaks out of the nearest enclosing loop (or the loop labelled
    /// `label`). Propagates as a `LoopBreak` error when no frame matches.
    pub fn break_loop(&mut self, label: Option<LoopLabel>) -> StepResult {
        self.core.state.borrow_mut().error_loop_label = label;
        Err(Error::new(codes::LOOP_BREAK))
    }

    /// Restarts the nearest enclosing loop (or the loop labelled `label`)
    /// from its next iteration.
    pub fn continue_loop(&mut self, label: Option<LoopLabel>) -> StepResult {
        self.core.state.borrow_mut().error_loop_label = label;
        Err(Error::new(codes::LOOP_CONT))
    }

    /// Arms a timeout: unless the step completes within `timeout`, a
    /// `Timeout` error is raised through the normal unwind. Completion
    /// cancels the timer.
    pub fn set_timeout(&mut self, timeout: Duration) {
        let Scope::Step(id) = self.scope else {
            error!("set_timeout() outside a step body is ignored");
            return;
        };
        let core = self.core.clone();
        let handle = self.core.reactor.deferred(timeout, move || {
            let live = {
                let inner = core.inner.borrow();
                inner.status == RootStatus::Running && inner.steps.contains(id)
            };
            if live {
                core.state.borrow_mut().last_exception = Some(
                    crate::errors::CaughtException::Error(Error::new(codes::TIMEOUT)),
                );
                core.handle_error(codes::TIMEOUT);
            }
        });
        let mut inner = self.core.inner.borrow_mut();
        match inner.steps.get_mut(id) {
            Some(rec) => {
                if let Some(old) = rec.limit_handle.take() {
                    old.cancel();
                }
                rec.limit_handle = Some(handle);
            }
            None => handle.cancel(),
        }
    }

    /// Arms a cancel hook for this step, run at most once if the step is
    /// cancelled or unwound while waiting.
    ///
    /// A cancel hook on its own does not defer completion: a body that only
    /// arms a hook and returns still completes implicitly. Combine with
    /// [`AsyncSteps::wait_external`] to wait for an external event.
    pub fn set_cancel<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut AsyncSteps) + 'static,
    {
        let Scope::Step(id) = self.scope else {
            error!("set_cancel() outside a step body is ignored");
            return;
        };
        let mut inner = self.core.inner.borrow_mut();
        if let Some(rec) = inner.steps.get_mut(id) {
            rec.on_cancel = Some(Box::new(hook));
        }
    }

    /// Suppresses implicit success: the step stays pending until an external
    /// callback completes it through a [`CompletionHandle`].
    pub fn wait_external(&mut self) {
        let Scope::Step(id) = self.scope else {
            error!("wait_external() outside a step body is ignored");
            return;
        };
        let mut inner = self.core.inner.borrow_mut();
        if let Some(rec) = inner.steps.get_mut(id) {
            rec.wait_external = true;
        }
    }

    /// Returns a handle external code can use to complete the current step.
    ///
    /// Late completions after cancellation or unwinding are detected and
    /// ignored.
    #[must_use]
    pub fn completion_handle(&self) -> CompletionHandle {
        match self.scope {
            Scope::Step(id) => CompletionHandle::new(Rc::downgrade(&self.core), id),
            Scope::Root => {
                error!("completion_handle() outside a step body returns a dead handle");
                CompletionHandle::dead()
            }
        }
    }

    /// True when this handle still refers to a live step of a running root.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let inner = self.core.inner.borrow();
        match self.scope {
            Scope::Step(id) => {
                inner.status == RootStatus::Running && inner.steps.contains(id)
            }
            Scope::Root => matches!(inner.status, RootStatus::Idle | RootStatus::Running),
        }
    }

    // === State access ===

    /// Borrows the shared state.
    #[must_use]
    pub fn state(&self) -> Ref<'_, State> {
        self.core.state.borrow()
    }

    /// Mutably borrows the shared state.
    #[must_use]
    pub fn state_mut(&self) -> RefMut<'_, State> {
        self.core.state.borrow_mut()
    }

    /// Typed read of a state variable.
    #[must_use]
    pub fn state_get<T: crate::value::FromValue>(&self, key: &str) -> Option<T> {
        self.core.state.borrow().get(key)
    }

    /// Stores a state variable.
    pub fn state_set(&mut self, key: impl Into<String>, value: impl crate::value::IntoValue) {
        self.core.state.borrow_mut().set(key, value);
    }

    /// Typed read of a state variable, inserting `default` when vacant.
    pub fn state_default<T>(&mut self, key: &str, default: T) -> T
    where
        T: crate::value::FromValue + crate::value::IntoValue + Clone,
    {
        self.core.state.borrow_mut().get_or_default(key, default)
    }

    // === Root control ===

    /// Hands the tree to the reactor for execution.
    pub fn execute(&mut self) {
        if self.scope != Scope::Root {
            error!("execute() inside a step body is ignored");
            return;
        }
        self.core.execute_root();
    }

    /// Cancels execution: no further step bodies run; armed cancel hooks
    /// fire exactly once, leaf to root.
    pub fn cancel(&mut self) {
        self.core.cancel_root();
    }

    /// Current execution status of the root.
    #[must_use]
    pub fn status(&self) -> RootStatus {
        self.core.inner.borrow().status
    }

    /// Identifier of this root, used by sync primitives to detect reentry.
    #[must_use]
    pub fn root_id(&self) -> RootId {
        self.core.root_id
    }

    /// The reactor driving this root.
    #[must_use]
    pub fn reactor(&self) -> &Reactor {
        &self.core.reactor
    }

    /// Creates a fresh standalone root on the same reactor.
    #[must_use]
    pub fn new_instance(&self) -> AsyncSteps {
        AsyncSteps::new(&self.core.reactor)
    }

    /// Appends a terminal step resolving the returned future with no value,
    /// installs an unhandled-error hook delivering failures, and executes.
    pub fn promise(&mut self) -> StepPromise<()> {
        bridge::promise_unit(self)
    }

    /// Appends a terminal step resolving the returned future from the
    /// argument channel, installs an unhandled-error hook delivering
    /// failures, and executes.
    pub fn promise_value<T: crate::value::FromValue + 'static>(&mut self) -> StepPromise<T> {
        bridge::promise_value(self)
    }

    /// Adds a step that waits for `future`, polling it cooperatively on the
    /// reactor, and completes with no value.
    pub fn await_future<F>(&mut self, future: F) -> &mut Self
    where
        F: std::future::Future<Output = ()> + 'static,
    {
        bridge::await_unit(self, future);
        self
    }

    /// Adds a step that waits for `future` and passes its output into the
    /// argument channel.
    pub fn await_future_value<F>(&mut self, future: F) -> &mut Self
    where
        F: std::future::Future + 'static,
        F::Output: crate::value::IntoValue + 'static,
    {
        bridge::await_value(self, future);
        self
    }

    // === Internal ===

    pub(crate) fn push_step(
        &mut self,
        exec: ExecSlot,
        on_error: Option<ErrorHandler>,
    ) -> Option<StepId> {
        let mut inner = self.core.inner.borrow_mut();
        match self.scope {
            Scope::Root => {
                if inner.status != RootStatus::Idle {
                    error!("add() on an executing root is ignored");
                    return None;
                }
            }
            Scope::Step(pid) => {
                if inner.status != RootStatus::Running || !inner.steps.contains(pid) {
                    error!("add() on a finished step is ignored");
                    return None;
                }
            }
        }

        let mut rec = inner.pool.acquire();
        rec.parent = match self.scope {
            Scope::Step(id) => Some(id),
            Scope::Root => None,
        };
        rec.exec = exec;
        rec.on_error = on_error;
        let id = inner.steps.insert(rec);
        match self.scope {
            Scope::Step(pid) => {
                inner
                    .steps
                    .get_mut(pid)
                    .expect("scope record checked above")
                    .queue
                    .push_back(id);
            }
            Scope::Root => inner.root_queue.push_back(id),
        }
        Some(id)
    }
}

impl core::fmt::Debug for AsyncSteps {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AsyncSteps")
            .field("root", &self.core.root_id)
            .field("scope", &self.scope)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_after_execute_is_ignored() {
        let reactor = Reactor::new();
        let mut root = AsyncSteps::new(&reactor);
        root.add(|_asi| Ok(()));
        root.execute();
        root.add(|_asi| panic!("must not run"));
        reactor.run();
        assert_eq!(root.status(), RootStatus::Finished);
    }

    #[test]
    fn execute_without_steps_is_ignored() {
        let reactor = Reactor::new();
        let mut root = AsyncSteps::new(&reactor);
        root.execute();
        assert_eq!(root.status(), RootStatus::Idle);
    }

    #[test]
    fn execute_twice_is_ignored() {
        let reactor = Reactor::new();
        let mut root = AsyncSteps::new(&reactor);
        root.add(|_asi| Ok(()));
        root.execute();
        root.execute();
        reactor.run();
        assert_eq!(root.status(), RootStatus::Finished);
    }

    #[test]
    fn root_ids_are_unique() {
        let reactor = Reactor::new();
        let a = AsyncSteps::new(&reactor);
        let b = AsyncSteps::new(&reactor);
        assert_ne!(a.root_id(), b.root_id());
    }

    #[test]
    fn state_helpers_round_trip() {
        let reactor = Reactor::new();
        let mut root = AsyncSteps::new(&reactor);
        root.state_set("k", 5_i64);
        assert_eq!(root.state_get::<i64>("k"), Some(5));
        assert_eq!(root.state_default("fresh", 7_i64), 7);
        assert_eq!(root.state_get::<i64>("fresh"), Some(7));
    }
}
