//! Bridge between step execution and `std::future`.
//!
//! [`StepPromise`] resolves when a terminal engine step runs (or when an
//! unrecovered error reaches the root). `await_*` steps poll an arbitrary
//! future cooperatively: a first poll as an immediate, then short deferred
//! ticks until the future is ready, completing the step with its output.
//! Polling keeps the wait on the reactor thread, the way external events
//! integrate with the engine in general.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake, Waker};
use std::time::Duration;

use crate::errors::Error;
use crate::reactor::Reactor;
use crate::tracing_compat::trace;
use crate::value::{FromValue, IntoValue};

use super::{AsyncSteps, CompletionHandle};

/// Interval between cooperative polls of an awaited future.
const AWAIT_POLL_TICK: Duration = Duration::from_millis(1);

struct PromiseSlot<T> {
    result: Option<Result<T, Error>>,
    waker: Option<Waker>,
}

/// Future resolved by a root's terminal step.
///
/// Single-threaded, like the root that resolves it: poll it from the same
/// thread, after (or while) driving the reactor.
pub struct StepPromise<T> {
    slot: Rc<RefCell<PromiseSlot<T>>>,
}

impl<T> StepPromise<T> {
    fn new() -> Self {
        Self {
            slot: Rc::new(RefCell::new(PromiseSlot {
                result: None,
                waker: None,
            })),
        }
    }

    /// True once the promise has resolved (either way).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.slot.borrow().result.is_some()
    }

    /// Takes the resolved result without polling, if available.
    pub fn try_take(&self) -> Option<Result<T, Error>> {
        self.slot.borrow_mut().result.take()
    }
}

impl<T> Future for StepPromise<T> {
    type Output = Result<T, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();
        match slot.result.take() {
            Some(result) => Poll::Ready(result),
            None => {
                slot.waker = Some(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

impl<T> core::fmt::Debug for StepPromise<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StepPromise")
            .field("ready", &self.is_ready())
            .finish()
    }
}

fn resolve<T>(slot: &Rc<RefCell<PromiseSlot<T>>>, result: Result<T, Error>) {
    let waker = {
        let mut slot = slot.borrow_mut();
        if slot.result.is_some() {
            return;
        }
        slot.result = Some(result);
        slot.waker.take()
    };
    if let Some(waker) = waker {
        waker.wake();
    }
}

fn install_error_hook<T: 'static>(asi: &mut AsyncSteps, slot: &Rc<RefCell<PromiseSlot<T>>>) {
    let err_slot = slot.clone();
    asi.state_mut().unhandled_error = Some(Box::new(move |code| {
        resolve(&err_slot, Err(Error::new(code.clone())));
    }));
}

pub(super) fn promise_unit(asi: &mut AsyncSteps) -> StepPromise<()> {
    let promise = StepPromise::new();
    install_error_hook(asi, &promise.slot);

    let ok_slot = promise.slot.clone();
    asi.add(move |_asi| {
        resolve(&ok_slot, Ok(()));
        Ok(())
    });
    asi.execute();
    promise
}

pub(super) fn promise_value<T: FromValue + 'static>(asi: &mut AsyncSteps) -> StepPromise<T> {
    let promise = StepPromise::new();
    install_error_hook(asi, &promise.slot);

    let ok_slot = promise.slot.clone();
    asi.add_with_args(move |_asi: &mut AsyncSteps, (value,): (T,)| {
        resolve(&ok_slot, Ok(value));
        Ok(())
    });
    asi.execute();
    promise
}

struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
}

fn noop_waker() -> Waker {
    Waker::from(Arc::new(NoopWake))
}

/// Polls `future` once; when pending, re-schedules itself on a short
/// deferred tick. The chain stops silently once the step's handle goes
/// stale (cancellation, timeout, unwinding).
fn poll_once<F, C>(reactor: Reactor, handle: CompletionHandle, mut future: Pin<Box<F>>, complete: C)
where
    F: Future + 'static,
    C: FnOnce(F::Output, &CompletionHandle) + 'static,
{
    if !handle.is_valid() {
        trace!("awaited future dropped after step went stale");
        return;
    }
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    match future.as_mut().poll(&mut cx) {
        Poll::Ready(output) => complete(output, &handle),
        Poll::Pending => {
            let next_reactor = reactor.clone();
            reactor.deferred(AWAIT_POLL_TICK, move || {
                poll_once(next_reactor, handle, future, complete);
            });
        }
    }
}

fn await_step<F, C>(asi: &mut AsyncSteps, future: F, complete: C)
where
    F: Future + 'static,
    C: FnOnce(F::Output, &CompletionHandle) + 'static,
{
    asi.add(move |asi| {
        asi.wait_external();
        let handle = asi.completion_handle();
        let reactor = asi.reactor().clone();
        let inner_reactor = reactor.clone();
        reactor.immediate(move || {
            poll_once(inner_reactor, handle, Box::pin(future), complete);
        });
        Ok(())
    });
}

pub(super) fn await_unit<F>(asi: &mut AsyncSteps, future: F)
where
    F: Future<Output = ()> + 'static,
{
    await_step(asi, future, |(), handle| {
        handle.success();
    });
}

pub(super) fn await_value<F>(asi: &mut AsyncSteps, future: F)
where
    F: Future + 'static,
    F::Output: IntoValue + 'static,
{
    await_step(asi, future, |output, handle| {
        handle.success_with((output,));
    });
}
