//! Cooperative mutex.
//!
//! Exclusive entry into a step region, reentrant per root: the root holding
//! the mutex may enter nested synchronized regions without deadlocking,
//! tracked with a recursion depth. Waiting roots are queued FIFO and handed
//! the mutex in arrival order.
//!
//! # Fairness
//!
//! Release always transfers to the longest-waiting live root. Waiters whose
//! step was cancelled while queued leave a stale completion handle behind
//! and are skipped on handoff (the cancel hook also deregisters them
//! eagerly).

use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Mutex as StdMutex;

use crate::engine::{AsyncSteps, CompletionHandle, RootId};
use crate::errors::StepResult;
use crate::tracing_compat::trace;

use super::Gate;

#[derive(Debug)]
struct Waiter {
    root: RootId,
    resume: CompletionHandle,
}

#[derive(Debug)]
struct MutexInner {
    owner: Option<RootId>,
    depth: usize,
    waiters: VecDeque<Waiter>,
}

/// Reentrant cooperative mutex with FIFO waiters.
#[derive(Debug)]
pub struct Mutex {
    state: StdMutex<MutexInner>,
}

impl Mutex {
    /// Creates an unlocked mutex.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(MutexInner {
                owner: None,
                depth: 0,
                waiters: VecDeque::new(),
            }),
        }
    }

    /// Returns true while some root holds the mutex.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state
            .lock()
            .expect("mutex state lock poisoned")
            .owner
            .is_some()
    }

    /// Number of roots queued for the mutex.
    #[must_use]
    pub fn waiters(&self) -> usize {
        self.state
            .lock()
            .expect("mutex state lock poisoned")
            .waiters
            .len()
    }

    /// Drops one level of ownership; on full release hands the mutex to
    /// the longest-waiting live root.
    fn release_level(state: &mut MutexInner) -> Option<CompletionHandle> {
        state.depth -= 1;
        if state.depth > 0 {
            return None;
        }
        state.owner = None;
        loop {
            match state.waiters.pop_front() {
                Some(waiter) if waiter.resume.is_valid() => {
                    state.owner = Some(waiter.root);
                    state.depth = 1;
                    break Some(waiter.resume);
                }
                // Cancelled while queued; its handle went stale.
                Some(_) => {}
                None => break None,
            }
        }
    }

    fn dequeue(&self, root: RootId) {
        let mut state = self.state.lock().expect("mutex state lock poisoned");
        if let Some(pos) = state.waiters.iter().position(|w| w.root == root) {
            state.waiters.remove(pos);
            trace!(?root, "mutex waiter deregistered");
        }
    }
}

impl Default for Mutex {
    fn default() -> Self {
        Self::new()
    }
}

impl Gate for Mutex {
    fn lock(self: Rc<Self>, asi: &mut AsyncSteps) -> StepResult {
        let root = asi.root_id();
        let mut state = self.state.lock().expect("mutex state lock poisoned");
        match state.owner {
            None => {
                state.owner = Some(root);
                state.depth = 1;
                drop(state);
                trace!(?root, "mutex acquired");
                asi.success();
            }
            Some(owner) if owner == root => {
                state.depth += 1;
                drop(state);
                trace!(?root, "mutex reentered");
                asi.success();
            }
            Some(_) => {
                state.waiters.push_back(Waiter {
                    root,
                    resume: asi.completion_handle(),
                });
                drop(state);
                trace!(?root, "mutex contended; queued");
                asi.wait_external();
                let gate = self.clone();
                asi.set_cancel(move |asi| gate.dequeue(asi.root_id()));
            }
        }
        Ok(())
    }

    fn unlock(self: Rc<Self>, asi: &mut AsyncSteps) {
        let root = asi.root_id();
        let next = {
            let mut state = self.state.lock().expect("mutex state lock poisoned");
            assert_eq!(
                state.owner,
                Some(root),
                "mutex unlock by a root that does not hold it"
            );
            Self::release_level(&mut state)
        };
        if let Some(resume) = next {
            trace!("mutex handed to next waiter");
            resume.success();
        }
    }

    fn release_on_cancel(self: Rc<Self>, asi: &mut AsyncSteps) {
        let root = asi.root_id();
        let next = {
            let mut state = self.state.lock().expect("mutex state lock poisoned");
            if state.owner == Some(root) {
                Self::release_level(&mut state)
            } else {
                if let Some(pos) = state.waiters.iter().position(|w| w.root == root) {
                    state.waiters.remove(pos);
                }
                None
            }
        };
        if let Some(resume) = next {
            trace!("mutex released by cancelled holder");
            resume.success();
        }
    }
}
