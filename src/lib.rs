//! Stepflow: a cooperative asynchronous step execution engine.
//!
//! # Overview
//!
//! Stepflow composes asynchronous procedures as a tree of steps driven by a
//! single cooperative reactor. Each step is a plain callback that may
//! complete synchronously, raise a string-coded error, defer completion to
//! an external event, or schedule child steps. The engine provides
//! structured error unwinding, timeouts, cancellation, loop control with
//! labels, parallel sub-flows over shared state, and cooperative
//! synchronization primitives.
//!
//! # Core guarantees
//!
//! - **Pre-order execution**: parent body, then children in add order, then
//!   the parent's continuation; siblings in program order
//! - **At-most-once completion**: exactly one of success, error, or
//!   cancellation completes a step
//! - **Structured unwinding**: errors walk the active path upward through
//!   on-error handlers; loop control sentinels are stripped at the matching
//!   loop frame
//! - **Prompt cancellation**: armed cancel hooks run exactly once, leaf to
//!   root; stale completions are detected and ignored
//!
//! # Module structure
//!
//! - [`engine`]: the [`AsyncSteps`] tree and its state machine
//! - [`reactor`]: immediate/deferred scheduling with cookie-validated handles
//! - [`sync`]: mutex, throttle, and limiter gates
//! - [`value`] / [`args`]: the typed argument channel between steps
//! - [`state`]: per-root shared state
//! - [`errors`]: string error codes and the step error type
//! - [`pool`]: pluggable step-record allocation
//! - [`tracing_compat`]: structured logging behind a feature flag
//!
//! # Example
//!
//! ```
//! use stepflow::{AsyncSteps, Reactor};
//!
//! let reactor = Reactor::new();
//! let mut root = AsyncSteps::new(&reactor);
//!
//! root.add_catch(
//!     |asi| {
//!         asi.add(|asi| asi.error("MyError"));
//!         Ok(())
//!     },
//!     |asi, code| {
//!         if *code == "MyError" {
//!             asi.success();
//!         }
//!         Ok(())
//!     },
//! );
//! root.repeat(3, |asi, i| {
//!     asi.state_mut().set("last", i as u64);
//!     Ok(())
//! }, None);
//!
//! root.execute();
//! reactor.run();
//! assert_eq!(root.state().get::<u64>("last"), Some(2));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)]

pub mod args;
pub mod engine;
pub mod errors;
pub mod pool;
pub mod reactor;
pub mod state;
pub mod step;
pub mod sync;
pub mod tracing_compat;
pub mod util;
pub mod value;

// Re-exports for convenient access to core types
pub use args::{ArgTuple, IntoArgs, NextArgs, MAX_NEXT_ARGS};
pub use engine::{AsyncSteps, CompletionHandle, Parallel, RootId, RootStatus, StepPromise};
pub use errors::{codes, CaughtException, Error, ErrorCode, PanicPayload, StepResult};
pub use pool::{PassthroughPool, RecyclingPool, StepPool};
pub use reactor::{
    CycleResult, Handle, Reactor, ReactorConfig, RemoteReactor, Time, TimeSource, VirtualClock,
    WallClock,
};
pub use state::State;
pub use step::LoopLabel;
pub use sync::{Gate, Limiter, LimiterOptions, Mutex, Throttle};
pub use value::{FromValue, IntoValue, Value};
