//! Per-root shared state.
//!
//! Every root owns one [`State`]: a string-keyed map of type-erased values
//! plus the well-known slots the engine maintains during unwinding. Parallel
//! sub-flows share their parent root's state; the engine enforces no locking
//! on it, cooperative steps are responsible for their own discipline.

use std::collections::HashMap;

use crate::errors::{CaughtException, ErrorCode};
use crate::step::LoopLabel;
use crate::value::{FromValue, IntoValue, Value};

/// Hook invoked when an error reaches the root with no handler.
pub type UnhandledErrorHook = Box<dyn FnMut(&ErrorCode)>;

/// Key/value state shared across a root's steps.
#[derive(Default)]
pub struct State {
    items: HashMap<String, Value>,
    /// Human-readable detail of the last raised error.
    pub error_info: String,
    /// The most recent exception caught by the dispatcher.
    pub last_exception: Option<CaughtException>,
    /// Label argument of the most recent `break_loop`/`continue_loop`.
    pub error_loop_label: Option<LoopLabel>,
    /// Invoked exactly once when an error is not recovered by any handler.
    pub unhandled_error: Option<UnhandledErrorHook>,
}

impl State {
    /// Creates an empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a value under `key`, replacing any previous value.
    pub fn set(&mut self, key: impl Into<String>, value: impl IntoValue) {
        self.items.insert(key.into(), value.into_value());
    }

    /// Returns a typed copy of the value under `key`.
    ///
    /// # Panics
    ///
    /// Panics with a diagnostic naming both types when the stored value is
    /// of a different type. Type confusion on state keys is a programming
    /// error, same as on the argument channel.
    #[must_use]
    pub fn get<T: FromValue>(&self, key: &str) -> Option<T> {
        let value = self.items.get(key)?.clone();
        match T::from_value(value) {
            Ok(v) => Some(v),
            Err(mismatch) => panic!("state[{key:?}]: {mismatch}"),
        }
    }

    /// Returns a typed copy of the value under `key`, inserting `default`
    /// first when the key is vacant.
    ///
    /// # Panics
    ///
    /// Panics on type mismatch, as [`State::get`].
    pub fn get_or_default<T: FromValue + IntoValue + Clone>(
        &mut self,
        key: &str,
        default: T,
    ) -> T {
        if !self.items.contains_key(key) {
            self.items.insert(key.to_string(), default.into_value());
        }
        self.get(key).expect("key inserted above")
    }

    /// Returns a reference to the raw value under `key`.
    #[must_use]
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.items.get(key)
    }

    /// Returns a mutable reference to the raw value under `key`.
    pub fn value_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.items.get_mut(key)
    }

    /// Removes and returns the value under `key`.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.items.remove(key)
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.items.contains_key(key)
    }
}

impl core::fmt::Debug for State {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("State")
            .field("items", &self.items.len())
            .field("error_info", &self.error_info)
            .field("last_exception", &self.last_exception)
            .field("error_loop_label", &self.error_loop_label)
            .field("unhandled_error", &self.unhandled_error.is_some())
            .finish()
    }
}
