//! The fixed-arity argument channel between steps.
//!
//! `success_with(..)` stores up to [`MAX_NEXT_ARGS`] values into the root's
//! [`NextArgs`] slots; the next step body declared with typed arguments moves
//! them back out positionally. A `success()` with no arguments leaves the
//! slots untouched, so previously stored results stay readable by later
//! steps and across loop iterations.
//!
//! A type mismatch on extraction is a fatal programming error; the engine
//! fails fast with a diagnostic naming the argument position, the expected
//! type, and the actual type.

use core::fmt;

use crate::value::{FromValue, IntoValue, TypeMismatch, Value};

/// Maximum number of values carried between steps.
pub const MAX_NEXT_ARGS: usize = 4;

/// The per-root argument slots.
#[derive(Debug, Default)]
pub struct NextArgs {
    slots: [Value; MAX_NEXT_ARGS],
}

impl NextArgs {
    /// Creates an empty argument set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces all slots with the given values.
    ///
    /// Slots beyond the provided arity are cleared.
    pub fn assign(&mut self, slots: [Value; MAX_NEXT_ARGS]) {
        self.slots = slots;
    }

    /// Moves the value out of slot `index`, leaving it empty.
    pub fn take(&mut self, index: usize) -> Value {
        core::mem::take(&mut self.slots[index])
    }

    /// Returns a reference to slot `index`.
    #[must_use]
    pub fn peek(&self, index: usize) -> &Value {
        &self.slots[index]
    }

    /// Clears every slot.
    pub fn clear(&mut self) {
        self.slots = Default::default();
    }
}

/// Failure to extract a typed argument tuple from the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgMismatch {
    /// Zero-based argument position.
    pub position: usize,
    /// The underlying type mismatch.
    pub mismatch: TypeMismatch,
}

impl fmt::Display for ArgMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "argument {}: {}", self.position, self.mismatch)
    }
}

impl std::error::Error for ArgMismatch {}

/// Panic payload used when a typed step body meets arguments of the wrong
/// type.
///
/// Type confusion on the channel is a fatal programming error: the engine
/// does not route it through on-error handlers but re-raises it past the
/// dispatcher and the reactor, carrying the position and both type names.
#[derive(Debug, Clone)]
pub struct FatalMismatch(pub ArgMismatch);

impl fmt::Display for FatalMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fatal {}", self.0)
    }
}

/// A 1–4 tuple of values that can be stored into the channel.
pub trait IntoArgs {
    /// Converts the tuple into the four channel slots.
    fn into_slots(self) -> [Value; MAX_NEXT_ARGS];
}

/// A 1–4 tuple of typed values that can be extracted from the channel.
pub trait ArgTuple: Sized {
    /// Moves the tuple out of the channel slots.
    ///
    /// # Errors
    ///
    /// Returns an [`ArgMismatch`] naming the failing position and types.
    fn take_from(args: &mut NextArgs) -> Result<Self, ArgMismatch>;
}

fn take_typed<T: FromValue>(args: &mut NextArgs, position: usize) -> Result<T, ArgMismatch> {
    T::from_value(args.take(position)).map_err(|mismatch| ArgMismatch { position, mismatch })
}

impl<A: IntoValue> IntoArgs for (A,) {
    fn into_slots(self) -> [Value; MAX_NEXT_ARGS] {
        [self.0.into_value(), Value::Empty, Value::Empty, Value::Empty]
    }
}

impl<A: IntoValue, B: IntoValue> IntoArgs for (A, B) {
    fn into_slots(self) -> [Value; MAX_NEXT_ARGS] {
        [
            self.0.into_value(),
            self.1.into_value(),
            Value::Empty,
            Value::Empty,
        ]
    }
}

impl<A: IntoValue, B: IntoValue, C: IntoValue> IntoArgs for (A, B, C) {
    fn into_slots(self) -> [Value; MAX_NEXT_ARGS] {
        [
            self.0.into_value(),
            self.1.into_value(),
            self.2.into_value(),
            Value::Empty,
        ]
    }
}

impl<A: IntoValue, B: IntoValue, C: IntoValue, D: IntoValue> IntoArgs for (A, B, C, D) {
    fn into_slots(self) -> [Value; MAX_NEXT_ARGS] {
        [
            self.0.into_value(),
            self.1.into_value(),
            self.2.into_value(),
            self.3.into_value(),
        ]
    }
}

impl<A: FromValue> ArgTuple for (A,) {
    fn take_from(args: &mut NextArgs) -> Result<Self, ArgMismatch> {
        Ok((take_typed(args, 0)?,))
    }
}

impl<A: FromValue, B: FromValue> ArgTuple for (A, B) {
    fn take_from(args: &mut NextArgs) -> Result<Self, ArgMismatch> {
        Ok((take_typed(args, 0)?, take_typed(args, 1)?))
    }
}

impl<A: FromValue, B: FromValue, C: FromValue> ArgTuple for (A, B, C) {
    fn take_from(args: &mut NextArgs) -> Result<Self, ArgMismatch> {
        Ok((
            take_typed(args, 0)?,
            take_typed(args, 1)?,
            take_typed(args, 2)?,
        ))
    }
}

impl<A: FromValue, B: FromValue, C: FromValue, D: FromValue> ArgTuple for (A, B, C, D) {
    fn take_from(args: &mut NextArgs) -> Result<Self, ArgMismatch> {
        Ok((
            take_typed(args, 0)?,
            take_typed(args, 1)?,
            take_typed(args, 2)?,
            take_typed(args, 3)?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assign_and_take_tuple() {
        let mut args = NextArgs::new();
        args.assign((123_i64, true, "str", 2.5_f64).into_slots());

        let (a, b, c, d) = <(i64, bool, String, f64)>::take_from(&mut args).expect("typed take");
        assert_eq!(a, 123);
        assert!(b);
        assert_eq!(c, "str");
        assert!((d - 2.5).abs() < f64::EPSILON);

        // Slots were moved out.
        assert!(args.peek(0).is_empty());
    }

    #[test]
    fn shorter_tuples_clear_trailing_slots() {
        let mut args = NextArgs::new();
        args.assign((1_i64, 2_i64, 3_i64, 4_i64).into_slots());
        args.assign((9_i64,).into_slots());

        assert!(!args.peek(0).is_empty());
        assert!(args.peek(1).is_empty());
        assert!(args.peek(3).is_empty());
    }

    #[test]
    fn mismatch_reports_position_and_types() {
        let mut args = NextArgs::new();
        args.assign((1_i64, false).into_slots());

        let err = <(i64, String)>::take_from(&mut args).unwrap_err();
        assert_eq!(err.position, 1);
        assert_eq!(err.mismatch.expected, "string");
        assert_eq!(err.mismatch.found, "bool");
        assert_eq!(
            format!("{err}"),
            "argument 1: argument type mismatch: expected string, found bool"
        );
    }

    #[test]
    fn vectors_travel_through_the_channel() {
        let mut args = NextArgs::new();
        args.assign((vec![1_i32, 2, 3],).into_slots());

        let (v,) = <(Vec<i32>,)>::take_from(&mut args).expect("typed take");
        assert_eq!(v, vec![1, 2, 3]);
    }

    #[test]
    fn clear_empties_all_slots() {
        let mut args = NextArgs::new();
        args.assign((1_i64, 2_i64).into_slots());
        args.clear();
        assert!((0..MAX_NEXT_ARGS).all(|i| args.peek(i).is_empty()));
    }
}
