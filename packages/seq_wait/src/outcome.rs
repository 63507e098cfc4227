//! Result types for wait operations.

use thiserror::Error;

/// The result of waiting for a sequence to reach a target value.
///
/// A timeout is an ordinary outcome, not an error - the caller configured the timeout
/// and decides how to react to it. Only cancellation surfaces as an error
/// ([`Cancelled`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[expect(
    clippy::exhaustive_enums,
    reason = "intentional - callers must handle both outcomes"
)]
pub enum WaitOutcome {
    /// The dependent sequence reached (at least) the requested target; the observed
    /// value is carried here and is never below the target.
    Reached(i64),

    /// The configured timeout elapsed before the cursor advanced far enough.
    ///
    /// Only blocking waits can produce this; asynchronous waits have no timeout.
    TimedOut,
}

/// The wait was abandoned because its cancellation scope was cancelled.
///
/// Cancellation is cooperative: it is observed at defined poll points and reported
/// exactly once, when the waiter consumes its result - never on the thread that
/// signaled progress.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("wait was cancelled before the target sequence was reached")]
#[expect(
    clippy::exhaustive_structs,
    reason = "intentional - a stateless marker error"
)]
pub struct Cancelled;
