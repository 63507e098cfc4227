//! Broadcast wait coordination for single-producer, multi-consumer pipelines.
//!
//! This crate provides the wait primitive of a sequenced inter-thread messaging
//! stage: a producer advances a monotonic [`Sequence`] (the cursor) and consumers
//! wait, blocking or asynchronously, until the sequence they depend on reaches a
//! target value. One broadcast from the producer releases every pending waiter at
//! once, and each waiter confirms its own dependent sequence before resuming.
//!
//! The asynchronous path is allocation-free in steady state: every consumer leg
//! owns one [`WaiterBinding`] whose internal wait slot is rearmed and reused for
//! millions of iterations, with a generation token guarding against stale handles.
//!
//! # Blocking example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//!
//! use seq_wait::{BroadcastWaitCoordinator, Sequence, WaitOutcome};
//! use tokio_util::sync::CancellationToken;
//!
//! let coordinator = Arc::new(BroadcastWaitCoordinator::new());
//! let cursor = Arc::new(Sequence::new());
//!
//! let producer = thread::spawn({
//!     let coordinator = Arc::clone(&coordinator);
//!     let cursor = Arc::clone(&cursor);
//!     move || {
//!         // Publish item 0, then release the waiters.
//!         cursor.set(0);
//!         coordinator.signal_all_when_blocking();
//!     }
//! });
//!
//! let outcome = coordinator.wait_for(0, &cursor, &cursor, &CancellationToken::new());
//! assert_eq!(outcome, Ok(WaitOutcome::Reached(0)));
//!
//! producer.join().unwrap();
//! ```
//!
//! # Async example
//!
//! ```rust
//! use std::sync::Arc;
//! use std::thread;
//!
//! use futures::executor::block_on;
//! use seq_wait::{BroadcastWaitCoordinator, Sequence, WaitOutcome, WaiterBinding};
//!
//! let coordinator = Arc::new(BroadcastWaitCoordinator::new());
//! let cursor = Arc::new(Sequence::new());
//!
//! // One binding per consumer leg, reused across all of its waits.
//! let binding = Arc::new(WaiterBinding::new());
//!
//! let wait = coordinator.wait_for_async(0, &cursor, &cursor, &binding);
//!
//! let producer = thread::spawn({
//!     let coordinator = Arc::clone(&coordinator);
//!     let cursor = Arc::clone(&cursor);
//!     move || {
//!         cursor.set(0);
//!         coordinator.signal_all_when_blocking();
//!     }
//! });
//!
//! assert_eq!(block_on(wait), Ok(WaitOutcome::Reached(0)));
//!
//! producer.join().unwrap();
//! ```

mod binding;
mod constants;
mod coordinator;
mod outcome;
mod sequence;
mod slot;
mod spin;
mod test_utils;

pub use binding::{WaitFuture, WaiterBinding};
pub use coordinator::BroadcastWaitCoordinator;
pub use outcome::{Cancelled, WaitOutcome};
pub use sequence::{INITIAL_SEQUENCE_VALUE, Sequence};
