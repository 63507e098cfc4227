//! The per-consumer-leg handle that couples a wait slot to a cancellation scope.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio_util::sync::CancellationToken;

use crate::slot::AsyncWaitSlot;
use crate::{Cancelled, Sequence, WaitOutcome, spin};

/// Couples one reusable wait slot to one cooperative cancellation scope.
///
/// Create one binding per logical consumer leg and reuse it for every wait that leg
/// performs; the binding never allocates per wait. A binding is single-owner: only
/// one wait may be in progress at a time, and the [`WaitFuture`] it hands out must
/// be driven to completion before the next wait is armed.
///
/// The producer side only ever calls [`notify()`][Self::notify], typically via the
/// coordinator's broadcast. Notification is always safe: it never blocks, never
/// panics for timing reasons and never runs consumer code.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
///
/// use futures::executor::block_on;
/// use seq_wait::{Sequence, WaitOutcome, WaiterBinding};
///
/// let cursor = Arc::new(Sequence::new());
/// let binding = WaiterBinding::new();
///
/// let wait = binding.arm(0, Arc::clone(&cursor));
///
/// // The producer publishes and notifies.
/// cursor.set(0);
/// binding.notify();
///
/// assert_eq!(block_on(wait), Ok(WaitOutcome::Reached(0)));
/// ```
pub struct WaiterBinding {
    slot: AsyncWaitSlot,
    cancel: CancellationToken,
}

impl WaiterBinding {
    /// Creates a binding with its own fresh cancellation scope.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cancellation(CancellationToken::new())
    }

    /// Creates a binding tied to an existing cancellation scope, typically a child
    /// token of the scope that owns the whole pipeline stage.
    #[must_use]
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            slot: AsyncWaitSlot::new(),
            cancel,
        }
    }

    /// The cancellation scope this binding's waits observe.
    ///
    /// Cancellation is cooperative: after cancelling, release any pending wait with
    /// a broadcast so the waiter reaches its next poll point and observes the
    /// cancellation there.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Arms a new wait for `dependent` to reach `target`, returning the future that
    /// resolves once [`notify()`][Self::notify] delivers the wake-up.
    ///
    /// This is the only way to obtain a wait future, which transitively guarantees
    /// the slot's one-owner invariant.
    ///
    /// # Panics
    ///
    /// Panics if the previous wait on this binding has not been driven to
    /// completion yet.
    #[must_use]
    pub fn arm(&self, target: i64, dependent: Arc<Sequence>) -> WaitFuture<'_> {
        let generation = self.slot.arm(target, dependent);

        WaitFuture {
            state: FutureState::Armed {
                binding: self,
                generation,
            },
        }
    }

    /// Marks the pending wait completed and reschedules its suspended waiter.
    ///
    /// A no-op if no wait is pending; late notifications after a wait has resolved
    /// are harmless. The waiter is rescheduled through its waker, so this call
    /// never executes consumer code inline.
    pub fn notify(&self) {
        self.slot.complete();
    }
}

impl Default for WaiterBinding {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaiterBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaiterBinding")
            .field("slot", &self.slot)
            .field("is_cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[derive(Clone, Copy, Debug)]
enum FutureState<'b> {
    /// The outcome is already known; the first poll returns it.
    Ready(Result<WaitOutcome, Cancelled>),

    /// A wait is armed on the binding's slot; polls go through the slot's
    /// completion protocol, tagged with the generation this future was issued for.
    Armed {
        binding: &'b WaiterBinding,
        generation: u16,
    },

    /// The outcome has been returned. Polling again is a caller bug.
    Resolved,
}

/// A lightweight handle to one wait cycle of a [`WaiterBinding`].
///
/// Resolving the future consumes the wait and releases the underlying slot for
/// reuse, so the outcome is delivered exactly once. On delivery, the waiter first
/// confirms its dependent sequence actually reached the target (the broadcast
/// wake-up only promises liveness) and observes cancellation, which surfaces here
/// as [`Cancelled`] and nowhere else.
///
/// # Panics
///
/// Polling after the future has resolved, or after the binding has moved on to a
/// later wait, panics: the handle is only valid for the cycle it was issued for.
#[derive(Debug)]
pub struct WaitFuture<'b> {
    state: FutureState<'b>,
}

impl WaitFuture<'_> {
    /// Creates a future that resolves immediately with a known outcome, without
    /// arming any slot. Used for waits satisfied on their fast path.
    #[must_use]
    pub fn ready(result: Result<WaitOutcome, Cancelled>) -> Self {
        Self {
            state: FutureState::Ready(result),
        }
    }
}

impl Future for WaitFuture<'_> {
    type Output = Result<WaitOutcome, Cancelled>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        // All our fields are Unpin, so we never need the pin projection dance.
        let this = self.get_mut();

        match this.state {
            FutureState::Ready(result) => {
                this.state = FutureState::Resolved;
                Poll::Ready(result)
            }
            FutureState::Armed {
                binding,
                generation,
            } => match binding.slot.poll_wait(cx.waker(), generation) {
                None => Poll::Pending,
                Some(armed) => {
                    this.state = FutureState::Resolved;

                    // The wake-up only tells us the producer made progress; our
                    // specific dependent sequence may still be a few instructions
                    // behind. Confirm before reporting success.
                    let result =
                        spin::confirm_dependent(armed.target, &armed.dependent, &binding.cancel)
                            .map(WaitOutcome::Reached);

                    Poll::Ready(result)
                }
            },
            FutureState::Resolved => {
                panic!("wait future polled after it already resolved");
            }
        }
    }
}
