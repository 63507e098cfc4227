//! The broadcast wait strategy coordinating all waiters of one pipeline stage.

use std::fmt;
use std::mem;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::constants::ERR_POISONED_LOCK;
use crate::{Cancelled, Sequence, WaitFuture, WaitOutcome, WaiterBinding, spin};

/// The waiter registry guarded by the gate lock.
///
/// The gate only serializes registration and drain of the waiter sets; the cursor
/// itself is observed through its own atomic and never through this lock.
#[derive(Debug, Default)]
struct Gate {
    /// Asynchronous waiters whose slots must be individually completed on the next
    /// broadcast; cleared on every broadcast.
    pending_async: Vec<Arc<WaiterBinding>>,

    /// Whether any thread may be blocked on the condition variable. Lets a broadcast
    /// skip the wake entirely when no thread announced itself.
    has_sync_waiter: bool,
}

/// A broadcast wake-up wait strategy for one single-producer, multi-consumer stage.
///
/// Consumers wait for the producer cursor to reach a target value, either by
/// blocking the calling thread ([`wait_for()`][Self::wait_for]) or by suspending a
/// task ([`wait_for_async()`][Self::wait_for_async]). The producer, after
/// advancing the cursor, releases everyone with a single
/// [`signal_all_when_blocking()`][Self::signal_all_when_blocking].
///
/// The broadcast is a liveness signal, not a correctness guarantee: every released
/// waiter re-confirms its own dependent sequence (which in a multi-stage pipeline
/// may trail the cursor) before reporting success.
///
/// Blocking waiters share one condition variable, which a broadcast pulses without
/// per-waiter bookkeeping. Asynchronous waiters have no blocked thread to pulse, so
/// each registers its [`WaiterBinding`] and is completed individually when the
/// broadcast drains the registry.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::thread;
///
/// use seq_wait::{BroadcastWaitCoordinator, Sequence, WaitOutcome};
/// use tokio_util::sync::CancellationToken;
///
/// let coordinator = Arc::new(BroadcastWaitCoordinator::new());
/// let cursor = Arc::new(Sequence::new());
///
/// let producer = thread::spawn({
///     let coordinator = Arc::clone(&coordinator);
///     let cursor = Arc::clone(&cursor);
///     move || {
///         cursor.set(0);
///         coordinator.signal_all_when_blocking();
///     }
/// });
///
/// let outcome = coordinator.wait_for(0, &cursor, &cursor, &CancellationToken::new());
/// assert_eq!(outcome, Ok(WaitOutcome::Reached(0)));
///
/// producer.join().unwrap();
/// ```
pub struct BroadcastWaitCoordinator {
    gate: Mutex<Gate>,
    released: Condvar,

    /// Per-wait timeout for the blocking path. Asynchronous waits have no timeout.
    timeout: Option<Duration>,
}

impl BroadcastWaitCoordinator {
    /// Creates a coordinator whose blocking waits never time out.
    #[must_use]
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(Gate::default()),
            released: Condvar::new(),
            timeout: None,
        }
    }

    /// Creates a coordinator whose blocking waits give up after `timeout` and
    /// return [`WaitOutcome::TimedOut`].
    ///
    /// The timeout only applies to [`wait_for()`][Self::wait_for]; asynchronous
    /// waits are released exclusively by broadcast or cancellation.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::new()
        }
    }

    /// Blocks the calling thread until `dependent` reaches `target`.
    ///
    /// Returns immediately when the cursor is already far enough. Otherwise blocks
    /// on the gate's condition variable until a broadcast reports cursor progress,
    /// then confirms `dependent` actually caught up before returning the observed
    /// value.
    ///
    /// Returns [`WaitOutcome::TimedOut`] when a construction-time timeout elapses
    /// first; a timeout is an ordinary outcome for the caller to react to, not an
    /// error. Cancelling `cancel` ends the wait with [`Cancelled`] at the next
    /// check point, which requires a wake-up to be reached - pair a cancellation
    /// with a broadcast to release waiters promptly.
    pub fn wait_for(
        &self,
        target: i64,
        cursor: &Sequence,
        dependent: &Sequence,
        cancel: &CancellationToken,
    ) -> Result<WaitOutcome, Cancelled> {
        if cursor.value() < target {
            let mut gate = self.gate.lock().expect(ERR_POISONED_LOCK);

            while cursor.value() < target {
                if cancel.is_cancelled() {
                    return Err(Cancelled);
                }

                // Announce ourselves so the next broadcast knows to pulse the
                // condition variable. The broadcast clears the flag, so it must be
                // re-announced on every iteration.
                gate.has_sync_waiter = true;

                match self.timeout {
                    None => {
                        gate = self.released.wait(gate).expect(ERR_POISONED_LOCK);
                    }
                    Some(timeout) => {
                        let (reacquired, wait_result) = self
                            .released
                            .wait_timeout(gate, timeout)
                            .expect(ERR_POISONED_LOCK);

                        gate = reacquired;

                        if wait_result.timed_out() && cursor.value() < target {
                            return Ok(WaitOutcome::TimedOut);
                        }
                    }
                }
            }
        }

        // The cursor is far enough; now confirm our specific dependent sequence.
        spin::confirm_dependent(target, dependent, cancel).map(WaitOutcome::Reached)
    }

    /// Begins an asynchronous wait for `dependent` to reach `target`, registering
    /// `binding` to be completed by a future broadcast.
    ///
    /// When the cursor is already far enough the returned future is pre-completed
    /// and no registration happens; the confirmation spin runs before this call
    /// returns. Otherwise the wait is armed on the binding's slot and the future
    /// suspends its caller until a broadcast releases it.
    ///
    /// The cursor is re-checked under the gate before registering, so a broadcast
    /// can never slip between the unlocked fast check and the registration and
    /// leave the waiter stranded.
    ///
    /// # Panics
    ///
    /// Panics if `binding` already has a wait in progress.
    #[must_use]
    pub fn wait_for_async<'b>(
        &self,
        target: i64,
        cursor: &Sequence,
        dependent: &Arc<Sequence>,
        binding: &'b Arc<WaiterBinding>,
    ) -> WaitFuture<'b> {
        if binding.cancellation().is_cancelled() {
            return WaitFuture::ready(Err(Cancelled));
        }

        // Fast path: no registration when the cursor is already far enough.
        if cursor.value() >= target {
            return WaitFuture::ready(
                spin::confirm_dependent(target, dependent, binding.cancellation())
                    .map(WaitOutcome::Reached),
            );
        }

        let mut gate = self.gate.lock().expect(ERR_POISONED_LOCK);

        // Double check under the gate: a broadcast that ran between the unlocked
        // check above and our lock acquisition would never see this registration.
        if cursor.value() >= target {
            drop(gate);

            return WaitFuture::ready(
                spin::confirm_dependent(target, dependent, binding.cancellation())
                    .map(WaitOutcome::Reached),
            );
        }

        // Arm while still holding the gate - a broadcast draining the registry
        // must never find this binding with nothing armed on it.
        gate.pending_async.push(Arc::clone(binding));
        binding.arm(target, Arc::clone(dependent))
    }

    /// Releases every currently pending waiter, both blocking and asynchronous.
    ///
    /// Called by the producer after advancing the cursor. Never blocks on consumer
    /// code: blocked threads are pulsed through the condition variable and
    /// suspended tasks are rescheduled onto their own executors.
    ///
    /// The gate is released before any waiter is notified, so a released waiter
    /// re-registering immediately can never race the very drain that released it.
    pub fn signal_all_when_blocking(&self) {
        let mut gate = self.gate.lock().expect(ERR_POISONED_LOCK);

        let wake_blocked = mem::take(&mut gate.has_sync_waiter);
        let pending = mem::take(&mut gate.pending_async);

        drop(gate);

        if wake_blocked {
            self.released.notify_all();
        }

        for binding in pending {
            binding.notify();
        }
    }
}

impl Default for BroadcastWaitCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BroadcastWaitCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BroadcastWaitCoordinator")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    use futures::executor::block_on;
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::test_utils::with_watchdog;

    assert_impl_all!(BroadcastWaitCoordinator: Send, Sync);

    #[test]
    fn sync_fast_path_skips_blocking() {
        let coordinator = BroadcastWaitCoordinator::new();
        let cursor = Sequence::with_value(10);

        // No producer exists, so only the fast path can return here.
        let outcome = coordinator.wait_for(5, &cursor, &cursor, &CancellationToken::new());
        assert_eq!(outcome, Ok(WaitOutcome::Reached(10)));
    }

    #[test]
    fn async_fast_path_returns_pre_completed_future() {
        let coordinator = BroadcastWaitCoordinator::new();
        let cursor = Arc::new(Sequence::with_value(3));
        let binding = Arc::new(WaiterBinding::new());

        let wait = coordinator.wait_for_async(3, &cursor, &cursor, &binding);
        assert_eq!(block_on(wait), Ok(WaitOutcome::Reached(3)));

        // The fast path must not have armed the slot.
        let wait = coordinator.wait_for_async(3, &cursor, &cursor, &binding);
        assert_eq!(block_on(wait), Ok(WaitOutcome::Reached(3)));
    }

    #[test]
    fn sync_wait_released_by_broadcast() {
        with_watchdog(|| {
            let coordinator = Arc::new(BroadcastWaitCoordinator::new());
            let cursor = Arc::new(Sequence::new());

            let producer = thread::spawn({
                let coordinator = Arc::clone(&coordinator);
                let cursor = Arc::clone(&cursor);
                move || {
                    thread::sleep(Duration::from_millis(10));
                    cursor.set(7);
                    coordinator.signal_all_when_blocking();
                }
            });

            let outcome = coordinator.wait_for(7, &cursor, &cursor, &CancellationToken::new());
            assert_eq!(outcome, Ok(WaitOutcome::Reached(7)));

            producer.join().unwrap();
        });
    }

    #[test]
    fn async_wait_released_by_broadcast() {
        with_watchdog(|| {
            let coordinator = Arc::new(BroadcastWaitCoordinator::new());
            let cursor = Arc::new(Sequence::new());
            let binding = Arc::new(WaiterBinding::new());

            let wait = coordinator.wait_for_async(0, &cursor, &cursor, &binding);

            let producer = thread::spawn({
                let coordinator = Arc::clone(&coordinator);
                let cursor = Arc::clone(&cursor);
                move || {
                    cursor.set(0);
                    coordinator.signal_all_when_blocking();
                }
            });

            assert_eq!(block_on(wait), Ok(WaitOutcome::Reached(0)));
            producer.join().unwrap();
        });
    }

    #[test]
    fn blocking_wait_times_out() {
        with_watchdog(|| {
            let coordinator = BroadcastWaitCoordinator::with_timeout(Duration::from_millis(20));
            let cursor = Sequence::new();

            // Nobody will ever publish; the timeout is the only way out.
            let outcome = coordinator.wait_for(0, &cursor, &cursor, &CancellationToken::new());
            assert_eq!(outcome, Ok(WaitOutcome::TimedOut));
        });
    }

    #[test]
    fn fan_out_releases_all_waiters() {
        with_watchdog(|| {
            const ASYNC_WAITERS: usize = 4;
            const SYNC_WAITERS: usize = 4;
            const TARGET: i64 = 0;

            let coordinator = Arc::new(BroadcastWaitCoordinator::new());
            let cursor = Arc::new(Sequence::new());

            // Asynchronous waiters register on this thread first, so all of them
            // are in the registry before the broadcast fires.
            let bindings: Vec<_> = (0..ASYNC_WAITERS)
                .map(|_| Arc::new(WaiterBinding::new()))
                .collect();
            let waits: Vec<_> = bindings
                .iter()
                .map(|binding| coordinator.wait_for_async(TARGET, &cursor, &cursor, binding))
                .collect();

            let sync_waiters: Vec<_> = (0..SYNC_WAITERS)
                .map(|_| {
                    thread::spawn({
                        let coordinator = Arc::clone(&coordinator);
                        let cursor = Arc::clone(&cursor);
                        move || coordinator.wait_for(TARGET, &cursor, &cursor, &CancellationToken::new())
                    })
                })
                .collect();

            cursor.set(TARGET);
            coordinator.signal_all_when_blocking();

            for wait in waits {
                let outcome = block_on(wait).expect("async waiter must not be cancelled");
                assert!(matches!(outcome, WaitOutcome::Reached(value) if value >= TARGET));
            }

            for waiter in sync_waiters {
                let outcome = waiter
                    .join()
                    .unwrap()
                    .expect("sync waiter must not be cancelled");
                assert!(matches!(outcome, WaitOutcome::Reached(value) if value >= TARGET));
            }
        });
    }

    #[test]
    fn dependent_sequence_gates_the_result() {
        with_watchdog(|| {
            let coordinator = Arc::new(BroadcastWaitCoordinator::new());
            let cursor = Arc::new(Sequence::new());
            let dependent = Arc::new(Sequence::new());
            let binding = Arc::new(WaiterBinding::new());

            let (resolved_tx, resolved_rx) = mpsc::channel();

            let waiter = thread::spawn({
                let coordinator = Arc::clone(&coordinator);
                let cursor = Arc::clone(&cursor);
                let dependent = Arc::clone(&dependent);
                move || {
                    let outcome =
                        block_on(coordinator.wait_for_async(5, &cursor, &dependent, &binding));
                    resolved_tx.send(outcome).unwrap();
                }
            });

            // Release the cursor but leave the dependent sequence behind; the
            // waiter must keep confirming rather than report success.
            cursor.set(5);
            coordinator.signal_all_when_blocking();

            assert_eq!(
                resolved_rx.recv_timeout(Duration::from_millis(50)),
                Err(mpsc::RecvTimeoutError::Timeout)
            );

            // Only once the dependent stage catches up may the waiter return.
            dependent.set(5);

            assert_eq!(
                resolved_rx.recv_timeout(Duration::from_secs(5)),
                Ok(Ok(WaitOutcome::Reached(5)))
            );

            waiter.join().unwrap();
        });
    }

    #[test]
    fn cancellation_releases_pending_async_wait() {
        with_watchdog(|| {
            let coordinator = Arc::new(BroadcastWaitCoordinator::new());
            let cursor = Arc::new(Sequence::new());
            let binding = Arc::new(WaiterBinding::new());

            let wait = coordinator.wait_for_async(0, &cursor, &cursor, &binding);

            // Cancel, then broadcast so the waiter reaches its next check point.
            binding.cancellation().cancel();
            coordinator.signal_all_when_blocking();

            assert_eq!(block_on(wait), Err(Cancelled));
        });
    }

    #[test]
    fn cancelled_binding_short_circuits_registration() {
        let coordinator = BroadcastWaitCoordinator::new();
        let cursor = Arc::new(Sequence::new());
        let binding = Arc::new(WaiterBinding::new());

        binding.cancellation().cancel();

        // No broadcast will ever come; the wait must not register at all.
        let wait = coordinator.wait_for_async(0, &cursor, &cursor, &binding);
        assert_eq!(block_on(wait), Err(Cancelled));
    }

    #[test]
    fn cancellation_releases_blocked_sync_wait() {
        with_watchdog(|| {
            let coordinator = Arc::new(BroadcastWaitCoordinator::new());
            let cursor = Arc::new(Sequence::new());
            let cancel = CancellationToken::new();

            let canceller = thread::spawn({
                let coordinator = Arc::clone(&coordinator);
                let cancel = cancel.clone();
                move || {
                    thread::sleep(Duration::from_millis(10));
                    cancel.cancel();
                    coordinator.signal_all_when_blocking();
                }
            });

            let outcome = coordinator.wait_for(0, &cursor, &cursor, &cancel);
            assert_eq!(outcome, Err(Cancelled));

            canceller.join().unwrap();
        });
    }

    #[test]
    fn binding_is_reusable_after_cancelled_wait() {
        with_watchdog(|| {
            let coordinator = Arc::new(BroadcastWaitCoordinator::new());
            let cursor = Arc::new(Sequence::new());
            let binding = Arc::new(WaiterBinding::new());

            let wait = coordinator.wait_for_async(0, &cursor, &cursor, &binding);
            binding.cancellation().cancel();
            coordinator.signal_all_when_blocking();
            assert_eq!(block_on(wait), Err(Cancelled));

            // The slot must be back in circulation even though the scope stays
            // cancelled; registration now short-circuits without arming.
            let wait = coordinator.wait_for_async(1, &cursor, &cursor, &binding);
            assert_eq!(block_on(wait), Err(Cancelled));
        });
    }

    #[test]
    fn repeated_waits_follow_a_live_producer() {
        with_watchdog(|| {
            const ITERATIONS: i64 = 500;

            let coordinator = Arc::new(BroadcastWaitCoordinator::new());
            let cursor = Arc::new(Sequence::new());
            let binding = Arc::new(WaiterBinding::new());

            let producer = thread::spawn({
                let coordinator = Arc::clone(&coordinator);
                let cursor = Arc::clone(&cursor);
                move || {
                    for published in 0..ITERATIONS {
                        cursor.set(published);
                        coordinator.signal_all_when_blocking();
                    }
                }
            });

            for target in 0..ITERATIONS {
                let wait = coordinator.wait_for_async(target, &cursor, &cursor, &binding);
                let outcome = block_on(wait).expect("wait must not be cancelled");
                assert!(matches!(outcome, WaitOutcome::Reached(value) if value >= target));
            }

            producer.join().unwrap();
        });
    }

    #[test]
    fn registration_racing_broadcast_never_strands_the_waiter() {
        with_watchdog(|| {
            const ITERATIONS: i64 = 200;

            let coordinator = Arc::new(BroadcastWaitCoordinator::new());
            let cursor = Arc::new(Sequence::new());
            let binding = Arc::new(WaiterBinding::new());

            for target in 0..ITERATIONS {
                // The producer publishes concurrently with our registration, so
                // every interleaving of check, lock and drain gets exercised.
                let producer = thread::spawn({
                    let coordinator = Arc::clone(&coordinator);
                    let cursor = Arc::clone(&cursor);
                    move || {
                        cursor.set(target);
                        coordinator.signal_all_when_blocking();
                    }
                });

                let wait = coordinator.wait_for_async(target, &cursor, &cursor, &binding);
                let outcome = block_on(wait).expect("wait must not be cancelled");
                assert!(matches!(outcome, WaitOutcome::Reached(value) if value >= target));

                producer.join().unwrap();
            }
        });
    }
}
