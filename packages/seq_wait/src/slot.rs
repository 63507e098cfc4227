//! The reusable completion slot behind every asynchronous wait.
//!
//! The following states exist:
//!
//! 0 - available - the slot has no owner and may be armed for a new wait.
//! 1 - armed - a wait is in progress but no continuation has been registered yet.
//! 2 - awaiting - a wait is in progress and a waker is registered in the slot.
//! 3 - signaling - the notifier is in the process of extracting the waker;
//!                 this state is a mutex of sorts, stopping the waiter from touching
//!                 the waker cell until the notifier transitions into "completed".
//! 4 - completed - the wake-up has been delivered but the result not yet consumed.
//!
//! The waiter cycles `available -> armed -> awaiting -> completed -> available` for
//! every wait it performs, without ever reallocating the slot. A wrapping generation
//! counter is advanced each time the slot returns to "available" so that a handle
//! issued for an earlier cycle can be recognized and rejected instead of silently
//! reading another cycle's result.

use std::cell::UnsafeCell;
use std::fmt;
use std::hint::spin_loop;
use std::mem::MaybeUninit;
use std::sync::Arc;
use std::sync::atomic::{self, AtomicU8, AtomicU16};
use std::task::Waker;

use crossbeam_utils::CachePadded;

use crate::Sequence;

const SLOT_AVAILABLE: u8 = 0;
const SLOT_ARMED: u8 = 1;
const SLOT_AWAITING: u8 = 2;
const SLOT_SIGNALING: u8 = 3;
const SLOT_COMPLETED: u8 = 4;

/// The parameters of the currently armed wait.
///
/// Stored when the slot is armed, taken back out when the result is consumed. The
/// notifier never touches these - it only flips the state and delivers the waker.
pub(crate) struct ArmedWait {
    /// The sequence value the waiter asked for.
    pub(crate) target: i64,

    /// The sequence the waiter must actually observe reach the target. May be the
    /// producer cursor or a downstream stage's own progress sequence.
    pub(crate) dependent: Arc<Sequence>,
}

/// A reusable, single-owner completion slot for one asynchronous waiter.
///
/// The slot implements a manual completion protocol between exactly two parties:
///
/// * the owning waiter, which arms the slot, registers its waker and consumes the
///   result - always one logical consumer leg, one operation at a time;
/// * one notifier at a time, which marks the armed wait completed and wakes the
///   registered continuation, never running any waiter code itself.
///
/// All coordination happens through compare-and-swap on a single state byte; the
/// waker cell is accessed only in states that grant the accessor exclusive rights
/// to it. Violating the single-owner contract (arming a slot that is not available,
/// polling with a stale generation, consuming twice) is a caller bug and panics.
pub(crate) struct AsyncWaitSlot {
    /// The logical state of the slot; see constants above.
    state: CachePadded<AtomicU8>,

    /// Advanced every time the slot is released back to "available". A wait handle
    /// is only valid for the generation it was issued under.
    ///
    /// Relaxed accesses suffice: the counter is a usage-bug detector for the single
    /// owner, not a synchronization mechanism, and its publication rides on the
    /// release/acquire edges of `state`.
    generation: AtomicU16,

    /// If `state` is [`SLOT_AWAITING`] or [`SLOT_SIGNALING`], this field is
    /// initialized with the waker of whoever most recently polled the wait handle.
    /// In other states, this field is not initialized.
    ///
    /// We use `MaybeUninit` to minimize the storage and avoid an `Option` or enum
    /// overhead, as we already track the presence via `state`.
    ///
    /// We use `UnsafeCell` because we are a synchronization primitive and
    /// do our own synchronization of reads/writes.
    awaiter: UnsafeCell<MaybeUninit<Waker>>,

    /// The parameters of the armed wait, present from arming until consumption.
    ///
    /// We use `UnsafeCell` because only the owning waiter accesses this field, and
    /// only in states (`available` during arming, `completed` during consumption)
    /// in which it holds exclusive access rights.
    wait: UnsafeCell<Option<ArmedWait>>,
}

impl AsyncWaitSlot {
    /// Creates a new slot in the available state, ready to be armed.
    pub(crate) fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicU8::new(SLOT_AVAILABLE)),
            generation: AtomicU16::new(0),
            awaiter: UnsafeCell::new(MaybeUninit::uninit()),
            wait: UnsafeCell::new(None),
        }
    }

    /// Arms the slot for a new wait, returning the generation token that tags the
    /// wait handle issued for this cycle.
    ///
    /// # Panics
    ///
    /// Panics if the slot is not available - a previous wait is still in progress or
    /// its result has not been consumed yet. Ownership of the slot is exclusive, so
    /// this is always a caller bug.
    pub(crate) fn arm(&self, target: i64, dependent: Arc<Sequence>) -> u16 {
        // We use Acquire ordering on success because we are acquiring the
        // synchronization block of `wait`, released when the previous cycle's
        // result was consumed.
        self.state
            .compare_exchange(
                SLOT_AVAILABLE,
                SLOT_ARMED,
                atomic::Ordering::Acquire,
                atomic::Ordering::Relaxed,
            )
            .expect(
                "armed a wait slot whose previous wait is still in progress - \
                 each consumer leg must finish one wait before starting the next",
            );

        // SAFETY: We just transitioned from `available` to `armed`, so we are the
        // exclusive owner of the slot and nobody else may touch `wait` until the
        // result of this cycle is consumed. The notifier never accesses this field.
        unsafe {
            *self.wait.get() = Some(ArmedWait { target, dependent });
        }

        self.generation.load(atomic::Ordering::Relaxed)
    }

    /// Marks the armed wait completed and wakes the registered continuation, if any.
    ///
    /// Never blocks, never panics on a late call and never runs waiter code: waking
    /// a continuation merely reschedules the waiter's task with its executor. If the
    /// continuation has not been registered yet, the waiter will observe the
    /// completion when it registers and resume immediately.
    pub(crate) fn complete(&self) {
        // We use Relaxed here because the CAS below repeats the read with the
        // ordering the chosen transition actually needs.
        let mut current = self.state.load(atomic::Ordering::Relaxed);

        loop {
            match current {
                SLOT_ARMED => {
                    // Nobody has registered a continuation yet. We only flip the
                    // state; the waiter will pick the completion up on its next poll.
                    //
                    // We use Release ordering so the waiter's Acquire read of
                    // `completed` is a full synchronization edge with us.
                    match self.state.compare_exchange(
                        SLOT_ARMED,
                        SLOT_COMPLETED,
                        atomic::Ordering::Release,
                        atomic::Ordering::Relaxed,
                    ) {
                        Ok(_) => return,
                        Err(actual) => current = actual,
                    }
                }
                SLOT_AWAITING => {
                    // There is a continuation to wake. We first enter the signaling
                    // state, which grants us exclusive access to the waker cell.
                    //
                    // We use Acquire ordering on success because we are acquiring
                    // the synchronization block of `awaiter`.
                    match self.state.compare_exchange(
                        SLOT_AWAITING,
                        SLOT_SIGNALING,
                        atomic::Ordering::Acquire,
                        atomic::Ordering::Relaxed,
                    ) {
                        Ok(_) => {
                            // SAFETY: The `signaling` state acts as a mutex over the
                            // waker cell - the waiter cannot touch it until we store
                            // a new state. Coming from `awaiting` guarantees the
                            // cell is initialized.
                            let waker = unsafe { self.take_awaiter() };

                            // The waiter may return the moment this store lands, so
                            // it must be our last access to the slot state.
                            //
                            // We use Release ordering because we are releasing the
                            // synchronization block of `awaiter`.
                            self.state
                                .store(SLOT_COMPLETED, atomic::Ordering::Release);

                            // Come and get it. If the waiter already returned on its
                            // own, this wake is simply a no-op.
                            waker.wake();
                            return;
                        }
                        Err(actual) => current = actual,
                    }
                }
                SLOT_AVAILABLE | SLOT_COMPLETED => {
                    // A late notification: the wait was already completed and possibly
                    // already consumed. Nothing to do.
                    return;
                }
                state => {
                    unreachable!("unreachable wait slot state on complete: {state}");
                }
            }
        }
    }

    /// Polls the slot, either registering `waker` to be woken on completion or
    /// consuming the completed wait.
    ///
    /// Returns `None` if the wait is still in progress (the waker is registered and
    /// will be woken exactly once). Returns `Some` with the armed parameters once the
    /// wait has completed; this consumes the result, advances the generation and
    /// releases the slot for reuse, so it can happen only once per cycle.
    ///
    /// # Panics
    ///
    /// Panics if `generation` does not match the slot's current generation (the
    /// handle outlived its cycle) or if the slot is not armed at all.
    pub(crate) fn poll_wait(&self, waker: &Waker, generation: u16) -> Option<ArmedWait> {
        assert!(
            self.generation.load(atomic::Ordering::Relaxed) == generation,
            "wait handle polled with a stale generation token - \
             its result was already consumed and the slot has been reused"
        );

        // We use Acquire because we are (depending on the state) acquiring the
        // synchronization block for `awaiter` and/or `wait`.
        match self.state.load(atomic::Ordering::Acquire) {
            SLOT_ARMED => self.poll_armed(waker),
            SLOT_AWAITING => self.poll_awaiting(waker),
            SLOT_SIGNALING => {
                self.wait_out_signaling();
                Some(self.consume())
            }
            SLOT_COMPLETED => Some(self.consume()),
            SLOT_AVAILABLE => {
                panic!("wait handle polled while its slot is not armed");
            }
            state => {
                unreachable!("unreachable wait slot state on poll: {state}");
            }
        }
    }

    /// `poll_wait()` impl for the `armed` state.
    fn poll_armed(&self, waker: &Waker) -> Option<ArmedWait> {
        // SAFETY: In the `armed` state only the waiter may touch the waker cell, and
        // the waiter is a single logical consumer performing one operation at a time,
        // so we hold the only reference right now.
        unsafe {
            (*self.awaiter.get()).write(waker.clone());
        }

        // The notifier is concurrently racing us to `completed`.
        // We use Release ordering on success because we are releasing the
        // synchronization block of `awaiter` to the notifier.
        // We use Acquire ordering on failure because on a lost race we acquire the
        // synchronization block of the completed state.
        match self.state.compare_exchange(
            SLOT_ARMED,
            SLOT_AWAITING,
            atomic::Ordering::Release,
            atomic::Ordering::Acquire,
        ) {
            Ok(_) => {
                // The notifier will wake us when the wait completes.
                None
            }
            Err(SLOT_COMPLETED) => {
                // The notifier completed the wait while we were registering. Our
                // waker was never published, so we must destroy it ourselves and
                // resume immediately.

                // SAFETY: The notifier is done with the slot once it stores
                // `completed`, so we have exclusive access again. We just wrote a
                // waker into the cell, so it is initialized.
                drop(unsafe { self.take_awaiter() });

                Some(self.consume())
            }
            Err(state) => {
                unreachable!(
                    "unreachable wait slot state on poll state transition that followed armed: {state}"
                );
            }
        }
    }

    /// `poll_wait()` impl for the `awaiting` state.
    fn poll_awaiting(&self, waker: &Waker) -> Option<ArmedWait> {
        // We are re-polling after previously registering a waker. Only the waker
        // from the most recent poll may be woken, so the old one must be replaced.
        //
        // The danger is that the notifier may be extracting the old waker at this
        // very moment. We cannot touch the waker cell while that is possible, so we
        // first step back into the `armed` state, which excludes the notifier from
        // the cell, and only then swap wakers.
        //
        // We use Relaxed on both success and failure because we do not yet change
        // externally visible state, merely continue to use our already acquired
        // `awaiter` field that the notifier cannot acquire from `armed`.
        match self.state.compare_exchange(
            SLOT_AWAITING,
            SLOT_ARMED,
            atomic::Ordering::Relaxed,
            atomic::Ordering::Relaxed,
        ) {
            Ok(_) => {
                // SAFETY: We are back in `armed`, which makes it invalid for the
                // notifier to touch the waker cell; coming from `awaiting`
                // guarantees the cell holds the waker of the previous poll.
                drop(unsafe { self.take_awaiter() });

                // Now continue exactly as if this were the first poll.
                self.poll_armed(waker)
            }
            Err(SLOT_SIGNALING | SLOT_COMPLETED) => {
                // The notifier beat us to it - the wake-up is already under way (or
                // delivered) using the previously registered waker. All we can do is
                // wait out the handover and consume the result.
                self.wait_out_signaling();
                Some(self.consume())
            }
            Err(state) => {
                unreachable!(
                    "unreachable wait slot state on poll state transition that followed awaiting: {state}"
                );
            }
        }
    }

    /// Spins until the notifier finishes its `signaling -> completed` handover.
    ///
    /// The handover is just a few instructions on the notifier side, so a spin is
    /// appropriate here.
    fn wait_out_signaling(&self) {
        loop {
            let state = self.state.load(atomic::Ordering::Relaxed);

            if state != SLOT_SIGNALING {
                debug_assert_eq!(state, SLOT_COMPLETED);
                break;
            }

            spin_loop();
        }

        // The store that ends the signaling state has Release semantics, so we need
        // an Acquire fence to observe all its effects.
        atomic::fence(atomic::Ordering::Acquire);
    }

    /// Consumes the completed wait: takes the armed parameters, advances the
    /// generation and releases the slot for the next cycle.
    ///
    /// Assumes acquired synchronization block for the `completed` state.
    fn consume(&self) -> ArmedWait {
        // SAFETY: The wait is completed and we are the owning waiter, so nothing
        // else can access `wait` until the slot is rearmed - which only we can do.
        let armed = unsafe { (*self.wait.get()).take() }
            .expect("completed wait slot is missing its armed parameters");

        // A handle from this cycle becomes invalid the moment the result leaves the
        // slot. The generation must therefore advance before the slot is released.
        self.generation.fetch_add(1, atomic::Ordering::Relaxed);

        // We use Release ordering because we are releasing the synchronization
        // block of `wait` to whoever arms the next cycle.
        self.state.store(SLOT_AVAILABLE, atomic::Ordering::Release);

        armed
    }

    /// Takes the waker out of the cell, leaving it uninitialized.
    ///
    /// # Safety
    ///
    /// Assumes acquired synchronization block for `awaiter`.
    /// Assumes there is a waker in `awaiter`.
    unsafe fn take_awaiter(&self) -> Waker {
        // SAFETY: Forwarding guarantees from the caller.
        let awaiter_cell = unsafe {
            self.awaiter
                .get()
                .as_ref()
                .expect("UnsafeCell pointer is never null")
        };

        // SAFETY: Forwarding guarantees from the caller.
        unsafe { awaiter_cell.assume_init_read() }
    }
}

impl Drop for AsyncWaitSlot {
    fn drop(&mut self) {
        // A slot dropped mid-wait may still hold a registered waker, which lives in
        // a MaybeUninit and would otherwise leak.
        if *self.state.get_mut() == SLOT_AWAITING {
            // SAFETY: We hold the only reference and the `awaiting` state guarantees
            // the cell is initialized.
            unsafe {
                self.awaiter.get_mut().assume_init_drop();
            }
        }
    }
}

impl fmt::Debug for AsyncWaitSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncWaitSlot")
            .field("state", &self.state.load(atomic::Ordering::Relaxed))
            .field(
                "generation",
                &self.generation.load(atomic::Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

// SAFETY: We are a synchronization primitive, so we do our own synchronization.
unsafe impl Sync for AsyncWaitSlot {}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::test_utils::with_watchdog;

    assert_impl_all!(AsyncWaitSlot: Send, Sync);

    fn armed_slot(target: i64) -> (AsyncWaitSlot, u16) {
        let slot = AsyncWaitSlot::new();
        let generation = slot.arm(target, Arc::new(Sequence::new()));
        (slot, generation)
    }

    #[test]
    fn complete_then_poll_resolves_immediately() {
        let (slot, generation) = armed_slot(3);

        slot.complete();

        let armed = slot.poll_wait(Waker::noop(), generation);
        assert_eq!(armed.map(|a| a.target), Some(3));
    }

    #[test]
    fn poll_then_complete_wakes_and_resolves() {
        let (slot, generation) = armed_slot(7);

        assert!(slot.poll_wait(Waker::noop(), generation).is_none());

        slot.complete();

        let armed = slot.poll_wait(Waker::noop(), generation);
        assert_eq!(armed.map(|a| a.target), Some(7));
    }

    #[test]
    fn repolling_replaces_the_waker() {
        let (slot, generation) = armed_slot(1);

        assert!(slot.poll_wait(Waker::noop(), generation).is_none());
        assert!(slot.poll_wait(Waker::noop(), generation).is_none());

        slot.complete();

        assert!(slot.poll_wait(Waker::noop(), generation).is_some());
    }

    #[test]
    fn slot_is_reusable_across_generations() {
        let slot = AsyncWaitSlot::new();
        let dependent = Arc::new(Sequence::new());

        for target in 0..100 {
            let generation = slot.arm(target, Arc::clone(&dependent));
            slot.complete();
            let armed = slot
                .poll_wait(Waker::noop(), generation)
                .expect("completed wait must resolve");
            assert_eq!(armed.target, target);
        }
    }

    #[test]
    fn generations_advance_every_cycle() {
        let slot = AsyncWaitSlot::new();
        let dependent = Arc::new(Sequence::new());

        let first = slot.arm(0, Arc::clone(&dependent));
        slot.complete();
        drop(slot.poll_wait(Waker::noop(), first));

        let second = slot.arm(1, dependent);
        assert_ne!(first, second);
    }

    #[test]
    #[should_panic]
    fn panics_on_double_arm() {
        let (slot, _generation) = armed_slot(1);

        // Should panic - the previous wait has not been consumed.
        let _second = slot.arm(2, Arc::new(Sequence::new()));
    }

    #[test]
    #[should_panic]
    fn panics_on_stale_generation() {
        let slot = AsyncWaitSlot::new();
        let dependent = Arc::new(Sequence::new());

        let first = slot.arm(0, Arc::clone(&dependent));
        slot.complete();
        drop(slot.poll_wait(Waker::noop(), first));

        let _second = slot.arm(1, dependent);
        slot.complete();

        // Should panic - this handle belongs to the previous cycle.
        drop(slot.poll_wait(Waker::noop(), first));
    }

    #[test]
    #[should_panic]
    fn panics_on_double_consume() {
        let (slot, generation) = armed_slot(1);

        slot.complete();
        drop(slot.poll_wait(Waker::noop(), generation));

        // Should panic - the result was already consumed and the generation moved on.
        drop(slot.poll_wait(Waker::noop(), generation));
    }

    #[test]
    fn late_complete_is_a_no_op() {
        let (slot, generation) = armed_slot(1);

        slot.complete();
        drop(slot.poll_wait(Waker::noop(), generation));

        // The wait is long gone; a straggler notification must do nothing.
        slot.complete();

        // And the slot must still be armable afterwards.
        let generation = slot.arm(2, Arc::new(Sequence::new()));
        slot.complete();
        assert!(slot.poll_wait(Waker::noop(), generation).is_some());
    }

    #[test]
    fn registration_racing_completion_resolves() {
        with_watchdog(|| {
            // Hammer the arm/register vs complete race from two threads. Whatever
            // the interleaving, every cycle must resolve exactly once.
            let slot = Arc::new(AsyncWaitSlot::new());
            let dependent = Arc::new(Sequence::new());
            let start = Arc::new(Barrier::new(2));

            let notifier_slot = Arc::clone(&slot);
            let notifier_start = Arc::clone(&start);
            let ready = Arc::new(Barrier::new(2));
            let notifier_ready = Arc::clone(&ready);

            let notifier = thread::spawn(move || {
                for _ in 0..1000 {
                    notifier_ready.wait();
                    notifier_slot.complete();
                    notifier_start.wait();
                }
            });

            for iteration in 0..1000 {
                let generation = slot.arm(iteration, Arc::clone(&dependent));
                ready.wait();

                // Race the registration against the completion.
                let mut resolved = slot.poll_wait(Waker::noop(), generation);
                while resolved.is_none() {
                    thread::yield_now();
                    resolved = slot.poll_wait(Waker::noop(), generation);
                }
                assert_eq!(resolved.map(|armed| armed.target), Some(iteration));

                start.wait();
            }

            notifier.join().unwrap();
        });
    }
}
