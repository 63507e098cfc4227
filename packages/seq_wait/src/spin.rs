//! The confirmation spin performed after a wake-up.
//!
//! A broadcast wake-up only promises that the producer cursor moved; the waiter's own
//! dependent sequence (which may be a downstream stage's progress counter) can lag
//! behind for a short moment. Every released waiter therefore confirms its specific
//! dependent sequence before reporting success.

use std::hint;
use std::thread;

use tokio_util::sync::CancellationToken;

use crate::{Cancelled, Sequence};

/// Spin iterations before each yield to the OS scheduler.
///
/// The gap being covered is another stage finishing a handful of instructions, so a
/// short spin-loop-hint phase usually suffices; yielding keeps us honest on shared
/// cores when it does not.
const SPIN_TRIES: u32 = 100;

/// Waits until `dependent` reaches `target`, returning the observed value.
///
/// Spins with a CPU relax hint for a bounded number of tries, then yields the thread,
/// repeating until the dependent sequence catches up. Cancellation is polled on every
/// iteration and wins over progress.
pub(crate) fn confirm_dependent(
    target: i64,
    dependent: &Sequence,
    cancel: &CancellationToken,
) -> Result<i64, Cancelled> {
    let mut spins = 0_u32;

    loop {
        if cancel.is_cancelled() {
            return Err(Cancelled);
        }

        let current = dependent.value();
        if current >= target {
            return Ok(current);
        }

        if spins < SPIN_TRIES {
            hint::spin_loop();
            spins = spins.wrapping_add(1);
        } else {
            thread::yield_now();
            spins = 0;
        }
    }
}
