//! Shared helpers for tests that exercise blocking and suspended waiters.

#[cfg(test)]
use std::panic;
#[cfg(test)]
use std::sync::mpsc;
#[cfg(test)]
use std::thread;
#[cfg(test)]
use std::time::Duration;

/// How long a watched test body may run before we declare it stalled.
#[cfg(test)]
const WATCHDOG_DURATION: Duration = Duration::from_secs(10);

/// Runs a test body on a worker thread and converts a hang into a timely panic.
///
/// A coordination bug in this crate rarely produces a wrong value; it produces a
/// waiter that no broadcast ever releases, which under a plain test harness means
/// waiting for the CI-level timeout. Wrapping the body here caps the damage at
/// [`WATCHDOG_DURATION`] and names the likely cause.
#[cfg(test)]
pub(crate) fn with_watchdog<F, R>(body: F) -> R
where
    F: FnOnce() -> R + Send + 'static,
    R: Send + 'static,
{
    let (outcome_tx, outcome_rx) = mpsc::channel();

    let worker = thread::spawn(move || {
        // A send failure means the watchdog already gave up on us; nothing to do.
        drop(outcome_tx.send(body()));
    });

    match outcome_rx.recv_timeout(WATCHDOG_DURATION) {
        Ok(outcome) => {
            worker
                .join()
                .expect("worker already sent its outcome, so it cannot have panicked");
            outcome
        }
        Err(mpsc::RecvTimeoutError::Timeout) => {
            panic!("test stalled - a waiter was probably never released by a broadcast");
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => {
            // The worker dropped its channel end without sending, which only
            // happens when the body panicked. Surface that panic as our own.
            match worker.join() {
                Ok(()) => unreachable!("worker cannot finish without sending its outcome"),
                Err(cause) => panic::resume_unwind(cause),
            }
        }
    }
}
