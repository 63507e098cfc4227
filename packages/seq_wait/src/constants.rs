/// Message when a lock is found poisoned.
pub(crate) const ERR_POISONED_LOCK: &str = "a thread panicked while holding the gate lock - \
    the waiter registry may be inconsistent, so continuing could strand a waiter forever";
