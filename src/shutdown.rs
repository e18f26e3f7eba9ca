use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

/// Cooperative shutdown flag shared by every long-lived thread: a boolean
/// behind a mutex, with a condvar so sleeping tasks wake up immediately
/// when shutdown is signaled instead of finishing their interval.
pub struct Shutdown {
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown {
            flag: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    fn locked(&self) -> MutexGuard<bool> {
        match self.flag.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn signal(&self) {
        *self.locked() = true;
        self.condvar.notify_all();
    }

    pub fn is_set(&self) -> bool {
        *self.locked()
    }

    /// Sleep up to `timeout`, returning early (true) if shutdown was
    /// signaled meanwhile.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut flag = self.locked();
        let mut remaining = timeout;
        while !*flag {
            let start = std::time::Instant::now();
            let (guard, result) = match self.condvar.wait_timeout(flag, remaining) {
                Ok(v) => v,
                Err(poisoned) => {
                    let inner = poisoned.into_inner();
                    (inner.0, inner.1)
                }
            };
            flag = guard;
            if result.timed_out() {
                return *flag;
            }
            // spurious wakeup: keep waiting for what is left of the timeout
            remaining = remaining.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return *flag;
            }
        }
        true
    }
}
