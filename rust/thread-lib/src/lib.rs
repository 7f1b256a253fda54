use std::time::Duration;

use libc::{CPU_SET, CPU_ZERO, cpu_set_t, pthread_self, pthread_setaffinity_np};
use syscalls::Errno;

pub fn pin_cpu(cpu: usize) -> Result<(), Errno> {
    unsafe {
        let mut cpuset = std::mem::zeroed();
        CPU_ZERO(&mut cpuset);
        CPU_SET(cpu, &mut cpuset);
        let ret =
            pthread_setaffinity_np(pthread_self(), size_of::<cpu_set_t>(), &cpuset);
        if ret != 0 {
            return Err(Errno::new(ret));
        }
        Ok(())
    }
}

const SPIN_LIMIT: usize = 4;
const PAUSE_LIMIT: usize = 16;
const YIELD_LIMIT: usize = 32;

/// Cooperative backoff for the `k`-th consecutive retry.
///
/// The first few retries return immediately, then the caller spins, then it
/// yields its timeslice. Past `YIELD_LIMIT` odd rounds still yield while even
/// rounds sleep for a microsecond so a stuck queue cannot monopolise a core.
pub fn yield_k(k: usize) {
    if k < SPIN_LIMIT {
        return;
    }
    if k < PAUSE_LIMIT {
        for _ in 0..(1 << (k - SPIN_LIMIT).min(6)) {
            std::hint::spin_loop();
        }
    } else if k < YIELD_LIMIT || k & 1 == 1 {
        std::thread::yield_now();
    } else {
        std::thread::sleep(Duration::from_micros(1));
    }
}

/// Stateful wrapper around [`yield_k`] for retry loops.
#[derive(Debug, Default)]
pub struct Backoff {
    k: usize,
}

impl Backoff {
    pub fn new() -> Self {
        Self { k: 0 }
    }

    pub fn snooze(&mut self) {
        yield_k(self.k);
        self.k = self.k.saturating_add(1);
    }

    /// Number of retries so far.
    pub fn retries(&self) -> usize {
        self.k
    }

    pub fn reset(&mut self) {
        self.k = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_counts_retries() {
        let mut backoff = Backoff::new();
        for _ in 0..40 {
            backoff.snooze();
        }
        assert_eq!(backoff.retries(), 40);
        backoff.reset();
        assert_eq!(backoff.retries(), 0);
    }

    #[test]
    fn test_yield_k_early_rounds_return() {
        let start = std::time::Instant::now();
        for k in 0..SPIN_LIMIT {
            yield_k(k);
        }
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
