//! Counting semaphore for the level worker handshake
//!
//! `post` never blocks behind the worker; `wait` blocks only the caller.

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(&self) {
        let mut count = self.count.lock();
        *count += 1;
        self.cond.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count == 0 {
            self.cond.wait(&mut count);
        }
        *count -= 1;
    }

    /// Take one count if immediately available.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Drop any pending counts.
    pub fn reset(&self) {
        *self.count.lock() = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_post_then_wait() {
        let sem = Semaphore::new();
        sem.post();
        sem.post();
        assert!(sem.try_wait());
        sem.wait();
        assert!(!sem.try_wait());
    }

    #[test]
    fn test_wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new());
        let sem2 = sem.clone();
        let handle = thread::spawn(move || {
            sem2.wait();
            42
        });
        thread::sleep(std::time::Duration::from_millis(10));
        sem.post();
        assert_eq!(handle.join().unwrap(), 42);
    }

    #[test]
    fn test_reset_drops_counts() {
        let sem = Semaphore::new();
        sem.post();
        sem.reset();
        assert!(!sem.try_wait());
    }
}
