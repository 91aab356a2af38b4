//! Synchronization primitives shared by the pools

use std::sync::{Condvar, Mutex};

/// A counting semaphore built from a mutex and a condition variable.
///
/// Backs the database pool's blocking acquire: the count tracks free
/// handles, `acquire` blocks while it is zero.
#[derive(Debug)]
pub struct Semaphore {
    count: Mutex<usize>,
    available: Condvar,
}

impl Semaphore {
    /// Creates a semaphore holding `permits` initial permits.
    pub fn new(permits: usize) -> Self {
        Self {
            count: Mutex::new(permits),
            available: Condvar::new(),
        }
    }

    /// Takes one permit, blocking until one is available.
    pub fn acquire(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.available.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Returns one permit and wakes a single waiter.
    pub fn release(&self) {
        let mut count = self.count.lock().unwrap();
        *count += 1;
        self.available.notify_one();
    }

    /// Current permit count. Only meaningful when no thread is mid-acquire.
    pub fn permits(&self) -> usize {
        *self.count.lock().unwrap()
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::Semaphore;

    #[test]
    fn semaphore_counts_acquires_and_releases() {
        let sem = Semaphore::new(2);
        sem.acquire();
        sem.acquire();
        assert_eq!(0, sem.permits());
        sem.release();
        assert_eq!(1, sem.permits());
        sem.release();
        assert_eq!(2, sem.permits());
    }

    #[test]
    fn semaphore_acquire_blocks_until_release() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || {
                sem.acquire();
            })
        };

        // The waiter cannot finish while the count is zero.
        thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        sem.release();
        waiter.join().unwrap();
        assert_eq!(0, sem.permits());
    }
}
