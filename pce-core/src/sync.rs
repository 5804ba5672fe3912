//! Thread synchronization primitives used by the simulation scheduler.

use std::sync::{Condvar, Mutex, PoisonError};

/// Counting semaphore.
///
/// `post` increments the count and wakes one waiter; `wait` blocks until the
/// count is non-zero and decrements it.
#[derive(Debug, Default)]
pub struct Semaphore {
    count: Mutex<u32>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: u32) -> Self {
        Self {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_add(1);
        self.cond.notify_one();
    }

    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            count = self.cond.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn posts_accumulate() {
        let sem = Semaphore::new(1);
        sem.post();
        sem.wait();
        sem.wait();
        assert_eq!(*sem.count.lock().unwrap(), 0);
    }

    #[test]
    fn post_wakes_other_thread() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = {
            let sem = sem.clone();
            thread::spawn(move || sem.wait())
        };
        thread::sleep(Duration::from_millis(10));
        sem.post();
        waiter.join().unwrap();
        assert_eq!(*sem.count.lock().unwrap(), 0);
    }
}
