//! Counting wait/release primitive for pause/resume signalling.
//!
//! A release issued while no thread is waiting must not be lost: the feed
//! thread may not have reached its wait point yet when `play` fires. Credits
//! are therefore banked, and the count is observable for tests.

use std::sync::{Condvar, Mutex};

/// Bounded wait/release gate with a saved credit count.
#[derive(Debug, Default)]
pub struct CreditGate {
    credits: Mutex<usize>,
    cv: Condvar,
}

impl CreditGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bank one credit and wake a waiter if one is parked.
    pub fn release(&self) {
        let mut credits = self.credits.lock().unwrap();
        *credits += 1;
        drop(credits);
        self.cv.notify_one();
    }

    /// Block until a credit is available, then consume exactly one.
    pub fn wait(&self) {
        let mut credits = self.credits.lock().unwrap();
        while *credits == 0 {
            credits = self.cv.wait(credits).unwrap();
        }
        *credits -= 1;
    }

    /// Currently banked credits (best-effort snapshot).
    pub fn credits(&self) -> usize {
        *self.credits.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn release_before_wait_is_banked() {
        let gate = CreditGate::new();
        gate.release();
        assert_eq!(gate.credits(), 1);

        // Must not block: the credit was banked.
        gate.wait();
        assert_eq!(gate.credits(), 0);
    }

    #[test]
    fn each_release_wakes_exactly_one_wait() {
        let gate = CreditGate::new();
        gate.release();
        gate.release();
        gate.wait();
        gate.wait();
        assert_eq!(gate.credits(), 0);
    }

    #[test]
    fn wait_blocks_until_release() {
        let gate = Arc::new(CreditGate::new());
        let gate_waiter = gate.clone();
        let (tx, rx) = std::sync::mpsc::channel();

        let handle = thread::spawn(move || {
            let _ = tx.send(());
            gate_waiter.wait();
        });

        let _ = rx.recv();
        gate.release();
        handle.join().unwrap();
        assert_eq!(gate.credits(), 0);
    }
}
