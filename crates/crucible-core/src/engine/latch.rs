//! Countdown latch used as the fan-in point of a run.
//!
//! Each unit counts down once with its resolution. Waiters are released when
//! the expected number of resolutions has arrived. Arrivals past that count
//! are kept so the aggregator can detect the mismatch.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::watch;

#[derive(Debug)]
pub struct CountdownLatch<T> {
    expected: usize,
    arrived: AtomicUsize,
    items: Mutex<Vec<T>>,
    open: watch::Sender<bool>,
}

impl<T: Clone> CountdownLatch<T> {
    pub fn new(expected: usize) -> Self {
        let (open, _) = watch::channel(expected == 0);
        Self {
            expected,
            arrived: AtomicUsize::new(0),
            items: Mutex::new(Vec::with_capacity(expected)),
            open,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    pub fn arrived(&self) -> usize {
        self.arrived.load(Ordering::SeqCst)
    }

    pub fn is_open(&self) -> bool {
        *self.open.borrow()
    }

    /// Records one arrival. Returns true for the arrival that opened the latch.
    pub fn count_down(&self, item: T) -> bool {
        self.items.lock().unwrap().push(item);
        let n = self.arrived.fetch_add(1, Ordering::SeqCst) + 1;
        if n == self.expected {
            self.open.send_replace(true);
            true
        } else {
            false
        }
    }

    /// Waits until the latch opens and returns every arrival so far.
    pub async fn wait(&self) -> Vec<T> {
        let mut rx = self.open.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|open| *open).await;
        self.items.lock().unwrap().clone()
    }
}
