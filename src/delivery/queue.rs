//! Bounded ingest queue
//!
//! Many producers offer records without ever blocking; the single delivery
//! worker polls or drains them. When the queue is full the incoming record is
//! dropped and counted.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::span::SpanRecord;

/// Bounded MPSC queue of pending span records
#[derive(Debug)]
pub struct IngestQueue {
    records: Mutex<VecDeque<SpanRecord>>,
    capacity: usize,
    dropped: AtomicU64,
    available: Notify,
}

impl IngestQueue {
    /// Create a queue holding at most `capacity` records (at least one)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            records: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            dropped: AtomicU64::new(0),
            available: Notify::new(),
        }
    }

    /// Offer a record. Returns false if the queue was full and the record was dropped.
    pub fn offer(&self, record: SpanRecord) -> bool {
        {
            let mut records = self.lock();
            if records.len() >= self.capacity {
                drop(records);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            records.push_back(record);
        }
        self.available.notify_one();
        true
    }

    /// Take the oldest record, waiting up to `timeout` for one to arrive.
    pub async fn poll(&self, timeout: Duration) -> Option<SpanRecord> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(record) = self.lock().pop_front() {
                return Some(record);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.lock().pop_front();
            }
        }
    }

    /// Wait until at least `count` records are queued or `timeout` elapses.
    ///
    /// Returns the queue length observed last.
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let len = self.len();
            if len >= count {
                return len;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.len();
            }
        }
    }

    /// Remove up to `max` records from the front, in order.
    pub fn drain(&self, max: usize) -> Vec<SpanRecord> {
        let mut records = self.lock();
        let take = max.min(records.len());
        records.drain(..take).collect()
    }

    /// Records currently queued
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Fixed capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Records dropped because the queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<SpanRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
