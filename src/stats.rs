//! Transfer counters and a bounded activity ring.
//!
//! One [`Stats`] instance is created by the embedding layer and handed by
//! `Arc` into every component that reports activity; nothing here is
//! process-global.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    System,
}

/// One entry in the activity ring.
#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub direction: Direction,
    pub size: usize,
    pub from: String,
    pub to: String,
    pub note: String,
    pub at: SystemTime,
}

pub struct Stats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    started: Instant,
    capacity: usize,
    records: Mutex<VecDeque<MessageRecord>>,
}

impl Stats {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            started: Instant::now(),
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn add_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_received(&self, n: u64) {
        self.bytes_received.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_sent(&self, size: usize, from: &str, to: &str) {
        self.add_sent(size as u64);
        self.push(Direction::Out, size, from, to, "");
    }

    pub fn record_received(&self, size: usize, from: &str, to: &str) {
        self.add_received(size as u64);
        self.push(Direction::In, size, from, to, "");
    }

    pub fn record_event(&self, note: &str) {
        self.push(Direction::System, 0, "", "", note);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    /// Recorded activity, newest first.
    pub fn recent(&self) -> Vec<MessageRecord> {
        self.records.lock().unwrap().iter().cloned().collect()
    }

    fn push(&self, direction: Direction, size: usize, from: &str, to: &str, note: &str) {
        let mut records = self.records.lock().unwrap();
        records.push_front(MessageRecord {
            direction,
            size,
            from: from.to_owned(),
            to: to.to_owned(),
            note: note.to_owned(),
            at: SystemTime::now(),
        });
        records.truncate(self.capacity);
    }
}
