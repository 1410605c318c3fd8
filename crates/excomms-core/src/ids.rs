//! Dense 64-bit identifiers

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use rand::Rng;

/// Source of dense ids for raw messages, media and other rows.
pub trait IdGenerator: Send + Sync {
    fn next_id(&self) -> u64;
}

// 41 bits of milliseconds since 2020-01-01, 10 bits of node, 12 bits of sequence
const EPOCH_MS: i64 = 1_577_836_800_000;
const NODE_BITS: u32 = 10;
const SEQ_BITS: u32 = 12;

/// Time-ordered 63-bit ids: positive when stored as `i64`.
#[derive(Debug)]
pub struct TimeOrderedIds {
    node: u64,
    last: AtomicU64,
}

impl TimeOrderedIds {
    pub fn new(node: u16) -> Self {
        Self {
            node: u64::from(node) & ((1 << NODE_BITS) - 1),
            last: AtomicU64::new(0),
        }
    }

    /// Node id picked at random; good enough for a single process.
    pub fn random_node() -> Self {
        Self::new(rand::thread_rng().gen_range(0..(1u16 << NODE_BITS)))
    }
}

impl IdGenerator for TimeOrderedIds {
    fn next_id(&self) -> u64 {
        let millis = (Utc::now().timestamp_millis() - EPOCH_MS).max(0) as u64;
        let base = (millis << (NODE_BITS + SEQ_BITS)) | (self.node << SEQ_BITS);
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            // Same millisecond (or clock went backwards): bump the sequence.
            let next = if base > prev { base } else { prev + 1 };
            match self
                .last
                .compare_exchange_weak(prev, next, Ordering::SeqCst, Ordering::Relaxed)
            {
                Ok(_) => return next & (i64::MAX as u64),
                Err(actual) => prev = actual,
            }
        }
    }
}

/// Sequential ids starting at 1. Used in tests for predictable values.
#[derive(Debug, Default)]
pub struct SequentialIds {
    next: AtomicU64,
}

impl IdGenerator for SequentialIds {
    fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst) + 1
    }
}
