//! Durable-queue semantics for the background workers
//!
//! A received message stays in the queue, invisible, until it is
//! acknowledged. If the handler does not acknowledge it (not ready yet, or
//! failed) it becomes visible again once its visibility timeout lapses.
//!
//! [`SqlQueue`] keeps messages in the gateway database so they survive a
//! restart; [`MemoryQueue`] is process-local.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::clock::{window, Clock};
use crate::database::Database;
use crate::error::Result;

/// One received message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub receipt: u64,
    pub body: Vec<u8>,
    /// How many times the message has been handed out, this time included
    pub receive_count: u32,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    async fn send(&self, body: Vec<u8>) -> Result<()>;

    /// Next visible message, waiting up to `wait` for one to appear.
    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>>;

    /// Remove a handled message.
    async fn ack(&self, receipt: u64) -> Result<()>;

    /// Make a message visible again after `delay`.
    async fn retry_after(&self, receipt: u64, delay: Duration) -> Result<()>;
}

#[derive(Debug)]
struct Entry {
    receipt: u64,
    body: Vec<u8>,
    visible_at: Instant,
    receive_count: u32,
}

/// Process-local queue
#[derive(Debug)]
pub struct MemoryQueue {
    entries: Mutex<VecDeque<Entry>>,
    next_receipt: Mutex<u64>,
    visibility_timeout: Duration,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            next_receipt: Mutex::new(0),
            visibility_timeout,
            notify: Notify::new(),
        }
    }

    /// Messages not yet acknowledged, visible or not
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn take_visible(&self) -> Option<Delivery> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let entry = entries.iter_mut().find(|e| e.visible_at <= now)?;
        entry.visible_at = now + self.visibility_timeout;
        entry.receive_count += 1;
        Some(Delivery {
            receipt: entry.receipt,
            body: entry.body.clone(),
            receive_count: entry.receive_count,
        })
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    async fn send(&self, body: Vec<u8>) -> Result<()> {
        let receipt = {
            let mut next = self.next_receipt.lock();
            *next += 1;
            *next
        };
        self.entries.lock().push_back(Entry {
            receipt,
            body,
            visible_at: Instant::now(),
            receive_count: 0,
        });
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.take_visible() {
                return Ok(Some(delivery));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            // Wake on a new message or re-check periodically for messages
            // whose visibility timeout lapsed.
            let nap = (deadline - now).min(Duration::from_millis(100));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn ack(&self, receipt: u64) -> Result<()> {
        self.entries.lock().retain(|e| e.receipt != receipt);
        Ok(())
    }

    async fn retry_after(&self, receipt: u64, delay: Duration) -> Result<()> {
        if let Some(entry) = self.entries.lock().iter_mut().find(|e| e.receipt == receipt) {
            entry.visible_at = Instant::now() + delay;
        }
        Ok(())
    }
}

/// Queue stored in the `work_queue` table under a queue name
pub struct SqlQueue {
    db: Database,
    clock: Arc<dyn Clock>,
    name: String,
    visibility_timeout: Duration,
    notify: Notify,
}

impl SqlQueue {
    pub fn new(db: Database, clock: Arc<dyn Clock>, name: impl Into<String>, visibility_timeout: Duration) -> Self {
        Self {
            db,
            clock,
            name: name.into(),
            visibility_timeout,
            notify: Notify::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Messages not yet acknowledged, visible or not
    pub async fn len(&self) -> Result<i64> {
        self.db.count_work(&self.name).await
    }

    fn millis_after(&self, delay: Duration) -> i64 {
        (self.clock.now() + window(delay)).timestamp_millis()
    }
}

#[async_trait]
impl WorkQueue for SqlQueue {
    async fn send(&self, body: Vec<u8>) -> Result<()> {
        let now = self.clock.now();
        self.db
            .enqueue_work(&self.name, &body, now.timestamp_millis(), now)
            .await?;
        self.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            let now_ms = self.clock.now().timestamp_millis();
            let hide_until = self.millis_after(self.visibility_timeout);
            if let Some(work) = self.db.claim_work(&self.name, now_ms, hide_until).await? {
                return Ok(Some(Delivery {
                    receipt: work.receipt,
                    body: work.body,
                    receive_count: work.receive_count,
                }));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let nap = (deadline - now).min(Duration::from_millis(250));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }

    async fn ack(&self, receipt: u64) -> Result<()> {
        self.db.delete_work(&self.name, receipt).await?;
        Ok(())
    }

    async fn retry_after(&self, receipt: u64, delay: Duration) -> Result<()> {
        self.db
            .delay_work(&self.name, receipt, self.millis_after(delay))
            .await?;
        Ok(())
    }
}
