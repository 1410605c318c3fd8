//! # Background workers
//!
//! Queue consumers run as a pool of loops over a [`WorkQueue`]:
//!
//! - [`raw_message::IncomingRawMessageWorker`] normalizes stored raw
//!   messages into external messages
//! - [`transcription::TranscriptionTracker`] settles voicemail transcription
//!   jobs
//! - [`cleaner::ResourceCleaner`] deletes provider-side resources
//!
//! A handler returns [`Outcome::NotReady`] (or an error) to leave the
//! message on the queue; it is handed out again after the retry delay.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;

pub mod cleaner;
pub mod queue;
pub mod raw_message;
pub mod transcription;

use queue::WorkQueue;

/// What to do with a handled message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Done; remove it from the queue
    Ack,
    /// Not processed yet; let it reappear
    NotReady,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, body: &[u8]) -> Result<Outcome>;
}

/// Consumer pool settings
#[derive(Debug, Clone, Copy)]
pub struct WorkerOptions {
    pub concurrency: usize,
    /// How long a receive waits for a message
    pub poll_wait: Duration,
    /// Delay before an unacknowledged message is handed out again
    pub retry_delay: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            concurrency: 2,
            poll_wait: Duration::from_secs(1),
            retry_delay: Duration::from_secs(60),
        }
    }
}

/// Receive one message and handle it. `None` when the queue had nothing
/// visible within `wait`.
pub async fn process_next(
    queue: &dyn WorkQueue,
    handler: &dyn MessageHandler,
    wait: Duration,
    retry_delay: Duration,
) -> Result<Option<Outcome>> {
    let Some(delivery) = queue.receive(wait).await? else {
        return Ok(None);
    };

    let outcome = match handler.handle(&delivery.body).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                worker = handler.name(),
                receive_count = delivery.receive_count,
                "Failed to process message: {}",
                e
            );
            Outcome::NotReady
        }
    };

    match outcome {
        Outcome::Ack => queue.ack(delivery.receipt).await?,
        Outcome::NotReady => queue.retry_after(delivery.receipt, retry_delay).await?,
    }
    Ok(Some(outcome))
}

/// Start `options.concurrency` consumer loops that stop when `cancel` fires.
pub fn spawn_workers(
    queue: Arc<dyn WorkQueue>,
    handler: Arc<dyn MessageHandler>,
    options: WorkerOptions,
    cancel: CancellationToken,
) -> Vec<JoinHandle<()>> {
    info!(
        worker = handler.name(),
        concurrency = options.concurrency,
        "🚀 Starting worker pool"
    );
    (0..options.concurrency.max(1))
        .map(|n| {
            let queue = queue.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            debug!(worker = handler.name(), n, "Worker stopped");
                            break;
                        }
                        result = process_next(
                            queue.as_ref(),
                            handler.as_ref(),
                            options.poll_wait,
                            options.retry_delay,
                        ) => {
                            if let Err(e) = result {
                                warn!(worker = handler.name(), "Queue error: {}", e);
                                tokio::time::sleep(options.poll_wait).await;
                            }
                        }
                    }
                }
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExcommsError;
    use queue::MemoryQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Flaky {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn handle(&self, _body: &[u8]) -> Result<Outcome> {
            match self.calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(ExcommsError::upstream("down")),
                1 => Ok(Outcome::NotReady),
                _ => Ok(Outcome::Ack),
            }
        }
    }

    #[tokio::test]
    async fn errors_and_not_ready_leave_the_message_queued() {
        let queue = MemoryQueue::new(Duration::from_secs(60));
        let handler = Flaky {
            calls: AtomicUsize::new(0),
        };
        queue.send(b"m".to_vec()).await.unwrap();

        for expected in [Outcome::NotReady, Outcome::NotReady, Outcome::Ack] {
            let outcome = process_next(&queue, &handler, Duration::ZERO, Duration::ZERO)
                .await
                .unwrap();
            assert_eq!(outcome, Some(expected));
        }
        assert!(queue.is_empty());
        assert_eq!(process_next(&queue, &handler, Duration::ZERO, Duration::ZERO).await.unwrap(), None);
    }

    #[tokio::test]
    async fn workers_stop_on_cancel() {
        let queue: Arc<dyn WorkQueue> = Arc::new(MemoryQueue::new(Duration::from_secs(60)));
        let handler: Arc<dyn MessageHandler> = Arc::new(Flaky {
            calls: AtomicUsize::new(2),
        });
        let cancel = CancellationToken::new();
        let handles = spawn_workers(
            queue.clone(),
            handler,
            WorkerOptions {
                concurrency: 2,
                poll_wait: Duration::from_millis(10),
                retry_delay: Duration::ZERO,
            },
            cancel.clone(),
        );
        queue.send(b"m".to_vec()).await.unwrap();
        cancel.cancel();
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
        }
    }
}
