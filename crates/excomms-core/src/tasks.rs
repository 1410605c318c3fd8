//! Best-effort side effects detached from the request that triggered them
//!
//! Each task gets its own timeout and never sees the caller's
//! cancellation. Failures are logged. Tests flip [`set_inline`] so the work
//! completes before the handler returns.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;

static INLINE: AtomicBool = AtomicBool::new(false);

/// Run detached tasks inline (awaited by the caller) when `true`.
pub fn set_inline(inline: bool) {
    INLINE.store(inline, Ordering::SeqCst);
}

pub fn is_inline() -> bool {
    INLINE.load(Ordering::SeqCst)
}

/// Spawner for detached tasks
#[derive(Debug, Clone, Copy)]
pub struct Tasks {
    timeout: Duration,
}

impl Tasks {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Run `fut` on its own task with the configured timeout.
    pub async fn go<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let timeout = self.timeout;
        let run = async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(Ok(())) => debug!(task = name, "Background task done"),
                Ok(Err(e)) => warn!(task = name, "Background task failed: {}", e),
                Err(_) => warn!(task = name, "Background task timed out after {:?}", timeout),
            }
        };
        if is_inline() {
            run.await;
        } else {
            tokio::spawn(run);
        }
    }
}

impl Default for Tasks {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}
