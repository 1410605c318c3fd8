//! Excomms gateway server: webhook listener plus queue workers

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use excomms_core::clients::memory::{
    Fixtures, MemoryBlobStore, MemoryEmailSender, MemoryTelephony, MemoryTranscriptionProvider,
};
use excomms_core::clients::twilio::TwilioClient;
use excomms_core::clients::{LogTracker, TelephonyProvider};
use excomms_core::clock::SystemClock;
use excomms_core::events::{Publisher, QueuePublisher};
use excomms_core::ids::TimeOrderedIds;
use excomms_core::logging::{log_welcome, setup_logging, LoggingConfig};
use excomms_core::worker::cleaner::ResourceCleaner;
use excomms_core::worker::queue::{SqlQueue, WorkQueue};
use excomms_core::worker::raw_message::IncomingRawMessageWorker;
use excomms_core::worker::transcription::TranscriptionTracker;
use excomms_core::worker::{spawn_workers, WorkerOptions};
use excomms_core::{create_router, init_database, Collaborators, Context, ExcommsConfig, VERSION};

const TRANSCRIPTION_QUEUE: &str = "track-transcription";
const QUEUE_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "excomms-server")]
#[command(about = "External communications gateway")]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long)]
    config: Option<String>,

    /// Directory entities and settings to serve from memory
    #[arg(short, long)]
    fixtures: Option<String>,

    /// Override the configured log level
    #[arg(short, long)]
    log_level: Option<String>,

    /// Consumer loops per queue
    #[arg(long, default_value = "2")]
    concurrency: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ExcommsConfig::load(args.config.as_deref()).context("loading configuration")?;
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    setup_logging(LoggingConfig::from_settings(&config.logging, "excomms")?)?;
    log_welcome("excomms", VERSION);

    let db = init_database(&config).await.context("opening database")?;

    let fixtures = match &args.fixtures {
        Some(path) => Fixtures::from_file(path)?,
        None => Fixtures::default(),
    };
    let (directory, settings) = fixtures.into_collaborators();

    let telephony: Arc<dyn TelephonyProvider> = if config.telephony.account_sid.is_empty() {
        warn!("No telephony credentials configured, using the in-memory provider");
        Arc::new(MemoryTelephony::new())
    } else {
        Arc::new(TwilioClient::new(&config.telephony))
    };

    let clock = Arc::new(SystemClock);
    let queue = |name: &str| -> Arc<dyn WorkQueue> {
        Arc::new(SqlQueue::new(db.clone(), clock.clone(), name, QUEUE_VISIBILITY_TIMEOUT))
    };
    let raw_queue = queue(&config.topics.incoming_raw_message);
    let cleanup_queue = queue(&config.topics.resource_cleanup);
    let transcription_queue = queue(TRANSCRIPTION_QUEUE);

    let bus = QueuePublisher::new()
        .route(config.topics.incoming_raw_message.clone(), raw_queue.clone())
        .route(config.topics.resource_cleanup.clone(), cleanup_queue.clone());
    let publisher = Publisher::new(Arc::new(bus), config.topics.clone());

    let ctx = Context::new(
        config.clone(),
        db.clone(),
        Collaborators {
            clock: clock.clone(),
            ids: Arc::new(TimeOrderedIds::random_node()),
            directory: Arc::new(directory),
            settings: Arc::new(settings),
            blobs: Arc::new(MemoryBlobStore::new()),
            telephony: telephony.clone(),
            transcription: Arc::new(MemoryTranscriptionProvider::new()),
            email: Arc::new(MemoryEmailSender::new()),
            tracker: Arc::new(LogTracker),
            publisher: publisher.clone(),
            transcription_queue: transcription_queue.clone(),
        },
    );

    let cancel = CancellationToken::new();
    let options = WorkerOptions {
        concurrency: args.concurrency,
        ..Default::default()
    };
    let mut workers = Vec::new();
    workers.extend(spawn_workers(
        raw_queue,
        Arc::new(IncomingRawMessageWorker::new(ctx.clone())),
        options,
        cancel.clone(),
    ));
    workers.extend(spawn_workers(
        cleanup_queue,
        Arc::new(ResourceCleaner::new(db.clone(), telephony, clock.clone())),
        options,
        cancel.clone(),
    ));
    workers.extend(spawn_workers(
        transcription_queue,
        Arc::new(TranscriptionTracker::new(
            db,
            clock,
            ctx.transcription.clone(),
            publisher,
            config.transcription.clone(),
        )),
        WorkerOptions {
            retry_delay: config.transcription.backoff(),
            ..options
        },
        cancel.clone(),
    ));

    let listener = TcpListener::bind(&config.http.bind_address)
        .await
        .with_context(|| format!("binding {}", config.http.bind_address))?;
    info!("🌐 Listening on {}", listener.local_addr()?);

    let shutdown = cancel.clone();
    axum::serve(listener, create_router(ctx))
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for shutdown signal: {}", e);
            }
            info!("🛑 Shutting down");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    info!("✅ Stopped");
    Ok(())
}
