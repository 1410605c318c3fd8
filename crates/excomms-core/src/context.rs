//! Shared dependencies of the handlers, workers and the RPC service

use std::sync::Arc;
use std::time::Duration;

use crate::clients::memory::{
    MemoryBlobStore, MemoryDirectory, MemoryEmailSender, MemorySettings, MemoryTelephony, MemoryTracker,
    MemoryTranscriptionProvider,
};
use crate::clients::{
    BlobStore, Directory, EmailSender, Settings, TelephonyProvider, Tracker, TranscriptionProvider, UrlSigner,
};
use crate::clock::{Clock, ManagedClock};
use crate::config::ExcommsConfig;
use crate::database::Database;
use crate::events::{Publisher, RecordingPublisher};
use crate::ids::{IdGenerator, SequentialIds};
use crate::media::MediaUploader;
use crate::proxynumber::ProxyNumberManager;
use crate::tasks::Tasks;
use crate::worker::queue::{MemoryQueue, WorkQueue};

/// Everything a request or queue message may need
#[derive(Clone)]
pub struct Context {
    pub config: Arc<ExcommsConfig>,
    pub db: Database,
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub directory: Arc<dyn Directory>,
    pub settings: Arc<dyn Settings>,
    pub blobs: Arc<dyn BlobStore>,
    pub telephony: Arc<dyn TelephonyProvider>,
    pub transcription: Arc<dyn TranscriptionProvider>,
    pub email: Arc<dyn EmailSender>,
    pub tracker: Arc<dyn Tracker>,
    pub publisher: Publisher,
    /// Queue of voicemails awaiting an external transcription
    pub transcription_queue: Arc<dyn WorkQueue>,
    pub proxy_numbers: ProxyNumberManager,
    pub signer: UrlSigner,
    pub uploader: MediaUploader,
    pub tasks: Tasks,
}

/// Collaborators that are not derived from the database or configuration
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub ids: Arc<dyn IdGenerator>,
    pub directory: Arc<dyn Directory>,
    pub settings: Arc<dyn Settings>,
    pub blobs: Arc<dyn BlobStore>,
    pub telephony: Arc<dyn TelephonyProvider>,
    pub transcription: Arc<dyn TranscriptionProvider>,
    pub email: Arc<dyn EmailSender>,
    pub tracker: Arc<dyn Tracker>,
    pub publisher: Publisher,
    pub transcription_queue: Arc<dyn WorkQueue>,
}

impl Context {
    pub fn new(config: ExcommsConfig, db: Database, c: Collaborators) -> Self {
        let proxy_numbers = ProxyNumberManager::new(db.clone(), c.clock.clone(), &config.proxy_numbers);
        let signer = UrlSigner::new(config.media.api_base.clone(), config.media.signing_key.as_bytes());
        let uploader = MediaUploader::new(c.telephony.clone(), c.blobs.clone(), c.ids.clone());
        let tasks = Tasks::new(Duration::from_secs(config.tasks.timeout_secs));
        Self {
            config: Arc::new(config),
            db,
            clock: c.clock,
            ids: c.ids,
            directory: c.directory,
            settings: c.settings,
            blobs: c.blobs,
            telephony: c.telephony,
            transcription: c.transcription,
            email: c.email,
            tracker: c.tracker,
            publisher: c.publisher,
            transcription_queue: c.transcription_queue,
            proxy_numbers,
            signer,
            uploader,
            tasks,
        }
    }

    /// URL under the public API base for a webhook route
    pub fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.config.http.api_url.trim_end_matches('/'), path)
    }
}

/// Handles on the in-memory collaborators behind a [`Context`]
#[derive(Clone)]
pub struct Doubles {
    pub clock: ManagedClock,
    pub directory: Arc<MemoryDirectory>,
    pub settings: Arc<MemorySettings>,
    pub blobs: Arc<MemoryBlobStore>,
    pub telephony: Arc<MemoryTelephony>,
    pub transcription: Arc<MemoryTranscriptionProvider>,
    pub email: Arc<MemoryEmailSender>,
    pub tracker: Arc<MemoryTracker>,
    pub events: Arc<RecordingPublisher>,
    pub transcription_queue: Arc<MemoryQueue>,
}

impl Doubles {
    /// Fresh doubles with the clock parked at `epoch_secs`
    pub fn new(epoch_secs: i64) -> Self {
        Self {
            clock: ManagedClock::at_epoch_secs(epoch_secs),
            directory: Arc::new(MemoryDirectory::new()),
            settings: Arc::new(MemorySettings::with_defaults()),
            blobs: Arc::new(MemoryBlobStore::new()),
            telephony: Arc::new(MemoryTelephony::new()),
            transcription: Arc::new(MemoryTranscriptionProvider::new()),
            email: Arc::new(MemoryEmailSender::new()),
            tracker: Arc::new(MemoryTracker::new()),
            events: Arc::new(RecordingPublisher::new()),
            transcription_queue: Arc::new(MemoryQueue::new(Duration::from_secs(60))),
        }
    }

    /// A context over `db` wired to these doubles, with sequential ids.
    pub fn context(&self, config: ExcommsConfig, db: Database) -> Context {
        let publisher = Publisher::new(self.events.clone(), config.topics.clone());
        Context::new(
            config,
            db,
            Collaborators {
                clock: Arc::new(self.clock.clone()),
                ids: Arc::new(SequentialIds::default()),
                directory: self.directory.clone(),
                settings: self.settings.clone(),
                blobs: self.blobs.clone(),
                telephony: self.telephony.clone(),
                transcription: self.transcription.clone(),
                email: self.email.clone(),
                tracker: self.tracker.clone(),
                publisher,
                transcription_queue: self.transcription_queue.clone(),
            },
        )
    }
}
