//! # Excomms-Core
//!
//! External communications gateway for a healthcare messaging platform.
//!
//! This crate provides:
//! - Proxy-number reservation so providers can call patients from a
//!   practice-owned number
//! - The incoming and outgoing call state machines driven by telephony
//!   provider webhooks
//! - Raw-message ingest for SMS, email and voicemail, and publication of
//!   normalized external messages
//! - The voicemail transcription tracker
//! - The internal RPC surface (provisioning, outbound messages, IP calls)
//!
//! ## Architecture
//!
//! Webhooks persist what they receive and answer quickly; everything slow
//! (media downloads, transcription, provider cleanups) happens in queue
//! workers. Collaborators outside the gateway (directory, settings, blob
//! store, providers, event bus) sit behind traits in [`clients`] and
//! [`events`], with in-memory implementations for tests and local runs.

pub mod api;
pub mod clients;
pub mod clock;
pub mod config;
pub mod context;
pub mod database;
pub mod email;
pub mod error;
pub mod events;
pub mod ids;
pub mod logging;
pub mod media;
pub mod phone;
pub mod proxynumber;
pub mod rawmsg;
pub mod service;
pub mod tasks;
pub mod telephony;
pub mod twiml;
pub mod types;
pub mod worker;

pub use api::create_router;
pub use config::ExcommsConfig;
pub use context::{Collaborators, Context};
pub use database::Database;
pub use error::{ExcommsError, Result};
pub use phone::PhoneNumber;
pub use proxynumber::{ProxyNumberManager, ReserveRequest};
pub use service::ExcommsService;
pub use telephony::{EventsHandler, TwilioEvent};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Open the configured database, creating the schema when missing.
pub async fn init_database(config: &ExcommsConfig) -> Result<Database> {
    Database::connect(&config.database).await
}
