//! # Collaborator interfaces
//!
//! Every service the gateway talks to is reached through a narrow trait so
//! handlers and workers can be driven by the in-memory doubles in
//! [`memory`] under test:
//!
//! - [`Directory`]: organizations, providers and patients with their contacts
//! - [`Settings`]: per-organization configuration values
//! - [`BlobStore`]: media storage
//! - [`TelephonyProvider`]: number management, outbound SMS, resource deletion
//! - [`TranscriptionProvider`]: external voicemail transcription
//! - [`EmailSender`]: outbound email
//! - [`Tracker`]: analytics hook

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ExcommsError, Result};

pub mod memory;
pub mod signer;
pub mod twilio;

pub use signer::UrlSigner;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    Organization,
    /// A provider inside an organization
    Internal,
    /// A patient or other outside party
    External,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ContactType {
    Phone,
    Email,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub contact_type: ContactType,
    pub value: String,
    /// Leased by the gateway rather than owned by the entity
    #[serde(default)]
    pub provisioned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub entity_type: EntityType,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    /// Ids of the organizations this entity belongs to
    #[serde(default)]
    pub memberships: Vec<String>,
    /// Account ids linked to the entity
    #[serde(default)]
    pub account_ids: Vec<String>,
}

impl Entity {
    pub fn display_name(&self) -> Option<&str> {
        self.display_name.as_deref().filter(|n| !n.is_empty())
    }

    /// The phone number provisioned for this entity, if any
    pub fn provisioned_phone(&self) -> Option<&str> {
        self.contacts
            .iter()
            .find(|c| c.provisioned && c.contact_type == ContactType::Phone)
            .map(|c| c.value.as_str())
    }

    /// Phone numbers the entity owns, in directory order
    pub fn personal_phones(&self) -> impl Iterator<Item = &str> {
        self.contacts
            .iter()
            .filter(|c| !c.provisioned && c.contact_type == ContactType::Phone)
            .map(|c| c.value.as_str())
    }

    pub fn is_member_of(&self, organization_id: &str) -> bool {
        self.memberships.iter().any(|m| m == organization_id)
    }
}

/// Organizational directory
#[async_trait]
pub trait Directory: Send + Sync {
    async fn entity(&self, id: &str) -> Result<Option<Entity>>;

    /// Active entities that list `value` among their contacts
    async fn entities_by_contact(&self, value: &str) -> Result<Vec<Entity>>;
}

/// The single organization owning contact `value`
pub async fn organization_by_contact(directory: &dyn Directory, value: &str) -> Result<Entity> {
    let mut orgs: Vec<Entity> = directory
        .entities_by_contact(value)
        .await?
        .into_iter()
        .filter(|e| e.entity_type == EntityType::Organization)
        .collect();
    match orgs.len() {
        1 => Ok(orgs.remove(0)),
        0 => Err(ExcommsError::not_found(format!("no organization for contact {}", value))),
        n => Err(ExcommsError::upstream(format!(
            "expected 1 organization for contact {} but found {}",
            value, n
        ))),
    }
}

/// Entity by id that must exist
pub async fn required_entity(directory: &dyn Directory, id: &str) -> Result<Entity> {
    directory
        .entity(id)
        .await?
        .ok_or_else(|| ExcommsError::not_found(format!("entity {}", id)))
}

/// Setting keys read by the gateway
pub mod keys {
    pub const SEND_CALLS_TO_VOICEMAIL: &str = "send_calls_to_voicemail";
    pub const AFTERHOURS_VOICEMAIL_ENABLED: &str = "afterhours_voicemail_enabled";
    pub const FORWARDING_LIST_TIMEOUT: &str = "forwarding_list_timeout";
    pub const FORWARDING_LIST: &str = "forwarding_list";
    pub const PAUSE_BEFORE_CALL_CONNECT: &str = "pause_before_call_connect";
    pub const EXPOSE_CALLER: &str = "expose_caller";
    pub const CALL_SCREENING_ENABLED: &str = "call_screening_enabled";
    pub const TRANSCRIBE_VOICEMAIL: &str = "transcribe_voicemail";
    pub const TRANSCRIPTION_PROVIDER: &str = "transcription_provider";
    pub const VOICEMAIL_OPTION: &str = "voicemail_option";
    pub const AFTERHOURS_GREETING_OPTION: &str = "afterhours_greeting_option";

    pub const VOICEMAIL_OPTION_DEFAULT: &str = "voicemail_option_default";
    pub const VOICEMAIL_OPTION_CUSTOM: &str = "voicemail_option_custom";
    pub const TRANSCRIPTION_PROVIDER_TELEPHONY: &str = "transcription_provider_telephony";
    pub const TRANSCRIPTION_PROVIDER_EXTERNAL: &str = "transcription_provider_external";
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConfigKey {
    pub key: String,
    pub subkey: Option<String>,
}

impl ConfigKey {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            subkey: None,
        }
    }

    pub fn with_subkey(key: &str, subkey: &str) -> Self {
        Self {
            key: key.to_string(),
            subkey: Some(subkey.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum SettingValue {
    Boolean(bool),
    Integer(i64),
    StringList(Vec<String>),
    /// Chosen option id and its free-text response
    SingleSelect { id: String, free_text: String },
}

impl SettingValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_string_list(&self) -> Option<&[String]> {
        match self {
            Self::StringList(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_single_select(&self) -> Option<(&str, &str)> {
        match self {
            Self::SingleSelect { id, free_text } => Some((id, free_text)),
            _ => None,
        }
    }
}

/// Per-node configuration values
#[async_trait]
pub trait Settings: Send + Sync {
    /// One value per key, in key order.
    async fn get_values(&self, node_id: &str, keys: &[ConfigKey]) -> Result<Vec<SettingValue>>;
}

async fn single_value(settings: &dyn Settings, node_id: &str, key: ConfigKey) -> Result<SettingValue> {
    let name = key.key.clone();
    settings
        .get_values(node_id, &[key])
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| ExcommsError::upstream(format!("no value for setting {} of {}", name, node_id)))
}

pub async fn get_boolean(settings: &dyn Settings, node_id: &str, key: ConfigKey) -> Result<bool> {
    let name = key.key.clone();
    single_value(settings, node_id, key)
        .await?
        .as_bool()
        .ok_or_else(|| ExcommsError::upstream(format!("setting {} is not a boolean", name)))
}

/// Chosen option of a single-select setting as (id, free text)
pub async fn get_single_select(
    settings: &dyn Settings,
    node_id: &str,
    key: ConfigKey,
) -> Result<(String, String)> {
    let name = key.key.clone();
    match single_value(settings, node_id, key).await? {
        SettingValue::SingleSelect { id, free_text } => Ok((id, free_text)),
        _ => Err(ExcommsError::upstream(format!("setting {} is not a single select", name))),
    }
}

/// Object storage for media
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `data` under `id` and return its URL.
    async fn put(
        &self,
        id: &str,
        data: Vec<u8>,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) -> Result<String>;

    /// Time-limited URL for a stored object
    async fn expiring_url(&self, id: &str, ttl: Duration) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TranscriptionJobStatus {
    Submitted,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptionResult {
    pub status: TranscriptionJobStatus,
    pub text: String,
}

#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    /// Submit the media at `media_url` and return the provider's job id.
    async fn submit(&self, media_url: &str) -> Result<String>;

    async fn job(&self, job_id: &str) -> Result<TranscriptionResult>;
}

/// Purchasable number returned by a search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailableNumber {
    pub phone_number: String,
    pub friendly_name: String,
    pub capabilities: Vec<String>,
}

/// What to buy: any number in an area code or one specific number
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NumberRequest {
    AreaCode(String),
    Number(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct OutboundSms {
    pub from: String,
    pub to: String,
    pub body: String,
    pub media_urls: Vec<String>,
}

/// Telephony provider kinds of deletable resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Call,
    Sms,
    Media,
    Recording,
    Transcription,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Call => "call",
            Self::Sms => "sms",
            Self::Media => "media",
            Self::Recording => "recording",
            Self::Transcription => "transcription",
        }
    }
}

#[async_trait]
pub trait TelephonyProvider: Send + Sync {
    async fn search_available_numbers(
        &self,
        area_code: &str,
        capabilities: &[String],
    ) -> Result<Vec<AvailableNumber>>;

    /// Purchase a number. Rejections carry the provider's error code, see
    /// [`twilio::codes`].
    async fn purchase_number(&self, request: &NumberRequest) -> Result<String>;

    async fn release_number(&self, number: &str) -> Result<()>;

    /// Send an SMS and return the provider's message id.
    async fn send_sms(&self, sms: &OutboundSms) -> Result<String>;

    /// Delete a call, message, media item, recording or transcription.
    async fn delete_resource(&self, kind: ResourceKind, resource_id: &str) -> Result<()>;

    /// Download media hosted by the provider. A 404 is
    /// [`ExcommsError::MediaNotFound`].
    async fn fetch_media(&self, url: &str) -> Result<FetchedMedia>;
}

/// Media downloaded from the telephony provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMedia {
    pub data: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct OutboundEmail {
    pub from_name: String,
    pub from_email: String,
    pub to_email: String,
    pub subject: String,
    pub body: String,
    pub attachment_urls: Vec<String>,
}

#[async_trait]
pub trait EmailSender: Send + Sync {
    /// Send and return the provider's message id.
    async fn send(&self, email: &OutboundEmail) -> Result<String>;
}

/// Analytics event
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackEvent {
    pub event: String,
    pub subject: String,
    pub properties: HashMap<String, String>,
}

/// Fire-and-forget analytics
pub trait Tracker: Send + Sync {
    fn track(&self, event: TrackEvent);
}

/// Tracker that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracker;

impl Tracker for LogTracker {
    fn track(&self, event: TrackEvent) {
        tracing::debug!(event = %event.event, subject = %event.subject, "track");
    }
}
