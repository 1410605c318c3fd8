//! Bus messages published by the gateway
//!
//! Payloads are JSON. [`Publisher`] maps each message type to its
//! configured topic; the transport behind it is an [`EventPublisher`].

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::clients::ResourceKind;
use crate::config::TopicConfig;
use crate::error::Result;
use crate::worker::queue::WorkQueue;

/// Transport for bus messages
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaAttachment {
    pub media_id: String,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomingCallEventType {
    Answered,
    Unanswered,
    LeftVoicemail,
    LeftUrgentVoicemail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutgoingCallEventType {
    Placed,
    Answered,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingCallEvent {
    pub event_type: IncomingCallEventType,
    pub duration_secs: u32,
    #[serde(default)]
    pub voicemail_media_id: String,
    #[serde(default)]
    pub voicemail_duration_ns: u64,
    #[serde(default)]
    pub transcription_text: String,
}

impl IncomingCallEvent {
    pub fn new(event_type: IncomingCallEventType, duration_secs: u32) -> Self {
        Self {
            event_type,
            duration_secs,
            voicemail_media_id: String::new(),
            voicemail_duration_ns: 0,
            transcription_text: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingCallEvent {
    pub event_type: OutgoingCallEventType,
    pub duration_secs: u32,
    pub caller_entity_id: String,
    pub callee_entity_id: String,
}

/// Channel-specific body of an [`ExternalMessage`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExternalMessageItem {
    Sms {
        text: String,
        attachments: Vec<MediaAttachment>,
    },
    Email {
        subject: String,
        body: String,
        attachments: Vec<MediaAttachment>,
    },
    IncomingCallEvent(IncomingCallEvent),
    OutgoingCallEvent(OutgoingCallEvent),
}

/// Normalized inbound or outbound communication
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalMessage {
    pub from_channel_id: String,
    pub to_channel_id: String,
    /// Unix seconds
    pub timestamp: u64,
    pub direction: Direction,
    pub item: ExternalMessageItem,
}

/// Ask the resource cleaner to delete a provider-side resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResourceRequest {
    pub kind: ResourceKind,
    pub resource_id: String,
}

/// A raw message was stored and awaits normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncomingRawMessageNotification {
    pub id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServiceEventType {
    ProvisionedEndpoint,
}

/// Service-level notification (endpoint provisioned, ...)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub event_type: ServiceEventType,
    pub entity_id: String,
    pub endpoint_type: crate::types::EndpointType,
    pub endpoint: String,
}

/// Typed front of an [`EventPublisher`]
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn EventPublisher>,
    topics: TopicConfig,
}

impl Publisher {
    pub fn new(transport: Arc<dyn EventPublisher>, topics: TopicConfig) -> Self {
        Self { transport, topics }
    }

    async fn send<T: Serialize>(&self, topic: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.transport.publish(topic, payload).await
    }

    pub async fn external_message(&self, message: &ExternalMessage) -> Result<()> {
        self.send(&self.topics.external_message, message).await
    }

    pub async fn raw_message_stored(&self, id: u64) -> Result<()> {
        self.send(&self.topics.incoming_raw_message, &IncomingRawMessageNotification { id })
            .await
    }

    pub async fn service_event(&self, event: &ServiceEvent) -> Result<()> {
        self.send(&self.topics.service_events, event).await
    }

    /// Request deletion of a provider resource. Failures are logged, never
    /// returned; an empty id is ignored.
    pub async fn cleanup(&self, kind: ResourceKind, resource_id: &str) {
        if resource_id.is_empty() {
            return;
        }
        let request = DeleteResourceRequest {
            kind,
            resource_id: resource_id.to_string(),
        };
        if let Err(e) = self.send(&self.topics.resource_cleanup, &request).await {
            error!(kind = kind.as_str(), resource_id, "Failed to publish cleanup request: {}", e);
        }
    }
}

/// Publisher that keeps every message, for tests.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, Vec<u8>)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoded messages published to `topic`, in order.
    pub fn messages<T: for<'de> Deserialize<'de>>(&self, topic: &str) -> Vec<T> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .filter_map(|(_, payload)| serde_json::from_slice(payload).ok())
            .collect()
    }

    pub fn count(&self, topic: &str) -> usize {
        self.published.lock().iter().filter(|(t, _)| t == topic).count()
    }

    pub fn clear(&self) {
        self.published.lock().clear();
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.published.lock().push((topic.to_string(), payload));
        Ok(())
    }
}

/// In-process bus: topics with a consuming worker are pushed onto that
/// worker's queue, everything else is logged.
#[derive(Default)]
pub struct QueuePublisher {
    routes: Vec<(String, Arc<dyn WorkQueue>)>,
}

impl QueuePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, topic: impl Into<String>, queue: Arc<dyn WorkQueue>) -> Self {
        self.routes.push((topic.into(), queue));
        self
    }
}

#[async_trait]
impl EventPublisher for QueuePublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let mut routed = false;
        for (_, queue) in self.routes.iter().filter(|(t, _)| t == topic) {
            queue.send(payload.clone()).await?;
            routed = true;
        }
        if !routed {
            debug!(topic, "📤 {}", String::from_utf8_lossy(&payload));
        }
        Ok(())
    }
}
