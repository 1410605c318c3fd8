//! Persisted models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ExcommsError, Result};
use crate::phone::PhoneNumber;

/// Kind of leased endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointType {
    Phone,
    Email,
}

/// A phone number or email address leased to a purpose key
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ProvisionedEndpoint {
    pub endpoint: String,
    pub endpoint_type: EndpointType,
    pub provisioned_for: String,
    /// Idempotency token of the provisioning request
    pub uuid: Option<String>,
    pub created: DateTime<Utc>,
    pub deprovisioned: bool,
    pub deprovisioned_timestamp: Option<DateTime<Utc>>,
    pub deprovisioned_reason: Option<String>,
}

/// A number in an organization's outgoing pool
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ProxyPhoneNumber {
    pub phone_number: PhoneNumber,
    pub organization_id: String,
    /// Earliest moment the number may be reserved again
    pub pool_expiration: Option<DateTime<Utc>>,
    pub last_reserved: Option<DateTime<Utc>>,
}

/// Binding of a proxy number to one outgoing call intent
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct ProxyPhoneNumberReservation {
    pub proxy_phone_number: PhoneNumber,
    pub originating_phone_number: PhoneNumber,
    pub destination_phone_number: PhoneNumber,
    pub destination_entity_id: String,
    pub owner_entity_id: String,
    pub organization_id: String,
    pub created: DateTime<Utc>,
    pub expires: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct IncomingCall {
    pub call_sid: String,
    pub source: PhoneNumber,
    pub destination: PhoneNumber,
    pub organization_id: String,
    pub created: DateTime<Utc>,
    pub afterhours: bool,
    pub urgent: bool,
    pub answered: bool,
    pub answered_time: Option<DateTime<Utc>>,
    pub sent_to_voicemail: bool,
    pub left_voicemail: bool,
    pub left_voicemail_time: Option<DateTime<Utc>>,
    pub completed: bool,
    pub completed_time: Option<DateTime<Utc>>,
}

impl IncomingCall {
    pub fn new(
        call_sid: impl Into<String>,
        source: PhoneNumber,
        destination: PhoneNumber,
        organization_id: impl Into<String>,
        created: DateTime<Utc>,
    ) -> Self {
        Self {
            call_sid: call_sid.into(),
            source,
            destination,
            organization_id: organization_id.into(),
            created,
            afterhours: false,
            urgent: false,
            answered: false,
            answered_time: None,
            sent_to_voicemail: false,
            left_voicemail: false,
            left_voicemail_time: None,
            completed: false,
            completed_time: None,
        }
    }
}

/// Column changes for an incoming call; `None` leaves the column alone.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomingCallUpdate {
    pub afterhours: Option<bool>,
    pub urgent: Option<bool>,
    pub answered: Option<bool>,
    pub answered_time: Option<DateTime<Utc>>,
    pub sent_to_voicemail: Option<bool>,
    pub left_voicemail: Option<bool>,
    pub left_voicemail_time: Option<DateTime<Utc>>,
    pub completed: Option<bool>,
    pub completed_time: Option<DateTime<Utc>>,
}

/// An outgoing call matched against a reservation
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct CallRequest {
    pub source: PhoneNumber,
    pub destination: PhoneNumber,
    pub proxy: PhoneNumber,
    pub organization_id: String,
    pub requested: DateTime<Utc>,
    pub call_sid: String,
    pub caller_entity_id: String,
    pub callee_entity_id: String,
}

/// Operational log of a handled webhook
#[derive(Debug, Clone, Serialize)]
pub struct CallEvent {
    pub source: String,
    pub destination: String,
    pub event: String,
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SentMessageType {
    Sms,
    Email,
}

/// Record of one outbound message, keyed by (uuid, destination)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SentMessage {
    pub id: u64,
    pub uuid: String,
    pub kind: SentMessageType,
    pub destination: String,
    pub sent: DateTime<Utc>,
    /// Provider id of the message (message sid for SMS)
    pub provider_id: Option<String>,
    pub data: serde_json::Value,
}

/// An uploaded blob
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Media {
    pub id: String,
    pub mime_type: String,
    pub name: Option<String>,
    pub url: Option<String>,
    /// Provider resource the blob was copied from
    pub resource_id: Option<String>,
    pub duration_ns: Option<i64>,
}

impl Media {
    pub fn duration(&self) -> Option<std::time::Duration> {
        self.duration_ns
            .and_then(|ns| u64::try_from(ns).ok())
            .map(std::time::Duration::from_nanos)
    }
}

/// Tracker row for one voicemail transcription
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct TranscriptionJob {
    pub media_id: String,
    pub raw_message_id: i64,
    pub job_id: String,
    pub created: DateTime<Utc>,
    pub available_after: DateTime<Utc>,
    pub completed: bool,
    pub timed_out: bool,
    pub errored: bool,
    pub completed_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TranscriptionJobUpdate {
    pub available_after: Option<DateTime<Utc>>,
    pub completed: Option<bool>,
    pub timed_out: Option<bool>,
    pub errored: Option<bool>,
    pub completed_timestamp: Option<DateTime<Utc>>,
}

/// Caller number blocked on one provisioned number
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct BlockedNumber {
    pub provisioned_phone_number: PhoneNumber,
    pub number: PhoneNumber,
    pub created: DateTime<Utc>,
}

/// Set of blocked numbers with a membership check
#[derive(Debug, Clone, Default)]
pub struct BlockedNumbers(pub Vec<PhoneNumber>);

impl BlockedNumbers {
    pub fn includes(&self, number: &PhoneNumber) -> bool {
        self.0.iter().any(|n| n == number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IPCallType {
    Video,
    Audio,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IPCallRole {
    Caller,
    Recipient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NetworkType {
    Unknown,
    Cellular,
    Wifi,
}

/// Participant state of an IP call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IPCallState {
    Pending,
    Accepted,
    Declined,
    Connected,
    Failed,
    Completed,
}

impl IPCallState {
    /// Whether a participant may move from `self` to `to`.
    pub fn can_transition_to(self, to: IPCallState) -> bool {
        use IPCallState::*;
        matches!(
            (self, to),
            (Pending, Accepted)
                | (Pending, Declined)
                | (Accepted, Connected)
                | (Accepted, Failed)
                | (Accepted, Completed)
                | (Connected, Failed)
                | (Connected, Completed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Declined | Self::Failed | Self::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Accepted => "ACCEPTED",
            Self::Declined => "DECLINED",
            Self::Connected => "CONNECTED",
            Self::Failed => "FAILED",
            Self::Completed => "COMPLETED",
        }
    }
}

impl fmt::Display for IPCallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IPCallState {
    type Err = ExcommsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "ACCEPTED" => Ok(Self::Accepted),
            "DECLINED" => Ok(Self::Declined),
            "CONNECTED" => Ok(Self::Connected),
            "FAILED" => Ok(Self::Failed),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(ExcommsError::invalid_argument(format!("unknown ipcall state {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct IPCallParticipant {
    pub account_id: String,
    pub entity_id: String,
    pub identity: String,
    pub role: IPCallRole,
    pub state: IPCallState,
    pub network_type: NetworkType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IPCall {
    pub id: u64,
    pub call_type: IPCallType,
    pub pending: bool,
    pub initiated: DateTime<Utc>,
    pub connected: Option<DateTime<Utc>>,
    pub participants: Vec<IPCallParticipant>,
}

impl IPCall {
    /// A call is active while no participant has reached a terminal state.
    pub fn is_active(&self) -> bool {
        !self.participants.iter().any(|p| p.state.is_terminal())
    }

    pub fn participant(&self, account_id: &str) -> Option<&IPCallParticipant> {
        self.participants.iter().find(|p| p.account_id == account_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use IPCallState::*;

    #[test]
    fn ipcall_transition_set_is_closed() {
        let all = [Pending, Accepted, Declined, Connected, Failed, Completed];
        let mut allowed = Vec::new();
        for from in all {
            for to in all {
                if from.can_transition_to(to) {
                    allowed.push((from, to));
                }
            }
        }
        assert_eq!(
            allowed,
            vec![
                (Pending, Accepted),
                (Pending, Declined),
                (Accepted, Connected),
                (Accepted, Failed),
                (Accepted, Completed),
                (Connected, Failed),
                (Connected, Completed),
            ]
        );
    }

    #[test]
    fn state_parsing_is_case_insensitive() {
        assert_eq!("connected".parse::<IPCallState>().unwrap(), Connected);
        assert!("ringing".parse::<IPCallState>().is_err());
    }
}
