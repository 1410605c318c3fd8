//! Verbatim inbound payloads as they are stored for audit and replay

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Status values the telephony provider reports for calls and dialed legs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallStatus {
    #[default]
    Undefined,
    Queued,
    Ringing,
    InProgress,
    Canceled,
    Completed,
    Failed,
    Busy,
    NoAnswer,
    Answered,
}

impl CallStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "queued" => Self::Queued,
            "ringing" => Self::Ringing,
            "in-progress" => Self::InProgress,
            "canceled" => Self::Canceled,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "busy" => Self::Busy,
            "no-answer" => Self::NoAnswer,
            "answered" => Self::Answered,
            _ => Self::Undefined,
        }
    }

    /// The call reached the other party.
    pub fn is_answered(self) -> bool {
        matches!(self, Self::Answered | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageStatus {
    #[default]
    Undefined,
    Accepted,
    Queued,
    Sending,
    Sent,
    Failed,
    Delivered,
    Undelivered,
    Receiving,
    Received,
}

impl MessageStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "accepted" => Self::Accepted,
            "queued" => Self::Queued,
            "sending" => Self::Sending,
            "sent" => Self::Sent,
            "failed" => Self::Failed,
            "delivered" => Self::Delivered,
            "undelivered" => Self::Undelivered,
            "receiving" => Self::Receiving,
            "received" => Self::Received,
            _ => Self::Undefined,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TranscriptionStatus {
    #[default]
    Undefined,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MediaItem {
    pub media_url: String,
    pub content_type: String,
    /// Set once the item has been copied into the blob store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
}

/// Parameters the telephony provider posts with every webhook.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TwilioParams {
    pub account_sid: String,
    pub from: String,
    pub to: String,
    pub call_sid: String,
    pub parent_call_sid: String,
    pub dial_call_sid: String,
    pub call_status: CallStatus,
    pub dial_call_status: CallStatus,
    pub call_duration: u32,
    pub dial_call_duration: u32,
    pub digits: String,
    pub direction: String,
    pub recording_url: String,
    pub recording_sid: String,
    pub recording_duration: u32,
    pub recording_media_id: String,
    pub transcription_sid: String,
    pub transcription_text: String,
    pub transcription_status: TranscriptionStatus,
    pub message_sid: String,
    pub message_status: MessageStatus,
    pub body: String,
    pub media_items: Vec<MediaItem>,
}

impl TwilioParams {
    /// Build from the provider's form body. Unknown fields are ignored.
    pub fn from_form(form: &HashMap<String, String>) -> Self {
        let get = |k: &str| form.get(k).cloned().unwrap_or_default();
        let num = |k: &str| form.get(k).and_then(|v| v.trim().parse::<u32>().ok()).unwrap_or(0);

        let num_media = num("NumMedia") as usize;
        let media_items = (0..num_media)
            .filter_map(|i| {
                let url = form.get(&format!("MediaUrl{}", i))?;
                Some(MediaItem {
                    media_url: url.clone(),
                    content_type: form
                        .get(&format!("MediaContentType{}", i))
                        .cloned()
                        .unwrap_or_default(),
                    media_id: None,
                })
            })
            .collect();

        let transcription_status = match get("TranscriptionStatus").to_ascii_lowercase().as_str() {
            "completed" => TranscriptionStatus::Completed,
            "failed" => TranscriptionStatus::Failed,
            _ => TranscriptionStatus::Undefined,
        };

        Self {
            account_sid: get("AccountSid"),
            from: get("From"),
            to: get("To"),
            call_sid: get("CallSid"),
            parent_call_sid: get("ParentCallSid"),
            dial_call_sid: get("DialCallSid"),
            call_status: CallStatus::parse(&get("CallStatus")),
            dial_call_status: CallStatus::parse(&get("DialCallStatus")),
            call_duration: num("CallDuration"),
            dial_call_duration: num("DialCallDuration"),
            digits: get("Digits"),
            direction: get("Direction"),
            recording_url: get("RecordingUrl"),
            recording_sid: get("RecordingSid"),
            recording_duration: num("RecordingDuration"),
            recording_media_id: String::new(),
            transcription_sid: get("TranscriptionSid"),
            transcription_text: get("TranscriptionText"),
            transcription_status,
            // Status callbacks use MessageSid, older inbound payloads SmsSid
            message_sid: form
                .get("MessageSid")
                .or_else(|| form.get("SmsSid"))
                .cloned()
                .unwrap_or_default(),
            message_status: MessageStatus::parse(
                form.get("MessageStatus")
                    .or_else(|| form.get("SmsStatus"))
                    .map(String::as_str)
                    .unwrap_or_default(),
            ),
            body: get("Body"),
            media_items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EmailAttachment {
    pub media_id: String,
    pub name: String,
    pub content_type: String,
}

/// Inbound email as posted by the email provider's parse webhook.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SendgridParams {
    pub sender: String,
    pub recipient: String,
    pub cc: String,
    pub subject: String,
    pub text: String,
    pub html: String,
    /// JSON `{"to": [...], "from": "..."}`
    pub smtp_envelope: String,
    pub headers: String,
    pub attachments: Vec<EmailAttachment>,
}

impl SendgridParams {
    pub fn from_form(form: &HashMap<String, String>) -> Self {
        let get = |k: &str| form.get(k).cloned().unwrap_or_default();
        Self {
            sender: get("from"),
            recipient: get("to"),
            cc: get("cc"),
            subject: get("subject"),
            text: get("text"),
            html: get("html"),
            smtp_envelope: get("envelope"),
            headers: get("headers"),
            attachments: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RawMessageKind {
    TwilioSms,
    TwilioVoicemail,
    SendgridEmail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", content = "params", rename_all = "snake_case")]
pub enum RawPayload {
    Twilio(TwilioParams),
    Sendgrid(SendgridParams),
}

/// One verbatim inbound payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawIncoming {
    /// Zero until stored
    pub id: u64,
    pub kind: RawMessageKind,
    /// Unix seconds
    pub timestamp: u64,
    pub payload: RawPayload,
}

impl RawIncoming {
    pub fn twilio(&self) -> Option<&TwilioParams> {
        match &self.payload {
            RawPayload::Twilio(p) => Some(p),
            RawPayload::Sendgrid(_) => None,
        }
    }

    pub fn sendgrid(&self) -> Option<&SendgridParams> {
        match &self.payload {
            RawPayload::Sendgrid(p) => Some(p),
            RawPayload::Twilio(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn parses_call_webhook() {
        let params = TwilioParams::from_form(&form(&[
            ("From", "+14155550100"),
            ("To", "+12065550100"),
            ("CallSid", "CA1"),
            ("CallStatus", "in-progress"),
            ("DialCallStatus", "no-answer"),
            ("CallDuration", "17"),
        ]));
        assert_eq!(params.call_status, CallStatus::InProgress);
        assert_eq!(params.dial_call_status, CallStatus::NoAnswer);
        assert_eq!(params.call_duration, 17);
        assert!(params.parent_call_sid.is_empty());
    }

    #[test]
    fn parses_sms_media_items() {
        let params = TwilioParams::from_form(&form(&[
            ("SmsSid", "SM1"),
            ("Body", "hello"),
            ("NumMedia", "2"),
            ("MediaUrl0", "https://media/1"),
            ("MediaContentType0", "image/jpeg"),
            ("MediaUrl1", "https://media/2"),
            ("MediaContentType1", "image/png"),
        ]));
        assert_eq!(params.message_sid, "SM1");
        assert_eq!(params.media_items.len(), 2);
        assert_eq!(params.media_items[1].content_type, "image/png");
    }
}
