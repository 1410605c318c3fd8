//! Normalizes stored raw payloads into external messages
//!
//! Consumes `incoming-raw-message` notifications. Each notification names a
//! stored [`RawIncoming`]; the worker copies its media into the blob store,
//! writes the media ids back onto the stored payload and publishes the
//! matching [`ExternalMessage`]. Voicemails whose organization transcribes
//! with the external provider are handed to the transcription tracker
//! instead of being published here.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::transcription::TrackTranscriptionRequest;
use super::{MessageHandler, Outcome};
use crate::clients::{get_boolean, get_single_select, keys, ConfigKey, ResourceKind};
use crate::context::Context;
use crate::email;
use crate::error::{ExcommsError, Result};
use crate::events::{
    Direction, ExternalMessage, ExternalMessageItem, IncomingCallEvent, IncomingCallEventType,
    IncomingRawMessageNotification, MediaAttachment,
};
use crate::phone::PhoneNumber;
use crate::rawmsg::{RawIncoming, RawMessageKind, RawPayload, SendgridParams, TranscriptionStatus, TwilioParams};
use crate::types::{Media, TranscriptionJob};

pub struct IncomingRawMessageWorker {
    ctx: Context,
}

impl IncomingRawMessageWorker {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    async fn process_sms(&self, mut raw: RawIncoming, mut params: TwilioParams) -> Result<Outcome> {
        let (from, to) = match (PhoneNumber::parse(&params.from), PhoneNumber::parse(&params.to)) {
            (Ok(from), Ok(to)) => (from, to),
            _ => {
                warn!(raw_id = raw.id, from = %params.from, to = %params.to, "Dropping SMS with invalid numbers");
                return Ok(Outcome::Ack);
            }
        };

        if self.ctx.db.blocked_numbers(&to).await?.includes(&from) {
            info!(raw_id = raw.id, "Dropping SMS from blocked number {}", from);
            return Ok(Outcome::Ack);
        }

        let mut uploaded = Vec::new();
        let mut attachments = Vec::new();
        for item in params.media_items.iter_mut() {
            let media = match &item.media_id {
                Some(id) => self.stored_media(id).await?,
                None => match self.ctx.uploader.upload(&item.content_type, &item.media_url).await {
                    Ok(mut media) => {
                        media.resource_id = Some(resource_sid(&item.media_url).to_string());
                        item.media_id = Some(media.id.clone());
                        uploaded.push(media.clone());
                        media
                    }
                    Err(ExcommsError::MediaNotFound(url)) => {
                        warn!(raw_id = raw.id, "Skipping SMS attachment the provider no longer has: {}", url);
                        continue;
                    }
                    Err(e) => return Err(e),
                },
            };
            attachments.push(attachment(&media));
        }

        if !uploaded.is_empty() {
            self.ctx.db.store_media(&uploaded).await?;
            raw.payload = RawPayload::Twilio(params.clone());
            self.ctx.db.store_incoming_raw_message(&raw, self.ctx.clock.now()).await?;
        }

        let message = ExternalMessage {
            from_channel_id: from.to_string(),
            to_channel_id: to.to_string(),
            timestamp: raw.timestamp,
            direction: Direction::Inbound,
            item: ExternalMessageItem::Sms {
                text: params.body.clone(),
                attachments,
            },
        };
        self.ctx.publisher.external_message(&message).await?;
        debug!(raw_id = raw.id, message_sid = %params.message_sid, "Published inbound SMS");

        for item in &params.media_items {
            self.ctx.publisher.cleanup(ResourceKind::Media, &item.media_url).await;
        }
        self.ctx.publisher.cleanup(ResourceKind::Sms, &params.message_sid).await;
        Ok(Outcome::Ack)
    }

    async fn process_voicemail(&self, mut raw: RawIncoming, mut params: TwilioParams) -> Result<Outcome> {
        let media = if params.recording_media_id.is_empty() {
            let url = format!("{}.mp3", params.recording_url);
            let mut media = match self.ctx.uploader.upload("audio/mpeg", &url).await {
                Ok(media) => media,
                Err(ExcommsError::MediaNotFound(_)) => {
                    debug!(raw_id = raw.id, recording_sid = %params.recording_sid, "Recording not available yet");
                    return Ok(Outcome::NotReady);
                }
                Err(e) => return Err(e),
            };
            if media.duration_ns.is_none() && params.recording_duration > 0 {
                media.duration_ns = Some(i64::from(params.recording_duration) * 1_000_000_000);
            }
            media.resource_id = Some(params.recording_sid.clone());
            params.recording_media_id = media.id.clone();

            self.ctx.db.store_media(std::slice::from_ref(&media)).await?;
            raw.payload = RawPayload::Twilio(params.clone());
            self.ctx.db.store_incoming_raw_message(&raw, self.ctx.clock.now()).await?;
            media
        } else {
            self.stored_media(&params.recording_media_id).await?
        };

        let call = self.ctx.db.lookup_incoming_call(&params.call_sid).await?;
        let urgent = call.as_ref().is_some_and(|c| c.afterhours && c.urgent);
        let (transcribe, provider) = match &call {
            Some(call) => self.transcription_settings(&call.organization_id).await,
            None => {
                warn!(call_sid = %params.call_sid, "Voicemail without an incoming call row");
                (false, keys::TRANSCRIPTION_PROVIDER_TELEPHONY.to_string())
            }
        };

        if transcribe && provider == keys::TRANSCRIPTION_PROVIDER_EXTERNAL {
            return self.submit_transcription(&raw, &media, urgent).await;
        }

        let mut event = IncomingCallEvent::new(voicemail_event_type(urgent), params.recording_duration);
        event.voicemail_media_id = media.id.clone();
        event.voicemail_duration_ns = media.duration_ns.unwrap_or(0).max(0) as u64;
        event.transcription_text = params.transcription_text.clone();
        self.ctx
            .publisher
            .external_message(&voicemail_message(&raw, &params, event))
            .await?;
        info!(raw_id = raw.id, call_sid = %params.call_sid, urgent, "Published voicemail");

        self.ctx.publisher.cleanup(ResourceKind::Recording, &params.recording_sid).await;
        if params.transcription_status == TranscriptionStatus::Completed {
            self.ctx
                .publisher
                .cleanup(ResourceKind::Transcription, &params.transcription_sid)
                .await;
        }
        Ok(Outcome::Ack)
    }

    async fn submit_transcription(&self, raw: &RawIncoming, media: &Media, urgent: bool) -> Result<Outcome> {
        let request = |job_id: String| TrackTranscriptionRequest {
            job_id,
            media_id: media.id.clone(),
            media_duration_ns: media.duration_ns.unwrap_or(0).max(0) as u64,
            raw_message_id: raw.id,
            urgent,
        };

        if let Some(job) = self.ctx.db.lookup_transcription_job(&media.id).await? {
            if !job.completed {
                // Submitted on an earlier attempt; make sure it is tracked
                self.enqueue(&request(job.job_id)).await?;
            }
            return Ok(Outcome::Ack);
        }

        let url = self
            .ctx
            .blobs
            .expiring_url(&media.id, self.ctx.config.transcription.media_url_ttl())
            .await?;
        let job_id = self.ctx.transcription.submit(&url).await?;
        let now = self.ctx.clock.now();
        self.ctx
            .db
            .insert_transcription_job(&TranscriptionJob {
                media_id: media.id.clone(),
                raw_message_id: raw.id as i64,
                job_id: job_id.clone(),
                created: now,
                available_after: now,
                completed: false,
                timed_out: false,
                errored: false,
                completed_timestamp: None,
            })
            .await?;
        info!(raw_id = raw.id, media_id = %media.id, job_id = %job_id, "Submitted voicemail for transcription");
        self.enqueue(&request(job_id)).await?;
        Ok(Outcome::Ack)
    }

    async fn enqueue(&self, request: &TrackTranscriptionRequest) -> Result<()> {
        self.ctx.transcription_queue.send(serde_json::to_vec(request)?).await
    }

    /// Transcribe flag and provider for an organization. Lookup failures
    /// fall back to no transcription.
    async fn transcription_settings(&self, organization_id: &str) -> (bool, String) {
        let settings = self.ctx.settings.as_ref();
        let transcribe = get_boolean(settings, organization_id, ConfigKey::new(keys::TRANSCRIBE_VOICEMAIL))
            .await
            .unwrap_or_else(|e| {
                warn!(org_id = organization_id, "Failed to read transcribe setting: {}", e);
                false
            });
        let provider = get_single_select(settings, organization_id, ConfigKey::new(keys::TRANSCRIPTION_PROVIDER))
            .await
            .map(|(id, _)| id)
            .unwrap_or_else(|e| {
                warn!(org_id = organization_id, "Failed to read transcription provider: {}", e);
                keys::TRANSCRIPTION_PROVIDER_TELEPHONY.to_string()
            });
        (transcribe, provider)
    }

    async fn process_email(&self, raw: &RawIncoming, params: &SendgridParams) -> Result<Outcome> {
        let sender = match email::parse_address(&params.sender) {
            Ok(sender) => sender,
            Err(e) => {
                warn!(raw_id = raw.id, "Dropping email with unparseable sender: {}", e);
                return Ok(Outcome::Ack);
            }
        };

        let recipients: Vec<email::EmailAddress> = envelope_recipients(params)
            .into_iter()
            .filter_map(|r| match r {
                Ok(address) => Some(address),
                Err(e) => {
                    warn!(raw_id = raw.id, "Skipping recipient: {}", e);
                    None
                }
            })
            .collect();
        if recipients.is_empty() {
            warn!(raw_id = raw.id, "Dropping email without recipients");
            return Ok(Outcome::Ack);
        }

        let ids: Vec<String> = params.attachments.iter().map(|a| a.media_id.clone()).collect();
        let stored = self.ctx.db.lookup_media(&ids).await?;
        let attachments: Vec<MediaAttachment> = params
            .attachments
            .iter()
            .filter_map(|a| {
                let media = stored.iter().find(|m| m.id == a.media_id)?;
                let mut attachment = attachment(media);
                if !a.name.is_empty() {
                    attachment.name = a.name.clone();
                }
                Some(attachment)
            })
            .collect();

        let body = email::trim_reply(&params.text);
        for recipient in &recipients {
            let message = ExternalMessage {
                from_channel_id: sender.address.clone(),
                to_channel_id: recipient.address.clone(),
                timestamp: raw.timestamp,
                direction: Direction::Inbound,
                item: ExternalMessageItem::Email {
                    subject: params.subject.clone(),
                    body: body.clone(),
                    attachments: attachments.clone(),
                },
            };
            self.ctx.publisher.external_message(&message).await?;
        }
        debug!(raw_id = raw.id, recipients = recipients.len(), "Published inbound email");
        Ok(Outcome::Ack)
    }

    async fn stored_media(&self, id: &str) -> Result<Media> {
        self.ctx
            .db
            .lookup_media(&[id.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ExcommsError::not_found(format!("media {}", id)))
    }
}

#[async_trait]
impl MessageHandler for IncomingRawMessageWorker {
    fn name(&self) -> &'static str {
        "incoming-raw-message"
    }

    async fn handle(&self, body: &[u8]) -> Result<Outcome> {
        let notification: IncomingRawMessageNotification = match serde_json::from_slice(body) {
            Ok(n) => n,
            Err(e) => {
                warn!("Dropping malformed raw message notification: {}", e);
                return Ok(Outcome::Ack);
            }
        };

        // The row may not be visible yet; erroring retries the notification
        let raw = self
            .ctx
            .db
            .incoming_raw_message(notification.id)
            .await?
            .ok_or_else(|| ExcommsError::not_found(format!("raw message {}", notification.id)))?;

        let kind = raw.kind;
        match (kind, raw.payload.clone()) {
            (RawMessageKind::TwilioSms, RawPayload::Twilio(params)) => self.process_sms(raw, params).await,
            (RawMessageKind::TwilioVoicemail, RawPayload::Twilio(params)) => {
                self.process_voicemail(raw, params).await
            }
            (RawMessageKind::SendgridEmail, RawPayload::Sendgrid(params)) => {
                self.process_email(&raw, &params).await
            }
            (kind, _) => {
                warn!(raw_id = raw.id, ?kind, "Raw message payload does not match its kind");
                Ok(Outcome::Ack)
            }
        }
    }
}

/// The external message announcing a voicemail
pub(crate) fn voicemail_message(raw: &RawIncoming, params: &TwilioParams, event: IncomingCallEvent) -> ExternalMessage {
    ExternalMessage {
        from_channel_id: params.from.clone(),
        to_channel_id: params.to.clone(),
        timestamp: raw.timestamp,
        direction: Direction::Inbound,
        item: ExternalMessageItem::IncomingCallEvent(event),
    }
}

pub(crate) fn voicemail_event_type(urgent: bool) -> IncomingCallEventType {
    if urgent {
        IncomingCallEventType::LeftUrgentVoicemail
    } else {
        IncomingCallEventType::LeftVoicemail
    }
}

fn attachment(media: &Media) -> MediaAttachment {
    MediaAttachment {
        media_id: media.id.clone(),
        content_type: media.mime_type.clone(),
        name: media.name.clone().unwrap_or_default(),
    }
}

/// Last path segment of a provider media URL, which is the resource's sid
fn resource_sid(url: &str) -> &str {
    url.trim_end_matches('/').rsplit('/').next().unwrap_or(url)
}

#[derive(Deserialize)]
struct SmtpEnvelope {
    #[serde(default)]
    to: Vec<String>,
}

/// Envelope recipients, falling back to the `to` header.
fn envelope_recipients(params: &SendgridParams) -> Vec<Result<email::EmailAddress>> {
    match serde_json::from_str::<SmtpEnvelope>(&params.smtp_envelope) {
        Ok(envelope) if !envelope.to.is_empty() => envelope.to.iter().map(|r| email::parse_address(r)).collect(),
        _ => email::parse_address_list(&params.recipient),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{SettingValue, TranscriptionJobStatus};
    use crate::context::test_support::{test_context, EPOCH};
    use crate::context::Doubles;
    use crate::events::ExternalMessageItem as Item;
    use crate::media::test_audio::silent_wav;
    use crate::rawmsg::{EmailAttachment, MediaItem};
    use crate::types::IncomingCall;
    use crate::worker::queue::WorkQueue;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    const PATIENT: &str = "+14155550100";
    const PRACTICE: &str = "+12065550100";

    async fn store(ctx: &Context, id: u64, kind: RawMessageKind, payload: RawPayload) -> Vec<u8> {
        let raw = RawIncoming {
            id,
            kind,
            timestamp: EPOCH as u64,
            payload,
        };
        ctx.db.store_incoming_raw_message(&raw, ctx.clock.now()).await.unwrap();
        serde_json::to_vec(&IncomingRawMessageNotification { id }).unwrap()
    }

    fn published(doubles: &Doubles) -> Vec<ExternalMessage> {
        doubles.events.messages("external-message")
    }

    fn cleanups(doubles: &Doubles) -> Vec<(ResourceKind, String)> {
        doubles
            .events
            .messages::<crate::events::DeleteResourceRequest>("resource-cleanup")
            .into_iter()
            .map(|r| (r.kind, r.resource_id))
            .collect()
    }

    fn voicemail_params() -> TwilioParams {
        TwilioParams {
            from: PATIENT.into(),
            to: PRACTICE.into(),
            call_sid: "CA1".into(),
            recording_url: "https://provider/Recordings/RE1".into(),
            recording_sid: "RE1".into(),
            recording_duration: 20,
            transcription_text: "please call me back".into(),
            ..Default::default()
        }
    }

    async fn incoming_call(ctx: &Context, afterhours: bool, urgent: bool) {
        let mut call = IncomingCall::new(
            "CA1",
            PhoneNumber::parse(PATIENT).unwrap(),
            PhoneNumber::parse(PRACTICE).unwrap(),
            "org-1",
            chrono::Utc.timestamp_opt(EPOCH, 0).unwrap(),
        );
        call.afterhours = afterhours;
        call.urgent = urgent;
        ctx.db.create_incoming_call(&call).await.unwrap();
    }

    #[tokio::test]
    async fn sms_with_media_is_uploaded_and_published() {
        let (ctx, doubles, _dir) = test_context().await;
        doubles
            .telephony
            .host_media("https://provider/Media/ME1", vec![7; 16], "image/jpeg");
        let params = TwilioParams {
            from: PATIENT.into(),
            to: PRACTICE.into(),
            message_sid: "SM1".into(),
            body: "see attached".into(),
            media_items: vec![MediaItem {
                media_url: "https://provider/Media/ME1".into(),
                content_type: "image/jpeg".into(),
                media_id: None,
            }],
            ..Default::default()
        };
        let body = store(&ctx, 1, RawMessageKind::TwilioSms, RawPayload::Twilio(params)).await;

        let worker = IncomingRawMessageWorker::new(ctx.clone());
        assert_eq!(worker.handle(&body).await.unwrap(), Outcome::Ack);

        let messages = published(&doubles);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].from_channel_id, PATIENT);
        assert_eq!(messages[0].timestamp, EPOCH as u64);
        let Item::Sms { text, attachments } = &messages[0].item else {
            panic!("expected sms, got {:?}", messages[0].item);
        };
        assert_eq!(text, "see attached");
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].content_type, "image/jpeg");

        let media_id = attachments[0].media_id.clone();
        let stored = ctx.db.lookup_media(&[media_id.clone()]).await.unwrap();
        assert_eq!(stored[0].resource_id.as_deref(), Some("ME1"));
        let raw = ctx.db.incoming_raw_message(1).await.unwrap().unwrap();
        assert_eq!(raw.twilio().unwrap().media_items[0].media_id, Some(media_id));

        assert_eq!(
            cleanups(&doubles),
            vec![
                (ResourceKind::Media, "https://provider/Media/ME1".to_string()),
                (ResourceKind::Sms, "SM1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn sms_from_blocked_or_invalid_number_is_dropped() {
        let (ctx, doubles, _dir) = test_context().await;
        ctx.db
            .block_number(
                &PhoneNumber::parse(PRACTICE).unwrap(),
                &PhoneNumber::parse(PATIENT).unwrap(),
                ctx.clock.now(),
            )
            .await
            .unwrap();
        let worker = IncomingRawMessageWorker::new(ctx.clone());

        let blocked = TwilioParams {
            from: PATIENT.into(),
            to: PRACTICE.into(),
            body: "hi".into(),
            ..Default::default()
        };
        let body = store(&ctx, 1, RawMessageKind::TwilioSms, RawPayload::Twilio(blocked)).await;
        assert_eq!(worker.handle(&body).await.unwrap(), Outcome::Ack);

        let invalid = TwilioParams {
            from: "not-a-number".into(),
            to: PRACTICE.into(),
            ..Default::default()
        };
        let body = store(&ctx, 2, RawMessageKind::TwilioSms, RawPayload::Twilio(invalid)).await;
        assert_eq!(worker.handle(&body).await.unwrap(), Outcome::Ack);

        assert!(published(&doubles).is_empty());
    }

    #[tokio::test]
    async fn voicemail_without_external_transcription_is_published() {
        let (ctx, doubles, _dir) = test_context().await;
        incoming_call(&ctx, true, true).await;
        doubles.telephony.host_media(
            "https://provider/Recordings/RE1.mp3",
            vec![0; 32],
            "audio/mpeg",
        );
        let mut params = voicemail_params();
        params.transcription_sid = "TR1".into();
        params.transcription_status = TranscriptionStatus::Completed;
        let body = store(&ctx, 5, RawMessageKind::TwilioVoicemail, RawPayload::Twilio(params)).await;

        let worker = IncomingRawMessageWorker::new(ctx.clone());
        assert_eq!(worker.handle(&body).await.unwrap(), Outcome::Ack);

        let messages = published(&doubles);
        assert_eq!(messages.len(), 1);
        let Item::IncomingCallEvent(event) = &messages[0].item else {
            panic!("expected call event");
        };
        assert_eq!(event.event_type, IncomingCallEventType::LeftUrgentVoicemail);
        assert_eq!(event.duration_secs, 20);
        assert_eq!(event.voicemail_duration_ns, 20_000_000_000);
        assert_eq!(event.transcription_text, "please call me back");

        let raw = ctx.db.incoming_raw_message(5).await.unwrap().unwrap();
        assert_eq!(raw.twilio().unwrap().recording_media_id, event.voicemail_media_id);
        assert_eq!(
            cleanups(&doubles),
            vec![
                (ResourceKind::Recording, "RE1".to_string()),
                (ResourceKind::Transcription, "TR1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn voicemail_waits_for_the_recording() {
        let (ctx, doubles, _dir) = test_context().await;
        incoming_call(&ctx, false, false).await;
        let body = store(&ctx, 5, RawMessageKind::TwilioVoicemail, RawPayload::Twilio(voicemail_params())).await;

        let worker = IncomingRawMessageWorker::new(ctx.clone());
        assert_eq!(worker.handle(&body).await.unwrap(), Outcome::NotReady);
        assert!(published(&doubles).is_empty());
    }

    #[tokio::test]
    async fn external_transcription_hands_off_to_tracker() {
        let (ctx, doubles, _dir) = test_context().await;
        incoming_call(&ctx, false, false).await;
        doubles
            .settings
            .set("org-1", ConfigKey::new(keys::TRANSCRIBE_VOICEMAIL), SettingValue::Boolean(true));
        doubles.settings.set(
            "org-1",
            ConfigKey::new(keys::TRANSCRIPTION_PROVIDER),
            SettingValue::SingleSelect {
                id: keys::TRANSCRIPTION_PROVIDER_EXTERNAL.into(),
                free_text: String::new(),
            },
        );
        doubles.telephony.host_media(
            "https://provider/Recordings/RE1.mp3",
            silent_wav(1),
            "audio/wav",
        );
        let body = store(&ctx, 5, RawMessageKind::TwilioVoicemail, RawPayload::Twilio(voicemail_params())).await;

        let worker = IncomingRawMessageWorker::new(ctx.clone());
        assert_eq!(worker.handle(&body).await.unwrap(), Outcome::Ack);
        assert!(published(&doubles).is_empty());
        assert_eq!(doubles.transcription.submitted().len(), 1);

        let delivery = doubles
            .transcription_queue
            .receive(Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        let request: TrackTranscriptionRequest = serde_json::from_slice(&delivery.body).unwrap();
        assert_eq!(request.job_id, "job-1");
        assert_eq!(request.raw_message_id, 5);
        assert!(!request.urgent);

        let job = ctx.db.lookup_transcription_job(&request.media_id).await.unwrap().unwrap();
        assert_eq!(job.available_after, ctx.clock.now());

        // Redelivery does not submit a second job
        doubles
            .transcription
            .set_result("job-1", TranscriptionJobStatus::Processing, "");
        assert_eq!(worker.handle(&body).await.unwrap(), Outcome::Ack);
        assert_eq!(doubles.transcription.submitted().len(), 1);
    }

    #[tokio::test]
    async fn email_is_published_once_per_envelope_recipient() {
        let (ctx, doubles, _dir) = test_context().await;
        ctx.db
            .store_media(&[Media {
                id: "900".into(),
                mime_type: "application/pdf".into(),
                name: None,
                url: None,
                resource_id: None,
                duration_ns: None,
            }])
            .await
            .unwrap();
        let params = SendgridParams {
            sender: "\"Doe, Jane\" <Jane@Example.com>".into(),
            recipient: "ignored@clinic.org".into(),
            subject: "Re: visit".into(),
            text: "Thursday works.\n\nOn Mon, Jan 1 Clinic <desk@clinic.org> wrote:\n> When?".into(),
            smtp_envelope: r#"{"to":["desk@clinic.org","Billing <billing@clinic.org>"],"from":"jane@example.com"}"#
                .into(),
            attachments: vec![EmailAttachment {
                media_id: "900".into(),
                name: "form.pdf".into(),
                content_type: "application/pdf".into(),
            }],
            ..Default::default()
        };
        let body = store(&ctx, 9, RawMessageKind::SendgridEmail, RawPayload::Sendgrid(params)).await;

        let worker = IncomingRawMessageWorker::new(ctx.clone());
        assert_eq!(worker.handle(&body).await.unwrap(), Outcome::Ack);

        let messages = published(&doubles);
        let recipients: Vec<&str> = messages.iter().map(|m| m.to_channel_id.as_str()).collect();
        assert_eq!(recipients, vec!["desk@clinic.org", "billing@clinic.org"]);
        let Item::Email { subject, body, attachments } = &messages[0].item else {
            panic!("expected email");
        };
        assert_eq!(messages[0].from_channel_id, "jane@example.com");
        assert_eq!(subject, "Re: visit");
        assert_eq!(body, "Thursday works.");
        assert_eq!(attachments[0].name, "form.pdf");
    }

    #[tokio::test]
    async fn recipient_header_is_split_on_mailbox_boundaries() {
        let (ctx, doubles, _dir) = test_context().await;
        let params = SendgridParams {
            sender: "jane@example.com".into(),
            recipient: r#""Smith, Jane" <jane@clinic.org>, desk@clinic"#.into(),
            subject: "Hello".into(),
            text: "Hi".into(),
            ..Default::default()
        };
        let body = store(&ctx, 10, RawMessageKind::SendgridEmail, RawPayload::Sendgrid(params)).await;

        let worker = IncomingRawMessageWorker::new(ctx.clone());
        assert_eq!(worker.handle(&body).await.unwrap(), Outcome::Ack);

        let messages = published(&doubles);
        let recipients: Vec<&str> = messages.iter().map(|m| m.to_channel_id.as_str()).collect();
        assert_eq!(recipients, vec!["jane@clinic.org"]);
    }

    #[tokio::test]
    async fn missing_raw_message_is_retried() {
        let (ctx, _doubles, _dir) = test_context().await;
        let worker = IncomingRawMessageWorker::new(ctx);
        let body = serde_json::to_vec(&IncomingRawMessageNotification { id: 404 }).unwrap();
        assert!(worker.handle(&body).await.is_err());
        assert_eq!(worker.handle(b"{").await.unwrap(), Outcome::Ack);
    }
}
