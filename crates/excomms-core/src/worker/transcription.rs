//! Voicemail transcription tracker
//!
//! Each tracking request names one transcription job. A pass over a job
//! runs in two steps:
//!
//! 1. Under the job's row lock: drop the request when the job is already
//!    completed, report "not ready" while its backoff has not elapsed,
//!    otherwise push the next attempt out by the backoff and commit.
//! 2. Without the lock: settle the job if it has outlived the deadline or
//!    the provider reports a final status, else report "not ready".
//!
//! Settling re-takes the lock and re-checks the completed flag before the
//! voicemail is published, so each job publishes exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::raw_message::{voicemail_event_type, voicemail_message};
use super::{MessageHandler, Outcome};
use crate::clients::{ResourceKind, TranscriptionJobStatus, TranscriptionProvider};
use crate::clock::{window, Clock};
use crate::config::TranscriptionConfig;
use crate::database::transcription::{
    lookup_transcription_job_tx, update_transcription_job_tx, LOCK_TRANSCRIPTION_JOB,
};
use crate::database::Database;
use crate::error::{ExcommsError, Result};
use crate::events::{IncomingCallEvent, Publisher};
use crate::types::{TranscriptionJob, TranscriptionJobUpdate};

/// Queue body asking the tracker to follow one transcription job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackTranscriptionRequest {
    pub job_id: String,
    pub media_id: String,
    pub media_duration_ns: u64,
    pub raw_message_id: u64,
    pub urgent: bool,
}

enum Claim {
    Work(TranscriptionJob),
    Skip(Outcome),
}

/// How a job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Completed,
    Failed,
    TimedOut,
}

pub struct TranscriptionTracker {
    db: Database,
    clock: Arc<dyn Clock>,
    provider: Arc<dyn TranscriptionProvider>,
    publisher: Publisher,
    config: TranscriptionConfig,
}

impl TranscriptionTracker {
    pub fn new(
        db: Database,
        clock: Arc<dyn Clock>,
        provider: Arc<dyn TranscriptionProvider>,
        publisher: Publisher,
        config: TranscriptionConfig,
    ) -> Self {
        Self {
            db,
            clock,
            provider,
            publisher,
            config,
        }
    }

    /// Step 1: claim this attempt for the caller.
    async fn claim(&self, media_id: &str) -> Result<Claim> {
        let mut tx = self.db.begin_locked(LOCK_TRANSCRIPTION_JOB, media_id).await?;
        let Some(job) = lookup_transcription_job_tx(&mut tx, media_id).await? else {
            warn!(media_id, "Dropping tracking request for unknown transcription job");
            return Ok(Claim::Skip(Outcome::Ack));
        };
        if job.completed {
            debug!(media_id, "Transcription job already completed");
            return Ok(Claim::Skip(Outcome::Ack));
        }

        let now = self.clock.now();
        if now < job.available_after {
            return Ok(Claim::Skip(Outcome::NotReady));
        }

        let update = TranscriptionJobUpdate {
            available_after: Some(now + window(self.config.backoff())),
            ..Default::default()
        };
        let rows = update_transcription_job_tx(&mut tx, media_id, &update).await?;
        ExcommsError::expect_rows(rows, 1, format_args!("transcription job {}", media_id))?;
        tx.commit().await?;
        Ok(Claim::Work(job))
    }

    async fn poll(&self, job_id: &str) -> Result<(TranscriptionJobStatus, String)> {
        let result = tokio::time::timeout(self.config.poll_timeout(), self.provider.job(job_id))
            .await
            .map_err(|_| ExcommsError::Timeout(format!("transcription job {}", job_id)))??;
        Ok((result.status, result.text))
    }

    /// Step 2 tail: publish and mark the job, at most once.
    async fn settle(
        &self,
        request: &TrackTranscriptionRequest,
        settlement: Settlement,
        text: String,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let raw = self
            .db
            .incoming_raw_message(request.raw_message_id)
            .await?
            .ok_or_else(|| ExcommsError::not_found(format!("raw message {}", request.raw_message_id)))?;
        let Some(params) = raw.twilio() else {
            warn!(raw_id = raw.id, "Transcribed voicemail has no telephony payload");
            return Ok(Outcome::Ack);
        };

        let mut tx = self.db.begin_locked(LOCK_TRANSCRIPTION_JOB, &request.media_id).await?;
        match lookup_transcription_job_tx(&mut tx, &request.media_id).await? {
            Some(job) if !job.completed => {}
            _ => return Ok(Outcome::Ack),
        }

        let mut event = IncomingCallEvent::new(voicemail_event_type(request.urgent), params.recording_duration);
        event.voicemail_media_id = request.media_id.clone();
        event.voicemail_duration_ns = request.media_duration_ns;
        event.transcription_text = text;
        self.publisher
            .external_message(&voicemail_message(&raw, params, event))
            .await?;

        let update = TranscriptionJobUpdate {
            completed: Some(true),
            completed_timestamp: Some(now),
            timed_out: (settlement == Settlement::TimedOut).then_some(true),
            errored: (settlement == Settlement::Failed).then_some(true),
            ..Default::default()
        };
        let rows = update_transcription_job_tx(&mut tx, &request.media_id, &update).await?;
        ExcommsError::expect_rows(rows, 1, format_args!("transcription job {}", request.media_id))?;
        tx.commit().await?;

        info!(
            media_id = %request.media_id,
            job_id = %request.job_id,
            ?settlement,
            "Published transcribed voicemail"
        );
        self.publisher
            .cleanup(ResourceKind::Transcription, &request.job_id)
            .await;
        self.publisher
            .cleanup(ResourceKind::Recording, &params.recording_sid)
            .await;
        Ok(Outcome::Ack)
    }
}

#[async_trait]
impl MessageHandler for TranscriptionTracker {
    fn name(&self) -> &'static str {
        "transcription-tracker"
    }

    async fn handle(&self, body: &[u8]) -> Result<Outcome> {
        let request: TrackTranscriptionRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping malformed tracking request: {}", e);
                return Ok(Outcome::Ack);
            }
        };

        let job = match self.claim(&request.media_id).await? {
            Claim::Work(job) => job,
            Claim::Skip(outcome) => return Ok(outcome),
        };

        let now = self.clock.now();
        if now - job.created > window(self.config.deadline()) {
            warn!(media_id = %request.media_id, job_id = %job.job_id, "Transcription timed out");
            return self.settle(&request, Settlement::TimedOut, String::new(), now).await;
        }

        let (status, text) = self.poll(&job.job_id).await?;
        match status {
            TranscriptionJobStatus::Completed => self.settle(&request, Settlement::Completed, text, now).await,
            TranscriptionJobStatus::Failed => {
                warn!(media_id = %request.media_id, job_id = %job.job_id, "Transcription failed");
                self.settle(&request, Settlement::Failed, String::new(), now).await
            }
            TranscriptionJobStatus::Submitted | TranscriptionJobStatus::Processing => {
                debug!(job_id = %job.job_id, ?status, "Transcription still running");
                Ok(Outcome::NotReady)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{test_context, EPOCH};
    use crate::context::{Context, Doubles};
    use crate::events::{ExternalMessage, ExternalMessageItem, IncomingCallEventType};
    use crate::rawmsg::{RawIncoming, RawMessageKind, RawPayload, TwilioParams};
    use chrono::Duration;

    fn tracker(ctx: &Context) -> TranscriptionTracker {
        TranscriptionTracker::new(
            ctx.db.clone(),
            ctx.clock.clone(),
            ctx.transcription.clone(),
            ctx.publisher.clone(),
            ctx.config.transcription.clone(),
        )
    }

    async fn setup(ctx: &Context, doubles: &Doubles, urgent: bool) -> Vec<u8> {
        let raw = RawIncoming {
            id: 11,
            kind: RawMessageKind::TwilioVoicemail,
            timestamp: EPOCH as u64,
            payload: RawPayload::Twilio(TwilioParams {
                from: "+14155550100".into(),
                to: "+12065550100".into(),
                call_sid: "CA1".into(),
                recording_sid: "RE1".into(),
                recording_duration: 20,
                recording_media_id: "m1".into(),
                ..Default::default()
            }),
        };
        let now = ctx.clock.now();
        ctx.db.store_incoming_raw_message(&raw, now).await.unwrap();
        ctx.db
            .insert_transcription_job(&TranscriptionJob {
                media_id: "m1".into(),
                raw_message_id: 11,
                job_id: "job-1".into(),
                created: now,
                available_after: now,
                completed: false,
                timed_out: false,
                errored: false,
                completed_timestamp: None,
            })
            .await
            .unwrap();
        doubles
            .transcription
            .set_result("job-1", TranscriptionJobStatus::Processing, "");
        serde_json::to_vec(&TrackTranscriptionRequest {
            job_id: "job-1".into(),
            media_id: "m1".into(),
            media_duration_ns: 20_000_000_000,
            raw_message_id: 11,
            urgent,
        })
        .unwrap()
    }

    fn voicemails(doubles: &Doubles) -> Vec<IncomingCallEvent> {
        doubles
            .events
            .messages::<ExternalMessage>("external-message")
            .into_iter()
            .filter_map(|m| match m.item {
                ExternalMessageItem::IncomingCallEvent(e) => Some(e),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn running_job_backs_off() {
        let (ctx, doubles, _dir) = test_context().await;
        let body = setup(&ctx, &doubles, false).await;
        let tracker = tracker(&ctx);

        assert_eq!(tracker.handle(&body).await.unwrap(), Outcome::NotReady);
        assert_eq!(doubles.transcription.polls(), 1);
        let job = ctx.db.lookup_transcription_job("m1").await.unwrap().unwrap();
        assert_eq!(job.available_after, ctx.clock.now() + Duration::seconds(60));

        // Inside the backoff the provider is not asked again
        doubles.clock.advance(Duration::seconds(30));
        assert_eq!(tracker.handle(&body).await.unwrap(), Outcome::NotReady);
        assert_eq!(doubles.transcription.polls(), 1);

        doubles.clock.advance(Duration::seconds(31));
        assert_eq!(tracker.handle(&body).await.unwrap(), Outcome::NotReady);
        assert_eq!(doubles.transcription.polls(), 2);
        assert!(voicemails(&doubles).is_empty());
    }

    #[tokio::test]
    async fn completed_transcription_is_published_once() {
        let (ctx, doubles, _dir) = test_context().await;
        let body = setup(&ctx, &doubles, true).await;
        doubles
            .transcription
            .set_result("job-1", TranscriptionJobStatus::Completed, "call me back");
        let tracker = tracker(&ctx);
        let settled_at = ctx.clock.now();

        assert_eq!(tracker.handle(&body).await.unwrap(), Outcome::Ack);
        // Duplicate deliveries are dropped
        doubles.clock.advance(Duration::minutes(5));
        assert_eq!(tracker.handle(&body).await.unwrap(), Outcome::Ack);
        assert_eq!(tracker.handle(&body).await.unwrap(), Outcome::Ack);

        let events = voicemails(&doubles);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, IncomingCallEventType::LeftUrgentVoicemail);
        assert_eq!(events[0].transcription_text, "call me back");
        assert_eq!(events[0].voicemail_media_id, "m1");
        assert_eq!(events[0].duration_secs, 20);

        let message = &doubles.events.messages::<ExternalMessage>("external-message")[0];
        assert_eq!(message.from_channel_id, "+14155550100");
        assert_eq!(message.timestamp, EPOCH as u64);

        let job = ctx.db.lookup_transcription_job("m1").await.unwrap().unwrap();
        assert!(job.completed);
        assert!(!job.timed_out && !job.errored);
        assert_eq!(job.completed_timestamp, Some(settled_at));

        let cleanups: Vec<crate::events::DeleteResourceRequest> = doubles.events.messages("resource-cleanup");
        assert!(cleanups
            .iter()
            .any(|c| c.kind == ResourceKind::Transcription && c.resource_id == "job-1"));
    }

    #[tokio::test]
    async fn failed_transcription_publishes_without_text() {
        let (ctx, doubles, _dir) = test_context().await;
        let body = setup(&ctx, &doubles, false).await;
        doubles
            .transcription
            .set_result("job-1", TranscriptionJobStatus::Failed, "partial");
        let tracker = tracker(&ctx);

        assert_eq!(tracker.handle(&body).await.unwrap(), Outcome::Ack);
        let events = voicemails(&doubles);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, IncomingCallEventType::LeftVoicemail);
        assert_eq!(events[0].transcription_text, "");

        let job = ctx.db.lookup_transcription_job("m1").await.unwrap().unwrap();
        assert!(job.completed && job.errored && !job.timed_out);
        assert!(job.completed_timestamp.is_some());
    }

    #[tokio::test]
    async fn deadline_publishes_without_asking_the_provider() {
        let (ctx, doubles, _dir) = test_context().await;
        let body = setup(&ctx, &doubles, false).await;
        let tracker = tracker(&ctx);

        doubles.clock.advance(Duration::minutes(16));
        assert_eq!(tracker.handle(&body).await.unwrap(), Outcome::Ack);
        assert_eq!(doubles.transcription.polls(), 0);

        let events = voicemails(&doubles);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].transcription_text, "");

        let job = ctx.db.lookup_transcription_job("m1").await.unwrap().unwrap();
        assert!(job.completed && job.timed_out);
        assert_eq!(job.completed_timestamp, Some(ctx.clock.now()));

        let cleanups: Vec<(ResourceKind, String)> = doubles
            .events
            .messages::<crate::events::DeleteResourceRequest>("resource-cleanup")
            .into_iter()
            .map(|c| (c.kind, c.resource_id))
            .collect();
        assert!(cleanups.contains(&(ResourceKind::Transcription, "job-1".to_string())));
        assert!(cleanups.contains(&(ResourceKind::Recording, "RE1".to_string())));
    }

    #[tokio::test]
    async fn late_settlement_after_a_duplicate_publishes_nothing() {
        let (ctx, doubles, _dir) = test_context().await;
        let body = setup(&ctx, &doubles, false).await;
        doubles
            .transcription
            .set_result("job-1", TranscriptionJobStatus::Completed, "see you soon");
        let tracker = tracker(&ctx);
        let request: TrackTranscriptionRequest = serde_json::from_slice(&body).unwrap();

        // First pass claims the attempt, then stalls before settling.
        assert!(matches!(tracker.claim("m1").await.unwrap(), Claim::Work(_)));

        // A duplicate delivery after the backoff claims and settles first.
        doubles.clock.advance(Duration::seconds(61));
        assert_eq!(tracker.handle(&body).await.unwrap(), Outcome::Ack);

        let outcome = tracker
            .settle(&request, Settlement::Completed, "see you soon".into(), ctx.clock.now())
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Ack);
        assert_eq!(voicemails(&doubles).len(), 1);
        let transcription_cleanups = doubles
            .events
            .messages::<crate::events::DeleteResourceRequest>("resource-cleanup")
            .into_iter()
            .filter(|c| c.kind == ResourceKind::Transcription)
            .count();
        assert_eq!(transcription_cleanups, 1);
    }

    #[tokio::test]
    async fn simultaneous_passes_publish_once() {
        let (ctx, doubles, _dir) = test_context().await;
        let body = setup(&ctx, &doubles, false).await;
        doubles
            .transcription
            .set_result("job-1", TranscriptionJobStatus::Completed, "running late");
        let tracker = tracker(&ctx);

        let (a, b) = tokio::join!(tracker.handle(&body), tracker.handle(&body));
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == Outcome::Ack);
        assert_eq!(outcomes, vec![Outcome::NotReady, Outcome::Ack]);
        assert_eq!(voicemails(&doubles).len(), 1);
    }

    #[tokio::test]
    async fn unknown_jobs_and_garbage_are_dropped() {
        let (ctx, _doubles, _dir) = test_context().await;
        let tracker = tracker(&ctx);
        let body = serde_json::to_vec(&TrackTranscriptionRequest {
            job_id: "job-9".into(),
            media_id: "nope".into(),
            media_duration_ns: 0,
            raw_message_id: 1,
            urgent: false,
        })
        .unwrap();
        assert_eq!(tracker.handle(&body).await.unwrap(), Outcome::Ack);
        assert_eq!(tracker.handle(b"[]").await.unwrap(), Outcome::Ack);
    }
}
