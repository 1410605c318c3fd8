//! Telephony and email provider webhooks

use std::collections::HashMap;
use std::str::FromStr;

use axum::extract::{Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Form;
use tracing::{debug, info};

use super::{ApiState, WebhookError};
use crate::context::Context;
use crate::error::ExcommsError;
use crate::rawmsg::{EmailAttachment, RawIncoming, RawMessageKind, RawPayload, SendgridParams, TwilioParams};
use crate::telephony::TwilioEvent;

/// Inbound email posts carry their attachments inline
pub(super) const EMAIL_BODY_LIMIT: usize = 25 * 1024 * 1024;

type WebhookResult = std::result::Result<Response, WebhookError>;

pub(super) async fn incoming_sms(
    State(state): State<ApiState>,
    Form(form): Form<HashMap<String, String>>,
) -> WebhookResult {
    let params = TwilioParams::from_form(&form);
    debug!(message_sid = %params.message_sid, "Inbound SMS");
    ingest(&state.ctx, RawMessageKind::TwilioSms, RawPayload::Twilio(params)).await?;
    Ok(StatusCode::OK.into_response())
}

pub(super) async fn call_event(
    State(state): State<ApiState>,
    Path(event): Path<String>,
    Form(form): Form<HashMap<String, String>>,
) -> WebhookResult {
    let event = TwilioEvent::from_str(&event)?;
    let params = TwilioParams::from_form(&form);
    match state.events.process(event, &params).await? {
        Some(markup) => {
            let xml = markup.render()?;
            Ok(([(header::CONTENT_TYPE, "text/xml")], xml).into_response())
        }
        None => Ok(StatusCode::OK.into_response()),
    }
}

/// Parse-webhook post: text fields plus one file part per attachment.
/// Attachments are stored as media before the raw message is written.
pub(super) async fn incoming_email(State(state): State<ApiState>, mut multipart: Multipart) -> WebhookResult {
    let mut form = HashMap::new();
    let mut stored = Vec::new();

    while let Some(field) = multipart.next_field().await.map_err(malformed)? {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(file_name) => {
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let data = field.bytes().await.map_err(malformed)?;
                let media = state
                    .ctx
                    .uploader
                    .save(data.to_vec(), &content_type, Some(file_name))
                    .await?;
                stored.push(media);
            }
            None => {
                let value = field.text().await.map_err(malformed)?;
                form.insert(name, value);
            }
        }
    }

    let mut params = SendgridParams::from_form(&form);
    params.attachments = stored
        .iter()
        .map(|m| EmailAttachment {
            media_id: m.id.clone(),
            name: m.name.clone().unwrap_or_default(),
            content_type: m.mime_type.clone(),
        })
        .collect();
    if !stored.is_empty() {
        state.ctx.db.store_media(&stored).await?;
    }

    debug!(attachments = stored.len(), "Inbound email");
    ingest(&state.ctx, RawMessageKind::SendgridEmail, RawPayload::Sendgrid(params)).await?;
    Ok(StatusCode::OK.into_response())
}

fn malformed(e: axum::extract::multipart::MultipartError) -> WebhookError {
    ExcommsError::invalid_argument(format!("malformed multipart body: {}", e)).into()
}

/// Persist the payload verbatim, then announce it to the raw-message
/// worker. A failed announcement fails the webhook so the provider retries.
async fn ingest(ctx: &Context, kind: RawMessageKind, payload: RawPayload) -> crate::error::Result<u64> {
    let raw = RawIncoming {
        id: ctx.ids.next_id(),
        kind,
        timestamp: u64::try_from(ctx.clock.now().timestamp()).unwrap_or_default(),
        payload,
    };
    ctx.db.store_incoming_raw_message(&raw, ctx.clock.now()).await?;
    ctx.publisher.raw_message_stored(raw.id).await?;
    info!(raw_id = raw.id, kind = ?kind, "Stored inbound message");
    Ok(raw.id)
}
