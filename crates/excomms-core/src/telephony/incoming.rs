//! Inbound calls to a practice number
//!
//! Routing reads the number's settings and either rings the forwarding list
//! with a screening prompt on every leg, or sends the caller to voicemail
//! (or after-hours triage when enabled).

use std::collections::{HashMap, HashSet};

use chrono::Duration;
use tracing::{error, info, warn};

use super::{afterhours, unix_now, TwilioEvent};
use crate::clients::{
    get_boolean, get_single_select, keys, organization_by_contact, ConfigKey, EntityType, ResourceKind, TrackEvent,
};
use crate::config::MAX_FORWARDING_NUMBERS;
use crate::context::Context;
use crate::error::{ExcommsError, Result};
use crate::events::{Direction, ExternalMessage, ExternalMessageItem, IncomingCallEvent, IncomingCallEventType};
use crate::phone::PhoneNumber;
use crate::rawmsg::{CallStatus, RawIncoming, RawMessageKind, RawPayload, TwilioParams};
use crate::twiml::{DialNumber, Response, Verb};
use crate::types::{IncomingCall, IncomingCallUpdate};

const CANNOT_COMPLETE: &str = "Sorry, your call cannot be completed as dialed.";
const TRANSCRIPTION_NOTICE: &str = " Speak slowly and clearly as your message will be transcribed.";
const SCREENING_TIMEOUT_SECS: u32 = 5;
const RECORD_TIMEOUT_SECS: u32 = 60;
const RECORD_MAX_LENGTH_SECS: u32 = 3600;
const GREETING_URL_TTL_HOURS: i64 = 1;

/// Calls shorter than this after the provider picked up count as missed.
fn min_answered() -> Duration {
    Duration::seconds(2)
}

pub(super) async fn process_incoming_call(ctx: &Context, params: &TwilioParams) -> Result<Option<Response>> {
    let source = match PhoneNumber::parse(&params.from) {
        Ok(source) => source,
        Err(_) => {
            warn!(from = %params.from, to = %params.to, "Invalid caller number");
            return Ok(Some(Response::new().push(Verb::say(CANNOT_COMPLETE))));
        }
    };

    let org = organization_by_contact(ctx.directory.as_ref(), &params.to).await?;
    let destination = PhoneNumber::parse(&params.to)?;
    info!(call_sid = %params.call_sid, org_id = %org.id, "Incoming call from {} to {}", source, destination);

    let call = IncomingCall::new(&params.call_sid, source.clone(), destination.clone(), &org.id, ctx.clock.now());
    ctx.db.create_incoming_call(&call).await?;

    if ctx.db.blocked_numbers(&destination).await?.includes(&source) {
        info!(call_sid = %params.call_sid, "Rejecting call from blocked number {}", source);
        return Ok(Some(Response::new().push(Verb::Reject {
            reason: "busy".to_string(),
        })));
    }

    let org_name = org.display_name().map(str::to_string);
    route(ctx, &org.id, org_name.as_deref(), params).await
}

/// Ring the forwarding list or fall back to voicemail.
async fn route(ctx: &Context, org_id: &str, org_name: Option<&str>, params: &TwilioParams) -> Result<Option<Response>> {
    let wanted = [
        keys::SEND_CALLS_TO_VOICEMAIL,
        keys::AFTERHOURS_VOICEMAIL_ENABLED,
        keys::FORWARDING_LIST_TIMEOUT,
        keys::FORWARDING_LIST,
        keys::PAUSE_BEFORE_CALL_CONNECT,
        keys::EXPOSE_CALLER,
    ]
    .map(|key| ConfigKey::with_subkey(key, &params.to));
    let values = ctx.settings.get_values(org_id, &wanted).await?;
    if values.len() != wanted.len() {
        return Err(ExcommsError::upstream(format!(
            "expected {} settings for {} but got {}",
            wanted.len(),
            org_id,
            values.len()
        )));
    }

    let send_all = values[0].as_bool().unwrap_or(false);
    let afterhours_enabled = values[1].as_bool().unwrap_or(false);
    let timeout = values[2].as_integer().unwrap_or(30);
    let forwarding_list = values[3].as_string_list().unwrap_or_default();
    let pause = values[4].as_integer().unwrap_or(0);
    let expose_caller = values[5].as_bool().unwrap_or(false);

    if send_all && afterhours_enabled {
        return afterhours::triage(ctx, org_id, org_name, params).await;
    } else if send_all {
        return voicemail(ctx, params).await;
    }

    let numbers = forwarding_numbers(org_id, forwarding_list, &params.to);
    if numbers.is_empty() {
        if afterhours_enabled {
            return afterhours::triage(ctx, org_id, org_name, params).await;
        }
        return voicemail(ctx, params).await;
    }

    // The call resource is deleted once the call is over
    ctx.publisher.cleanup(ResourceKind::Call, &params.call_sid).await;

    let mut response = Response::new();
    if pause > 0 {
        response = response.push(Verb::Pause {
            length: u32::try_from(pause).unwrap_or(u32::MAX),
        });
    }
    let caller_id = if expose_caller { &params.from } else { &params.to };
    Ok(Some(response.push(Verb::Dial {
        action: Some(TwilioEvent::ProcessDialedCallStatus.path()),
        timeout: Some(u32::try_from(timeout).unwrap_or(30)),
        caller_id: Some(caller_id.clone()),
        numbers,
    })))
}

/// Numbers to ring simultaneously: deduplicated, valid, never the dialed
/// number itself, and at most [`MAX_FORWARDING_NUMBERS`].
fn forwarding_numbers(org_id: &str, list: &[String], dialed: &str) -> Vec<DialNumber> {
    let mut seen = HashSet::with_capacity(list.len());
    let mut numbers = Vec::with_capacity(MAX_FORWARDING_NUMBERS);
    for raw in list {
        if !seen.insert(raw.as_str()) {
            continue;
        }
        let number = match PhoneNumber::parse(raw) {
            Ok(number) => number,
            Err(e) => {
                error!(org_id, "Skipping forwarding number {}: {}", raw, e);
                continue;
            }
        };
        if numbers.len() == MAX_FORWARDING_NUMBERS {
            error!(
                org_id,
                "Forwarding list has more than {} numbers, the rest are not called", MAX_FORWARDING_NUMBERS
            );
            break;
        }
        if number.as_str() == dialed {
            warn!(org_id, "Forwarding list contains the dialed number {}", dialed);
            continue;
        }
        numbers.push(DialNumber::new(number.as_str()).with_url(TwilioEvent::ProviderCallConnected.path()));
    }
    numbers
}

/// Voicemail, or after-hours triage when the number has it enabled.
pub(super) async fn send_to_voicemail(ctx: &Context, org_id: &str, params: &TwilioParams) -> Result<Option<Response>> {
    let key = ConfigKey::with_subkey(keys::AFTERHOURS_VOICEMAIL_ENABLED, &params.to);
    if get_boolean(ctx.settings.as_ref(), org_id, key).await? {
        let org_name = match ctx.directory.entity(org_id).await {
            Ok(org) => org.and_then(|o| o.display_name().map(str::to_string)),
            Err(e) => {
                error!(org_id, "Unable to look up organization name: {}", e);
                None
            }
        };
        return afterhours::triage(ctx, org_id, org_name.as_deref(), params).await;
    }
    voicemail(ctx, params).await
}

/// A forwarding-list leg picked up: screen the call before connecting.
pub(super) async fn provider_call_connected(ctx: &Context, params: &TwilioParams) -> Result<Option<Response>> {
    info!(parent_call_sid = %params.parent_call_sid, "Call connected for provider at {}", params.to);
    let call = incoming_call(ctx, &params.parent_call_sid).await?;

    let screening_key = ConfigKey::with_subkey(keys::CALL_SCREENING_ENABLED, call.destination.as_str());
    let screening = match get_boolean(ctx.settings.as_ref(), &call.organization_id, screening_key).await {
        Ok(enabled) => enabled,
        Err(e) => {
            error!(org_id = %call.organization_id, "Unable to read call screening setting: {}", e);
            true
        }
    };
    if !screening {
        mark_answered(ctx, &params.parent_call_sid).await?;
        return Ok(Some(Response::new()));
    }

    let name = match external_entity_name(ctx, &call.source, &call.organization_id).await {
        Ok(Some(name)) => name,
        Ok(None) => call.source.national(),
        Err(e) => {
            error!(parent_call_sid = %params.parent_call_sid, "Unable to determine caller name: {}", e);
            call.source.national()
        }
    };

    Ok(Some(
        Response::new()
            .push(Verb::gather_digit(
                TwilioEvent::ProviderEnteredDigits.path(),
                SCREENING_TIMEOUT_SECS,
                vec![
                    Verb::say(format!("You have an incoming call from {}", name)),
                    Verb::say("Press 1 to answer."),
                ],
            ))
            // No key hangs up this leg so the caller reaches voicemail
            .push(Verb::Hangup),
    ))
}

pub(super) async fn provider_entered_digits(ctx: &Context, params: &TwilioParams) -> Result<Option<Response>> {
    info!(parent_call_sid = %params.parent_call_sid, "Provider entered digits {:?} at {}", params.digits, params.to);
    if params.digits == "1" {
        mark_answered(ctx, &params.parent_call_sid).await?;
        return Ok(Some(Response::new()));
    }
    provider_call_connected(ctx, params).await
}

/// Greeting and record block for a caller sent to voicemail.
pub(super) async fn voicemail(ctx: &Context, params: &TwilioParams) -> Result<Option<Response>> {
    let org = organization_by_contact(ctx.directory.as_ref(), &params.to).await?;
    let custom = custom_greeting_url(ctx, &org.id, keys::VOICEMAIL_OPTION, &params.to).await;
    let transcribe = transcribe_enabled(ctx, &org.id).await;

    let notice = transcription_notice(transcribe);
    let greeting = match custom {
        Some(url) => Verb::play(url),
        None => Verb::say(match org.display_name() {
            Some(name) => format!("You have reached {}. Please leave a message after the tone.{}", name, notice),
            None => format!("Please leave a message after the tone.{}", notice),
        }),
    };

    // The Dial action arrives on the caller's leg, a screened leg carries the parent
    let call_sid = if params.parent_call_sid.is_empty() {
        &params.call_sid
    } else {
        &params.parent_call_sid
    };
    update_call(
        ctx,
        call_sid,
        IncomingCallUpdate {
            sent_to_voicemail: Some(true),
            ..Default::default()
        },
    )
    .await?;

    Ok(Some(
        Response::new()
            .push(greeting)
            .push(record(transcribe, TwilioEvent::ProcessVoicemail)),
    ))
}

/// Record verb that hands the recording to `process` either as its action or,
/// when transcribing, as the transcription callback.
pub(super) fn record(transcribe: bool, process: TwilioEvent) -> Verb {
    let (action, callback) = if transcribe {
        (TwilioEvent::NoOp, process)
    } else {
        (process, TwilioEvent::NoOp)
    };
    Verb::Record {
        action: action.path(),
        timeout: RECORD_TIMEOUT_SECS,
        // Longer than the provider can transcribe, so long messages still record
        max_length: RECORD_MAX_LENGTH_SECS,
        transcribe_callback: Some(callback.path()),
        play_beep: true,
    }
}

pub(super) fn transcription_notice(transcribe: bool) -> &'static str {
    if transcribe { TRANSCRIPTION_NOTICE } else { "" }
}

/// End-of-call callback, or the outcome of the dialed legs when the
/// provider reports one.
pub(super) async fn process_incoming_call_status(ctx: &Context, params: &TwilioParams) -> Result<Option<Response>> {
    if params.dial_call_status != CallStatus::Undefined {
        return dial_outcome(ctx, params).await;
    }
    if !matches!(params.call_status, CallStatus::Completed | CallStatus::NoAnswer) {
        return Ok(None);
    }

    let now = ctx.clock.now();
    update_call(
        ctx,
        &params.call_sid,
        IncomingCallUpdate {
            completed: Some(true),
            completed_time: Some(now),
            ..Default::default()
        },
    )
    .await?;
    let call = incoming_call(ctx, &params.call_sid).await?;

    let answered_for = call.answered_time.filter(|_| call.answered).map(|t| now - t);
    match answered_for {
        Some(elapsed) if elapsed > min_answered() => {
            let duration = u32::try_from(elapsed.num_seconds()).unwrap_or_default();
            publish_call_event(ctx, params, IncomingCallEventType::Answered, duration).await;
            track(ctx, &params.call_sid, "answered");
        }
        _ => {
            let settings = ctx.settings.clone();
            let publisher = ctx.publisher.clone();
            let org_id = call.organization_id.clone();
            let message = incoming_call_message(ctx, params, IncomingCallEventType::Unanswered, 0);
            let key = ConfigKey::with_subkey(keys::SEND_CALLS_TO_VOICEMAIL, &params.to);
            ctx.tasks
                .go("publish-missed-call", async move {
                    // Calls sent straight to voicemail are not missed
                    if get_boolean(settings.as_ref(), &org_id, key).await? {
                        return Ok(());
                    }
                    publisher.external_message(&message).await
                })
                .await;
            track(ctx, &params.call_sid, "missed-call");
        }
    }
    Ok(None)
}

async fn dial_outcome(ctx: &Context, params: &TwilioParams) -> Result<Option<Response>> {
    if !params.dial_call_status.is_answered() {
        let call = incoming_call(ctx, &params.call_sid).await?;
        return send_to_voicemail(ctx, &call.organization_id, params).await;
    }
    publish_call_event(ctx, params, IncomingCallEventType::Answered, params.dial_call_duration).await;
    track(ctx, &params.call_sid, "answered");
    ctx.publisher.cleanup(ResourceKind::Call, &params.dial_call_sid).await;
    Ok(None)
}

/// Action of the forwarding `Dial`, posted on the caller's leg.
pub(super) async fn process_dialed_call_status(ctx: &Context, params: &TwilioParams) -> Result<Option<Response>> {
    if params.call_status != CallStatus::InProgress {
        return Ok(None);
    }
    match params.dial_call_status {
        CallStatus::Answered | CallStatus::Completed | CallStatus::Undefined => {
            ctx.publisher.cleanup(ResourceKind::Call, &params.dial_call_sid).await;
            Ok(None)
        }
        _ => {
            let call = incoming_call(ctx, &params.call_sid).await?;
            send_to_voicemail(ctx, &call.organization_id, params).await
        }
    }
}

pub(super) async fn process_voicemail(ctx: &Context, params: &TwilioParams) -> Result<Option<Response>> {
    store_voicemail(ctx, params, false).await?;
    Ok(None)
}

/// Store the recording for the raw-message worker and mark the call.
/// After-hours voicemails also complete the call.
pub(super) async fn store_voicemail(ctx: &Context, params: &TwilioParams, completes_call: bool) -> Result<()> {
    let now = ctx.clock.now();
    let raw = RawIncoming {
        id: ctx.ids.next_id(),
        kind: RawMessageKind::TwilioVoicemail,
        timestamp: unix_now(ctx),
        payload: RawPayload::Twilio(params.clone()),
    };
    ctx.db.store_incoming_raw_message(&raw, now).await?;

    let mut update = IncomingCallUpdate {
        left_voicemail: Some(true),
        left_voicemail_time: Some(now),
        ..Default::default()
    };
    if completes_call {
        update.completed = Some(true);
        update.completed_time = Some(now);
    }
    update_call(ctx, &params.call_sid, update).await?;
    track(ctx, &params.call_sid, "voicemail");

    // Published before answering so a lost notification surfaces as a
    // provider retry.
    ctx.publisher.raw_message_stored(raw.id).await?;
    Ok(())
}

/// Signed URL of a custom greeting when the single-select `key` picks one.
/// Failures fall back to the spoken default.
pub(super) async fn custom_greeting_url(ctx: &Context, org_id: &str, key: &str, number: &str) -> Option<String> {
    let (option, media_id) =
        match get_single_select(ctx.settings.as_ref(), org_id, ConfigKey::with_subkey(key, number)).await {
            Ok(value) => value,
            Err(e) => {
                error!(org_id, number, "Unable to read {}: {}", key, e);
                return None;
            }
        };
    if option != keys::VOICEMAIL_OPTION_CUSTOM {
        return None;
    }
    if media_id.is_empty() {
        error!(org_id, number, "Custom greeting selected for {} without media", key);
        return None;
    }
    let expires = ctx.clock.now() + Duration::hours(GREETING_URL_TTL_HOURS);
    match ctx.signer.sign(&media_id, expires) {
        Ok(url) => Some(url),
        Err(e) => {
            error!(org_id, media_id = %media_id, "Unable to sign greeting url: {}", e);
            None
        }
    }
}

/// Unknown means no transcription.
pub(super) async fn transcribe_enabled(ctx: &Context, org_id: &str) -> bool {
    match get_boolean(ctx.settings.as_ref(), org_id, ConfigKey::new(keys::TRANSCRIBE_VOICEMAIL)).await {
        Ok(enabled) => enabled,
        Err(e) => {
            error!(org_id, "Unable to read transcription setting: {}", e);
            false
        }
    }
}

pub(super) async fn incoming_call(ctx: &Context, call_sid: &str) -> Result<IncomingCall> {
    ctx.db
        .lookup_incoming_call(call_sid)
        .await?
        .ok_or_else(|| ExcommsError::not_found(format!("incoming call {}", call_sid)))
}

/// Apply `update` to exactly one call row.
pub(super) async fn update_call(ctx: &Context, call_sid: &str, update: IncomingCallUpdate) -> Result<()> {
    let rows = ctx.db.update_incoming_call(call_sid, &update).await?;
    ExcommsError::expect_rows(rows, 1, format_args!("incoming call {}", call_sid))
}

async fn mark_answered(ctx: &Context, call_sid: &str) -> Result<()> {
    update_call(
        ctx,
        call_sid,
        IncomingCallUpdate {
            answered: Some(true),
            answered_time: Some(ctx.clock.now()),
            ..Default::default()
        },
    )
    .await
}

/// Display name of the organization's patient calling from `number`
async fn external_entity_name(ctx: &Context, number: &PhoneNumber, org_id: &str) -> Result<Option<String>> {
    let entities = ctx.directory.entities_by_contact(number.as_str()).await?;
    Ok(entities
        .iter()
        .filter(|e| e.entity_type == EntityType::External && e.is_member_of(org_id))
        .find_map(|e| e.display_name().map(str::to_string)))
}

fn incoming_call_message(
    ctx: &Context,
    params: &TwilioParams,
    event_type: IncomingCallEventType,
    duration_secs: u32,
) -> ExternalMessage {
    ExternalMessage {
        from_channel_id: params.from.clone(),
        to_channel_id: params.to.clone(),
        timestamp: unix_now(ctx),
        direction: Direction::Inbound,
        item: ExternalMessageItem::IncomingCallEvent(IncomingCallEvent::new(event_type, duration_secs)),
    }
}

async fn publish_call_event(
    ctx: &Context,
    params: &TwilioParams,
    event_type: IncomingCallEventType,
    duration_secs: u32,
) {
    let message = incoming_call_message(ctx, params, event_type, duration_secs);
    let publisher = ctx.publisher.clone();
    ctx.tasks
        .go("publish-incoming-call-event", async move { publisher.external_message(&message).await })
        .await;
}

fn track(ctx: &Context, call_sid: &str, kind: &str) {
    ctx.tracker.track(TrackEvent {
        event: "inbound_call".to_string(),
        subject: call_sid.to_string(),
        properties: HashMap::from([("type".to_string(), kind.to_string())]),
    });
}
