//! Provider-initiated outbound calls bridged through a reserved proxy number

use std::collections::HashMap;

use tracing::{debug, info, warn};

use super::{unix_now, TwilioEvent};
use crate::clients::{required_entity, EntityType, ResourceKind, TrackEvent};
use crate::context::Context;
use crate::error::{ExcommsError, Result};
use crate::events::{Direction, ExternalMessage, ExternalMessageItem, OutgoingCallEvent, OutgoingCallEventType};
use crate::phone::{CallerIdSentinel, PhoneNumber};
use crate::rawmsg::{CallStatus, TwilioParams};
use crate::twiml::{DialNumber, Response, Verb};
use crate::types::CallRequest;

const USE_THE_APP: &str = "Outbound calls to patients should be initiated from within the app. Please hang up and \
                           call the patient you are trying to reach by tapping the phone icon within their \
                           conversation thread. Thank you!";
const STATUS_CALLBACK_EVENTS: &str = "ringing answered completed";

/// A provider dialed a proxy number: bridge them to the reserved patient.
pub(super) async fn process_outgoing_call(ctx: &Context, params: &TwilioParams) -> Result<Option<Response>> {
    if let Some(sentinel) = CallerIdSentinel::detect(&params.from) {
        info!(call_sid = %params.call_sid, "Outbound call with {} caller id", sentinel.describe());
        return Ok(Some(
            Response::new()
                .push(Verb::say(format!(
                    "Outbound calls cannot be made from a phone with {} caller ID. We use the phone number you \
                     are calling from to verify your identity and connect the call. Please try again after \
                     unblocking your caller ID.",
                    sentinel.describe()
                )))
                .push(Verb::say("Thank you!")),
        ));
    }

    let originating = PhoneNumber::parse(&params.from)?;
    let proxy = PhoneNumber::parse(&params.to)?;

    let reservation = match ctx.proxy_numbers.active_reservation(&originating, &proxy).await {
        Ok(reservation) => reservation,
        Err(ExcommsError::NotFound(msg)) => {
            warn!(call_sid = %params.call_sid, "Outbound call without reservation: {}", msg);
            return Ok(Some(Response::new().push(Verb::say(USE_THE_APP))));
        }
        Err(e) => return Err(e),
    };

    let org = required_entity(ctx.directory.as_ref(), &reservation.organization_id).await?;
    if org.entity_type != EntityType::Organization {
        return Err(ExcommsError::upstream(format!(
            "entity {} owning proxy {} is not an organization",
            org.id, proxy
        )));
    }
    let practice_phone = org.provisioned_phone().ok_or_else(|| {
        ExcommsError::not_found(format!("no practice phone number for organization {}", org.id))
    })?;

    ctx.proxy_numbers.call_started(&originating, &proxy).await?;
    ctx.db
        .create_call_request(&CallRequest {
            source: originating.clone(),
            destination: reservation.destination_phone_number.clone(),
            proxy: proxy.clone(),
            organization_id: reservation.organization_id.clone(),
            requested: ctx.clock.now(),
            call_sid: params.call_sid.clone(),
            caller_entity_id: reservation.owner_entity_id.clone(),
            callee_entity_id: reservation.destination_entity_id.clone(),
        })
        .await?;

    let callee = required_entity(ctx.directory.as_ref(), &reservation.destination_entity_id).await?;
    let name = callee
        .display_name()
        .map(str::to_string)
        .unwrap_or_else(|| reservation.destination_phone_number.national());
    info!(
        call_sid = %params.call_sid,
        proxy = %proxy,
        destination = %reservation.destination_phone_number,
        "Bridging outbound call"
    );

    Ok(Some(
        Response::new()
            .push(Verb::say(format!("You will be connected to {}", name)))
            .push(Verb::Dial {
                action: None,
                timeout: None,
                caller_id: Some(practice_phone.to_string()),
                numbers: vec![DialNumber::new(reservation.destination_phone_number.as_str())
                    .with_status_callback(
                        STATUS_CALLBACK_EVENTS,
                        ctx.api_url(&TwilioEvent::ProcessOutgoingCallStatus.path()),
                    )],
            }),
    ))
}

/// Status of the dialed patient leg. The call request is keyed by the
/// provider's leg, which is the parent here.
pub(super) async fn process_outgoing_call_status(ctx: &Context, params: &TwilioParams) -> Result<Option<Response>> {
    if params.parent_call_sid.is_empty() {
        debug!(call_sid = %params.call_sid, "Outgoing status without parent call");
        return Ok(None);
    }
    let request = ctx
        .db
        .lookup_call_request(&params.parent_call_sid)
        .await?
        .ok_or_else(|| ExcommsError::not_found(format!("call request for {}", params.parent_call_sid)))?;

    let event_type = match params.call_status {
        CallStatus::Ringing => OutgoingCallEventType::Placed,
        CallStatus::Answered | CallStatus::Completed => {
            ctx.proxy_numbers.call_ended(&request.source, &request.proxy).await?;
            ctx.publisher.cleanup(ResourceKind::Call, &params.call_sid).await;
            ctx.publisher.cleanup(ResourceKind::Call, &params.parent_call_sid).await;
            ctx.tracker.track(TrackEvent {
                event: "outbound_call".to_string(),
                subject: request.caller_entity_id.clone(),
                properties: HashMap::from([
                    ("org_id".to_string(), request.organization_id.clone()),
                    ("destination".to_string(), request.destination.to_string()),
                    ("duration".to_string(), params.call_duration.to_string()),
                ]),
            });
            OutgoingCallEventType::Answered
        }
        other => {
            debug!(call_sid = %params.call_sid, "Ignoring outgoing call status {:?}", other);
            return Ok(None);
        }
    };

    let message = ExternalMessage {
        from_channel_id: request.source.to_string(),
        to_channel_id: request.destination.to_string(),
        timestamp: unix_now(ctx),
        direction: Direction::Outbound,
        item: ExternalMessageItem::OutgoingCallEvent(OutgoingCallEvent {
            event_type,
            duration_secs: params.call_duration,
            caller_entity_id: request.caller_entity_id,
            callee_entity_id: request.callee_entity_id,
        }),
    };
    let publisher = ctx.publisher.clone();
    ctx.tasks
        .go("publish-outgoing-call-event", async move { publisher.external_message(&message).await })
        .await;
    Ok(None)
}
