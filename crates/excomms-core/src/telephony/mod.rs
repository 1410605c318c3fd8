//! # Telephony webhook state machines
//!
//! The telephony provider drives every call by posting lifecycle events to
//! `/twilio/call/{event}` and executing whatever markup comes back. A call's
//! state is the stored [`IncomingCall`](crate::types::IncomingCall) or
//! [`CallRequest`](crate::types::CallRequest) row combined with the event
//! that just arrived.
//!
//! ```text
//!  process_incoming_call
//!          │
//!          ├── blocked caller ─────────────► Reject
//!          ├── send-all + after-hours ─────► afterhours_greeting ─► digits ─► afterhours_voicemail
//!          ├── send-all / empty list ──────► voicemail ─► process_voicemail
//!          └── forwarding list ────────────► Dial ─► provider_call_connected ─► provider_entered_digits
//!                                                │
//!                                                └─► process_dialed_call_status ─► voicemail on no answer
//!
//!  process_outgoing_call ─► Say + Dial ─► process_outgoing_call_status
//! ```
//!
//! Handlers return `None` when the provider only needs an empty `200`.

use std::fmt;
use std::str::FromStr;

use tracing::{debug, warn};

use crate::clients::ResourceKind;
use crate::context::Context;
use crate::error::{ExcommsError, Result};
use crate::rawmsg::{MessageStatus, TwilioParams};
use crate::twiml::Response;
use crate::types::CallEvent;

mod afterhours;
mod incoming;
mod outgoing;

#[cfg(test)]
mod test_support;

/// Lifecycle events posted by the telephony provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TwilioEvent {
    ProcessIncomingCall,
    ProcessIncomingCallStatus,
    ProcessDialedCallStatus,
    ProcessVoicemail,
    ProviderCallConnected,
    ProviderEnteredDigits,
    TwimlVoicemail,
    ProcessOutgoingCall,
    ProcessOutgoingCallStatus,
    ProcessSmsStatus,
    AfterhoursGreeting,
    AfterhoursPatientEnteredDigits,
    AfterhoursVoicemail,
    AfterhoursProcessVoicemail,
    NoOp,
}

impl TwilioEvent {
    pub const ALL: [TwilioEvent; 15] = [
        Self::ProcessIncomingCall,
        Self::ProcessIncomingCallStatus,
        Self::ProcessDialedCallStatus,
        Self::ProcessVoicemail,
        Self::ProviderCallConnected,
        Self::ProviderEnteredDigits,
        Self::TwimlVoicemail,
        Self::ProcessOutgoingCall,
        Self::ProcessOutgoingCallStatus,
        Self::ProcessSmsStatus,
        Self::AfterhoursGreeting,
        Self::AfterhoursPatientEnteredDigits,
        Self::AfterhoursVoicemail,
        Self::AfterhoursProcessVoicemail,
        Self::NoOp,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProcessIncomingCall => "process_incoming_call",
            Self::ProcessIncomingCallStatus => "process_incoming_call_status",
            Self::ProcessDialedCallStatus => "process_dialed_call_status",
            Self::ProcessVoicemail => "process_voicemail",
            Self::ProviderCallConnected => "provider_call_connected",
            Self::ProviderEnteredDigits => "provider_entered_digits",
            Self::TwimlVoicemail => "twiml_voicemail",
            Self::ProcessOutgoingCall => "process_outgoing_call",
            Self::ProcessOutgoingCallStatus => "process_outgoing_call_status",
            Self::ProcessSmsStatus => "process_sms_status",
            Self::AfterhoursGreeting => "afterhours_greeting",
            Self::AfterhoursPatientEnteredDigits => "afterhours_patient_entered_digits",
            Self::AfterhoursVoicemail => "afterhours_voicemail",
            Self::AfterhoursProcessVoicemail => "afterhours_process_voicemail",
            Self::NoOp => "no_op",
        }
    }

    /// Route the provider posts this event to, relative to the API root
    pub fn path(self) -> String {
        format!("/twilio/call/{}", self.as_str())
    }
}

impl fmt::Display for TwilioEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TwilioEvent {
    type Err = ExcommsError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|e| e.as_str() == s)
            .ok_or_else(|| ExcommsError::invalid_argument(format!("unknown event: {}", s)))
    }
}

/// Dispatches provider events to the call state machines
#[derive(Clone)]
pub struct EventsHandler {
    ctx: Context,
}

impl EventsHandler {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// Handle one event and return the markup to answer with.
    ///
    /// Successfully handled events are logged to the event table on a
    /// detached task.
    pub async fn process(&self, event: TwilioEvent, params: &TwilioParams) -> Result<Option<Response>> {
        debug!(event = %event, call_sid = %params.call_sid, "Handling telephony event");
        let ctx = &self.ctx;
        let response = match event {
            TwilioEvent::ProcessIncomingCall => incoming::process_incoming_call(ctx, params).await?,
            TwilioEvent::ProcessIncomingCallStatus => incoming::process_incoming_call_status(ctx, params).await?,
            TwilioEvent::ProcessDialedCallStatus => incoming::process_dialed_call_status(ctx, params).await?,
            TwilioEvent::ProcessVoicemail => incoming::process_voicemail(ctx, params).await?,
            TwilioEvent::ProviderCallConnected => incoming::provider_call_connected(ctx, params).await?,
            TwilioEvent::ProviderEnteredDigits => incoming::provider_entered_digits(ctx, params).await?,
            TwilioEvent::TwimlVoicemail => incoming::voicemail(ctx, params).await?,
            TwilioEvent::ProcessOutgoingCall => outgoing::process_outgoing_call(ctx, params).await?,
            TwilioEvent::ProcessOutgoingCallStatus => outgoing::process_outgoing_call_status(ctx, params).await?,
            TwilioEvent::ProcessSmsStatus => process_sms_status(ctx, params).await,
            TwilioEvent::AfterhoursGreeting => afterhours::greeting(ctx, params).await?,
            TwilioEvent::AfterhoursPatientEnteredDigits => afterhours::patient_entered_digits(ctx, params).await?,
            TwilioEvent::AfterhoursVoicemail => afterhours::voicemail(ctx, params).await?,
            TwilioEvent::AfterhoursProcessVoicemail => afterhours::process_voicemail(ctx, params).await?,
            TwilioEvent::NoOp => None,
        };

        self.log_event(event, params).await;
        Ok(response)
    }

    async fn log_event(&self, event: TwilioEvent, params: &TwilioParams) {
        let db = self.ctx.db.clone();
        let clock = self.ctx.clock.clone();
        let record = CallEvent {
            source: params.from.clone(),
            destination: params.to.clone(),
            event: event.as_str().to_string(),
            data: serde_json::to_value(params).unwrap_or_default(),
        };
        self.ctx
            .tasks
            .go("log-call-event", async move { db.log_call_event(&record, clock.now()).await })
            .await;
    }
}

/// Delivered messages are cleaned up at the provider; failures are only
/// logged for investigation.
async fn process_sms_status(ctx: &Context, params: &TwilioParams) -> Option<Response> {
    match params.message_status {
        MessageStatus::Delivered => {
            ctx.publisher.cleanup(ResourceKind::Sms, &params.message_sid).await;
        }
        MessageStatus::Failed | MessageStatus::Undelivered => {
            warn!(message_sid = %params.message_sid, to = %params.to, "Outbound SMS failed to send");
        }
        _ => {}
    }
    None
}

/// Unix seconds for published messages
fn unix_now(ctx: &Context) -> u64 {
    u64::try_from(ctx.clock.now().timestamp()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::test_context;
    use crate::events::DeleteResourceRequest;

    #[test]
    fn event_names_round_trip_through_paths() {
        for event in TwilioEvent::ALL {
            assert_eq!(event.as_str().parse::<TwilioEvent>().unwrap(), event);
            assert_eq!(event.path(), format!("/twilio/call/{}", event));
        }
        assert!(matches!(
            "process_everything".parse::<TwilioEvent>(),
            Err(ExcommsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn handled_events_are_logged() {
        let (ctx, _doubles, _dir) = test_context().await;
        let handler = EventsHandler::new(ctx.clone());
        let params = TwilioParams {
            from: "+14155550100".into(),
            to: "+12065550100".into(),
            ..Default::default()
        };

        let response = handler.process(TwilioEvent::NoOp, &params).await.unwrap();
        assert!(response.is_none());
        assert_eq!(ctx.db.call_event_count("no_op").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delivered_sms_is_cleaned_up() {
        let (ctx, doubles, _dir) = test_context().await;
        let handler = EventsHandler::new(ctx);
        let mut params = TwilioParams {
            message_sid: "SM1".into(),
            message_status: MessageStatus::Failed,
            ..Default::default()
        };
        handler.process(TwilioEvent::ProcessSmsStatus, &params).await.unwrap();
        assert_eq!(doubles.events.count("resource-cleanup"), 0);

        params.message_status = MessageStatus::Delivered;
        handler.process(TwilioEvent::ProcessSmsStatus, &params).await.unwrap();
        let requests: Vec<DeleteResourceRequest> = doubles.events.messages("resource-cleanup");
        assert_eq!(
            requests,
            vec![DeleteResourceRequest {
                kind: ResourceKind::Sms,
                resource_id: "SM1".into()
            }]
        );
    }
}
