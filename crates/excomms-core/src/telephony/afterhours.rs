//! After-hours triage: emergency notice, urgency choice, then voicemail.

use tracing::info;

use super::incoming::{
    custom_greeting_url, record, store_voicemail, transcribe_enabled, transcription_notice, update_call,
};
use super::TwilioEvent;
use crate::clients::{keys, organization_by_contact};
use crate::context::Context;
use crate::error::Result;
use crate::rawmsg::TwilioParams;
use crate::twiml::{Response, Verb};
use crate::types::IncomingCallUpdate;

const DIGITS_TIMEOUT_SECS: u32 = 5;

/// Greeting webhook; also where an unanswered prompt redirects back to.
pub(super) async fn greeting(ctx: &Context, params: &TwilioParams) -> Result<Option<Response>> {
    let org = organization_by_contact(ctx.directory.as_ref(), &params.to).await?;
    triage(ctx, &org.id, org.display_name(), params).await
}

pub(super) async fn triage(
    ctx: &Context,
    org_id: &str,
    org_name: Option<&str>,
    params: &TwilioParams,
) -> Result<Option<Response>> {
    info!(call_sid = %params.call_sid, org_id, "After-hours greeting");
    update_call(
        ctx,
        &params.call_sid,
        IncomingCallUpdate {
            afterhours: Some(true),
            ..Default::default()
        },
    )
    .await?;

    let prompt = match custom_greeting_url(ctx, org_id, keys::AFTERHOURS_GREETING_OPTION, &params.to).await {
        Some(url) => vec![Verb::play(url)],
        None => {
            let emergency = "If this is an emergency, please hang up and dial 9 1 1.";
            vec![
                Verb::say(match org_name {
                    Some(name) => format!("You have reached {}. {}", name, emergency),
                    None => emergency.to_string(),
                }),
                Verb::say("Otherwise, press 1 to leave an urgent message, 2 to leave a non-urgent message."),
            ]
        }
    };

    Ok(Some(
        Response::new()
            .push(Verb::gather_digit(
                TwilioEvent::AfterhoursPatientEnteredDigits.path(),
                DIGITS_TIMEOUT_SECS,
                prompt,
            ))
            .push(Verb::redirect(TwilioEvent::AfterhoursGreeting.path())),
    ))
}

pub(super) async fn patient_entered_digits(ctx: &Context, params: &TwilioParams) -> Result<Option<Response>> {
    let urgent = match params.digits.as_str() {
        "1" => true,
        "2" => false,
        _ => return greeting(ctx, params).await,
    };
    // Pressing the same digit again leaves the row untouched
    let rows = ctx.db.set_urgent_if_changed(&params.call_sid, urgent).await?;
    info!(call_sid = %params.call_sid, urgent, changed = rows > 0, "After-hours urgency chosen");
    Ok(Some(
        Response::new().push(Verb::redirect(TwilioEvent::AfterhoursVoicemail.path())),
    ))
}

pub(super) async fn voicemail(ctx: &Context, params: &TwilioParams) -> Result<Option<Response>> {
    let org = organization_by_contact(ctx.directory.as_ref(), &params.to).await?;
    let transcribe = transcribe_enabled(ctx, &org.id).await;
    update_call(
        ctx,
        &params.call_sid,
        IncomingCallUpdate {
            sent_to_voicemail: Some(true),
            ..Default::default()
        },
    )
    .await?;

    Ok(Some(
        Response::new()
            .push(Verb::say(format!(
                "Please leave a message after the tone.{}",
                transcription_notice(transcribe)
            )))
            .push(record(transcribe, TwilioEvent::AfterhoursProcessVoicemail)),
    ))
}

pub(super) async fn process_voicemail(ctx: &Context, params: &TwilioParams) -> Result<Option<Response>> {
    store_voicemail(ctx, params, true).await?;
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::super::incoming::process_incoming_call;
    use super::super::test_support::*;
    use super::*;
    use crate::clients::{ConfigKey, SettingValue};
    use crate::context::test_support::test_context;
    use crate::context::Doubles;
    use crate::phone::PhoneNumber;
    use pretty_assertions::assert_eq;

    fn afterhours_all_calls(doubles: &Doubles) {
        for key in [keys::SEND_CALLS_TO_VOICEMAIL, keys::AFTERHOURS_VOICEMAIL_ENABLED] {
            doubles.settings.set(
                ORG_ID,
                ConfigKey::with_subkey(key, PRACTICE_PHONE),
                SettingValue::Boolean(true),
            );
        }
    }

    fn render(response: Option<Response>) -> String {
        body(&response.expect("markup").render().unwrap()).to_string()
    }

    fn digits(d: &str) -> TwilioParams {
        TwilioParams {
            digits: d.into(),
            ..inbound_params()
        }
    }

    #[tokio::test]
    async fn incoming_call_is_triaged() {
        let (ctx, doubles, _dir) = test_context().await;
        seed_practice(&doubles, Some("Dewabi Corp"));
        afterhours_all_calls(&doubles);

        let xml = render(process_incoming_call(&ctx, &inbound_params()).await.unwrap());
        assert_eq!(
            xml,
            "<Response><Gather action=\"/twilio/call/afterhours_patient_entered_digits\" method=\"POST\" \
             timeout=\"5\" numDigits=\"1\"><Say voice=\"alice\">You have reached Dewabi Corp. If this is an \
             emergency, please hang up and dial 9 1 1.</Say><Say voice=\"alice\">Otherwise, press 1 to leave \
             an urgent message, 2 to leave a non-urgent message.</Say></Gather>\
             <Redirect>/twilio/call/afterhours_greeting</Redirect></Response>"
        );
        let call = ctx.db.lookup_incoming_call(CALL_SID).await.unwrap().unwrap();
        assert!(call.afterhours);
        assert!(!call.sent_to_voicemail);
    }

    #[tokio::test]
    async fn custom_greeting_replaces_spoken_prompt() {
        let (ctx, doubles, _dir) = test_context().await;
        seed_practice(&doubles, None);
        afterhours_all_calls(&doubles);
        doubles.settings.set(
            ORG_ID,
            ConfigKey::with_subkey(keys::AFTERHOURS_GREETING_OPTION, PRACTICE_PHONE),
            SettingValue::SingleSelect {
                id: keys::VOICEMAIL_OPTION_CUSTOM.into(),
                free_text: "ah-greeting".into(),
            },
        );

        let response = process_incoming_call(&ctx, &inbound_params()).await.unwrap().unwrap();
        match &response.verbs()[0] {
            Verb::Gather { verbs, .. } => {
                assert_eq!(verbs.len(), 1);
                assert!(matches!(&verbs[0], Verb::Play { url } if url.contains("ah-greeting")));
            }
            other => panic!("expected gather, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn urgency_choice_is_idempotent() {
        let (ctx, doubles, _dir) = test_context().await;
        seed_practice(&doubles, None);
        afterhours_all_calls(&doubles);
        process_incoming_call(&ctx, &inbound_params()).await.unwrap();

        let xml = render(patient_entered_digits(&ctx, &digits("1")).await.unwrap());
        assert_eq!(xml, "<Response><Redirect>/twilio/call/afterhours_voicemail</Redirect></Response>");
        assert!(ctx.db.lookup_incoming_call(CALL_SID).await.unwrap().unwrap().urgent);

        // Replayed by the provider: same markup, still urgent
        let again = render(patient_entered_digits(&ctx, &digits("1")).await.unwrap());
        assert_eq!(again, xml);
        assert!(ctx.db.lookup_incoming_call(CALL_SID).await.unwrap().unwrap().urgent);

        patient_entered_digits(&ctx, &digits("2")).await.unwrap();
        assert!(!ctx.db.lookup_incoming_call(CALL_SID).await.unwrap().unwrap().urgent);
    }

    #[tokio::test]
    async fn other_digits_replay_the_greeting() {
        let (ctx, doubles, _dir) = test_context().await;
        seed_practice(&doubles, None);
        afterhours_all_calls(&doubles);
        let first = render(process_incoming_call(&ctx, &inbound_params()).await.unwrap());

        let xml = render(patient_entered_digits(&ctx, &digits("9")).await.unwrap());
        assert_eq!(xml, first);
    }

    #[tokio::test]
    async fn voicemail_records_to_afterhours_processing() {
        let (ctx, doubles, _dir) = test_context().await;
        seed_practice(&doubles, Some("Dewabi Corp"));
        afterhours_all_calls(&doubles);
        process_incoming_call(&ctx, &inbound_params()).await.unwrap();

        let xml = render(voicemail(&ctx, &inbound_params()).await.unwrap());
        assert_eq!(
            xml,
            "<Response><Say voice=\"alice\">Please leave a message after the tone.</Say>\
             <Record action=\"/twilio/call/afterhours_process_voicemail\" timeout=\"60\" maxLength=\"3600\" \
             transcribeCallback=\"/twilio/call/no_op\" playBeep=\"true\"></Record></Response>"
        );
        assert!(ctx.db.lookup_incoming_call(CALL_SID).await.unwrap().unwrap().sent_to_voicemail);
    }

    #[tokio::test]
    async fn afterhours_voicemail_completes_the_call() {
        let (ctx, doubles, _dir) = test_context().await;
        seed_practice(&doubles, None);
        ctx.db
            .create_incoming_call(&crate::types::IncomingCall::new(
                CALL_SID,
                PhoneNumber::parse(PATIENT_PHONE).unwrap(),
                PhoneNumber::parse(PRACTICE_PHONE).unwrap(),
                ORG_ID,
                ctx.clock.now(),
            ))
            .await
            .unwrap();

        assert!(process_voicemail(&ctx, &inbound_params()).await.unwrap().is_none());
        let call = ctx.db.lookup_incoming_call(CALL_SID).await.unwrap().unwrap();
        assert!(call.left_voicemail);
        assert!(call.completed);
        assert_eq!(call.completed_time, Some(ctx.clock.now()));
        assert_eq!(doubles.events.count("incoming-raw-message"), 1);
    }
}
