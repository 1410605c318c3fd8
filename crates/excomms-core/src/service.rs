//! # Internal RPC surface
//!
//! [`ExcommsService`] is what other services call to lease endpoints, send
//! outbound messages, start proxied phone calls and manage IP calls. Every
//! method validates its input up front and reports failures with the
//! [`ExcommsError`] kinds the HTTP layer maps onto status codes.

use chrono::Duration;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clients::twilio::codes;
use crate::clients::{
    required_entity, AvailableNumber, EntityType, NumberRequest, OutboundEmail, OutboundSms,
};
use crate::context::Context;
use crate::database::endpoints::deprovision_endpoint_tx;
use crate::database::ipcalls::{ipcall_tx, update_ipcall_tx, update_participant_tx, LOCK_IPCALL};
use crate::email::parse_address;
use crate::error::{ExcommsError, Result};
use crate::events::{ServiceEvent, ServiceEventType};
use crate::phone::PhoneNumber;
use crate::proxynumber::ReserveRequest;
use crate::types::{
    EndpointType, IPCall, IPCallParticipant, IPCallRole, IPCallState, IPCallType, NetworkType,
    ProvisionedEndpoint, SentMessage, SentMessageType,
};

const MAX_REASON_LEN: usize = 254;

/// How long media links handed to providers stay valid
fn outbound_media_ttl() -> Duration {
    Duration::minutes(15)
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchNumbersRequest {
    pub area_code: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionPhoneNumberRequest {
    pub provision_for: String,
    /// Idempotency token
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub area_code: Option<String>,
    #[serde(default)]
    pub phone_number: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProvisionEmailRequest {
    pub provision_for: String,
    pub email_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeprovisionRequest {
    pub endpoint: String,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmsMessage {
    pub from_phone_number: String,
    pub to_phone_number: String,
    pub text: String,
    #[serde(default)]
    pub media_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailMessage {
    pub subject: String,
    pub body: String,
    pub from_name: String,
    pub from_email_address: String,
    #[serde(default)]
    pub to_name: String,
    pub to_email_address: String,
    #[serde(default)]
    pub media_ids: Vec<String>,
    /// Sent from the transactional domain instead of the messaging one
    #[serde(default)]
    pub transactional: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "channel", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboundMessage {
    Sms(SmsMessage),
    Email(EmailMessage),
    Voice,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SendMessageRequest {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(flatten)]
    pub message: OutboundMessage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallInitiationMode {
    /// Hand back a proxy number for the caller to dial
    #[default]
    ReturnPhoneNumber,
    ConnectParties,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitiatePhoneCallRequest {
    #[serde(default)]
    pub mode: CallInitiationMode,
    #[serde(default)]
    pub from_phone_number: String,
    pub to_phone_number: String,
    pub organization_id: String,
    pub caller_entity_id: String,
    #[serde(default)]
    pub device_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitiatePhoneCallResponse {
    pub proxy_phone_number: String,
    pub originating_phone_number: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockNumberRequest {
    pub organization_id: String,
    pub provisioned_phone_number: String,
    pub number: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ParticipantSpec {
    pub account_id: String,
    pub entity_id: String,
    #[serde(default = "unknown_network")]
    pub network_type: NetworkType,
}

fn unknown_network() -> NetworkType {
    NetworkType::Unknown
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateIPCallRequest {
    pub call_type: IPCallType,
    pub caller: ParticipantSpec,
    pub recipient: ParticipantSpec,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateIPCallRequest {
    pub account_id: String,
    pub state: IPCallState,
    #[serde(default = "unknown_network")]
    pub network_type: NetworkType,
}

/// The gateway's RPC operations
#[derive(Clone)]
pub struct ExcommsService {
    ctx: Context,
}

impl ExcommsService {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub async fn search_available_phone_numbers(
        &self,
        request: &SearchNumbersRequest,
    ) -> Result<Vec<AvailableNumber>> {
        self.ctx
            .telephony
            .search_available_numbers(&request.area_code, &request.capabilities)
            .await
    }

    /// Purchase a number for `provision_for` and lease it.
    ///
    /// Repeating a request with the same uuid returns the number bought the
    /// first time. A second request for an owner that already holds a
    /// number returns that number unless it asks for a different one.
    pub async fn provision_phone_number(&self, request: &ProvisionPhoneNumberRequest) -> Result<String> {
        let number_request = match (&request.area_code, &request.phone_number) {
            (_, Some(number)) if !number.is_empty() => NumberRequest::Number(PhoneNumber::parse(number)?.to_string()),
            (Some(area_code), _) if !area_code.is_empty() => NumberRequest::AreaCode(area_code.clone()),
            _ => return Err(ExcommsError::invalid_argument("area code or phone number required")),
        };
        let wanted = match &number_request {
            NumberRequest::Number(n) => Some(n.as_str()),
            NumberRequest::AreaCode(_) => None,
        };

        let uuid = request.uuid.as_deref().filter(|u| !u.is_empty());
        if let Some(uuid) = uuid {
            if let Some(existing) = self.ctx.db.lookup_endpoint_by_uuid(uuid).await? {
                if existing.provisioned_for != request.provision_for || existing.endpoint_type != EndpointType::Phone {
                    return Err(ExcommsError::already_exists(format!(
                        "endpoint {} with uuid {} is provisioned for {}",
                        existing.endpoint, uuid, existing.provisioned_for
                    )));
                }
                return reuse(existing, wanted);
            }
        }
        if let Some(existing) = self
            .ctx
            .db
            .lookup_endpoint_for(&request.provision_for, EndpointType::Phone)
            .await?
        {
            return reuse(existing, wanted);
        }

        let number = match self.ctx.telephony.purchase_number(&number_request).await {
            Ok(number) => number,
            Err(ExcommsError::Provider { code, message }) if code == codes::INVALID_AREA_CODE => {
                return Err(ExcommsError::not_found(message));
            }
            Err(ExcommsError::Provider { code, message }) if code == codes::NO_PHONE_NUMBER_IN_AREA_CODE => {
                return Err(ExcommsError::invalid_argument(message));
            }
            Err(e) => return Err(e),
        };

        self.ctx
            .db
            .provision_endpoint(&ProvisionedEndpoint {
                endpoint: number.clone(),
                endpoint_type: EndpointType::Phone,
                provisioned_for: request.provision_for.clone(),
                uuid: uuid.map(str::to_string),
                created: self.ctx.clock.now(),
                deprovisioned: false,
                deprovisioned_timestamp: None,
                deprovisioned_reason: None,
            })
            .await?;
        info!(provision_for = %request.provision_for, number = %number, "Provisioned phone number");
        self.publish_provisioned(&request.provision_for, EndpointType::Phone, &number)
            .await;
        Ok(number)
    }

    /// Release a number at the provider and end its lease.
    pub async fn deprovision_phone_number(&self, request: &DeprovisionRequest) -> Result<()> {
        if request.endpoint.is_empty() {
            return Err(ExcommsError::invalid_argument("phone number to deprovision required"));
        }
        check_reason(&request.reason)?;

        match self.ctx.telephony.release_number(&request.endpoint).await {
            Ok(()) => {}
            Err(ExcommsError::NotFound(msg)) => {
                debug!(number = %request.endpoint, "Nothing to release: {}", msg);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let rows = self
            .ctx
            .db
            .deprovision_endpoint(&request.endpoint, EndpointType::Phone, &request.reason, self.ctx.clock.now())
            .await?;
        if rows > 1 {
            return Err(ExcommsError::integrity(format!(
                "deprovisioned {} rows for {}",
                rows, request.endpoint
            )));
        }
        info!(number = %request.endpoint, "Deprovisioned phone number");
        Ok(())
    }

    pub async fn provision_email_address(&self, request: &ProvisionEmailRequest) -> Result<String> {
        let address = parse_address(&request.email_address)?.address;

        if let Some(existing) = self
            .ctx
            .db
            .lookup_endpoint_for(&request.provision_for, EndpointType::Email)
            .await?
        {
            if existing.endpoint == address {
                return Ok(address);
            }
            return Err(ExcommsError::already_exists(format!(
                "different email address {} provisioned for {}",
                existing.endpoint, request.provision_for
            )));
        }

        self.ctx
            .db
            .provision_endpoint(&ProvisionedEndpoint {
                endpoint: address.clone(),
                endpoint_type: EndpointType::Email,
                provisioned_for: request.provision_for.clone(),
                uuid: None,
                created: self.ctx.clock.now(),
                deprovisioned: false,
                deprovisioned_timestamp: None,
                deprovisioned_reason: None,
            })
            .await?;
        self.publish_provisioned(&request.provision_for, EndpointType::Email, &address)
            .await;
        Ok(address)
    }

    pub async fn deprovision_email(&self, request: &DeprovisionRequest) -> Result<()> {
        if request.endpoint.is_empty() {
            return Err(ExcommsError::invalid_argument("email required"));
        }
        check_reason(&request.reason)?;

        let mut tx = self.ctx.db.begin().await?;
        let rows = deprovision_endpoint_tx(
            &mut tx,
            &request.endpoint,
            EndpointType::Email,
            &request.reason,
            self.ctx.clock.now(),
        )
        .await?;
        if rows > 1 {
            return Err(ExcommsError::integrity(format!(
                "deprovisioned {} rows for {}",
                rows, request.endpoint
            )));
        }
        tx.commit().await?;
        Ok(())
    }

    /// Send one message. A (uuid, destination) pair is only ever sent once.
    pub async fn send_message(&self, request: &SendMessageRequest) -> Result<()> {
        let uuid = match request.uuid.as_deref() {
            Some(uuid) if !uuid.is_empty() => uuid.to_string(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        let (kind, destination, media_ids) = match &request.message {
            OutboundMessage::Sms(sms) => (SentMessageType::Sms, &sms.to_phone_number, &sms.media_ids),
            OutboundMessage::Email(email) => (SentMessageType::Email, &email.to_email_address, &email.media_ids),
            OutboundMessage::Voice => return Err(ExcommsError::unimplemented("voice messages")),
        };

        if self.ctx.db.lookup_sent_message(&uuid, destination).await?.is_some() {
            debug!(uuid = %uuid, "Message already sent");
            return Ok(());
        }

        let expires = self.ctx.clock.now() + outbound_media_ttl();
        let media_urls = media_ids
            .iter()
            .map(|id| self.ctx.signer.sign(id, expires))
            .collect::<Result<Vec<_>>>()?;

        let (provider_id, data) = match &request.message {
            OutboundMessage::Sms(sms) => match self.send_sms(sms, &media_urls).await? {
                Some(sid) => {
                    let data = json!({
                        "from": sms.from_phone_number,
                        "to": sms.to_phone_number,
                        "text": sms.text,
                        "media_urls": media_urls,
                    });
                    (Some(sid), data)
                }
                None => return Ok(()),
            },
            OutboundMessage::Email(email) => {
                let domain = if email.transactional {
                    &self.ctx.config.email.transactional_domain
                } else {
                    &self.ctx.config.email.sender_domain
                };
                let sender = parse_address(&email.from_email_address)?;
                if !sender.domain().eq_ignore_ascii_case(domain) {
                    return Err(ExcommsError::invalid_argument(format!(
                        "sender {} does not match expected domain {}",
                        email.from_email_address, domain
                    )));
                }
                let outbound = OutboundEmail {
                    from_name: email.from_name.clone(),
                    from_email: sender.address,
                    to_email: email.to_email_address.clone(),
                    subject: email.subject.clone(),
                    body: email.body.clone(),
                    attachment_urls: media_urls,
                };
                let id = self.ctx.email.send(&outbound).await?;
                (Some(id), serde_json::to_value(&outbound)?)
            }
            OutboundMessage::Voice => return Err(ExcommsError::unimplemented("voice messages")),
        };

        let sent = SentMessage {
            id: self.ctx.ids.next_id(),
            uuid,
            kind,
            destination: destination.clone(),
            sent: self.ctx.clock.now(),
            provider_id,
            data,
        };
        let db = self.ctx.db.clone();
        self.ctx
            .tasks
            .go("persist-sent-message", async move {
                if !db.create_sent_message(&sent).await? {
                    warn!(uuid = %sent.uuid, "Sent message was already recorded");
                }
                Ok(())
            })
            .await;
        Ok(())
    }

    /// Provider message id, or `None` when the destination cannot take SMS
    /// and the message is dropped.
    async fn send_sms(&self, sms: &SmsMessage, media_urls: &[String]) -> Result<Option<String>> {
        let outbound = OutboundSms {
            from: sms.from_phone_number.clone(),
            to: sms.to_phone_number.clone(),
            body: sms.text.clone(),
            media_urls: media_urls.to_vec(),
        };
        match self.ctx.telephony.send_sms(&outbound).await {
            Ok(sid) => Ok(Some(sid)),
            Err(ExcommsError::Provider { code, .. }) if code == codes::INVALID_TO_PHONE_NUMBER => {
                warn!(to = %sms.to_phone_number, "Dropping SMS to invalid number");
                Ok(None)
            }
            Err(ExcommsError::Provider { code, .. }) if code == codes::MESSAGE_LENGTH_EXCEEDED => {
                Err(ExcommsError::invalid_argument(format!(
                    "message length can only be 1600 characters, message was {} characters",
                    sms.text.chars().count()
                )))
            }
            Err(ExcommsError::Provider { code, .. }) if code == codes::NOT_MESSAGE_CAPABLE_FROM_NUMBER => {
                Err(ExcommsError::invalid_argument(format!(
                    "{} cannot send SMS",
                    sms.from_phone_number
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Reserve a proxy number connecting the caller to a patient of the
    /// organization.
    pub async fn initiate_phone_call(&self, request: &InitiatePhoneCallRequest) -> Result<InitiatePhoneCallResponse> {
        if request.mode == CallInitiationMode::ConnectParties {
            return Err(ExcommsError::unimplemented("connecting parties"));
        }
        if request.organization_id.is_empty() {
            return Err(ExcommsError::invalid_argument("missing organization id"));
        }

        let caller = self
            .ctx
            .directory
            .entity(&request.caller_entity_id)
            .await?
            .filter(|e| e.entity_type == EntityType::Internal)
            .ok_or_else(|| ExcommsError::not_found(format!("caller {} not found", request.caller_entity_id)))?;
        if !caller.is_member_of(&request.organization_id) {
            return Err(ExcommsError::not_found(format!(
                "caller {} does not belong to organization {}",
                caller.id, request.organization_id
            )));
        }

        let destination = PhoneNumber::parse(&request.to_phone_number)?;
        let callee = self
            .ctx
            .directory
            .entities_by_contact(destination.as_str())
            .await?
            .into_iter()
            .find(|e| e.entity_type == EntityType::External && e.is_member_of(&request.organization_id))
            .ok_or_else(|| {
                ExcommsError::not_found(format!(
                    "{} is not the phone number of a patient of the organization",
                    request.to_phone_number
                ))
            })?;

        let originating = self.originating_number(request, &caller).await?;
        let db = self.ctx.db.clone();
        let (remembered, entity_id, device_id) = (
            originating.clone(),
            request.caller_entity_id.clone(),
            request.device_id.clone(),
        );
        self.ctx
            .tasks
            .go("remember-originating-number", async move {
                db.set_current_originating_number(&remembered, &entity_id, &device_id).await
            })
            .await;

        // The organization must exist for its pool to be meaningful
        required_entity(self.ctx.directory.as_ref(), &request.organization_id).await?;
        let proxy = self
            .ctx
            .proxy_numbers
            .reserve(&ReserveRequest {
                originating: originating.clone(),
                destination,
                destination_entity_id: callee.id,
                owner_entity_id: caller.id,
                organization_id: request.organization_id.clone(),
            })
            .await?;

        Ok(InitiatePhoneCallResponse {
            proxy_phone_number: proxy.to_string(),
            originating_phone_number: originating.to_string(),
        })
    }

    /// The request's number, else the device's last one, else the caller's
    /// first personal phone.
    async fn originating_number(
        &self,
        request: &InitiatePhoneCallRequest,
        caller: &crate::clients::Entity,
    ) -> Result<PhoneNumber> {
        if !request.from_phone_number.is_empty() {
            return PhoneNumber::parse(&request.from_phone_number);
        }
        if let Some(current) = self
            .ctx
            .db
            .current_originating_number(&request.caller_entity_id, &request.device_id)
            .await?
        {
            return Ok(current);
        }
        match caller.personal_phones().next() {
            Some(raw) => PhoneNumber::parse(raw)
                .map_err(|e| ExcommsError::internal(format!("phone contact of {} is invalid: {}", caller.id, e))),
            None => Err(ExcommsError::internal(format!(
                "no phone number for {} to place the call from",
                caller.id
            ))),
        }
    }

    /// Block a caller on one of the organization's numbers and return the
    /// resulting block list.
    pub async fn block_number(&self, request: &BlockNumberRequest) -> Result<Vec<PhoneNumber>> {
        let (provisioned, number) = self.owned_number_pair(request).await?;
        self.ctx
            .db
            .block_number(&provisioned, &number, self.ctx.clock.now())
            .await?;
        info!(provisioned = %provisioned, "Blocked {}", number);
        self.list_blocked_numbers(provisioned.as_str()).await
    }

    pub async fn unblock_number(&self, request: &BlockNumberRequest) -> Result<Vec<PhoneNumber>> {
        let (provisioned, number) = self.owned_number_pair(request).await?;
        self.ctx.db.unblock_number(&provisioned, &number).await?;
        self.list_blocked_numbers(provisioned.as_str()).await
    }

    pub async fn list_blocked_numbers(&self, provisioned_phone_number: &str) -> Result<Vec<PhoneNumber>> {
        let provisioned = PhoneNumber::parse(provisioned_phone_number)?;
        Ok(self
            .ctx
            .db
            .list_blocked_numbers(&provisioned)
            .await?
            .into_iter()
            .map(|b| b.number)
            .collect())
    }

    async fn owned_number_pair(&self, request: &BlockNumberRequest) -> Result<(PhoneNumber, PhoneNumber)> {
        let provisioned = PhoneNumber::parse(&request.provisioned_phone_number)?;
        let number = PhoneNumber::parse(&request.number)?;
        let owned = self
            .ctx
            .db
            .lookup_endpoint_for(&request.organization_id, EndpointType::Phone)
            .await?
            .ok_or_else(|| {
                ExcommsError::not_found(format!(
                    "provisioned phone number {} not found",
                    request.provisioned_phone_number
                ))
            })?;
        if owned.endpoint != provisioned.as_str() {
            return Err(ExcommsError::invalid_argument(format!(
                "phone number {} not owned by {}",
                provisioned, request.organization_id
            )));
        }
        Ok((provisioned, number))
    }

    /// Add a number to an organization's proxy pool. Returns false when it
    /// was already pooled.
    pub async fn add_proxy_phone_number(&self, organization_id: &str, number: &str) -> Result<bool> {
        if organization_id.is_empty() {
            return Err(ExcommsError::invalid_argument("missing organization id"));
        }
        let number = PhoneNumber::parse(number)?;
        self.ctx.db.add_proxy_phone_number(&number, organization_id).await
    }

    pub async fn create_ipcall(&self, request: &CreateIPCallRequest) -> Result<IPCall> {
        if request.caller.entity_id == request.recipient.entity_id {
            return Err(ExcommsError::invalid_argument(
                "recipient may not be the same entity as the caller",
            ));
        }
        for spec in [&request.caller, &request.recipient] {
            required_entity(self.ctx.directory.as_ref(), &spec.entity_id).await?;
        }

        let participant = |spec: &ParticipantSpec, role, state| IPCallParticipant {
            account_id: spec.account_id.clone(),
            entity_id: spec.entity_id.clone(),
            identity: uuid::Uuid::new_v4().simple().to_string(),
            role,
            state,
            network_type: spec.network_type,
        };
        let call = IPCall {
            id: self.ctx.ids.next_id(),
            call_type: request.call_type,
            pending: true,
            initiated: self.ctx.clock.now(),
            connected: None,
            participants: vec![
                participant(&request.caller, IPCallRole::Caller, IPCallState::Accepted),
                participant(&request.recipient, IPCallRole::Recipient, IPCallState::Pending),
            ],
        };
        self.ctx.db.create_ipcall(&call).await?;
        info!(ipcall_id = call.id, "Created IP call");
        Ok(call)
    }

    pub async fn ipcall(&self, id: u64) -> Result<IPCall> {
        self.ctx
            .db
            .ipcall(id)
            .await?
            .ok_or_else(|| ExcommsError::not_found(format!("ip call {}", id)))
    }

    pub async fn pending_ipcalls(&self, account_id: &str) -> Result<Vec<IPCall>> {
        self.ctx.db.pending_ipcalls_for_account(account_id).await
    }

    /// Move one participant to a new state under the call-row lock.
    /// Repeating the current state changes nothing.
    pub async fn update_ipcall_participant(&self, id: u64, request: &UpdateIPCallRequest) -> Result<IPCall> {
        if request.account_id.is_empty() {
            return Err(ExcommsError::invalid_argument("account id is required"));
        }
        if request.state == IPCallState::Pending {
            return Err(ExcommsError::invalid_argument("cannot transition to PENDING"));
        }

        let mut tx = self.ctx.db.begin_locked(LOCK_IPCALL, &id.to_string()).await?;
        let mut call = ipcall_tx(&mut tx, id)
            .await?
            .ok_or_else(|| ExcommsError::not_found(format!("ip call {}", id)))?;
        let current = call
            .participant(&request.account_id)
            .map(|p| p.state)
            .ok_or_else(|| {
                ExcommsError::not_found(format!("account {} is not a participant in {}", request.account_id, id))
            })?;
        if current == request.state {
            return Ok(call);
        }
        if !current.can_transition_to(request.state) {
            return Err(ExcommsError::invalid_argument(format!(
                "cannot transition from {} to {}",
                current, request.state
            )));
        }

        let was_active = call.is_active();
        let rows = update_participant_tx(&mut tx, id, &request.account_id, request.state, request.network_type).await?;
        ExcommsError::expect_rows(rows, 1, format_args!("participant {} of {}", request.account_id, id))?;
        if call.pending {
            call.pending = false;
            if request.state == IPCallState::Connected {
                call.connected = Some(self.ctx.clock.now());
            }
            update_ipcall_tx(&mut tx, id, call.pending, call.connected).await?;
        }
        tx.commit().await?;

        for p in call.participants.iter_mut().filter(|p| p.account_id == request.account_id) {
            p.state = request.state;
            p.network_type = request.network_type;
        }
        if was_active && request.state.is_terminal() {
            info!(ipcall_id = id, state = %request.state, "IP call ended");
        }
        Ok(call)
    }

    async fn publish_provisioned(&self, entity_id: &str, endpoint_type: EndpointType, endpoint: &str) {
        let event = ServiceEvent {
            event_type: ServiceEventType::ProvisionedEndpoint,
            entity_id: entity_id.to_string(),
            endpoint_type,
            endpoint: endpoint.to_string(),
        };
        let publisher = self.ctx.publisher.clone();
        self.ctx
            .tasks
            .go("publish-provisioned-endpoint", async move { publisher.service_event(&event).await })
            .await;
    }
}

fn reuse(existing: ProvisionedEndpoint, wanted: Option<&str>) -> Result<String> {
    match wanted {
        Some(number) if number != existing.endpoint => Err(ExcommsError::already_exists(format!(
            "{} already holds {} instead of {}",
            existing.provisioned_for, existing.endpoint, number
        ))),
        _ => Ok(existing.endpoint),
    }
}

fn check_reason(reason: &str) -> Result<()> {
    if reason.chars().count() > MAX_REASON_LEN {
        return Err(ExcommsError::invalid_argument(format!(
            "reason cannot be longer than {} characters",
            MAX_REASON_LEN
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::{Contact, ContactType, Entity};
    use crate::context::test_support::test_context;
    use crate::context::Doubles;
    use crate::events::ServiceEvent;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    const ORG: &str = "org-1";

    async fn service() -> (ExcommsService, Context, Doubles, TempDir) {
        let (ctx, doubles, dir) = test_context().await;
        (ExcommsService::new(ctx.clone()), ctx, doubles, dir)
    }

    fn entity(id: &str, entity_type: EntityType, phones: &[(&str, bool)]) -> Entity {
        Entity {
            id: id.into(),
            entity_type,
            display_name: None,
            contacts: phones
                .iter()
                .map(|(value, provisioned)| Contact {
                    contact_type: ContactType::Phone,
                    value: value.to_string(),
                    provisioned: *provisioned,
                })
                .collect(),
            memberships: vec![ORG.into()],
            account_ids: Vec::new(),
        }
    }

    fn provision(uuid: Option<&str>, area_code: &str) -> ProvisionPhoneNumberRequest {
        ProvisionPhoneNumberRequest {
            provision_for: ORG.into(),
            uuid: uuid.map(str::to_string),
            area_code: Some(area_code.into()),
            phone_number: None,
        }
    }

    #[tokio::test]
    async fn provisioning_is_idempotent_per_uuid_and_owner() {
        let (svc, _ctx, doubles, _dir) = service().await;
        doubles
            .telephony
            .stock_area_code("415", &["+14155550100", "+14155550101"]);

        let first = svc.provision_phone_number(&provision(Some("u-1"), "415")).await.unwrap();
        let again = svc.provision_phone_number(&provision(Some("u-1"), "415")).await.unwrap();
        let by_owner = svc.provision_phone_number(&provision(None, "415")).await.unwrap();
        assert_eq!(first, "+14155550100");
        assert_eq!(again, first);
        assert_eq!(by_owner, first);
        assert_eq!(doubles.telephony.purchased(), vec!["+14155550100".to_string()]);

        let events: Vec<ServiceEvent> = doubles.events.messages(&svc.ctx.config.topics.service_events);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].endpoint, first);

        let other_owner = ProvisionPhoneNumberRequest {
            provision_for: "org-2".into(),
            ..provision(Some("u-1"), "415")
        };
        assert!(matches!(
            svc.provision_phone_number(&other_owner).await,
            Err(ExcommsError::AlreadyExists(_))
        ));

        let other_number = ProvisionPhoneNumberRequest {
            phone_number: Some("+14155550199".into()),
            ..provision(None, "415")
        };
        assert!(matches!(
            svc.provision_phone_number(&other_number).await,
            Err(ExcommsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn provider_area_code_errors_are_mapped() {
        let (svc, _ctx, doubles, _dir) = service().await;
        doubles.telephony.stock_area_code("206", &[]);

        assert!(matches!(
            svc.provision_phone_number(&provision(None, "999")).await,
            Err(ExcommsError::NotFound(_))
        ));
        assert!(matches!(
            svc.provision_phone_number(&provision(None, "206")).await,
            Err(ExcommsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn deprovisioning_releases_and_frees_the_owner() {
        let (svc, ctx, doubles, _dir) = service().await;
        doubles.telephony.stock_area_code("415", &["+14155550100"]);
        let number = svc.provision_phone_number(&provision(None, "415")).await.unwrap();

        let long = DeprovisionRequest {
            endpoint: number.clone(),
            reason: "x".repeat(255),
        };
        assert!(matches!(
            svc.deprovision_phone_number(&long).await,
            Err(ExcommsError::InvalidArgument(_))
        ));

        svc.deprovision_phone_number(&DeprovisionRequest {
            endpoint: number.clone(),
            reason: "practice closed".into(),
        })
        .await
        .unwrap();
        assert_eq!(doubles.telephony.released(), vec![number]);
        assert!(ctx
            .db
            .lookup_endpoint_for(ORG, EndpointType::Phone)
            .await
            .unwrap()
            .is_none());

        // Unknown at the provider: nothing to do
        svc.deprovision_phone_number(&DeprovisionRequest {
            endpoint: "+14155550999".into(),
            reason: String::new(),
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn email_provisioning_and_deprovisioning() {
        let (svc, ctx, _doubles, _dir) = service().await;
        let request = ProvisionEmailRequest {
            provision_for: ORG.into(),
            email_address: "Desk@Clinic.Example.com".into(),
        };
        assert_eq!(svc.provision_email_address(&request).await.unwrap(), "desk@clinic.example.com");
        assert_eq!(svc.provision_email_address(&request).await.unwrap(), "desk@clinic.example.com");

        let different = ProvisionEmailRequest {
            email_address: "other@clinic.example.com".into(),
            ..request.clone()
        };
        assert!(matches!(
            svc.provision_email_address(&different).await,
            Err(ExcommsError::AlreadyExists(_))
        ));
        let invalid = ProvisionEmailRequest {
            email_address: "not an address".into(),
            ..request
        };
        assert!(matches!(
            svc.provision_email_address(&invalid).await,
            Err(ExcommsError::InvalidArgument(_))
        ));

        svc.deprovision_email(&DeprovisionRequest {
            endpoint: "desk@clinic.example.com".into(),
            reason: "moved".into(),
        })
        .await
        .unwrap();
        assert!(ctx
            .db
            .lookup_endpoint_for(ORG, EndpointType::Email)
            .await
            .unwrap()
            .is_none());
    }

    fn sms(uuid: &str, to: &str) -> SendMessageRequest {
        SendMessageRequest {
            uuid: Some(uuid.into()),
            message: OutboundMessage::Sms(SmsMessage {
                from_phone_number: "+14150000000".into(),
                to_phone_number: to.into(),
                text: "See you tomorrow".into(),
                media_ids: vec!["m-1".into()],
            }),
        }
    }

    #[tokio::test]
    async fn sms_is_sent_once_per_uuid_and_destination() {
        let (svc, ctx, doubles, _dir) = service().await;

        svc.send_message(&sms("u-1", "+14151111111")).await.unwrap();
        svc.send_message(&sms("u-1", "+14151111111")).await.unwrap();
        svc.send_message(&sms("u-1", "+14152222222")).await.unwrap();

        let sent = doubles.telephony.sent();
        assert_eq!(sent.len(), 2);
        assert!(sent[0].media_urls[0].contains("/media/m-1?expires="));
        let record = ctx.db.lookup_sent_message("u-1", "+14151111111").await.unwrap().unwrap();
        assert_eq!(record.kind, SentMessageType::Sms);
        assert_eq!(record.provider_id.as_deref(), Some("SM1"));
    }

    #[tokio::test]
    async fn sms_provider_rejections() {
        let (svc, ctx, doubles, _dir) = service().await;
        doubles
            .telephony
            .reject_destination("+14153333333", codes::INVALID_TO_PHONE_NUMBER);
        doubles
            .telephony
            .reject_destination("+14154444444", codes::MESSAGE_LENGTH_EXCEEDED);

        svc.send_message(&sms("u-1", "+14153333333")).await.unwrap();
        assert!(ctx.db.lookup_sent_message("u-1", "+14153333333").await.unwrap().is_none());

        assert!(matches!(
            svc.send_message(&sms("u-2", "+14154444444")).await,
            Err(ExcommsError::InvalidArgument(_))
        ));
    }

    fn email(from: &str, transactional: bool) -> SendMessageRequest {
        SendMessageRequest {
            uuid: None,
            message: OutboundMessage::Email(EmailMessage {
                subject: "Hello".into(),
                body: "Body".into(),
                from_name: "Front Desk".into(),
                from_email_address: from.into(),
                to_name: String::new(),
                to_email_address: "patient@example.com".into(),
                media_ids: Vec::new(),
                transactional,
            }),
        }
    }

    #[tokio::test]
    async fn email_sender_domain_is_enforced() {
        let (svc, _ctx, doubles, _dir) = service().await;
        let domain = svc.ctx.config.email.sender_domain.clone();
        let transactional = svc.ctx.config.email.transactional_domain.clone();

        svc.send_message(&email(&format!("desk@{}", domain), false)).await.unwrap();
        assert_eq!(doubles.email.sent().len(), 1);

        assert!(matches!(
            svc.send_message(&email("desk@elsewhere.com", false)).await,
            Err(ExcommsError::InvalidArgument(_))
        ));
        assert!(matches!(
            svc.send_message(&email(&format!("desk@{}", domain), true)).await,
            Err(ExcommsError::InvalidArgument(_))
        ));
        svc.send_message(&email(&format!("noreply@{}", transactional), true))
            .await
            .unwrap();
        assert_eq!(doubles.email.sent().len(), 2);
    }

    #[tokio::test]
    async fn voice_messages_are_unimplemented() {
        let (svc, _ctx, _doubles, _dir) = service().await;
        let request = SendMessageRequest {
            uuid: None,
            message: OutboundMessage::Voice,
        };
        assert!(matches!(
            svc.send_message(&request).await,
            Err(ExcommsError::Unimplemented(_))
        ));
    }

    fn call_request(from: &str) -> InitiatePhoneCallRequest {
        InitiatePhoneCallRequest {
            mode: CallInitiationMode::ReturnPhoneNumber,
            from_phone_number: from.into(),
            to_phone_number: "+14151111111".into(),
            organization_id: ORG.into(),
            caller_entity_id: "provider-1".into(),
            device_id: "device-1".into(),
        }
    }

    async fn seed_call_parties(ctx: &Context, doubles: &Doubles) {
        doubles
            .directory
            .insert(entity(ORG, EntityType::Organization, &[("+14150000000", true)]));
        doubles
            .directory
            .insert(entity("provider-1", EntityType::Internal, &[("+17348465522", false)]));
        doubles
            .directory
            .insert(entity("patient-1", EntityType::External, &[("+14151111111", false)]));
        ctx.db
            .add_proxy_phone_number(&PhoneNumber::parse("+12060000001").unwrap(), ORG)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn initiating_a_call_reserves_a_proxy_number() {
        let (svc, ctx, doubles, _dir) = service().await;
        seed_call_parties(&ctx, &doubles).await;

        let response = svc.initiate_phone_call(&call_request("")).await.unwrap();
        assert_eq!(
            response,
            InitiatePhoneCallResponse {
                proxy_phone_number: "+12060000001".into(),
                originating_phone_number: "+17348465522".into(),
            }
        );
        let remembered = ctx.db.current_originating_number("provider-1", "device-1").await.unwrap();
        assert_eq!(remembered.unwrap().as_str(), "+17348465522");

        let reservation = ctx
            .proxy_numbers
            .active_reservation(
                &PhoneNumber::parse("+17348465522").unwrap(),
                &PhoneNumber::parse("+12060000001").unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(reservation.destination_entity_id, "patient-1");
        assert_eq!(reservation.owner_entity_id, "provider-1");
    }

    #[tokio::test]
    async fn initiating_a_call_validates_parties() {
        let (svc, ctx, doubles, _dir) = service().await;
        seed_call_parties(&ctx, &doubles).await;

        let connect = InitiatePhoneCallRequest {
            mode: CallInitiationMode::ConnectParties,
            ..call_request("")
        };
        assert!(matches!(
            svc.initiate_phone_call(&connect).await,
            Err(ExcommsError::Unimplemented(_))
        ));

        let stranger = InitiatePhoneCallRequest {
            to_phone_number: "+14159999999".into(),
            ..call_request("")
        };
        assert!(matches!(
            svc.initiate_phone_call(&stranger).await,
            Err(ExcommsError::NotFound(_))
        ));

        assert!(matches!(
            svc.initiate_phone_call(&call_request("call me")).await,
            Err(ExcommsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn block_list_requires_ownership() {
        let (svc, _ctx, doubles, _dir) = service().await;
        doubles.telephony.stock_area_code("415", &["+14150000000"]);
        svc.provision_phone_number(&provision(None, "415")).await.unwrap();

        let request = BlockNumberRequest {
            organization_id: ORG.into(),
            provisioned_phone_number: "+14150000000".into(),
            number: "(415) 111-1111".into(),
        };
        let blocked = svc.block_number(&request).await.unwrap();
        assert_eq!(blocked, vec![PhoneNumber::parse("+14151111111").unwrap()]);
        assert_eq!(svc.block_number(&request).await.unwrap().len(), 1);

        let foreign = BlockNumberRequest {
            provisioned_phone_number: "+14150000001".into(),
            ..request.clone()
        };
        assert!(matches!(
            svc.block_number(&foreign).await,
            Err(ExcommsError::InvalidArgument(_))
        ));

        assert!(svc.unblock_number(&request).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn ipcall_participant_transitions() {
        let (svc, _ctx, doubles, _dir) = service().await;
        doubles.directory.insert(entity("e-a", EntityType::Internal, &[]));
        doubles.directory.insert(entity("e-b", EntityType::Internal, &[]));
        let spec = |account: &str, entity: &str| ParticipantSpec {
            account_id: account.into(),
            entity_id: entity.into(),
            network_type: NetworkType::Wifi,
        };
        let call = svc
            .create_ipcall(&CreateIPCallRequest {
                call_type: IPCallType::Video,
                caller: spec("a", "e-a"),
                recipient: spec("b", "e-b"),
            })
            .await
            .unwrap();
        assert_eq!(svc.pending_ipcalls("b").await.unwrap().len(), 1);

        let update = |account: &str, state| UpdateIPCallRequest {
            account_id: account.into(),
            state,
            network_type: NetworkType::Cellular,
        };
        assert!(matches!(
            svc.update_ipcall_participant(call.id, &update("b", IPCallState::Pending)).await,
            Err(ExcommsError::InvalidArgument(_))
        ));
        assert!(matches!(
            svc.update_ipcall_participant(call.id, &update("b", IPCallState::Connected)).await,
            Err(ExcommsError::InvalidArgument(_))
        ));

        let accepted = svc
            .update_ipcall_participant(call.id, &update("b", IPCallState::Accepted))
            .await
            .unwrap();
        assert!(!accepted.pending);
        assert_eq!(accepted.participant("b").unwrap().state, IPCallState::Accepted);
        assert!(svc.pending_ipcalls("b").await.unwrap().is_empty());

        // Same state again is a no-op
        svc.update_ipcall_participant(call.id, &update("b", IPCallState::Accepted))
            .await
            .unwrap();

        svc.update_ipcall_participant(call.id, &update("a", IPCallState::Connected))
            .await
            .unwrap();
        let done = svc
            .update_ipcall_participant(call.id, &update("a", IPCallState::Completed))
            .await
            .unwrap();
        assert!(!done.is_active());
        assert_eq!(svc.ipcall(call.id).await.unwrap(), done);

        assert!(matches!(
            svc.update_ipcall_participant(call.id, &update("z", IPCallState::Accepted)).await,
            Err(ExcommsError::NotFound(_))
        ));
    }
}
