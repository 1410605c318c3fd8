//! # Proxy-number reservation
//!
//! Each organization owns a pool of numbers. A reservation binds one pool
//! number to an (originating, destination) pair for a bounded window so the
//! provider's dial-in to that number can be routed to the patient.
//!
//! A reservation moves through three windows:
//!
//! - `reservation_window` after [`ProxyNumberManager::reserve`], the time
//!   the provider has to dial in,
//! - `ongoing_call_ceiling` after [`ProxyNumberManager::call_started`],
//! - `short_grace` after [`ProxyNumberManager::call_ended`], during which
//!   the pool number cools down before it can be handed out again.

use std::sync::Arc;

use chrono::Duration;
use tracing::{debug, info, warn};

use crate::clock::{window, Clock};
use crate::config::ProxyNumberConfig;
use crate::database::proxy::{self, LOCK_ORG_POOL};
use crate::database::Database;
use crate::error::{ExcommsError, Result};
use crate::phone::PhoneNumber;
use crate::types::ProxyPhoneNumberReservation;

/// Parameters of a reservation request
#[derive(Debug, Clone, PartialEq)]
pub struct ReserveRequest {
    pub originating: PhoneNumber,
    pub destination: PhoneNumber,
    pub destination_entity_id: String,
    pub owner_entity_id: String,
    pub organization_id: String,
}

/// Allocates and tracks proxy-number reservations
#[derive(Clone)]
pub struct ProxyNumberManager {
    db: Database,
    clock: Arc<dyn Clock>,
    reservation_window: Duration,
    short_grace: Duration,
    ongoing_call_ceiling: Duration,
}

impl ProxyNumberManager {
    pub fn new(db: Database, clock: Arc<dyn Clock>, config: &ProxyNumberConfig) -> Self {
        Self {
            db,
            clock,
            reservation_window: window(config.reservation_window()),
            short_grace: window(config.short_grace()),
            ongoing_call_ceiling: window(config.ongoing_call_ceiling()),
        }
    }

    /// Reserve a proxy number for `request`.
    ///
    /// An unexpired reservation for the same pair, destination entity and
    /// owner is extended and its number returned again. Otherwise the pool
    /// number with the oldest cool-down is bound. Fails with
    /// [`ExcommsError::NoFreeNumber`] when every number is held or cooling
    /// down.
    pub async fn reserve(&self, request: &ReserveRequest) -> Result<PhoneNumber> {
        let now = self.clock.now();
        let expires = now + self.reservation_window;
        let mut tx = self.db.begin_locked(LOCK_ORG_POOL, &request.organization_id).await?;

        let mut superseded = None;
        if let Some(existing) = proxy::active_reservation_for_destination(
            &mut tx,
            &request.originating,
            &request.destination,
            now,
        )
        .await?
        {
            if existing.destination_entity_id == request.destination_entity_id
                && existing.owner_entity_id == request.owner_entity_id
            {
                let rows = proxy::set_expiration_for_destination(
                    &mut tx,
                    &request.originating,
                    &request.destination,
                    expires,
                    now,
                )
                .await?;
                ExcommsError::expect_rows(rows, 1, "reservation extension")?;
                tx.commit().await?;
                debug!(
                    proxy = %existing.proxy_phone_number,
                    originating = %request.originating,
                    "Extended existing proxy reservation"
                );
                return Ok(existing.proxy_phone_number);
            }

            // A different owner or callee takes over the pair.
            proxy::set_expiration_for_destination(
                &mut tx,
                &request.originating,
                &request.destination,
                now,
                now,
            )
            .await?;
            superseded = Some(existing.proxy_phone_number);
        }

        // The superseded number expires at `now` and would otherwise be
        // handed straight back.
        let available = proxy::available_proxy_numbers(&mut tx, &request.organization_id, now).await?;
        let chosen = available
            .into_iter()
            .find(|candidate| superseded.as_ref() != Some(&candidate.phone_number));
        let Some(chosen) = chosen else {
            warn!(org_id = %request.organization_id, "No proxy number available");
            return Err(ExcommsError::NoFreeNumber(format!(
                "every proxy number of organization {} is in use",
                request.organization_id
            )));
        };

        let reservation = ProxyPhoneNumberReservation {
            proxy_phone_number: chosen.phone_number.clone(),
            originating_phone_number: request.originating.clone(),
            destination_phone_number: request.destination.clone(),
            destination_entity_id: request.destination_entity_id.clone(),
            owner_entity_id: request.owner_entity_id.clone(),
            organization_id: request.organization_id.clone(),
            created: now,
            expires,
        };
        proxy::insert_reservation(&mut tx, &reservation).await?;
        tx.commit().await?;

        info!(
            proxy = %reservation.proxy_phone_number,
            originating = %request.originating,
            org_id = %request.organization_id,
            "Reserved proxy number"
        );
        Ok(reservation.proxy_phone_number)
    }

    /// Unexpired reservation for a provider dialing `proxy`
    pub async fn active_reservation(
        &self,
        originating: &PhoneNumber,
        proxy_number: &PhoneNumber,
    ) -> Result<ProxyPhoneNumberReservation> {
        let now = self.clock.now();
        let mut conn = self.db.pool().acquire().await?;
        proxy::active_reservation_for_proxy(&mut conn, originating, proxy_number, now)
            .await?
            .ok_or_else(|| {
                ExcommsError::not_found(format!(
                    "no active reservation for {} via {}",
                    originating, proxy_number
                ))
            })
    }

    /// Hold the reservation for the length of a live call.
    pub async fn call_started(&self, originating: &PhoneNumber, proxy_number: &PhoneNumber) -> Result<()> {
        let now = self.clock.now();
        let mut conn = self.db.pool().acquire().await?;
        let rows = proxy::set_expiration_for_proxy(
            &mut conn,
            originating,
            proxy_number,
            now + self.ongoing_call_ceiling,
            now,
        )
        .await?;
        ExcommsError::expect_rows(rows, 1, "call start")
    }

    /// Shorten the reservation to the grace window and start the pool
    /// number's cool-down.
    pub async fn call_ended(&self, originating: &PhoneNumber, proxy_number: &PhoneNumber) -> Result<()> {
        let now = self.clock.now();
        let grace_end = now + self.short_grace;
        let mut tx = self.db.begin().await?;

        let rows = proxy::set_expiration_for_proxy(&mut tx, originating, proxy_number, grace_end, now).await?;
        ExcommsError::expect_rows(rows, 1, "call end reservation")?;

        let rows = proxy::release_pool_number(&mut tx, proxy_number, grace_end, now).await?;
        ExcommsError::expect_rows(rows, 1, "call end pool number")?;

        tx.commit().await?;
        debug!(proxy = %proxy_number, "Proxy number cooling down");
        Ok(())
    }
}
