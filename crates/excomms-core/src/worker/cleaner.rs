//! Deletes provider-side calls, messages, media, recordings and
//! transcriptions once the gateway has its own copy.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{MessageHandler, Outcome};
use crate::clients::twilio::codes;
use crate::clients::TelephonyProvider;
use crate::clock::Clock;
use crate::database::Database;
use crate::error::Result;
use crate::events::DeleteResourceRequest;

pub struct ResourceCleaner {
    db: Database,
    telephony: Arc<dyn TelephonyProvider>,
    clock: Arc<dyn Clock>,
}

impl ResourceCleaner {
    pub fn new(db: Database, telephony: Arc<dyn TelephonyProvider>, clock: Arc<dyn Clock>) -> Self {
        Self { db, telephony, clock }
    }
}

#[async_trait]
impl MessageHandler for ResourceCleaner {
    fn name(&self) -> &'static str {
        "resource-cleaner"
    }

    async fn handle(&self, body: &[u8]) -> Result<Outcome> {
        let request: DeleteResourceRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                warn!("Dropping malformed cleanup request: {}", e);
                return Ok(Outcome::Ack);
            }
        };

        match self.telephony.delete_resource(request.kind, &request.resource_id).await {
            Ok(()) => {}
            Err(e) if e.provider_code() == Some(codes::RESOURCE_NOT_FOUND) => {
                debug!(resource_id = %request.resource_id, "Resource already gone");
            }
            Err(e) => return Err(e),
        }

        self.db
            .create_deleted_resource(request.kind.as_str(), &request.resource_id, self.clock.now())
            .await?;
        debug!(
            kind = request.kind.as_str(),
            resource_id = %request.resource_id,
            "Deleted provider resource"
        );
        Ok(Outcome::Ack)
    }
}
