//! HTTP surface: provider webhooks, signed media links and the internal
//! RPC routes.

use std::time::Duration;

use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error};

use crate::context::Context;
use crate::error::{ExcommsError, Result};
use crate::service::ExcommsService;
use crate::telephony::EventsHandler;

mod rpc;
mod security_headers;
mod webhooks;

pub use security_headers::security_headers_middleware;

/// Lifetime of the blob-store URL a signed media link redirects to
const MEDIA_REDIRECT_TTL: Duration = Duration::from_secs(5 * 60);

/// Shared state of every route
#[derive(Clone)]
pub struct ApiState {
    pub ctx: Context,
    pub events: EventsHandler,
    pub service: ExcommsService,
}

impl ApiState {
    pub fn new(ctx: Context) -> Self {
        Self {
            events: EventsHandler::new(ctx.clone()),
            service: ExcommsService::new(ctx.clone()),
            ctx,
        }
    }
}

/// Create the gateway router
pub fn create_router(ctx: Context) -> Router {
    let timeout = Duration::from_secs(ctx.config.http.request_timeout_secs);
    let state = ApiState::new(ctx);

    Router::new()
        .route("/twilio/sms", post(webhooks::incoming_sms))
        .route("/twilio/call/:event", post(webhooks::call_event))
        .route(
            "/sendgrid/email",
            post(webhooks::incoming_email).layer(DefaultBodyLimit::max(webhooks::EMAIL_BODY_LIMIT)),
        )
        .route("/health", get(health))
        .route("/media/:id", get(media))
        .nest("/v1", rpc::routes())
        .with_state(state)
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
}

/// Error answered to the telephony and email providers. Anything gating a
/// state change is a 5xx so the provider retries.
pub(crate) struct WebhookError(ExcommsError);

impl From<ExcommsError> for WebhookError {
    fn from(e: ExcommsError) -> Self {
        Self(e)
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.0.status_code();
        if status.is_server_error() {
            error!("Webhook failed: {}", self.0);
        } else {
            debug!("Webhook rejected: {}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

/// Error answered to internal RPC callers as `{"error": ...}`
pub(crate) struct RpcError(ExcommsError);

impl From<ExcommsError> for RpcError {
    fn from(e: ExcommsError) -> Self {
        Self(e)
    }
}

impl IntoResponse for RpcError {
    fn into_response(self) -> Response {
        let status = self.0.rpc_status_code();
        if status.is_server_error() {
            error!("RPC failed: {}", self.0);
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

async fn health(State(state): State<ApiState>) -> std::result::Result<&'static str, WebhookError> {
    state.ctx.db.health_check().await?;
    Ok("OK")
}

#[derive(Debug, Deserialize)]
struct MediaQuery {
    expires: i64,
    signature: String,
}

/// Signed media link: verify, then hand the caller a short-lived blob URL.
async fn media(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<MediaQuery>,
) -> Response {
    let result: Result<String> = async {
        state
            .ctx
            .signer
            .verify(&id, query.expires, &query.signature, state.ctx.clock.now())?;
        state.ctx.blobs.expiring_url(&id, MEDIA_REDIRECT_TTL).await
    }
    .await;

    match result {
        Ok(url) => Redirect::temporary(&url).into_response(),
        Err(ExcommsError::InvalidArgument(msg)) => {
            debug!(media_id = %id, "Refusing media link: {}", msg);
            StatusCode::FORBIDDEN.into_response()
        }
        Err(e) => RpcError(e).into_response(),
    }
}
