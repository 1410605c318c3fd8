//! JSON routes over [`ExcommsService`](crate::service::ExcommsService)

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::{ApiState, RpcError};
use crate::clients::AvailableNumber;
use crate::phone::PhoneNumber;
use crate::service::{
    BlockNumberRequest, CreateIPCallRequest, DeprovisionRequest, InitiatePhoneCallRequest,
    InitiatePhoneCallResponse, ProvisionEmailRequest, ProvisionPhoneNumberRequest, SearchNumbersRequest,
    SendMessageRequest, UpdateIPCallRequest,
};
use crate::types::IPCall;

type RpcResult<T> = std::result::Result<Json<T>, RpcError>;

pub(super) fn routes() -> Router<ApiState> {
    Router::new()
        .route("/phone_numbers/search", post(search_available_phone_numbers))
        .route("/phone_numbers", post(provision_phone_number))
        .route("/phone_numbers/deprovision", post(deprovision_phone_number))
        .route("/email_addresses", post(provision_email_address))
        .route("/email_addresses/deprovision", post(deprovision_email))
        .route("/messages", post(send_message))
        .route("/calls", post(initiate_phone_call))
        .route("/blocked_numbers/block", post(block_number))
        .route("/blocked_numbers/unblock", post(unblock_number))
        .route("/blocked_numbers/:provisioned", get(list_blocked_numbers))
        .route("/proxy_numbers", post(add_proxy_phone_number))
        .route("/ipcalls", post(create_ipcall))
        .route("/ipcalls/:id", get(ipcall))
        .route("/ipcalls/:id/participant", post(update_ipcall_participant))
        .route("/accounts/:account_id/pending_ipcalls", get(pending_ipcalls))
}

#[derive(Debug, Serialize)]
struct Endpoint {
    endpoint: String,
}

#[derive(Debug, Serialize)]
struct Empty {}

#[derive(Debug, Serialize)]
struct BlockedNumbers {
    numbers: Vec<PhoneNumber>,
}

#[derive(Debug, Deserialize)]
struct AddProxyNumber {
    organization_id: String,
    phone_number: String,
}

#[derive(Debug, Serialize)]
struct Added {
    added: bool,
}

async fn search_available_phone_numbers(
    State(state): State<ApiState>,
    Json(request): Json<SearchNumbersRequest>,
) -> RpcResult<Vec<AvailableNumber>> {
    Ok(Json(state.service.search_available_phone_numbers(&request).await?))
}

async fn provision_phone_number(
    State(state): State<ApiState>,
    Json(request): Json<ProvisionPhoneNumberRequest>,
) -> RpcResult<Endpoint> {
    let endpoint = state.service.provision_phone_number(&request).await?;
    Ok(Json(Endpoint { endpoint }))
}

async fn deprovision_phone_number(
    State(state): State<ApiState>,
    Json(request): Json<DeprovisionRequest>,
) -> RpcResult<Empty> {
    state.service.deprovision_phone_number(&request).await?;
    Ok(Json(Empty {}))
}

async fn provision_email_address(
    State(state): State<ApiState>,
    Json(request): Json<ProvisionEmailRequest>,
) -> RpcResult<Endpoint> {
    let endpoint = state.service.provision_email_address(&request).await?;
    Ok(Json(Endpoint { endpoint }))
}

async fn deprovision_email(
    State(state): State<ApiState>,
    Json(request): Json<DeprovisionRequest>,
) -> RpcResult<Empty> {
    state.service.deprovision_email(&request).await?;
    Ok(Json(Empty {}))
}

async fn send_message(State(state): State<ApiState>, Json(request): Json<SendMessageRequest>) -> RpcResult<Empty> {
    state.service.send_message(&request).await?;
    Ok(Json(Empty {}))
}

async fn initiate_phone_call(
    State(state): State<ApiState>,
    Json(request): Json<InitiatePhoneCallRequest>,
) -> RpcResult<InitiatePhoneCallResponse> {
    Ok(Json(state.service.initiate_phone_call(&request).await?))
}

async fn block_number(
    State(state): State<ApiState>,
    Json(request): Json<BlockNumberRequest>,
) -> RpcResult<BlockedNumbers> {
    let numbers = state.service.block_number(&request).await?;
    Ok(Json(BlockedNumbers { numbers }))
}

async fn unblock_number(
    State(state): State<ApiState>,
    Json(request): Json<BlockNumberRequest>,
) -> RpcResult<BlockedNumbers> {
    let numbers = state.service.unblock_number(&request).await?;
    Ok(Json(BlockedNumbers { numbers }))
}

async fn list_blocked_numbers(
    State(state): State<ApiState>,
    Path(provisioned): Path<String>,
) -> RpcResult<BlockedNumbers> {
    let numbers = state.service.list_blocked_numbers(&provisioned).await?;
    Ok(Json(BlockedNumbers { numbers }))
}

async fn add_proxy_phone_number(
    State(state): State<ApiState>,
    Json(request): Json<AddProxyNumber>,
) -> RpcResult<Added> {
    let added = state
        .service
        .add_proxy_phone_number(&request.organization_id, &request.phone_number)
        .await?;
    Ok(Json(Added { added }))
}

async fn create_ipcall(State(state): State<ApiState>, Json(request): Json<CreateIPCallRequest>) -> RpcResult<IPCall> {
    Ok(Json(state.service.create_ipcall(&request).await?))
}

async fn ipcall(State(state): State<ApiState>, Path(id): Path<u64>) -> RpcResult<IPCall> {
    Ok(Json(state.service.ipcall(id).await?))
}

async fn update_ipcall_participant(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
    Json(request): Json<UpdateIPCallRequest>,
) -> RpcResult<IPCall> {
    Ok(Json(state.service.update_ipcall_participant(id, &request).await?))
}

async fn pending_ipcalls(State(state): State<ApiState>, Path(account_id): Path<String>) -> RpcResult<Vec<IPCall>> {
    Ok(Json(state.service.pending_ipcalls(&account_id).await?))
}
