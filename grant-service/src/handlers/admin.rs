//! Management API behind `X-Admin-Api-Key`.

use crate::dtos::admin::{
    GrantListResponse, GrantQuery, GrantView, HostsResponse, PurgeResponse, RevokeGrantsRequest,
    RevokeGrantsResponse,
};
use crate::dtos::rules::{RuleListResponse, RuleView, RulerRequest, RulerView};
use crate::models::RuleDraft;
use crate::services::{GrantFilter, RevokeRequest};
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;
use validator::Validate;

const ADMIN_ACTOR: &str = "admin";

pub async fn list_rules(State(state): State<AppState>) -> Result<Json<RuleListResponse>, AppError> {
    let rules = state.coordinator.list_rules().await?;
    Ok(Json(RuleListResponse {
        rules: rules.into_iter().map(RuleView::from).collect(),
    }))
}

pub async fn create_rule(
    State(state): State<AppState>,
    Json(draft): Json<RuleDraft>,
) -> Result<(StatusCode, Json<RuleView>), AppError> {
    let rule = state.coordinator.create_rule(draft, ADMIN_ACTOR).await?;
    Ok((StatusCode::CREATED, Json(rule.into())))
}

pub async fn update_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(draft): Json<RuleDraft>,
) -> Result<Json<RuleView>, AppError> {
    let rule = state.coordinator.update_rule(&id, draft, ADMIN_ACTOR).await?;
    Ok(Json(rule.into()))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    state.coordinator.delete_rule(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_rulers(State(state): State<AppState>) -> Result<Json<Vec<RulerView>>, AppError> {
    let rulers = state.coordinator.list_rulers().await?;
    Ok(Json(rulers.into_iter().map(RulerView::from).collect()))
}

pub async fn put_ruler(
    State(state): State<AppState>,
    Path(email): Path<String>,
    Json(body): Json<RulerRequest>,
) -> Result<Json<RulerView>, AppError> {
    let ruler = state.coordinator.put_ruler(body.into_ruler(email)).await?;
    Ok(Json(ruler.into()))
}

pub async fn delete_ruler(
    State(state): State<AppState>,
    Path(email): Path<String>,
) -> Result<StatusCode, AppError> {
    state.coordinator.delete_ruler(&email).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn list_grants(
    State(state): State<AppState>,
    Query(query): Query<GrantQuery>,
) -> Result<Json<GrantListResponse>, AppError> {
    let filter = GrantFilter {
        email: query.email.map(|e| crate::models::normalize_email(&e)),
        host: query.host.map(|h| h.trim().to_lowercase()),
        db: query.db,
        role: query.role,
        active_only: query.active.unwrap_or(false),
    };
    let grants = state.coordinator.list_grants(&filter).await?;
    Ok(Json(GrantListResponse {
        grants: grants.into_iter().map(GrantView::from).collect(),
    }))
}

pub async fn revoke_grants(
    State(state): State<AppState>,
    Json(body): Json<RevokeGrantsRequest>,
) -> Result<Json<RevokeGrantsResponse>, AppError> {
    body.validate()?;
    let outcome = state
        .coordinator
        .revoke_grants(&RevokeRequest {
            email: body.email,
            host: body.host,
            db: body.db,
            role: body.role,
        })
        .await?;
    Ok(Json(RevokeGrantsResponse {
        accounts_dropped: outcome.accounts_dropped,
        grants_revoked: outcome.grants_revoked,
    }))
}

pub async fn revoke_fetch_token(
    State(state): State<AppState>,
    Path(fetch_token): Path<String>,
) -> Result<StatusCode, AppError> {
    state.registry.revoke_fetch_token(&fetch_token).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn purge_tokens(State(state): State<AppState>) -> Result<Json<PurgeResponse>, AppError> {
    let removed = state.registry.purge_expired().await?;
    Ok(Json(PurgeResponse { removed }))
}

pub async fn list_hosts(State(state): State<AppState>) -> Json<HostsResponse> {
    Json(HostsResponse {
        hosts: state.provisioner.hosts(),
    })
}
