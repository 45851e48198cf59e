//! Rule management for rulers, authenticated by their own fetch token.

use crate::dtos::rules::{RuleListResponse, RuleView};
use crate::models::RuleDraft;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use service_core::error::AppError;

pub async fn list_rules(
    State(state): State<AppState>,
    Path(fetch_token): Path<String>,
) -> Result<Json<RuleListResponse>, AppError> {
    let rules = state.coordinator.ruler_list_rules(&fetch_token).await?;
    Ok(Json(RuleListResponse {
        rules: rules.into_iter().map(RuleView::from).collect(),
    }))
}

pub async fn create_rule(
    State(state): State<AppState>,
    Path(fetch_token): Path<String>,
    Json(draft): Json<RuleDraft>,
) -> Result<(StatusCode, Json<RuleView>), AppError> {
    let rule = state
        .coordinator
        .ruler_create_rule(&fetch_token, draft)
        .await?;
    Ok((StatusCode::CREATED, Json(rule.into())))
}

pub async fn delete_rule(
    State(state): State<AppState>,
    Path((fetch_token, rule_id)): Path<(String, String)>,
) -> Result<StatusCode, AppError> {
    state
        .coordinator
        .ruler_delete_rule(&fetch_token, &rule_id)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}
