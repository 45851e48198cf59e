use crate::dtos::rfc3339;
use crate::dtos::tokens::{EmailPath, FetchTokenResponse, MessageResponse};
use crate::models::normalize_email;
use crate::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;
use validator::Validate;

/// `GET /gettoken/{email}`: mail a verify link to `email`.
pub async fn get_token(
    State(state): State<AppState>,
    Path(path): Path<EmailPath>,
) -> Result<Json<MessageResponse>, AppError> {
    let email = normalize_email(&path.email);
    EmailPath {
        email: email.clone(),
    }
    .validate()?;

    state.registry.request_token(&email).await?;

    Ok(Json(MessageResponse {
        msg: format!("Sent a verification link to {}.", email),
    }))
}

/// `GET /verifytoken/{verify_token}`: redeem the link and hand out the fetch token.
pub async fn verify_token(
    State(state): State<AppState>,
    Path(verify_token): Path<String>,
) -> Result<Json<FetchTokenResponse>, AppError> {
    let issued = state.registry.verify(&verify_token).await?;

    Ok(Json(FetchTokenResponse {
        email: issued.email,
        fetch_token: issued.token,
        expires_at: rfc3339(issued.expires_at),
    }))
}
