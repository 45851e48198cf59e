use crate::AppState;
use axum::{
    extract::{Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use subtle::ConstantTimeEq;

pub const ADMIN_API_KEY_HEADER: &str = "x-admin-api-key";

pub async fn admin_auth_middleware(
    State(state): State<AppState>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let api_key = headers
        .get(ADMIN_API_KEY_HEADER)
        .and_then(|value| value.to_str().ok());

    match api_key {
        Some(key) if key_matches(key, state.admin_api_key.expose_secret()) => {
            next.run(request).await
        }
        _ => {
            tracing::warn!("Failed admin authentication attempt");
            AppError::Unauthorized(anyhow::anyhow!("Invalid or missing admin API key"))
                .into_response()
        }
    }
}

fn key_matches(provided: &str, expected: &str) -> bool {
    !expected.is_empty() && bool::from(provided.as_bytes().ct_eq(expected.as_bytes()))
}
