use crate::dtos::grant::{CredentialsResponse, GrantForm};
use crate::AppState;
use axum::{
    extract::{Path, State},
    Form, Json,
};
use secrecy::ExposeSecret;
use service_core::error::AppError;
use validator::Validate;

/// `POST /grant/{fetch_token}` with form fields `role`, `host`, `db`.
pub async fn grant(
    State(state): State<AppState>,
    Path(fetch_token): Path<String>,
    Form(form): Form<GrantForm>,
) -> Result<Json<CredentialsResponse>, AppError> {
    form.validate()?;

    let creds = state
        .coordinator
        .grant(&fetch_token, &form.host, &form.db, &form.role)
        .await?;

    Ok(Json(CredentialsResponse {
        username: creds.username,
        password: creds.password.expose_secret().to_string(),
    }))
}
