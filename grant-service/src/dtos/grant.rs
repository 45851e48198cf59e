use serde::{Deserialize, Serialize};
use validator::Validate;

/// Form body of `POST /grant/{fetch_token}`.
#[derive(Debug, Deserialize, Validate)]
pub struct GrantForm {
    #[validate(length(min = 1, message = "role is required"))]
    pub role: String,
    #[validate(length(min = 1, max = 255, message = "host is required"))]
    pub host: String,
    #[validate(length(min = 1, max = 64, message = "db must be 1 to 64 characters"))]
    pub db: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CredentialsResponse {
    pub username: String,
    pub password: String,
}
