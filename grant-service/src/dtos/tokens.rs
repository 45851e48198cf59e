use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Deserialize, Validate)]
pub struct EmailPath {
    #[validate(email(message = "Must be a valid email address"))]
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub msg: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FetchTokenResponse {
    pub email: String,
    pub fetch_token: String,
    pub expires_at: String,
}
