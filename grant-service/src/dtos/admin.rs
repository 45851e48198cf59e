use super::rfc3339;
use crate::models::{Grant, Role};
use serde::{Deserialize, Serialize};
use validator::Validate;

#[derive(Debug, Default, Deserialize)]
pub struct GrantQuery {
    pub email: Option<String>,
    pub host: Option<String>,
    pub db: Option<String>,
    pub role: Option<Role>,
    /// Only grants that have not been revoked.
    pub active: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GrantView {
    pub grant_id: String,
    pub email: String,
    pub host: String,
    pub db: String,
    pub role: Role,
    pub username: String,
    pub granted_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<String>,
}

impl From<Grant> for GrantView {
    fn from(grant: Grant) -> Self {
        Self {
            grant_id: grant.grant_id,
            email: grant.email,
            host: grant.host,
            db: grant.db,
            role: grant.role,
            username: grant.username,
            granted_at: rfc3339(grant.granted_utc),
            revoked_at: grant.revoked_utc.map(rfc3339),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GrantListResponse {
    pub grants: Vec<GrantView>,
}

/// Body of `POST /admin/grants/revoke`; omitted fields match anything.
#[derive(Debug, Deserialize, Validate)]
pub struct RevokeGrantsRequest {
    #[validate(email(message = "Must be a valid email address"))]
    pub email: String,
    pub host: Option<String>,
    pub db: Option<String>,
    pub role: Option<Role>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RevokeGrantsResponse {
    pub accounts_dropped: usize,
    pub grants_revoked: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PurgeResponse {
    pub removed: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HostsResponse {
    pub hosts: Vec<String>,
}
