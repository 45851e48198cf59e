use super::{opt_chrono_datetime_as_bson_datetime, Role};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audit record of one successful credential issue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    #[serde(rename = "_id")]
    pub grant_id: String,
    pub email: String,
    pub host: String,
    pub db: String,
    pub role: Role,
    pub username: String,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub granted_utc: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub revoked_utc: Option<DateTime<Utc>>,
}

impl Grant {
    pub fn new(
        email: String,
        host: String,
        db: String,
        role: Role,
        username: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            grant_id: uuid::Uuid::new_v4().to_string(),
            email,
            host,
            db,
            role,
            username,
            granted_utc: now,
            revoked_utc: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.revoked_utc.is_none()
    }
}
