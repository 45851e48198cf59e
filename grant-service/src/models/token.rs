use super::opt_chrono_datetime_as_bson_datetime;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerifyState {
    Requested,
    Verified,
}

/// Single-use token delivered by email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyToken {
    pub token: String,
    pub state: VerifyState,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub requested_utc: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub expires_utc: DateTime<Utc>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub verified_utc: Option<DateTime<Utc>>,
}

impl VerifyToken {
    pub fn requested(token: String, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            token,
            state: VerifyState::Requested,
            requested_utc: now,
            expires_utc: now + ttl,
            verified_utc: None,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_utc
    }
}

/// Long-lived bearer token bound to the record's email.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchToken {
    pub token: String,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub issued_utc: DateTime<Utc>,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub expires_utc: DateTime<Utc>,
    #[serde(default)]
    pub revoked: bool,
}

impl FetchToken {
    pub fn is_active_at(&self, now: DateTime<Utc>) -> bool {
        !self.revoked && now <= self.expires_utc
    }
}

/// One record per email: the latest verify token and the active fetch token, if any.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    #[serde(rename = "_id")]
    pub email: String,
    pub verify: VerifyToken,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fetch: Option<FetchToken>,
}

impl TokenRecord {
    /// Nothing in the record can be redeemed or used any more, and has not
    /// been usable since `cutoff`.
    pub fn is_inert_since(&self, cutoff: DateTime<Utc>) -> bool {
        let verify_inert = self.verify.state == VerifyState::Verified
            || self.verify.expires_utc < cutoff;
        let fetch_inert = match &self.fetch {
            None => true,
            Some(fetch) => fetch.revoked || fetch.expires_utc < cutoff,
        };
        verify_inert && fetch_inert && self.last_activity() < cutoff
    }

    fn last_activity(&self) -> DateTime<Utc> {
        let mut latest = self.verify.requested_utc;
        if let Some(verified) = self.verify.verified_utc {
            latest = latest.max(verified);
        }
        if let Some(fetch) = &self.fetch {
            latest = latest.max(fetch.issued_utc);
        }
        latest
    }
}
