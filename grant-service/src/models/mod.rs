pub mod grant;
pub mod rule;
pub mod scope;
pub mod token;

pub use grant::Grant;
pub use rule::{Role, Rule, RuleDraft, Ruler, UnknownRole, Which};
pub use scope::Scope;
pub use token::{FetchToken, TokenRecord, VerifyState, VerifyToken};

/// Trim and lower-case an email address or email pattern.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

// Helper module for optional DateTime<Utc> as BSON DateTime
pub(crate) mod opt_chrono_datetime_as_bson_datetime {
    use chrono::{DateTime, Utc};
    use mongodb::bson;
    use serde::{self, Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(dt) => {
                let bson_dt = bson::DateTime::from_chrono(*dt);
                bson_dt.serialize(serializer)
            }
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let opt: Option<bson::DateTime> = Option::deserialize(deserializer)?;
        Ok(opt.map(|dt| dt.to_chrono()))
    }
}
