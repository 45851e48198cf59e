pub mod admin;
pub mod grant;
pub mod rules;
pub mod tokens;

use chrono::{DateTime, SecondsFormat, Utc};

pub(crate) fn rfc3339(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
