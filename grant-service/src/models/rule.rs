use super::{normalize_email, opt_chrono_datetime_as_bson_datetime, Scope};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Which {
    Allow,
    Deny,
}

impl std::fmt::Display for Which {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Which::Allow => write!(f, "allow"),
            Which::Deny => write!(f, "deny"),
        }
    }
}

/// Database role a provisioned account is granted on its database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "read")]
    Read,
    #[serde(rename = "readWrite")]
    ReadWrite,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Read => "read",
            Role::ReadWrite => "readWrite",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unsupported role '{0}': expected 'read' or 'readWrite'")]
pub struct UnknownRole(pub String);

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "read" => Ok(Role::Read),
            "readWrite" => Ok(Role::ReadWrite),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// The policy content of a rule, before it is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDraft {
    pub which: Which,
    pub hosts: Scope<String>,
    pub dbs: Scope<String>,
    pub emails: Scope<String>,
}

impl RuleDraft {
    /// Trims every value, lower-cases hosts and email patterns, and rejects
    /// empty values and empty explicit sets (a rule that can never match).
    pub fn normalized(self) -> Result<Self, String> {
        Ok(Self {
            which: self.which,
            hosts: normalize_scope("hosts", self.hosts, |h| h.trim().to_lowercase())?,
            dbs: normalize_scope("dbs", self.dbs, |d| d.trim().to_string())?,
            emails: normalize_scope("emails", self.emails, |e| normalize_email(e))?,
        })
    }
}

fn normalize_scope<F>(field: &str, scope: Scope<String>, f: F) -> Result<Scope<String>, String>
where
    F: Fn(&str) -> String,
{
    match scope {
        Scope::All => Ok(Scope::All),
        Scope::Only(values) => {
            if values.is_empty() {
                return Err(format!("{field} must be \"all\" or a non-empty list"));
            }
            let normalized: BTreeSet<String> = values.iter().map(|v| f(v)).collect();
            if normalized.iter().any(|v| v.is_empty()) {
                return Err(format!("{field} must not contain empty values"));
            }
            Ok(Scope::Only(normalized))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    #[serde(rename = "_id")]
    pub id: String,
    pub which: Which,
    pub hosts: Scope<String>,
    pub dbs: Scope<String>,
    pub emails: Scope<String>,
    pub created_by: String,
    #[serde(with = "mongodb::bson::serde_helpers::chrono_datetime_as_bson_datetime")]
    pub created_utc: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "opt_chrono_datetime_as_bson_datetime"
    )]
    pub updated_utc: Option<DateTime<Utc>>,
}

impl Rule {
    pub fn new(draft: RuleDraft, created_by: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            which: draft.which,
            hosts: draft.hosts,
            dbs: draft.dbs,
            emails: draft.emails,
            created_by: created_by.into(),
            created_utc: now,
            updated_by: None,
            updated_utc: None,
        }
    }

    /// Replace the policy fields, stamping who changed them and when.
    pub fn revised(
        self,
        draft: RuleDraft,
        updated_by: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            which: draft.which,
            hosts: draft.hosts,
            dbs: draft.dbs,
            emails: draft.emails,
            updated_by: Some(updated_by.into()),
            updated_utc: Some(now),
            ..self
        }
    }

    pub fn draft(&self) -> RuleDraft {
        RuleDraft {
            which: self.which,
            hosts: self.hosts.clone(),
            dbs: self.dbs.clone(),
            emails: self.emails.clone(),
        }
    }
}

/// Delegated authority: the largest scope within which `email` may write rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ruler {
    #[serde(rename = "_id")]
    pub email: String,
    pub hosts: Scope<String>,
    pub dbs: Scope<String>,
    pub emails: Scope<String>,
    pub which: Scope<Which>,
}

impl Ruler {
    pub fn normalized(self) -> Result<Self, String> {
        let email = normalize_email(&self.email);
        if email.is_empty() || !email.contains('@') {
            return Err("ruler email must be an email address".to_string());
        }
        if self.which.is_empty_set() {
            return Err("which must be \"all\" or a non-empty list".to_string());
        }
        Ok(Self {
            email,
            hosts: normalize_scope("hosts", self.hosts, |h| h.trim().to_lowercase())?,
            dbs: normalize_scope("dbs", self.dbs, |d| d.trim().to_string())?,
            emails: normalize_scope("emails", self.emails, |e| normalize_email(e))?,
            which: self.which,
        })
    }
}
