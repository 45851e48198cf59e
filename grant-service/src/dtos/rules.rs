use super::rfc3339;
use crate::models::{Rule, Ruler, Scope, Which};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct RuleView {
    pub id: String,
    pub which: Which,
    pub hosts: Scope<String>,
    pub dbs: Scope<String>,
    pub emails: Scope<String>,
    pub created_by: String,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl From<Rule> for RuleView {
    fn from(rule: Rule) -> Self {
        Self {
            id: rule.id,
            which: rule.which,
            hosts: rule.hosts,
            dbs: rule.dbs,
            emails: rule.emails,
            created_by: rule.created_by,
            created_at: rfc3339(rule.created_utc),
            updated_by: rule.updated_by,
            updated_at: rule.updated_utc.map(rfc3339),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RuleListResponse {
    pub rules: Vec<RuleView>,
}

/// Body of `PUT /admin/rulers/{email}`.
#[derive(Debug, Deserialize)]
pub struct RulerRequest {
    pub hosts: Scope<String>,
    pub dbs: Scope<String>,
    pub emails: Scope<String>,
    pub which: Scope<Which>,
}

impl RulerRequest {
    pub fn into_ruler(self, email: String) -> Ruler {
        Ruler {
            email,
            hosts: self.hosts,
            dbs: self.dbs,
            emails: self.emails,
            which: self.which,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RulerView {
    pub email: String,
    pub hosts: Scope<String>,
    pub dbs: Scope<String>,
    pub emails: Scope<String>,
    pub which: Scope<Which>,
}

impl From<Ruler> for RulerView {
    fn from(ruler: Ruler) -> Self {
        Self {
            email: ruler.email,
            hosts: ruler.hosts,
            dbs: ruler.dbs,
            emails: ruler.emails,
            which: ruler.which,
        }
    }
}
