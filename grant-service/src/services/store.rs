//! Storage seams for rules, rulers, tokens and grants.
//!
//! `GrantDb` backs these with MongoDB; `MemoryStore` keeps everything in
//! process for tests and local runs.

use super::error::GrantError;
use crate::models::{FetchToken, Grant, Role, Rule, Ruler, TokenRecord, VerifyToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// All rules, oldest first.
    async fn list_rules(&self) -> Result<Vec<Rule>, GrantError>;
    async fn find_rule(&self, id: &str) -> Result<Option<Rule>, GrantError>;
    async fn insert_rule(&self, rule: &Rule) -> Result<(), GrantError>;
    /// Returns false when no rule has this id.
    async fn replace_rule(&self, rule: &Rule) -> Result<bool, GrantError>;
    async fn delete_rule(&self, id: &str) -> Result<bool, GrantError>;

    async fn list_rulers(&self) -> Result<Vec<Ruler>, GrantError>;
    async fn find_ruler(&self, email: &str) -> Result<Option<Ruler>, GrantError>;
    async fn upsert_ruler(&self, ruler: &Ruler) -> Result<(), GrantError>;
    async fn delete_ruler(&self, email: &str) -> Result<bool, GrantError>;
}

/// Outcome of trying to redeem a verify token.
#[derive(Debug, Clone)]
pub enum Redemption {
    /// This caller won the transition to Verified; the record as it now stands.
    Redeemed(TokenRecord),
    Expired,
    AlreadyUsed,
    Unknown,
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Store a fresh verify token for `email`, replacing any earlier one.
    /// The record's fetch token, if any, is left untouched.
    async fn put_request(&self, email: &str, verify: &VerifyToken) -> Result<(), GrantError>;

    /// Atomically move the token from Requested to Verified if it is still
    /// requested and unexpired at `now`. At most one caller gets `Redeemed`.
    async fn redeem_verify_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Redemption, GrantError>;

    /// Install `fetch` as the email's fetch token if the current one is still
    /// `expected` (`None`: no fetch token yet). Returns false, changing
    /// nothing, when another verification replaced it first.
    async fn swap_fetch_token(
        &self,
        email: &str,
        expected: Option<&str>,
        fetch: &FetchToken,
    ) -> Result<bool, GrantError>;
    async fn find_token_record(&self, email: &str) -> Result<Option<TokenRecord>, GrantError>;
    async fn find_by_fetch_token(&self, token: &str) -> Result<Option<TokenRecord>, GrantError>;
    /// Returns false when no record carries this fetch token.
    async fn revoke_fetch_token(&self, token: &str) -> Result<bool, GrantError>;
    /// Delete records with nothing usable since `cutoff`; returns how many.
    async fn purge_inert(&self, cutoff: DateTime<Utc>) -> Result<u64, GrantError>;
}

#[derive(Debug, Clone, Default)]
pub struct GrantFilter {
    pub email: Option<String>,
    pub host: Option<String>,
    pub db: Option<String>,
    pub role: Option<Role>,
    pub active_only: bool,
}

impl GrantFilter {
    pub fn matches(&self, grant: &Grant) -> bool {
        self.email.as_ref().map_or(true, |e| *e == grant.email)
            && self.host.as_ref().map_or(true, |h| *h == grant.host)
            && self.db.as_ref().map_or(true, |d| *d == grant.db)
            && self.role.map_or(true, |r| r == grant.role)
            && (!self.active_only || grant.is_active())
    }
}

#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn record_grant(&self, grant: &Grant) -> Result<(), GrantError>;
    /// Matching grants, newest first.
    async fn find_grants(&self, filter: &GrantFilter) -> Result<Vec<Grant>, GrantError>;
    async fn mark_revoked(&self, grant_ids: &[String], at: DateTime<Utc>) -> Result<u64, GrantError>;
}

/// Everything the service persists, behind one handle.
#[async_trait]
pub trait Store: RuleStore + TokenStore + GrantStore {
    /// Liveness check for /health.
    async fn ping(&self) -> Result<(), GrantError>;
}
