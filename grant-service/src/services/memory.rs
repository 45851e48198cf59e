use super::error::GrantError;
use super::store::{GrantFilter, GrantStore, Redemption, RuleStore, Store, TokenStore};
use crate::models::{FetchToken, Grant, Rule, Ruler, TokenRecord, VerifyState, VerifyToken};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

#[derive(Default)]
struct Inner {
    rules: Vec<Rule>,
    rulers: BTreeMap<String, Ruler>,
    tokens: HashMap<String, TokenRecord>,
    grants: Vec<Grant>,
}

/// Process-local store. Each operation holds one lock, so conditional
/// updates are atomic just as they are against MongoDB.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    fail_grant_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `record_grant` fail, as a full or unreachable database would.
    pub fn set_failing_grant_writes(&self, fail: bool) {
        self.fail_grant_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>, GrantError> {
        self.inner
            .lock()
            .map_err(|_| GrantError::Internal(anyhow::anyhow!("memory store lock poisoned")))
    }
}

#[async_trait]
impl RuleStore for MemoryStore {
    async fn list_rules(&self) -> Result<Vec<Rule>, GrantError> {
        Ok(self.lock()?.rules.clone())
    }

    async fn find_rule(&self, id: &str) -> Result<Option<Rule>, GrantError> {
        Ok(self.lock()?.rules.iter().find(|r| r.id == id).cloned())
    }

    async fn insert_rule(&self, rule: &Rule) -> Result<(), GrantError> {
        let mut inner = self.lock()?;
        if inner.rules.iter().any(|r| r.id == rule.id) {
            return Err(GrantError::Conflict(format!("rule {} already exists", rule.id)));
        }
        inner.rules.push(rule.clone());
        Ok(())
    }

    async fn replace_rule(&self, rule: &Rule) -> Result<bool, GrantError> {
        let mut inner = self.lock()?;
        match inner.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => {
                *existing = rule.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_rule(&self, id: &str) -> Result<bool, GrantError> {
        let mut inner = self.lock()?;
        let before = inner.rules.len();
        inner.rules.retain(|r| r.id != id);
        Ok(inner.rules.len() < before)
    }

    async fn list_rulers(&self) -> Result<Vec<Ruler>, GrantError> {
        Ok(self.lock()?.rulers.values().cloned().collect())
    }

    async fn find_ruler(&self, email: &str) -> Result<Option<Ruler>, GrantError> {
        Ok(self.lock()?.rulers.get(email).cloned())
    }

    async fn upsert_ruler(&self, ruler: &Ruler) -> Result<(), GrantError> {
        self.lock()?
            .rulers
            .insert(ruler.email.clone(), ruler.clone());
        Ok(())
    }

    async fn delete_ruler(&self, email: &str) -> Result<bool, GrantError> {
        Ok(self.lock()?.rulers.remove(email).is_some())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn put_request(&self, email: &str, verify: &VerifyToken) -> Result<(), GrantError> {
        self.lock()?
            .tokens
            .entry(email.to_string())
            .and_modify(|record| record.verify = verify.clone())
            .or_insert_with(|| TokenRecord {
                email: email.to_string(),
                verify: verify.clone(),
                fetch: None,
            });
        Ok(())
    }

    async fn redeem_verify_token(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<Redemption, GrantError> {
        let mut inner = self.lock()?;
        let Some(record) = inner.tokens.values_mut().find(|r| r.verify.token == token) else {
            return Ok(Redemption::Unknown);
        };
        if record.verify.state == VerifyState::Verified {
            return Ok(Redemption::AlreadyUsed);
        }
        if record.verify.is_expired_at(now) {
            return Ok(Redemption::Expired);
        }
        record.verify.state = VerifyState::Verified;
        record.verify.verified_utc = Some(now);
        Ok(Redemption::Redeemed(record.clone()))
    }

    async fn swap_fetch_token(
        &self,
        email: &str,
        expected: Option<&str>,
        fetch: &FetchToken,
    ) -> Result<bool, GrantError> {
        let mut inner = self.lock()?;
        let Some(record) = inner.tokens.get_mut(email) else {
            return Ok(false);
        };
        if record.fetch.as_ref().map(|f| f.token.as_str()) != expected {
            return Ok(false);
        }
        record.fetch = Some(fetch.clone());
        Ok(true)
    }

    async fn find_token_record(&self, email: &str) -> Result<Option<TokenRecord>, GrantError> {
        Ok(self.lock()?.tokens.get(email).cloned())
    }

    async fn find_by_fetch_token(&self, token: &str) -> Result<Option<TokenRecord>, GrantError> {
        Ok(self
            .lock()?
            .tokens
            .values()
            .find(|r| r.fetch.as_ref().is_some_and(|f| f.token == token))
            .cloned())
    }

    async fn revoke_fetch_token(&self, token: &str) -> Result<bool, GrantError> {
        let mut inner = self.lock()?;
        let fetch = inner
            .tokens
            .values_mut()
            .filter_map(|r| r.fetch.as_mut())
            .find(|f| f.token == token);
        match fetch {
            Some(fetch) => {
                fetch.revoked = true;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn purge_inert(&self, cutoff: DateTime<Utc>) -> Result<u64, GrantError> {
        let mut inner = self.lock()?;
        let before = inner.tokens.len();
        inner.tokens.retain(|_, r| !r.is_inert_since(cutoff));
        Ok((before - inner.tokens.len()) as u64)
    }
}

#[async_trait]
impl GrantStore for MemoryStore {
    async fn record_grant(&self, grant: &Grant) -> Result<(), GrantError> {
        if self.fail_grant_writes.load(Ordering::SeqCst) {
            return Err(GrantError::Internal(anyhow::anyhow!("grant write rejected")));
        }
        self.lock()?.grants.push(grant.clone());
        Ok(())
    }

    async fn find_grants(&self, filter: &GrantFilter) -> Result<Vec<Grant>, GrantError> {
        let mut grants: Vec<Grant> = self
            .lock()?
            .grants
            .iter()
            .filter(|g| filter.matches(g))
            .cloned()
            .collect();
        grants.sort_by(|a, b| b.granted_utc.cmp(&a.granted_utc));
        Ok(grants)
    }

    async fn mark_revoked(&self, grant_ids: &[String], at: DateTime<Utc>) -> Result<u64, GrantError> {
        let mut inner = self.lock()?;
        let mut updated = 0;
        for grant in inner
            .grants
            .iter_mut()
            .filter(|g| g.revoked_utc.is_none() && grant_ids.contains(&g.grant_id))
        {
            grant.revoked_utc = Some(at);
            updated += 1;
        }
        Ok(updated)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> Result<(), GrantError> {
        self.lock().map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn fetch_token_swap_requires_the_expected_prior_value() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .put_request("a@b.c", &VerifyToken::requested("v1".into(), now, Duration::hours(1)))
            .await
            .unwrap();
        let fetch = |token: &str| FetchToken {
            token: token.to_string(),
            issued_utc: now,
            expires_utc: now + Duration::days(30),
            revoked: false,
        };

        assert!(store.swap_fetch_token("a@b.c", None, &fetch("f1")).await.unwrap());
        // A second verifier that also saw no fetch token loses.
        assert!(!store.swap_fetch_token("a@b.c", None, &fetch("f2")).await.unwrap());
        assert!(!store
            .swap_fetch_token("a@b.c", Some("stale"), &fetch("f3"))
            .await
            .unwrap());
        assert!(store
            .swap_fetch_token("a@b.c", Some("f1"), &fetch("f4"))
            .await
            .unwrap());
        assert!(!store
            .swap_fetch_token("nobody@b.c", None, &fetch("f5"))
            .await
            .unwrap());

        let record = store.find_token_record("a@b.c").await.unwrap().unwrap();
        assert_eq!(record.fetch.unwrap().token, "f4");
    }

    #[tokio::test]
    async fn new_request_keeps_existing_fetch_token() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .put_request("a@b.c", &VerifyToken::requested("v1".into(), now, Duration::hours(1)))
            .await
            .unwrap();
        assert!(store
            .swap_fetch_token(
                "a@b.c",
                None,
                &FetchToken {
                    token: "f1".into(),
                    issued_utc: now,
                    expires_utc: now + Duration::days(30),
                    revoked: false,
                },
            )
            .await
            .unwrap());
        store
            .put_request("a@b.c", &VerifyToken::requested("v2".into(), now, Duration::hours(1)))
            .await
            .unwrap();

        let record = store.find_by_fetch_token("f1").await.unwrap().unwrap();
        assert_eq!(record.verify.token, "v2");
        assert!(matches!(
            store.redeem_verify_token("v1", now).await.unwrap(),
            Redemption::Unknown
        ));
    }

    #[tokio::test]
    async fn redemption_is_single_use() {
        let store = MemoryStore::new();
        let now = Utc::now();
        store
            .put_request("a@b.c", &VerifyToken::requested("v".into(), now, Duration::hours(1)))
            .await
            .unwrap();

        assert!(matches!(
            store.redeem_verify_token("v", now).await.unwrap(),
            Redemption::Redeemed(_)
        ));
        assert!(matches!(
            store.redeem_verify_token("v", now).await.unwrap(),
            Redemption::AlreadyUsed
        ));
    }

    #[tokio::test]
    async fn mark_revoked_skips_already_revoked() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let grant = Grant::new(
            "a@b.c".into(),
            "h".into(),
            "db".into(),
            crate::models::Role::Read,
            "a_b.c_read".into(),
            now,
        );
        store.record_grant(&grant).await.unwrap();
        let ids = vec![grant.grant_id.clone()];
        assert_eq!(store.mark_revoked(&ids, now).await.unwrap(), 1);
        assert_eq!(store.mark_revoked(&ids, now).await.unwrap(), 0);
    }
}
