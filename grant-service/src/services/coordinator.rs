//! Grant orchestration and rule management.
//!
//! A grant binds a fetch token to an email, asks the rule evaluator, provisions
//! the account and records the grant. Rule writes go through the same seams:
//! administrators write anything, rulers write within their own scope.

use super::error::GrantError;
use super::metrics;
use super::policy::{Decision, RuleEvaluator};
use super::provisioner::{Credentials, Provisioner};
use super::registry::TokenRegistry;
use super::store::{GrantFilter, Store};
use crate::models::{normalize_email, Grant, Role, Rule, RuleDraft, Ruler};
use chrono::Utc;
use std::sync::Arc;

/// Selects grants to revoke; `None` matches anything.
#[derive(Debug, Clone, Default)]
pub struct RevokeRequest {
    pub email: String,
    pub host: Option<String>,
    pub db: Option<String>,
    pub role: Option<Role>,
}

#[derive(Debug, Clone, Default)]
pub struct RevokeOutcome {
    pub accounts_dropped: usize,
    pub grants_revoked: u64,
}

pub struct GrantCoordinator {
    store: Arc<dyn Store>,
    registry: Arc<TokenRegistry>,
    provisioner: Arc<Provisioner>,
}

impl GrantCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<TokenRegistry>,
        provisioner: Arc<Provisioner>,
    ) -> Self {
        Self {
            store,
            registry,
            provisioner,
        }
    }

    /// Issue credentials for (`host`, `db`, `role`) to the fetch token's owner.
    ///
    /// The grant is recorded only after provisioning succeeds. If recording
    /// fails the account is dropped again and the credentials are withheld.
    pub async fn grant(
        &self,
        fetch_token: &str,
        host: &str,
        db: &str,
        role: &str,
    ) -> Result<Credentials, GrantError> {
        let email = self.registry.check_fetch_token(fetch_token).await?;
        let role: Role = role.parse()?;
        let host = host.trim().to_lowercase();
        let db = db.trim();

        let rules = self.store.list_rules().await?;
        let decision = RuleEvaluator::decide(&rules, &email, &host, db, role);
        metrics::record_decision(decision.as_str());
        if decision == Decision::Deny {
            tracing::info!(email = %email, host = %host, db = %db, role = %role, "Grant denied");
            return Err(GrantError::Forbidden);
        }

        let creds = self.provisioner.provision(&host, db, role, &email).await?;

        let grant = Grant::new(
            email.clone(),
            host.clone(),
            db.to_string(),
            role,
            creds.username.clone(),
            Utc::now(),
        );
        if let Err(e) = self.store.record_grant(&grant).await {
            tracing::error!(
                email = %email,
                host = %host,
                db = %db,
                username = %creds.username,
                error = %e,
                "Account provisioned but grant record failed; dropping account"
            );
            // An account with no grant record is invisible to revoke_grants.
            if let Err(drop_err) = self.provisioner.revoke(&host, db, &creds.username).await {
                tracing::error!(
                    host = %host,
                    db = %db,
                    username = %creds.username,
                    error = %drop_err,
                    "Untracked account could not be dropped"
                );
            }
            return Err(e);
        }

        tracing::info!(
            email = %email,
            host = %host,
            db = %db,
            role = %role,
            grant_id = %grant.grant_id,
            "Grant issued"
        );
        Ok(creds)
    }

    /// Drop every matching active account and mark its grants revoked.
    /// Stops at the first host that cannot be reached; grants already
    /// handled stay revoked.
    pub async fn revoke_grants(&self, request: &RevokeRequest) -> Result<RevokeOutcome, GrantError> {
        let filter = GrantFilter {
            email: Some(normalize_email(&request.email)),
            host: request.host.as_ref().map(|h| h.trim().to_lowercase()),
            db: request.db.clone(),
            role: request.role,
            active_only: true,
        };
        let grants = self.store.find_grants(&filter).await?;

        // Several grants can share one account (the same triple granted twice).
        let mut outcome = RevokeOutcome::default();
        let mut seen = std::collections::HashSet::new();
        for grant in &grants {
            let account = (grant.host.clone(), grant.db.clone(), grant.username.clone());
            if !seen.insert(account) {
                continue;
            }
            self.provisioner
                .revoke(&grant.host, &grant.db, &grant.username)
                .await?;
            outcome.accounts_dropped += 1;

            let ids: Vec<String> = grants
                .iter()
                .filter(|g| {
                    g.host == grant.host && g.db == grant.db && g.username == grant.username
                })
                .map(|g| g.grant_id.clone())
                .collect();
            outcome.grants_revoked += self.store.mark_revoked(&ids, Utc::now()).await?;
        }

        tracing::info!(
            email = %filter.email.as_deref().unwrap_or_default(),
            accounts = outcome.accounts_dropped,
            grants = outcome.grants_revoked,
            "Grants revoked"
        );
        Ok(outcome)
    }

    pub async fn list_grants(&self, filter: &GrantFilter) -> Result<Vec<Grant>, GrantError> {
        self.store.find_grants(filter).await
    }

    // Ruler self-service

    async fn ruler_for(&self, fetch_token: &str) -> Result<Ruler, GrantError> {
        let email = self.registry.check_fetch_token(fetch_token).await?;
        self.store
            .find_ruler(&email)
            .await?
            .ok_or(GrantError::Forbidden)
    }

    /// Rules that lie entirely within the ruler's scope.
    pub async fn ruler_list_rules(&self, fetch_token: &str) -> Result<Vec<Rule>, GrantError> {
        let ruler = self.ruler_for(fetch_token).await?;
        let rules = self.store.list_rules().await?;
        Ok(rules
            .into_iter()
            .filter(|r| {
                RuleEvaluator::authorize_rule_write(Some(&ruler), &r.draft()) == Decision::Allow
            })
            .collect())
    }

    pub async fn ruler_create_rule(
        &self,
        fetch_token: &str,
        draft: RuleDraft,
    ) -> Result<Rule, GrantError> {
        let ruler = self.ruler_for(fetch_token).await?;
        let draft = draft.normalized().map_err(GrantError::InvalidRule)?;
        if RuleEvaluator::authorize_rule_write(Some(&ruler), &draft) == Decision::Deny {
            tracing::info!(ruler = %ruler.email, "Rule write outside ruler scope refused");
            return Err(GrantError::Forbidden);
        }
        let rule = Rule::new(draft, ruler.email.clone(), Utc::now());
        self.store.insert_rule(&rule).await?;
        tracing::info!(ruler = %ruler.email, rule_id = %rule.id, which = %rule.which, "Rule created by ruler");
        Ok(rule)
    }

    pub async fn ruler_delete_rule(&self, fetch_token: &str, rule_id: &str) -> Result<(), GrantError> {
        let ruler = self.ruler_for(fetch_token).await?;
        let rule = self
            .store
            .find_rule(rule_id)
            .await?
            .ok_or_else(|| GrantError::NotFound("Rule".to_string()))?;
        if RuleEvaluator::authorize_rule_write(Some(&ruler), &rule.draft()) == Decision::Deny {
            return Err(GrantError::Forbidden);
        }
        self.store.delete_rule(rule_id).await?;
        tracing::info!(ruler = %ruler.email, rule_id = %rule_id, "Rule deleted by ruler");
        Ok(())
    }

    // Administration

    pub async fn list_rules(&self) -> Result<Vec<Rule>, GrantError> {
        self.store.list_rules().await
    }

    pub async fn create_rule(&self, draft: RuleDraft, created_by: &str) -> Result<Rule, GrantError> {
        let draft = draft.normalized().map_err(GrantError::InvalidRule)?;
        let rule = Rule::new(draft, created_by, Utc::now());
        self.store.insert_rule(&rule).await?;
        tracing::info!(rule_id = %rule.id, which = %rule.which, "Rule created");
        Ok(rule)
    }

    /// Replace a rule's policy, keeping its id and creation metadata.
    pub async fn update_rule(
        &self,
        id: &str,
        draft: RuleDraft,
        updated_by: &str,
    ) -> Result<Rule, GrantError> {
        let draft = draft.normalized().map_err(GrantError::InvalidRule)?;
        let existing = self
            .store
            .find_rule(id)
            .await?
            .ok_or_else(|| GrantError::NotFound("Rule".to_string()))?;
        let rule = existing.revised(draft, updated_by, Utc::now());
        if !self.store.replace_rule(&rule).await? {
            return Err(GrantError::NotFound("Rule".to_string()));
        }
        tracing::info!(rule_id = %id, updated_by = %updated_by, "Rule updated");
        Ok(rule)
    }

    pub async fn delete_rule(&self, id: &str) -> Result<(), GrantError> {
        if !self.store.delete_rule(id).await? {
            return Err(GrantError::NotFound("Rule".to_string()));
        }
        tracing::info!(rule_id = %id, "Rule deleted");
        Ok(())
    }

    pub async fn list_rulers(&self) -> Result<Vec<Ruler>, GrantError> {
        self.store.list_rulers().await
    }

    pub async fn put_ruler(&self, ruler: Ruler) -> Result<Ruler, GrantError> {
        let ruler = ruler.normalized().map_err(GrantError::InvalidRule)?;
        self.store.upsert_ruler(&ruler).await?;
        tracing::info!(ruler = %ruler.email, "Ruler saved");
        Ok(ruler)
    }

    pub async fn delete_ruler(&self, email: &str) -> Result<(), GrantError> {
        let email = normalize_email(email);
        if !self.store.delete_ruler(&email).await? {
            return Err(GrantError::NotFound("Ruler".to_string()));
        }
        tracing::info!(ruler = %email, "Ruler deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Scope, Which};
    use crate::services::mailer::MockMailer;
    use crate::services::memory::MemoryStore;
    use crate::services::provisioner::{AdminClients, MockAccountAdmin};
    use crate::services::registry::TokenSettings;
    use secrecy::ExposeSecret;
    use std::time::Duration;

    const HOST: &str = "mongodb03.nersc.gov";

    struct Harness {
        coordinator: GrantCoordinator,
        store: Arc<MemoryStore>,
        registry: Arc<TokenRegistry>,
        mailer: Arc<MockMailer>,
        admin: Arc<MockAccountAdmin>,
    }

    fn set(values: &[&str]) -> Scope<String> {
        Scope::only(values.iter().map(|v| v.to_string()))
    }

    async fn harness() -> Harness {
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn Store> = memory.clone();
        let mailer = Arc::new(MockMailer::new());
        let admin = Arc::new(MockAccountAdmin::new());
        let registry = Arc::new(TokenRegistry::new(
            store.clone(),
            mailer.clone(),
            TokenSettings::default(),
        ));
        let provisioner = Arc::new(Provisioner::new(
            AdminClients::builder(Duration::from_secs(5))
                .insert(HOST, admin.clone())
                .build(),
            Duration::from_secs(5),
        ));
        let coordinator = GrantCoordinator::new(store, registry.clone(), provisioner);
        coordinator
            .create_rule(
                RuleDraft {
                    which: Which::Allow,
                    hosts: Scope::All,
                    dbs: set(&["fw_"]),
                    emails: set(&["@espci.fr"]),
                },
                "admin",
            )
            .await
            .unwrap();
        Harness {
            coordinator,
            store: memory,
            registry,
            mailer,
            admin,
        }
    }

    async fn fetch_token(h: &Harness, email: &str) -> String {
        h.registry.request_token(email).await.unwrap();
        let body = h.mailer.last_to(email).unwrap().body;
        let (_, rest) = body.split_once("/verifytoken/").unwrap();
        let verify = rest.split_whitespace().next().unwrap();
        h.registry.verify(verify).await.unwrap().token
    }

    #[tokio::test]
    async fn grant_provisions_and_records() {
        let h = harness().await;
        let token = fetch_token(&h, "mcurie@espci.fr").await;

        let creds = h
            .coordinator
            .grant(&token, HOST, "fw_mc_polonium", "readWrite")
            .await
            .unwrap();
        assert_eq!(creds.username, "mcurie_espci.fr_readWrite");
        assert_eq!(
            h.admin.password_of("fw_mc_polonium", &creds.username).unwrap(),
            *creds.password.expose_secret()
        );

        let grants = h
            .coordinator
            .list_grants(&GrantFilter {
                email: Some("mcurie@espci.fr".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].role, Role::ReadWrite);
    }

    #[tokio::test]
    async fn failed_grant_record_drops_the_new_account() {
        let h = harness().await;
        let token = fetch_token(&h, "mcurie@espci.fr").await;
        h.store.set_failing_grant_writes(true);

        let err = h
            .coordinator
            .grant(&token, HOST, "fw_mc_polonium", "readWrite")
            .await
            .unwrap_err();
        assert!(matches!(err, GrantError::Internal(_)));
        assert!(h
            .admin
            .password_of("fw_mc_polonium", "mcurie_espci.fr_readWrite")
            .is_none());
        assert!(h
            .coordinator
            .list_grants(&GrantFilter::default())
            .await
            .unwrap()
            .is_empty());

        h.store.set_failing_grant_writes(false);
        let creds = h
            .coordinator
            .grant(&token, HOST, "fw_mc_polonium", "readWrite")
            .await
            .unwrap();
        assert_eq!(
            h.admin
                .password_of("fw_mc_polonium", &creds.username)
                .unwrap(),
            *creds.password.expose_secret()
        );
    }

    #[tokio::test]
    async fn bad_token_is_unauthorized_before_anything_else() {
        let h = harness().await;
        let err = h
            .coordinator
            .grant("not-a-token", HOST, "fw_x", "dbOwner")
            .await
            .unwrap_err();
        assert!(matches!(err, GrantError::Unauthorized));
    }

    #[tokio::test]
    async fn denied_grant_touches_no_account() {
        let h = harness().await;
        let token = fetch_token(&h, "mcurie@espci.fr").await;

        let err = h
            .coordinator
            .grant(&token, HOST, "mp_core", "read")
            .await
            .unwrap_err();
        assert!(matches!(err, GrantError::Forbidden));
        assert!(h.admin.password_of("mp_core", "mcurie_espci.fr_read").is_none());
    }

    #[tokio::test]
    async fn unknown_role_is_rejected() {
        let h = harness().await;
        let token = fetch_token(&h, "mcurie@espci.fr").await;
        let err = h
            .coordinator
            .grant(&token, HOST, "fw_x", "root")
            .await
            .unwrap_err();
        assert!(matches!(err, GrantError::InvalidRole(_)));
    }

    #[tokio::test]
    async fn revoke_drops_accounts_and_marks_grants() {
        let h = harness().await;
        let token = fetch_token(&h, "mcurie@espci.fr").await;
        for _ in 0..2 {
            h.coordinator
                .grant(&token, HOST, "fw_mc_polonium", "read")
                .await
                .unwrap();
        }
        h.coordinator
            .grant(&token, HOST, "fw_mc_radium", "readWrite")
            .await
            .unwrap();

        let outcome = h
            .coordinator
            .revoke_grants(&RevokeRequest {
                email: "mcurie@espci.fr".to_string(),
                db: Some("fw_mc_polonium".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(outcome.accounts_dropped, 1);
        assert_eq!(outcome.grants_revoked, 2);
        assert!(h.admin.password_of("fw_mc_polonium", "mcurie_espci.fr_read").is_none());
        assert!(h
            .admin
            .password_of("fw_mc_radium", "mcurie_espci.fr_readWrite")
            .is_some());

        let active = h
            .coordinator
            .list_grants(&GrantFilter {
                email: Some("mcurie@espci.fr".to_string()),
                active_only: true,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn ruler_writes_only_within_scope() {
        let h = harness().await;
        h.coordinator
            .put_ruler(Ruler {
                email: "boss@espci.fr".to_string(),
                hosts: set(&[HOST]),
                dbs: set(&["fw_"]),
                emails: set(&["@espci.fr"]),
                which: Scope::only([Which::Allow]),
            })
            .await
            .unwrap();
        let token = fetch_token(&h, "boss@espci.fr").await;

        let inside = RuleDraft {
            which: Which::Allow,
            hosts: set(&[HOST]),
            dbs: set(&["fw_mc_"]),
            emails: set(&["pcurie@espci.fr"]),
        };
        let rule = h.coordinator.ruler_create_rule(&token, inside).await.unwrap();
        assert_eq!(rule.created_by, "boss@espci.fr");

        let outside = RuleDraft {
            which: Which::Deny,
            hosts: set(&[HOST]),
            dbs: set(&["fw_"]),
            emails: set(&["@espci.fr"]),
        };
        assert!(matches!(
            h.coordinator.ruler_create_rule(&token, outside).await.unwrap_err(),
            GrantError::Forbidden
        ));

        // The admin's hosts="all" rule is wider than the ruler and stays hidden.
        let visible = h.coordinator.ruler_list_rules(&token).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, rule.id);

        h.coordinator.ruler_delete_rule(&token, &rule.id).await.unwrap();
    }

    #[tokio::test]
    async fn fetch_token_without_ruler_record_is_forbidden() {
        let h = harness().await;
        let token = fetch_token(&h, "mcurie@espci.fr").await;
        assert!(matches!(
            h.coordinator.ruler_list_rules(&token).await.unwrap_err(),
            GrantError::Forbidden
        ));
    }

    #[tokio::test]
    async fn update_rule_keeps_identity() {
        let h = harness().await;
        let rule = h.coordinator.list_rules().await.unwrap().remove(0);
        let updated = h
            .coordinator
            .update_rule(
                &rule.id,
                RuleDraft {
                    which: Which::Deny,
                    ..rule.draft()
                },
                "ops@espci.fr",
            )
            .await
            .unwrap();
        assert_eq!(updated.id, rule.id);
        assert_eq!(updated.created_utc, rule.created_utc);
        assert_eq!(updated.created_by, "admin");
        assert_eq!(updated.updated_by.as_deref(), Some("ops@espci.fr"));
        assert!(updated.updated_utc.is_some_and(|at| at >= rule.created_utc));
        assert!(rule.updated_by.is_none());

        let stored = h.coordinator.list_rules().await.unwrap().remove(0);
        assert_eq!(stored.updated_by.as_deref(), Some("ops@espci.fr"));
        assert_eq!(updated.which, Which::Deny);
        assert!(matches!(
            h.coordinator.delete_rule("missing").await.unwrap_err(),
            GrantError::NotFound(_)
        ));
    }
}
