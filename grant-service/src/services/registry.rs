//! Token lifecycle: email → verify token → fetch token.

use super::error::GrantError;
use super::mailer::{MailError, Mailer};
use super::metrics;
use super::policy::RuleEvaluator;
use super::store::{Redemption, Store};
use crate::models::{normalize_email, FetchToken, VerifyToken};
use crate::utils::generate_random_token;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

const FETCH_SWAP_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct TokenSettings {
    pub verify_ttl: Duration,
    pub fetch_ttl: Duration,
    /// How long inert records are kept before `purge_expired` removes them.
    pub retention: Duration,
    pub require_allow_rule: bool,
    pub mail_timeout: std::time::Duration,
    /// Verify links are `{public_base_url}/verifytoken/{token}`.
    pub public_base_url: String,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            verify_ttl: Duration::minutes(60),
            fetch_ttl: Duration::days(30),
            retention: Duration::days(7),
            require_allow_rule: true,
            mail_timeout: std::time::Duration::from_secs(10),
            public_base_url: "http://localhost:8080".to_string(),
        }
    }
}

/// A fetch token as handed to the client after verification.
#[derive(Debug, Clone)]
pub struct IssuedFetchToken {
    pub email: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct TokenRegistry {
    store: Arc<dyn Store>,
    mailer: Arc<dyn Mailer>,
    settings: TokenSettings,
}

impl TokenRegistry {
    pub fn new(store: Arc<dyn Store>, mailer: Arc<dyn Mailer>, settings: TokenSettings) -> Self {
        Self {
            store,
            mailer,
            settings,
        }
    }

    pub fn settings(&self) -> &TokenSettings {
        &self.settings
    }

    /// Issue a new verify token for `email` and mail its link. Any pending
    /// verify token for the same email stops working.
    #[tracing::instrument(skip(self))]
    pub async fn request_token(&self, email: &str) -> Result<(), GrantError> {
        let email = normalize_email(email);
        let now = Utc::now();

        if self.settings.require_allow_rule {
            let rules = self.store.list_rules().await?;
            if !RuleEvaluator::email_has_allow_rule(&rules, &email) {
                tracing::info!("Token request refused: no allow rule names this email");
                return Err(GrantError::Forbidden);
            }
        }

        let verify = VerifyToken::requested(generate_random_token(), now, self.settings.verify_ttl);
        self.store.put_request(&email, &verify).await?;

        let link = format!(
            "{}/verifytoken/{}",
            self.settings.public_base_url, verify.token
        );
        let subject = format!("Fetch token from {}", self.link_host());
        let body = format!(
            "Hello {email},\n\n\
             Follow this link to receive your fetch token:\n\n\
             {link}\n\n\
             The link works once and expires in {} minutes. \
             If you did not ask for it, you can ignore this message.\n",
            self.settings.verify_ttl.num_minutes()
        );

        match tokio::time::timeout(
            self.settings.mail_timeout,
            self.mailer.send(&email, &subject, &body),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Failed to send verify link");
                return Err(e.into());
            }
            Err(_) => {
                tracing::error!("Timed out sending verify link");
                return Err(MailError::Timeout(self.settings.mail_timeout).into());
            }
        }

        metrics::record_token_requested();
        tracing::info!("Verify link sent");
        Ok(())
    }

    pub async fn verify(&self, verify_token: &str) -> Result<IssuedFetchToken, GrantError> {
        self.verify_at(verify_token, Utc::now()).await
    }

    /// Redeem a verify token. Extends the email's active fetch token if it
    /// has one, otherwise mints a new one.
    pub async fn verify_at(
        &self,
        verify_token: &str,
        now: DateTime<Utc>,
    ) -> Result<IssuedFetchToken, GrantError> {
        let record = match self.store.redeem_verify_token(verify_token, now).await? {
            Redemption::Redeemed(record) => record,
            Redemption::Unknown => {
                metrics::record_token_verified("unknown");
                return Err(GrantError::NotFound("Verify token".to_string()));
            }
            Redemption::Expired => {
                metrics::record_token_verified("expired");
                return Err(GrantError::Expired("Verify token".to_string()));
            }
            Redemption::AlreadyUsed => {
                metrics::record_token_verified("already_used");
                return Err(GrantError::Conflict(
                    "Verify token has already been used".to_string(),
                ));
            }
        };

        let expires_utc = now + self.settings.fetch_ttl;
        let email = record.email;
        let mut current = record.fetch;
        let mut installed = None;
        for _ in 0..FETCH_SWAP_ATTEMPTS {
            let fetch = next_fetch_token(current.as_ref(), now, expires_utc);
            let expected = current.as_ref().map(|f| f.token.as_str());
            if self.store.swap_fetch_token(&email, expected, &fetch).await? {
                installed = Some(fetch);
                break;
            }
            // Another verification for this email won; build on its token.
            current = self
                .store
                .find_token_record(&email)
                .await?
                .and_then(|r| r.fetch);
        }
        let Some(fetch) = installed else {
            tracing::warn!(email = %email, "Fetch token kept changing during verification");
            return Err(GrantError::Conflict(
                "Fetch token changed concurrently; request a new link".to_string(),
            ));
        };

        metrics::record_token_verified("verified");
        tracing::info!(email = %email, expires_at = %expires_utc, "Fetch token issued");

        Ok(IssuedFetchToken {
            email,
            token: fetch.token,
            expires_at: fetch.expires_utc,
        })
    }

    /// The email a fetch token is bound to, if the token is usable.
    pub async fn check_fetch_token(&self, token: &str) -> Result<String, GrantError> {
        self.check_fetch_token_at(token, Utc::now()).await
    }

    pub async fn check_fetch_token_at(
        &self,
        token: &str,
        now: DateTime<Utc>,
    ) -> Result<String, GrantError> {
        match self.store.find_by_fetch_token(token).await? {
            Some(record) if record.fetch.as_ref().is_some_and(|f| f.is_active_at(now)) => {
                Ok(record.email)
            }
            _ => Err(GrantError::Unauthorized),
        }
    }

    /// Revoking an already revoked token succeeds.
    pub async fn revoke_fetch_token(&self, token: &str) -> Result<(), GrantError> {
        if self.store.revoke_fetch_token(token).await? {
            tracing::info!("Fetch token revoked");
            Ok(())
        } else {
            Err(GrantError::NotFound("Fetch token".to_string()))
        }
    }

    pub async fn purge_expired(&self) -> Result<u64, GrantError> {
        self.purge_expired_at(Utc::now()).await
    }

    pub async fn purge_expired_at(&self, now: DateTime<Utc>) -> Result<u64, GrantError> {
        let removed = self.store.purge_inert(now - self.settings.retention).await?;
        tracing::info!(removed, "Purged inert token records");
        Ok(removed)
    }

    fn link_host(&self) -> &str {
        let url = self.settings.public_base_url.as_str();
        url.split_once("://").map_or(url, |(_, rest)| rest)
    }
}

/// Extend the active fetch token, or mint a new one.
fn next_fetch_token(
    current: Option<&FetchToken>,
    now: DateTime<Utc>,
    expires_utc: DateTime<Utc>,
) -> FetchToken {
    match current {
        Some(active) if active.is_active_at(now) => FetchToken {
            expires_utc,
            ..active.clone()
        },
        _ => FetchToken {
            token: generate_random_token(),
            issued_utc: now,
            expires_utc,
            revoked: false,
        },
    }
}
