//! Credential provisioning against remote database hosts.
//!
//! Each configured host has one privileged connection (`AccountAdmin`).
//! Provisioning creates the account or rotates its password, serialized per
//! (host, username) so concurrent grants never hand out an overwritten secret.

use super::error::GrantError;
use super::metrics;
use crate::models::Role;
use crate::utils::generate_random_token;
use async_trait::async_trait;
use dashmap::DashMap;
use mongodb::{
    bson::doc,
    error::ErrorKind,
    options::{ClientOptions, Credential, ServerAddress},
    Client as MongoClient,
};
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

/// MongoDB server error code for a missing user.
const USER_NOT_FOUND: i32 = 11;

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("account does not exist")]
    UserNotFound,

    #[error("{0}")]
    Unavailable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Privileged account management on one database host.
#[async_trait]
pub trait AccountAdmin: Send + Sync {
    /// Create `username` on `db`, or reset its password and roles if it exists.
    async fn upsert_user(
        &self,
        db: &str,
        username: &str,
        password: &SecretString,
        role: Role,
    ) -> Result<(), UpstreamError>;

    /// Fails with `UserNotFound` when there is no such account.
    async fn drop_user(&self, db: &str, username: &str) -> Result<(), UpstreamError>;
}

pub struct MongoAccountAdmin {
    client: MongoClient,
    timeout: Duration,
}

impl MongoAccountAdmin {
    /// Builds a client for `host` authenticating against its `admin` database.
    /// Connections are opened lazily on first use.
    pub fn connect(
        host: &str,
        username: &str,
        password: &SecretString,
        timeout: Duration,
    ) -> Result<Self, UpstreamError> {
        let address = ServerAddress::parse(host)
            .map_err(|e| UpstreamError::Unavailable(format!("invalid host '{}': {}", host, e)))?;

        let credential = Credential::builder()
            .username(username.to_string())
            .password(password.expose_secret().to_string())
            .source("admin".to_string())
            .build();

        let options = ClientOptions::builder()
            .hosts(vec![address])
            .credential(credential)
            .connect_timeout(timeout)
            .server_selection_timeout(timeout)
            .app_name("grant-service".to_string())
            .build();

        let client = MongoClient::with_options(options)
            .map_err(|e| UpstreamError::Unavailable(e.to_string()))?;

        Ok(Self { client, timeout })
    }

    async fn command(&self, db: &str, command: mongodb::bson::Document) -> Result<(), UpstreamError> {
        let database = self.client.database(db);
        let run = database.run_command(command, None);
        match tokio::time::timeout(self.timeout, run).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if is_user_not_found(&e) => Err(UpstreamError::UserNotFound),
            Ok(Err(e)) => Err(UpstreamError::Unavailable(e.to_string())),
            Err(_) => Err(UpstreamError::Timeout(self.timeout)),
        }
    }
}

fn is_user_not_found(err: &mongodb::error::Error) -> bool {
    matches!(err.kind.as_ref(), ErrorKind::Command(cmd) if cmd.code == USER_NOT_FOUND)
}

#[async_trait]
impl AccountAdmin for MongoAccountAdmin {
    async fn upsert_user(
        &self,
        db: &str,
        username: &str,
        password: &SecretString,
        role: Role,
    ) -> Result<(), UpstreamError> {
        let roles = vec![doc! { "role": role.as_str(), "db": db }];
        let update = doc! {
            "updateUser": username,
            "pwd": password.expose_secret().as_str(),
            "roles": roles.clone(),
        };
        match self.command(db, update).await {
            Err(UpstreamError::UserNotFound) => {
                let create = doc! {
                    "createUser": username,
                    "pwd": password.expose_secret().as_str(),
                    "roles": roles,
                };
                self.command(db, create).await
            }
            other => other,
        }
    }

    async fn drop_user(&self, db: &str, username: &str) -> Result<(), UpstreamError> {
        self.command(db, doc! { "dropUser": username }).await
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().to_lowercase()
}

/// Host → admin connection, fixed once built.
#[derive(Clone, Default)]
pub struct AdminClients {
    clients: Arc<HashMap<String, Arc<dyn AccountAdmin>>>,
}

impl AdminClients {
    pub fn builder(timeout: Duration) -> AdminClientsBuilder {
        AdminClientsBuilder {
            clients: HashMap::new(),
            timeout,
        }
    }

    pub fn get(&self, host: &str) -> Option<Arc<dyn AccountAdmin>> {
        self.clients.get(&normalize_host(host)).cloned()
    }

    /// Configured host names, sorted.
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.clients.keys().cloned().collect();
        hosts.sort();
        hosts
    }
}

pub struct AdminClientsBuilder {
    clients: HashMap<String, Arc<dyn AccountAdmin>>,
    timeout: Duration,
}

impl AdminClientsBuilder {
    /// Register a MongoDB admin login for `host`, replacing any earlier one.
    pub fn set_admin_client(
        self,
        host: &str,
        username: &str,
        password: &SecretString,
    ) -> Result<Self, UpstreamError> {
        let admin = MongoAccountAdmin::connect(host, username, password, self.timeout)?;
        tracing::info!(host = %host, "Admin client configured");
        Ok(self.insert(host, Arc::new(admin)))
    }

    pub fn insert(mut self, host: &str, admin: Arc<dyn AccountAdmin>) -> Self {
        self.clients.insert(normalize_host(host), admin);
        self
    }

    pub fn build(self) -> AdminClients {
        AdminClients {
            clients: Arc::new(self.clients),
        }
    }
}

/// Account credentials as returned to the client.
#[derive(Debug)]
pub struct Credentials {
    pub username: String,
    pub password: SecretString,
}

/// `{local}_{domain}_{role}`; stable for a given email and role.
pub fn username_for(email: &str, role: Role) -> String {
    format!("{}_{}", email.split('@').collect::<Vec<_>>().join("_"), role)
}

type AccountKey = (String, String);

pub struct Provisioner {
    admins: AdminClients,
    timeout: Duration,
    locks: DashMap<AccountKey, Arc<AsyncMutex<()>>>,
}

impl Provisioner {
    pub fn new(admins: AdminClients, timeout: Duration) -> Self {
        Self {
            admins,
            timeout,
            locks: DashMap::new(),
        }
    }

    pub fn hosts(&self) -> Vec<String> {
        self.admins.hosts()
    }

    /// Create or rotate the account for (`email`, `role`) on `host`, with
    /// `role` on `db` as its only privilege. Every call sets a new password.
    #[tracing::instrument(skip(self), fields(username))]
    pub async fn provision(
        &self,
        host: &str,
        db: &str,
        role: Role,
        email: &str,
    ) -> Result<Credentials, GrantError> {
        let host = normalize_host(host);
        let admin = self
            .admins
            .get(&host)
            .ok_or_else(|| GrantError::HostNotConfigured(host.clone()))?;

        let username = username_for(email, role);
        tracing::Span::current().record("username", username.as_str());
        let password = SecretString::new(generate_random_token());

        let result = self
            .with_account_lock(&host, &username, || {
                admin.upsert_user(db, &username, &password, role)
            })
            .await;

        match result {
            Ok(()) => {
                metrics::record_provisioning(&host, "ok");
                tracing::info!("Account provisioned");
                Ok(Credentials { username, password })
            }
            Err(e) => {
                metrics::record_provisioning(&host, outcome_label(&e));
                tracing::error!(error = %e, "Provisioning failed");
                Err(upstream_to_grant_error(&host, e))
            }
        }
    }

    /// Drop the account. An account that is already gone counts as dropped.
    pub async fn revoke(&self, host: &str, db: &str, username: &str) -> Result<(), GrantError> {
        let host = normalize_host(host);
        let admin = self
            .admins
            .get(&host)
            .ok_or_else(|| GrantError::HostNotConfigured(host.clone()))?;

        let result = self
            .with_account_lock(&host, username, || admin.drop_user(db, username))
            .await;

        match result {
            Ok(()) | Err(UpstreamError::UserNotFound) => {
                tracing::info!(host = %host, db = %db, username = %username, "Account dropped");
                Ok(())
            }
            Err(e) => {
                tracing::error!(host = %host, username = %username, error = %e, "Failed to drop account");
                Err(upstream_to_grant_error(&host, e))
            }
        }
    }

    async fn with_account_lock<F, Fut>(
        &self,
        host: &str,
        username: &str,
        op: F,
    ) -> Result<(), UpstreamError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), UpstreamError>>,
    {
        let key = (host.to_string(), username.to_string());
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();

        let result = {
            let _guard = lock.lock().await;
            match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(UpstreamError::Timeout(self.timeout)),
            }
        };

        drop(lock);
        self.locks
            .remove_if(&key, |_, lock| Arc::strong_count(lock) == 1);
        result
    }

    #[cfg(test)]
    fn held_locks(&self) -> usize {
        self.locks.len()
    }
}

fn outcome_label(err: &UpstreamError) -> &'static str {
    match err {
        UpstreamError::Timeout(_) => "timeout",
        UpstreamError::UserNotFound | UpstreamError::Unavailable(_) => "unavailable",
    }
}

fn upstream_to_grant_error(host: &str, err: UpstreamError) -> GrantError {
    match err {
        UpstreamError::Timeout(after) => {
            GrantError::UpstreamTimeout(format!("{} did not answer within {:?}", host, after))
        }
        other => GrantError::UpstreamUnavailable(format!("{}: {}", host, other)),
    }
}

/// In-process stand-in for a database host.
#[derive(Default)]
pub struct MockAccountAdmin {
    accounts: std::sync::Mutex<HashMap<(String, String), (String, Role)>>,
    unavailable: std::sync::atomic::AtomicBool,
    delay: std::sync::Mutex<Option<Duration>>,
    in_flight: std::sync::atomic::AtomicUsize,
    max_in_flight: std::sync::atomic::AtomicUsize,
}

impl MockAccountAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable
            .store(unavailable, std::sync::atomic::Ordering::SeqCst);
    }

    /// Delay every command, e.g. to trip the provisioning timeout.
    pub fn set_delay(&self, delay: Option<Duration>) {
        if let Ok(mut d) = self.delay.lock() {
            *d = delay;
        }
    }

    pub fn password_of(&self, db: &str, username: &str) -> Option<String> {
        self.account(db, username).map(|(password, _)| password)
    }

    pub fn role_of(&self, db: &str, username: &str) -> Option<Role> {
        self.account(db, username).map(|(_, role)| role)
    }

    /// Highest number of commands that were ever running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn account(&self, db: &str, username: &str) -> Option<(String, Role)> {
        self.accounts
            .lock()
            .ok()?
            .get(&(db.to_string(), username.to_string()))
            .cloned()
    }

    async fn enter(&self) -> Result<(), UpstreamError> {
        use std::sync::atomic::Ordering;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delay.lock().ok().and_then(|d| *d);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            return Err(UpstreamError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    fn leave(&self) {
        self.in_flight
            .fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
    }
}

#[async_trait]
impl AccountAdmin for MockAccountAdmin {
    async fn upsert_user(
        &self,
        db: &str,
        username: &str,
        password: &SecretString,
        role: Role,
    ) -> Result<(), UpstreamError> {
        self.enter().await?;
        if let Ok(mut accounts) = self.accounts.lock() {
            accounts.insert(
                (db.to_string(), username.to_string()),
                (password.expose_secret().to_string(), role),
            );
        }
        self.leave();
        Ok(())
    }

    async fn drop_user(&self, db: &str, username: &str) -> Result<(), UpstreamError> {
        self.enter().await?;
        let removed = self
            .accounts
            .lock()
            .map(|mut accounts| {
                accounts
                    .remove(&(db.to_string(), username.to_string()))
                    .is_some()
            })
            .unwrap_or(false);
        self.leave();
        if removed {
            Ok(())
        } else {
            Err(UpstreamError::UserNotFound)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOST: &str = "mongodb03.nersc.gov";

    fn provisioner_with(admin: Arc<MockAccountAdmin>, timeout: Duration) -> Provisioner {
        let admins = AdminClients::builder(timeout).insert(HOST, admin).build();
        Provisioner::new(admins, timeout)
    }

    #[test]
    fn username_joins_local_part_domain_and_role() {
        assert_eq!(
            username_for("mcurie@espci.fr", Role::ReadWrite),
            "mcurie_espci.fr_readWrite"
        );
        assert_eq!(username_for("starlord@lbl.gov", Role::Read), "starlord_lbl.gov_read");
    }

    #[tokio::test]
    async fn provisioning_twice_rotates_the_password() {
        let admin = Arc::new(MockAccountAdmin::new());
        let provisioner = provisioner_with(admin.clone(), Duration::from_secs(5));

        let first = provisioner
            .provision(HOST, "fw_mc_polonium", Role::ReadWrite, "mcurie@espci.fr")
            .await
            .unwrap();
        let second = provisioner
            .provision(HOST, "fw_mc_polonium", Role::ReadWrite, "mcurie@espci.fr")
            .await
            .unwrap();

        assert_eq!(first.username, "mcurie_espci.fr_readWrite");
        assert_eq!(first.username, second.username);
        assert_ne!(first.password.expose_secret(), second.password.expose_secret());
        assert_eq!(
            admin.password_of("fw_mc_polonium", &second.username).unwrap(),
            *second.password.expose_secret()
        );
        assert_eq!(
            admin.role_of("fw_mc_polonium", &second.username),
            Some(Role::ReadWrite)
        );
    }

    #[tokio::test]
    async fn host_lookup_is_case_insensitive_and_misses_are_reported() {
        let provisioner = provisioner_with(Arc::new(MockAccountAdmin::new()), Duration::from_secs(5));
        assert!(provisioner
            .provision("MongoDB03.NERSC.gov", "db", Role::Read, "a@b.c")
            .await
            .is_ok());

        let err = provisioner
            .provision("elsewhere.example.org", "db", Role::Read, "a@b.c")
            .await
            .unwrap_err();
        assert!(matches!(err, GrantError::HostNotConfigured(h) if h == "elsewhere.example.org"));
    }

    #[tokio::test]
    async fn unreachable_host_is_upstream_unavailable() {
        let admin = Arc::new(MockAccountAdmin::new());
        admin.set_unavailable(true);
        let provisioner = provisioner_with(admin, Duration::from_secs(5));

        let err = provisioner
            .provision(HOST, "db", Role::Read, "a@b.c")
            .await
            .unwrap_err();
        assert!(matches!(err, GrantError::UpstreamUnavailable(_)));
        assert_eq!(provisioner.held_locks(), 0);
    }

    #[tokio::test]
    async fn slow_host_times_out() {
        let admin = Arc::new(MockAccountAdmin::new());
        admin.set_delay(Some(Duration::from_secs(5)));
        let provisioner = provisioner_with(admin, Duration::from_millis(50));

        let err = provisioner
            .provision(HOST, "db", Role::Read, "a@b.c")
            .await
            .unwrap_err();
        assert!(matches!(err, GrantError::UpstreamTimeout(_)));
    }

    #[tokio::test]
    async fn concurrent_grants_for_one_account_are_serialized() {
        let admin = Arc::new(MockAccountAdmin::new());
        admin.set_delay(Some(Duration::from_millis(10)));
        let provisioner = Arc::new(provisioner_with(admin.clone(), Duration::from_secs(5)));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let provisioner = provisioner.clone();
                tokio::spawn(async move {
                    provisioner
                        .provision(HOST, "fw_x", Role::ReadWrite, "mcurie@espci.fr")
                        .await
                })
            })
            .collect();

        let mut passwords = Vec::new();
        for handle in handles {
            let creds = handle.await.unwrap().unwrap();
            passwords.push(creds.password.expose_secret().to_string());
        }

        assert_eq!(admin.max_in_flight(), 1);
        let stored = admin
            .password_of("fw_x", "mcurie_espci.fr_readWrite")
            .unwrap();
        assert!(passwords.contains(&stored));
        assert_eq!(provisioner.held_locks(), 0);
    }

    #[tokio::test]
    async fn revoking_a_missing_account_succeeds() {
        let admin = Arc::new(MockAccountAdmin::new());
        let provisioner = provisioner_with(admin.clone(), Duration::from_secs(5));

        provisioner
            .revoke(HOST, "db", "nobody_example.org_read")
            .await
            .unwrap();

        let creds = provisioner
            .provision(HOST, "db", Role::Read, "a@b.c")
            .await
            .unwrap();
        provisioner.revoke(HOST, "db", &creds.username).await.unwrap();
        assert!(admin.password_of("db", &creds.username).is_none());
    }
}
