use grant_service::config::RateLimitConfig;
use grant_service::models::{RuleDraft, Scope, Which};
use grant_service::services::{
    AdminClients, MemoryStore, MockAccountAdmin, MockMailer, TokenSettings,
};
use grant_service::startup::Application;
use grant_service::{AppState, StateParts};
use secrecy::SecretString;
use service_core::config::Config as CoreConfig;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

pub const ADMIN_KEY: &str = "test-admin-key";
pub const HOST: &str = "mongodb03.nersc.gov";

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
    pub state: AppState,
    pub mailer: Arc<MockMailer>,
    pub upstream: Arc<MockAccountAdmin>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with_limits(RateLimitConfig {
            token_requests: 1000,
            token_window_seconds: 60,
            global_ip_limit: 10_000,
            global_ip_window_seconds: 60,
        })
        .await
    }

    pub async fn spawn_with_limits(rate_limit: RateLimitConfig) -> Self {
        let mailer = Arc::new(MockMailer::new());
        let upstream = Arc::new(MockAccountAdmin::new());
        let admins = AdminClients::builder(Duration::from_secs(2))
            .insert(HOST, upstream.clone())
            .build();

        let state = AppState::assemble(StateParts {
            store: Arc::new(MemoryStore::new()),
            mailer: mailer.clone(),
            admins,
            tokens: TokenSettings {
                public_base_url: "http://grant.test".to_string(),
                ..TokenSettings::default()
            },
            provision_timeout: Duration::from_secs(2),
            admin_api_key: SecretString::new(ADMIN_KEY.to_string()),
            allowed_origins: vec!["http://localhost:3000".to_string()],
            rate_limit,
        });

        // Use random port for testing (port 0)
        let common = CoreConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
        };
        let app = Application::build_with_state(&common, state.clone())
            .await
            .expect("Failed to build test application");
        let address = format!("http://127.0.0.1:{}", app.port());

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        // Wait for the server to be ready by polling health endpoint
        let client = reqwest::Client::new();
        let health_url = format!("{}/health", address);
        for _ in 0..50 {
            if client.get(&health_url).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        TestApp {
            address,
            client,
            state,
            mailer,
            upstream,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.address, path)
    }

    /// Allow rule for `emails` on every host, limited to `dbs`.
    pub async fn allow(&self, emails: &[&str], dbs: &[&str]) -> String {
        self.add_rule(Which::Allow, emails, dbs).await
    }

    pub async fn add_rule(&self, which: Which, emails: &[&str], dbs: &[&str]) -> String {
        let draft = RuleDraft {
            which,
            hosts: Scope::All,
            dbs: Scope::only(dbs.iter().map(|s| s.to_string())),
            emails: Scope::only(emails.iter().map(|s| s.to_string())),
        };
        self.state
            .coordinator
            .create_rule(draft, "test")
            .await
            .expect("Failed to seed rule")
            .id
    }

    /// The verify token from the last mail sent to `email`.
    pub fn verify_token_for(&self, email: &str) -> String {
        let mail = self
            .mailer
            .last_to(email)
            .expect("No mail sent to this address");
        let (_, rest) = mail
            .body
            .split_once("/verifytoken/")
            .expect("Mail carries no verify link");
        rest.chars().take_while(|c| c.is_ascii_hexdigit()).collect()
    }

    /// Run the full email round trip and return the fetch token.
    pub async fn fetch_token_for(&self, email: &str) -> String {
        let res = self
            .client
            .get(self.url(&format!("/gettoken/{}", email)))
            .send()
            .await
            .expect("Failed to request token");
        assert_eq!(res.status(), 200, "gettoken failed for {}", email);

        let verify = self.verify_token_for(email);
        let body: serde_json::Value = self
            .client
            .get(self.url(&format!("/verifytoken/{}", verify)))
            .send()
            .await
            .expect("Failed to verify token")
            .json()
            .await
            .expect("Verify response is not JSON");
        body["fetch_token"]
            .as_str()
            .expect("No fetch token in response")
            .to_string()
    }

    pub async fn grant(&self, fetch_token: &str, host: &str, db: &str, role: &str) -> reqwest::Response {
        self.client
            .post(self.url(&format!("/grant/{}", fetch_token)))
            .form(&[("role", role), ("host", host), ("db", db)])
            .send()
            .await
            .expect("Failed to execute grant request")
    }
}
