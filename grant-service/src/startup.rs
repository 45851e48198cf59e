//! Application startup and lifecycle management.

use crate::config::{GrantConfig, MailConfig, MailTransport, ProvisioningConfig};
use crate::services::{
    AdminClients, GrantDb, Mailer, MailgunMailer, MockMailer, SmtpMailer, Store, TokenSettings,
};
use crate::{build_router, AppState, StateParts};
use secrecy::{ExposeSecret, SecretString};
use service_core::config::Config as CoreConfig;
use service_core::error::AppError;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    state: AppState,
}

impl Application {
    /// Build the application against MongoDB and the configured mailer and
    /// admin clients.
    pub async fn build(config: GrantConfig) -> Result<Self, AppError> {
        let db = GrantDb::connect(&config.mongodb.uri, &config.mongodb.database)
            .await
            .map_err(|e| {
                tracing::error!("Failed to connect to MongoDB: {}", e);
                e
            })?;

        db.initialize_indexes().await.map_err(|e| {
            tracing::error!("Failed to initialize database indexes: {}", e);
            e
        })?;

        let mailer = build_mailer(&config.mail)?;
        let admins = build_admin_clients(&config.provisioning)?;
        tracing::info!(hosts = ?admins.hosts(), "Admin clients initialized");

        let store: Arc<dyn Store> = Arc::new(db);
        let state = AppState::assemble(StateParts {
            store,
            mailer,
            admins,
            tokens: TokenSettings {
                verify_ttl: chrono::Duration::minutes(config.tokens.verify_ttl_minutes),
                fetch_ttl: chrono::Duration::days(config.tokens.fetch_ttl_days),
                retention: chrono::Duration::days(config.tokens.retention_days),
                require_allow_rule: config.tokens.require_allow_rule,
                mail_timeout: Duration::from_secs(config.mail.timeout_seconds),
                public_base_url: config.public_base_url.clone(),
            },
            provision_timeout: Duration::from_secs(config.provisioning.timeout_seconds),
            admin_api_key: SecretString::new(
                config.security.admin_api_key.expose_secret().to_string(),
            ),
            allowed_origins: config.security.allowed_origins.clone(),
            rate_limit: config.rate_limit.clone(),
        });

        Self::build_with_state(&config.common, state).await
    }

    /// Bind the listener for an already assembled state (port 0 = random port).
    pub async fn build_with_state(common: &CoreConfig, state: AppState) -> Result<Self, AppError> {
        let addr = common.socket_addr();
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!("Failed to bind HTTP listener to {}: {}", addr, e);
            AppError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(port = port, "Grant service listening");

        Ok(Self {
            port,
            listener,
            state,
        })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Serve until `shutdown` resolves, then drain in-flight requests.
    pub async fn run_until<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let app = build_router(self.state);
        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
    }

    pub async fn run_until_stopped(self) -> std::io::Result<()> {
        self.run_until(std::future::pending()).await
    }
}

fn build_mailer(config: &MailConfig) -> Result<Arc<dyn Mailer>, AppError> {
    let timeout = Duration::from_secs(config.timeout_seconds);
    let mailer: Arc<dyn Mailer> = match config.transport {
        MailTransport::Smtp => {
            let smtp = config.smtp.as_ref().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!("SMTP mailer selected but not configured"))
            })?;
            let mailer = SmtpMailer::new(smtp, &config.from_email, &config.from_name, timeout)
                .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;
            tracing::info!("SMTP mailer initialized");
            Arc::new(mailer)
        }
        MailTransport::Mailgun => {
            let mailgun = config.mailgun.as_ref().ok_or_else(|| {
                AppError::ConfigError(anyhow::anyhow!(
                    "Mailgun mailer selected but not configured"
                ))
            })?;
            let mailer =
                MailgunMailer::new(mailgun, &config.from_email, &config.from_name, timeout)
                    .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;
            Arc::new(mailer)
        }
        MailTransport::Mock => {
            tracing::warn!("Mock mailer in use; verify emails are kept in memory, not sent");
            Arc::new(MockMailer::new())
        }
    };
    Ok(mailer)
}

fn build_admin_clients(config: &ProvisioningConfig) -> Result<AdminClients, AppError> {
    let mut builder = AdminClients::builder(Duration::from_secs(config.timeout_seconds));
    for client in &config.admin_clients {
        builder = builder
            .set_admin_client(&client.host, &client.username, &client.password)
            .map_err(|e| AppError::ConfigError(anyhow::anyhow!(e)))?;
    }
    Ok(builder.build())
}
