use crate::config::{MailgunConfig, SmtpConfig};
use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};
use secrecy::{ExposeSecret, SecretString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MailError {
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Mail transport misconfigured: {0}")]
    Configuration(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// Outbound mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError>;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn new(
        config: &SmtpConfig,
        from_email: &str,
        from_name: &str,
        timeout: Duration,
    ) -> Result<Self, MailError> {
        let creds = Credentials::new(
            config.user.clone(),
            config.password.expose_secret().to_string(),
        );

        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
            .map_err(|e| MailError::Configuration(format!("Failed to create SMTP relay: {}", e)))?
            .port(config.port)
            .credentials(creds)
            .timeout(Some(timeout))
            .build();

        let from = format!("{} <{}>", from_name, from_email)
            .parse()
            .map_err(|e| MailError::Configuration(format!("Invalid from address: {}", e)))?;

        tracing::info!(host = %config.host, port = config.port, "SMTP mailer initialized");

        Ok(Self { transport, from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let to_mailbox: Mailbox = to
            .parse()
            .map_err(|e| MailError::InvalidAddress(format!("{}: {}", to, e)))?;

        let message = Message::builder()
            .from(self.from.clone())
            .to(to_mailbox)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_string())
            .map_err(|e| MailError::SendFailed(format!("Failed to build message: {}", e)))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| MailError::SendFailed(format!("Failed to send email: {}", e)))?;

        Ok(())
    }
}

/// Mailgun HTTP API: `POST {base_url}/messages` with basic auth `api:{key}`.
pub struct MailgunMailer {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    from: String,
}

impl MailgunMailer {
    pub fn new(
        config: &MailgunConfig,
        from_email: &str,
        from_name: &str,
        timeout: Duration,
    ) -> Result<Self, MailError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MailError::Configuration(format!("Failed to build HTTP client: {}", e)))?;

        tracing::info!(base_url = %config.base_url, "Mailgun mailer initialized");

        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: SecretString::new(config.api_key.expose_secret().to_string()),
            from: format!("{} <{}>", from_name, from_email),
        })
    }
}

#[async_trait]
impl Mailer for MailgunMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .basic_auth("api", Some(self.api_key.expose_secret()))
            .form(&[
                ("from", self.from.as_str()),
                ("to", to),
                ("subject", subject),
                ("text", body),
            ])
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    MailError::SendFailed("Mailgun request timed out".to_string())
                } else {
                    MailError::SendFailed(format!("Mailgun request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(MailError::SendFailed(format!(
                "Mailgun returned {}: {}",
                status, detail
            )));
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct SentMail {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Records messages instead of sending them.
#[derive(Default)]
pub struct MockMailer {
    sent: Mutex<Vec<SentMail>>,
    fail: AtomicBool,
}

impl MockMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent sends fail.
    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentMail> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn last_to(&self, to: &str) -> Option<SentMail> {
        self.sent().into_iter().rev().find(|m| m.to == to)
    }
}

#[async_trait]
impl Mailer for MockMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), MailError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MailError::SendFailed("mock transport set to fail".to_string()));
        }
        tracing::info!(to = %to, subject = %subject, "Mock mailer captured message");
        self.sent
            .lock()
            .map_err(|_| MailError::SendFailed("mock mailbox poisoned".to_string()))?
            .push(SentMail {
                to: to.to_string(),
                subject: subject.to_string(),
                body: body.to_string(),
            });
        Ok(())
    }
}
