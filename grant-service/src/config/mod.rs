use secrecy::SecretString;
use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::fmt::Display;
use std::str::FromStr;

#[derive(Debug)]
pub struct GrantConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub mongodb: MongoConfig,
    /// Scheme and authority used to build verify links, e.g. `https://grants.example.org`.
    pub public_base_url: String,
    pub mail: MailConfig,
    pub tokens: TokenConfig,
    pub provisioning: ProvisioningConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" | "development" => Ok(Environment::Dev),
            "prod" | "production" => Ok(Environment::Prod),
            other => Err(format!("Unknown ENVIRONMENT '{}': expected dev or prod", other)),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MongoConfig {
    pub uri: String,
    pub database: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum MailTransport {
    Smtp,
    Mailgun,
    Mock,
}

impl FromStr for MailTransport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "smtp" => Ok(MailTransport::Smtp),
            "mailgun" => Ok(MailTransport::Mailgun),
            "mock" => Ok(MailTransport::Mock),
            other => Err(format!("Unknown MAILER '{}': expected smtp, mailgun or mock", other)),
        }
    }
}

#[derive(Debug)]
pub struct MailConfig {
    pub transport: MailTransport,
    pub from_email: String,
    pub from_name: String,
    pub timeout_seconds: u64,
    pub smtp: Option<SmtpConfig>,
    pub mailgun: Option<MailgunConfig>,
}

#[derive(Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: SecretString,
}

#[derive(Debug)]
pub struct MailgunConfig {
    /// e.g. `https://api.mailgun.net/v3/mg.example.org`
    pub base_url: String,
    pub api_key: SecretString,
}

#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub verify_ttl_minutes: i64,
    pub fetch_ttl_days: i64,
    pub retention_days: i64,
    pub require_allow_rule: bool,
}

#[derive(Debug)]
pub struct ProvisioningConfig {
    pub timeout_seconds: u64,
    pub admin_clients: Vec<AdminClientConfig>,
}

/// One privileged login per database host, as listed in `ADMIN_CLIENTS`.
#[derive(Debug, Deserialize)]
pub struct AdminClientConfig {
    pub host: String,
    pub username: String,
    pub password: SecretString,
}

#[derive(Debug)]
pub struct SecurityConfig {
    pub admin_api_key: SecretString,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub token_requests: u32,
    pub token_window_seconds: u64,
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

impl GrantConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let environment: Environment = env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "dev".to_string())
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let transport: MailTransport = get_env("MAILER", Some("mock"), is_prod)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let config = GrantConfig {
            common: common_config,
            environment,
            service_name: get_env("SERVICE_NAME", Some("grant-service"), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            mongodb: MongoConfig {
                uri: get_env("MONGODB_URI", Some("mongodb://localhost:27017"), is_prod)?,
                database: get_env("MONGODB_DATABASE", Some("grant_db"), is_prod)?,
            },
            public_base_url: get_env("PUBLIC_BASE_URL", Some("http://localhost:8080"), is_prod)?
                .trim_end_matches('/')
                .to_string(),
            mail: MailConfig {
                transport,
                from_email: get_env("MAIL_FROM_EMAIL", Some("noreply@localhost"), is_prod)?,
                from_name: get_env("MAIL_FROM_NAME", Some("Grant Service"), is_prod)?,
                timeout_seconds: parse_env("MAIL_TIMEOUT_SECONDS", "10")?,
                smtp: if transport == MailTransport::Smtp {
                    Some(SmtpConfig {
                        host: get_env("SMTP_HOST", None, is_prod)?,
                        port: parse_env("SMTP_PORT", "587")?,
                        user: get_env("SMTP_USER", None, is_prod)?,
                        password: SecretString::new(get_env("SMTP_PASSWORD", None, is_prod)?),
                    })
                } else {
                    None
                },
                mailgun: if transport == MailTransport::Mailgun {
                    Some(MailgunConfig {
                        base_url: get_env("MAILGUN_BASE_URL", None, is_prod)?
                            .trim_end_matches('/')
                            .to_string(),
                        api_key: SecretString::new(get_env("MAILGUN_API_KEY", None, is_prod)?),
                    })
                } else {
                    None
                },
            },
            tokens: TokenConfig {
                verify_ttl_minutes: parse_env("VERIFY_TOKEN_TTL_MINUTES", "60")?,
                fetch_ttl_days: parse_env("FETCH_TOKEN_TTL_DAYS", "30")?,
                retention_days: parse_env("TOKEN_RETENTION_DAYS", "7")?,
                require_allow_rule: parse_env("TOKENS_REQUIRE_ALLOW_RULE", "true")?,
            },
            provisioning: ProvisioningConfig {
                timeout_seconds: parse_env("PROVISION_TIMEOUT_SECONDS", "10")?,
                admin_clients: parse_admin_clients(&get_env("ADMIN_CLIENTS", Some("[]"), is_prod)?)?,
            },
            security: SecurityConfig {
                admin_api_key: SecretString::new(get_env("ADMIN_API_KEY", None, true)?),
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            },
            rate_limit: RateLimitConfig {
                token_requests: parse_env("RATE_LIMIT_TOKEN_REQUESTS", "5")?,
                token_window_seconds: parse_env("RATE_LIMIT_TOKEN_WINDOW_SECONDS", "900")?,
                global_ip_limit: parse_env("RATE_LIMIT_GLOBAL_IP_LIMIT", "100")?,
                global_ip_window_seconds: parse_env("RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS", "60")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.tokens.verify_ttl_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "VERIFY_TOKEN_TTL_MINUTES must be positive"
            )));
        }

        if self.tokens.fetch_ttl_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "FETCH_TOKEN_TTL_DAYS must be positive"
            )));
        }

        if self.tokens.retention_days < 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TOKEN_RETENTION_DAYS must not be negative"
            )));
        }

        if self.provisioning.timeout_seconds == 0 || self.mail.timeout_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PROVISION_TIMEOUT_SECONDS and MAIL_TIMEOUT_SECONDS must be positive"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.mail.transport == MailTransport::Mock {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "MAILER=mock is not allowed in production"
                )));
            }
        }

        if self.provisioning.admin_clients.is_empty() {
            tracing::warn!("No ADMIN_CLIENTS configured; every grant will fail with HostNotConfigured");
        }

        Ok(())
    }
}

fn parse_admin_clients(raw: &str) -> Result<Vec<AdminClientConfig>, AppError> {
    serde_json::from_str(raw).map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!(
            "ADMIN_CLIENTS must be a JSON array of {{host, username, password}}: {}",
            e
        ))
    })
}

/// Tuning knobs keep their defaults in every environment.
fn parse_env<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e)))
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}
