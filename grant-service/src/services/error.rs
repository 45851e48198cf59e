use service_core::error::AppError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GrantError {
    #[error("Invalid or expired fetch token")]
    Unauthorized,

    #[error("Not permitted")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} has expired")]
    Expired(String),

    #[error("{0}")]
    Conflict(String),

    #[error("No admin connection configured for host '{0}'")]
    HostNotConfigured(String),

    #[error("{0}")]
    InvalidRole(#[from] crate::models::UnknownRole),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Upstream database unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Upstream database timed out: {0}")]
    UpstreamTimeout(String),

    #[error("Email delivery failed: {0}")]
    Mail(#[from] super::mailer::MailError),

    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<GrantError> for AppError {
    fn from(err: GrantError) -> Self {
        match err {
            GrantError::Unauthorized => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid or expired fetch token"))
            }
            GrantError::Forbidden => AppError::Forbidden(anyhow::anyhow!("Not permitted")),
            GrantError::NotFound(what) => AppError::NotFound(anyhow::anyhow!("{} not found", what)),
            GrantError::Expired(what) => AppError::Gone(anyhow::anyhow!("{} has expired", what)),
            GrantError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            e @ GrantError::HostNotConfigured(_) => AppError::BadRequest(anyhow::anyhow!(e.to_string())),
            e @ GrantError::InvalidRole(_) => AppError::BadRequest(anyhow::anyhow!(e.to_string())),
            e @ GrantError::InvalidRule(_) => AppError::BadRequest(anyhow::anyhow!(e.to_string())),
            GrantError::UpstreamUnavailable(msg) => AppError::BadGateway(msg),
            GrantError::UpstreamTimeout(msg) => AppError::GatewayTimeout(msg),
            GrantError::Mail(e) => AppError::BadGateway(e.to_string()),
            GrantError::Database(e) => AppError::DatabaseError(anyhow::Error::new(e)),
            GrantError::Internal(e) => AppError::InternalError(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::axum::http::StatusCode;

    #[test]
    fn maps_onto_http_statuses() {
        let cases = [
            (GrantError::Unauthorized, StatusCode::UNAUTHORIZED),
            (GrantError::Forbidden, StatusCode::FORBIDDEN),
            (GrantError::NotFound("Verify token".into()), StatusCode::NOT_FOUND),
            (GrantError::Expired("Verify token".into()), StatusCode::GONE),
            (GrantError::Conflict("used".into()), StatusCode::CONFLICT),
            (GrantError::HostNotConfigured("h".into()), StatusCode::BAD_REQUEST),
            (GrantError::UpstreamUnavailable("down".into()), StatusCode::BAD_GATEWAY),
            (GrantError::UpstreamTimeout("slow".into()), StatusCode::GATEWAY_TIMEOUT),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status_code(), status);
        }
    }
}
