pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod utils;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state},
    routing::{delete, get, post, put},
    Router,
};
use secrecy::SecretString;
use service_core::middleware::{
    metrics::metrics_middleware,
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    request_id::{request_id_middleware, REQUEST_ID_HEADER},
    security_headers::security_headers_middleware,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::RateLimitConfig;
use crate::services::{
    AdminClients, GrantCoordinator, Mailer, Provisioner, Store, TokenRegistry, TokenSettings,
};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub registry: Arc<TokenRegistry>,
    pub coordinator: Arc<GrantCoordinator>,
    pub provisioner: Arc<Provisioner>,
    pub admin_api_key: Arc<SecretString>,
    pub allowed_origins: Vec<String>,
    pub token_rate_limiter: IpRateLimiter,
    pub ip_rate_limiter: IpRateLimiter,
}

/// Everything `AppState::assemble` needs; production and tests differ only
/// in which store, mailer and admin clients they pass.
pub struct StateParts {
    pub store: Arc<dyn Store>,
    pub mailer: Arc<dyn Mailer>,
    pub admins: AdminClients,
    pub tokens: TokenSettings,
    pub provision_timeout: Duration,
    pub admin_api_key: SecretString,
    pub allowed_origins: Vec<String>,
    pub rate_limit: RateLimitConfig,
}

impl AppState {
    pub fn assemble(parts: StateParts) -> Self {
        let registry = Arc::new(TokenRegistry::new(
            parts.store.clone(),
            parts.mailer,
            parts.tokens,
        ));
        let provisioner = Arc::new(Provisioner::new(parts.admins, parts.provision_timeout));
        let coordinator = Arc::new(GrantCoordinator::new(
            parts.store.clone(),
            registry.clone(),
            provisioner.clone(),
        ));

        let token_rate_limiter = create_ip_rate_limiter(
            parts.rate_limit.token_requests,
            parts.rate_limit.token_window_seconds,
        );
        let ip_rate_limiter = create_ip_rate_limiter(
            parts.rate_limit.global_ip_limit,
            parts.rate_limit.global_ip_window_seconds,
        );

        Self {
            store: parts.store,
            registry,
            coordinator,
            provisioner,
            admin_api_key: Arc::new(parts.admin_api_key),
            allowed_origins: parts.allowed_origins,
            token_rate_limiter,
            ip_rate_limiter,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let admin_routes = Router::new()
        .route(
            "/admin/rules",
            get(handlers::admin::list_rules).post(handlers::admin::create_rule),
        )
        .route(
            "/admin/rules/:id",
            put(handlers::admin::update_rule).delete(handlers::admin::delete_rule),
        )
        .route("/admin/rulers", get(handlers::admin::list_rulers))
        .route(
            "/admin/rulers/:email",
            put(handlers::admin::put_ruler).delete(handlers::admin::delete_ruler),
        )
        .route("/admin/grants", get(handlers::admin::list_grants))
        .route("/admin/grants/revoke", post(handlers::admin::revoke_grants))
        .route(
            "/admin/tokens/:fetch_token/revoke",
            post(handlers::admin::revoke_fetch_token),
        )
        .route("/admin/tokens/purge", post(handlers::admin::purge_tokens))
        .route("/admin/hosts", get(handlers::admin::list_hosts))
        .layer(from_fn_with_state(
            state.clone(),
            middleware::admin_auth_middleware,
        ));

    // Each request mails someone, so it gets a tighter limit than the rest.
    let token_limiter = state.token_rate_limiter.clone();
    let token_route = Router::new()
        .route("/gettoken/:email", get(handlers::tokens::get_token))
        .layer(from_fn_with_state(token_limiter, ip_rate_limit_middleware));

    let ip_limiter = state.ip_rate_limiter.clone();

    let cors = CorsLayer::new()
        .allow_origin(
            state
                .allowed_origins
                .iter()
                .filter_map(|o| match o.parse::<HeaderValue>() {
                    Ok(value) => Some(value),
                    Err(e) => {
                        tracing::error!("Invalid CORS origin '{}': {}. Skipping.", o, e);
                        None
                    }
                })
                .collect::<Vec<HeaderValue>>(),
        )
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            HeaderName::from_static(middleware::admin::ADMIN_API_KEY_HEADER),
            HeaderName::from_static(REQUEST_ID_HEADER),
        ]);

    Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/ready", get(handlers::health::readiness_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route("/verifytoken/:verify_token", get(handlers::tokens::verify_token))
        .route("/grant/:fetch_token", post(handlers::grant::grant))
        .route(
            "/rules/:fetch_token",
            get(handlers::rules::list_rules).post(handlers::rules::create_rule),
        )
        .route(
            "/rules/:fetch_token/:rule_id",
            delete(handlers::rules::delete_rule),
        )
        .merge(token_route)
        .merge(admin_routes)
        .with_state(state)
        // Global IP rate limiting
        .layer(from_fn_with_state(ip_limiter, ip_rate_limit_middleware))
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get(REQUEST_ID_HEADER)
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    // Paths carry tokens; log the route template only.
                    route = %route_template(request.uri().path()),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors)
}

/// Replace the secret-bearing segment of token routes with a placeholder.
fn route_template(path: &str) -> String {
    let mut segments = path.trim_start_matches('/').splitn(2, '/');
    let head = segments.next().unwrap_or_default();
    match (head, segments.next()) {
        ("gettoken" | "verifytoken" | "grant" | "rules", Some(_)) => format!("/{}/{{redacted}}", head),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::route_template;

    #[test]
    fn token_paths_are_redacted() {
        assert_eq!(route_template("/verifytoken/abc123"), "/verifytoken/{redacted}");
        assert_eq!(route_template("/rules/abc/rule-1"), "/rules/{redacted}");
        assert_eq!(route_template("/health"), "/health");
        assert_eq!(route_template("/admin/tokens/purge"), "/admin/tokens/purge");
    }
}
