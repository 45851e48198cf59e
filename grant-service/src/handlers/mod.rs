pub mod admin;
pub mod grant;
pub mod health;
pub mod metrics;
pub mod rules;
pub mod tokens;
