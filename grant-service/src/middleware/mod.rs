pub mod admin;

pub use admin::admin_auth_middleware;
