mod common;

use common::{TestApp, HOST};
use grant_service::models::Which;
use serde_json::Value;

#[tokio::test]
async fn health_check_works() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(app.url("/health"))
        .send()
        .await
        .expect("Failed to execute request");

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    assert!(response.headers().get("x-request-id").is_some());
}

#[tokio::test]
async fn grant_round_trip_rotates_password_for_stable_username() {
    let app = TestApp::spawn().await;
    app.allow(&["@espci.fr"], &["fw_"]).await;

    let fetch_token = app.fetch_token_for("mcurie@espci.fr").await;

    let first: Value = app
        .grant(&fetch_token, HOST, "fw_mc_polonium", "readWrite")
        .await
        .json()
        .await
        .unwrap();
    let second: Value = app
        .grant(&fetch_token, HOST, "fw_mc_polonium", "readWrite")
        .await
        .json()
        .await
        .unwrap();

    assert_eq!(first["username"], "mcurie_espci.fr_readWrite");
    assert_eq!(second["username"], first["username"]);
    assert_ne!(second["password"], first["password"]);

    // Only the latest password works upstream.
    assert_eq!(
        app.upstream
            .password_of("fw_mc_polonium", "mcurie_espci.fr_readWrite")
            .as_deref(),
        second["password"].as_str()
    );
}

#[tokio::test]
async fn gettoken_sends_verify_link() {
    let app = TestApp::spawn().await;
    app.allow(&["@espci.fr"], &["fw_"]).await;

    let response = app
        .client
        .get(app.url("/gettoken/MCurie@ESPCI.fr"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert!(body["msg"].as_str().unwrap().contains("mcurie@espci.fr"));

    let mail = app.mailer.last_to("mcurie@espci.fr").unwrap();
    assert!(mail.body.contains("http://grant.test/verifytoken/"));
}

#[tokio::test]
async fn gettoken_without_allow_rule_is_forbidden() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(app.url("/gettoken/stranger@example.com"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 403);
    assert!(app.mailer.sent().is_empty());
}

#[tokio::test]
async fn gettoken_rejects_malformed_email() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(app.url("/gettoken/not-an-email"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 422);
}

#[tokio::test]
async fn gettoken_mail_failure_is_bad_gateway() {
    let app = TestApp::spawn().await;
    app.allow(&["@espci.fr"], &["fw_"]).await;
    app.mailer.set_failing(true);

    let response = app
        .client
        .get(app.url("/gettoken/mcurie@espci.fr"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn verify_token_is_single_use() {
    let app = TestApp::spawn().await;
    app.allow(&["@espci.fr"], &["fw_"]).await;

    app.client
        .get(app.url("/gettoken/mcurie@espci.fr"))
        .send()
        .await
        .unwrap();
    let verify = app.verify_token_for("mcurie@espci.fr");

    let first = app
        .client
        .get(app.url(&format!("/verifytoken/{}", verify)))
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), 200);
    let body: Value = first.json().await.unwrap();
    assert_eq!(body["email"], "mcurie@espci.fr");
    assert_eq!(body["fetch_token"].as_str().unwrap().len(), 64);

    let second = app
        .client
        .get(app.url(&format!("/verifytoken/{}", verify)))
        .send()
        .await
        .unwrap();
    assert_eq!(second.status(), 409);
}

#[tokio::test]
async fn unknown_verify_token_is_not_found() {
    let app = TestApp::spawn().await;

    let response = app
        .client
        .get(app.url("/verifytoken/deadbeef"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn grant_with_unknown_fetch_token_is_unauthorized() {
    let app = TestApp::spawn().await;

    let response = app.grant("nope", HOST, "fw_x", "read").await;

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn grant_denied_by_rule_is_forbidden() {
    let app = TestApp::spawn().await;
    app.allow(&["@espci.fr"], &["fw_"]).await;
    app.add_rule(Which::Deny, &["mcurie@espci.fr"], &["fw_secret"])
        .await;
    let token = app.fetch_token_for("mcurie@espci.fr").await;

    let denied = app.grant(&token, HOST, "fw_secret", "read").await;
    assert_eq!(denied.status(), 403);

    let outside = app.grant(&token, HOST, "other_db", "read").await;
    assert_eq!(outside.status(), 403);

    let allowed = app.grant(&token, HOST, "fw_public", "read").await;
    assert_eq!(allowed.status(), 200);
}

#[tokio::test]
async fn grant_with_unknown_role_is_bad_request() {
    let app = TestApp::spawn().await;
    app.allow(&["@espci.fr"], &["fw_"]).await;
    let token = app.fetch_token_for("mcurie@espci.fr").await;

    let response = app.grant(&token, HOST, "fw_x", "dbOwner").await;

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn grant_on_unconfigured_host_is_bad_request() {
    let app = TestApp::spawn().await;
    app.allow(&["@espci.fr"], &["fw_"]).await;
    let token = app.fetch_token_for("mcurie@espci.fr").await;

    let response = app.grant(&token, "mongodb99.example.org", "fw_x", "read").await;

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn grant_with_unreachable_host_is_bad_gateway() {
    let app = TestApp::spawn().await;
    app.allow(&["@espci.fr"], &["fw_"]).await;
    let token = app.fetch_token_for("mcurie@espci.fr").await;
    app.upstream.set_unavailable(true);

    let response = app.grant(&token, HOST, "fw_x", "read").await;

    assert_eq!(response.status(), 502);
}

#[tokio::test]
async fn revoked_fetch_token_stops_working_but_keeps_grant_history() {
    let app = TestApp::spawn().await;
    app.allow(&["@espci.fr"], &["fw_"]).await;
    let token = app.fetch_token_for("mcurie@espci.fr").await;

    let granted = app.grant(&token, HOST, "fw_x", "read").await;
    assert_eq!(granted.status(), 200);

    let revoke = app
        .client
        .post(app.url(&format!("/admin/tokens/{}/revoke", token)))
        .header("x-admin-api-key", common::ADMIN_KEY)
        .send()
        .await
        .unwrap();
    assert_eq!(revoke.status(), 204);

    let response = app.grant(&token, HOST, "fw_x", "read").await;
    assert_eq!(response.status(), 401);

    let listed: Value = app
        .client
        .get(app.url("/admin/grants?email=mcurie@espci.fr&active=true"))
        .header("x-admin-api-key", common::ADMIN_KEY)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let grants = listed["grants"].as_array().unwrap();
    assert_eq!(grants.len(), 1);
    assert_eq!(grants[0]["db"], "fw_x");
    assert_eq!(grants[0]["username"], "mcurie_espci.fr_read");
    assert!(grants[0].get("revoked_at").is_none());
    assert!(app
        .upstream
        .password_of("fw_x", "mcurie_espci.fr_read")
        .is_some());
}

#[tokio::test]
async fn gettoken_is_rate_limited_per_ip() {
    let app = TestApp::spawn_with_limits(grant_service::config::RateLimitConfig {
        token_requests: 2,
        token_window_seconds: 600,
        global_ip_limit: 1000,
        global_ip_window_seconds: 60,
    })
    .await;
    app.allow(&["@espci.fr"], &["fw_"]).await;

    for _ in 0..2 {
        let ok = app
            .client
            .get(app.url("/gettoken/mcurie@espci.fr"))
            .send()
            .await
            .unwrap();
        assert_eq!(ok.status(), 200);
    }

    let limited = app
        .client
        .get(app.url("/gettoken/mcurie@espci.fr"))
        .send()
        .await
        .unwrap();
    assert_eq!(limited.status(), 429);
    assert!(limited.headers().get("retry-after").is_some());
}
