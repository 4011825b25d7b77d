use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceExt;

use brine::config::{MasterConfig, OrderedRules};
use brine::master::api::{router, TOKEN_HEADER};
use brine::master::{Master, StaticCredentials};
use brine::pki::Identity;
use brine::protocol::Message;

fn api_config() -> MasterConfig {
    let mut config = MasterConfig::default();
    config.auth_users = BTreeMap::from([
        ("fred".to_string(), StaticCredentials::hash_password("secret")),
        ("admin".to_string(), StaticCredentials::hash_password("hunter2")),
        ("carl".to_string(), StaticCredentials::hash_password("pw")),
    ]);
    config.external_auth = BTreeMap::from([(
        "auto".to_string(),
        OrderedRules::new()
            .with_rule("fred", &["test.*", "jobs.lookup_jid", "key.list_all"])
            .with_rule("admin", &[".*"]),
    )]);
    config
}

/// A master with web1 registered; the receiver sees what web1 is sent.
async fn master_with_minion(config: MasterConfig) -> (Arc<Master>, mpsc::Receiver<Message>) {
    let master = Arc::new(Master::in_memory(config));
    let (tx, rx) = mpsc::channel(16);
    let grains = BTreeMap::from([("os".to_string(), json!("Debian"))]);
    master
        .dispatcher()
        .registry()
        .write()
        .await
        .register("web1", grains, 1, tx);
    (master, rx)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn post(uri: &str, token: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(token) = token {
        builder = builder.header(TOKEN_HEADER, token);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn get(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().uri(uri);
    if let Some(token) = token {
        builder = builder.header(TOKEN_HEADER, token);
    }
    builder.body(Body::empty()).unwrap()
}

async fn login(app: &Router, username: &str, password: &str) -> String {
    let (status, body) = send(
        app,
        post(
            "/login",
            None,
            json!({"username": username, "password": password, "eauth": "auto"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "login failed: {}", body);
    body["token"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn test_login_issues_token_with_permissions() {
    let (master, _rx) = master_with_minion(api_config()).await;
    let app = router(master);

    let (status, body) = send(
        &app,
        post("/login", None, json!({"username": "fred", "password": "secret"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["user"], "fred");
    assert_eq!(body["eauth"], "auto");
    assert_eq!(body["perms"], json!(["test.*", "jobs.lookup_jid", "key.list_all"]));
    assert!(body["expire"].as_i64().unwrap() > body["start"].as_i64().unwrap());
    assert_eq!(body["token"].as_str().unwrap().len(), 32);
}

#[tokio::test]
async fn test_login_failures() {
    let (master, _rx) = master_with_minion(api_config()).await;
    let app = router(master);

    let (status, body) = send(
        &app,
        post("/login", None, json!({"username": "fred", "password": "wrong"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().is_some());

    let (status, _) = send(
        &app,
        post(
            "/login",
            None,
            json!({"username": "fred", "password": "secret", "eauth": "ldap"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Valid credentials but no external_auth entry.
    let (status, _) = send(
        &app,
        post("/login", None, json!({"username": "carl", "password": "pw"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_run_publishes_within_token_scope() {
    let (master, mut rx) = master_with_minion(api_config()).await;
    let app = router(master.clone());
    let token = login(&app, "fred", "secret").await;

    let (status, body) = send(
        &app,
        post("/run", Some(&token), json!({"fun": "test.ping", "tgt": "*"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{}", body);
    assert_eq!(body["minions"], json!(["web1"]));
    assert_eq!(body["delivered"], 1);
    assert!(matches!(rx.try_recv(), Ok(Message::Publish(_))));

    let jid = body["jid"].as_str().unwrap();
    let job = master.dispatcher().cache().read().await.lookup(jid).unwrap();
    assert_eq!(job.user.as_deref(), Some("fred"));

    let (status, _) = send(
        &app,
        post("/run", Some(&token), json!({"fun": "cmd.run", "tgt": "*", "arg": ["id"]})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_run_rejects_missing_or_unknown_token() {
    let (master, _rx) = master_with_minion(api_config()).await;
    let app = router(master);

    let (status, _) = send(&app, post("/run", None, json!({"fun": "test.ping", "tgt": "*"}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(
        &app,
        post("/run", Some("not-a-token"), json!({"fun": "test.ping", "tgt": "*"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_run_without_targets_is_unprocessable() {
    let (master, _rx) = master_with_minion(api_config()).await;
    let app = router(master);
    let token = login(&app, "fred", "secret").await;

    let (status, _) = send(
        &app,
        post(
            "/run",
            Some(&token),
            json!({"fun": "test.ping", "tgt": "os:Windows", "tgt_type": "grain"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = send(
        &app,
        post(
            "/run",
            Some(&token),
            json!({"fun": "test.ping", "tgt": "G@os:Debian and (", "tgt_type": "compound"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_job_lookup() {
    let (master, _rx) = master_with_minion(api_config()).await;
    let app = router(master);
    let token = login(&app, "fred", "secret").await;

    let (status, body) = send(&app, get("/jobs/20000101000000000000", Some(&token))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason"], "unknown");

    let (_, published) = send(
        &app,
        post("/run", Some(&token), json!({"fun": "test.ping", "tgt": "web*"})),
    )
    .await;
    let jid = published["jid"].as_str().unwrap();

    let (status, body) = send(&app, get(&format!("/jobs/{}", jid), Some(&token))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["function"], "test.ping");
    assert_eq!(body["minions"], json!(["web1"]));
    assert_eq!(body["missing"], json!(["web1"]));
    assert_eq!(body["returns"], json!({}));

    let (status, _) = send(&app, get(&format!("/jobs/{}", jid), None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_job_lookup_with_cache_disabled() {
    let mut config = api_config();
    config.job_cache = false;
    let (master, _rx) = master_with_minion(config).await;
    let app = router(master);
    let token = login(&app, "fred", "secret").await;

    let (status, body) = send(&app, get("/jobs/20000101000000000000", Some(&token))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason"], "not_tracked");
}

#[tokio::test]
async fn test_key_management_requires_capabilities() {
    let (master, _rx) = master_with_minion(api_config()).await;
    let pending = Identity::generate("db1");
    master
        .keys()
        .write()
        .await
        .evaluate("db1", &pending.public_key());

    let app = router(master.clone());
    let fred = login(&app, "fred", "secret").await;
    let admin = login(&app, "admin", "hunter2").await;

    let (status, body) = send(&app, get("/keys", Some(&fred))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pending"], json!(["db1"]));
    assert_eq!(body["accepted"], json!([]));

    let (status, _) = send(&app, post("/keys/db1/accept", Some(&fred), json!({}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, post("/keys/db1/accept", Some(&admin), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"id": "db1", "state": "accepted"}));

    let (status, body) = send(&app, post("/keys/db1/reject", Some(&admin), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "rejected");

    let (status, _) = send(&app, post("/keys/nobody/accept", Some(&admin), json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
