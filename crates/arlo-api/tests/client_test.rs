#![allow(clippy::unwrap_used)]
// Integration tests for `ArloClient` using wiremock.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use secrecy::SecretString;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_partial_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use arlo_api::{
    ArloClient, ClientConfig, Error, NotifyTarget, TransportConfig, TwoFactorSettings,
    TwoFactorSource,
};

// ── Helpers ─────────────────────────────────────────────────────────

/// Hands out a fixed code, or nothing at all.
struct ScriptedCode(Option<&'static str>);

impl TwoFactorSource for ScriptedCode {
    fn poll_code(&self, _since: DateTime<Utc>) -> BoxFuture<'_, Result<Option<String>, Error>> {
        let code = self.0.map(str::to_owned);
        Box::pin(async move { Ok(code) })
    }
}

async fn setup() -> (MockServer, ArloClient) {
    let server = MockServer::start().await;
    let base = Url::parse(&server.uri()).unwrap();
    let client = ArloClient::with_client(reqwest::Client::new(), base.clone(), base, 60);
    (server, client)
}

fn password() -> SecretString {
    "hunter2".to_string().into()
}

async fn mount_session(server: &MockServer, token: &str) {
    Mock::given(method("GET"))
        .and(path("/hmsweb/users/session/v2"))
        .and(header("authorization", token))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "success": true, "data": { "userId": "U1" } })),
        )
        .mount(server)
        .await;
}

/// Mount a single-factor login and perform it.
async fn logged_in(server: &MockServer, client: &ArloClient) {
    Mock::given(method("POST"))
        .and(path("/api/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "meta": { "code": 200 },
            "data": { "token": "tok", "userId": "U1", "authCompleted": true }
        })))
        .mount(server)
        .await;
    mount_session(server, "tok").await;

    client
        .login("a@example.com", &password(), &TwoFactorSettings::default(), &ScriptedCode(None))
        .await
        .unwrap();
}

// ── Authentication ──────────────────────────────────────────────────

#[tokio::test]
async fn test_login_without_second_factor() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/auth"))
        .and(body_partial_json(json!({
            "email": "a@example.com",
            "password": "aHVudGVyMg==",
            "EnvSource": "prod"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "meta": { "code": 200 },
            "data": {
                "token": "tok",
                "userId": "U1",
                "authCompleted": true,
                "expiresIn": 4_102_444_800_i64
            }
        })))
        .expect(1)
        .mount(&server)
        .await;
    mount_session(&server, "tok").await;

    let session = client
        .login("a@example.com", &password(), &TwoFactorSettings::default(), &ScriptedCode(None))
        .await
        .unwrap();

    assert_eq!(session.user_id, "U1");
    assert_eq!(session.web_id, "U1_web");
    assert!(!session.is_expired());
    assert!(client.session().is_some());
}

#[tokio::test]
async fn test_login_with_email_factor() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "meta": { "code": 200 },
            "data": {
                "token": "pre",
                "userId": "U1",
                "issued": 1_700_000_000,
                "authCompleted": false
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/api/getFactors"))
        .and(query_param("data", "1700000000"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "meta": { "code": 200 },
            "data": { "items": [
                { "factorId": "F-SMS", "factorType": "SMS" },
                { "factorId": "F-MAIL", "factorType": "EMAIL", "displayName": "a***@example.com" }
            ] }
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/startAuth"))
        .and(body_partial_json(json!({ "factorId": "F-MAIL", "userId": "U1" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "meta": { "code": 200 },
            "data": { "factorAuthCode": "FAC" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path("/api/finishAuth"))
        .and(body_partial_json(json!({ "factorAuthCode": "FAC", "otp": "482913" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "meta": { "code": 200 },
            "data": { "token": "final" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    mount_session(&server, "final").await;

    let session = client
        .login(
            "a@example.com",
            &password(),
            &TwoFactorSettings::default(),
            &ScriptedCode(Some("482913")),
        )
        .await
        .unwrap();

    assert_eq!(session.token_header(), "final");
}

#[tokio::test]
async fn test_login_bad_credentials() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/auth"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "meta": { "code": 401, "message": "Invalid credentials" }
        })))
        .mount(&server)
        .await;

    let result = client
        .login("a@example.com", &password(), &TwoFactorSettings::default(), &ScriptedCode(None))
        .await;

    assert!(
        matches!(result, Err(Error::Authentication { ref message }) if message == "Invalid credentials"),
        "expected Authentication error, got: {result:?}"
    );
    assert!(client.session().is_none());
}

#[tokio::test]
async fn test_login_second_factor_timeout() {
    let (server, client) = setup().await;

    Mock::given(method("POST"))
        .and(path("/api/auth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "meta": { "code": 200 },
            "data": { "token": "pre", "userId": "U1", "issued": 1, "authCompleted": false }
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/getFactors"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "meta": { "code": 200 },
            "data": { "items": [{ "factorId": "F1", "factorType": "EMAIL" }] }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/startAuth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "meta": { "code": 200 },
            "data": { "factorAuthCode": "FAC" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/finishAuth"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let settings = TwoFactorSettings {
        retry_interval: Duration::from_millis(20),
        total_timeout: Duration::from_millis(150),
        ..TwoFactorSettings::default()
    };

    let result = client
        .login("a@example.com", &password(), &settings, &ScriptedCode(None))
        .await;

    assert!(
        matches!(result, Err(Error::TwoFactorTimeout { .. })),
        "expected TwoFactorTimeout, got: {result:?}"
    );
    assert!(result.unwrap_err().is_fatal_at_startup());
}

#[tokio::test]
async fn test_logout_is_idempotent() {
    let (server, client) = setup().await;
    logged_in(&server, &client).await;

    Mock::given(method("PUT"))
        .and(path("/hmsweb/logout"))
        .and(header("authorization", "tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .expect(1)
        .mount(&server)
        .await;

    client.logout().await.unwrap();
    client.logout().await.unwrap();
    assert!(client.session().is_none());
}

// ── Requests ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_get_requires_session() {
    let (_server, client) = setup().await;
    let result = client.get("/hmsweb/users/devices").await;
    assert!(matches!(result, Err(Error::NotAuthenticated)));
}

#[tokio::test]
async fn test_devices_lists_account_devices() {
    let (server, client) = setup().await;
    logged_in(&server, &client).await;

    Mock::given(method("GET"))
        .and(path("/hmsweb/users/devices"))
        .and(header("authorization", "tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": [
                { "deviceId": "BASE1", "deviceType": "basestation", "modelId": "VMB4000",
                  "state": "provisioned", "xCloudId": "XC-B" },
                { "deviceId": "CAM1", "deviceType": "camera", "modelId": "VMC4030",
                  "state": "provisioned", "parentId": "BASE1", "deviceName": "Porch" }
            ]
        })))
        .mount(&server)
        .await;

    let devices = client.devices().await.unwrap();

    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].xcloud_id.as_deref(), Some("XC-B"));
    assert_eq!(devices[1].device_name, "Porch");
    assert_eq!(devices[1].parent_id.as_deref(), Some("BASE1"));
}

#[tokio::test]
async fn test_get_unauthorized_is_session_expired() {
    let (server, client) = setup().await;
    logged_in(&server, &client).await;

    Mock::given(method("GET"))
        .and(path("/hmsweb/users/library"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let result = client.get("/hmsweb/users/library").await;
    let err = result.unwrap_err();
    assert!(matches!(err, Error::SessionExpired));
    assert!(err.is_auth_expired());
}

#[tokio::test]
async fn test_get_envelope_failure_is_api_error() {
    let (server, client) = setup().await;
    logged_in(&server, &client).await;

    Mock::given(method("GET"))
        .and(path("/hmsweb/users/automation"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": false,
            "data": { "reason": "Device offline" }
        })))
        .mount(&server)
        .await;

    let result = client.get("/hmsweb/users/automation").await;
    assert!(
        matches!(result, Err(Error::Api { ref message, .. }) if message == "Device offline"),
        "got: {result:?}"
    );
}

#[tokio::test]
async fn test_get_times_out() {
    let server = MockServer::start().await;
    let base = Url::parse(&server.uri()).unwrap();
    let client = ArloClient::new(&ClientConfig {
        host: base.clone(),
        auth_host: base,
        transport: TransportConfig {
            timeout: Duration::from_secs(1),
            ..TransportConfig::default()
        },
    })
    .unwrap();
    logged_in(&server, &client).await;

    Mock::given(method("GET"))
        .and(path("/hmsweb/users/devices"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "success": true, "data": [] }))
                .set_delay(Duration::from_secs(3)),
        )
        .mount(&server)
        .await;

    let result = client.devices().await;
    assert!(
        matches!(result, Err(Error::RequestTimeout { timeout_secs: 1 })),
        "expected RequestTimeout, got: {result:?}"
    );
}

#[tokio::test]
async fn test_notify_stamps_routing_fields() {
    let (server, client) = setup().await;
    logged_in(&server, &client).await;

    Mock::given(method("POST"))
        .and(path("/hmsweb/users/devices/notify/BASE1"))
        .and(header("xcloudId", "XC-B"))
        .and(header("authorization", "tok"))
        .and(body_partial_json(json!({
            "action": "get",
            "resource": "modes",
            "to": "BASE1",
            "from": "U1_web"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "success": true })))
        .expect(1)
        .mount(&server)
        .await;

    let trans_id = client
        .notify(
            NotifyTarget {
                device_id: "BASE1",
                xcloud_id: "XC-B",
            },
            json!({ "action": "get", "resource": "modes", "publishResponse": false }),
        )
        .await
        .unwrap();

    assert!(trans_id.starts_with("web!"));
}
