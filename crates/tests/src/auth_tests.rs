use crate::fixtures::test_app::{TestApp, TEST_APP_SECRET};
use callscribe_platform::auth::encode_auth;
use serde_json::Value;

#[tokio::test]
async fn heartbeat_needs_no_auth() {
    let app = TestApp::spawn().await;

    let resp = app.client.get(app.url("/heartbeat")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn missing_headers_are_rejected() {
    let app = TestApp::spawn().await;

    let resp = app.client.get(app.url("/enabled")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["error"], "missing authentication headers");
}

#[tokio::test]
async fn wrong_app_id_is_rejected() {
    let app = TestApp::spawn().await;

    let resp = app
        .client
        .get(app.url("/enabled"))
        .header("EX-APP-ID", "imposter")
        .header("AUTHORIZATION-APP-API", encode_auth("admin", TEST_APP_SECRET))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
}

#[tokio::test]
async fn wrong_secret_is_rejected() {
    let app = TestApp::spawn().await;

    let resp = app
        .client
        .get(app.url("/enabled"))
        .header("EX-APP-ID", "callscribe")
        .header("AUTHORIZATION-APP-API", encode_auth("admin", "wrong"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
}

#[tokio::test]
async fn valid_auth_passes() {
    let app = TestApp::spawn().await;

    let resp = app.auth_get("/enabled").send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}
