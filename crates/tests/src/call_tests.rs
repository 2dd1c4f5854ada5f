use crate::fixtures::test_app::TestApp;
use serde_json::{json, Value};

#[tokio::test]
async fn disable_without_a_room_is_a_no_op() {
    let app = TestApp::spawn().await;

    let resp = app
        .auth_post("/api/v1/call/transcribe")
        .json(&json!({
            "roomToken": "R2",
            "platformSid": "P9",
            "langId": "en",
            "enable": false,
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "Transcription request processed successfully.");
}

#[tokio::test]
async fn enable_without_hpb_settings_is_unavailable() {
    // The stub platform serves no signaling settings, so room creation fails
    // with a service-unavailable error instead of hanging.
    let app = TestApp::spawn().await;

    let resp = app
        .auth_post("/api/v1/call/transcribe")
        .json(&json!({
            "roomToken": "R1",
            "platformSid": "P1",
            "langId": "en",
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status().as_u16(), 503);
}

#[tokio::test]
async fn set_language_rejects_unknown_languages() {
    let app = TestApp::spawn().await;

    for lang in ["", "tlh"] {
        let resp = app
            .auth_post("/api/v1/call/set-language")
            .json(&json!({ "roomToken": "R1", "langId": lang }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["error"], "Invalid or unsupported language ID provided.");
    }
}

#[tokio::test]
async fn set_language_without_a_room_succeeds() {
    let app = TestApp::spawn().await;

    let resp = app
        .auth_post("/api/v1/call/set-language")
        .json(&json!({ "roomToken": "R1", "langId": "de" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}

#[tokio::test]
async fn leave_without_a_room_succeeds() {
    let app = TestApp::spawn().await;

    let resp = app
        .auth_post("/api/v1/call/leave")
        .json(&json!({ "roomToken": "R404" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "Leave call request processed.");
}
