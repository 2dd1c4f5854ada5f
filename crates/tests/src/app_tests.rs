use crate::fixtures::test_app::TestApp;
use serde_json::Value;

#[tokio::test]
async fn enabled_round_trip() {
    let app = TestApp::spawn().await;

    let resp = app.auth_get("/enabled").send().await.unwrap();
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["enabled"], false);

    let resp = app.auth_put("/enabled?enabled=1").send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);

    let resp = app.auth_get("/enabled").send().await.unwrap();
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["enabled"], true);

    let resp = app.auth_put("/enabled?enabled=0").send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let resp = app.auth_get("/enabled").send().await.unwrap();
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["enabled"], false);
}

#[tokio::test]
async fn languages_lists_the_supported_table() {
    let app = TestApp::spawn().await;

    let resp = app.auth_get("/api/v1/languages").send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let json: Value = resp.json().await.unwrap();
    assert_eq!(json["en"]["name"], "English");
    assert_eq!(json["de"]["metadata"]["separator"], " ");
    assert!(json.get("tlh").is_none());
}

#[tokio::test]
async fn capabilities_always_advertise_transcription() {
    let app = TestApp::spawn().await;

    let resp = app.auth_get("/capabilities").send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let json: Value = resp.json().await.unwrap();
    let caps = &json["callscribe"];
    assert_eq!(caps["version"], "1.0.0");
    assert!(caps["live_transcription"]["supported_languages"]["en"].is_object());
    // The stub platform has no translation provider.
    let features = caps["features"].as_array().unwrap();
    assert!(features.contains(&Value::String("live_transcription".into())));
    assert!(!features.contains(&Value::String("live_translation".into())));
}
