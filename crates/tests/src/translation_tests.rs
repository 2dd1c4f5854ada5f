use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::fixtures::test_app::TestApp;

fn platform_with_translation_provider() -> Router {
    Router::new().route(
        "/ocs/v2.php/taskprocessing/tasks_consumer/tasktypes",
        get(|| async {
            Json(json!({
                "ocs": {
                    "data": {
                        "types": {
                            "core:text2text:translate": {
                                "inputShapeEnumValues": {
                                    "origin_language": [
                                        { "name": "English", "value": "en" },
                                        { "name": "German", "value": "de" }
                                    ],
                                    "target_language": [
                                        { "name": "German", "value": "de" },
                                        { "name": "French", "value": "fr" }
                                    ]
                                }
                            }
                        }
                    }
                }
            }))
        }),
    )
}

#[tokio::test]
async fn languages_come_from_the_provider() {
    let app = TestApp::spawn_with_platform(platform_with_translation_provider()).await;

    let resp = app
        .auth_get("/api/v1/translation/languages?roomToken=R1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["target_languages"]["de"]["name"], "German");
    assert!(body["origin_languages"]["en"].is_object());
}

#[tokio::test]
async fn languages_without_a_provider_are_empty() {
    let app = TestApp::spawn().await;

    let resp = app
        .auth_get("/api/v1/translation/languages?roomToken=R1")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["origin_languages"], json!({}));
    assert_eq!(body["target_languages"], json!({}));
}

#[tokio::test]
async fn capabilities_advertise_translation_when_provider_exists() {
    let app = TestApp::spawn_with_platform(platform_with_translation_provider()).await;

    let resp = app.auth_get("/capabilities").send().await.unwrap();
    let body: Value = resp.json().await.unwrap();
    let features = body["callscribe"]["features"].as_array().unwrap();
    assert!(features.contains(&Value::String("live_translation".into())));
}

#[tokio::test]
async fn set_target_language_without_a_room_is_a_no_op() {
    let app = TestApp::spawn().await;

    let resp = app
        .auth_post("/api/v1/translation/set-target-language")
        .json(&json!({ "roomToken": "R1", "platformSid": "P2", "langId": "de" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
}
