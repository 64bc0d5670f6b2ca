//! Integration tests for the incoming-webhook endpoint.
//!
//! Each test spins up the real router on a random port and talks to it with
//! reqwest, exercising the public HTTP contract.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::net::TcpListener;

use autoflow::auth::{DbKeyValidator, KeyValidator};
use autoflow::automation::AutomationEngine;
use autoflow::sequences::DbSequenceService;
use autoflow::store::{Database, LibSqlBackend};
use autoflow::webhooks::model::{WebhookAction, WebhookConfig};
use autoflow::webhooks::{AppState, IngestDeps, WebhookIngestor, router};

const API_KEY: &str = "test-key";

/// Start the router on a random port, return (base url, store).
async fn start_server() -> (String, Arc<dyn Database>) {
    let store: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    store.create_api_key(API_KEY, "acct").await.unwrap();

    let engine = Arc::new(AutomationEngine::new(Arc::clone(&store)));
    let keys: Arc<dyn KeyValidator> = Arc::new(DbKeyValidator::new(Arc::clone(&store)));
    let ingestor = Arc::new(WebhookIngestor::new(IngestDeps {
        store: Arc::clone(&store),
        keys: Arc::clone(&keys),
        sequences: Arc::new(DbSequenceService::new(Arc::clone(&store))),
        engine: Arc::clone(&engine),
    }));
    let app = router(AppState {
        store: Arc::clone(&store),
        engine,
        ingestor,
        keys,
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), store)
}

async fn create_webhook(store: &Arc<dyn Database>) -> WebhookConfig {
    let webhook = WebhookConfig::new("acct", "typeform")
        .with_mapping("phone", "$.form.phone")
        .with_mapping("name", "$.form.name")
        .with_mapping("cidade", "$.form.city")
        .with_action(WebhookAction::CreateContact)
        .with_action(WebhookAction::AddTag { tag: "formulario".into() });
    store.create_webhook(&webhook).await.unwrap();
    webhook
}

#[tokio::test]
async fn missing_phone_saves_payload_and_soft_fails() {
    let (base, store) = start_server().await;
    let webhook = create_webhook(&store).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/webhooks/incoming/{}", webhook.id))
        .header("x-api-key", API_KEY)
        .json(&json!({ "form": { "name": "Ana" } }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["payload_saved"], true);
    assert!(body["processingTime"].as_str().unwrap().ends_with("ms"));

    let stored = store.get_webhook(webhook.id, "acct").await.unwrap().unwrap();
    assert_eq!(stored.total_received, 1);
    assert_eq!(stored.last_payload, Some(json!({ "form": { "name": "Ana" } })));
}

#[tokio::test]
async fn creates_contact_over_http() {
    let (base, store) = start_server().await;
    let webhook = create_webhook(&store).await;

    let response = reqwest::Client::new()
        .post(format!("{base}/webhooks/incoming/{}", webhook.id))
        .bearer_auth(API_KEY)
        .json(&json!({
            "form": { "phone": "+55 11 98888-7777", "name": "Bruno", "city": "Recife" }
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["contact"]["phone"], "5511988887777");
    assert_eq!(body["contact"]["metadata"]["cidade"], "Recife");
    assert_eq!(body["actionsExecuted"], json!(["create_contact", "add_tag"]));

    let contact = store
        .find_contact_by_phone("acct", "5511988887777")
        .await
        .unwrap()
        .unwrap();
    let tags = store.list_contact_tags(contact.id).await.unwrap();
    assert_eq!(tags[0].name, "formulario");
}

#[tokio::test]
async fn rejections_map_to_status_codes() {
    let (base, store) = start_server().await;
    let webhook = create_webhook(&store).await;
    let client = reqwest::Client::new();
    let url = format!("{base}/webhooks/incoming/{}", webhook.id);

    let unauthorized = client.post(&url).json(&json!({})).send().await.unwrap();
    assert_eq!(unauthorized.status(), 401);

    let bad_json = client
        .post(&url)
        .header("x-api-key", API_KEY)
        .header("content-type", "application/json")
        .body("{oops")
        .send()
        .await
        .unwrap();
    assert_eq!(bad_json.status(), 400);

    let unknown = client
        .post(format!("{base}/webhooks/incoming/{}", uuid::Uuid::new_v4()))
        .header("x-api-key", API_KEY)
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(unknown.status(), 404);

    let stored = store.get_webhook(webhook.id, "acct").await.unwrap().unwrap();
    assert_eq!(stored.total_received, 0);
}
