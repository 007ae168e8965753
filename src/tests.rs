//! Integration tests for the relay HTTP API.

use std::collections::HashMap;
use std::sync::Arc;

use reqwest::Client;
use serde_json::{json, Value};
use tempfile::TempDir;

use crate::config::{Config, DispatchConfig};
use crate::db::{init_database, Repository};
use crate::models::Notification;
use crate::{create_router, AppState};

/// Test fixture for integration tests.
struct TestFixture {
    client: Client,
    base_url: String,
    repo: Arc<Repository>,
    _temp_dir: TempDir,
}

impl TestFixture {
    async fn new() -> Self {
        Self::with_psk(Some("test-api-key".to_string())).await
    }

    async fn with_psk(psk: Option<String>) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("test.sqlite");

        // Initialize database
        let pool = init_database(&db_path).await.expect("Failed to init DB");
        let repo = Arc::new(Repository::new(pool));

        let config = Config {
            db_path,
            input_dir: temp_dir.path().join("input"),
            error_dir: temp_dir.path().join("error"),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            api_psk: psk.clone(),
            push_gateway: None,
            dispatch: DispatchConfig::default(),
            log_level: "warn".to_string(),
            log_json: false,
        };

        let state = AppState {
            repo: repo.clone(),
            config: Arc::new(config),
        };

        let app = create_router(state);

        // Bind to random port
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind");
        let addr = listener.local_addr().expect("Failed to get addr");
        let base_url = format!("http://{}", addr);

        // Spawn server
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Wait for server to start
        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;

        let mut client_builder = Client::builder();
        if let Some(key) = psk {
            let mut headers = reqwest::header::HeaderMap::new();
            headers.insert("x-api-key", key.parse().unwrap());
            client_builder = client_builder.default_headers(headers);
        }

        TestFixture {
            client: client_builder.build().unwrap(),
            base_url,
            repo,
            _temp_dir: temp_dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn store(&self, topic: &str, message: &str) -> i64 {
        let notif = Notification {
            topic: topic.to_string(),
            metadata: HashMap::from([("source".to_string(), "test".to_string())]),
            message: message.to_string(),
        };
        self.repo.insert_notification(&notif).await.unwrap()
    }
}

#[tokio::test]
async fn test_health_check() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .get(fixture.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "OK");
}

#[tokio::test]
async fn test_health_check_needs_no_key() {
    let fixture = TestFixture::new().await;

    let resp = Client::new()
        .get(fixture.url("/health"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_auth_missing_psk() {
    let fixture = TestFixture::new().await;

    // Request without API key
    let resp = Client::new()
        .get(fixture.url("/api/topics"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn test_auth_invalid_psk() {
    let fixture = TestFixture::new().await;

    let resp = Client::new()
        .get(fixture.url("/api/topics"))
        .header("x-api-key", "wrong-key")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn test_auth_bearer_token() {
    let fixture = TestFixture::new().await;

    let resp = Client::new()
        .get(fixture.url("/api/topics"))
        .header("authorization", "Bearer test-api-key")
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_auth_disabled_without_psk() {
    let fixture = TestFixture::with_psk(None).await;

    let resp = fixture
        .client
        .get(fixture.url("/api/topics"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
}

#[tokio::test]
async fn test_register_device() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .post(fixture.url("/api/devices"))
        .json(&json!({ "deviceId": "phone-1", "publicKey": "pk-1" }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["deviceId"], "phone-1");
    assert_eq!(body["data"]["publicKey"], "pk-1");
    assert_eq!(body["data"]["consecutiveFailures"], 0);

    let resp = fixture
        .client
        .get(fixture.url("/api/devices/phone-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["data"]["publicKey"], "pk-1");
}

#[tokio::test]
async fn test_register_device_assigns_id() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .post(fixture.url("/api/devices"))
        .json(&json!({ "publicKey": "pk-anon" }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let id = body["data"]["deviceId"].as_str().unwrap();
    assert!(uuid::Uuid::parse_str(id).is_ok());
}

#[tokio::test]
async fn test_register_device_duplicate() {
    let fixture = TestFixture::new().await;
    let device = json!({ "deviceId": "phone-1", "publicKey": "pk-1" });

    let resp = fixture
        .client
        .post(fixture.url("/api/devices"))
        .json(&device)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = fixture
        .client
        .post(fixture.url("/api/devices"))
        .json(&device)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "CONFLICT");
}

#[tokio::test]
async fn test_register_device_empty_key() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .post(fixture.url("/api/devices"))
        .json(&json!({ "deviceId": "phone-1", "publicKey": "  " }))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_delete_device() {
    let fixture = TestFixture::new().await;
    fixture.repo.register_device("phone-1", "pk-1").await.unwrap();

    let resp = fixture
        .client
        .delete(fixture.url("/api/devices/phone-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert!(fixture.repo.get_device("phone-1").await.unwrap().is_none());

    // Second delete finds nothing
    let resp = fixture
        .client
        .delete(fixture.url("/api/devices/phone-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_list_topics() {
    let fixture = TestFixture::new().await;
    fixture.store("backup", "nightly done").await;
    fixture.store("backup", "weekly done").await;
    fixture.store("deploy", "v2 rolled out").await;

    let resp = fixture
        .client
        .get(fixture.url("/api/topics"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let topics = body["data"].as_array().unwrap();
    assert_eq!(topics.len(), 2);
    let names: Vec<&str> = topics
        .iter()
        .map(|t| t["topicName"].as_str().unwrap())
        .collect();
    assert!(names.contains(&"backup"));
    assert!(names.contains(&"deploy"));
}

#[tokio::test]
async fn test_list_notifications_after() {
    let fixture = TestFixture::new().await;
    let first = fixture.store("backup", "one").await;
    fixture.store("backup", "two").await;
    fixture.store("deploy", "three").await;

    let resp = fixture
        .client
        .get(fixture.url("/api/notifications"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    let all = body["data"].as_array().unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0]["message"], "one");
    assert_eq!(all[0]["topicName"], "backup");
    assert_eq!(all[0]["status"], "INPUT");
    assert_eq!(all[0]["metadata"]["source"], "test");

    let resp = fixture
        .client
        .get(fixture.url(&format!("/api/notifications?after={}&limit=1", first)))
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    let page = body["data"].as_array().unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["message"], "two");
}

#[tokio::test]
async fn test_list_notifications_bad_limit() {
    let fixture = TestFixture::new().await;

    let resp = fixture
        .client
        .get(fixture.url("/api/notifications?limit=0"))
        .send()
        .await
        .unwrap();

    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "BAD_REQUEST");
}
