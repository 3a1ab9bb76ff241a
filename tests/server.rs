//! HTTP API tests against a live listener on an ephemeral port.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;

use pagewise::app::Services;
use pagewise::config::{Config, RateLimit};
use pagewise::embedding::HashEmbedder;
use pagewise::models::{ProviderCredential, ProviderId};
use pagewise::prompt::Message;
use pagewise::providers::{AiProvider, ProviderError, ProviderFactory};
use pagewise::server::{serve_with_listener, USER_HEADER};
use pagewise::settings::LiveSettings;
use pagewise::store::memory::InMemoryStore;
use pagewise::store::SecretStore;

struct EchoProvider {
    id: ProviderId,
}

#[async_trait]
impl AiProvider for EchoProvider {
    fn id(&self) -> ProviderId {
        self.id
    }
    fn chat_model(&self) -> &str {
        "echo"
    }
    fn embedding_model(&self) -> Option<&str> {
        None
    }
    async fn generate(&self, messages: &[Message]) -> Result<String, ProviderError> {
        Ok(format!("You asked: {}", messages[2].content))
    }
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, ProviderError> {
        Err(ProviderError::Unsupported {
            provider: self.id,
            capability: "embeddings",
        })
    }
    async fn validate(&self) -> Result<(), ProviderError> {
        Ok(())
    }
}

struct EchoFactory;

impl ProviderFactory for EchoFactory {
    fn create(&self, provider: ProviderId, _secret: &str) -> Result<Arc<dyn AiProvider>, ProviderError> {
        Ok(Arc::new(EchoProvider { id: provider }))
    }
}

struct TestServer {
    base: String,
    client: reqwest::Client,
    store: Arc<InMemoryStore>,
}

impl TestServer {
    async fn start(config: Config) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let services = Services::new(
            Arc::new(LiveSettings::fixed(config)),
            store.clone(),
            store.clone(),
            Arc::new(EchoFactory),
            Arc::new(HashEmbedder::new(32)),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_with_listener(listener, services));
        Self {
            base: format!("http://{}", addr),
            client: reqwest::Client::new(),
            store,
        }
    }

    async fn ask(&self, user: &str, body: Value) -> reqwest::Response {
        self.client
            .post(format!("{}/v1/ask", self.base))
            .header(USER_HEADER, user)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn get(&self, user: &str, path: &str) -> reqwest::Response {
        self.client
            .get(format!("{}{}", self.base, path))
            .header(USER_HEADER, user)
            .send()
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_health() {
    let server = TestServer::start(Config::default()).await;
    let resp = server.client.get(format!("{}/health", server.base)).send().await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["version"].is_string());
}

#[tokio::test]
async fn test_missing_principal_is_unauthorized() {
    let server = TestServer::start(Config::default()).await;
    let resp = server
        .client
        .post(format!("{}/v1/ask", server.base))
        .json(&json!({"query": "hi"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn test_overlong_query_is_bad_request() {
    let server = TestServer::start(Config::default()).await;
    let resp = server
        .ask("alice", json!({"query": "x".repeat(10_001)}))
        .await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "bad_request");
    assert!(body["error"]["ask_request_id"].is_null());
}

#[tokio::test]
async fn test_malformed_body_is_bad_request() {
    let server = TestServer::start(Config::default()).await;
    let resp = server.ask("alice", json!({"question": "wrong field"})).await;
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_empty_question_reports_code_and_request_id() {
    let server = TestServer::start(Config::default()).await;
    let resp = server.ask("alice", json!({"query": "  "})).await;
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "empty_question");
    assert_eq!(body["error"]["message"], "Please enter a question.");
    assert!(body["error"]["ask_request_id"].is_string());
}

#[tokio::test]
async fn test_rate_limit_sets_retry_after() {
    let mut config = Config::default();
    config.throttle.ask = RateLimit {
        rate: 1,
        window_secs: 120,
    };
    let server = TestServer::start(config).await;

    // No key configured: the first question is recorded and fails upstream.
    let first = server.ask("alice", json!({"query": "one"})).await;
    assert_eq!(first.status(), 502);
    let body: Value = first.json().await.unwrap();
    assert_eq!(body["error"]["code"], "api_error");
    assert_eq!(body["error"]["message"], "No AI provider configured");

    let second = server.ask("alice", json!({"query": "two"})).await;
    assert_eq!(second.status(), 429);
    let retry: u64 = second.headers()["retry-after"]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=120).contains(&retry));

    let history: Value = server.get("alice", "/v1/ask").await.json().await.unwrap();
    assert_eq!(history["requests"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_import_then_ask_with_explicit_pages() {
    let server = TestServer::start(Config::default()).await;
    server
        .store
        .put_credential(&ProviderCredential::new("alice", ProviderId::OpenAi, "sk"))
        .await
        .unwrap();

    let resp = server
        .client
        .post(format!("{}/v1/imports", server.base))
        .header(USER_HEADER, "alice")
        .json(&json!({"pages": [{"title": "Refund policy", "body": "30 days."}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let imported: Value = resp.json().await.unwrap();
    let external_id = imported["pages"][0]["external_id"].as_str().unwrap().to_string();

    let resp = server
        .ask(
            "alice",
            json!({"query": "What is our refund policy?", "page_ids": [external_id]}),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["answer"], "You asked: What is our refund policy?");
    assert_eq!(body["pages"][0]["title"], "Refund policy");
    assert_eq!(body["pages"][0]["external_id"], external_id.as_str());

    let id = body["id"].as_str().unwrap();
    let fetched: Value = server
        .get("alice", &format!("/v1/ask/{}", id))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["status"], "ok");
    assert_eq!(fetched["pages"][0]["external_id"], external_id.as_str());
}

#[tokio::test]
async fn test_import_rejects_blank_title() {
    let server = TestServer::start(Config::default()).await;
    let resp = server
        .client
        .post(format!("{}/v1/imports", server.base))
        .header(USER_HEADER, "alice")
        .json(&json!({"pages": [{"title": " ", "body": "x"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn test_ask_request_is_owner_scoped() {
    let server = TestServer::start(Config::default()).await;
    let resp = server.ask("alice", json!({"query": "mine"})).await;
    let body: Value = resp.json().await.unwrap();
    let id = body["error"]["ask_request_id"].as_str().unwrap().to_string();

    let own = server.get("alice", &format!("/v1/ask/{}", id)).await;
    assert_eq!(own.status(), 200);
    let own: Value = own.json().await.unwrap();
    assert_eq!(own["status"], "failed");
    assert_eq!(own["error"], "api_error");

    let other = server.get("bob", &format!("/v1/ask/{}", id)).await;
    assert_eq!(other.status(), 404);
    let history: Value = server.get("bob", "/v1/ask").await.json().await.unwrap();
    assert!(history["requests"].as_array().unwrap().is_empty());
}
