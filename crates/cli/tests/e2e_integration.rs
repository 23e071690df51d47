//! End-to-end flow through the HTTP gateway: a multi-turn conversation
//! against a scripted engine, exercising chat streaming, persistence, and
//! conversation management together.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceExt;

use chatspan_config::AppConfig;
use chatspan_core::engine::{GenerationEngine, GenerationRequest, TokenCounter};
use chatspan_core::error::EngineError;
use chatspan_core::store::ConversationStore;
use chatspan_gateway::{build_router, GatewayState};
use chatspan_session::ChatController;
use chatspan_store::SqliteStore;

struct ScriptedEngine {
    fragments: Vec<String>,
}

#[async_trait]
impl TokenCounter for ScriptedEngine {
    async fn count_tokens(&self, text: &str) -> Result<usize, EngineError> {
        Ok(text.split_whitespace().count())
    }
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate(
        &self,
        _request: GenerationRequest,
    ) -> Result<mpsc::Receiver<Result<String, EngineError>>, EngineError> {
        let (tx, rx) = mpsc::channel(8);
        let fragments = self.fragments.clone();
        tokio::spawn(async move {
            for fragment in fragments {
                if tx.send(Ok(fragment)).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}

async fn test_app() -> axum::Router {
    let config = AppConfig::default();
    let store: Arc<dyn ConversationStore> = Arc::new(SqliteStore::new(":memory:").await.unwrap());
    let engine = Arc::new(ScriptedEngine {
        fragments: vec!["The ".into(), "answer".into()],
    });
    let controller = ChatController::new(
        engine,
        Arc::clone(&store),
        config.context,
        config.preamble.clone(),
        config.sampling.params,
        config.sampling.max_response_tokens,
    );
    build_router(Arc::new(GatewayState { controller, store }), &config)
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Parse `data:` payloads out of an SSE body.
fn sse_payloads(body: &str) -> Vec<serde_json::Value> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data: "))
        .map(|payload| serde_json::from_str(payload).unwrap())
        .collect()
}

fn chat_request(body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn multi_turn_conversation_round_trip() {
    let app = test_app().await;

    // First message: no conversation id, the server assigns one.
    let response = app
        .clone()
        .oneshot(chat_request(
            serde_json::json!({"message": "what is the answer?"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let events = sse_payloads(&body_string(response).await);
    let conversation_id = events[0]["conversation_id"].as_str().unwrap().to_string();
    assert_eq!(events[1]["token"], "The ");
    assert_eq!(events[2]["token"], "answer");
    let done = events.last().unwrap();
    assert_eq!(done["done"], true);
    assert_eq!(done["total_tokens"], 2);
    assert_eq!(done["conversation_id"], conversation_id.as_str());

    // The conversation is listed, titled after the first message.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/conversations")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listed: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["title"], "what is the answer?");

    // Follow-up in the same conversation: no conversation event this time.
    let response = app
        .clone()
        .oneshot(chat_request(serde_json::json!({
            "message": "and again?",
            "conversation_id": conversation_id,
        })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let events = sse_payloads(&body_string(response).await);
    assert!(events[0].get("token").is_some());

    // Both exchanges are in the log, in order.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/api/conversations/{conversation_id}/messages"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let messages: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    let messages = messages.as_array().unwrap();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[0]["role"], "user");
    assert_eq!(messages[0]["content"], "what is the answer?");
    assert_eq!(messages[1]["role"], "assistant");
    assert_eq!(messages[1]["content"], "The answer");
    assert_eq!(messages[2]["role"], "user");
    assert_eq!(messages[3]["role"], "assistant");

    // Delete and confirm it is gone.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api/conversations/{conversation_id}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/conversations")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listed: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn oversized_message_is_rejected_without_side_effects() {
    let config = AppConfig {
        context: chatspan_config::ContextWindowConfig {
            window_capacity: 20,
            history_budget_fraction: 0.75,
            reserved_margin: 10,
        },
        ..AppConfig::default()
    };
    let store: Arc<dyn ConversationStore> = Arc::new(SqliteStore::new(":memory:").await.unwrap());
    let engine = Arc::new(ScriptedEngine {
        fragments: vec!["x".into()],
    });
    let controller = ChatController::new(
        engine,
        Arc::clone(&store),
        config.context,
        config.preamble.clone(),
        config.sampling.params,
        config.sampling.max_response_tokens,
    );
    let app = build_router(
        Arc::new(GatewayState {
            controller,
            store: Arc::clone(&store),
        }),
        &config,
    );

    let long_message = "word ".repeat(50);
    let response = app
        .clone()
        .oneshot(chat_request(serde_json::json!({"message": long_message})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

    // Nothing was created.
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/conversations")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let listed: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 0);
}
