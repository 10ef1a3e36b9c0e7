//! Axum routes: agent card, JSON-RPC endpoint, SSE streaming endpoint.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::State,
    response::sse::{Event as SseEvent, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use haven_agent::{Orchestrator, TurnEvent, TurnInput};
use haven_core::config::HavenConfig;
use haven_storage::a2a_tasks::{self, A2aTaskState};
use haven_storage::Db;

use crate::protocol::*;

#[derive(Clone)]
pub struct A2aState {
    pub db: Db,
    pub orchestrator: Arc<Orchestrator>,
    pub config: HavenConfig,
    /// Cancellation tokens for turns still running, keyed by task id.
    running: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl A2aState {
    pub fn new(db: Db, orchestrator: Arc<Orchestrator>, config: HavenConfig) -> Self {
        Self {
            db,
            orchestrator,
            config,
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn register_cancellation(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.running
            .lock()
            .unwrap()
            .insert(task_id.to_string(), token.clone());
        token
    }

    fn finish_cancellation(&self, task_id: &str) {
        self.running.lock().unwrap().remove(task_id);
    }

    fn cancel_running(&self, task_id: &str) {
        if let Some(token) = self.running.lock().unwrap().get(task_id) {
            token.cancel();
        }
    }
}

pub fn router(state: A2aState) -> Router {
    Router::new()
        .route("/.well-known/agent.json", get(agent_card))
        .route("/.well-known/agent-card.json", get(agent_card))
        .route("/a2a", post(rpc_endpoint))
        .route("/a2a/stream", post(stream_endpoint))
        .with_state(state)
}

// ── Agent card ────────────────────────────────────────────────────────────────

async fn agent_card(State(state): State<A2aState>) -> Json<AgentCard> {
    let config = &state.config.a2a;
    let skills = state
        .config
        .profiles
        .iter()
        .map(|(id, profile)| AgentSkill {
            id: id.clone(),
            name: id.clone(),
            description: profile.description.clone(),
        })
        .collect();

    Json(AgentCard {
        name: config.agent_name.clone(),
        description: config.agent_description.clone(),
        url: config.agent_url.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        capabilities: AgentCapabilities {
            streaming: true,
            push_notifications: false,
            state_transition_history: true,
        },
        skills,
        default_input_modes: vec!["text/plain".to_string()],
        default_output_modes: vec!["text/plain".to_string()],
    })
}

// ── JSON-RPC endpoint ─────────────────────────────────────────────────────────

async fn rpc_endpoint(State(state): State<A2aState>, body: Bytes) -> Response {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(response) => return Json(response).into_response(),
    };

    let method = request.method.clone();
    match method.as_str() {
        "message/send" => Json(message_send(&state, request).await).into_response(),
        // Streaming over the plain endpoint serves the SSE response too.
        "message/stream" => message_stream(state, request).await.into_response(),
        "tasks/get" => Json(tasks_get(&state, request)).into_response(),
        "tasks/cancel" => Json(tasks_cancel(&state, request)).into_response(),
        other => Json(JsonRpcResponse::err(
            request.id,
            METHOD_NOT_FOUND,
            format!("method not found: {other}"),
        ))
        .into_response(),
    }
}

async fn stream_endpoint(State(state): State<A2aState>, body: Bytes) -> Response {
    let request = match parse_request(&body) {
        Ok(request) => request,
        Err(response) => return Json(response).into_response(),
    };
    let method = request.method.clone();
    match method.as_str() {
        "message/send" | "message/stream" => message_stream(state, request).await.into_response(),
        other => Json(JsonRpcResponse::err(
            request.id,
            METHOD_NOT_FOUND,
            format!("method not found: {other}"),
        ))
        .into_response(),
    }
}

fn parse_request(body: &Bytes) -> Result<JsonRpcRequest, JsonRpcResponse> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|e| JsonRpcResponse::err(Value::Null, PARSE_ERROR, format!("parse error: {e}")))?;
    let request: JsonRpcRequest = serde_json::from_value(value).map_err(|e| {
        JsonRpcResponse::err(Value::Null, INVALID_REQUEST, format!("invalid request: {e}"))
    })?;
    if request.jsonrpc != "2.0" {
        return Err(JsonRpcResponse::err(
            request.id,
            INVALID_REQUEST,
            "jsonrpc must be \"2.0\"",
        ));
    }
    Ok(request)
}

fn parse_message(request: &JsonRpcRequest) -> Result<Message, JsonRpcResponse> {
    serde_json::from_value(request.params.get("message").cloned().unwrap_or(Value::Null)).map_err(
        |e| {
            JsonRpcResponse::err(
                request.id.clone(),
                INVALID_PARAMS,
                format!("invalid params.message: {e}"),
            )
        },
    )
}

/// Create the task row and derive ids for one incoming message. The
/// requested skill (params.metadata.skillId) selects the processing
/// profile when it names a configured one.
fn start_task(
    state: &A2aState,
    message: &Message,
    params: &Value,
    request_id: &Value,
) -> Result<(String, String, String), JsonRpcResponse> {
    let task_id = Uuid::new_v4().to_string();
    let context_id = message
        .context_id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let conversation_id = format!("a2a:{context_id}");
    let requested_skill = params
        .get("metadata")
        .and_then(|m| m.get("skillId"))
        .and_then(Value::as_str);
    let profile_id = state
        .config
        .profiles
        .keys()
        .find(|key| Some(key.as_str()) == requested_skill)
        .cloned();

    a2a_tasks::create(
        &state.db,
        &task_id,
        profile_id.as_deref(),
        &conversation_id,
        &context_id,
    )
    .map_err(|e| {
        JsonRpcResponse::err(request_id.clone(), INTERNAL_ERROR, format!("storage: {e}"))
    })?;
    Ok((task_id, context_id, conversation_id))
}

fn turn_input(
    state: &A2aState,
    message: &Message,
    task_id: &str,
    conversation_id: &str,
    token: CancellationToken,
) -> TurnInput {
    let mut input = TurnInput::text("a2a", conversation_id, message.text());
    input.trigger_interface_message_id = Some(message.message_id.clone());
    input.user_name = "external agent".to_string();
    input.user_id = "a2a_peer".to_string();
    input.processing_profile_id = a2a_tasks::get(&state.db, task_id)
        .ok()
        .flatten()
        .and_then(|record| record.profile_id);
    input.cancellation = Some(token);
    input
}

async fn message_send(state: &A2aState, request: JsonRpcRequest) -> JsonRpcResponse {
    let message = match parse_message(&request) {
        Ok(message) => message,
        Err(response) => return response,
    };
    let (task_id, context_id, conversation_id) =
        match start_task(state, &message, &request.params, &request.id) {
            Ok(ids) => ids,
            Err(response) => return response,
        };

    info!(%task_id, %context_id, "a2a message/send");
    let _ = a2a_tasks::set_status(&state.db, &task_id, A2aTaskState::Working);
    let token = state.register_cancellation(&task_id);

    let result = state
        .orchestrator
        .handle_chat_interaction(turn_input(state, &message, &task_id, &conversation_id, token))
        .await;
    state.finish_cancellation(&task_id);

    match result {
        Ok(turn) => {
            let artifact = Artifact::text("response", &turn.text);
            let history = json!([
                serde_json::to_value(&message).unwrap_or(Value::Null),
                serde_json::to_value(Message::agent_text(&task_id, &context_id, &turn.text))
                    .unwrap_or(Value::Null),
            ]);
            let _ = a2a_tasks::finish(
                &state.db,
                &task_id,
                A2aTaskState::Completed,
                &json!([artifact]),
                &history,
            );
        }
        Err(haven_agent::AgentError::Cancelled) => {
            // tasks/cancel already flipped the row; nothing more to record.
        }
        Err(e) => {
            warn!(%task_id, error = %e, "a2a turn failed");
            let _ = a2a_tasks::finish(
                &state.db,
                &task_id,
                A2aTaskState::Failed,
                &json!([]),
                &json!([{"error": e.to_string()}]),
            );
        }
    }

    match a2a_tasks::get(&state.db, &task_id) {
        Ok(Some(record)) => JsonRpcResponse::ok(request.id, task_to_wire(&record)),
        _ => JsonRpcResponse::err(request.id, INTERNAL_ERROR, "task vanished"),
    }
}

fn tasks_get(state: &A2aState, request: JsonRpcRequest) -> JsonRpcResponse {
    let Some(task_id) = request.params.get("id").and_then(Value::as_str) else {
        return JsonRpcResponse::err(request.id, INVALID_PARAMS, "missing params.id");
    };
    match a2a_tasks::get(&state.db, task_id) {
        Ok(Some(record)) => JsonRpcResponse::ok(request.id, task_to_wire(&record)),
        Ok(None) => JsonRpcResponse::err(request.id, TASK_NOT_FOUND, "task not found"),
        Err(e) => JsonRpcResponse::err(request.id, INTERNAL_ERROR, format!("storage: {e}")),
    }
}

fn tasks_cancel(state: &A2aState, request: JsonRpcRequest) -> JsonRpcResponse {
    let Some(task_id) = request.params.get("id").and_then(Value::as_str) else {
        return JsonRpcResponse::err(request.id, INVALID_PARAMS, "missing params.id");
    };
    match a2a_tasks::cancel(&state.db, task_id) {
        Ok(None) => JsonRpcResponse::err(request.id, TASK_NOT_FOUND, "task not found"),
        Ok(Some(A2aTaskState::Canceled)) => {
            // Cancel the in-flight turn at its next suspension point.
            state.cancel_running(task_id);
            match a2a_tasks::get(&state.db, task_id) {
                Ok(Some(record)) => JsonRpcResponse::ok(request.id, task_to_wire(&record)),
                _ => JsonRpcResponse::err(request.id, INTERNAL_ERROR, "task vanished"),
            }
        }
        Ok(Some(state_now)) => JsonRpcResponse::err(
            request.id,
            TASK_NOT_CANCELABLE,
            format!("task is {state_now} and cannot be canceled"),
        ),
        Err(e) => JsonRpcResponse::err(request.id, INTERNAL_ERROR, format!("storage: {e}")),
    }
}

// ── Streaming ─────────────────────────────────────────────────────────────────

async fn message_stream(
    state: A2aState,
    request: JsonRpcRequest,
) -> Sse<impl futures_util::Stream<Item = Result<SseEvent, Infallible>>> {
    let request_id = request.id.clone();
    let setup = parse_message(&request).and_then(|message| {
        start_task(&state, &message, &request.params, &request.id).map(|ids| (message, ids))
    });

    let stream = async_stream::stream! {
        let (message, (task_id, context_id, conversation_id)) = match setup {
            Ok(setup) => setup,
            Err(response) => {
                // Protocol errors arrive as a single final status event
                // wrapping the error envelope.
                yield Ok(SseEvent::default()
                    .event("status")
                    .data(serde_json::to_string(&response).unwrap_or_default()));
                return;
            }
        };

        info!(%task_id, %context_id, "a2a message/stream");
        let _ = a2a_tasks::set_status(&state.db, &task_id, A2aTaskState::Working);
        let token = state.register_cancellation(&task_id);

        yield Ok(envelope_event(
            "status",
            &request_id,
            status_update(&task_id, &context_id, A2aTaskState::Working, false),
        ));

        let (events_tx, mut events_rx) = tokio::sync::mpsc::channel::<TurnEvent>(32);
        let orchestrator = state.orchestrator.clone();
        let input = turn_input(&state, &message, &task_id, &conversation_id, token);
        let turn = tokio::spawn(async move {
            orchestrator.handle_chat_interaction_stream(input, events_tx).await
        });

        let artifact_id = Uuid::new_v4().to_string();
        let mut full_text = String::new();
        let mut failed: Option<String> = None;

        while let Some(event) = events_rx.recv().await {
            match event {
                TurnEvent::Content(chunk) => {
                    let append = !full_text.is_empty();
                    full_text.push_str(&chunk);
                    let artifact = Artifact {
                        artifact_id: artifact_id.clone(),
                        name: Some("response".to_string()),
                        parts: vec![Part::Text { text: chunk }],
                    };
                    yield Ok(envelope_event(
                        "artifact",
                        &request_id,
                        artifact_update(&task_id, &context_id, &artifact, append, false),
                    ));
                }
                TurnEvent::ToolCall { id, name } => {
                    let artifact = Artifact {
                        artifact_id: Uuid::new_v4().to_string(),
                        name: Some("tool-call".to_string()),
                        parts: vec![Part::Data { data: json!({"id": id, "name": name}) }],
                    };
                    yield Ok(envelope_event(
                        "artifact",
                        &request_id,
                        artifact_update(&task_id, &context_id, &artifact, false, true),
                    ));
                }
                TurnEvent::Error(message) => failed = Some(message),
                TurnEvent::Done => break,
            }
        }
        let turn_result = turn.await;
        state.finish_cancellation(&task_id);

        let final_state = match (&failed, &turn_result) {
            (Some(_), _) | (_, Err(_)) => A2aTaskState::Failed,
            (None, Ok(Err(haven_agent::AgentError::Cancelled))) => A2aTaskState::Canceled,
            (None, Ok(Err(_))) => A2aTaskState::Failed,
            (None, Ok(Ok(_))) => A2aTaskState::Completed,
        };

        let artifact = Artifact {
            artifact_id: artifact_id.clone(),
            name: Some("response".to_string()),
            parts: vec![Part::Text { text: full_text.clone() }],
        };
        if final_state == A2aTaskState::Completed {
            yield Ok(envelope_event(
                "artifact",
                &request_id,
                artifact_update(&task_id, &context_id, &artifact, false, true),
            ));
        }

        let history = json!([serde_json::to_value(&message).unwrap_or(Value::Null)]);
        let _ = a2a_tasks::finish(
            &state.db,
            &task_id,
            final_state,
            &json!([artifact]),
            &history,
        );

        yield Ok(envelope_event(
            "status",
            &request_id,
            status_update(&task_id, &context_id, final_state, true),
        ));
    };

    Sse::new(stream)
}

fn envelope_event(kind: &str, request_id: &Value, result: Value) -> SseEvent {
    let envelope = JsonRpcResponse::ok(request_id.clone(), result);
    SseEvent::default()
        .event(kind.to_string())
        .data(serde_json::to_string(&envelope).unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use haven_agent::replay::ScriptedClient;
    use haven_agent::LlmOutput;
    use haven_tools::{LocalToolsProvider, ToolsProvider};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn state_with(outputs: Vec<LlmOutput>) -> (A2aState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Db::open_in_memory().unwrap();
        let store = haven_attachments::BlobStore::new(dir.path()).unwrap();
        let attachments =
            haven_attachments::AttachmentRegistry::new(db.clone(), store, "/attachments");
        let tools: Arc<dyn ToolsProvider> = Arc::new(LocalToolsProvider::new());
        let mut config = HavenConfig::default();
        config.a2a.agent_name = "Haven".to_string();
        config.profiles.insert(
            "default".to_string(),
            haven_core::config::ProfileConfig {
                description: "General assistance".to_string(),
                ..Default::default()
            },
        );
        let orchestrator = Arc::new(Orchestrator::new(
            db.clone(),
            attachments,
            tools,
            Arc::new(ScriptedClient::new(outputs)),
            config.clone(),
        ));
        (A2aState::new(db, orchestrator, config), dir)
    }

    async fn rpc(state: &A2aState, body: &str) -> Value {
        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/a2a")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn agent_card_lists_profile_skills() {
        let (state, _dir) = state_with(vec![]);
        let response = router(state)
            .oneshot(
                Request::builder()
                    .uri("/.well-known/agent.json")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let card: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(card["name"], "Haven");
        assert_eq!(card["capabilities"]["streaming"], true);
        assert_eq!(card["skills"][0]["id"], "default");
    }

    #[tokio::test]
    async fn parse_and_method_errors_use_protocol_codes() {
        let (state, _dir) = state_with(vec![]);

        let response = rpc(&state, "{not json").await;
        assert_eq!(response["error"]["code"], PARSE_ERROR);

        let response = rpc(&state, r#"{"jsonrpc":"1.0","id":1,"method":"message/send"}"#).await;
        assert_eq!(response["error"]["code"], INVALID_REQUEST);

        let response = rpc(&state, r#"{"jsonrpc":"2.0","id":1,"method":"bogus/method"}"#).await;
        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);

        let response = rpc(
            &state,
            r#"{"jsonrpc":"2.0","id":1,"method":"tasks/get","params":{"id":"nope"}}"#,
        )
        .await;
        assert_eq!(response["error"]["code"], TASK_NOT_FOUND);
    }

    #[tokio::test]
    async fn message_send_runs_a_turn_and_returns_the_task() {
        let (state, _dir) = state_with(vec![LlmOutput::text("hello from haven")]);
        let body = r#"{"jsonrpc":"2.0","id":7,"method":"message/send","params":{"message":{"role":"user","parts":[{"kind":"text","text":"hello"}],"messageId":"m1","contextId":"ctx-1"}}}"#;

        let response = rpc(&state, body).await;
        assert_eq!(response["id"], 7);
        let task = &response["result"];
        assert_eq!(task["kind"], "task");
        assert_eq!(task["contextId"], "ctx-1");
        assert_eq!(task["status"]["state"], "completed");
        assert_eq!(
            task["artifacts"][0]["parts"][0]["text"],
            "hello from haven"
        );

        // tasks/get returns the same record.
        let task_id = task["id"].as_str().unwrap();
        let get_body = format!(
            r#"{{"jsonrpc":"2.0","id":8,"method":"tasks/get","params":{{"id":"{task_id}"}}}}"#
        );
        let response = rpc(&state, &get_body).await;
        assert_eq!(response["result"]["status"]["state"], "completed");

        // Completed tasks are not cancelable.
        let cancel_body = format!(
            r#"{{"jsonrpc":"2.0","id":9,"method":"tasks/cancel","params":{{"id":"{task_id}"}}}}"#
        );
        let response = rpc(&state, &cancel_body).await;
        assert_eq!(response["error"]["code"], TASK_NOT_CANCELABLE);
    }

    #[tokio::test]
    async fn failed_turn_is_recorded_as_failed_task() {
        // No scripted outputs → the LLM call errors.
        let (state, _dir) = state_with(vec![]);
        let body = r#"{"jsonrpc":"2.0","id":1,"method":"message/send","params":{"message":{"role":"user","parts":[{"kind":"text","text":"hello"}],"messageId":"m1"}}}"#;
        let response = rpc(&state, body).await;
        assert_eq!(response["result"]["status"]["state"], "failed");
    }
}
