//! Webhook ingress endpoint — POST /webhooks/{source}.
//!
//! Accepts JSON payloads from external systems. Each configured source is
//! authenticated independently according to its `auth_mode`; accepted
//! payloads are published onto the `webhook` event source, and
//! `worker_completion` reports additionally update the worker-task table.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use hmac::{Hmac, Mac};
use serde_json::{json, Value};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{info, warn};

use haven_core::config::{resolve_secret, WebhookAuthMode, WebhookSourceConfig, WebhooksConfig};
use haven_storage::{worker_tasks, Db};

use crate::error::EventsError;
use crate::sources::PushSource;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone)]
pub struct WebhookState {
    pub config: WebhooksConfig,
    pub source: Arc<PushSource>,
    pub db: Db,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/{source}", post(webhook_handler))
        .with_state(state)
}

/// POST /webhooks/{source}
///
/// Verifies the request signature/token, records worker completions, and
/// publishes the payload as an event. Returns 200 + receipt id on success.
async fn webhook_handler(
    State(state): State<WebhookState>,
    Path(source): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if !state.config.enabled {
        warn!(source = %source, "webhook received but subsystem is disabled");
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "webhook subsystem is disabled"})),
        ));
    }

    let source_cfg = state
        .config
        .sources
        .iter()
        .find(|s| s.name == source)
        .ok_or_else(|| {
            warn!(source = %source, "unknown webhook source");
            (
                StatusCode::NOT_FOUND,
                Json(json!({"error": "unknown webhook source"})),
            )
        })?;

    info!(source = %source, bytes = body.len(), "webhook arrived");

    if let Err(e) = authenticate(source_cfg, &headers, &body) {
        warn!(source = %source, error = %e, "webhook rejected");
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "authentication failed", "reason": e.to_string()})),
        ));
    }

    let payload: Value = serde_json::from_slice(&body).map_err(|e| {
        warn!(source = %source, error = %e, "invalid JSON in webhook body");
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "invalid JSON body"})),
        )
    })?;

    // Worker completion reports get recorded before dispatch so internal
    // subscribers observe consistent state.
    if source == "worker" || payload.get("exit_code").is_some() {
        record_worker_completion(&state.db, &payload);
    }

    let receipt_id = uuid::Uuid::new_v4().to_string();
    let event_payload = json!({
        "webhook_source": source,
        "receipt_id": receipt_id,
        "payload": payload,
    });
    state.source.publish(event_payload).await.map_err(|e| {
        warn!(source = %source, error = %e, "failed to publish webhook event");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "internal error"})),
        )
    })?;

    info!(source = %source, receipt_id = %receipt_id, "webhook accepted");
    Ok(Json(json!({"ok": true, "receipt_id": receipt_id})))
}

fn record_worker_completion(db: &Db, payload: &Value) {
    let Some(task_id) = payload.get("task_id").and_then(Value::as_str) else {
        return;
    };
    let status = payload
        .get("status")
        .and_then(Value::as_str)
        .unwrap_or("unknown");
    let exit_code = payload.get("exit_code").and_then(Value::as_i64);
    let summary = payload.get("summary").and_then(Value::as_str);
    let output_files: Vec<String> = payload
        .get("output_files")
        .and_then(Value::as_array)
        .map(|files| {
            files
                .iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    if let Err(e) =
        worker_tasks::upsert_completion(db, task_id, status, exit_code, summary, &output_files)
    {
        warn!(%task_id, error = %e, "failed to record worker completion");
    }
}

// ── Authentication ────────────────────────────────────────────────────────────

/// Check a request against the source's auth settings.
///
/// Secrets support `$VAR` indirection and are resolved here, so a dangling
/// reference rejects the request instead of silently never matching. A
/// source configured for HMAC or bearer auth without any secret always
/// rejects.
fn authenticate(
    cfg: &WebhookSourceConfig,
    headers: &HeaderMap,
    body: &[u8],
) -> std::result::Result<(), EventsError> {
    let secret = cfg
        .secret
        .as_deref()
        .map(resolve_secret)
        .transpose()
        .map_err(|e| EventsError::Unauthorized(e.to_string()))?;

    match cfg.auth_mode {
        WebhookAuthMode::None => Ok(()),
        WebhookAuthMode::BearerToken => {
            let expected = secret.ok_or_else(|| {
                EventsError::Unauthorized(format!(
                    "source '{}' requires bearer auth but has no token configured",
                    cfg.name
                ))
            })?;
            if bearer_token(headers)? == expected {
                Ok(())
            } else {
                Err(EventsError::Unauthorized(
                    "bearer token does not match".into(),
                ))
            }
        }
        WebhookAuthMode::HmacSha256 => {
            let key = secret.ok_or_else(|| {
                EventsError::Unauthorized(format!(
                    "source '{}' requires HMAC auth but has no signing secret configured",
                    cfg.name
                ))
            })?;
            let claimed = claimed_signature(headers)?;
            let mut mac = HmacSha256::new_from_slice(key.as_bytes()).map_err(|_| {
                EventsError::Unauthorized("signing secret has an unusable length".into())
            })?;
            mac.update(body);
            // verify_slice is constant-time; never compare digests with ==.
            mac.verify_slice(&claimed).map_err(|_| {
                EventsError::Unauthorized("body signature does not match".into())
            })
        }
    }
}

/// Token from an `Authorization: Bearer <token>` header.
fn bearer_token(headers: &HeaderMap) -> std::result::Result<String, EventsError> {
    let value = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            EventsError::Unauthorized("request carries no Authorization header".into())
        })?;
    match value.split_once(' ') {
        Some(("Bearer", token)) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(EventsError::Unauthorized(
            "Authorization header is not a Bearer token".into(),
        )),
    }
}

/// Decode the claimed digest from `X-Hub-Signature-256: sha256=<hex>`
/// (the scheme GitHub-style senders use).
fn claimed_signature(headers: &HeaderMap) -> std::result::Result<Vec<u8>, EventsError> {
    let value = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            EventsError::Unauthorized("request carries no X-Hub-Signature-256 header".into())
        })?;
    let digest = match value.split_once('=') {
        Some(("sha256", digest)) if !digest.is_empty() => digest,
        _ => {
            return Err(EventsError::Unauthorized(
                "signature header must use the sha256=<hex> form".into(),
            ))
        }
    };
    hex::decode(digest)
        .map_err(|_| EventsError::Unauthorized("signature digest is not valid hex".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::EventSource;
    use axum::body::Body;
    use axum::http::Request;
    use haven_core::config::WebhookSourceConfig;
    use tower::ServiceExt;

    fn state(auth_mode: WebhookAuthMode, secret: Option<&str>) -> (WebhookState, Arc<PushSource>) {
        let source = PushSource::new("webhook");
        let state = WebhookState {
            config: WebhooksConfig {
                enabled: true,
                sources: vec![WebhookSourceConfig {
                    name: "worker".to_string(),
                    secret: secret.map(String::from),
                    auth_mode,
                }],
            },
            source: source.clone(),
            db: Db::open_in_memory().unwrap(),
        };
        (state, source)
    }

    async fn send(
        router: Router,
        path: &str,
        headers: &[(&str, &str)],
        body: &str,
    ) -> StatusCode {
        let mut request = Request::builder().method("POST").uri(path);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }
        let request = request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        router.oneshot(request).await.unwrap().status()
    }

    #[tokio::test]
    async fn bearer_auth_and_worker_completion_recording() {
        let (state, source) = state(WebhookAuthMode::BearerToken, Some("tok"));
        let db = state.db.clone();
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        source.start(tx).await.unwrap();

        let body = r#"{"task_id": "job-9", "status": "completed", "exit_code": 0, "summary": "ok", "output_files": ["a.txt"]}"#;

        // Wrong token refused.
        let status = send(
            router(state.clone()),
            "/webhooks/worker",
            &[("authorization", "Bearer wrong")],
            body,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let status = send(
            router(state.clone()),
            "/webhooks/worker",
            &[("authorization", "Bearer tok")],
            body,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Completion row recorded and event published.
        let record = worker_tasks::get(&db, "job-9").unwrap().unwrap();
        assert_eq!(record.status, "completed");
        assert_eq!(record.exit_code, Some(0));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.source, "webhook");
        assert_eq!(event.payload["payload"]["task_id"], "job-9");
    }

    #[tokio::test]
    async fn hmac_auth_verifies_the_raw_body() {
        let (state, source) = state(WebhookAuthMode::HmacSha256, Some("s3cret"));
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        source.start(tx).await.unwrap();

        let body = r#"{"hello": "world"}"#;
        let mut mac = HmacSha256::new_from_slice(b"s3cret").unwrap();
        mac.update(body.as_bytes());
        let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

        let status = send(
            router(state.clone()),
            "/webhooks/worker",
            &[("x-hub-signature-256", signature.as_str())],
            body,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Tampered body fails verification.
        let status = send(
            router(state.clone()),
            "/webhooks/worker",
            &[("x-hub-signature-256", signature.as_str())],
            r#"{"hello": "tampered"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn authenticate_rejects_missing_and_malformed_credentials() {
        let bearer_cfg = WebhookSourceConfig {
            name: "worker".to_string(),
            secret: Some("tok".to_string()),
            auth_mode: WebhookAuthMode::BearerToken,
        };
        let empty = HeaderMap::new();
        let err = authenticate(&bearer_cfg, &empty, b"{}").unwrap_err();
        assert!(err.to_string().contains("no Authorization header"));

        let mut basic = HeaderMap::new();
        basic.insert("authorization", "Basic abc".parse().unwrap());
        let err = authenticate(&bearer_cfg, &basic, b"{}").unwrap_err();
        assert!(err.to_string().contains("not a Bearer token"));

        let hmac_cfg = WebhookSourceConfig {
            name: "worker".to_string(),
            secret: Some("s3cret".to_string()),
            auth_mode: WebhookAuthMode::HmacSha256,
        };
        let mut wrong_scheme = HeaderMap::new();
        wrong_scheme.insert("x-hub-signature-256", "sha1=abcd".parse().unwrap());
        let err = authenticate(&hmac_cfg, &wrong_scheme, b"{}").unwrap_err();
        assert!(err.to_string().contains("sha256"));

        let mut bad_hex = HeaderMap::new();
        bad_hex.insert("x-hub-signature-256", "sha256=zzzz".parse().unwrap());
        let err = authenticate(&hmac_cfg, &bad_hex, b"{}").unwrap_err();
        assert!(err.to_string().contains("not valid hex"));

        // A source configured for auth but missing its secret always rejects.
        let no_secret = WebhookSourceConfig {
            name: "worker".to_string(),
            secret: None,
            auth_mode: WebhookAuthMode::HmacSha256,
        };
        assert!(authenticate(&no_secret, &empty, b"{}").is_err());
    }

    #[tokio::test]
    async fn unknown_source_and_disabled_subsystem() {
        let (state, _source) = state(WebhookAuthMode::None, None);
        let status = send(router(state.clone()), "/webhooks/nope", &[], "{}").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let mut disabled = state.clone();
        disabled.config.enabled = false;
        let status = send(router(disabled), "/webhooks/worker", &[], "{}").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
