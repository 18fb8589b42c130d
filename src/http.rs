//! Ingress API — the HTTP face an agent talks to.
//!
//! POST /execute            submit an execution request
//! GET  /execute/:id/status externally safe view of one request
//! GET  /view/:id           HTML rendering of the pinned code bytes
//! GET  /health             liveness
//! POST /secrets            admin vault write (local use; see config docs)
//! GET  /secrets            vault names, never values
//!
//! Submission fetches the code, fingerprints it, pins the exact bytes, and
//! hands the request to the coordinator. The code-view page serves those
//! pinned bytes so a mid-review upstream change can never deceive the
//! operator.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Html;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::broker::BrokerEvent;
use crate::fetch::CodeFetcher;
use crate::metadata;
use crate::request::{fingerprint, Request};
use crate::store::RequestStore;
use crate::vault::SecretVault;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RequestStore>,
    pub vault: Arc<SecretVault>,
    pub fetcher: Arc<CodeFetcher>,
    pub events: mpsc::Sender<BrokerEvent>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/execute", post(submit))
        .route("/execute/:id/status", get(status))
        .route("/view/:id", get(code_view))
        .route("/health", get(health))
        .route("/secrets", post(put_secret).get(list_secrets))
        .with_state(state)
}

#[derive(Deserialize)]
struct ExecuteRequest {
    skill_id: String,
    skill_url: String,
    #[serde(default)]
    secrets: SecretsField,
    #[serde(default)]
    args: BTreeMap<String, String>,
}

/// `secrets` arrives either as a list of names or as a mapping whose keys
/// are the names — both are accepted.
#[derive(Deserialize)]
#[serde(untagged)]
enum SecretsField {
    List(Vec<String>),
    Map(BTreeMap<String, Value>),
}

impl Default for SecretsField {
    fn default() -> Self {
        Self::List(Vec::new())
    }
}

impl SecretsField {
    fn names(self) -> Vec<String> {
        match self {
            Self::List(names) => names,
            Self::Map(map) => map.into_keys().collect(),
        }
    }
}

type ApiError = (StatusCode, Json<Value>);

fn bad_request(kind: &str, detail: impl ToString) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": kind, "detail": detail.to_string() })),
    )
}

async fn submit(
    State(state): State<AppState>,
    Json(body): Json<ExecuteRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.skill_id.is_empty() || body.skill_url.is_empty() {
        return Err(bad_request("bad-request", "skill_id and skill_url are required"));
    }

    let code = state
        .fetcher
        .fetch(&body.skill_url)
        .await
        .map_err(|e| bad_request("fetch-failed", e))?;

    let meta = metadata::parse(&code).map_err(|e| bad_request("bad-metadata", e))?;

    let request = Request::new(
        &body.skill_id,
        &body.skill_url,
        &fingerprint(&code),
        &meta,
        &body.secrets.names(),
        body.args,
        Utc::now(),
    );
    let id = request.id.clone();

    state.store.create(&request).map_err(|e| {
        error!("Request insert failed: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal", "detail": "store write failed" })),
        )
    })?;
    state.store.store_code(&id, &code).map_err(|e| {
        error!("Code pin failed for {id}: {e}");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "internal", "detail": "store write failed" })),
        )
    })?;

    info!(
        "Accepted request {id} for skill '{}' ({} bytes)",
        meta.skill,
        code.len()
    );
    if state
        .events
        .send(BrokerEvent::NewRequest { id: id.clone() })
        .await
        .is_err()
    {
        // The row is durable; only the prompt hand-off was lost
        warn!("Coordinator queue closed; request {id} stays pending");
    }

    Ok(Json(json!({ "request_id": id, "status": "pending" })))
}

async fn status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let request = state
        .store
        .get(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    // Secret *names* are public; values never leave the vault this way.
    Ok(Json(json!({
        "request_id": request.id,
        "skill_id": request.skill_id,
        "skill_name": request.skill_name,
        "source": request.source,
        "fingerprint": request.fingerprint,
        "secrets": request.secrets,
        "args": request.args,
        "network": request.network,
        "timeout_secs": request.timeout_secs,
        "status": request.state,
        "created_at": request.created_at,
        "approved_at": request.approved_at,
        "executed_at": request.executed_at,
        "result": request.result,
        "failure": request.failure,
    })))
}

async fn code_view(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Html<String>, StatusCode> {
    let request = state
        .store
        .get(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;
    // The pinned bytes — exactly what was fingerprinted, never a re-fetch
    let code = state
        .store
        .load_code(&id)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::NOT_FOUND)?;

    let secrets = if request.secrets.is_empty() {
        "none".to_string()
    } else {
        request.secrets.join(", ")
    };
    let network = if request.network.is_empty() {
        "none".to_string()
    } else {
        request.network.join(", ")
    };
    let page = format!(
        "<!DOCTYPE html>\n<html><head><title>{title}</title></head><body>\n\
         <h1>{title}</h1>\n\
         <p>Fingerprint: <code>{fp}</code></p>\n\
         <p>Secrets: {secrets} — Network: {network} — Timeout: {timeout}s</p>\n\
         <pre>{code}</pre>\n\
         </body></html>\n",
        title = html_escape(&request.skill_name),
        fp = html_escape(&request.fingerprint),
        secrets = html_escape(&secrets),
        network = html_escape(&network),
        timeout = request.timeout_secs,
        code = html_escape(&String::from_utf8_lossy(&code)),
    );
    Ok(Html(page))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "timestamp": Utc::now().to_rfc3339() }))
}

#[derive(Deserialize)]
struct SecretBody {
    name: String,
    value: String,
}

async fn put_secret(
    State(state): State<AppState>,
    Json(body): Json<SecretBody>,
) -> Result<Json<Value>, ApiError> {
    state
        .vault
        .put(&body.name, body.value.as_bytes())
        .map_err(|e| bad_request("bad-request", e))?;
    Ok(Json(json!({ "ok": true })))
}

async fn list_secrets(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "names": state.vault.list_names() }))
}

fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tempfile::TempDir;
    use tower::ServiceExt;

    struct TestApp {
        app: Router,
        store: Arc<RequestStore>,
        vault: Arc<SecretVault>,
        rx: mpsc::Receiver<BrokerEvent>,
        _tmp: TempDir,
    }

    fn test_app() -> TestApp {
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(RequestStore::open(tmp.path().join("db")).unwrap());
        let vault = Arc::new(SecretVault::open(Arc::clone(&store)).unwrap());
        let (tx, rx) = mpsc::channel(16);
        let state = AppState {
            store: Arc::clone(&store),
            vault: Arc::clone(&vault),
            fetcher: Arc::new(CodeFetcher::new()),
            events: tx,
        };
        TestApp {
            app: router(state),
            store,
            vault,
            rx,
            _tmp: tmp,
        }
    }

    fn data_url(code: &str) -> String {
        use base64::Engine;
        format!(
            "data:text/plain;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(code)
        )
    }

    async fn post_json(app: Router, uri: &str, body: Value) -> (StatusCode, Value) {
        let request = HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn get_raw(app: Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let request = HttpRequest::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, bytes.to_vec())
    }

    const HELLO: &str = "# @skill hello\n# @secrets K\nprintf HELLO\n";

    #[tokio::test]
    async fn test_submit_accepts_and_pins_code() {
        let mut t = test_app();
        let (status, json) = post_json(
            t.app.clone(),
            "/execute",
            json!({
                "skill_id": "hello",
                "skill_url": data_url(HELLO),
                "secrets": ["K"],
                "args": {"CITY": "Paris"}
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "pending");
        let id = json["request_id"].as_str().unwrap();
        assert_eq!(id.len(), 32);

        // Row persisted and code pinned byte-for-byte
        let row = t.store.get(id).unwrap().unwrap();
        assert_eq!(row.skill_name, "hello");
        assert_eq!(row.secrets, vec!["K"]);
        assert_eq!(row.args["CITY"], "Paris");
        assert_eq!(row.fingerprint, fingerprint(HELLO.as_bytes()));
        assert_eq!(t.store.load_code(id).unwrap().unwrap(), HELLO.as_bytes());

        // Coordinator was handed the request
        match t.rx.try_recv().unwrap() {
            BrokerEvent::NewRequest { id: event_id } => assert_eq!(event_id, id),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_submit_secrets_as_mapping() {
        let t = test_app();
        let (status, json) = post_json(
            t.app.clone(),
            "/execute",
            json!({
                "skill_id": "hello",
                "skill_url": data_url("# @skill hello\nprintf x\n"),
                "secrets": {"K": "", "J": ""}
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let id = json["request_id"].as_str().unwrap();
        let row = t.store.get(id).unwrap().unwrap();
        assert_eq!(row.secrets, vec!["J", "K"]);
    }

    #[tokio::test]
    async fn test_submit_bad_metadata_creates_nothing() {
        let t = test_app();
        let (status, json) = post_json(
            t.app.clone(),
            "/execute",
            json!({
                "skill_id": "x",
                "skill_url": data_url("print('no header')\n"),
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "bad-metadata");
        assert!(t.store.list_requests().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_fetch_failure_is_4xx() {
        let t = test_app();
        let (status, json) = post_json(
            t.app.clone(),
            "/execute",
            json!({
                "skill_id": "x",
                "skill_url": "ftp://nowhere/skill.py",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "fetch-failed");
        assert!(t.store.list_requests().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_submit_missing_fields_rejected() {
        let t = test_app();
        let (status, json) = post_json(
            t.app.clone(),
            "/execute",
            json!({ "skill_id": "", "skill_url": "" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "bad-request");
    }

    #[tokio::test]
    async fn test_status_view_and_404() {
        let t = test_app();
        let (_, submitted) = post_json(
            t.app.clone(),
            "/execute",
            json!({ "skill_id": "hello", "skill_url": data_url(HELLO), "secrets": ["K"] }),
        )
        .await;
        let id = submitted["request_id"].as_str().unwrap();

        let (status, body) = get_raw(t.app.clone(), &format!("/execute/{id}/status")).await;
        assert_eq!(status, StatusCode::OK);
        let view: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(view["status"], "pending");
        assert_eq!(view["skill_name"], "hello");
        assert_eq!(view["secrets"][0], "K");
        assert!(view["result"].is_null());

        let (missing, _) = get_raw(t.app.clone(), "/execute/deadbeef/status").await;
        assert_eq!(missing, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_code_view_serves_pinned_bytes_escaped() {
        let t = test_app();
        let sneaky = "# @skill sneaky\necho '<script>alert(1)</script>'\n";
        let (_, submitted) = post_json(
            t.app.clone(),
            "/execute",
            json!({ "skill_id": "sneaky", "skill_url": data_url(sneaky) }),
        )
        .await;
        let id = submitted["request_id"].as_str().unwrap();

        let (status, body) = get_raw(t.app.clone(), &format!("/view/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        let page = String::from_utf8(body).unwrap();
        assert!(page.contains(&fingerprint(sneaky.as_bytes())));
        assert!(page.contains("&lt;script&gt;"));
        assert!(!page.contains("<script>alert"));

        let (missing, _) = get_raw(t.app.clone(), "/view/deadbeef").await;
        assert_eq!(missing, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_health() {
        let t = test_app();
        let (status, body) = get_raw(t.app.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn test_secrets_admin_roundtrip_names_only() {
        let t = test_app();
        let (status, json) = post_json(
            t.app.clone(),
            "/secrets",
            json!({ "name": "API_KEY", "value": "sentinel-value-77" }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["ok"], true);
        assert_eq!(t.vault.get("API_KEY").unwrap(), b"sentinel-value-77");

        let (status, body) = get_raw(t.app.clone(), "/secrets").await;
        assert_eq!(status, StatusCode::OK);
        let listing = String::from_utf8(body).unwrap();
        assert!(listing.contains("API_KEY"));
        assert!(!listing.contains("sentinel-value-77"));
    }

    #[tokio::test]
    async fn test_secrets_empty_name_rejected() {
        let t = test_app();
        let (status, _) = post_json(
            t.app.clone(),
            "/secrets",
            json!({ "name": "", "value": "v" }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_html_escape() {
        assert_eq!(
            html_escape("<a href=\"x\">&'"),
            "&lt;a href=&quot;x&quot;&gt;&amp;&#39;"
        );
    }
}
