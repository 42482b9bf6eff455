//! A fake Bot API server and a bot wired against it.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::extract::{Multipart, Path as UrlPath, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use fluxbot_bot::config::BotConfig;
use fluxbot_bot::handlers::Bot;
use fluxbot_bot::notifier::TelegramNotifier;
use fluxbot_bot::telegram::{TelegramApi, Update};
use fluxbot_engine::{EngineLifecycle, ProcessError};
use fluxbot_worker::{AbortController, CompletionLog, JobQueue, JobService};
use serde_json::{json, Value};
use tempfile::TempDir;

pub const TOKEN: &str = "test-token";
pub const OPERATOR: i64 = 1;
pub const PHOTO_BYTES: &[u8] = b"not-really-a-jpeg";

// ---------------------------------------------------------------------------
// Fake Bot API
// ---------------------------------------------------------------------------

/// One request the fake server received.
#[derive(Debug, Clone)]
pub struct Call {
    pub method: String,
    pub body: Value,
}

#[derive(Default)]
pub struct ServerState {
    calls: Mutex<Vec<Call>>,
    updates: Mutex<VecDeque<Vec<Value>>>,
    reject_token: AtomicBool,
    next_message_id: AtomicUsize,
}

#[derive(Clone)]
pub struct FakeTelegram {
    pub base_url: String,
    state: Arc<ServerState>,
}

impl FakeTelegram {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route(&format!("/bot{TOKEN}/sendPhoto"), post(send_photo))
            .route(&format!("/bot{TOKEN}/{{method}}"), post(method))
            .route(&format!("/file/bot{TOKEN}/photos/{{name}}"), get(download))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    /// Answer every method with `ok: false, 401`.
    pub fn reject_token(&self) {
        self.state.reject_token.store(true, Ordering::SeqCst);
    }

    /// Queue a batch for the next `getUpdates`.
    pub fn push_updates(&self, batch: Vec<Value>) {
        self.state.updates.lock().unwrap().push_back(batch);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, method: &str) -> Vec<Call> {
        self.calls().into_iter().filter(|c| c.method == method).collect()
    }

    /// Texts of every `sendMessage` to `chat_id`, in order.
    pub fn messages_to(&self, chat_id: i64) -> Vec<String> {
        self.calls_to("sendMessage")
            .into_iter()
            .filter(|c| c.body["chat_id"] == json!(chat_id))
            .filter_map(|c| c.body["text"].as_str().map(str::to_string))
            .collect()
    }
}

fn record(state: &ServerState, method: &str, body: Value) {
    state.calls.lock().unwrap().push(Call {
        method: method.to_string(),
        body,
    });
}

fn ok(result: Value) -> (StatusCode, Json<Value>) {
    (StatusCode::OK, Json(json!({ "ok": true, "result": result })))
}

fn sent_message(state: &ServerState, chat_id: &Value) -> (StatusCode, Json<Value>) {
    let message_id = state.next_message_id.fetch_add(1, Ordering::SeqCst) + 1000;
    ok(json!({ "message_id": message_id, "chat": { "id": chat_id } }))
}

async fn method(
    State(state): State<Arc<ServerState>>,
    UrlPath(method): UrlPath<String>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    record(&state, &method, body.clone());

    if state.reject_token.load(Ordering::SeqCst) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "ok": false, "error_code": 401, "description": "Unauthorized" })),
        );
    }

    match method.as_str() {
        "getMe" => ok(json!({ "id": 42, "is_bot": true, "first_name": "Flux", "username": "flux_bot" })),
        "getUpdates" => {
            let batch = state.updates.lock().unwrap().pop_front();
            match batch {
                Some(batch) => ok(Value::Array(batch)),
                None => {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    ok(json!([]))
                }
            }
        }
        "sendMessage" => sent_message(&state, &body["chat_id"]),
        "getFile" => {
            let file_id = body["file_id"].as_str().unwrap_or_default().to_string();
            if file_id.starts_with("missing") {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "ok": false, "error_code": 400, "description": "Bad Request: invalid file_id" })),
                );
            }
            ok(json!({ "file_id": file_id, "file_path": format!("photos/{file_id}.jpg") }))
        }
        _ => (
            StatusCode::NOT_FOUND,
            Json(json!({ "ok": false, "error_code": 404, "description": "Not Found" })),
        ),
    }
}

async fn send_photo(State(state): State<Arc<ServerState>>, mut multipart: Multipart) -> (StatusCode, Json<Value>) {
    let mut fields = serde_json::Map::new();
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        if name == "photo" {
            let bytes = field.bytes().await.unwrap();
            fields.insert("photo_len".into(), json!(bytes.len()));
        } else {
            fields.insert(name, json!(field.text().await.unwrap()));
        }
    }

    let chat_id: i64 = fields["chat_id"].as_str().unwrap().parse().unwrap();
    record(&state, "sendPhoto", Value::Object(fields));
    sent_message(&state, &json!(chat_id))
}

async fn download(State(state): State<Arc<ServerState>>, UrlPath(name): UrlPath<String>) -> Vec<u8> {
    record(&state, "download", json!({ "name": name }));
    PHOTO_BYTES.to_vec()
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeEngine {
    kills: AtomicUsize,
}

impl FakeEngine {
    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineLifecycle for FakeEngine {
    async fn is_running(&self) -> bool {
        false
    }

    async fn start(&self) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn kill(&self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

/// A bot whose jobs land in a queue nobody drains.
pub struct Harness {
    pub dir: TempDir,
    pub server: FakeTelegram,
    pub api: Arc<TelegramApi>,
    pub queue: Arc<JobQueue>,
    pub engine: Arc<FakeEngine>,
    pub completions: Arc<CompletionLog>,
    pub bot: Arc<Bot>,
}

impl Harness {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let server = FakeTelegram::start().await;

        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        let log_path = dir.path().join("completions.log");

        let vars: HashMap<&str, String> = HashMap::from([
            ("TELEGRAM_TOKEN", TOKEN.to_string()),
            ("TELEGRAM_API_URL", server.base_url.clone()),
            ("WORKSPACE_DIR", workspace.display().to_string()),
            ("COMPLETION_LOG_PATH", log_path.display().to_string()),
            ("OPERATOR_IDS", OPERATOR.to_string()),
        ]);
        let config = BotConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();

        let api = Arc::new(TelegramApi::new(&config.telegram_api_url, TOKEN, Duration::from_secs(1)).unwrap());
        let queue = Arc::new(JobQueue::new());
        let engine = Arc::new(FakeEngine::default());
        let completions = Arc::new(CompletionLog::new(log_path));
        let service = Arc::new(
            JobService::new(
                Arc::clone(&queue),
                AbortController::new(Arc::clone(&queue), engine.clone()),
                Arc::new(TelegramNotifier::new(Arc::clone(&api))),
                Arc::clone(&completions),
            )
            .with_job_estimate(Duration::from_secs(60)),
        );
        let bot = Arc::new(Bot::new(Arc::clone(&api), service, Arc::new(config)));

        Self {
            dir,
            server,
            api,
            queue,
            engine,
            completions,
            bot,
        }
    }

    pub fn workspace(&self) -> PathBuf {
        self.dir.path().join("workspace")
    }

    /// Input images currently in the workspace.
    pub fn inputs(&self) -> Vec<PathBuf> {
        list_prefixed(&self.workspace(), "input_")
    }

    pub async fn send(&self, update: Value) {
        let update: Update = serde_json::from_value(update).unwrap();
        self.bot.handle_update(update).await.unwrap();
    }
}

fn list_prefixed(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(Result::ok)
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

pub fn text_update(update_id: i64, chat_id: i64, text: &str) -> Value {
    json!({
        "update_id": update_id,
        "message": {
            "message_id": update_id * 10,
            "chat": { "id": chat_id, "type": "private" },
            "from": { "id": chat_id, "is_bot": false, "first_name": "Ada" },
            "text": text,
        }
    })
}

pub fn photo_update(update_id: i64, chat_id: i64, file_id: &str, caption: Option<&str>) -> Value {
    let mut update = json!({
        "update_id": update_id,
        "message": {
            "message_id": update_id * 10,
            "chat": { "id": chat_id, "type": "private" },
            "from": { "id": chat_id, "is_bot": false, "first_name": "Ada" },
            "photo": [
                { "file_id": format!("{file_id}-small"), "file_unique_id": "s", "width": 90, "height": 90 },
                { "file_id": file_id, "file_unique_id": "l", "width": 1024, "height": 1024 },
            ],
        }
    });
    if let Some(caption) = caption {
        update["message"]["caption"] = json!(caption);
    }
    update
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn eventually(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
