//! In-process mock of a ComfyUI server for session tests.
//!
//! Serves `/prompt`, `/queue`, `/history/{id}`, `/view` and `/ws` on an
//! ephemeral port. WebSocket frames scripted in [`MockBehavior`] are sent
//! only after the matching client id has submitted a prompt, mirroring
//! how the real server only emits execution events once a job runs.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::oneshot;

/// What the socket does once the scripted frames are sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AfterFrames {
    /// Keep the socket open until the client closes it.
    Hold,
    /// Drop the TCP connection without a close handshake.
    Drop,
}

#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub prompt_id: String,
    pub submit_status: StatusCode,
    /// Raw body returned by `/prompt` instead of the default success body.
    pub submit_body: Option<String>,
    pub frames: Vec<String>,
    pub after_frames: AfterFrames,
    pub history_status: StatusCode,
    pub history: Value,
    /// How long `/view` waits before answering.
    pub view_delay: Duration,
    pub image: Vec<u8>,
}

impl MockBehavior {
    /// A job that completes and produces one image from node 9.
    pub fn completing(prompt_id: &str) -> Self {
        Self {
            prompt_id: prompt_id.to_string(),
            submit_status: StatusCode::OK,
            submit_body: None,
            frames: vec![
                executing(prompt_id, Some("3")),
                progress(prompt_id, 10, 20),
                executing(prompt_id, None),
            ],
            after_frames: AfterFrames::Hold,
            history_status: StatusCode::OK,
            history: history_with_image(prompt_id, "ComfyUI_00001_.png"),
            view_delay: Duration::ZERO,
            image: PNG_BYTES.to_vec(),
        }
    }
}

/// Eight bytes that look enough like a PNG for a file check.
pub const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

pub fn executing(prompt_id: &str, node: Option<&str>) -> String {
    json!({"type": "executing", "data": {"node": node, "prompt_id": prompt_id}}).to_string()
}

pub fn progress(prompt_id: &str, value: i32, max: i32) -> String {
    json!({"type": "progress", "data": {"value": value, "max": max, "prompt_id": prompt_id, "node": "3"}})
        .to_string()
}

pub fn execution_error(prompt_id: &str, message: &str) -> String {
    json!({
        "type": "execution_error",
        "data": {
            "prompt_id": prompt_id,
            "node_id": "3",
            "exception_message": message,
            "exception_type": "RuntimeError",
        }
    })
    .to_string()
}

pub fn history_with_image(prompt_id: &str, filename: &str) -> Value {
    history_record(
        prompt_id,
        json!({"9": {"images": [{"filename": filename, "subfolder": "", "type": "output"}]}}),
    )
}

/// A `/history/{id}` body holding one record with the given outputs.
pub fn history_record(prompt_id: &str, outputs: Value) -> Value {
    let mut history = serde_json::Map::new();
    history.insert(
        prompt_id.to_string(),
        json!({
            "outputs": outputs,
            "status": {"status_str": "success", "completed": true}
        }),
    );
    Value::Object(history)
}

#[derive(Default)]
pub struct Recorded {
    pub submissions: Vec<Value>,
    pub history_lookups: Vec<String>,
    pub views: Vec<HashMap<String, String>>,
    pub dequeued: Vec<Value>,
    pub ws_client_ids: Vec<String>,
}

pub struct MockState {
    behavior: Mutex<MockBehavior>,
    /// Sockets waiting for their client id to submit.
    waiting: Mutex<HashMap<String, oneshot::Sender<()>>>,
    pub recorded: Mutex<Recorded>,
    disconnects: AtomicUsize,
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockServer {
    pub async fn start(behavior: MockBehavior) -> Self {
        let state = Arc::new(MockState {
            behavior: Mutex::new(behavior),
            waiting: Mutex::new(HashMap::new()),
            recorded: Mutex::new(Recorded::default()),
            disconnects: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/prompt", post(submit))
            .route("/queue", post(dequeue))
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view))
            .route("/ws", get(ws_upgrade))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.state.behavior.lock().unwrap() = behavior;
    }

    pub fn history_lookups(&self) -> Vec<String> {
        self.state.recorded.lock().unwrap().history_lookups.clone()
    }

    pub fn submissions(&self) -> Vec<Value> {
        self.state.recorded.lock().unwrap().submissions.clone()
    }

    pub fn ws_client_ids(&self) -> Vec<String> {
        self.state.recorded.lock().unwrap().ws_client_ids.clone()
    }

    pub fn dequeued(&self) -> Vec<Value> {
        self.state.recorded.lock().unwrap().dequeued.clone()
    }

    pub fn view_count(&self) -> usize {
        self.state.recorded.lock().unwrap().views.len()
    }

    pub fn disconnects(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Poll until `n` sockets have gone away, up to five seconds.
    pub async fn wait_for_disconnects(&self, n: usize) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            if self.disconnects() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.disconnects() >= n
    }
}

async fn submit(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    let behavior = state.behavior.lock().unwrap().clone();
    state.recorded.lock().unwrap().submissions.push(body.clone());

    if behavior.submit_status != StatusCode::OK {
        return (behavior.submit_status, "rejected").into_response();
    }

    if let Some(client_id) = body["client_id"].as_str() {
        if let Some(tx) = state.waiting.lock().unwrap().remove(client_id) {
            let _ = tx.send(());
        }
    }

    match behavior.submit_body {
        Some(raw) => ([(header::CONTENT_TYPE, "application/json")], raw).into_response(),
        None => Json(json!({
            "prompt_id": behavior.prompt_id,
            "number": 1,
            "node_errors": {}
        }))
        .into_response(),
    }
}

async fn dequeue(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> StatusCode {
    state.recorded.lock().unwrap().dequeued.push(body);
    StatusCode::OK
}

async fn history(State(state): State<Arc<MockState>>, Path(prompt_id): Path<String>) -> Response {
    state.recorded.lock().unwrap().history_lookups.push(prompt_id);
    let behavior = state.behavior.lock().unwrap().clone();
    if behavior.history_status != StatusCode::OK {
        return (behavior.history_status, "no such prompt").into_response();
    }
    Json(behavior.history).into_response()
}

async fn view(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.recorded.lock().unwrap().views.push(params);
    let (delay, image) = {
        let behavior = state.behavior.lock().unwrap();
        (behavior.view_delay, behavior.image.clone())
    };
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    ([(header::CONTENT_TYPE, "image/png")], image).into_response()
}

#[derive(Deserialize)]
struct WsQuery {
    #[serde(rename = "clientId")]
    client_id: String,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<Arc<MockState>>,
    Query(query): Query<WsQuery>,
) -> Response {
    // Register before the handshake completes so a submit can never
    // race ahead of the socket.
    let (tx, rx) = oneshot::channel();
    state.waiting.lock().unwrap().insert(query.client_id.clone(), tx);
    state.recorded.lock().unwrap().ws_client_ids.push(query.client_id);

    ws.on_upgrade(move |socket| serve_socket(socket, state, rx))
}

async fn serve_socket(mut socket: WebSocket, state: Arc<MockState>, submitted: oneshot::Receiver<()>) {
    let status = json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 0}}}});
    let _ = socket.send(Message::Text(status.to_string().into())).await;

    // Wait for this client's submission, or for the client to leave.
    tokio::select! {
        result = submitted => {
            if result.is_err() {
                state.disconnects.fetch_add(1, Ordering::SeqCst);
                return;
            }
        }
        _ = drain_until_closed(&mut socket) => {
            state.disconnects.fetch_add(1, Ordering::SeqCst);
            return;
        }
    }

    let behavior = state.behavior.lock().unwrap().clone();
    for frame in behavior.frames {
        if socket.send(Message::Text(frame.into())).await.is_err() {
            break;
        }
    }

    if behavior.after_frames == AfterFrames::Hold {
        drain_until_closed(&mut socket).await;
    }
    drop(socket);
    state.disconnects.fetch_add(1, Ordering::SeqCst);
}

async fn drain_until_closed(socket: &mut WebSocket) {
    while let Some(Ok(msg)) = socket.recv().await {
        if matches!(msg, Message::Close(_)) {
            break;
        }
    }
}
