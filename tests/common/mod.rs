//! In-process gateway used by the integration tests.
//!
//! Every accepted connection gets a Hello, has its Identify answered with
//! READY (session `session-<n>`, sequence 1) and its Resume answered with
//! RESUMED. Heartbeats are acknowledged unless the script says otherwise.
//! After the handshake the connection runs the next queued script, if any.

#![allow(dead_code)]

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Something the server does once a connection finished its handshake
#[derive(Debug, Clone)]
pub enum Action {
    /// Send a dispatch with the next sequence number
    Dispatch(&'static str, Value),
    /// Pause
    Sleep(Duration),
    /// Drop the TCP connection without a close frame
    Drop,
    /// Send opcode 9
    InvalidSession(bool),
    /// Send opcode 7
    Reconnect,
    /// Send a close frame with this code
    Close(u16),
    /// Stop acknowledging heartbeats on this connection
    StopAcking,
    /// Send this text verbatim
    Raw(&'static str),
    /// Send an arbitrary opcode without a sequence
    Op(u8, Value),
}

/// A frame the client sent
#[derive(Debug, Clone)]
pub struct Received {
    pub connection: usize,
    pub at: Instant,
    pub frame: Value,
}

impl Received {
    pub fn op(&self) -> u64 {
        self.frame["op"].as_u64().unwrap_or(u64::MAX)
    }
}

struct State {
    url: String,
    heartbeat_interval: u64,
    connections: AtomicUsize,
    received: Mutex<Vec<Received>>,
    scripts: Mutex<VecDeque<Vec<Action>>>,
}

pub struct MockGateway {
    state: Arc<State>,
    task: JoinHandle<()>,
}

impl MockGateway {
    /// Start a gateway with a long heartbeat interval
    pub async fn start() -> Self {
        Self::with_heartbeat_interval(45_000).await
    }

    pub async fn with_heartbeat_interval(heartbeat_interval: u64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State {
            url: format!("ws://{}", addr),
            heartbeat_interval,
            connections: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            scripts: Mutex::new(VecDeque::new()),
        });

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = accept_state.clone();
                let connection = state.connections.fetch_add(1, Ordering::SeqCst);
                let script = state.scripts.lock().pop_front().unwrap_or_default();
                tokio::spawn(serve(stream, state, connection, script));
            }
        });

        Self { state, task }
    }

    pub fn url(&self) -> String {
        self.state.url.clone()
    }

    /// Queue the script for the next accepted connection
    pub fn script(&self, actions: Vec<Action>) {
        self.state.scripts.lock().push_back(actions);
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<Received> {
        self.state.received.lock().clone()
    }

    /// Identify (op 2) and Resume (op 6) frames in arrival order
    pub fn handshakes(&self) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|r| matches!(r.op(), 2 | 6))
            .collect()
    }

    /// Wait until `count` handshakes were received
    pub async fn wait_for_handshakes(&self, count: usize, limit: Duration) -> Vec<Received> {
        let deadline = Instant::now() + limit;
        loop {
            let handshakes = self.handshakes();
            if handshakes.len() >= count || Instant::now() >= deadline {
                return handshakes;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn frame(op: u8, d: Value, s: Option<u64>, t: Option<&str>) -> Message {
    Message::Text(json!({ "op": op, "d": d, "s": s, "t": t }).to_string())
}

async fn serve(stream: TcpStream, state: Arc<State>, connection: usize, script: Vec<Action>) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };

    let hello = frame(10, json!({ "heartbeat_interval": state.heartbeat_interval }), None, None);
    if ws.send(hello).await.is_err() {
        return;
    }

    let mut sequence = 0u64;
    let mut acking = true;
    let mut script = Some(script);

    while let Some(Ok(message)) = ws.next().await {
        let Message::Text(text) = message else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };
        let op = value["op"].as_u64();
        state.received.lock().push(Received {
            connection,
            at: Instant::now(),
            frame: value.clone(),
        });

        let reply = match op {
            Some(1) if acking => Some(frame(11, Value::Null, None, None)),
            Some(2) => {
                sequence = 1;
                Some(frame(
                    0,
                    json!({
                        "session_id": format!("session-{}", connection),
                        "resume_gateway_url": state.url,
                    }),
                    Some(sequence),
                    Some("READY"),
                ))
            }
            Some(6) => {
                sequence = value["d"]["seq"].as_u64().unwrap_or(0) + 1;
                Some(frame(0, Value::Null, Some(sequence), Some("RESUMED")))
            }
            _ => None,
        };

        let Some(reply) = reply else {
            continue;
        };
        if ws.send(reply).await.is_err() {
            return;
        }

        if matches!(op, Some(2) | Some(6)) {
            if let Some(actions) = script.take() {
                if !run_script(&mut ws, actions, &mut sequence, &mut acking).await {
                    return;
                }
            }
        }
    }
}

/// Returns false if the connection should be dropped
async fn run_script(
    ws: &mut WebSocketStream<TcpStream>,
    actions: Vec<Action>,
    sequence: &mut u64,
    acking: &mut bool,
) -> bool {
    for action in actions {
        let message = match action {
            Action::Dispatch(name, data) => {
                *sequence += 1;
                frame(0, data, Some(*sequence), Some(name))
            }
            Action::Sleep(duration) => {
                tokio::time::sleep(duration).await;
                continue;
            }
            Action::Drop => return false,
            Action::InvalidSession(resumable) => frame(9, json!(resumable), None, None),
            Action::Reconnect => frame(7, Value::Null, None, None),
            Action::Close(code) => Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: "closed by test".into(),
            })),
            Action::StopAcking => {
                *acking = false;
                continue;
            }
            Action::Raw(text) => Message::Text(text.to_string()),
            Action::Op(op, data) => frame(op, data, None, None),
        };
        if ws.send(message).await.is_err() {
            return false;
        }
    }
    true
}

/// Poll `condition` every 10ms until it holds or `limit` passes
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Install a test subscriber once; ignores repeated calls
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
