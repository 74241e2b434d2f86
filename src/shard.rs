use crate::config::GatewayConfig;
use crate::connection::{FrameSender, ShardConnection};
use crate::error::{Error, ErrorKind};
use crate::heartbeat::HeartbeatMonitor;
use crate::metrics::Metrics;
use crate::protocol::{EventEnvelope, GatewayFrame};
use crate::rest::RestClient;
use crate::session::{ConnectionState, Session};
use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

/// State shared between a shard handle and its connection task
pub(crate) struct ShardShared {
    pub(crate) id: u32,
    pub(crate) total: u32,
    pub(crate) state: RwLock<ConnectionState>,
    pub(crate) session: RwLock<Session>,
    pub(crate) heartbeat: Mutex<HeartbeatMonitor>,
    /// Write half of the open connection, if any
    pub(crate) sender: RwLock<Option<Arc<FrameSender>>>,
    pub(crate) reconnect: Notify,
}

/// Reported when a shard's connection task stops on its own
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardFailure {
    pub shard_id: u32,
    pub kind: ErrorKind,
    pub message: String,
}

struct ShardTask {
    cancel: CancellationToken,
    invalidate: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Handle to one shard connection.
///
/// The connection itself runs in a spawned task between `connect` and
/// `disconnect`; the handle exposes its state and an outbound send path.
pub struct Shard {
    shared: Arc<ShardShared>,
    config: Arc<GatewayConfig>,
    rest: Option<Arc<RestClient>>,
    metrics: Arc<Metrics>,
    events_tx: mpsc::Sender<EventEnvelope>,
    failures_tx: Option<mpsc::UnboundedSender<ShardFailure>>,
    /// Serializes connect/disconnect
    task: tokio::sync::Mutex<Option<ShardTask>>,
}

impl Shard {
    /// Create shard `id` of `total`, forwarding events into `events_tx`
    pub fn new(
        id: u32,
        total: u32,
        config: Arc<GatewayConfig>,
        events_tx: mpsc::Sender<EventEnvelope>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let shared = Arc::new(ShardShared {
            id,
            total,
            state: RwLock::new(ConnectionState::Disconnected),
            session: RwLock::new(Session::default()),
            heartbeat: Mutex::new(HeartbeatMonitor::new(config.heartbeat.max_missed)),
            sender: RwLock::new(None),
            reconnect: Notify::new(),
        });
        metrics.update_shard(id, |s| s.state = ConnectionState::Disconnected);

        Self {
            shared,
            config,
            rest: None,
            metrics,
            events_tx,
            failures_tx: None,
            task: tokio::sync::Mutex::new(None),
        }
    }

    /// Re-fetch the gateway endpoint through `rest` when reconnecting from scratch
    pub fn with_rest(mut self, rest: Arc<RestClient>) -> Self {
        self.rest = Some(rest);
        self
    }

    /// Report task exits on `failures_tx`
    pub fn with_failures(mut self, failures_tx: mpsc::UnboundedSender<ShardFailure>) -> Self {
        self.failures_tx = Some(failures_tx);
        self
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    pub fn total(&self) -> u32 {
        self.shared.total
    }

    /// Start the connection task against `endpoint`.
    ///
    /// The returned receiver completes once the shard reaches `Connected` for
    /// the first time; it is dropped without a value if the task exits first.
    pub async fn connect(&self, endpoint: impl Into<String>) -> Result<oneshot::Receiver<()>, Error> {
        let mut task = self.task.lock().await;
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return Err(Error::AlreadyConnected(self.shared.id));
        }

        let (ready_tx, ready_rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let invalidate = Arc::new(AtomicBool::new(false));

        let connection = ShardConnection::new(
            self.shared.clone(),
            self.config.clone(),
            self.rest.clone(),
            self.metrics.clone(),
            self.events_tx.clone(),
            ready_tx,
            cancel.clone(),
            invalidate.clone(),
            endpoint.into(),
        );

        debug!("[SHARD-{}] Spawning connection task", self.shared.id);
        let handle = tokio::spawn(run_with_recovery(
            connection,
            self.metrics.clone(),
            self.failures_tx.clone(),
        ));

        *task = Some(ShardTask {
            cancel,
            invalidate,
            handle,
        });
        Ok(ready_rx)
    }

    /// Stop the connection and wait for its task to finish.
    ///
    /// With `invalidate_session` the socket closes with a normal code and the
    /// session (id, sequence, resume endpoint) is forgotten; otherwise the
    /// session stays resumable.
    pub async fn disconnect(&self, invalidate_session: bool) {
        let task = self.task.lock().await.take();
        match task {
            Some(task) => {
                task.invalidate.store(invalidate_session, Ordering::SeqCst);
                task.cancel.cancel();
                if let Err(e) = task.handle.await {
                    warn!("[SHARD-{}] Connection task failed: {:?}", self.shared.id, e);
                }
            }
            None => {
                if invalidate_session {
                    self.shared.session.write().clear();
                }
            }
        }
    }

    /// Send an application frame (presence, voice state, member requests).
    ///
    /// Waits for the outbound command budget; fails if no connection is open.
    pub async fn send(&self, frame: &GatewayFrame) -> Result<(), Error> {
        let sender = self
            .shared
            .sender
            .read()
            .clone()
            .ok_or(Error::NotConnected(self.shared.id))?;
        sender.send_command(frame).await
    }

    /// Ask the running connection to reconnect, keeping the session.
    ///
    /// The request is held until the connection's read loop picks it up. A
    /// request made before a connection attempt starts is discarded.
    pub fn reconnect(&self) {
        self.shared.reconnect.notify_one();
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Copy of the current session bookkeeping
    pub fn session(&self) -> Session {
        self.shared.session.read().clone()
    }

    /// Round trip of the last acknowledged heartbeat
    pub fn latency(&self) -> Option<Duration> {
        self.shared.heartbeat.lock().latency()
    }

    /// Consecutive unanswered heartbeats
    pub fn missed_heartbeats(&self) -> u32 {
        self.shared.heartbeat.lock().missed()
    }

    /// Whether a connection task is running
    pub fn is_running(&self) -> bool {
        self.task
            .try_lock()
            .map(|task| task.as_ref().is_some_and(|t| !t.handle.is_finished()))
            .unwrap_or(true)
    }
}

impl Drop for Shard {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.cancel.cancel();
        }
    }
}

/// Run a connection with panic recovery, reporting abnormal exits
async fn run_with_recovery(
    connection: ShardConnection,
    metrics: Arc<Metrics>,
    failures_tx: Option<mpsc::UnboundedSender<ShardFailure>>,
) {
    let shard_id = connection.shard_id();

    let failure = match AssertUnwindSafe(connection.run()).catch_unwind().await {
        Ok(Ok(())) => {
            debug!("[SHARD-{}] Connection task completed normally", shard_id);
            None
        }
        Ok(Err(e)) => {
            warn!("[SHARD-{}] Connection task ended with error: {}", shard_id, e);
            Some(ShardFailure {
                shard_id,
                kind: e.kind(),
                message: e.to_string(),
            })
        }
        Err(panic_err) => {
            let panic_msg = if let Some(s) = panic_err.downcast_ref::<&str>() {
                s.to_string()
            } else if let Some(s) = panic_err.downcast_ref::<String>() {
                s.clone()
            } else {
                "Unknown panic".to_string()
            };
            error!(
                "[SHARD-{}] Connection task PANICKED: {}. Shard is now dead.",
                shard_id, panic_msg
            );
            metrics.record_error();
            Some(ShardFailure {
                shard_id,
                kind: ErrorKind::Other,
                message: format!("panicked: {}", panic_msg),
            })
        }
    };

    if let (Some(failure), Some(tx)) = (failure, failures_tx) {
        let _ = tx.send(failure);
    }
}

/// Split shard ids `0..count` into identify batches of at most `burst`.
pub fn plan_batches(count: u32, burst: u32) -> Vec<Vec<u32>> {
    let ids: Vec<u32> = (0..count).collect();
    ids.chunks(burst.max(1) as usize).map(<[u32]>::to_vec).collect()
}
