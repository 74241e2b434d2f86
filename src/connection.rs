use crate::bucket::RateLimitBucket;
use crate::config::GatewayConfig;
use crate::error::Error;
use crate::frame::FrameAssembler;
use crate::heartbeat::{ack_channel, run_heartbeat, Beat, HeartbeatOutcome, HeartbeatSignals};
use crate::metrics::Metrics;
use crate::protocol::{
    self, classify_close, CloseAction, EventEnvelope, GatewayFrame, Opcode, ReadyInfo, READY_EVENT,
    RESUMED_EVENT,
};
use crate::rest::RestClient;
use crate::session::{ConnectionState, Handshake};
use crate::shard::ShardShared;
use futures_util::stream::SplitSink;
use futures_util::{FutureExt, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector, MaybeTlsStream, WebSocketStream,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use url::Url;

/// Type alias for WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

type WsSink = SplitSink<WsStream, Message>;

/// Close code that keeps the session resumable
const RESUMABLE_CLOSE_CODE: u16 = 4000;

/// Serialized write half of one connection.
///
/// Heartbeats, handshakes and application sends all go through the same
/// lock. Application sends additionally take a slot from the command bucket.
pub(crate) struct FrameSender {
    shard_id: u32,
    sink: Mutex<WsSink>,
    commands: RateLimitBucket,
    metrics: Arc<Metrics>,
}

impl FrameSender {
    fn new(shard_id: u32, sink: WsSink, config: &GatewayConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            shard_id,
            sink: Mutex::new(sink),
            commands: RateLimitBucket::new(
                format!("commands:{}", shard_id),
                config.command_limit.limit,
                config.command_limit.window,
            ),
            metrics,
        }
    }

    /// Send a protocol frame (heartbeat, identify, resume)
    pub(crate) async fn send(&self, frame: &GatewayFrame) -> Result<(), Error> {
        let text = frame.to_text()?;
        self.sink.lock().await.send(Message::Text(text)).await?;
        self.metrics.record_frame_sent();
        trace!("[SHARD-{}] Sent op {}", self.shard_id, frame.op);
        Ok(())
    }

    /// Send an application frame, waiting for the outbound command budget
    pub(crate) async fn send_command(&self, frame: &GatewayFrame) -> Result<(), Error> {
        let waited = self.commands.acquire().await;
        if !waited.is_zero() {
            self.metrics.record_rate_limit_wait();
            debug!(
                "[SHARD-{}] Command budget exhausted, waited {:?}",
                self.shard_id, waited
            );
        }
        self.send(frame).await
    }

    async fn close(&self, code: u16) {
        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: "".into(),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            trace!("[SHARD-{}] Close frame not sent: {}", self.shard_id, e);
        }
        let _ = sink.close().await;
    }
}

/// Sends heartbeats for the heartbeat loop
struct HeartbeatSender {
    sender: Arc<FrameSender>,
    shared: Arc<ShardShared>,
    metrics: Arc<Metrics>,
}

impl Beat for HeartbeatSender {
    async fn beat(&self) -> Result<(), Error> {
        let last_sequence = self.shared.session.read().last_sequence();
        self.sender.send(&protocol::heartbeat(last_sequence)).await?;
        self.metrics.record_heartbeat_sent();
        Ok(())
    }

    fn missed(&self, _count: u32) {
        self.metrics.record_missed_heartbeat();
    }
}

/// Why a single connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Disconnect was requested
    Shutdown,
    /// Reconnect, resuming if the session is still valid
    Reconnect,
    /// The server invalidated the session
    InvalidSession { resumable: bool },
}

/// Close code for a finished connection. 1000 ends the session, 4000 keeps it resumable.
fn close_code(outcome: &Result<Exit, Error>, invalidate_on_close: bool) -> u16 {
    let invalidating = match outcome {
        Ok(Exit::Shutdown) => invalidate_on_close,
        Ok(Exit::InvalidSession { resumable }) => !resumable,
        Ok(Exit::Reconnect) => false,
        Err(e) => e.is_fatal(),
    };
    if invalidating {
        u16::from(CloseCode::Normal)
    } else {
        RESUMABLE_CLOSE_CODE
    }
}

/// Per-connection state that lives only while the socket is open
struct Live {
    sender: Arc<FrameSender>,
    heartbeat: Option<JoinHandle<HeartbeatOutcome>>,
    ack_tx: mpsc::Sender<()>,
    ack_rx: Option<mpsc::Receiver<()>>,
    beat_now: Arc<Notify>,
    cancel: CancellationToken,
    established: bool,
}

/// Drives one shard through connect, handshake, steady state and reconnect.
pub(crate) struct ShardConnection {
    shared: Arc<ShardShared>,
    config: Arc<GatewayConfig>,
    rest: Option<Arc<RestClient>>,
    metrics: Arc<Metrics>,
    events_tx: mpsc::Sender<EventEnvelope>,
    ready_tx: Option<oneshot::Sender<()>>,
    cancel: CancellationToken,
    invalidate_on_close: Arc<AtomicBool>,
    /// Endpoint used when no resume endpoint applies
    endpoint: String,
    assembler: FrameAssembler,
}

impl ShardConnection {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shared: Arc<ShardShared>,
        config: Arc<GatewayConfig>,
        rest: Option<Arc<RestClient>>,
        metrics: Arc<Metrics>,
        events_tx: mpsc::Sender<EventEnvelope>,
        ready_tx: oneshot::Sender<()>,
        cancel: CancellationToken,
        invalidate_on_close: Arc<AtomicBool>,
        endpoint: String,
    ) -> Self {
        let assembler = FrameAssembler::new(config.connection.max_message_size);
        Self {
            shared,
            config,
            rest,
            metrics,
            events_tx,
            ready_tx: Some(ready_tx),
            cancel,
            invalidate_on_close,
            endpoint,
            assembler,
        }
    }

    pub(crate) fn shard_id(&self) -> u32 {
        self.shared.id
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = std::mem::replace(&mut *self.shared.state.write(), state);
        if previous != state {
            debug!("[SHARD-{}] {} -> {}", self.shared.id, previous, state);
        }
        self.metrics.update_shard(self.shared.id, |s| s.state = state);
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Run the connection loop until disconnect or a fatal error.
    pub(crate) async fn run(mut self) -> Result<(), Error> {
        let shard_id = self.shared.id;
        let mut failed_attempts = 0u32;
        let mut last_error = String::new();
        let mut first = true;

        loop {
            if failed_attempts > 0 {
                let delay = self.config.backoff.delay_for_attempt(failed_attempts - 1);
                info!(
                    "[SHARD-{}] Reconnecting in {:?} (attempt {})",
                    shard_id,
                    delay,
                    failed_attempts + 1
                );
                self.metrics
                    .update_shard(shard_id, |s| s.reconnect_attempt = failed_attempts);
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            if self.cancel.is_cancelled() {
                break;
            }

            let url = self.resolve_endpoint(first).await;
            first = false;

            match self.connect_and_run(&url).await {
                Ok((Exit::Shutdown, _)) => break,
                Ok((exit, established)) => {
                    if established {
                        failed_attempts = 0;
                    } else {
                        failed_attempts += 1;
                        last_error = "connection closed before the session was established".to_string();
                    }

                    if exit == (Exit::InvalidSession { resumable: false }) {
                        let delay = self.config.connection.invalid_session_delay;
                        debug!("[SHARD-{}] Waiting {:?} before identifying", shard_id, delay);
                        tokio::select! {
                            _ = self.cancel.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                }
                Err(e) if e.is_fatal() => {
                    self.metrics.record_error();
                    error!("[SHARD-{}] {}; not reconnecting", shard_id, e);
                    self.set_state(ConnectionState::Disconnected);
                    return Err(e);
                }
                Err(e) => {
                    self.metrics.record_error();
                    failed_attempts += 1;
                    warn!("[SHARD-{}] Connection error: {}", shard_id, e);
                    last_error = e.to_string();
                }
            }

            if let Some(max) = self.config.connection.max_reconnect_attempts {
                if failed_attempts >= max {
                    error!(
                        "[SHARD-{}] Max reconnection attempts ({}) reached",
                        shard_id, max
                    );
                    self.set_state(ConnectionState::Disconnected);
                    return Err(Error::ConnectionFailed {
                        attempts: failed_attempts,
                        last_error,
                    });
                }
            }

            self.set_state(ConnectionState::Reconnecting);
            self.metrics.record_reconnection();
        }

        if self.invalidate_on_close.load(Ordering::SeqCst) {
            self.shared.session.write().clear();
        }
        self.set_state(ConnectionState::Disconnected);
        info!("[SHARD-{}] Disconnected", shard_id);
        Ok(())
    }

    /// Pick the endpoint for the next attempt.
    ///
    /// A resumable session goes to its resume endpoint. Otherwise the first
    /// attempt uses the endpoint handed to `connect`, and later attempts ask
    /// the REST API again unless an explicit gateway URL is configured.
    async fn resolve_endpoint(&mut self, first: bool) -> String {
        let resume_endpoint = {
            let session = self.shared.session.read();
            if session.is_resumable() {
                session.resume_endpoint().map(str::to_string)
            } else {
                None
            }
        };

        if let Some(url) = resume_endpoint {
            return protocol::normalize_gateway_url(&url, self.config.api_version);
        }

        if !first && self.config.gateway_url.is_none() {
            if let Some(rest) = &self.rest {
                match rest.gateway().await {
                    Ok(info) => self.endpoint = info.url,
                    Err(e) => warn!(
                        "[SHARD-{}] Gateway lookup failed, reusing {}: {}",
                        self.shared.id, self.endpoint, e
                    ),
                }
            }
        }

        protocol::normalize_gateway_url(&self.endpoint, self.config.api_version)
    }

    /// Connect and run until the connection ends.
    /// Returns the exit reason and whether the shard reached `Connected`.
    async fn connect_and_run(&mut self, url: &str) -> Result<(Exit, bool), Error> {
        let shard_id = self.shared.id;
        // Drop a request left over from before this attempt
        let _ = self.shared.reconnect.notified().now_or_never();
        self.set_state(ConnectionState::Connecting);
        debug!("[SHARD-{}] Connecting to {}", shard_id, url);

        let max_message_size = self.config.connection.max_message_size;
        let ws_stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok((Exit::Shutdown, false)),
            result = timeout(
                self.config.connection.connect_timeout,
                connect_gateway(url, max_message_size),
            ) => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    return Err(Error::ConnectionFailed {
                        attempts: 0,
                        last_error: "Connection timeout".to_string(),
                    })
                }
            }
        };

        self.metrics.record_connection();
        info!("[SHARD-{}] Connected to {}", shard_id, url);
        self.set_state(ConnectionState::AwaitingHello);

        let (write, mut read) = ws_stream.split();
        let sender = Arc::new(FrameSender::new(
            shard_id,
            write,
            &self.config,
            self.metrics.clone(),
        ));
        *self.shared.sender.write() = Some(sender.clone());
        self.assembler.reset();

        let (ack_tx, ack_rx) = ack_channel();
        let mut live = Live {
            sender,
            heartbeat: None,
            ack_tx,
            ack_rx: Some(ack_rx),
            beat_now: Arc::new(Notify::new()),
            cancel: self.cancel.child_token(),
            established: false,
        };

        let shared = self.shared.clone();
        let outcome: Result<Exit, Error> = loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break Ok(Exit::Shutdown),

                _ = shared.reconnect.notified() => {
                    info!("[SHARD-{}] Reconnect requested", shard_id);
                    break Ok(Exit::Reconnect);
                }

                outcome = async {
                    match live.heartbeat.as_mut() {
                        Some(handle) => handle.await,
                        None => std::future::pending().await,
                    }
                } => {
                    live.heartbeat = None;
                    match outcome {
                        Ok(HeartbeatOutcome::Dead { missed }) => {
                            warn!(
                                "[SHARD-{}] {} heartbeats unanswered, connection is dead",
                                shard_id, missed
                            );
                        }
                        Ok(HeartbeatOutcome::SendFailed(e)) => {
                            warn!("[SHARD-{}] Heartbeat send failed: {}", shard_id, e);
                        }
                        Ok(HeartbeatOutcome::Cancelled) => {
                            debug!("[SHARD-{}] Heartbeat loop stopped", shard_id);
                        }
                        Err(e) => {
                            error!("[SHARD-{}] Heartbeat task failed: {:?}", shard_id, e);
                            self.metrics.record_error();
                        }
                    }
                    break Ok(Exit::Reconnect);
                }

                msg = read.next() => {
                    match msg {
                        Some(Ok(message)) => match self.handle_message(message, &mut live).await {
                            Ok(None) => {}
                            Ok(Some(exit)) => break Ok(exit),
                            Err(e) => break Err(e),
                        },
                        Some(Err(e)) => {
                            warn!("[SHARD-{}] WebSocket error: {}", shard_id, e);
                            break Ok(Exit::Reconnect);
                        }
                        None => {
                            info!("[SHARD-{}] WebSocket stream ended", shard_id);
                            break Ok(Exit::Reconnect);
                        }
                    }
                }
            }
        };

        // Stop the heartbeat before the socket goes away
        live.cancel.cancel();
        if let Some(handle) = live.heartbeat.take() {
            let _ = handle.await;
        }
        self.shared.sender.write().take();

        let code = close_code(&outcome, self.invalidate_on_close.load(Ordering::SeqCst));
        live.sender.close(code).await;

        self.metrics.update_shard(shard_id, |s| s.mark_disconnected());

        outcome.map(|exit| (exit, live.established))
    }

    async fn handle_message(&mut self, message: Message, live: &mut Live) -> Result<Option<Exit>, Error> {
        let assembled = match message {
            Message::Text(text) => self.assembler.push(text.as_bytes(), true),
            Message::Binary(data) => self.assembler.push(&data, true),
            // tungstenite reassembles continuation frames itself and never yields
            // `Frame` on read. The assembler still enforces the size ceiling here.
            Message::Frame(frame) => self.assembler.push(&frame.payload()[..], frame.header().is_final),
            Message::Close(frame) => return self.handle_close(frame),
            Message::Ping(_) | Message::Pong(_) => return Ok(None),
        };

        let bytes = match assembled {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!("[SHARD-{}] Dropping message: {}", self.shared.id, e);
                self.metrics.record_malformed_frame();
                return Ok(None);
            }
        };

        self.metrics.record_frame_received();
        match GatewayFrame::parse(&bytes) {
            Ok(frame) => self.handle_frame(frame, live).await,
            Err(e) => {
                warn!("[SHARD-{}] Dropping malformed frame: {}", self.shared.id, e);
                self.metrics.record_malformed_frame();
                Ok(None)
            }
        }
    }

    fn handle_close(&mut self, frame: Option<CloseFrame<'static>>) -> Result<Option<Exit>, Error> {
        let shard_id = self.shared.id;
        let Some(frame) = frame else {
            info!("[SHARD-{}] Received close frame", shard_id);
            return Ok(Some(Exit::Reconnect));
        };

        let code = u16::from(frame.code);
        let reason = frame.reason.to_string();
        info!("[SHARD-{}] Received close {} ({})", shard_id, code, reason);

        match classify_close(code) {
            CloseAction::Resume => Ok(Some(Exit::Reconnect)),
            CloseAction::Reidentify => {
                self.shared.session.write().invalidate();
                Ok(Some(Exit::Reconnect))
            }
            CloseAction::AuthenticationFailed => Err(Error::AuthenticationFailed { code, reason }),
            CloseAction::Fatal => Err(Error::FatalClose { code, reason }),
        }
    }

    async fn handle_frame(&mut self, frame: GatewayFrame, live: &mut Live) -> Result<Option<Exit>, Error> {
        let shard_id = self.shared.id;

        match frame.opcode() {
            Opcode::Hello => {
                let Some(interval_ms) = protocol::hello_interval(&frame) else {
                    warn!("[SHARD-{}] Hello without heartbeat interval", shard_id);
                    self.metrics.record_malformed_frame();
                    return Ok(None);
                };
                self.start_heartbeat(Duration::from_millis(interval_ms), live);

                let handshake = self.shared.session.read().handshake();
                match handshake {
                    Handshake::Identify => {
                        self.set_state(ConnectionState::Identifying);
                        let identify = protocol::identify(
                            &self.config.token,
                            &self.config.identify,
                            shard_id,
                            self.shared.total,
                        );
                        live.sender.send(&identify).await?;
                        self.metrics.record_identify();
                        info!("[SHARD-{}] Identifying ({}/{})", shard_id, shard_id, self.shared.total);
                    }
                    Handshake::Resume {
                        session_id,
                        last_sequence,
                    } => {
                        self.set_state(ConnectionState::Resuming);
                        let resume = protocol::resume(&self.config.token, &session_id, last_sequence);
                        live.sender.send(&resume).await?;
                        self.metrics.record_resume();
                        info!("[SHARD-{}] Resuming at sequence {}", shard_id, last_sequence);
                    }
                }
            }

            Opcode::Dispatch => {
                if let Some(sequence) = frame.s {
                    let last_sequence = {
                        let mut session = self.shared.session.write();
                        session.observe_sequence(sequence);
                        session.last_sequence()
                    };
                    self.metrics.update_shard(shard_id, |s| {
                        s.last_sequence = last_sequence;
                        s.last_event_at = Some(std::time::Instant::now());
                    });
                }

                if frame.t.as_deref() == Some(READY_EVENT) {
                    match serde_json::from_value::<ReadyInfo>(frame.d.clone()) {
                        Ok(ready) => {
                            self.shared
                                .session
                                .write()
                                .establish(ready.session_id, ready.resume_gateway_url);
                            info!("[SHARD-{}] Ready", shard_id);
                            self.mark_connected(live);
                        }
                        Err(e) => warn!("[SHARD-{}] READY without session: {}", shard_id, e),
                    }
                } else if self.state() == ConnectionState::Resuming {
                    if frame.t.as_deref() == Some(RESUMED_EVENT) {
                        info!("[SHARD-{}] Resumed", shard_id);
                    } else {
                        info!("[SHARD-{}] Replaying missed events", shard_id);
                    }
                    self.mark_connected(live);
                }

                if !self.forward(EventEnvelope::from_frame(shard_id, frame)).await {
                    return Ok(Some(Exit::Shutdown));
                }
            }

            Opcode::Heartbeat => {
                debug!("[SHARD-{}] Server requested a heartbeat", shard_id);
                live.beat_now.notify_one();
            }

            Opcode::Reconnect => {
                info!("[SHARD-{}] Server requested reconnect", shard_id);
                return Ok(Some(Exit::Reconnect));
            }

            Opcode::InvalidSession => {
                let resumable = frame.d.as_bool().unwrap_or(false);
                self.metrics.record_invalid_session();
                if !resumable {
                    self.shared.session.write().invalidate();
                }
                warn!(
                    "[SHARD-{}] Session invalidated (resumable: {})",
                    shard_id, resumable
                );
                return Ok(Some(Exit::InvalidSession { resumable }));
            }

            Opcode::HeartbeatAck => {
                let latency = self.shared.heartbeat.lock().record_ack();
                let _ = live.ack_tx.try_send(());
                self.metrics.record_heartbeat_ack();
                self.metrics.update_shard(shard_id, |s| s.latency = latency);
                trace!("[SHARD-{}] Heartbeat ack (latency {:?})", shard_id, latency);
            }

            other => {
                debug!("[SHARD-{}] Ignoring opcode {:?}", shard_id, other);
            }
        }

        Ok(None)
    }

    fn start_heartbeat(&self, interval: Duration, live: &mut Live) {
        let shard_id = self.shared.id;
        let Some(ack_rx) = live.ack_rx.take() else {
            debug!("[SHARD-{}] Duplicate Hello ignored", shard_id);
            return;
        };

        self.shared.heartbeat.lock().start(interval);
        debug!("[SHARD-{}] Heartbeating every {:?}", shard_id, interval);

        let beat = HeartbeatSender {
            sender: live.sender.clone(),
            shared: self.shared.clone(),
            metrics: self.metrics.clone(),
        };
        let signals = HeartbeatSignals {
            ack_rx,
            beat_now: live.beat_now.clone(),
            cancel: live.cancel.clone(),
        };
        let shared = self.shared.clone();
        live.heartbeat = Some(tokio::spawn(async move {
            run_heartbeat(shard_id, &beat, interval, &shared.heartbeat, signals).await
        }));
    }

    fn mark_connected(&mut self, live: &mut Live) {
        self.set_state(ConnectionState::Connected);
        live.established = true;
        self.metrics.update_shard(self.shared.id, |s| s.mark_connected());
        if let Some(ready_tx) = self.ready_tx.take() {
            let _ = ready_tx.send(());
            debug!("[SHARD-{}] Signaled connection ready", self.shared.id);
        }
    }

    /// Hand an event to the dispatcher. Returns false if cancelled while waiting.
    async fn forward(&self, envelope: EventEnvelope) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            result = self.events_tx.send(envelope) => {
                match result {
                    Ok(()) => self.metrics.record_event_dispatched(),
                    Err(_) => trace!("[SHARD-{}] Event receiver dropped", self.shared.id),
                }
                true
            }
        }
    }
}

/// Open a WebSocket to a gateway endpoint.
async fn connect_gateway(url: &str, max_message_size: usize) -> Result<WsStream, Error> {
    let parsed_url = Url::parse(url).map_err(|e| Error::ConnectionFailed {
        attempts: 0,
        last_error: format!("Invalid URL: {}", e),
    })?;

    let host = parsed_url
        .host_str()
        .ok_or_else(|| Error::ConnectionFailed {
            attempts: 0,
            last_error: "No host in URL".to_string(),
        })?;

    let is_tls = parsed_url.scheme() == "wss";
    let port = parsed_url.port().unwrap_or(if is_tls { 443 } else { 80 });

    let request = url
        .into_client_request()
        .map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("Invalid WebSocket request: {}", e),
        })?;

    let tcp_stream = connect_direct(host, port).await?;
    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new().map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("TLS error: {}", e),
        })?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let mut ws_config = WebSocketConfig::default();
    ws_config.max_message_size = Some(max_message_size);
    ws_config.max_frame_size = Some(max_message_size);

    let (ws_stream, _response) =
        client_async_tls_with_config(request, tcp_stream, Some(ws_config), connector)
            .await
            .map_err(Error::WebSocket)?;

    Ok(ws_stream)
}

async fn connect_direct(host: &str, port: u16) -> Result<TcpStream, Error> {
    let dest_str = format!("{}:{}", host, port);
    let dest_addr: SocketAddr = tokio::net::lookup_host(&dest_str)
        .await
        .map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("DNS lookup failed: {}", e),
        })?
        .next()
        .ok_or_else(|| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("No addresses found for {}", host),
        })?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::ConnectionFailed {
        attempts: 0,
        last_error: format!("Failed to create socket: {}", e),
    })?;

    socket
        .connect(dest_addr)
        .await
        .map_err(|e| Error::ConnectionFailed {
            attempts: 0,
            last_error: format!("TCP connect to {} failed: {}", dest_addr, e),
        })
}

/// Disable Nagle and enable keepalive so dead peers are noticed
fn set_tcp_options(stream: &TcpStream) {
    let sock2 = socket2::SockRef::from(stream);
    let _ = sock2.set_nodelay(true);

    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_rejects_bad_url() {
        let err = connect_gateway("not a url", 1024).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionFailed { .. }));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port nothing listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_gateway(&format!("ws://127.0.0.1:{}", port), 1024)
            .await
            .unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_close_code_keeps_session_unless_invalidating() {
        let code = |outcome: Result<Exit, Error>, invalidate| close_code(&outcome, invalidate);

        assert_eq!(code(Ok(Exit::Reconnect), true), RESUMABLE_CLOSE_CODE);
        assert_eq!(code(Ok(Exit::Shutdown), false), RESUMABLE_CLOSE_CODE);
        assert_eq!(code(Ok(Exit::Shutdown), true), 1000);
        assert_eq!(
            code(Ok(Exit::InvalidSession { resumable: true }), false),
            RESUMABLE_CLOSE_CODE
        );
        assert_eq!(code(Ok(Exit::InvalidSession { resumable: false }), false), 1000);

        let transient = Error::ConnectionFailed {
            attempts: 1,
            last_error: "reset by peer".to_string(),
        };
        assert_eq!(code(Err(transient), false), RESUMABLE_CLOSE_CODE);
        assert_eq!(
            code(Err(Error::ChannelSend("event receiver dropped".to_string())), false),
            RESUMABLE_CLOSE_CODE
        );

        let fatal = Error::AuthenticationFailed {
            code: 4004,
            reason: "Authentication failed.".to_string(),
        };
        assert_eq!(code(Err(fatal), false), 1000);
    }
}
