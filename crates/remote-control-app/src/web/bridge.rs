//! The WebSocket hub.
//!
//! One bridge per session: it owns the pty read pump, authenticates each
//! incoming socket, fans terminal output out to every admitted client, and
//! applies credit-based flow control so a slow browser cannot stall the pty
//! reader indefinitely.
//!
//! Locking model, three narrow locks per bridge:
//! - the connection-set lock guards the client map and count,
//! - the write lock serializes every socket write (which is what makes the
//!   cross-client byte ordering guarantee hold),
//! - the flow lock guards the credit counter.
//! No I/O happens while the connection-set or flow lock is held.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use remote_control_terminal::Terminal;

use crate::auth;
use crate::web::flow::{FlowController, FlowEvent};
use crate::web::protocol::{ClientMessage, ServerMessage};

const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);
const DEFAULT_CLIENT_READ_TIMEOUT: Duration = Duration::from_secs(90);
const DEFAULT_ACK_QUANTUM_BYTES: i64 = 256 * 1024;
const AUTH_READ_TIMEOUT: Duration = Duration::from_secs(20);
const BINARY_WRITE_TIMEOUT: Duration = Duration::from_secs(10);
const TEXT_WRITE_TIMEOUT: Duration = Duration::from_secs(5);
const CONTROL_WRITE_TIMEOUT: Duration = Duration::from_secs(3);
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const FLOW_POLL_INTERVAL: Duration = Duration::from_millis(25);
const READ_BUFFER_BYTES: usize = 4096;
const PUMP_CHANNEL_CHUNKS: usize = 32;

const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;
const CLOSE_NORMAL: u16 = 1000;

pub type ClientCountCallback = Box<dyn Fn(usize) + Send + Sync>;

/// Construction knobs. Zero values fall back to the documented defaults.
pub struct BridgeOptions {
    pub read_only: bool,
    pub max_clients: usize,
    pub low_watermark_bytes: i64,
    pub high_watermark_bytes: i64,
    pub ack_quantum_bytes: i64,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub access_code: String,
    pub ping_interval: Duration,
    pub client_read_timeout: Duration,
    pub on_client_count_change: Option<ClientCountCallback>,
}

impl Default for BridgeOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            max_clients: 1,
            low_watermark_bytes: 0,
            high_watermark_bytes: 0,
            ack_quantum_bytes: 0,
            token_expires_at: None,
            access_code: String::new(),
            ping_interval: Duration::ZERO,
            client_read_timeout: Duration::ZERO,
            on_client_count_change: None,
        }
    }
}

struct ClientConn {
    id: u64,
    sink: AsyncMutex<SplitSink<WebSocket, Message>>,
    cancel: CancellationToken,
}

pub struct WsBridge {
    terminal: Arc<Terminal>,
    token: String,
    read_only: bool,
    max_clients: usize,
    ack_quantum_bytes: i64,
    token_expires_at: Option<DateTime<Utc>>,
    access_code: String,
    ping_interval: Duration,
    client_read_timeout: Duration,
    on_client_count_change: Option<ClientCountCallback>,

    cancel: CancellationToken,
    clients: StdMutex<HashMap<u64, Arc<ClientConn>>>,
    next_client_id: AtomicU64,
    write_lock: AsyncMutex<()>,
    flow: StdMutex<FlowController>,
}

impl WsBridge {
    pub fn new(terminal: Arc<Terminal>, token: String, opts: BridgeOptions) -> Self {
        let max_clients = opts.max_clients.max(1);
        let ping_interval = if opts.ping_interval.is_zero() {
            DEFAULT_PING_INTERVAL
        } else {
            opts.ping_interval
        };
        let client_read_timeout = if opts.client_read_timeout.is_zero() {
            DEFAULT_CLIENT_READ_TIMEOUT
        } else {
            opts.client_read_timeout
        };
        let ack_quantum_bytes = if opts.ack_quantum_bytes <= 0 {
            DEFAULT_ACK_QUANTUM_BYTES
        } else {
            opts.ack_quantum_bytes
        };
        Self {
            terminal,
            token,
            read_only: opts.read_only,
            max_clients,
            ack_quantum_bytes,
            token_expires_at: opts.token_expires_at,
            access_code: opts.access_code.trim().to_string(),
            ping_interval,
            client_read_timeout,
            on_client_count_change: opts.on_client_count_change,
            cancel: CancellationToken::new(),
            clients: StdMutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            write_lock: AsyncMutex::new(()),
            flow: StdMutex::new(FlowController::new(
                opts.low_watermark_bytes,
                opts.high_watermark_bytes,
            )),
        }
    }

    /// Launch the pty read pump. A dedicated thread performs the blocking
    /// reads and feeds a small bounded channel; the async side applies the
    /// flow gate and broadcasts. A full channel exerts backpressure on the
    /// reader thread, so pausing the pump pauses the pty too.
    pub fn start(self: &Arc<Self>) {
        let mut reader = match self.terminal.clone_reader() {
            Ok(reader) => reader,
            Err(err) => {
                tracing::warn!(error = %err, "terminal reader unavailable; bridge idle");
                return;
            }
        };
        let (tx, rx) = mpsc::channel::<Vec<u8>>(PUMP_CHANNEL_CHUNKS);
        std::thread::spawn(move || {
            let mut buf = [0u8; READ_BUFFER_BYTES];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        let bridge = Arc::clone(self);
        tokio::spawn(async move { bridge.read_pump(rx).await });
    }

    async fn read_pump(self: Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>) {
        loop {
            if !self.wait_for_flow_resume().await {
                return;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                chunk = rx.recv() => match chunk {
                    Some(data) => self.broadcast_binary(&data).await,
                    None => {
                        self.broadcast_text(&ServerMessage::Info {
                            message: "ℹ️ Session ended".into(),
                        })
                        .await;
                        return;
                    }
                },
            }
        }
    }

    async fn wait_for_flow_resume(&self) -> bool {
        loop {
            if !self.is_flow_paused() {
                return true;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep(FLOW_POLL_INTERVAL) => {}
            }
        }
    }

    fn is_flow_paused(&self) -> bool {
        self.flow.lock().unwrap().is_paused()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    /// Tear the bridge down: cancel every task, wave goodbye to each client
    /// with a normal-closure frame, reset flow credit. Safe to call twice.
    pub async fn close(&self) {
        self.cancel.cancel();
        let conns: Vec<Arc<ClientConn>> = {
            let mut clients = self.clients.lock().unwrap();
            clients.drain().map(|(_, conn)| conn).collect()
        };
        for conn in &conns {
            let _guard = self.write_lock.lock().await;
            let mut sink = conn.sink.lock().await;
            let _ = timeout(
                CLOSE_WRITE_TIMEOUT,
                sink.send(Message::Close(Some(CloseFrame {
                    code: CLOSE_NORMAL,
                    reason: "session closed".into(),
                }))),
            )
            .await;
        }
        if let Some(callback) = &self.on_client_count_change {
            callback(0);
        }
        self.flow.lock().unwrap().reset();
    }

    /// Serve one upgraded socket: authenticate, admit, greet, then dispatch
    /// client frames until disconnect or shutdown.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (sink, mut stream) = socket.split();
        let conn = Arc::new(ClientConn {
            id: self.next_client_id.fetch_add(1, Ordering::Relaxed),
            sink: AsyncMutex::new(sink),
            cancel: self.cancel.child_token(),
        });

        if let Err(reason) = self.authenticate(&mut stream).await {
            let _ = self
                .send_text(
                    &conn,
                    &ServerMessage::AuthError {
                        message: reason.clone(),
                    },
                    CONTROL_WRITE_TIMEOUT,
                )
                .await;
            self.send_close(&conn, CLOSE_POLICY_VIOLATION, "auth failed")
                .await;
            tracing::debug!(client = conn.id, reason = %reason, "auth rejected");
            return;
        }

        if let Err(message) = self.add_conn(&conn) {
            let _ = self
                .send_text(
                    &conn,
                    &ServerMessage::Info {
                        message: message.clone(),
                    },
                    CONTROL_WRITE_TIMEOUT,
                )
                .await;
            self.send_close(&conn, CLOSE_TRY_AGAIN_LATER, "client limit reached")
                .await;
            tracing::debug!(client = conn.id, "client limit reached");
            return;
        }

        let _ = self
            .send_text(&conn, &ServerMessage::AuthOk, CONTROL_WRITE_TIMEOUT)
            .await;
        let _ = self
            .send_text(
                &conn,
                &ServerMessage::Prefs {
                    bytes: self.ack_quantum_bytes,
                },
                CONTROL_WRITE_TIMEOUT,
            )
            .await;
        if self.read_only {
            let _ = self
                .send_text(
                    &conn,
                    &ServerMessage::Readonly {
                        message: "🔒 Read-only mode enabled".into(),
                    },
                    CONTROL_WRITE_TIMEOUT,
                )
                .await;
        }

        let ping_task = {
            let bridge = Arc::clone(&self);
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(bridge.ping_interval);
                ticker.tick().await; // immediate first tick
                loop {
                    tokio::select! {
                        _ = conn.cancel.cancelled() => return,
                        _ = ticker.tick() => {
                            if bridge.send_ping(&conn).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            })
        };

        // Any readable frame (including control pongs) refreshes the read
        // deadline because the timeout restarts per iteration.
        loop {
            let frame = tokio::select! {
                _ = conn.cancel.cancelled() => break,
                frame = timeout(self.client_read_timeout, stream.next()) => frame,
            };
            let frame = match frame {
                Err(_) => break, // read deadline expired
                Ok(None) => break,
                Ok(Some(Err(_))) => break,
                Ok(Some(Ok(frame))) => frame,
            };
            match frame {
                Message::Text(text) => {
                    // Malformed or unknown messages are dropped, the
                    // connection stays up.
                    if let Ok(msg) = serde_json::from_str::<ClientMessage>(&text) {
                        self.handle_client_message(&conn, msg).await;
                    }
                }
                Message::Ping(_) | Message::Pong(_) | Message::Binary(_) => {}
                Message::Close(_) => break,
            }
        }

        ping_task.abort();
        self.remove_conn(&conn);
    }

    async fn authenticate(&self, stream: &mut SplitStream<WebSocket>) -> Result<(), String> {
        // One budget for the whole handshake: a follow-up code frame spends
        // whatever is left of the same 20 seconds.
        let deadline = tokio::time::Instant::now() + AUTH_READ_TIMEOUT;
        let first = read_auth_frame(stream, deadline).await?;
        let ClientMessage::Auth {
            token,
            code,
            columns,
            rows,
        } = first
        else {
            return Err("auth required".into());
        };
        if auth::is_expired(self.token_expires_at, Utc::now()) {
            return Err("token expired".into());
        }
        if !auth::verify(&token, &self.token) {
            return Err("invalid token".into());
        }
        if !self.access_code.is_empty() {
            let provided = match code {
                Some(code) => code,
                // The UI sends the code in a follow-up auth frame when the
                // share URL carried require_code=1.
                None => match read_auth_frame(stream, deadline).await? {
                    ClientMessage::Auth {
                        code: Some(code), ..
                    } => code,
                    _ => return Err("access code required".into()),
                },
            };
            if !auth::verify(&provided, &self.access_code) {
                return Err("invalid code".into());
            }
        }
        if let (Some(cols), Some(rows)) = (columns, rows) {
            if cols > 0 && rows > 0 {
                let _ = self.terminal.resize(clamp_dim(cols), clamp_dim(rows));
            }
        }
        Ok(())
    }

    fn add_conn(&self, conn: &Arc<ClientConn>) -> Result<(), String> {
        let mut clients = self.clients.lock().unwrap();
        if clients.len() >= self.max_clients {
            return Err("another client is already connected".into());
        }
        clients.insert(conn.id, Arc::clone(conn));
        let count = clients.len();
        if let Some(callback) = &self.on_client_count_change {
            callback(count);
        }
        Ok(())
    }

    fn remove_conn(&self, conn: &Arc<ClientConn>) {
        let count = {
            let mut clients = self.clients.lock().unwrap();
            clients.remove(&conn.id);
            let count = clients.len();
            if let Some(callback) = &self.on_client_count_change {
                callback(count);
            }
            count
        };
        conn.cancel.cancel();
        if count == 0 {
            self.flow.lock().unwrap().reset();
        }
    }

    async fn handle_client_message(&self, conn: &Arc<ClientConn>, msg: ClientMessage) {
        match msg {
            ClientMessage::Input { data } => {
                if self.read_only {
                    let _ = self
                        .send_text(
                            conn,
                            &ServerMessage::Readonly {
                                message: "🔒 Input blocked: read-only session".into(),
                            },
                            CONTROL_WRITE_TIMEOUT,
                        )
                        .await;
                    return;
                }
                if let Err(err) = self.terminal.write_input(data.as_bytes()) {
                    tracing::debug!(error = %err, "input write failed");
                }
            }
            ClientMessage::Resize { columns, rows } => {
                let _ = self.terminal.resize(clamp_dim(columns), clamp_dim(rows));
            }
            ClientMessage::Ping => {
                let _ = self
                    .send_text(conn, &ServerMessage::Pong, CONTROL_WRITE_TIMEOUT)
                    .await;
            }
            ClientMessage::Ack { bytes } => {
                let event = self.flow.lock().unwrap().on_ack(bytes);
                if event == FlowEvent::Resume {
                    self.broadcast_text(&ServerMessage::FlowResume {
                        message: "⚡ Output resumed".into(),
                    })
                    .await;
                }
            }
            // Auth after auth and app-level pongs change nothing.
            ClientMessage::Auth { .. } | ClientMessage::Pong => {}
        }
    }

    /// Fan a terminal chunk out to every client, then account for the sent
    /// bytes. Clients are snapshotted first so no I/O runs under the
    /// connection-set lock; a client whose write fails or times out is
    /// cancelled and reaped by its own reader task.
    async fn broadcast_binary(&self, data: &[u8]) {
        let conns = self.snapshot_conns();
        if conns.is_empty() {
            return;
        }
        let mut delivered = false;
        {
            let _guard = self.write_lock.lock().await;
            for conn in &conns {
                let mut sink = conn.sink.lock().await;
                match timeout(
                    BINARY_WRITE_TIMEOUT,
                    sink.send(Message::Binary(data.to_vec())),
                )
                .await
                {
                    Ok(Ok(())) => delivered = true,
                    _ => conn.cancel.cancel(),
                }
            }
        }
        if delivered {
            let event = self.flow.lock().unwrap().on_sent(data.len());
            if event == FlowEvent::Pause {
                self.broadcast_text(&ServerMessage::FlowPause {
                    message: "⏸️ Network is slow; pausing output to protect session".into(),
                })
                .await;
            }
        }
    }

    async fn broadcast_text(&self, msg: &ServerMessage) {
        let payload = msg.to_json();
        let conns = self.snapshot_conns();
        let _guard = self.write_lock.lock().await;
        for conn in &conns {
            let mut sink = conn.sink.lock().await;
            match timeout(TEXT_WRITE_TIMEOUT, sink.send(Message::Text(payload.clone()))).await {
                Ok(Ok(())) => {}
                _ => conn.cancel.cancel(),
            }
        }
    }

    fn snapshot_conns(&self) -> Vec<Arc<ClientConn>> {
        self.clients.lock().unwrap().values().cloned().collect()
    }

    async fn send_text(
        &self,
        conn: &ClientConn,
        msg: &ServerMessage,
        deadline: Duration,
    ) -> Result<(), ()> {
        let _guard = self.write_lock.lock().await;
        let mut sink = conn.sink.lock().await;
        match timeout(deadline, sink.send(Message::Text(msg.to_json()))).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(()),
        }
    }

    async fn send_ping(&self, conn: &ClientConn) -> Result<(), ()> {
        let _guard = self.write_lock.lock().await;
        let mut sink = conn.sink.lock().await;
        match timeout(
            CONTROL_WRITE_TIMEOUT,
            sink.send(Message::Ping(b"ping".to_vec())),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            _ => Err(()),
        }
    }

    async fn send_close(&self, conn: &ClientConn, code: u16, reason: &'static str) {
        let _guard = self.write_lock.lock().await;
        let mut sink = conn.sink.lock().await;
        let _ = timeout(
            CLOSE_WRITE_TIMEOUT,
            sink.send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            }))),
        )
        .await;
    }
}

/// Browsers report dimensions as plain integers; anything out of the pty
/// range collapses to 0, which the terminal ignores.
fn clamp_dim(value: i64) -> u16 {
    u16::try_from(value).unwrap_or(0)
}

/// Read frames until a parseable client message arrives or the handshake
/// deadline passes. Control frames are skipped; non-text data frames are a
/// protocol error at this stage.
async fn read_auth_frame(
    stream: &mut SplitStream<WebSocket>,
    deadline: tokio::time::Instant,
) -> Result<ClientMessage, String> {
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err("auth timed out".into());
        }
        let frame = match timeout(remaining, stream.next()).await {
            Err(_) => return Err("auth timed out".into()),
            Ok(None) => return Err("connection closed".into()),
            Ok(Some(Err(_))) => return Err("connection closed".into()),
            Ok(Some(Ok(frame))) => frame,
        };
        match frame {
            Message::Text(text) => {
                return serde_json::from_str::<ClientMessage>(&text)
                    .map_err(|_| "invalid auth payload".to_string());
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => return Err("connection closed".into()),
            Message::Binary(_) => return Err("expected auth message".into()),
        }
    }
}
