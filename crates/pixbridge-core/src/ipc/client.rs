//! Client side of the command bridge.
//!
//! [`ClientBridge`] owns one TCP connection to the host and multiplexes any
//! number of concurrent calls over it:
//!
//! - every call gets a fresh request id and a waiter in the connection's pending table
//! - a writer task owns the write half, so frames go out whole and one at a time
//! - a reader task owns the read half and routes each response purely by request id
//!
//! When the transport fails, every pending waiter receives `ConnectionLost` and
//! the next call reconnects once before sending.

use super::protocol::{decode, encode, read_frame, write_encoded, CommandMessage, ResponseMessage};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::retry::{retry_async, RetryConfig};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle of the bridge's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Shutting down: no new calls, in-flight calls may still finish.
    Draining,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Draining => "draining",
        }
    }
}

type Waiter = oneshot::Sender<Result<ResponseMessage>>;

#[derive(Default)]
struct PendingTable {
    /// Set once the connection has failed or been closed; carries the reason.
    closed: Option<String>,
    waiters: HashMap<String, Waiter>,
}

/// One physical connection and the calls waiting on it.
struct Connection {
    id: u64,
    peer: String,
    outbox: mpsc::UnboundedSender<Vec<u8>>,
    pending: Mutex<PendingTable>,
    idle: Notify,
    shutdown: watch::Sender<bool>,
}

impl Connection {
    fn open(id: u64, peer: String, stream: TcpStream, max_frame_size: usize) -> Arc<Self> {
        let (reader, writer) = stream.into_split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        let conn = Arc::new(Self {
            id,
            peer,
            outbox,
            pending: Mutex::new(PendingTable::default()),
            idle: Notify::new(),
            shutdown,
        });

        tokio::spawn(read_loop(
            conn.clone(),
            reader,
            max_frame_size,
            conn.shutdown.subscribe(),
        ));
        tokio::spawn(write_loop(
            conn.clone(),
            writer,
            outbox_rx,
            conn.shutdown.subscribe(),
        ));

        conn
    }

    async fn is_closed(&self) -> bool {
        self.pending.lock().await.closed.is_some()
    }

    async fn pending_count(&self) -> usize {
        self.pending.lock().await.waiters.len()
    }

    /// Register a waiter for `request_id`; fails if the connection is already gone.
    async fn register(
        &self,
        request_id: &str,
    ) -> Result<oneshot::Receiver<Result<ResponseMessage>>> {
        let mut table = self.pending.lock().await;
        if let Some(reason) = &table.closed {
            return Err(BridgeError::lost(reason.clone()));
        }
        let (tx, rx) = oneshot::channel();
        table.waiters.insert(request_id.to_string(), tx);
        Ok(rx)
    }

    /// Hand a response to its waiter, if it is still waiting.
    async fn resolve(&self, response: ResponseMessage) {
        let mut table = self.pending.lock().await;
        match table.waiters.remove(&response.request_id) {
            Some(waiter) => {
                if waiter.send(Ok(response)).is_err() {
                    debug!("Caller stopped waiting before its response arrived");
                }
            }
            None => debug!(
                "Discarding response for unknown or expired request {}",
                response.request_id
            ),
        }
        if table.waiters.is_empty() {
            self.idle.notify_waiters();
        }
    }

    /// Drop a waiter without resolving it (the caller timed out or never sent).
    async fn forget(&self, request_id: &str) {
        let mut table = self.pending.lock().await;
        table.waiters.remove(request_id);
        if table.waiters.is_empty() {
            self.idle.notify_waiters();
        }
    }

    fn send(&self, frame: Vec<u8>) -> Result<()> {
        self.outbox
            .send(frame)
            .map_err(|_| BridgeError::lost("connection writer has stopped"))
    }

    /// Close the connection and fail every pending call. Returns how many were failed.
    ///
    /// Only the first close has any effect.
    async fn close(&self, reason: &str) -> usize {
        let waiters = {
            let mut table = self.pending.lock().await;
            if table.closed.is_some() {
                return 0;
            }
            table.closed = Some(reason.to_string());
            std::mem::take(&mut table.waiters)
        };
        self.shutdown.send_replace(true);

        let failed = waiters.len();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(BridgeError::lost(reason.to_string())));
        }
        self.idle.notify_waiters();
        failed
    }

    /// Wait until no calls are pending.
    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending.lock().await.waiters.is_empty() {
                return;
            }
            notified.await;
        }
    }
}

async fn read_loop(
    conn: Arc<Connection>,
    mut reader: OwnedReadHalf,
    max_frame_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    let reason = loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, max_frame_size) => frame,
            _ = shutdown.changed() => return,
        };

        match frame {
            Ok(Some(payload)) => match decode::<ResponseMessage>(&payload) {
                Ok(response) => conn.resolve(response).await,
                Err(e) => break format!("unreadable response from {}: {}", conn.peer, e),
            },
            Ok(None) => break format!("{} closed the connection", conn.peer),
            Err(e) => break e.to_string(),
        }
    };

    let failed = conn.close(&reason).await;
    warn!(
        "Connection {} to {} lost ({} pending call(s) failed): {}",
        conn.id, conn.peer, failed, reason
    );
}

async fn write_loop(
    conn: Arc<Connection>,
    mut writer: OwnedWriteHalf,
    mut outbox: mpsc::UnboundedReceiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            frame = outbox.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        if let Err(e) = write_encoded(&mut writer, &frame).await {
            let failed = conn.close(&e.to_string()).await;
            warn!(
                "Write to {} failed ({} pending call(s) failed): {}",
                conn.peer, failed, e
            );
            break;
        }
    }
    let _ = writer.shutdown().await;
}

struct BridgeState {
    status: ConnectionStatus,
    connection: Option<Arc<Connection>>,
    connections_opened: u64,
}

/// Shared client for one host.
///
/// Construct it once at process start and hand it to the
/// [`Dispatcher`](crate::dispatch::Dispatcher) by reference (or `Arc`). The
/// connection is opened lazily on the first call.
pub struct ClientBridge {
    config: BridgeConfig,
    state: Mutex<BridgeState>,
}

impl ClientBridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BridgeState {
                status: ConnectionStatus::Disconnected,
                connection: None,
                connections_opened: 0,
            }),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Current status. A connection that failed since the last call reports
    /// `Disconnected`.
    pub async fn status(&self) -> ConnectionStatus {
        let mut state = self.state.lock().await;
        if state.status == ConnectionStatus::Connected {
            let closed = match &state.connection {
                Some(conn) => conn.is_closed().await,
                None => true,
            };
            if closed {
                state.connection = None;
                state.status = ConnectionStatus::Disconnected;
            }
        }
        state.status
    }

    /// Number of calls waiting for a response.
    pub async fn pending_count(&self) -> usize {
        let conn = self.state.lock().await.connection.clone();
        match conn {
            Some(conn) => conn.pending_count().await,
            None => 0,
        }
    }

    /// Open the connection if there is none. Idempotent.
    pub async fn connect(&self) -> Result<()> {
        self.ensure_connected().await.map(|_| ())
    }

    /// Keep trying [`connect`](Self::connect) with backoff until the host answers.
    pub async fn connect_with_retry(&self, retry: &RetryConfig) -> Result<()> {
        let (result, attempts) =
            retry_async(retry, || self.connect(), BridgeError::is_retryable).await;
        if result.is_ok() && attempts > 1 {
            info!("Connected to {} after {} attempts", self.config.address(), attempts);
        }
        result
    }

    /// Send `operation` and wait for its result.
    ///
    /// `timeout` bounds only the wait for the response; `None` uses the
    /// configured default. Error responses come back as the matching
    /// [`BridgeError`] variant.
    pub async fn call(
        &self,
        operation: &str,
        arguments: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.request(operation, arguments, timeout)
            .await?
            .into_result(operation)
    }

    /// Like [`call`](Self::call) but returns the raw response message.
    pub async fn request(
        &self,
        operation: &str,
        arguments: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> Result<ResponseMessage> {
        let timeout = timeout.unwrap_or(self.config.timeout);
        let conn = self.ensure_connected().await?;

        let request_id = Uuid::new_v4().to_string();
        let command = CommandMessage::new(operation, arguments, request_id.clone());
        let frame = encode(&command, self.config.max_frame_size)?;

        let rx = conn.register(&request_id).await?;
        if let Err(e) = conn.send(frame) {
            conn.forget(&request_id).await;
            return Err(e);
        }
        debug!("Sent '{}' as request {}", operation, request_id);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::lost(
                "connection dropped before a response arrived",
            )),
            Err(_) => {
                conn.forget(&request_id).await;
                warn!(
                    "'{}' (request {}) timed out after {:?}",
                    operation, request_id, timeout
                );
                Err(BridgeError::Timeout {
                    operation: operation.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Stop accepting calls, give in-flight calls up to `grace` to finish,
    /// then close the connection. Calls still pending after that fail with
    /// `ConnectionLost`. The bridge ends up `Disconnected` and reconnects on
    /// the next call.
    pub async fn shutdown(&self, grace: Duration) {
        let conn = {
            let mut state = self.state.lock().await;
            if state.connection.is_some() {
                state.status = ConnectionStatus::Draining;
            }
            state.connection.clone()
        };

        if let Some(conn) = conn {
            if tokio::time::timeout(grace, conn.wait_idle()).await.is_err() {
                warn!("Grace period of {:?} elapsed with calls still pending", grace);
            }
            let failed = conn.close("bridge shut down").await;
            info!(
                "Closed connection {} to {} ({} call(s) abandoned)",
                conn.id, conn.peer, failed
            );
        }

        let mut state = self.state.lock().await;
        state.connection = None;
        state.status = ConnectionStatus::Disconnected;
    }

    /// Close the connection immediately.
    pub async fn disconnect(&self) {
        self.shutdown(Duration::ZERO).await;
    }

    async fn ensure_connected(&self) -> Result<Arc<Connection>> {
        let mut state = self.state.lock().await;

        if state.status == ConnectionStatus::Draining {
            return Err(BridgeError::lost("bridge is shutting down"));
        }

        if let Some(conn) = &state.connection {
            if !conn.is_closed().await {
                return Ok(conn.clone());
            }
            info!("Previous connection to {} was lost; reconnecting", conn.peer);
            state.connection = None;
        }

        state.status = ConnectionStatus::Connecting;
        let addr = self.config.address();
        let stream =
            match tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(&addr))
                .await
            {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    state.status = ConnectionStatus::Disconnected;
                    return Err(BridgeError::ConnectionRefused {
                        addr,
                        message: e.to_string(),
                    });
                }
                Err(_) => {
                    state.status = ConnectionStatus::Disconnected;
                    return Err(BridgeError::ConnectionRefused {
                        addr,
                        message: format!(
                            "no answer within {:?}",
                            self.config.connect_timeout
                        ),
                    });
                }
            };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY: {}", e);
        }

        state.connections_opened += 1;
        let conn = Connection::open(
            state.connections_opened,
            addr,
            stream,
            self.config.max_frame_size,
        );
        info!("Connected to {} (connection {})", conn.peer, conn.id);

        state.status = ConnectionStatus::Connected;
        state.connection = Some(conn.clone());
        Ok(conn)
    }
}

impl Drop for ClientBridge {
    fn drop(&mut self) {
        if let Some(conn) = self.state.get_mut().connection.take() {
            conn.shutdown.send_replace(true);
        }
    }
}
