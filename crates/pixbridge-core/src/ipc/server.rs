//! TCP listener that runs inside the host application.
//!
//! Serves one client session at a time. Each session reads a frame, hands the
//! command to the host's mutation thread through a [`MutationQueue`], writes the
//! response back, and only then reads the next frame.
//!
//! # Lifecycle
//!
//! `Idle -> Listening -> Serving -> Listening -> ... -> ShuttingDown -> Idle`.
//! The current state is published on a watch channel (see
//! [`ServerHandle::state`]). A failed session never takes the listener down.

use super::host::MutationQueue;
use super::protocol::{
    decode, encode, encode_frame, read_frame, write_encoded, CommandMessage, ResponseMessage,
};
use crate::config::ProtocolConfig;
use crate::error::{BridgeError, ErrorKind, Result};
use serde_json::Value;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What to do when a client connects while another session is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionPolicy {
    /// The newcomer wins; the old session is closed once its in-flight
    /// command has been answered.
    #[default]
    ReplaceExisting,
    /// The newcomer is closed immediately.
    RejectNew,
}

impl SessionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionPolicy::ReplaceExisting => "replace",
            SessionPolicy::RejectNew => "reject",
        }
    }

}

impl FromStr for SessionPolicy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "replace" => Ok(SessionPolicy::ReplaceExisting),
            "reject" => Ok(SessionPolicy::RejectNew),
            other => Err(BridgeError::Config {
                message: format!(
                    "unknown session policy '{}' (expected replace or reject)",
                    other
                ),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Idle,
    Listening,
    Serving { peer: SocketAddr },
    ShuttingDown,
}

/// Handle to a running listener. Dropping it shuts the listener down.
pub struct ServerHandle {
    pub addr: SocketAddr,
    pub port: u16,
    shutdown_tx: Option<oneshot::Sender<()>>,
    state_rx: watch::Receiver<ListenerState>,
    task_handle: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> ListenerState {
        *self.state_rx.borrow()
    }

    /// Wait until the listener reaches a state matching `predicate`.
    pub async fn wait_for_state<F>(&self, predicate: F) -> ListenerState
    where
        F: FnMut(&ListenerState) -> bool,
    {
        let mut rx = self.state_rx.clone();
        let reached = rx.wait_for(predicate).await.map(|state| *state);
        // If the accept loop is gone, whatever it last published is final.
        reached.unwrap_or_else(|_| *rx.borrow())
    }

    /// Signal the accept loop to stop. The active session (if any) finishes
    /// its current command and is closed.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }

    /// Shut down and wait until the listener is back to `Idle`.
    pub async fn stop(mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                error!("Listener task failed: {}", e);
            }
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

/// Accepts client sessions and feeds their commands to the mutation thread.
pub struct ServerListener {
    queue: MutationQueue,
    policy: SessionPolicy,
    max_frame_size: usize,
    close_grace: Duration,
}

struct ActiveSession {
    id: u64,
    peer: SocketAddr,
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ActiveSession {
    /// Ask the session to close and wait up to `grace` for it, then abort it.
    ///
    /// An aborted session's command still runs to completion on the mutation
    /// thread; only its response is lost.
    async fn close(self, grace: Duration) {
        self.stop_tx.send_replace(true);
        let mut task = self.task;
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Session {} with {} failed: {}", self.id, self.peer, e),
            Err(_) => {
                warn!(
                    "Session {} with {} did not stop within {:?}; aborting it",
                    self.id, self.peer, grace
                );
                task.abort();
            }
        }
    }
}

impl ServerListener {
    pub fn new(queue: MutationQueue) -> Self {
        Self {
            queue,
            policy: SessionPolicy::default(),
            max_frame_size: ProtocolConfig::MAX_FRAME_SIZE,
            close_grace: ProtocolConfig::SESSION_CLOSE_GRACE,
        }
    }

    pub fn with_policy(mut self, policy: SessionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// How long a replaced or shut-down session may take to finish.
    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    /// Bind `addr` and start accepting in a background task.
    ///
    /// Port 0 picks a free port; read it back from [`ServerHandle::port`].
    pub async fn start(self, addr: &str) -> Result<ServerHandle> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::ConnectionRefused {
                addr: addr.to_string(),
                message: format!("could not bind: {}", e),
            })?;
        let local = listener
            .local_addr()
            .map_err(|e| BridgeError::ConnectionRefused {
                addr: addr.to_string(),
                message: e.to_string(),
            })?;

        info!(
            "Listening on {} (session policy: {})",
            local,
            self.policy.as_str()
        );

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (state_tx, state_rx) = watch::channel(ListenerState::Listening);
        let task_handle = tokio::spawn(self.accept_loop(listener, shutdown_rx, state_tx));

        Ok(ServerHandle {
            addr: local,
            port: local.port(),
            shutdown_tx: Some(shutdown_tx),
            state_rx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        self,
        listener: TcpListener,
        mut shutdown_rx: oneshot::Receiver<()>,
        state_tx: watch::Sender<ListenerState>,
    ) {
        let (ended_tx, mut ended_rx) = mpsc::unbounded_channel::<u64>();
        let mut active: Option<ActiveSession> = None;
        let mut next_id: u64 = 0;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => break,
                Some(ended) = ended_rx.recv() => {
                    if active.as_ref().is_some_and(|s| s.id == ended) {
                        active = None;
                        state_tx.send_replace(ListenerState::Listening);
                    }
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            error!("Accept failed: {}", e);
                            continue;
                        }
                    };

                    if let Some(current) = active.take() {
                        match self.policy {
                            SessionPolicy::RejectNew => {
                                warn!("Rejecting {}: already serving {}", peer, current.peer);
                                active = Some(current);
                                drop(stream);
                                continue;
                            }
                            SessionPolicy::ReplaceExisting => {
                                info!("{} replaces the session with {}", peer, current.peer);
                                current.close(self.close_grace).await;
                            }
                        }
                    }

                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Could not set TCP_NODELAY for {}: {}", peer, e);
                    }

                    next_id += 1;
                    let id = next_id;
                    let (stop_tx, stop_rx) = watch::channel(false);
                    let queue = self.queue.clone();
                    let max_frame_size = self.max_frame_size;
                    let ended_tx = ended_tx.clone();

                    info!("Session {} opened by {}", id, peer);
                    let task = tokio::spawn(async move {
                        match serve_session(stream, &queue, max_frame_size, stop_rx).await {
                            Ok(served) => info!(
                                "Session {} with {} closed after {} command(s)",
                                id, peer, served
                            ),
                            Err(e) => warn!("Session {} with {} dropped: {}", id, peer, e),
                        }
                        let _ = ended_tx.send(id);
                    });

                    active = Some(ActiveSession { id, peer, stop_tx, task });
                    state_tx.send_replace(ListenerState::Serving { peer });
                }
            }
        }

        info!("Listener shutting down");
        state_tx.send_replace(ListenerState::ShuttingDown);
        drop(listener);
        if let Some(session) = active.take() {
            session.close(self.close_grace).await;
        }
        state_tx.send_replace(ListenerState::Idle);
    }
}

/// Serve one session until the peer leaves, the stream fails, or `stop` fires.
///
/// Strictly one command at a time: the next frame is not read until the
/// current response has been written. `stop` also interrupts a write the peer
/// is not reading. Returns the number of commands served.
pub async fn serve_session<S>(
    stream: S,
    queue: &MutationQueue,
    max_frame_size: usize,
    mut stop: watch::Receiver<bool>,
) -> Result<usize>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut served = 0;

    loop {
        let frame = tokio::select! {
            frame = read_frame(&mut reader, max_frame_size) => frame?,
            _ = stop.changed() => {
                debug!("Session asked to stop");
                return Ok(served);
            }
        };
        let Some(payload) = frame else {
            return Ok(served);
        };

        let command: CommandMessage = match decode(&payload) {
            Ok(command) => command,
            Err(e) => {
                // Tell the client which request failed, if the payload says.
                let response = ResponseMessage::error(
                    recover_request_id(&payload).unwrap_or_default(),
                    ErrorKind::MalformedFrame,
                    e.detail(),
                );
                let reported = match encode_response(response, max_frame_size) {
                    Ok(frame) => write_encoded(&mut writer, &frame).await,
                    Err(encode_err) => Err(encode_err),
                };
                if let Err(write_err) = reported {
                    debug!("Could not report malformed command: {}", write_err);
                }
                return Err(e);
            }
        };

        let operation = command.operation.clone();
        let response = queue.execute(command).await;
        if !response.is_ok() {
            debug!("'{}' answered with an error", operation);
        }
        let frame = encode_response(response, max_frame_size)?;

        tokio::select! {
            biased;
            written = write_encoded(&mut writer, &frame) => written?,
            _ = stop.changed() => {
                debug!("Session asked to stop while writing the '{}' response", operation);
                return Ok(served);
            }
        }
        served += 1;
    }
}

/// Frame a response. A result too large for one frame is replaced by an
/// error for the same request, so only that call fails.
fn encode_response(response: ResponseMessage, max_frame_size: usize) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(&response)?;
    if payload.len() <= max_frame_size {
        return encode_frame(&payload, max_frame_size);
    }

    warn!(
        "Response to request {} is {} bytes, over the {}-byte frame limit",
        response.request_id,
        payload.len(),
        max_frame_size
    );
    let replacement = ResponseMessage::error(
        response.request_id,
        ErrorKind::HandlerExecutionError,
        format!(
            "result of {} bytes exceeds frame limit {}",
            payload.len(),
            max_frame_size
        ),
    );
    encode(&replacement, max_frame_size)
}

fn recover_request_id(payload: &[u8]) -> Option<String> {
    let value: Value = serde_json::from_slice(payload).ok()?;
    value.get("request_id")?.as_str().map(str::to_string)
}
