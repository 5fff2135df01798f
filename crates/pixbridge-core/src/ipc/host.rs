//! Host-side command execution on the application's mutation thread.
//!
//! The host application only allows its state to be touched from one thread.
//! [`MutationLoop`] owns that state together with the [`HandlerRegistry`] and
//! runs on the thread the host designates; everything else talks to it through
//! a cloneable [`MutationQueue`], which posts one job at a time and waits for
//! the reply.

use super::protocol::{CommandMessage, ResponseMessage};
use crate::error::{ErrorKind, HandlerError};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

type BoxedHandler<S> =
    Box<dyn Fn(&mut S, Map<String, Value>) -> Result<Value, HandlerError> + Send + 'static>;

/// Named handlers for one host state type.
pub struct HandlerRegistry<S> {
    handlers: HashMap<String, BoxedHandler<S>>,
}

impl<S> Default for HandlerRegistry<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S> HandlerRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler under `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> &mut Self
    where
        F: Fn(&mut S, Map<String, Value>) -> Result<Value, HandlerError> + Send + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered operation names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Run one command against `state` and build its response.
    ///
    /// Unknown operations, handler errors and handler panics all become error
    /// responses; nothing escapes to the caller.
    pub fn dispatch(&self, state: &mut S, command: CommandMessage) -> ResponseMessage {
        let CommandMessage {
            operation,
            arguments,
            request_id,
        } = command;

        let Some(handler) = self.handlers.get(&operation) else {
            debug!("No handler for operation '{}'", operation);
            return ResponseMessage::error(
                request_id,
                ErrorKind::UnknownOperation,
                format!("Unknown operation: {}", operation),
            );
        };

        match catch_unwind(AssertUnwindSafe(|| handler(state, arguments))) {
            Ok(Ok(result)) => ResponseMessage::ok(request_id, result),
            Ok(Err(err)) => {
                debug!("Handler '{}' failed: {}", operation, err);
                ResponseMessage::from_handler_error(request_id, err)
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!("Handler '{}' panicked: {}", operation, reason);
                ResponseMessage::error(
                    request_id,
                    ErrorKind::HandlerExecutionError,
                    format!("handler panicked: {}", reason),
                )
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

struct Job {
    command: CommandMessage,
    reply: oneshot::Sender<ResponseMessage>,
}

/// Handle for posting commands to the mutation thread.
#[derive(Clone)]
pub struct MutationQueue {
    tx: mpsc::Sender<Job>,
}

impl MutationQueue {
    /// Create a queue and the loop that drains it.
    ///
    /// The loop must be driven with [`MutationLoop::run`] on the host's mutation
    /// thread. The queue holds at most one waiting job per sender; the listener
    /// only ever has one command in flight.
    pub fn new<S>(state: S, registry: HandlerRegistry<S>) -> (Self, MutationLoop<S>) {
        let (tx, rx) = mpsc::channel(1);
        (
            Self { tx },
            MutationLoop {
                state,
                registry,
                rx,
            },
        )
    }

    /// Spawn a dedicated OS thread to act as the mutation thread.
    ///
    /// For hosts that do not already have a designated thread of their own.
    pub fn spawn<S>(
        state: S,
        registry: HandlerRegistry<S>,
    ) -> std::io::Result<(Self, JoinHandle<S>)>
    where
        S: Send + 'static,
    {
        let (queue, mutation_loop) = Self::new(state, registry);
        let handle = std::thread::Builder::new()
            .name("pixbridge-mutation".to_string())
            .spawn(move || mutation_loop.run())?;
        Ok((queue, handle))
    }

    /// Execute a command on the mutation thread and wait for its response.
    ///
    /// If the loop has stopped, the command is answered with an execution
    /// error instead.
    pub async fn execute(&self, command: CommandMessage) -> ResponseMessage {
        let request_id = command.request_id.clone();
        let (reply, rx) = oneshot::channel();

        if self.tx.send(Job { command, reply }).await.is_err() {
            return ResponseMessage::error(
                request_id,
                ErrorKind::HandlerExecutionError,
                "host mutation thread has stopped",
            );
        }

        rx.await.unwrap_or_else(|_| {
            ResponseMessage::error(
                request_id,
                ErrorKind::HandlerExecutionError,
                "host mutation thread dropped the command",
            )
        })
    }

    /// Whether the mutation loop is still accepting work.
    pub fn is_running(&self) -> bool {
        !self.tx.is_closed()
    }
}

/// Single consumer of the [`MutationQueue`]; owns the host state.
pub struct MutationLoop<S> {
    state: S,
    registry: HandlerRegistry<S>,
    rx: mpsc::Receiver<Job>,
}

impl<S> MutationLoop<S> {
    /// Process jobs until every queue handle is dropped, then hand the state back.
    ///
    /// Blocks the calling thread; must not be called from inside an async task.
    pub fn run(mut self) -> S {
        info!(
            "Mutation loop started with {} handler(s)",
            self.registry.handlers.len()
        );
        while let Some(job) = self.rx.blocking_recv() {
            self.run_job(job);
        }
        info!("Mutation loop stopped");
        self.state
    }

    /// Process whatever jobs are already queued without blocking.
    ///
    /// For hosts that own an event loop and poll from an idle callback.
    pub fn run_pending(&mut self) -> usize {
        let mut processed = 0;
        while let Ok(job) = self.rx.try_recv() {
            self.run_job(job);
            processed += 1;
        }
        processed
    }

    fn run_job(&mut self, job: Job) {
        let Job { command, reply } = job;
        debug!(
            "Executing '{}' (request {})",
            command.operation, command.request_id
        );
        let response = self.registry.dispatch(&mut self.state, command);
        if reply.send(response).is_err() {
            debug!("Command caller went away before the response was ready");
        }
    }
}
