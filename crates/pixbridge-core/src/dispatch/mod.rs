//! Client-side command dispatcher.
//!
//! Thin translation layer above the [`ClientBridge`]: look up the operation,
//! validate its arguments, forward the call, then shape the reply into an
//! [`OperationOutcome`]. Failures of any kind come back as an outcome with
//! `success == false` and a stable error kind; nothing is raised to the caller.

pub mod operations;
pub mod outcome;

pub use operations::{
    BitmapRequest, Execute, GetContextState, GetHostInfo, GetImageBitmap, GetImageMetadata,
    Operation, PreparedCall, Region,
};
pub use outcome::{OperationOutcome, OutcomeError};

use crate::error::{BridgeError, Result};
use crate::ipc::ClientBridge;
use crate::payload::take_binary_fields;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub struct Dispatcher {
    bridge: Arc<ClientBridge>,
    operations: HashMap<&'static str, Box<dyn Operation>>,
}

impl Dispatcher {
    /// Dispatcher with the built-in catalog registered.
    pub fn new(bridge: Arc<ClientBridge>) -> Self {
        let mut dispatcher = Self::empty(bridge);
        for op in operations::builtin() {
            dispatcher.operations.insert(op.name(), op);
        }
        dispatcher
    }

    pub fn empty(bridge: Arc<ClientBridge>) -> Self {
        Self {
            bridge,
            operations: HashMap::new(),
        }
    }

    /// Add or replace an operation.
    pub fn register<O: Operation + 'static>(&mut self, op: O) -> &mut Self {
        self.operations.insert(op.name(), Box::new(op));
        self
    }

    pub fn bridge(&self) -> &ClientBridge {
        &self.bridge
    }

    /// Registered operations, sorted by name.
    pub fn operations(&self) -> Vec<&dyn Operation> {
        let mut ops: Vec<&dyn Operation> = self.operations.values().map(|op| op.as_ref()).collect();
        ops.sort_by_key(|op| op.name());
        ops
    }

    pub fn operation(&self, name: &str) -> Option<&dyn Operation> {
        self.operations.get(name).map(|op| op.as_ref())
    }

    /// Validate and run a registered operation.
    pub async fn invoke(&self, name: &str, arguments: Map<String, Value>) -> OperationOutcome {
        let Some(op) = self.operation(name) else {
            let err = BridgeError::UnknownOperation {
                operation: name.to_string(),
            };
            return self.failed(name, err);
        };

        let call = match op.prepare(arguments, self.bridge.config()) {
            Ok(call) => call,
            Err(err) => return self.failed(name, err),
        };

        match self.bridge.call(name, call.arguments, Some(call.timeout)).await {
            Ok(data) => match shape(op, data) {
                Ok(outcome) => outcome,
                Err(err) => self.failed(name, err),
            },
            Err(err) => self.failed(name, err),
        }
    }

    /// Send any operation as is: no validation, no binary decoding.
    ///
    /// For host handlers the client has no catalog entry for.
    pub async fn invoke_raw(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        timeout: Option<Duration>,
    ) -> OperationOutcome {
        match self.bridge.call(name, arguments, timeout).await {
            Ok(data) => {
                OperationOutcome::ok(name, format!("{} completed", name), data, HashMap::new())
            }
            Err(err) => self.failed(name, err),
        }
    }

    pub async fn get_image_bitmap(&self, request: &BitmapRequest) -> OperationOutcome {
        let op = GetImageBitmap.name();
        match operations::to_map(request) {
            Ok(arguments) => self.invoke(op, arguments).await,
            Err(err) => self.failed(op, err),
        }
    }

    pub async fn get_image_metadata(&self) -> OperationOutcome {
        self.invoke(GetImageMetadata.name(), Map::new()).await
    }

    pub async fn get_context_state(&self) -> OperationOutcome {
        self.invoke(GetContextState.name(), Map::new()).await
    }

    pub async fn get_host_info(&self) -> OperationOutcome {
        self.invoke(GetHostInfo.name(), Map::new()).await
    }

    /// Run native host steps. `timeout` is capped at the long timeout.
    pub async fn execute(&self, steps: Vec<Value>, timeout: Option<Duration>) -> OperationOutcome {
        let mut arguments = Map::new();
        arguments.insert("steps".to_string(), Value::Array(steps));
        if let Some(timeout) = timeout {
            arguments.insert(
                Execute::TIMEOUT_FIELD.to_string(),
                Value::from(timeout.as_secs_f64()),
            );
        }
        self.invoke(Execute.name(), arguments).await
    }

    fn failed(&self, name: &str, err: BridgeError) -> OperationOutcome {
        if err.is_retryable() {
            warn!("'{}' failed (retryable): {}", name, err);
        } else {
            debug!("'{}' failed: {}", name, err);
        }
        OperationOutcome::failed(name, &err)
    }
}

fn shape(op: &dyn Operation, mut data: Value) -> Result<OperationOutcome> {
    let attachments = take_binary_fields(&mut data, op.binary_fields())?;
    let message = op.describe(&data);
    Ok(OperationOutcome::ok(op.name(), message, data, attachments))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::error::HandlerError;
    use crate::ipc::{HandlerRegistry, MutationQueue, ServerHandle, ServerListener};
    use crate::payload::ImagePayload;
    use serde_json::json;

    fn bridge_to(port: u16) -> Arc<ClientBridge> {
        Arc::new(ClientBridge::new(BridgeConfig {
            host: "127.0.0.1".to_string(),
            port,
            ..BridgeConfig::default()
        }))
    }

    async fn host() -> ServerHandle {
        let mut registry = HandlerRegistry::new();
        registry
            .register("get_image_bitmap", |_: &mut (), args| {
                let region = args.get("region").cloned().unwrap_or(Value::Null);
                let ppm = b"P6\n2 1\n255\n\x00\x00\x00\xff\xff\xff";
                let payload = ImagePayload::new(ppm, "ppm", (2, 1), (2, 1));
                let mut value = serde_json::to_value(payload)?;
                value["region"] = region;
                Ok(value)
            })
            .register("get_host_info", |_: &mut (), _| Ok(json!({"host": "test"})))
            .register("get_context_state", |_: &mut (), _| {
                Err(HandlerError::execution("no active context"))
            })
            .register("custom", |_: &mut (), args| Ok(Value::Object(args)));
        let (queue, _thread) = MutationQueue::spawn((), registry).unwrap();
        ServerListener::new(queue).start("127.0.0.1:0").await.unwrap()
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_bitmap_bytes_become_attachment() {
        let server = host().await;
        let dispatcher = Dispatcher::new(bridge_to(server.port));

        let request = BitmapRequest {
            max_width: Some(64),
            region: Some(Region {
                origin_x: 0,
                origin_y: 0,
                width: 2,
                height: 1,
            }),
            ..BitmapRequest::default()
        };
        let outcome = dispatcher.get_image_bitmap(&request).await;

        assert!(outcome.success, "{:?}", outcome.error);
        assert_eq!(outcome.message.as_deref(), Some("Captured 2x1 image"));
        let data = outcome.data.as_ref().unwrap();
        assert!(data.get("image_data").is_none());
        assert_eq!(data["format"], "ppm");
        assert_eq!(data["region"]["width"], 2);
        assert!(outcome.attachment("image_data").unwrap().starts_with(b"P6"));
    }

    #[tokio::test]
    async fn test_host_failure_is_structured() {
        let server = host().await;
        let dispatcher = Dispatcher::new(bridge_to(server.port));

        let outcome = dispatcher.get_context_state().await;
        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, "HandlerExecutionError");
        assert_eq!(error.message, "no active context");
        assert!(!error.retryable);
    }

    #[tokio::test]
    async fn test_validation_fails_before_connecting() {
        let dispatcher = Dispatcher::new(bridge_to(unused_port()));

        let mut arguments = Map::new();
        arguments.insert("region_x".to_string(), json!(3));
        let outcome = dispatcher.invoke("get_image_bitmap", arguments).await;

        assert_eq!(outcome.error_kind(), Some("ValidationError"));
        assert!(!outcome.is_retryable());
        assert_eq!(
            dispatcher.bridge().status().await,
            crate::ipc::ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_unregistered_operation_is_rejected_locally() {
        let dispatcher = Dispatcher::new(bridge_to(unused_port()));
        let outcome = dispatcher.invoke("blur_everything", Map::new()).await;
        assert_eq!(outcome.error_kind(), Some("UnknownOperation"));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_retryable() {
        let dispatcher = Dispatcher::new(bridge_to(unused_port()));
        let outcome = dispatcher.get_host_info().await;
        assert_eq!(outcome.error_kind(), Some("ConnectionRefused"));
        assert!(outcome.is_retryable());
    }

    #[tokio::test]
    async fn test_invoke_raw_reaches_any_handler() {
        let server = host().await;
        let dispatcher = Dispatcher::new(bridge_to(server.port));

        let mut arguments = Map::new();
        arguments.insert("k".to_string(), json!("v"));
        let outcome = dispatcher.invoke_raw("custom", arguments, None).await;
        assert_eq!(outcome.data, Some(json!({"k": "v"})));

        let outcome = dispatcher.invoke_raw("missing", Map::new(), None).await;
        assert_eq!(outcome.error_kind(), Some("UnknownOperation"));

        // The unknown operation did not cost the connection.
        assert!(dispatcher.get_host_info().await.success);
    }

    #[test]
    fn test_operations_listed_by_name() {
        let dispatcher = Dispatcher::new(bridge_to(1));
        let names: Vec<_> = dispatcher.operations().iter().map(|op| op.name()).collect();
        assert_eq!(
            names,
            vec![
                "execute",
                "get_context_state",
                "get_host_info",
                "get_image_bitmap",
                "get_image_metadata"
            ]
        );
    }
}
