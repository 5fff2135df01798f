//! Pixbridge - command bridge between a tool-calling process and an image editor.
//!
//! The host application (an image editor with one thread allowed to touch its
//! state) embeds a [`ServerListener`]; the tool-calling side owns one
//! [`ClientBridge`] and talks to it through a [`Dispatcher`].
//!
//! # Example
//!
//! ```rust,ignore
//! use pixbridge::{BridgeConfig, ClientBridge, Dispatcher};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> pixbridge::Result<()> {
//!     let bridge = Arc::new(ClientBridge::new(BridgeConfig::from_env()?));
//!     let dispatcher = Dispatcher::new(bridge.clone());
//!
//!     let info = dispatcher.get_host_info().await;
//!     println!("{}", serde_json::to_string_pretty(&info).unwrap());
//!
//!     bridge.shutdown(std::time::Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatch;
pub mod error;
pub mod ipc;
pub mod payload;
pub mod retry;

pub use config::{BridgeConfig, EnvVars, ProtocolConfig};
pub use dispatch::{BitmapRequest, Dispatcher, Operation, OperationOutcome, OutcomeError, Region};
pub use error::{BridgeError, ErrorKind, HandlerError, Result};
pub use ipc::{
    ClientBridge, CommandMessage, ConnectionStatus, HandlerRegistry, ListenerState, MutationLoop,
    MutationQueue, ResponseMessage, ServerHandle, ServerListener, SessionPolicy,
};
pub use payload::ImagePayload;
pub use retry::RetryConfig;
