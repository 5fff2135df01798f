//! TCP command bridge between a tool-calling process and a host application.
//!
//! Length-prefixed JSON frames over one TCP stream per session.
//!
//! # Architecture
//!
//! - **Protocol**: frame codec and message types shared by both ends
//! - **Client**: [`ClientBridge`], one connection multiplexing concurrent calls
//! - **Server**: [`ServerListener`], one session at a time, strict request-then-response order
//! - **Host**: [`MutationQueue`], the hand-off to the host's single mutation thread

pub mod client;
pub mod host;
pub mod protocol;
pub mod server;

pub use client::{ClientBridge, ConnectionStatus};
pub use host::{HandlerRegistry, MutationLoop, MutationQueue};
pub use protocol::{CommandMessage, ErrorBody, ResponseMessage, ResponseStatus};
pub use server::{serve_session, ListenerState, ServerHandle, ServerListener, SessionPolicy};
