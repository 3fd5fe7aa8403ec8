//! Session protocol spoken over the websocket.
//!
//! # Modules
//!
//! - [`messages`]: frame shapes in both directions
//! - [`error`]: protocol errors and their wire codes
//! - [`session`]: per-connection state and compilation cache
//! - [`dispatch`]: routing of one client frame to its handler
//! - [`connection_handler`]: the read/dispatch/reply loop of one connection

pub mod connection_handler;
pub mod dispatch;
pub mod error;
pub mod messages;
pub mod session;

pub use dispatch::{CloseReason, DispatchOutcome, Dispatcher};
pub use error::{ErrorCode, ProtocolError, ProtocolResult};
pub use messages::{MessageKind, ServerMessage, SessionExport, SignedExport};
pub use session::{CompilationCache, ProtocolSession, SessionId, SessionState};
