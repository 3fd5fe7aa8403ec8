//! templar-daemon: websocket front end for the templar contract compiler.
//!
//! A client connects, receives the template menu and a session id, then
//! creates, saves, exports and binds contracts one message at a time. The
//! library exposes the pieces so tests and embedders can assemble a server
//! without the binary.

pub mod auth;
pub mod metrics;
pub mod protocol;
pub mod server;
pub mod state;
pub mod store;

pub use state::{ServerState, SharedState, StateError};
