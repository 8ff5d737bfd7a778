//! HTTP and WebSocket handlers for the collaboration API.

pub mod collab;
pub mod ws;

pub use collab::*;
pub use ws::ws_upgrade;
