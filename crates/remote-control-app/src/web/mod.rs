// Session transport: protocol envelope, flow control, origin policy, the
// WebSocket hub, and the HTTP routes that expose it.

pub mod bridge;
pub mod flow;
pub mod origin;
pub mod protocol;
pub mod routes;

pub use bridge::{BridgeOptions, WsBridge};
pub use protocol::{ClientMessage, ServerMessage};
