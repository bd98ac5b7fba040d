//! WebSocket message envelope.
//!
//! Text frames carry one flat JSON shape tagged by `type`; binary frames are
//! raw terminal output. The browser UI consumes this format as-is, so the
//! wire shape must not change even though the variants are typed here.

use serde::{Deserialize, Serialize};

/// Messages the browser sends to the bridge. Unknown `type` values fail to
/// parse and are ignored by the reader, which keeps the connection open.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Auth {
        #[serde(default)]
        token: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        columns: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        rows: Option<i64>,
    },
    Input {
        #[serde(default)]
        data: String,
    },
    Resize {
        #[serde(default)]
        columns: i64,
        #[serde(default)]
        rows: i64,
    },
    Ack {
        #[serde(default)]
        bytes: i64,
    },
    Ping,
    /// Browsers may send an application-level pong besides the control-frame
    /// pong; it only refreshes the read deadline.
    Pong,
}

/// Messages the bridge sends to the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthOk,
    AuthError { message: String },
    Prefs { bytes: i64 },
    Readonly { message: String },
    Info { message: String },
    FlowPause { message: String },
    FlowResume { message: String },
    Pong,
}

impl ServerMessage {
    /// Serialize for a text frame. The envelope contains no unserializable
    /// values, so this cannot fail in practice; a fallback info frame keeps
    /// the signature infallible.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| r#"{"type":"info","message":"serialization error"}"#.to_string())
    }
}
