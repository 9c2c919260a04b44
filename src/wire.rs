//! Wire message data model
//!
//! Message structure follows the Jupyter messaging spec: a header, an
//! optional parent header correlating replies and output back to the request
//! that caused them, a metadata mapping, a type-specific content payload, and
//! raw binary buffers for large payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Kernel wire protocol version spoken by this bridge.
pub const PROTOCOL_VERSION: &str = "5.3";

/// Username stamped into headers originated by the bridge.
const BRIDGE_USERNAME: &str = "ipykernel-mcp";

/// Wire message type names
pub mod msg_types {
    pub const EXECUTE_REQUEST: &str = "execute_request";
    pub const EXECUTE_REPLY: &str = "execute_reply";
    pub const STREAM: &str = "stream";
    pub const DISPLAY_DATA: &str = "display_data";
    pub const EXECUTE_RESULT: &str = "execute_result";
    pub const ERROR: &str = "error";
    pub const STATUS: &str = "status";
    pub const INTERRUPT_REQUEST: &str = "interrupt_request";
    pub const INTERRUPT_REPLY: &str = "interrupt_reply";
    pub const SHUTDOWN_REQUEST: &str = "shutdown_request";
    pub const SHUTDOWN_REPLY: &str = "shutdown_reply";
}

/// Message header.
///
/// Unknown fields are captured in `extra` and re-serialized unchanged so
/// protocol evolution never drops information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageHeader {
    pub msg_id: String,
    pub session: String,
    pub username: String,
    pub date: DateTime<Utc>,
    pub msg_type: String,
    pub version: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MessageHeader {
    /// Create a fresh header with a unique message id.
    pub fn new(session: &str, msg_type: &str) -> Self {
        Self {
            msg_id: Uuid::new_v4().to_string(),
            session: session.to_string(),
            username: BRIDGE_USERNAME.to_string(),
            date: Utc::now(),
            msg_type: msg_type.to_string(),
            version: PROTOCOL_VERSION.to_string(),
            extra: Map::new(),
        }
    }
}

/// One parsed wire message.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub header: MessageHeader,
    /// Correlation back to the triggering request; `None` serializes as the
    /// empty dict the protocol uses for unparented messages.
    pub parent_header: Option<MessageHeader>,
    pub metadata: Map<String, Value>,
    pub content: Value,
    pub buffers: Vec<Vec<u8>>,
}

impl WireMessage {
    /// Build a fresh request message with no parent.
    pub fn request(session: &str, msg_type: &str, content: Value) -> Self {
        Self {
            header: MessageHeader::new(session, msg_type),
            parent_header: None,
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
        }
    }

    /// Build a message parented to `parent`, as a kernel would reply.
    pub fn child(parent: &WireMessage, msg_type: &str, content: Value) -> Self {
        Self {
            header: MessageHeader::new(&parent.header.session, msg_type),
            parent_header: Some(parent.header.clone()),
            metadata: Map::new(),
            content,
            buffers: Vec::new(),
        }
    }

    /// An `execute_request` carrying `code`, with the standard execution
    /// options the protocol expects.
    pub fn execute_request(session: &str, code: &str) -> Self {
        Self::request(
            session,
            msg_types::EXECUTE_REQUEST,
            json!({
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
        )
    }

    /// An `interrupt_request` for the control channel.
    pub fn interrupt_request(session: &str) -> Self {
        Self::request(session, msg_types::INTERRUPT_REQUEST, json!({}))
    }

    /// A `shutdown_request` for the control channel; `restart: true` asks the
    /// kernel to come back up with a clean namespace.
    pub fn shutdown_request(session: &str, restart: bool) -> Self {
        Self::request(
            session,
            msg_types::SHUTDOWN_REQUEST,
            json!({ "restart": restart }),
        )
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn msg_type(&self) -> &str {
        &self.header.msg_type
    }

    /// Message id of the originating request, if any.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_header.as_ref().map(|h| h.msg_id.as_str())
    }

    /// String field accessor into the content payload.
    pub fn content_str(&self, key: &str) -> Option<&str> {
        self.content.get(key).and_then(Value::as_str)
    }
}
