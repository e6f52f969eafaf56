//! Wire messages exchanged with the kernel service.
//!
//! After the handshake, every frame (see `frame.rs`) is an [`Envelope`]:
//! `{"event": "<name>", "data": {...}}`. [`ClientMessage`] and
//! [`ServerMessage`] are the typed views of the events this client knows.

use serde::{Deserialize, Serialize};

use crate::persistence::NotebookContent;

/// Event names used on the wire.
pub mod events {
    pub const EXECUTE_CELL: &str = "execute_cell";
    pub const SAVE_NOTEBOOK: &str = "save_notebook";
    pub const CELL_OUTPUT: &str = "cell_output";
    pub const SAVE_RESULT: &str = "save_result";
    pub const ERROR: &str = "error";

    // Local connectivity events, never sent on the wire
    pub const CONNECTED: &str = "connected";
    pub const DISCONNECTED: &str = "disconnected";
}

/// Untyped event frame. Inbound frames are read as envelopes first so that
/// events this client does not understand still reach name subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Reply to the session handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandshakeReply {
    /// Credential accepted; events may flow.
    Accepted {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Credential rejected. The client must obtain a fresh credential.
    Rejected { reason: String },
}

/// Events the client sends to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Run `code` for `cell_id`. Answered later by exactly one `cell_output`.
    ExecuteCell {
        notebook_path: String,
        cell_id: String,
        code: String,
    },
    /// Persist the notebook. Answered later by `save_result`.
    SaveNotebook {
        notebook_path: String,
        content: NotebookContent,
    },
}

impl ClientMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ClientMessage::ExecuteCell { .. } => events::EXECUTE_CELL,
            ClientMessage::SaveNotebook { .. } => events::SAVE_NOTEBOOK,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        serde_json::from_value(serde_json::to_value(self)?)
    }
}

/// Result of one `execute_cell` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellOutput {
    pub cell_id: String,
    #[serde(default)]
    pub output: String,
    /// Present when the code raised. Remote errors are cell data, not faults.
    #[serde(default)]
    pub error: Option<String>,
}

/// Acknowledgement of a `save_notebook` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SaveResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Request-level failure reported by the service (unauthorized request,
/// resource limit exceeded). `cell_id` is set when the failure belongs to an
/// `execute_cell` request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<String>,
}

/// Events the service sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMessage {
    CellOutput(CellOutput),
    SaveResult(SaveResult),
    Error(ServiceError),
}

impl ServerMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::CellOutput(_) => events::CELL_OUTPUT,
            ServerMessage::SaveResult(_) => events::SAVE_RESULT,
            ServerMessage::Error(_) => events::ERROR,
        }
    }
}

impl Envelope {
    /// Decode the typed message for a known event name.
    ///
    /// Returns `Ok(None)` for event names this client does not handle and an
    /// error when a known event carries a malformed payload.
    pub fn to_server_message(&self) -> Result<Option<ServerMessage>, serde_json::Error> {
        let data = self.data.clone();
        let message = match self.event.as_str() {
            events::CELL_OUTPUT => ServerMessage::CellOutput(serde_json::from_value(data)?),
            events::SAVE_RESULT => ServerMessage::SaveResult(serde_json::from_value(data)?),
            events::ERROR => ServerMessage::Error(serde_json::from_value(data)?),
            _ => return Ok(None),
        };
        Ok(Some(message))
    }
}
