//! WebSocket wire protocol between `tally-store` and its clients.
//!
//! JSON text frames, one message per frame, tagged by `type`. Requests carry
//! an `id` echoed by the matching response; `changed` pushes are unsolicited.
//!
//! Documents travel as raw JSON (`state` and `record`) so the store never
//! needs to understand the application schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::model::UserId;

/// Maximum frame size (16MB).
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid message: {0}")]
    Invalid(#[from] serde_json::Error),

    #[error("Message too large: {0} bytes")]
    TooLarge(usize),
}

pub type RequestId = u64;

/// Client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    Load { id: RequestId, user_id: UserId },
    /// Conditional write: stored only if `timestamp` is newer than the document.
    #[serde(rename_all = "camelCase")]
    Save {
        id: RequestId,
        user_id: UserId,
        state: Value,
        timestamp: i64,
    },
    /// Unconditional write stamped by the server.
    #[serde(rename_all = "camelCase")]
    ForceSave {
        id: RequestId,
        user_id: UserId,
        state: Value,
    },
    #[serde(rename_all = "camelCase")]
    Subscribe { user_id: UserId },
    #[serde(rename_all = "camelCase")]
    Unsubscribe { user_id: UserId },
}

/// Server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Loaded {
        id: RequestId,
        record: Option<Value>,
    },
    Saved {
        id: RequestId,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    Rejected {
        id: RequestId,
        remote_updated_at: Option<i64>,
    },
    /// Push: the document for `user_id` changed (or is reported on subscribe).
    #[serde(rename_all = "camelCase")]
    Changed {
        user_id: UserId,
        record: Option<Value>,
    },
    Error {
        id: Option<RequestId>,
        message: String,
    },
}

impl ClientMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ClientMessage serialization should not fail")
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        check_size(text)?;
        Ok(serde_json::from_str(text)?)
    }

    /// Request id, if this message expects a response.
    pub fn id(&self) -> Option<RequestId> {
        match self {
            ClientMessage::Load { id, .. }
            | ClientMessage::Save { id, .. }
            | ClientMessage::ForceSave { id, .. } => Some(*id),
            ClientMessage::Subscribe { .. } | ClientMessage::Unsubscribe { .. } => None,
        }
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ServerMessage serialization should not fail")
    }

    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        check_size(text)?;
        Ok(serde_json::from_str(text)?)
    }

    pub fn error(id: Option<RequestId>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            id,
            message: message.into(),
        }
    }
}

fn check_size(text: &str) -> Result<(), ProtocolError> {
    if text.len() > MAX_MESSAGE_SIZE {
        Err(ProtocolError::TooLarge(text.len()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn alice() -> UserId {
        UserId::new("alice").unwrap()
    }

    #[test]
    fn test_client_wire_format() {
        let msg = ClientMessage::Save {
            id: 7,
            user_id: alice(),
            state: json!({ "notes": "x" }),
            timestamp: 100,
        };
        let value: Value = serde_json::from_str(&msg.to_json()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "save", "id": 7, "userId": "alice",
                "state": { "notes": "x" }, "timestamp": 100
            })
        );
        assert_eq!(msg.id(), Some(7));

        let parsed = ClientMessage::from_json(r#"{"type":"forceSave","id":1,"userId":"bob","state":{}}"#)
            .unwrap();
        assert!(matches!(parsed, ClientMessage::ForceSave { id: 1, .. }));
    }

    #[test]
    fn test_server_wire_format() {
        let msg = ServerMessage::Rejected {
            id: 3,
            remote_updated_at: Some(50),
        };
        assert_eq!(
            msg.to_json(),
            r#"{"type":"rejected","id":3,"remoteUpdatedAt":50}"#
        );

        let parsed = ServerMessage::from_json(r#"{"type":"changed","userId":"alice","record":null}"#)
            .unwrap();
        assert_eq!(
            parsed,
            ServerMessage::Changed {
                user_id: alice(),
                record: None
            }
        );
    }

    #[test]
    fn test_subscribe_has_no_id() {
        let msg = ClientMessage::Subscribe { user_id: alice() };
        assert_eq!(msg.id(), None);
        assert_eq!(msg.to_json(), r#"{"type":"subscribe","userId":"alice"}"#);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(ClientMessage::from_json("not json").is_err());
        assert!(ClientMessage::from_json(r#"{"type":"load","id":1,"userId":""}"#).is_err());
        assert!(ServerMessage::from_json(r#"{"type":"unknown"}"#).is_err());
    }
}
