//! The control-message envelope exchanged between workers.
//!
//! Wire names are load-bearing: peers built against the protocol dispatch on
//! the literal `threadXMessageType` discriminator and correlate requests by
//! the literal `__asyncMsgId` field. The serde attributes reproduce those
//! names exactly, so a serializing transport interoperates byte-for-byte;
//! the in-process transport passes envelopes as values. Shared buffers are
//! transferables handled by the transport layer, never serialized.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backends::SharedBuffer;

/// Discriminator field name every control message carries on the wire
pub const MESSAGE_TYPE_FIELD: &str = "threadXMessageType";

/// Correlation field name for request/response pairing
pub const ASYNC_MSG_ID_FIELD: &str = "__asyncMsgId";

/// One framed message, optionally correlated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(
        rename = "__asyncMsgId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub async_msg_id: Option<u64>,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Envelope {
    pub fn control(message: ControlMessage) -> Self {
        Self {
            async_msg_id: None,
            body: MessageBody::Control(message),
        }
    }

    pub fn user(value: Value) -> Self {
        Self {
            async_msg_id: None,
            body: MessageBody::User(value),
        }
    }

    pub fn with_async_id(mut self, id: u64) -> Self {
        self.async_msg_id = Some(id);
        self
    }
}

/// A control message or an arbitrary user payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    Control(ControlMessage),
    User(Value),
}

/// The router-to-router control protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "threadXMessageType")]
pub enum ControlMessage {
    /// Handshake: the sender is ready to receive
    #[serde(rename = "ready")]
    Ready,

    /// Hand one or more shared-object buffers to the peer
    #[serde(rename = "shareObjects")]
    ShareObjects {
        /// Transferables; carried out-of-band by serializing transports
        #[serde(skip)]
        buffers: Vec<SharedBuffer>,
    },

    /// Tell the peer to drop (and destroy) its copies of these objects
    #[serde(rename = "forgetObjects")]
    ForgetObjects {
        #[serde(rename = "objectIds")]
        object_ids: Vec<u64>,
    },

    /// An event emitted on a shared object, routed to its peer copy
    #[serde(rename = "sharedObjectEmit")]
    SharedObjectEmit {
        #[serde(rename = "sharedObjectId")]
        shared_object_id: u64,
        #[serde(rename = "eventName")]
        event_name: String,
        data: Value,
    },

    /// Reply to a correlated request
    #[serde(rename = "response")]
    Response {
        #[serde(rename = "asyncMsgId")]
        async_msg_id: u64,
        #[serde(default)]
        error: bool,
        data: Value,
    },

    /// Ask the receiving worker to shut down
    #[serde(rename = "close")]
    Close,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn control_messages_carry_the_literal_discriminator() {
        let envelope = Envelope::control(ControlMessage::Ready);
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire[MESSAGE_TYPE_FIELD], "ready");
    }

    #[test]
    fn correlated_envelopes_carry_the_literal_id_field() {
        let envelope = Envelope::control(ControlMessage::Close).with_async_id(41);
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire[ASYNC_MSG_ID_FIELD], 41);
        assert_eq!(wire[MESSAGE_TYPE_FIELD], "close");
    }

    #[test]
    fn response_fields_use_wire_names() {
        let envelope = Envelope::control(ControlMessage::Response {
            async_msg_id: 7,
            error: true,
            data: json!("boom"),
        });
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire[MESSAGE_TYPE_FIELD], "response");
        assert_eq!(wire["asyncMsgId"], 7);
        assert_eq!(wire["error"], true);
        assert_eq!(wire["data"], "boom");
    }

    #[test]
    fn emit_fields_use_wire_names() {
        let envelope = Envelope::control(ControlMessage::SharedObjectEmit {
            shared_object_id: 10_000_000_000_042,
            event_name: "ping".to_string(),
            data: Value::Null,
        });
        let wire = serde_json::to_value(&envelope).unwrap();
        assert_eq!(wire["sharedObjectId"], 10_000_000_000_042u64);
        assert_eq!(wire["eventName"], "ping");
    }

    #[test]
    fn unframed_payloads_deserialize_as_user_messages() {
        let wire = json!({ "type": "ping", "payload": 3 });
        let envelope: Envelope = serde_json::from_value(wire).unwrap();
        assert!(matches!(envelope.body, MessageBody::User(_)));
        assert_eq!(envelope.async_msg_id, None);
    }

    #[test]
    fn framed_payloads_deserialize_as_control_messages() {
        let wire = json!({ "threadXMessageType": "forgetObjects", "objectIds": [1, 2] });
        let envelope: Envelope = serde_json::from_value(wire).unwrap();
        match envelope.body {
            MessageBody::Control(ControlMessage::ForgetObjects { object_ids }) => {
                assert_eq!(object_ids, vec![1, 2]);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
