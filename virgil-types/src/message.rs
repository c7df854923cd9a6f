//! Wire protocol messages.
//!
//! Every TCP frame carries one envelope: `{"transmittingDevice": <name>,
//! "messages": [<message>, ...]}`. Messages are discriminated by their
//! `messageType` field and may carry open-keyed parameter payloads, so the
//! envelope is parsed in two stages: the outer shape strictly, each message
//! tolerantly (a bad message yields an `errorResponse`, not a dead session).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ErrorKind;

/// One protocol message, tagged by `messageType`.
///
/// `parameterCommand` and `statusUpdate` carry their parameters as
/// top-level keys next to the channel address, hence the flattened maps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType")]
pub enum Message {
    #[serde(rename = "parameterCommand", rename_all = "camelCase")]
    ParameterCommand {
        channel_index: i32,
        channel_type: String,
        #[serde(flatten)]
        params: Map<String, Value>,
    },
    #[serde(rename = "statusUpdate", rename_all = "camelCase")]
    StatusUpdate {
        channel_index: i32,
        channel_type: String,
        #[serde(flatten)]
        params: Map<String, Value>,
    },
    #[serde(rename = "statusRequest", rename_all = "camelCase")]
    StatusRequest {
        channel_index: i32,
        channel_type: String,
    },
    #[serde(rename = "infoRequest", rename_all = "camelCase")]
    InfoRequest {
        channel_index: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel_type: Option<String>,
    },
    #[serde(rename = "infoResponse", rename_all = "camelCase")]
    InfoResponse {
        channel_index: i32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        channel_type: Option<String>,
        #[serde(flatten)]
        body: Map<String, Value>,
    },
    #[serde(rename = "channelLink", rename_all = "camelCase")]
    ChannelLink {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sending_channel_index: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sending_channel_type: Option<String>,
        channel_index: i32,
        channel_type: String,
    },
    #[serde(rename = "channelUnlink", rename_all = "camelCase")]
    ChannelUnlink {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sending_channel_index: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sending_channel_type: Option<String>,
        channel_index: i32,
        channel_type: String,
    },
    #[serde(rename = "subscribeMessage", rename_all = "camelCase")]
    Subscribe {
        channel_index: i32,
        channel_type: String,
    },
    #[serde(rename = "unsubscribeMessage", rename_all = "camelCase")]
    Unsubscribe {
        channel_index: i32,
        channel_type: String,
    },
    #[serde(rename = "errorResponse", rename_all = "camelCase")]
    ErrorResponse {
        error_value: ErrorKind,
        error_string: String,
    },
    #[serde(rename = "endResponse")]
    EndResponse,
}

/// The message type strings this implementation understands. Anything else
/// is answered with `UnrecognizedCommand`.
const KNOWN_TYPES: &[&str] = &[
    "parameterCommand",
    "statusUpdate",
    "statusRequest",
    "infoRequest",
    "infoResponse",
    "channelLink",
    "channelUnlink",
    "subscribeMessage",
    "unsubscribeMessage",
    "errorResponse",
    "endResponse",
];

impl Message {
    pub fn error(kind: ErrorKind, text: impl Into<String>) -> Self {
        Message::ErrorResponse {
            error_value: kind,
            error_string: text.into(),
        }
    }

    pub fn info_request(channel_index: i32, channel_type: Option<&str>) -> Self {
        Message::InfoRequest {
            channel_index,
            channel_type: channel_type.map(str::to_string),
        }
    }

    pub fn channel_link(
        self_index: i32,
        self_type: &str,
        channel_index: i32,
        channel_type: &str,
    ) -> Self {
        Message::ChannelLink {
            sending_channel_index: Some(self_index),
            sending_channel_type: Some(self_type.to_string()),
            channel_index,
            channel_type: channel_type.to_string(),
        }
    }

    /// Parse a single message out of an envelope's `messages` array,
    /// classifying failures by the error kind the sender should receive.
    pub fn from_value(value: &Value) -> Result<Self, MessageError> {
        let obj = match value.as_object() {
            Some(obj) if !obj.is_empty() => obj,
            _ => {
                return Err(MessageError::new(
                    ErrorKind::MalformedMessage,
                    "One of the messages is not a valid JSON object.",
                ))
            }
        };
        let msg_type = match obj.get("messageType").and_then(Value::as_str) {
            Some(t) if !t.is_empty() => t,
            _ => {
                return Err(MessageError::new(
                    ErrorKind::MalformedMessage,
                    "Message missing 'messageType'.",
                ))
            }
        };
        if !KNOWN_TYPES.contains(&msg_type) {
            return Err(MessageError::new(
                ErrorKind::UnrecognizedCommand,
                format!("Unknown message type: {msg_type}"),
            ));
        }
        serde_json::from_value(value.clone()).map_err(|e| {
            MessageError::new(
                ErrorKind::MalformedMessage,
                format!("Invalid {msg_type} message: {e}"),
            )
        })
    }
}

/// A message that failed to parse, with the error kind the sender should
/// see in the `errorResponse` reply.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageError {
    pub kind: ErrorKind,
    pub message: String,
}

impl MessageError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn to_message(&self) -> Message {
        Message::error(self.kind, self.message.clone())
    }
}

/// The outermost JSON object carried in every frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "transmittingDevice")]
    pub transmitting_device: String,
    pub messages: Vec<Message>,
}

impl Envelope {
    pub fn new(transmitting_device: impl Into<String>, messages: Vec<Message>) -> Self {
        Self {
            transmitting_device: transmitting_device.into(),
            messages,
        }
    }

    /// Strictly validate the outer envelope shape, leaving the individual
    /// messages as raw JSON for per-message tolerant parsing.
    pub fn parse_frame(payload: &[u8]) -> Result<(String, Vec<Value>), EnvelopeError> {
        let packet: Value = serde_json::from_slice(payload).map_err(|_| {
            EnvelopeError::new(
                ErrorKind::MalformedMessage,
                "The JSON received is malformed.",
            )
        })?;
        let sender = match packet.get("transmittingDevice").and_then(Value::as_str) {
            Some(s) if !s.is_empty() => s.to_string(),
            _ => {
                return Err(EnvelopeError::new(
                    ErrorKind::MalformedMessage,
                    "The JSON received is missing 'transmittingDevice'.",
                ))
            }
        };
        let messages = match packet.get("messages").and_then(Value::as_array) {
            Some(arr) if !arr.is_empty() => arr.clone(),
            _ => {
                return Err(EnvelopeError::new(
                    ErrorKind::MalformedMessage,
                    "The JSON received is missing 'messages'.",
                ))
            }
        };
        Ok((sender, messages))
    }
}

/// An envelope that failed outer validation.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeError {
    pub kind: ErrorKind,
    pub message: String,
}

impl EnvelopeError {
    fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn to_message(&self) -> Message {
        Message::error(self.kind, self.message.clone())
    }
}

/// Read a status-update entry that may be either a raw scalar or a
/// `{"value": ...}` wrapper. Both forms are legal on receive.
pub fn status_scalar(entry: &Value) -> &Value {
    match entry.as_object().and_then(|o| o.get("value")) {
        Some(inner) => inner,
        None => entry,
    }
}
