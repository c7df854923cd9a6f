//! Protocol error kinds carried in `errorResponse` messages.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Error classification for `errorResponse.errorValue`.
///
/// Serialized as the exact wire strings (`"ValueOutOfRange"` etc.).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    MalformedMessage,
    InternalError,
    ChannelIndexInvalid,
    ParameterUnsupported,
    ParameterReadOnly,
    InvalidValueType,
    ValueOutOfRange,
    UnrecognizedCommand,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::MalformedMessage => "MalformedMessage",
            ErrorKind::InternalError => "InternalError",
            ErrorKind::ChannelIndexInvalid => "ChannelIndexInvalid",
            ErrorKind::ParameterUnsupported => "ParameterUnsupported",
            ErrorKind::ParameterReadOnly => "ParameterReadOnly",
            ErrorKind::InvalidValueType => "InvalidValueType",
            ErrorKind::ValueOutOfRange => "ValueOutOfRange",
            ErrorKind::UnrecognizedCommand => "UnrecognizedCommand",
        };
        f.write_str(s)
    }
}

/// A failed parameter mutation: the protocol error kind plus a
/// human-readable description for the `errorString` field.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandError {
    pub kind: ErrorKind,
    pub message: String,
}

impl CommandError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for CommandError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_uses_wire_strings() {
        let v = serde_json::to_value(ErrorKind::ValueOutOfRange).unwrap();
        assert_eq!(v, serde_json::json!("ValueOutOfRange"));
        let back: ErrorKind = serde_json::from_value(v).unwrap();
        assert_eq!(back, ErrorKind::ValueOutOfRange);
    }
}
