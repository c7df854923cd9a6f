//! Shared data model for the Virgil control protocol.
//!
//! Defines channel addressing, typed parameters, the wire message set, and
//! the protocol error kinds. Everything here is plain serde data — no I/O.

pub mod error;
pub mod key;
pub mod message;
pub mod param;

pub use error::{CommandError, ErrorKind};
pub use key::{ChannelKey, DeviceIdentity, LinkInfo};
pub use message::{status_scalar, Envelope, EnvelopeError, Message, MessageError};
pub use param::Parameter;

/// Protocol version advertised in device-level info responses.
pub const VIRGIL_VERSION: &str = "2.0.0";

/// Default TCP port for Virgil control sessions.
pub const VIRGIL_PORT: u16 = 7889;
