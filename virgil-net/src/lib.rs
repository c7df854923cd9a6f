//! Network layer for Virgil nodes.
//!
//! This crate provides the transport side of the protocol: length-prefixed
//! framing, the per-peer session engine, the peer registry with its
//! inbound acceptor, and mDNS discovery.

pub mod discovery;
pub mod framing;
pub mod registry;
pub mod session;

pub use discovery::{local_ipv4, Discovery, DiscoveryEvent, SERVICE_TYPE};
pub use framing::{encode_frame, read_frame, write_frame, FrameBuffer, MAX_FRAME_LEN};
pub use registry::{spawn_acceptor, PeerRegistry};
pub use session::{PeerMirror, PeerSession};

pub use virgil_types::VIRGIL_PORT;
