//! Node state and dispatch for the Virgil control protocol.
//!
//! This crate owns everything a node knows about itself: its channel
//! catalog, who subscribes to what, which peers it is linked to, and how
//! inbound protocol messages mutate that state. It performs no I/O; the
//! session layer lives in `virgil-net`.

pub mod channels;
pub mod config;
pub mod connections;
pub mod node;
pub mod subscriptions;

pub use channels::{Channel, ChannelStore};
pub use config::{list_config_files, ChannelConfig, ConfigError, ConnectionConfig, NodeConfig};
pub use connections::DeviceConnection;
pub use node::{ChannelObserver, Dispatch, Node};
pub use subscriptions::SubscriptionRegistry;
