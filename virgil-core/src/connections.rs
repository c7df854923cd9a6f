//! Channel link records between this node and its peers.

use virgil_types::LinkInfo;

/// A link between one of our channels and a peer.
///
/// Reads as: peer `peer_name`'s channel `(remote_index, remote_type)` is
/// linked to our channel `(self_index, self_type)`. The remote side may be
/// absent for device-level links. The same record type describes both
/// *known* links (declared in configuration, to be established when the
/// peer appears) and *active* links (currently live).
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceConnection {
    pub peer_name: String,
    pub self_index: i32,
    pub self_type: String,
    pub remote_index: Option<i32>,
    pub remote_type: Option<String>,
}

impl DeviceConnection {
    /// The `linkedChannels` entry this connection contributes to our
    /// `(self_index, self_type)` channel.
    pub fn link_info(&self) -> LinkInfo {
        match (self.remote_index, self.remote_type.as_deref()) {
            (Some(index), Some(channel_type)) => {
                LinkInfo::channel(self.peer_name.clone(), index, channel_type)
            }
            _ => LinkInfo::device(self.peer_name.clone()),
        }
    }

    /// Exact five-field match, used by `channelUnlink`.
    pub fn matches(
        &self,
        peer_name: &str,
        remote_index: Option<i32>,
        remote_type: Option<&str>,
        self_index: i32,
        self_type: &str,
    ) -> bool {
        self.peer_name == peer_name
            && self.remote_index == remote_index
            && self.remote_type.as_deref() == remote_type
            && self.self_index == self_index
            && self.self_type == self_type
    }

    /// Whether the remote side of this link is an `rx` channel. Such
    /// links are retained as latent when the peer's session goes away.
    pub fn is_remote_rx(&self) -> bool {
        self.remote_type.as_deref() == Some("rx")
    }
}
