//! Channel addressing and link records.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Address of a logical signal endpoint on a device.
///
/// `channel_type` is an open set (`tx`, `rx`, `aux`, ...). The pair
/// `(-1, "")` is reserved for the device-level pseudo-channel used in
/// device info exchange and never appears in a channel store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelKey {
    #[serde(rename = "channelIndex")]
    pub index: i32,
    #[serde(rename = "channelType")]
    pub channel_type: String,
}

impl ChannelKey {
    pub fn new(index: i32, channel_type: impl Into<String>) -> Self {
        Self {
            index,
            channel_type: channel_type.into(),
        }
    }

    /// The reserved device-level pseudo-channel.
    pub fn device() -> Self {
        Self::new(-1, "")
    }

    pub fn is_device(&self) -> bool {
        self.index == -1
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.index, self.channel_type)
    }
}

/// One entry in a channel's `linkedChannels` list: a remote channel (or a
/// whole remote device, when the channel fields are absent) currently
/// linked to the owning channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInfo {
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_index: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_type: Option<String>,
}

impl LinkInfo {
    pub fn device(name: impl Into<String>) -> Self {
        Self {
            device_name: name.into(),
            channel_index: None,
            channel_type: None,
        }
    }

    pub fn channel(name: impl Into<String>, index: i32, channel_type: impl Into<String>) -> Self {
        Self {
            device_name: name.into(),
            channel_index: Some(index),
            channel_type: Some(channel_type.into()),
        }
    }
}

/// Identity of a Virgil node, used for discovery records and device-level
/// info responses. The name is the primary key across the whole protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub name: String,
    pub model: String,
    pub device_type: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_key_is_reserved_pair() {
        let key = ChannelKey::device();
        assert_eq!(key.index, -1);
        assert_eq!(key.channel_type, "");
        assert!(key.is_device());
        assert!(!ChannelKey::new(0, "tx").is_device());
    }

    #[test]
    fn link_info_omits_absent_channel_fields() {
        let device_only = serde_json::to_value(LinkInfo::device("mic1")).unwrap();
        assert_eq!(device_only, serde_json::json!({"deviceName": "mic1"}));

        let full = serde_json::to_value(LinkInfo::channel("mic1", 0, "tx")).unwrap();
        assert_eq!(
            full,
            serde_json::json!({"deviceName": "mic1", "channelIndex": 0, "channelType": "tx"})
        );
    }
}
