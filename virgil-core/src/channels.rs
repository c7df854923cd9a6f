//! In-memory catalog of the node's own channels.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use virgil_types::{ChannelKey, CommandError, ErrorKind, LinkInfo, Parameter};

use crate::config::ChannelConfig;

/// One local channel: its typed parameters plus the list of remote
/// channels currently linked to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    #[serde(rename = "linkedChannels", default)]
    pub linked_channels: Vec<LinkInfo>,
    #[serde(flatten)]
    pub parameters: BTreeMap<String, Parameter>,
}

impl Channel {
    pub fn new(parameters: BTreeMap<String, Parameter>) -> Self {
        Self {
            linked_channels: Vec::new(),
            parameters,
        }
    }
}

/// The channel store: all channels this node owns, keyed by
/// `(channelIndex, channelType)`. The device-level pseudo-channel
/// `(-1, "")` is never stored here; device info is synthesized from the
/// node identity.
#[derive(Debug, Default)]
pub struct ChannelStore {
    channels: BTreeMap<ChannelKey, Channel>,
}

impl ChannelStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: ChannelKey, channel: Channel) {
        self.channels.insert(key, channel);
    }

    pub fn get(&self, key: &ChannelKey) -> Option<&Channel> {
        self.channels.get(key)
    }

    pub fn get_mut(&mut self, key: &ChannelKey) -> Option<&mut Channel> {
        self.channels.get_mut(key)
    }

    pub fn contains(&self, key: &ChannelKey) -> bool {
        self.channels.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ChannelKey, &Channel)> {
        self.channels.iter()
    }

    /// A channel's parameter descriptors by name. Empty for unknown
    /// channels.
    pub fn list_parameters(
        &self,
        key: &ChannelKey,
    ) -> impl Iterator<Item = (&str, &Parameter)> {
        self.channels
            .get(key)
            .into_iter()
            .flat_map(|channel| channel.parameters.iter())
            .map(|(name, param)| (name.as_str(), param))
    }

    /// Bulk-load the channel catalog from configuration at startup.
    pub fn install_from_config(&mut self, channels: &[ChannelConfig]) {
        for channel in channels {
            self.insert(
                ChannelKey::new(channel.index, channel.channel_type.clone()),
                Channel::new(channel.parameters.clone()),
            );
        }
    }

    /// Count of channels per channel type, for device-level info responses.
    pub fn channel_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for key in self.channels.keys() {
            *counts.entry(key.channel_type.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Apply a parameter change received from a peer. Enforces readOnly,
    /// data type, range, precision, and enum membership; a failure leaves
    /// the stored value untouched.
    pub fn apply_remote_command(
        &mut self,
        key: &ChannelKey,
        name: &str,
        value: &Value,
    ) -> Result<(), CommandError> {
        let param = self.lookup_mut(key, name)?;
        if param.read_only() {
            return Err(CommandError::new(
                ErrorKind::ParameterReadOnly,
                format!("Parameter {name} is read-only and cannot be changed."),
            ));
        }
        param.check_value(name, value)?;
        param.store(value);
        Ok(())
    }

    /// Apply a locally-originated write (hardware, GUI). Bypasses readOnly
    /// but still type-checks, and bounds-checks numbers.
    pub fn apply_local_write(
        &mut self,
        key: &ChannelKey,
        name: &str,
        value: &Value,
    ) -> Result<(), CommandError> {
        let param = self.lookup_mut(key, name)?;
        param.check_local_value(name, value)?;
        param.store(value);
        Ok(())
    }

    fn lookup_mut(
        &mut self,
        key: &ChannelKey,
        name: &str,
    ) -> Result<&mut Parameter, CommandError> {
        let channel = self.channels.get_mut(key).ok_or_else(|| {
            CommandError::new(
                ErrorKind::ChannelIndexInvalid,
                format!(
                    "Channel index {} out of range for {} channels.",
                    key.index, key.channel_type
                ),
            )
        })?;
        channel.parameters.get_mut(name).ok_or_else(|| {
            CommandError::new(
                ErrorKind::ParameterUnsupported,
                format!(
                    "Channel {} of type {} does not have a parameter named {name}.",
                    key.index, key.channel_type
                ),
            )
        })
    }

    /// Append a `linkedChannels` entry if it is not already present.
    /// Returns false if the channel does not exist or the entry is a
    /// duplicate.
    pub fn add_linked_channel(&mut self, key: &ChannelKey, link: LinkInfo) -> bool {
        match self.channels.get_mut(key) {
            Some(channel) if !channel.linked_channels.contains(&link) => {
                channel.linked_channels.push(link);
                true
            }
            _ => false,
        }
    }

    /// Remove a matching `linkedChannels` entry. Returns true if one was
    /// removed.
    pub fn remove_linked_channel(&mut self, key: &ChannelKey, link: &LinkInfo) -> bool {
        match self.channels.get_mut(key) {
            Some(channel) => {
                let before = channel.linked_channels.len();
                channel.linked_channels.retain(|l| l != link);
                channel.linked_channels.len() != before
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store_with_gain() -> ChannelStore {
        let mut params = BTreeMap::new();
        params.insert(
            "gain".to_string(),
            Parameter::Number {
                min_value: -10.0,
                max_value: 50.0,
                precision: 0.1,
                unit: Some("dB".into()),
                value: 10.0,
                read_only: false,
            },
        );
        params.insert(
            "rfLevel".to_string(),
            Parameter::Number {
                min_value: 0.0,
                max_value: 100.0,
                precision: 1.0,
                unit: None,
                value: 42.0,
                read_only: true,
            },
        );
        let mut store = ChannelStore::new();
        store.insert(ChannelKey::new(0, "tx"), Channel::new(params));
        store
    }

    #[test]
    fn remote_command_applies_valid_value() {
        let mut store = store_with_gain();
        let key = ChannelKey::new(0, "tx");
        store.apply_remote_command(&key, "gain", &json!(12.5)).unwrap();
        let gain = &store.get(&key).unwrap().parameters["gain"];
        assert_eq!(gain.value_json(), json!(12.5));
    }

    #[test]
    fn remote_command_never_mutates_on_failure() {
        let mut store = store_with_gain();
        let key = ChannelKey::new(0, "tx");

        let err = store.apply_remote_command(&key, "gain", &json!(51)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValueOutOfRange);
        let err = store.apply_remote_command(&key, "rfLevel", &json!(80)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParameterReadOnly);
        let err = store.apply_remote_command(&key, "squelch", &json!(1)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ParameterUnsupported);

        let channel = store.get(&key).unwrap();
        assert_eq!(channel.parameters["gain"].value_json(), json!(10));
        assert_eq!(channel.parameters["rfLevel"].value_json(), json!(42));
    }

    #[test]
    fn remote_command_on_unknown_channel() {
        let mut store = store_with_gain();
        let err = store
            .apply_remote_command(&ChannelKey::new(3, "tx"), "gain", &json!(1))
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::ChannelIndexInvalid);
    }

    #[test]
    fn local_write_bypasses_read_only() {
        let mut store = store_with_gain();
        let key = ChannelKey::new(0, "tx");
        store.apply_local_write(&key, "rfLevel", &json!(80)).unwrap();
        assert_eq!(
            store.get(&key).unwrap().parameters["rfLevel"].value_json(),
            json!(80)
        );
        // Bounds still apply.
        let err = store.apply_local_write(&key, "rfLevel", &json!(101)).unwrap_err();
        assert_eq!(err.kind, ErrorKind::ValueOutOfRange);
    }

    #[test]
    fn linked_channel_entries_dedup() {
        let mut store = store_with_gain();
        let key = ChannelKey::new(0, "tx");
        let link = LinkInfo::channel("mic1", 0, "rx");
        assert!(store.add_linked_channel(&key, link.clone()));
        assert!(!store.add_linked_channel(&key, link.clone()));
        assert_eq!(store.get(&key).unwrap().linked_channels.len(), 1);
        assert!(store.remove_linked_channel(&key, &link));
        assert!(!store.remove_linked_channel(&key, &link));
    }

    #[test]
    fn list_parameters_names_descriptors() {
        let store = store_with_gain();
        let names: Vec<&str> = store
            .list_parameters(&ChannelKey::new(0, "tx"))
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, ["gain", "rfLevel"]);
        assert_eq!(
            store.list_parameters(&ChannelKey::new(9, "tx")).count(),
            0
        );
    }

    #[test]
    fn install_from_config_builds_catalog() {
        let config = crate::config::NodeConfig::parse(
            r#"{
                "Name": "n", "Model": "m", "Type": "tx",
                "Channels": [
                    {
                        "channelIndex": 1,
                        "channelType": "aux",
                        "level": {"dataType": "number", "minValue": 0, "maxValue": 10,
                                  "precision": 1, "value": 5, "readOnly": false}
                    }
                ]
            }"#,
        )
        .unwrap();
        let mut store = ChannelStore::new();
        store.install_from_config(&config.channels);
        let key = ChannelKey::new(1, "aux");
        assert!(store.contains(&key));
        assert_eq!(
            store.get(&key).unwrap().parameters["level"].value_json(),
            json!(5)
        );
    }

    #[test]
    fn channel_counts_by_type() {
        let mut store = store_with_gain();
        store.insert(ChannelKey::new(1, "tx"), Channel::default());
        store.insert(ChannelKey::new(0, "rx"), Channel::default());
        let counts = store.channel_counts();
        assert_eq!(counts["tx"], 2);
        assert_eq!(counts["rx"], 1);
    }

    #[test]
    fn channel_body_includes_descriptors_and_links() {
        let mut store = store_with_gain();
        let key = ChannelKey::new(0, "tx");
        store.add_linked_channel(&key, LinkInfo::channel("mic1", 0, "rx"));
        let body = serde_json::to_value(store.get(&key).unwrap()).unwrap();
        assert_eq!(body["gain"]["dataType"], "number");
        assert_eq!(body["linkedChannels"][0]["deviceName"], "mic1");
    }
}
