//! The node: owner of all local protocol state, and the dispatcher.
//!
//! All mutation of the channel store, the subscription registry, and the
//! connection lists goes through a `Node` behind a single lock. Session
//! tasks hand inbound messages to [`Node::process_message`] and carry out
//! the returned [`Dispatch`] (replies to the sender, queued follow-ups,
//! fan-out to subscriber peers) after releasing the lock.

use log::{debug, warn};
use serde_json::{json, Map, Value};

use virgil_types::{ChannelKey, CommandError, DeviceIdentity, ErrorKind, Message, VIRGIL_VERSION};

use crate::channels::ChannelStore;
use crate::config::NodeConfig;
use crate::connections::DeviceConnection;
use crate::subscriptions::SubscriptionRegistry;

/// Notifications for external adapters (monitor GUI, hardware bridge).
/// Fired after the corresponding state change has been applied.
pub trait ChannelObserver: Send {
    /// Parameters of a local channel changed value.
    fn parameters_changed(&self, _key: &ChannelKey, _params: &[String]) {}
    /// The set of linked peers or their sessions changed.
    fn peers_changed(&self) {}
}

/// What a processed inbound message asks the session layer to do.
#[derive(Debug, Default)]
pub struct Dispatch {
    /// Replies that belong in the current turn's outbound frame, in order.
    pub replies: Vec<Message>,
    /// Messages to queue on the *sender's* session as a later batch.
    pub enqueue_self: Vec<Message>,
    /// Status updates to enqueue on other peers' sessions, delivered after
    /// the sender's reply frame is handed off.
    pub fanout: Vec<(String, Message)>,
}

impl Dispatch {
    fn reply(message: Message) -> Self {
        Dispatch {
            replies: vec![message],
            ..Dispatch::default()
        }
    }
}

pub struct Node {
    identity: DeviceIdentity,
    channels: ChannelStore,
    subscriptions: SubscriptionRegistry,
    /// Links declared in configuration, established whenever the peer is
    /// on the network.
    known_connections: Vec<DeviceConnection>,
    /// Links currently live (or latent, for surviving rx links).
    active_connections: Vec<DeviceConnection>,
    observers: Vec<Box<dyn ChannelObserver>>,
}

impl Node {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            channels: ChannelStore::new(),
            subscriptions: SubscriptionRegistry::new(),
            known_connections: Vec::new(),
            active_connections: Vec::new(),
            observers: Vec::new(),
        }
    }

    /// Build a node from a loaded configuration: install the channel
    /// catalog and record the known links.
    pub fn from_config(config: &NodeConfig) -> Self {
        let mut node = Node::new(DeviceIdentity {
            name: config.name.clone(),
            model: config.model.clone(),
            device_type: config.device_type.clone(),
        });
        node.channels.install_from_config(&config.channels);
        for connection in &config.connections {
            node.known_connections.push(connection.to_connection());
        }
        node
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn channels(&self) -> &ChannelStore {
        &self.channels
    }

    pub fn subscriptions(&self) -> &SubscriptionRegistry {
        &self.subscriptions
    }

    pub fn active_connections(&self) -> &[DeviceConnection] {
        &self.active_connections
    }

    pub fn add_observer(&mut self, observer: Box<dyn ChannelObserver>) {
        self.observers.push(observer);
    }

    /// Whether any known link names this peer. Discovery only dials peers
    /// we have configured links to.
    pub fn has_known_peer(&self, peer: &str) -> bool {
        self.known_connections.iter().any(|c| c.peer_name == peer)
    }

    // ── Inbound dispatch ────────────────────────────────────────────

    /// Process one inbound message from `from` and return what the session
    /// should send and enqueue. Mirror-only messages (`statusUpdate`,
    /// `infoResponse`) and the turn bookkeeping (`endResponse`) are handled
    /// in the session layer, not here.
    pub fn process_message(&mut self, from: &str, message: &Message) -> Dispatch {
        match message {
            Message::ParameterCommand {
                channel_index,
                channel_type,
                params,
            } => self.handle_parameter_command(from, *channel_index, channel_type, params),
            Message::StatusRequest {
                channel_index,
                channel_type,
            } => {
                let key = ChannelKey::new(*channel_index, channel_type.clone());
                let message = match self.status_update_message(&key, None) {
                    Ok(update) => update,
                    Err(error) => error,
                };
                Dispatch::reply(message)
            }
            Message::ChannelLink {
                sending_channel_index,
                sending_channel_type,
                channel_index,
                channel_type,
            } => self.handle_link(
                from,
                *sending_channel_index,
                sending_channel_type.as_deref(),
                *channel_index,
                channel_type,
            ),
            Message::ChannelUnlink {
                sending_channel_index,
                sending_channel_type,
                channel_index,
                channel_type,
            } => self.handle_unlink(
                from,
                *sending_channel_index,
                sending_channel_type.as_deref(),
                *channel_index,
                channel_type,
            ),
            Message::InfoRequest {
                channel_index,
                channel_type,
            } => {
                if *channel_index == -1 {
                    return Dispatch::reply(self.device_info_response());
                }
                match channel_type {
                    Some(channel_type) => {
                        let key = ChannelKey::new(*channel_index, channel_type.clone());
                        Dispatch::reply(self.channel_info_response(&key))
                    }
                    None => Dispatch::reply(Message::error(
                        ErrorKind::MalformedMessage,
                        "Info request message missing 'channelType'.",
                    )),
                }
            }
            Message::Subscribe {
                channel_index,
                channel_type,
            } => {
                let key = ChannelKey::new(*channel_index, channel_type.clone());
                self.subscriptions.add(&key, from);
                Dispatch::default()
            }
            Message::Unsubscribe {
                channel_index,
                channel_type,
            } => {
                let key = ChannelKey::new(*channel_index, channel_type.clone());
                self.subscriptions.remove(&key, from);
                Dispatch::default()
            }
            // Session-level messages; nothing for the node to do.
            Message::StatusUpdate { .. }
            | Message::InfoResponse { .. }
            | Message::ErrorResponse { .. }
            | Message::EndResponse => {
                debug!("node asked to process session-level message from {from}");
                Dispatch::default()
            }
        }
    }

    fn handle_parameter_command(
        &mut self,
        from: &str,
        channel_index: i32,
        channel_type: &str,
        params: &Map<String, Value>,
    ) -> Dispatch {
        let key = ChannelKey::new(channel_index, channel_type);
        let mut dispatch = Dispatch::default();
        let mut applied = Vec::new();
        for (name, value) in params {
            match self.channels.apply_remote_command(&key, name, value) {
                Ok(()) => applied.push(name.clone()),
                Err(CommandError { kind, message }) => {
                    dispatch.replies.push(Message::error(kind, message));
                }
            }
        }
        if !applied.is_empty() {
            self.notify_parameters_changed(&key, &applied);
        }

        // The status update names every commanded parameter, applied or
        // not, so the sender sees the authoritative current values.
        let commanded: Vec<String> = params.keys().cloned().collect();
        let (update, fanout) = self.fan_out_status(&key, Some(from), Some(&commanded));
        dispatch.replies.push(update);
        dispatch.fanout = fanout;
        dispatch
    }

    fn handle_link(
        &mut self,
        from: &str,
        sending_index: Option<i32>,
        sending_type: Option<&str>,
        channel_index: i32,
        channel_type: &str,
    ) -> Dispatch {
        let key = ChannelKey::new(channel_index, channel_type);
        let connection = DeviceConnection {
            peer_name: from.to_string(),
            self_index: channel_index,
            self_type: channel_type.to_string(),
            remote_index: sending_index,
            remote_type: sending_type.map(str::to_string),
        };
        self.add_active_connection(connection);

        let mut dispatch = Dispatch::default();
        // Learn about the channel the peer is linking from.
        if let (Some(index), Some(channel_type)) = (sending_index, sending_type) {
            dispatch
                .enqueue_self
                .push(Message::info_request(index, Some(channel_type)));
        }
        let (update, fanout) =
            self.fan_out_status(&key, Some(from), Some(&["linkedChannels".to_string()]));
        dispatch.replies.push(update);
        dispatch.fanout = fanout;
        dispatch
    }

    fn handle_unlink(
        &mut self,
        from: &str,
        sending_index: Option<i32>,
        sending_type: Option<&str>,
        channel_index: i32,
        channel_type: &str,
    ) -> Dispatch {
        let key = ChannelKey::new(channel_index, channel_type);
        self.remove_matching_connections(
            from,
            sending_index,
            sending_type,
            channel_index,
            channel_type,
        );

        let mut dispatch = Dispatch::default();
        let (update, fanout) =
            self.fan_out_status(&key, Some(from), Some(&["linkedChannels".to_string()]));
        dispatch.replies.push(update);
        dispatch.fanout = fanout;
        dispatch
    }

    // ── Local mutation API (hardware, GUI) ──────────────────────────

    /// Apply a locally-originated parameter write and return the status
    /// updates to enqueue on subscriber sessions. Bypasses readOnly.
    pub fn handle_local_write(
        &mut self,
        key: &ChannelKey,
        name: &str,
        value: &Value,
    ) -> Result<Vec<(String, Message)>, CommandError> {
        self.channels.apply_local_write(key, name, value)?;
        self.notify_parameters_changed(key, &[name.to_string()]);
        let (_, fanout) = self.fan_out_status(key, None, Some(&[name.to_string()]));
        Ok(fanout)
    }

    /// Build the fan-out for parameters that already changed locally
    /// (e.g. periodic metering pushes).
    pub fn local_param_change(
        &self,
        key: &ChannelKey,
        params: &[String],
        exclude: Option<&str>,
    ) -> Vec<(String, Message)> {
        let (_, fanout) = self.fan_out_status(key, exclude, Some(params));
        fanout
    }

    // ── Reply builders ──────────────────────────────────────────────

    /// Device identity response for `infoRequest(-1)`.
    pub fn device_info_response(&self) -> Message {
        let mut body = Map::new();
        body.insert("deviceModel".into(), json!(self.identity.model));
        body.insert("deviceType".into(), json!(self.identity.device_type));
        body.insert("virgilVersion".into(), json!(VIRGIL_VERSION));
        body.insert("channelCounts".into(), json!(self.channels.channel_counts()));
        Message::InfoResponse {
            channel_index: -1,
            channel_type: None,
            body,
        }
    }

    /// Full descriptor set for one channel, or `ChannelIndexInvalid`.
    pub fn channel_info_response(&self, key: &ChannelKey) -> Message {
        let Some(channel) = self.channels.get(key) else {
            return channel_index_invalid(key);
        };
        let body = match serde_json::to_value(channel) {
            Ok(Value::Object(body)) => body,
            _ => {
                return Message::error(
                    ErrorKind::InternalError,
                    format!("Could not serialize channel {key}."),
                )
            }
        };
        Message::InfoResponse {
            channel_index: key.index,
            channel_type: Some(key.channel_type.clone()),
            body,
        }
    }

    /// Build a `statusUpdate` for a channel. `filter` limits it to the
    /// named parameters; `None` includes everything. Parameter values are
    /// emitted as `{"value": ...}` wrappers; `linkedChannels` passes
    /// through verbatim.
    pub fn status_update_message(
        &self,
        key: &ChannelKey,
        filter: Option<&[String]>,
    ) -> Result<Message, Message> {
        let Some(channel) = self.channels.get(key) else {
            return Err(channel_index_invalid(key));
        };
        let wanted = |name: &str| filter.map_or(true, |f| f.iter().any(|p| p == name));
        let mut params = Map::new();
        for (name, param) in &channel.parameters {
            if wanted(name) {
                params.insert(name.clone(), json!({"value": param.value_json()}));
            }
        }
        if wanted("linkedChannels") {
            params.insert(
                "linkedChannels".into(),
                serde_json::to_value(&channel.linked_channels).unwrap_or_default(),
            );
        }
        Ok(Message::StatusUpdate {
            channel_index: key.index,
            channel_type: key.channel_type.clone(),
            params,
        })
    }

    /// Build a status update and the list of subscriber sessions it should
    /// be enqueued on, excluding `exclude` (the commanding peer, so it is
    /// not echoed its own change). A missing channel yields the error
    /// message and an empty fan-out.
    fn fan_out_status(
        &self,
        key: &ChannelKey,
        exclude: Option<&str>,
        filter: Option<&[String]>,
    ) -> (Message, Vec<(String, Message)>) {
        let update = match self.status_update_message(key, filter) {
            Ok(update) => update,
            Err(error) => return (error, Vec::new()),
        };
        let fanout = self
            .subscriptions
            .subscribers(key)
            .iter()
            .filter(|peer| Some(peer.as_str()) != exclude)
            .map(|peer| (peer.clone(), update.clone()))
            .collect();
        (update, fanout)
    }

    // ── Connection lifecycle ────────────────────────────────────────

    /// Record an active link. Adds the subscription and the
    /// `linkedChannels` entry together with the connection record.
    pub fn add_active_connection(&mut self, connection: DeviceConnection) {
        if self.active_connections.contains(&connection) {
            return;
        }
        let key = ChannelKey::new(connection.self_index, connection.self_type.clone());
        self.subscriptions.add(&key, &connection.peer_name);
        if self.channels.contains(&key) {
            self.channels.add_linked_channel(&key, connection.link_info());
        } else {
            warn!("link to unknown local channel {key} from {}", connection.peer_name);
        }
        self.active_connections.push(connection);
        self.notify_peers_changed();
    }

    /// Remove every active link matching the unlink request, reversing the
    /// subscription and `linkedChannels` entries.
    pub fn remove_matching_connections(
        &mut self,
        peer: &str,
        remote_index: Option<i32>,
        remote_type: Option<&str>,
        self_index: i32,
        self_type: &str,
    ) {
        let matching: Vec<DeviceConnection> = self
            .active_connections
            .iter()
            .filter(|c| c.matches(peer, remote_index, remote_type, self_index, self_type))
            .cloned()
            .collect();
        for connection in matching {
            self.remove_active_connection(&connection);
        }
    }

    fn remove_active_connection(&mut self, connection: &DeviceConnection) {
        let key = ChannelKey::new(connection.self_index, connection.self_type.clone());
        self.subscriptions.remove(&key, &connection.peer_name);
        self.channels.remove_linked_channel(&key, &connection.link_info());
        self.active_connections.retain(|c| c != connection);
        self.notify_peers_changed();
    }

    /// Promote known links to this peer into active connections. Called
    /// when a session to the peer is established (either direction).
    pub fn peer_session_started(&mut self, peer: &str) {
        let promotions: Vec<DeviceConnection> = self
            .known_connections
            .iter()
            .filter(|c| c.peer_name == peer)
            .cloned()
            .collect();
        for connection in promotions {
            self.add_active_connection(connection);
        }
    }

    /// Tear down state for a lost peer session. Links whose remote side is
    /// an rx channel stay latent until the peer returns; everything else
    /// is removed.
    pub fn peer_lost(&mut self, peer: &str) {
        let doomed: Vec<DeviceConnection> = self
            .active_connections
            .iter()
            .filter(|c| c.peer_name == peer && !c.is_remote_rx())
            .cloned()
            .collect();
        for connection in doomed {
            self.remove_active_connection(&connection);
        }
        self.notify_peers_changed();
    }

    /// Per-link bootstrap traffic for a freshly dialed peer: first the
    /// device info request, then an info request per linked remote
    /// channel, then the channelLink messages. Split into separate batches
    /// so each exchange completes before the next begins.
    pub fn bootstrap_batches(&self, peer: &str) -> Vec<Vec<Message>> {
        let mut info_requests = Vec::new();
        let mut links = Vec::new();
        for connection in self
            .known_connections
            .iter()
            .filter(|c| c.peer_name == peer)
        {
            if let (Some(index), Some(channel_type)) =
                (connection.remote_index, connection.remote_type.as_deref())
            {
                info_requests.push(Message::info_request(index, Some(channel_type)));
                links.push(Message::channel_link(
                    connection.self_index,
                    &connection.self_type,
                    index,
                    channel_type,
                ));
            }
        }
        let mut batches = vec![vec![Message::info_request(-1, None)]];
        if !info_requests.is_empty() {
            batches.push(info_requests);
        }
        if !links.is_empty() {
            batches.push(links);
        }
        batches
    }

    // ── Observers ───────────────────────────────────────────────────

    fn notify_parameters_changed(&self, key: &ChannelKey, params: &[String]) {
        for observer in &self.observers {
            observer.parameters_changed(key, params);
        }
    }

    pub fn notify_peers_changed(&self) {
        for observer in &self.observers {
            observer.peers_changed();
        }
    }
}

fn channel_index_invalid(key: &ChannelKey) -> Message {
    Message::error(
        ErrorKind::ChannelIndexInvalid,
        format!(
            "Channel index {} out of range for {} channels.",
            key.index, key.channel_type
        ),
    )
}
