//! Per-peer protocol sessions.
//!
//! Each peer gets exactly one session running on its own thread. The
//! session owns the socket, reassembles inbound frames, dispatches their
//! messages through the node, and drives the half-duplex turn discipline:
//! after each inbound frame it sends at most one outbound frame — the
//! synchronous replies if there are any, otherwise the next queued batch,
//! otherwise an `endResponse` to close the turn. When idle, a queued batch
//! opens a new turn.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::{Map, Value};

use virgil_core::Node;
use virgil_types::{ChannelKey, Envelope, ErrorKind, Message};

use crate::framing::{encode_frame, FrameBuffer};
use crate::registry::PeerRegistry;

/// Sleep between socket polls when no data is pending.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Timeout for dialing a discovered peer.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Where the conversation with the peer stands. A turn stays open until
/// an `endResponse` is received (our turn) or sent (theirs).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnState {
    /// Neither side is mid-conversation.
    Idle,
    /// We opened the turn by sending a queued batch.
    InTurnInitiated,
    /// The peer opened the turn; we are replying.
    InTurnResponding,
}

impl TurnState {
    fn is_open(self) -> bool {
        self != TurnState::Idle
    }
}

/// Device identity and channel state learned from the peer.
///
/// Channel entries hold the peer's descriptors as raw JSON: info responses
/// replace an entry wholesale (they are authoritative), status updates
/// merge key-wise so a `{"value": ...}` wrapper only touches the value
/// field of an existing descriptor.
#[derive(Debug, Clone, Default)]
pub struct PeerMirror {
    pub device_model: Option<String>,
    pub device_type: Option<String>,
    pub virgil_version: Option<String>,
    pub channel_counts: BTreeMap<String, u32>,
    pub channels: BTreeMap<ChannelKey, Map<String, Value>>,
}

impl PeerMirror {
    fn apply(
        &mut self,
        authoritative: bool,
        channel_index: i32,
        channel_type: Option<&str>,
        body: &Map<String, Value>,
    ) -> Vec<Message> {
        if channel_index == -1 {
            return self.apply_device_info(body);
        }
        let Some(channel_type) = channel_type else {
            return vec![Message::error(
                ErrorKind::MalformedMessage,
                "Info response missing 'channelType'.",
            )];
        };
        let key = ChannelKey::new(channel_index, channel_type);
        if authoritative {
            self.channels.insert(key, body.clone());
        } else {
            let entry = self.channels.entry(key).or_default();
            for (name, value) in body {
                match (entry.get_mut(name), value.as_object()) {
                    (Some(Value::Object(existing)), Some(incoming)) => {
                        for (k, v) in incoming {
                            existing.insert(k.clone(), v.clone());
                        }
                    }
                    _ => {
                        entry.insert(name.clone(), value.clone());
                    }
                }
            }
        }
        Vec::new()
    }

    fn apply_device_info(&mut self, body: &Map<String, Value>) -> Vec<Message> {
        let mut errors = Vec::new();
        for field in ["deviceModel", "deviceType", "virgilVersion", "channelCounts"] {
            if !body.contains_key(field) {
                errors.push(Message::error(
                    ErrorKind::MalformedMessage,
                    format!("Info response missing '{field}'."),
                ));
            }
        }
        if !errors.is_empty() {
            return errors;
        }
        self.device_model = body["deviceModel"].as_str().map(str::to_string);
        self.device_type = body["deviceType"].as_str().map(str::to_string);
        self.virgil_version = body["virgilVersion"].as_str().map(str::to_string);
        self.channel_counts =
            serde_json::from_value(body["channelCounts"].clone()).unwrap_or_default();
        Vec::new()
    }
}

struct SessionInner {
    /// Latest known address of the peer.
    ip: IpAddr,
    /// Pending outbound batches; each becomes one frame.
    queue: VecDeque<Vec<Message>>,
    turn: TurnState,
    /// True once the transport is established and talking Virgil.
    is_virgil: bool,
    disabled: bool,
    mirror: PeerMirror,
    /// Clone of the socket kept for shutting it down from other threads.
    shutdown_handle: Option<TcpStream>,
}

/// One peer session. Created by the peer registry, which guarantees at
/// most one session per peer name.
pub struct PeerSession {
    peer_name: String,
    local_name: String,
    port: u16,
    inner: Mutex<SessionInner>,
}

impl PeerSession {
    pub(crate) fn new(
        peer_name: &str,
        local_name: &str,
        ip: IpAddr,
        port: u16,
        queue: Vec<Vec<Message>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            peer_name: peer_name.to_string(),
            local_name: local_name.to_string(),
            port,
            inner: Mutex::new(SessionInner {
                ip,
                queue: queue.into(),
                turn: TurnState::Idle,
                is_virgil: false,
                disabled: false,
                mirror: PeerMirror::default(),
                shutdown_handle: None,
            }),
        })
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn peer_ip(&self) -> IpAddr {
        self.lock().ip
    }

    /// Snapshot of what we have learned about the peer.
    pub fn mirror(&self) -> PeerMirror {
        self.lock().mirror.clone()
    }

    /// A live session: handshake completed and the socket still open.
    /// The registry rejects duplicate inbound connections against this.
    pub fn is_live(&self) -> bool {
        let inner = self.lock();
        inner.is_virgil && !inner.disabled && inner.shutdown_handle.is_some()
    }

    pub fn is_disabled(&self) -> bool {
        self.lock().disabled
    }

    /// Queue a batch of messages to be sent as one frame when the
    /// conversation allows.
    pub fn enqueue_batch(&self, batch: Vec<Message>) {
        if batch.is_empty() {
            return;
        }
        let mut inner = self.lock();
        if inner.disabled {
            debug!("dropping batch for {}: session disabled", self.peer_name);
            return;
        }
        inner.queue.push_back(batch);
    }

    /// Tear the session down: close the socket and let the loop observe
    /// the error on its next poll.
    pub fn end(&self) {
        let mut inner = self.lock();
        inner.disabled = true;
        if let Some(stream) = inner.shutdown_handle.take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the session thread. `socket` and `first_frame` come from the
    /// acceptor when the peer connected to us; both are `None` when we are
    /// the initiator and must dial out.
    pub(crate) fn spawn(
        self: &Arc<Self>,
        node: Arc<Mutex<Node>>,
        registry: Arc<PeerRegistry>,
        socket: Option<TcpStream>,
        first_frame: Option<Vec<u8>>,
    ) -> JoinHandle<()> {
        let session = self.clone();
        thread::spawn(move || session.run(node, registry, socket, first_frame))
    }

    fn run(
        self: Arc<Self>,
        node: Arc<Mutex<Node>>,
        registry: Arc<PeerRegistry>,
        socket: Option<TcpStream>,
        first_frame: Option<Vec<u8>>,
    ) {
        let mut stream = match self.establish(socket) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("could not connect to {}: {e}", self.peer_name);
                self.lock().is_virgil = false;
                registry.remove_session_entry(&self.peer_name, &self);
                return;
            }
        };
        info!("session with {} established", self.peer_name);

        // Promote configured links to this peer now that it is reachable.
        lock_node(&node).peer_session_started(&self.peer_name);

        if let Some(payload) = first_frame {
            if self.handle_frame(&payload, &mut stream, &node, &registry).is_err() {
                self.teardown(&node, &registry);
                return;
            }
        }

        let mut rx = FrameBuffer::new();
        let mut buf = [0u8; 4096];
        loop {
            if self.lock().disabled {
                break;
            }
            // When idle, a queued batch opens a new turn.
            if let Some(batch) = self.pop_initiation() {
                if self.send_frame(&mut stream, batch).is_err() {
                    break;
                }
            }
            match stream.read(&mut buf) {
                Ok(0) => {
                    info!("connection closed by {}", self.peer_name);
                    break;
                }
                Ok(n) => {
                    rx.extend(&buf[..n]);
                    let mut failed = false;
                    loop {
                        match rx.next_frame() {
                            Ok(Some(payload)) => {
                                if self
                                    .handle_frame(&payload, &mut stream, &node, &registry)
                                    .is_err()
                                {
                                    failed = true;
                                    break;
                                }
                            }
                            Ok(None) => break,
                            Err(e) => {
                                warn!("corrupt stream from {}: {e}", self.peer_name);
                                failed = true;
                                break;
                            }
                        }
                    }
                    if failed {
                        break;
                    }
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut =>
                {
                    thread::sleep(POLL_INTERVAL);
                }
                Err(e) => {
                    if !self.lock().disabled {
                        warn!("socket error with {}: {e}", self.peer_name);
                    }
                    break;
                }
            }
        }

        self.teardown(&node, &registry);
    }

    /// Get a non-blocking socket to the peer, either by adopting the
    /// acceptor's or by dialing out.
    fn establish(&self, socket: Option<TcpStream>) -> io::Result<TcpStream> {
        let stream = match socket {
            Some(stream) => {
                // The peer opened the conversation; we answer its first
                // frame as a responder.
                self.lock().turn = TurnState::InTurnResponding;
                stream
            }
            None => {
                let addr = SocketAddr::new(self.lock().ip, self.port);
                TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?
            }
        };
        stream.set_nonblocking(true)?;
        let mut inner = self.lock();
        if let Ok(addr) = stream.peer_addr() {
            inner.ip = addr.ip();
        }
        inner.is_virgil = true;
        inner.shutdown_handle = stream.try_clone().ok();
        Ok(stream)
    }

    /// Process one inbound frame and send this turn's outbound frame, if
    /// any. Fan-out to other peers happens after our reply is on the wire.
    fn handle_frame(
        &self,
        payload: &[u8],
        stream: &mut TcpStream,
        node: &Arc<Mutex<Node>>,
        registry: &Arc<PeerRegistry>,
    ) -> io::Result<()> {
        let mut fanout = Vec::new();
        let replies = self.process_frame(payload, node, &mut fanout);
        if let Some(messages) = self.next_outbound(replies) {
            self.send_frame(stream, messages)?;
        }
        registry.fan_out(fanout);
        Ok(())
    }

    /// Decode and dispatch every message in a frame, in order. Returns the
    /// synchronous replies (errors, info responses, status updates) that
    /// belong in this turn's outbound frame.
    fn process_frame(
        &self,
        payload: &[u8],
        node: &Arc<Mutex<Node>>,
        fanout: &mut Vec<(String, Message)>,
    ) -> Vec<Message> {
        let (sender, raw_messages) = match Envelope::parse_frame(payload) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("bad frame from {}: {}", self.peer_name, e.message);
                return vec![e.to_message()];
            }
        };
        if sender != self.peer_name {
            warn!(
                "frame from '{sender}' on session bound to '{}'",
                self.peer_name
            );
            return vec![Message::error(
                ErrorKind::InternalError,
                format!("Device name mismatch: {sender} != {}", self.peer_name),
            )];
        }
        debug!(
            "received {} message(s) from {}",
            raw_messages.len(),
            self.peer_name
        );

        // The peer is talking to us: a frame opens a turn if none is open.
        {
            let mut inner = self.lock();
            if inner.turn == TurnState::Idle {
                inner.turn = TurnState::InTurnResponding;
            }
        }

        let mut replies = Vec::new();
        for raw in &raw_messages {
            let message = match Message::from_value(raw) {
                Ok(message) => message,
                Err(e) => {
                    warn!("undecodable message from {}: {}", self.peer_name, e.message);
                    replies.push(e.to_message());
                    continue;
                }
            };
            match &message {
                Message::StatusUpdate {
                    channel_index,
                    channel_type,
                    params,
                } => {
                    let errors = self.lock().mirror.apply(
                        false,
                        *channel_index,
                        Some(channel_type),
                        params,
                    );
                    replies.extend(errors);
                }
                Message::InfoResponse {
                    channel_index,
                    channel_type,
                    body,
                } => {
                    let errors = self.lock().mirror.apply(
                        true,
                        *channel_index,
                        channel_type.as_deref(),
                        body,
                    );
                    replies.extend(errors);
                }
                Message::ErrorResponse {
                    error_value,
                    error_string,
                } => {
                    warn!(
                        "error response from {}: {error_value} ({error_string})",
                        self.peer_name
                    );
                }
                Message::EndResponse => {
                    // End of the peer's turn; anything after it in this
                    // frame is not processed.
                    self.lock().turn = TurnState::Idle;
                    break;
                }
                _ => {
                    let dispatch = lock_node(node).process_message(&self.peer_name, &message);
                    replies.extend(dispatch.replies);
                    for follow_up in dispatch.enqueue_self {
                        self.enqueue_batch(vec![follow_up]);
                    }
                    fanout.extend(dispatch.fanout);
                }
            }
        }
        replies
    }

    /// Pick this turn's outbound frame: replies if any, otherwise the next
    /// queued batch, otherwise an `endResponse` if a turn is open,
    /// otherwise nothing.
    fn next_outbound(&self, replies: Vec<Message>) -> Option<Vec<Message>> {
        if !replies.is_empty() {
            return Some(replies);
        }
        let mut inner = self.lock();
        if let Some(batch) = inner.queue.pop_front() {
            if inner.turn == TurnState::Idle {
                inner.turn = TurnState::InTurnInitiated;
            }
            Some(batch)
        } else if inner.turn.is_open() {
            inner.turn = TurnState::Idle;
            Some(vec![Message::EndResponse])
        } else {
            None
        }
    }

    /// Take the next queued batch if the session is idle, opening a turn.
    fn pop_initiation(&self) -> Option<Vec<Message>> {
        let mut inner = self.lock();
        if inner.turn == TurnState::Idle {
            if let Some(batch) = inner.queue.pop_front() {
                inner.turn = TurnState::InTurnInitiated;
                return Some(batch);
            }
        }
        None
    }

    fn send_frame(&self, stream: &mut TcpStream, messages: Vec<Message>) -> io::Result<()> {
        let envelope = Envelope::new(self.local_name.clone(), messages);
        let frame = encode_frame(&envelope)?;
        debug!(
            "sending {} message(s) to {}",
            envelope.messages.len(),
            self.peer_name
        );
        write_all_blocking(stream, &frame)
    }

    fn teardown(&self, node: &Arc<Mutex<Node>>, registry: &Arc<PeerRegistry>) {
        self.end();
        // Only clean up peer state if this session is still the registered
        // one; an adopted replacement owns the peer now.
        if registry.remove_session_entry(&self.peer_name, self) {
            lock_node(node).peer_lost(&self.peer_name);
        }
        info!("session with {} ended", self.peer_name);
    }
}

/// Write a whole buffer to a non-blocking socket, waiting out transient
/// `WouldBlock` stalls so a frame is never left half-sent.
fn write_all_blocking(stream: &mut TcpStream, mut data: &[u8]) -> io::Result<()> {
    use std::io::Write;
    while !data.is_empty() {
        match stream.write(data) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned 0",
                ))
            }
            Ok(n) => data = &data[n..],
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                thread::sleep(Duration::from_millis(1));
            }
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn lock_node(node: &Arc<Mutex<Node>>) -> std::sync::MutexGuard<'_, Node> {
    node.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
