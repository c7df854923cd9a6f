#![allow(dead_code)]
//! Test harness utilities for virgil-net integration tests.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use virgil_core::{Node, NodeConfig};
use virgil_net::{encode_frame, spawn_acceptor, FrameBuffer, PeerRegistry};
use virgil_types::{Envelope, Message};

/// A node with a live acceptor on an ephemeral port.
pub struct TestNode {
    pub node: Arc<Mutex<Node>>,
    pub registry: Arc<PeerRegistry>,
    pub addr: String,
    pub port: u16,
}

/// Spawn a node named `name` with a `tx` channel (gain, read-only
/// rfLevel) and an empty `rx` channel, listening on 127.0.0.1.
pub fn spawn_test_node(name: &str) -> TestNode {
    spawn_node_with_config(default_config(name))
}

pub fn default_config(name: &str) -> Value {
    json!({
        "Name": name,
        "Model": "RX-4",
        "Type": "rx",
        "Channels": [
            {
                "channelIndex": 0,
                "channelType": "tx",
                "gain": {
                    "dataType": "number",
                    "minValue": -10,
                    "maxValue": 50,
                    "precision": 0.1,
                    "unit": "dB",
                    "value": 10,
                    "readOnly": false
                },
                "rfLevel": {
                    "dataType": "number",
                    "minValue": 0,
                    "maxValue": 100,
                    "precision": 1,
                    "value": 42,
                    "readOnly": true
                }
            },
            {"channelIndex": 0, "channelType": "rx"}
        ]
    })
}

/// Spawn a node from a JSON config value, binding its acceptor to an
/// ephemeral port. `dial_port` is the port its registry dials peers on.
pub fn spawn_node_with_config(config: Value) -> TestNode {
    spawn_node_dialing(config, 0)
}

pub fn spawn_node_dialing(config: Value, dial_port: u16) -> TestNode {
    let config = NodeConfig::parse(&config.to_string()).expect("test config must parse");
    let node = Arc::new(Mutex::new(Node::from_config(&config)));
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind test listener");
    let addr = listener.local_addr().expect("listener addr");
    let registry = PeerRegistry::new(node.clone(), dial_port);
    spawn_acceptor(registry.clone(), listener);
    TestNode {
        node,
        registry,
        addr: addr.to_string(),
        port: addr.port(),
    }
}

/// Poll a condition until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// A raw TCP peer for protocol-level tests: sends envelopes under a fixed
/// name and reassembles reply frames.
pub struct RawPeer {
    pub name: String,
    stream: TcpStream,
    buffer: FrameBuffer,
}

impl RawPeer {
    pub fn connect(name: &str, addr: &str) -> Self {
        let stream = TcpStream::connect(addr).expect("connect to test node");
        stream
            .set_read_timeout(Some(Duration::from_millis(50)))
            .expect("set read timeout");
        Self {
            name: name.to_string(),
            stream,
            buffer: FrameBuffer::new(),
        }
    }

    /// Send one frame carrying these messages.
    pub fn send(&mut self, messages: Vec<Message>) {
        let frame =
            encode_frame(&Envelope::new(self.name.clone(), messages)).expect("encode frame");
        self.stream.write_all(&frame).expect("send frame");
    }

    /// Send one frame with a hand-built JSON payload (for malformed and
    /// unknown-message tests).
    pub fn send_json(&mut self, payload: &Value) {
        let bytes = serde_json::to_vec(payload).expect("serialize payload");
        let mut frame = (bytes.len() as u32).to_be_bytes().to_vec();
        frame.extend(bytes);
        self.stream.write_all(&frame).expect("send frame");
    }

    /// Receive the next frame's messages, panicking after two seconds.
    pub fn recv(&mut self) -> Vec<Message> {
        self.try_recv(Duration::from_secs(2))
            .expect("timed out waiting for a frame")
    }

    /// Receive the next frame's messages within `timeout`, or `None`.
    pub fn try_recv(&mut self, timeout: Duration) -> Option<Vec<Message>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(payload) = self.buffer.next_frame().expect("reassemble frame") {
                let (_, raw) = Envelope::parse_frame(&payload).expect("parse reply envelope");
                return Some(
                    raw.iter()
                        .map(|value| Message::from_value(value).expect("decode reply message"))
                        .collect(),
                );
            }
            let mut buf = [0u8; 4096];
            match self.stream.read(&mut buf) {
                Ok(0) => return None,
                Ok(n) => self.buffer.extend(&buf[..n]),
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if Instant::now() >= deadline {
                        return None;
                    }
                }
                Err(_) => return None,
            }
        }
    }

    /// True once the remote side has closed this connection.
    pub fn is_closed(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 1024];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => return true,
                Ok(_) => {}
                Err(ref e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    if Instant::now() >= deadline {
                        return false;
                    }
                }
                Err(_) => return true,
            }
        }
    }
}
