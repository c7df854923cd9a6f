//! Peer registry and inbound acceptor.
//!
//! Sessions are keyed by peer name, never by socket: a peer that is both
//! discovered by us and dialing in still ends up with exactly one session.
//! The acceptor reads one frame from each inbound connection to learn the
//! peer's name, then either adopts the socket into a new session or closes
//! it if a live session already exists.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use virgil_core::Node;
use virgil_types::{Envelope, Message};

use crate::framing::read_frame;
use crate::session::PeerSession;

/// How long an inbound connection gets to deliver its handshake frame.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PeerRegistry {
    local_name: String,
    /// Port used when dialing discovered peers.
    port: u16,
    node: Arc<Mutex<Node>>,
    peers: Mutex<HashMap<String, Arc<PeerSession>>>,
}

impl PeerRegistry {
    pub fn new(node: Arc<Mutex<Node>>, port: u16) -> Arc<Self> {
        let local_name = lock_node(&node).name().to_string();
        Arc::new(Self {
            local_name,
            port,
            node,
            peers: Mutex::new(HashMap::new()),
        })
    }

    pub fn node(&self) -> Arc<Mutex<Node>> {
        self.node.clone()
    }

    pub fn peer(&self, name: &str) -> Option<Arc<PeerSession>> {
        self.peers().get(name).cloned()
    }

    pub fn peer_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers().keys().cloned().collect();
        names.sort();
        names
    }

    /// Open a session to a discovered peer, seeded with the bootstrap
    /// queue (device info request, per-link info requests, channel links).
    /// No-op if a session with this peer already exists.
    pub fn connect_peer(self: &Arc<Self>, name: &str, ip: IpAddr) {
        let batches = lock_node(&self.node).bootstrap_batches(name);
        let mut peers = self.peers();
        if peers.contains_key(name) {
            debug!("session with {name} already exists");
            return;
        }
        let session = PeerSession::new(name, &self.local_name, ip, self.port, batches);
        peers.insert(name.to_string(), session.clone());
        drop(peers);
        info!("dialing {name} at {ip}");
        session.spawn(self.node.clone(), self.clone(), None, None);
    }

    /// Adopt an inbound socket whose first frame named `peer`. Returns
    /// false (and the caller drops the socket) if a live Virgil session
    /// with that peer already exists — at most one session per peer name.
    pub fn adopt_inbound(
        self: &Arc<Self>,
        peer: &str,
        stream: TcpStream,
        first_frame: Vec<u8>,
    ) -> bool {
        let ip = match stream.peer_addr() {
            Ok(addr) => addr.ip(),
            Err(e) => {
                warn!("rejecting inbound connection without peer address: {e}");
                return false;
            }
        };
        let batches = lock_node(&self.node).bootstrap_batches(peer);
        let mut peers = self.peers();
        if let Some(existing) = peers.get(peer) {
            if existing.is_live() {
                warn!("already have an active session with {peer}, rejecting new connection");
                return false;
            }
            // Stale or half-open session: shut it down and take over.
            existing.end();
        }
        let session = PeerSession::new(peer, &self.local_name, ip, self.port, batches);
        peers.insert(peer.to_string(), session.clone());
        drop(peers);
        info!("adopted inbound connection from {peer} at {ip}");
        session.spawn(self.node.clone(), self.clone(), Some(stream), Some(first_frame));
        true
    }

    /// Queue a message for a peer, if its session is live. Fan-out never
    /// goes to half-open or disabled sessions.
    pub fn enqueue_to(&self, peer: &str, message: Message) -> bool {
        let peers = self.peers();
        match peers.get(peer) {
            Some(session) if session.is_live() => {
                session.enqueue_batch(vec![message]);
                true
            }
            Some(_) => {
                debug!("not delivering to {peer}: session not live");
                false
            }
            None => {
                debug!("not delivering to {peer}: no session");
                false
            }
        }
    }

    pub fn fan_out(&self, updates: Vec<(String, Message)>) {
        for (peer, message) in updates {
            self.enqueue_to(&peer, message);
        }
    }

    /// Tear down the session with a peer, if any.
    pub fn end_peer(&self, name: &str) -> bool {
        let session = self.peer(name);
        match session {
            Some(session) => {
                session.end();
                true
            }
            None => false,
        }
    }

    /// Remove a session from the registry, but only if it is still the
    /// registered one — a replacement adopted for the same peer stays.
    pub(crate) fn remove_session_entry(&self, name: &str, session: &PeerSession) -> bool {
        let mut peers = self.peers();
        match peers.get(name) {
            Some(current) if std::ptr::eq(current.as_ref(), session) => {
                peers.remove(name);
                true
            }
            _ => false,
        }
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<String, Arc<PeerSession>>> {
        self.peers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn lock_node(node: &Arc<Mutex<Node>>) -> MutexGuard<'_, Node> {
    node.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run the listening acceptor on its own thread.
pub fn spawn_acceptor(registry: Arc<PeerRegistry>, listener: TcpListener) -> JoinHandle<()> {
    thread::spawn(move || acceptor_loop(registry, listener))
}

fn acceptor_loop(registry: Arc<PeerRegistry>, listener: TcpListener) {
    match listener.local_addr() {
        Ok(addr) => info!("listening for Virgil sessions on {addr}"),
        Err(_) => info!("listening for Virgil sessions"),
    }
    loop {
        match listener.accept() {
            Ok((stream, addr)) => handle_inbound(&registry, stream, addr),
            Err(e) => {
                warn!("accept error: {e}");
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

/// Read the handshake frame from a fresh inbound connection and hand the
/// socket to the registry. Dropping the socket on any failure closes it.
fn handle_inbound(registry: &Arc<PeerRegistry>, mut stream: TcpStream, addr: SocketAddr) {
    if let Err(e) = stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)) {
        warn!("could not configure inbound socket from {addr}: {e}");
        return;
    }
    let payload = match read_frame(&mut stream) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("no handshake frame from {addr}: {e}");
            return;
        }
    };
    let peer = match Envelope::parse_frame(&payload) {
        Ok((peer, _)) => peer,
        Err(e) => {
            warn!("bad handshake frame from {addr}: {}", e.message);
            return;
        }
    };
    registry.adopt_inbound(&peer, stream, payload);
}
