//! Wires the node together: listener, acceptor, discovery bridge.

use std::io;
use std::net::TcpListener;
use std::sync::{Arc, Mutex, MutexGuard};

use log::info;

use virgil_core::{Node, NodeConfig};
use virgil_net::{spawn_acceptor, Discovery, DiscoveryEvent, PeerRegistry, VIRGIL_PORT};

pub fn run(config: NodeConfig) -> io::Result<()> {
    let node = Arc::new(Mutex::new(Node::from_config(&config)));
    let identity = lock(&node).identity().clone();

    let listener = TcpListener::bind(("0.0.0.0", VIRGIL_PORT))?;
    let registry = PeerRegistry::new(node.clone(), VIRGIL_PORT);
    spawn_acceptor(registry.clone(), listener);

    let discovery = Discovery::start(&identity, VIRGIL_PORT)
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    println!(
        "{} ({}) is on the network, listening on port {VIRGIL_PORT}",
        identity.name, identity.model
    );

    // Bridge discovery events into the peer registry. This parks the main
    // thread for the life of the node.
    for event in discovery.events().iter() {
        match event {
            DiscoveryEvent::Found { name, ip } => {
                // Only dial peers our configuration links to; anyone else
                // is free to connect to us instead.
                if lock(&node).has_known_peer(&name) {
                    registry.connect_peer(&name, ip);
                } else {
                    info!("not dialing {name}: no configured connection");
                }
            }
            DiscoveryEvent::Lost { name } => {
                info!("peer {name} went offline");
                lock(&node).notify_peers_changed();
            }
        }
    }

    Ok(())
}

fn lock(node: &Arc<Mutex<Node>>) -> MutexGuard<'_, Node> {
    node.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
