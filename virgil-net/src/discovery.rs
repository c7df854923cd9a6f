//! mDNS advertisement and browsing for Virgil nodes on the LAN.
//!
//! Every node advertises `<name>._virgil._tcp.local.` with its model and
//! device type in the TXT record, and browses the same service type for
//! peers. Browse results for our own name are filtered out.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use virgil_types::DeviceIdentity;

/// Service type for Virgil mDNS discovery.
pub const SERVICE_TYPE: &str = "_virgil._tcp.local.";

/// A change in the set of Virgil peers visible on the network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// A peer was resolved at this address.
    Found { name: String, ip: IpAddr },
    /// A peer's advertisement went away.
    Lost { name: String },
}

/// Advertises this node and browses for peers until dropped.
pub struct Discovery {
    daemon: ServiceDaemon,
    service_fullname: String,
    events: Receiver<DiscoveryEvent>,
    stop_tx: Sender<()>,
    _browser: thread::JoinHandle<()>,
}

impl Discovery {
    /// Register our advertisement and start browsing.
    pub fn start(identity: &DeviceIdentity, port: u16) -> Result<Self, String> {
        let daemon =
            ServiceDaemon::new().map_err(|e| format!("Failed to create mDNS daemon: {e}"))?;

        let hostname = gethostname::gethostname().to_string_lossy().to_string();
        let ip = local_ipv4();

        let mut properties = HashMap::new();
        properties.insert("model".to_string(), identity.model.clone());
        properties.insert("deviceType".to_string(), identity.device_type.clone());

        let service = ServiceInfo::new(
            SERVICE_TYPE,
            &identity.name,
            &format!("{hostname}.local."),
            IpAddr::V4(ip),
            port,
            properties,
        )
        .map_err(|e| format!("Failed to create service info: {e}"))?;

        let fullname = service.get_fullname().to_string();
        daemon
            .register(service)
            .map_err(|e| format!("Failed to register service: {e}"))?;
        info!("mDNS advertisement registered: {fullname} at {ip}:{port}");

        let browse_rx = daemon
            .browse(SERVICE_TYPE)
            .map_err(|e| format!("Failed to browse: {e}"))?;

        let (event_tx, event_rx) = mpsc::channel();
        let (stop_tx, stop_rx) = mpsc::channel();
        let self_name = identity.name.clone();
        let browser = thread::spawn(move || {
            browse_loop(browse_rx, event_tx, stop_rx, &self_name);
        });

        Ok(Self {
            daemon,
            service_fullname: fullname,
            events: event_rx,
            stop_tx,
            _browser: browser,
        })
    }

    /// Channel of peer found/lost events. Blocks the caller on `recv`;
    /// use `try_recv` to poll.
    pub fn events(&self) -> &Receiver<DiscoveryEvent> {
        &self.events
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.daemon.unregister(&self.service_fullname) {
            warn!("Failed to unregister mDNS service: {e}");
        }
        info!("mDNS advertisement unregistered");
    }
}

/// Background loop translating mDNS service events into discovery events.
fn browse_loop(
    browse_rx: mdns_sd::Receiver<ServiceEvent>,
    event_tx: Sender<DiscoveryEvent>,
    stop_rx: Receiver<()>,
    self_name: &str,
) {
    info!("mDNS browser started for {SERVICE_TYPE}");
    loop {
        if stop_rx.try_recv().is_ok() {
            break;
        }
        match browse_rx.recv_timeout(Duration::from_millis(100)) {
            Ok(ServiceEvent::ServiceResolved(service)) => {
                let Some(name) = instance_name(service.get_fullname()) else {
                    continue;
                };
                // Don't react to our own advertisement.
                if name == self_name {
                    continue;
                }
                let Some(ip) = service.get_addresses().iter().next().copied() else {
                    warn!("resolved {name} without an address, ignoring");
                    continue;
                };
                info!("discovered peer {name} at {ip}");
                if event_tx
                    .send(DiscoveryEvent::Found { name, ip })
                    .is_err()
                {
                    break;
                }
            }
            Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                let Some(name) = instance_name(&fullname) else {
                    continue;
                };
                if name == self_name {
                    continue;
                }
                info!("peer {name} left the network");
                if event_tx.send(DiscoveryEvent::Lost { name }).is_err() {
                    break;
                }
            }
            // Service updates carry nothing we act on.
            Ok(_) => {}
            Err(flume::RecvTimeoutError::Timeout) => {}
            Err(flume::RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("mDNS browser stopped");
}

/// Extract the instance name from a service fullname such as
/// `spkA._virgil._tcp.local.`.
fn instance_name(fullname: &str) -> Option<String> {
    let name = fullname.split('.').next()?;
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

/// The IPv4 address to advertise: the address a datagram socket would use
/// to reach the wider network, falling back to loopback.
pub fn local_ipv4() -> Ipv4Addr {
    fn probe() -> Option<Ipv4Addr> {
        let socket = UdpSocket::bind(("0.0.0.0", 0)).ok()?;
        socket.connect(("8.8.8.8", 80)).ok()?;
        match socket.local_addr().ok()? {
            std::net::SocketAddr::V4(addr) => Some(*addr.ip()),
            _ => None,
        }
    }
    probe().unwrap_or_else(|| {
        error!("could not determine local IPv4 address, advertising loopback");
        Ipv4Addr::LOCALHOST
    })
}
