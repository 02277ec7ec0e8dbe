//! UDP network gateway.
//!
//! The network gateway is the only component that touches sockets. A
//! single command worker consumes the gateway bus; each bound socket gets
//! a dedicated blocking reader thread that pushes inbound datagrams to
//! the listener bus registered when the socket was opened. Delivery is
//! ordered per socket and unordered across sockets.

use crate::error::GatewayError;
use burrow_bus::{Bus, Gateway, spawn_worker};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Largest datagram the reader threads will accept.
///
/// PCP caps messages at 1100 bytes; leave headroom for other protocols
/// sharing the gateway.
const MAX_DATAGRAM: usize = 2048;

/// Network gateway configuration.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// OS receive buffer size per socket
    pub recv_buffer_size: usize,
    /// OS send buffer size per socket
    pub send_buffer_size: usize,
    /// Read timeout used by reader threads to poll their stop flag
    pub poll_interval: Duration,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 256 * 1024,
            send_buffer_size: 256 * 1024,
            poll_interval: Duration::from_millis(50),
        }
    }
}

/// Requests accepted on the network gateway's bus.
///
/// Each request carries the response bus its terminal outcome is
/// delivered to; required fields make malformed requests unrepresentable.
#[derive(Debug)]
pub enum NetRequest {
    /// Bind a UDP socket and register `reply` as its datagram listener.
    ///
    /// Terminal outcome: [`NetEvent::SocketOpened`] or
    /// [`NetEvent::Error`], both carrying `id`. The same `id` names the
    /// socket in subsequent requests.
    OpenSocket {
        /// Correlation id; doubles as the socket handle
        id: u64,
        /// Local address to bind (unspecified address / port 0 for any)
        local_addr: SocketAddr,
        /// Receives the open outcome and all inbound datagrams
        reply: Bus<NetEvent>,
    },
    /// Send one datagram from an open socket.
    ///
    /// Terminal outcome: [`NetEvent::WriteAck`] or [`NetEvent::Error`].
    WriteDatagram {
        /// Correlation id for the write
        id: u64,
        /// Socket handle from a previous [`NetRequest::OpenSocket`]
        socket: u64,
        /// Destination address
        dest: SocketAddr,
        /// Datagram payload
        payload: Vec<u8>,
        /// Receives the write outcome
        reply: Bus<NetEvent>,
    },
    /// Enumerate the host's non-loopback addresses.
    ///
    /// Terminal outcome: [`NetEvent::LocalAddresses`].
    GetLocalAddresses {
        /// Receives the address list
        reply: Bus<NetEvent>,
    },
    /// Close an open socket and stop its reader thread.
    CloseSocket {
        /// Socket handle to close
        socket: u64,
    },
    /// Stop the gateway, closing every socket.
    Shutdown,
}

/// Responses and notifications emitted by the network gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetEvent {
    /// A socket was bound and its reader started
    SocketOpened {
        /// Correlation id of the open request
        id: u64,
        /// Address the socket actually bound to
        local_addr: SocketAddr,
    },
    /// A datagram was handed to the OS
    WriteAck {
        /// Correlation id of the write request
        id: u64,
        /// Bytes written
        bytes: usize,
    },
    /// A datagram arrived on a socket this gateway has bound
    DatagramReceived {
        /// Remote address the datagram came from
        source: SocketAddr,
        /// Datagram payload
        payload: Vec<u8>,
    },
    /// The host's non-loopback addresses
    LocalAddresses(Vec<IpAddr>),
    /// An operation failed at the OS level
    Error {
        /// Correlation id of the failed request
        id: u64,
        /// Failure description
        cause: String,
    },
}

/// Gateway actor owning all UDP sockets.
///
/// # Examples
///
/// ```no_run
/// use burrow_bus::{Bus, Gateway, next_id};
/// use burrow_gateways::{NetConfig, NetEvent, NetRequest, NetworkGateway};
///
/// let gateway = NetworkGateway::spawn(NetConfig::default());
/// let reply = Bus::new();
/// gateway.bus().send(NetRequest::OpenSocket {
///     id: next_id(),
///     local_addr: "0.0.0.0:0".parse().unwrap(),
///     reply: reply.clone(),
/// });
/// match reply.recv() {
///     NetEvent::SocketOpened { local_addr, .. } => println!("bound {local_addr}"),
///     other => panic!("unexpected {other:?}"),
/// }
/// gateway.shutdown();
/// ```
pub struct NetworkGateway {
    bus: Bus<NetRequest>,
    worker: JoinHandle<()>,
}

impl NetworkGateway {
    /// Start the gateway worker. Returns once it is accepting requests.
    #[must_use]
    pub fn spawn(config: NetConfig) -> Self {
        let bus = Bus::new();
        let inbox = bus.clone();
        let worker = spawn_worker("burrow-net", move || worker_loop(&inbox, &config));
        info!("network gateway started");
        Self { bus, worker }
    }
}

impl Gateway for NetworkGateway {
    type Request = NetRequest;

    fn bus(&self) -> Bus<NetRequest> {
        self.bus.clone()
    }

    fn shutdown(self) {
        self.bus.send(NetRequest::Shutdown);
        if self.worker.join().is_err() {
            warn!("network gateway worker panicked during shutdown");
        }
    }
}

struct SocketEntry {
    socket: Arc<UdpSocket>,
    stop: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl SocketEntry {
    fn close(self) {
        self.stop.store(true, Ordering::Release);
        let _ = self.reader.join();
    }
}

fn worker_loop(inbox: &Bus<NetRequest>, config: &NetConfig) {
    let mut sockets: HashMap<u64, SocketEntry> = HashMap::new();

    loop {
        match inbox.recv() {
            NetRequest::OpenSocket {
                id,
                local_addr,
                reply,
            } => match open_socket(id, local_addr, config, reply.clone()) {
                Ok((entry, bound)) => {
                    debug!("socket {id} bound to {bound}");
                    sockets.insert(id, entry);
                    reply.send(NetEvent::SocketOpened {
                        id,
                        local_addr: bound,
                    });
                }
                Err(e) => {
                    warn!("failed to open socket on {local_addr}: {e}");
                    reply.send(NetEvent::Error {
                        id,
                        cause: e.to_string(),
                    });
                }
            },
            NetRequest::WriteDatagram {
                id,
                socket,
                dest,
                payload,
                reply,
            } => match sockets.get(&socket) {
                Some(entry) => match entry.socket.send_to(&payload, dest) {
                    Ok(bytes) => {
                        trace!("socket {socket}: wrote {bytes} bytes to {dest}");
                        reply.send(NetEvent::WriteAck { id, bytes });
                    }
                    Err(e) => {
                        warn!("socket {socket}: write to {dest} failed: {e}");
                        reply.send(NetEvent::Error {
                            id,
                            cause: e.to_string(),
                        });
                    }
                },
                None => reply.send(NetEvent::Error {
                    id,
                    cause: format!("no open socket with handle {socket}"),
                }),
            },
            NetRequest::GetLocalAddresses { reply } => {
                reply.send(NetEvent::LocalAddresses(local_addresses()));
            }
            NetRequest::CloseSocket { socket } => {
                if let Some(entry) = sockets.remove(&socket) {
                    entry.close();
                    debug!("socket {socket} closed");
                }
            }
            NetRequest::Shutdown => break,
        }
    }

    for (id, entry) in sockets.drain() {
        entry.close();
        debug!("socket {id} closed on shutdown");
    }
    info!("network gateway stopped");
}

fn open_socket(
    id: u64,
    local_addr: SocketAddr,
    config: &NetConfig,
    listener: Bus<NetEvent>,
) -> Result<(SocketEntry, SocketAddr), GatewayError> {
    let socket = Arc::new(bind_socket(local_addr, config)?);
    let bound = socket.local_addr()?;
    socket.set_read_timeout(Some(config.poll_interval))?;

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let socket = Arc::clone(&socket);
        let stop = Arc::clone(&stop);
        spawn_worker(&format!("burrow-net-reader-{id}"), move || {
            reader_loop(&socket, &listener, &stop);
        })
    };

    Ok((
        SocketEntry {
            socket,
            stop,
            reader,
        },
        bound,
    ))
}

/// Bind a UDP socket with tuned buffers, as a blocking std socket.
fn bind_socket(local_addr: SocketAddr, config: &NetConfig) -> Result<UdpSocket, GatewayError> {
    let domain = if local_addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };

    let socket = socket2::Socket::new(
        domain,
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_recv_buffer_size(config.recv_buffer_size)?;
    socket.set_send_buffer_size(config.send_buffer_size)?;
    socket.bind(&local_addr.into())?;

    Ok(socket.into())
}

fn reader_loop(socket: &UdpSocket, listener: &Bus<NetEvent>, stop: &AtomicBool) {
    let mut buf = [0u8; MAX_DATAGRAM];
    while !stop.load(Ordering::Acquire) {
        match socket.recv_from(&mut buf) {
            Ok((len, source)) => {
                trace!("datagram of {len} bytes from {source}");
                listener.send(NetEvent::DatagramReceived {
                    source,
                    payload: buf[..len].to_vec(),
                });
            }
            // Timeout: re-check the stop flag. ConnectionRefused: an ICMP
            // port-unreachable bounced back for an earlier send; the
            // socket is still usable.
            Err(e)
                if matches!(
                    e.kind(),
                    ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::ConnectionRefused
                ) => {}
            Err(e) => {
                warn!("socket read failed, stopping reader: {e}");
                break;
            }
        }
    }
}

/// Enumerate the host's non-loopback addresses.
///
/// Uses the UDP-connect trick: connecting a datagram socket selects a
/// source address by routing without sending any packet.
fn local_addresses() -> Vec<IpAddr> {
    let probes: [(SocketAddr, SocketAddr); 2] = [
        (
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            "8.8.8.8:53".parse().unwrap_or_else(|_| unreachable!()),
        ),
        (
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
            "[2001:4860:4860::8888]:53"
                .parse()
                .unwrap_or_else(|_| unreachable!()),
        ),
    ];

    let mut out = Vec::new();
    for (bind, probe) in probes {
        let Ok(socket) = UdpSocket::bind(bind) else {
            continue;
        };
        if socket.connect(probe).is_err() {
            continue;
        }
        if let Ok(addr) = socket.local_addr() {
            let ip = addr.ip();
            if !ip.is_loopback() && !ip.is_unspecified() && !out.contains(&ip) {
                out.push(ip);
            }
        }
    }
    debug!("local addresses: {out:?}");
    out
}
