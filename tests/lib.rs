//! Shared helpers for the BURROW integration tests.
//!
//! The centerpiece is [`FakePcpDevice`], an in-process PCP server on a
//! loopback UDP socket with scripted behaviors, standing in for a NAT
//! device during end-to-end tests.

use burrow_pcp::{
    AnnounceRequest, AnnounceResponse, MapRequest, MapResponse, Nonce, Protocol, ResultCode,
};
use rand::RngCore;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Lease cap the fake device grants regardless of the requested value.
pub const DEVICE_MAX_LIFETIME: u32 = 86_400;

/// External address the fake device assigns to mappings.
pub const DEVICE_EXTERNAL_ADDR: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 1);

/// How a [`FakePcpDevice`] treats inbound requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceBehavior {
    /// Answer correctly and track mappings.
    ///
    /// A MAP with a zero suggested external port creates a mapping
    /// (external port = internal port). A MAP with a non-zero suggested
    /// external port is treated as a refresh and refused with
    /// `NotAuthorized` when the (protocol, internal port) tuple is not
    /// currently mapped, modeling "not found" for released leases.
    /// A MAP with lifetime 0 releases the tuple.
    Normal,
    /// Never reply
    Silent,
    /// Reply with random junk bytes
    Garbage,
    /// Reply correctly but with a corrupted nonce
    WrongNonce,
}

/// In-process PCP server bound to an ephemeral loopback port.
pub struct FakePcpDevice {
    addr: SocketAddr,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl FakePcpDevice {
    /// Start a device with the given behavior.
    pub fn start(behavior: DeviceBehavior) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").expect("bind fake device socket");
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .expect("set read timeout");
        let addr = socket.local_addr().expect("fake device local addr");

        let stop = Arc::new(AtomicBool::new(false));
        let worker = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || device_loop(&socket, behavior, &stop))
        };

        Self {
            addr,
            stop,
            worker: Some(worker),
        }
    }

    /// Address clients should send PCP requests to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Drop for FakePcpDevice {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn device_loop(socket: &UdpSocket, behavior: DeviceBehavior, stop: &AtomicBool) {
    let started = Instant::now();
    let mut mappings: HashMap<(Protocol, u16), u16> = HashMap::new();
    let mut buf = [0u8; 1100];

    while !stop.load(Ordering::Acquire) {
        let (len, from) = match socket.recv_from(&mut buf) {
            Ok(v) => v,
            Err(_) => continue,
        };
        if behavior == DeviceBehavior::Silent {
            continue;
        }
        if behavior == DeviceBehavior::Garbage {
            let mut junk = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut junk);
            let _ = socket.send_to(&junk, from);
            continue;
        }

        let epoch = u32::try_from(started.elapsed().as_secs()).unwrap_or(u32::MAX);
        let request = &buf[..len];
        let reply = if let Ok(map) = MapRequest::decode(request) {
            Some(handle_map(&map, &mut mappings, behavior, epoch).encode())
        } else if AnnounceRequest::decode(request).is_ok() {
            Some(
                AnnounceResponse {
                    result: ResultCode::Success,
                    lifetime: 0,
                    epoch,
                }
                .encode(),
            )
        } else {
            None
        };

        if let Some(reply) = reply {
            let _ = socket.send_to(&reply, from);
        }
    }
}

fn handle_map(
    request: &MapRequest,
    mappings: &mut HashMap<(Protocol, u16), u16>,
    behavior: DeviceBehavior,
    epoch: u32,
) -> MapResponse {
    let tuple = (request.protocol, request.internal_port);

    let (result, lifetime, external_port) = if request.lifetime == 0 {
        // Release: idempotent.
        mappings.remove(&tuple);
        (ResultCode::Success, 0, request.internal_port)
    } else if request.suggested_external_port == 0 {
        // Create: external port mirrors the internal port.
        let external = request.internal_port;
        mappings.insert(tuple, external);
        (
            ResultCode::Success,
            request.lifetime.min(DEVICE_MAX_LIFETIME),
            external,
        )
    } else if let Some(external) = mappings.get(&tuple) {
        // Refresh of a live mapping.
        (
            ResultCode::Success,
            request.lifetime.min(DEVICE_MAX_LIFETIME),
            *external,
        )
    } else {
        // Refresh of a released or never-granted mapping.
        (ResultCode::NotAuthorized, 0, request.suggested_external_port)
    };

    let nonce = if behavior == DeviceBehavior::WrongNonce {
        let mut corrupted = *request.nonce.as_bytes();
        corrupted[0] ^= 0xFF;
        Nonce::from_bytes(corrupted)
    } else {
        request.nonce
    };

    MapResponse {
        result,
        lifetime,
        epoch,
        nonce,
        protocol: request.protocol,
        internal_port: request.internal_port,
        external_port,
        external_addr: IpAddr::V4(DEVICE_EXTERNAL_ADDR),
    }
}

/// Install a tracing subscriber once per test binary.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
