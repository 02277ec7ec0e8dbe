//! Device discovery and the public mapping lifecycle API.
//!
//! A [`PcpPortMapper`] talks to one discovered device. Each lifecycle
//! operation (`map_port`, `refresh_port`, `unmap_port`) is exactly one
//! exchange with a fresh nonce; the device correlates refresh and
//! release with the original lease by the (protocol, internal port)
//! tuple, which is why both take the previously granted handle.

use crate::error::PcpError;
use crate::exchange::{self, ExchangeCodec, RetryPolicy};
use crate::packet::{
    AnnounceRequest, AnnounceResponse, MapRequest, MapResponse, Nonce, PCP_SERVER_PORT, Protocol,
    ResultCode,
};
use burrow_bus::{Bus, next_id, spawn_worker};
use burrow_gateways::{NetEvent, NetRequest};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Bounded wait for the gateway's local-address reply during discovery.
const LOCAL_ADDR_WAIT: Duration = Duration::from_secs(2);

/// One leased NAT binding.
///
/// Immutable: a successful refresh returns a replacement handle, and a
/// successful unmap invalidates the handle on the device. The caller is
/// responsible for refreshing before `lifetime` elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappedPort {
    /// Transport protocol of the mapping
    pub protocol: Protocol,
    /// Internal (local) port
    pub internal_port: u16,
    /// External port assigned by the device
    pub external_port: u16,
    /// External address assigned by the device
    pub external_addr: IpAddr,
    /// Granted lease in seconds
    pub lifetime: u32,
    /// Device that granted the lease
    pub device: SocketAddr,
}

/// Mapping lifecycle operations against one discovered device.
///
/// Implementations for other mapping protocols (NAT-PMP, UPnP-IGD)
/// share this surface; they differ only in the codec they inject into
/// the exchange engine.
pub trait PortMapper {
    /// Request an inbound mapping.
    ///
    /// # Errors
    ///
    /// [`PcpError::InvalidArgument`] for a zero internal port or zero
    /// lifetime (use [`PortMapper::unmap_port`] to release), plus the
    /// exchange engine's transport/timeout/refusal errors.
    fn map_port(
        &self,
        protocol: Protocol,
        internal_port: u16,
        suggested_external_port: u16,
        lifetime: u32,
    ) -> Result<MappedPort, PcpError>;

    /// Extend an existing lease, returning the replacement handle.
    ///
    /// # Errors
    ///
    /// As [`PortMapper::map_port`]; refreshing a released or expired
    /// handle surfaces as [`PcpError::Refused`].
    fn refresh_port(&self, existing: &MappedPort, lifetime: u32) -> Result<MappedPort, PcpError>;

    /// Release a lease immediately.
    ///
    /// # Errors
    ///
    /// The exchange engine's transport/timeout/refusal errors.
    fn unmap_port(&self, existing: &MappedPort) -> Result<(), PcpError>;
}

/// PCP implementation of [`PortMapper`] for one device.
#[derive(Debug, Clone)]
pub struct PcpPortMapper {
    net: Bus<NetRequest>,
    device: SocketAddr,
    client_addr: IpAddr,
    policy: RetryPolicy,
}

impl PcpPortMapper {
    /// Build a mapper for a known device.
    ///
    /// `client_addr` is the local interface address the device sees;
    /// PCP servers validate it against the packet source.
    #[must_use]
    pub fn new(net: Bus<NetRequest>, device: SocketAddr, client_addr: IpAddr) -> Self {
        Self {
            net,
            device,
            client_addr,
            policy: RetryPolicy::default(),
        }
    }

    /// Replace the retransmission schedule.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Address of the device this mapper talks to.
    #[must_use]
    pub fn device(&self) -> SocketAddr {
        self.device
    }

    fn run_map(&self, request: MapRequest) -> Result<MapResponse, PcpError> {
        let response = exchange::run(
            &MapExchange { request },
            &self.net,
            self.device,
            &self.policy,
        )?;
        if response.result != ResultCode::Success {
            return Err(PcpError::Refused(response.result));
        }
        Ok(response)
    }
}

impl PortMapper for PcpPortMapper {
    fn map_port(
        &self,
        protocol: Protocol,
        internal_port: u16,
        suggested_external_port: u16,
        lifetime: u32,
    ) -> Result<MappedPort, PcpError> {
        if internal_port == 0 {
            return Err(PcpError::InvalidArgument("internal port must be non-zero"));
        }
        if lifetime == 0 {
            return Err(PcpError::InvalidArgument(
                "lifetime must be non-zero; use unmap_port to release",
            ));
        }

        let response = self.run_map(MapRequest {
            client_addr: self.client_addr,
            lifetime,
            nonce: Nonce::generate(),
            protocol,
            internal_port,
            suggested_external_port,
            suggested_external_addr: unspecified_for(self.device),
        })?;

        info!(
            "mapped {protocol:?} {internal_port} -> {}:{} for {}s via {}",
            response.external_addr, response.external_port, response.lifetime, self.device
        );
        Ok(MappedPort {
            protocol,
            internal_port,
            external_port: response.external_port,
            external_addr: response.external_addr,
            lifetime: response.lifetime,
            device: self.device,
        })
    }

    fn refresh_port(&self, existing: &MappedPort, lifetime: u32) -> Result<MappedPort, PcpError> {
        if lifetime == 0 {
            return Err(PcpError::InvalidArgument(
                "lifetime must be non-zero; use unmap_port to release",
            ));
        }

        // The device correlates by (protocol, internal port), so the
        // refresh must repeat the original tuple exactly.
        let response = self.run_map(MapRequest {
            client_addr: self.client_addr,
            lifetime,
            nonce: Nonce::generate(),
            protocol: existing.protocol,
            internal_port: existing.internal_port,
            suggested_external_port: existing.external_port,
            suggested_external_addr: existing.external_addr,
        })?;

        debug!(
            "refreshed {:?} {} for {}s via {}",
            existing.protocol, existing.internal_port, response.lifetime, self.device
        );
        Ok(MappedPort {
            protocol: existing.protocol,
            internal_port: existing.internal_port,
            external_port: response.external_port,
            external_addr: response.external_addr,
            lifetime: response.lifetime,
            device: self.device,
        })
    }

    fn unmap_port(&self, existing: &MappedPort) -> Result<(), PcpError> {
        self.run_map(MapRequest {
            client_addr: self.client_addr,
            lifetime: 0,
            nonce: Nonce::generate(),
            protocol: existing.protocol,
            internal_port: existing.internal_port,
            suggested_external_port: 0,
            suggested_external_addr: unspecified_for(self.device),
        })?;

        info!(
            "released {:?} {} via {}",
            existing.protocol, existing.internal_port, self.device
        );
        Ok(())
    }
}

/// MAP exchange: correlates by the request nonce.
struct MapExchange {
    request: MapRequest,
}

impl ExchangeCodec for MapExchange {
    type Output = MapResponse;

    fn request_bytes(&self) -> Vec<u8> {
        self.request.encode()
    }

    fn match_response(&self, payload: &[u8]) -> Option<MapResponse> {
        match MapResponse::decode(payload) {
            Ok(response) if response.nonce == self.request.nonce => Some(response),
            Ok(_) => {
                trace!("nonce mismatch, response belongs to another exchange");
                None
            }
            Err(e) => {
                trace!("discarding undecodable datagram: {e}");
                None
            }
        }
    }
}

/// ANNOUNCE exchange: the probe socket is private to the exchange, so
/// any well-formed ANNOUNCE response on it is the device answering.
struct AnnounceExchange {
    request: AnnounceRequest,
}

impl ExchangeCodec for AnnounceExchange {
    type Output = AnnounceResponse;

    fn request_bytes(&self) -> Vec<u8> {
        self.request.encode()
    }

    fn match_response(&self, payload: &[u8]) -> Option<AnnounceResponse> {
        match AnnounceResponse::decode(payload) {
            Ok(response) => Some(response),
            Err(e) => {
                trace!("discarding undecodable datagram: {e}");
                None
            }
        }
    }
}

/// Pluggable derivation of candidate device addresses from the host's
/// local addresses.
pub trait GatewayResolver: Send + Sync {
    /// Candidate `(local interface address, device address)` pairs to
    /// probe. The local address becomes the probing mapper's client
    /// address.
    fn candidates(&self, local: &[IpAddr]) -> Vec<(IpAddr, SocketAddr)>;
}

/// Default resolver: assumes the device is the `.1` host of each
/// private IPv4 /24, the convention of consumer routers.
#[derive(Debug, Clone)]
pub struct HeuristicResolver {
    /// Device UDP port to probe
    pub port: u16,
}

impl Default for HeuristicResolver {
    fn default() -> Self {
        Self {
            port: PCP_SERVER_PORT,
        }
    }
}

impl GatewayResolver for HeuristicResolver {
    fn candidates(&self, local: &[IpAddr]) -> Vec<(IpAddr, SocketAddr)> {
        local
            .iter()
            .filter_map(|addr| match addr {
                IpAddr::V4(v4) if v4.is_private() => {
                    let o = v4.octets();
                    let device = Ipv4Addr::new(o[0], o[1], o[2], 1);
                    (device != *v4)
                        .then(|| (*addr, SocketAddr::new(IpAddr::V4(device), self.port)))
                }
                _ => None,
            })
            .collect()
    }
}

/// Resolver with an explicit device list; pairs each device with a
/// local address of the same family.
#[derive(Debug, Clone)]
pub struct StaticResolver {
    /// Devices to probe
    pub devices: Vec<SocketAddr>,
}

impl GatewayResolver for StaticResolver {
    fn candidates(&self, local: &[IpAddr]) -> Vec<(IpAddr, SocketAddr)> {
        self.devices
            .iter()
            .map(|device| {
                let client = local
                    .iter()
                    .find(|l| l.is_ipv4() == device.is_ipv4())
                    .copied()
                    .unwrap_or_else(|| unspecified_for(*device));
                (client, *device)
            })
            .collect()
    }
}

/// Discover PCP-capable devices.
///
/// Probes every candidate concurrently with an ANNOUNCE exchange and
/// returns a mapper per device that answered. Candidates that time out
/// are absent, not failed: discovery only errors when the gateway
/// itself never answers the local-address query.
///
/// # Errors
///
/// [`PcpError::Timeout`] if the network gateway does not report local
/// addresses within a bounded wait.
pub fn identify(
    net: &Bus<NetRequest>,
    resolver: &dyn GatewayResolver,
    policy: &RetryPolicy,
) -> Result<Vec<PcpPortMapper>, PcpError> {
    let reply = Bus::new();
    net.send(NetRequest::GetLocalAddresses {
        reply: reply.clone(),
    });
    let local = match reply.recv_timeout(LOCAL_ADDR_WAIT) {
        Some(NetEvent::LocalAddresses(addrs)) => addrs,
        Some(other) => {
            trace!("unexpected event on address query bus: {other:?}");
            Vec::new()
        }
        None => return Err(PcpError::Timeout),
    };

    let candidates = resolver.candidates(&local);
    debug!("probing {} candidate devices", candidates.len());

    let results: Bus<(IpAddr, SocketAddr, Result<AnnounceResponse, PcpError>)> = Bus::new();
    let probes = candidates.len();
    for (client, device) in candidates {
        let net = net.clone();
        let policy = *policy;
        let results = results.clone();
        let _ = spawn_worker(&format!("burrow-pcp-probe-{}", next_id()), move || {
            let codec = AnnounceExchange {
                request: AnnounceRequest {
                    client_addr: client,
                },
            };
            let outcome = exchange::run(&codec, &net, device, &policy);
            results.send((client, device, outcome));
        });
    }

    let mut mappers = Vec::new();
    for _ in 0..probes {
        let (client, device, outcome) = results.recv();
        match outcome {
            Ok(response) if response.result == ResultCode::Success => {
                info!("PCP device at {device} (epoch {})", response.epoch);
                mappers.push(PcpPortMapper::new(net.clone(), device, client));
            }
            Ok(response) => {
                debug!("device at {device} answered with {:?}", response.result);
            }
            Err(PcpError::Timeout) => debug!("no PCP response from {device}"),
            Err(e) => warn!("probe of {device} failed: {e}"),
        }
    }
    Ok(mappers)
}

/// Unspecified address in the device's address family.
fn unspecified_for(device: SocketAddr) -> IpAddr {
    if device.is_ipv4() {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    } else {
        IpAddr::V6(Ipv6Addr::UNSPECIFIED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_mapper() -> PcpPortMapper {
        PcpPortMapper::new(
            Bus::new(),
            "192.0.2.1:5351".parse().unwrap(),
            "192.168.1.20".parse().unwrap(),
        )
    }

    #[test]
    fn test_map_rejects_zero_port_before_io() {
        let mapper = dummy_mapper();
        // No gateway consumes the bus; an argument error must surface
        // without any exchange being attempted.
        let err = mapper.map_port(Protocol::Udp, 0, 0, 3600).unwrap_err();
        assert!(matches!(err, PcpError::InvalidArgument(_)));
    }

    #[test]
    fn test_map_rejects_zero_lifetime_before_io() {
        let mapper = dummy_mapper();
        let err = mapper.map_port(Protocol::Udp, 5000, 0, 0).unwrap_err();
        assert!(matches!(err, PcpError::InvalidArgument(_)));
    }

    #[test]
    fn test_refresh_rejects_zero_lifetime() {
        let mapper = dummy_mapper();
        let handle = MappedPort {
            protocol: Protocol::Tcp,
            internal_port: 8080,
            external_port: 8080,
            external_addr: "203.0.113.9".parse().unwrap(),
            lifetime: 600,
            device: mapper.device(),
        };
        let err = mapper.refresh_port(&handle, 0).unwrap_err();
        assert!(matches!(err, PcpError::InvalidArgument(_)));
    }

    #[test]
    fn test_heuristic_resolver_targets_dot_one() {
        let resolver = HeuristicResolver::default();
        let local = vec![
            "192.168.1.20".parse().unwrap(),
            "10.0.3.7".parse().unwrap(),
            // Public and loopback addresses produce no candidates.
            "203.0.113.9".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
        ];
        let candidates = resolver.candidates(&local);
        assert_eq!(candidates.len(), 2);
        assert_eq!(
            candidates[0],
            (
                "192.168.1.20".parse().unwrap(),
                "192.168.1.1:5351".parse().unwrap()
            )
        );
        assert_eq!(
            candidates[1],
            ("10.0.3.7".parse().unwrap(), "10.0.3.1:5351".parse().unwrap())
        );
    }

    #[test]
    fn test_heuristic_resolver_skips_the_device_itself() {
        let resolver = HeuristicResolver::default();
        let local = vec!["192.168.1.1".parse().unwrap()];
        assert!(resolver.candidates(&local).is_empty());
    }

    #[test]
    fn test_static_resolver_pairs_matching_family() {
        let resolver = StaticResolver {
            devices: vec!["192.0.2.1:5351".parse().unwrap()],
        };
        let local = vec![
            "2001:db8::5".parse().unwrap(),
            "192.168.1.20".parse().unwrap(),
        ];
        let candidates = resolver.candidates(&local);
        assert_eq!(
            candidates,
            vec![(
                "192.168.1.20".parse().unwrap(),
                "192.0.2.1:5351".parse().unwrap()
            )]
        );
    }

    #[test]
    fn test_static_resolver_falls_back_to_unspecified() {
        let resolver = StaticResolver {
            devices: vec!["192.0.2.1:5351".parse().unwrap()],
        };
        let candidates = resolver.candidates(&[]);
        assert_eq!(candidates[0].0, "0.0.0.0".parse::<IpAddr>().unwrap());
    }
}
