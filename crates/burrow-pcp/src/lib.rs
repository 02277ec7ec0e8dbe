//! # BURROW PCP
//!
//! Port Control Protocol (RFC 6887) client engine for the BURROW stack.
//!
//! This crate provides:
//! - PCP packet encoding and decoding (fixed-layout big-endian frames)
//! - A generic request/retry/correlation exchange engine over the
//!   network gateway's message contract
//! - Device discovery and the public mapping lifecycle API
//!   (`map_port` / `refresh_port` / `unmap_port`)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     PortMapper / identify                        │
//! │   (mapping lifecycle, device discovery, argument validation)    │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Exchange engine                              │
//! │   (retransmit with backoff, correlate by nonce, bounded wait)   │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     Packet codec                                 │
//! │   (RFC 6887 frames, IPv6-mapped addresses, result codes)        │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine performs no blocking I/O itself: every datagram travels
//! through a [`burrow_gateways::NetworkGateway`] bus, and each call owns
//! a private response bus and a fresh nonce, so concurrent exchanges
//! never interfere.
//!
//! ## Example
//!
//! ```no_run
//! use burrow_bus::Gateway;
//! use burrow_gateways::{NetConfig, NetworkGateway};
//! use burrow_pcp::{HeuristicResolver, PortMapper, Protocol, RetryPolicy, identify};
//!
//! let gateway = NetworkGateway::spawn(NetConfig::default());
//! let mappers = identify(
//!     &gateway.bus(),
//!     &HeuristicResolver::default(),
//!     &RetryPolicy::discovery(),
//! )?;
//! if let Some(mapper) = mappers.first() {
//!     let mapping = mapper.map_port(Protocol::Udp, 12345, 12345, 3600)?;
//!     println!("external endpoint {}:{}", mapping.external_addr, mapping.external_port);
//!     mapper.unmap_port(&mapping)?;
//! }
//! gateway.shutdown();
//! # Ok::<(), burrow_pcp::PcpError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod exchange;
pub mod mapper;
pub mod packet;

pub use error::{DecodeError, PcpError};
pub use exchange::{ExchangeCodec, Outcome, RetryPolicy};
pub use mapper::{
    GatewayResolver, HeuristicResolver, MappedPort, PcpPortMapper, PortMapper, StaticResolver,
    identify,
};
pub use packet::{
    AnnounceRequest, AnnounceResponse, MapRequest, MapResponse, Nonce, Opcode, Protocol,
    ResultCode, PCP_SERVER_PORT, PCP_VERSION,
};
