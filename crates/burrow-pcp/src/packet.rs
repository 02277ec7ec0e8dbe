//! PCP packet encoding and decoding (RFC 6887 wire layout).
//!
//! All multi-byte integers are big-endian. Addresses always travel as
//! 16-byte IPv6-mapped values regardless of the underlying family. A
//! request and its response share a fixed 24-byte common header; the MAP
//! opcode adds a fixed 36-byte payload. Decoding is strict: a short
//! frame, an unknown version, or the wrong opcode is a hard failure,
//! never a partial result.

use crate::error::DecodeError;
use rand::RngCore;
use std::net::{IpAddr, Ipv6Addr};

/// PCP protocol version implemented here.
pub const PCP_VERSION: u8 = 2;

/// UDP port PCP servers listen on.
pub const PCP_SERVER_PORT: u16 = 5351;

/// Nonce length in bytes (96 bits).
pub const NONCE_LEN: usize = 12;

/// Common request/response header length.
pub const HEADER_LEN: usize = 24;

/// MAP opcode payload length.
pub const MAP_PAYLOAD_LEN: usize = 36;

/// Full MAP packet length (header plus payload).
pub const MAP_PACKET_LEN: usize = HEADER_LEN + MAP_PAYLOAD_LEN;

/// High bit of the opcode byte: set on responses, clear on requests.
const RESPONSE_BIT: u8 = 0x80;

/// PCP opcodes used by this engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// No-op probe; used for device discovery
    Announce = 0,
    /// Create, refresh, or release an inbound mapping
    Map = 1,
}

/// Transport protocol of a mapping, as an IANA protocol number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Protocol {
    /// TCP (protocol number 6)
    Tcp = 6,
    /// UDP (protocol number 17)
    Udp = 17,
}

impl TryFrom<u8> for Protocol {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            6 => Ok(Self::Tcp),
            17 => Ok(Self::Udp),
            other => Err(DecodeError::Protocol(other)),
        }
    }
}

/// Client-generated 96-bit correlation value.
///
/// The transport has no other request id: a response belongs to a
/// request exactly when it echoes the request's nonce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_LEN]);

impl Nonce {
    /// Generate a fresh random nonce.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Build a nonce from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; NONCE_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw nonce bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

/// PCP result codes (RFC 6887 §7.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    /// Request succeeded
    Success,
    /// Server does not speak this version
    UnsupportedVersion,
    /// Client lacks authorization for the request
    NotAuthorized,
    /// Request could not be parsed by the server
    MalformedRequest,
    /// Opcode not supported by the server
    UnsupportedOpcode,
    /// An option in the request is not supported
    UnsupportedOption,
    /// An option in the request could not be parsed
    MalformedOption,
    /// Transient server-side network failure
    NetworkFailure,
    /// Server is out of resources for new mappings
    NoResources,
    /// Protocol number not supported for mappings
    UnsupportedProtocol,
    /// Client exceeded its mapping quota
    UserExceededQuota,
    /// Server cannot provide the requested external endpoint
    CannotProvideExternal,
    /// Request's client address does not match the packet source
    AddressMismatch,
    /// Too many remote peers on a filtered mapping
    ExcessiveRemotePeers,
    /// Any other code
    Other(u8),
}

impl From<u8> for ResultCode {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Success,
            1 => Self::UnsupportedVersion,
            2 => Self::NotAuthorized,
            3 => Self::MalformedRequest,
            4 => Self::UnsupportedOpcode,
            5 => Self::UnsupportedOption,
            6 => Self::MalformedOption,
            7 => Self::NetworkFailure,
            8 => Self::NoResources,
            9 => Self::UnsupportedProtocol,
            10 => Self::UserExceededQuota,
            11 => Self::CannotProvideExternal,
            12 => Self::AddressMismatch,
            13 => Self::ExcessiveRemotePeers,
            other => Self::Other(other),
        }
    }
}

impl ResultCode {
    /// Wire value of this result code.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::UnsupportedVersion => 1,
            Self::NotAuthorized => 2,
            Self::MalformedRequest => 3,
            Self::UnsupportedOpcode => 4,
            Self::UnsupportedOption => 5,
            Self::MalformedOption => 6,
            Self::NetworkFailure => 7,
            Self::NoResources => 8,
            Self::UnsupportedProtocol => 9,
            Self::UserExceededQuota => 10,
            Self::CannotProvideExternal => 11,
            Self::AddressMismatch => 12,
            Self::ExcessiveRemotePeers => 13,
            Self::Other(other) => other,
        }
    }
}

/// Encode an address into its 16-byte IPv6-mapped wire form.
fn encode_addr(addr: IpAddr) -> [u8; 16] {
    match addr {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

/// Decode a 16-byte wire address, unmapping IPv4 where applicable.
fn decode_addr(bytes: [u8; 16]) -> IpAddr {
    let v6 = Ipv6Addr::from(bytes);
    match v6.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(v6),
    }
}

fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn read_addr(bytes: &[u8]) -> IpAddr {
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&bytes[..16]);
    decode_addr(raw)
}

fn read_nonce(bytes: &[u8]) -> Nonce {
    let mut raw = [0u8; NONCE_LEN];
    raw.copy_from_slice(&bytes[..NONCE_LEN]);
    Nonce::from_bytes(raw)
}

/// Validate the common response header for the expected opcode.
fn check_response_header(
    bytes: &[u8],
    expected_opcode: Opcode,
    min_len: usize,
) -> Result<(), DecodeError> {
    if bytes.len() < min_len {
        return Err(DecodeError::TooShort {
            expected: min_len,
            actual: bytes.len(),
        });
    }
    if bytes[0] != PCP_VERSION {
        return Err(DecodeError::Version(bytes[0]));
    }
    if bytes[1] & RESPONSE_BIT == 0 {
        return Err(DecodeError::NotAResponse);
    }
    if bytes[1] & !RESPONSE_BIT != expected_opcode as u8 {
        return Err(DecodeError::Opcode(bytes[1]));
    }
    Ok(())
}

/// A MAP request: create, refresh, or (with lifetime 0) release a
/// mapping for one (protocol, internal port) tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapRequest {
    /// Address of the requesting host, for server-side validation
    pub client_addr: IpAddr,
    /// Requested lease in seconds; 0 releases the mapping
    pub lifetime: u32,
    /// Correlation nonce echoed by the response
    pub nonce: Nonce,
    /// Transport protocol of the mapping
    pub protocol: Protocol,
    /// Internal (local) port being mapped
    pub internal_port: u16,
    /// External port the client would like; 0 for "any"
    pub suggested_external_port: u16,
    /// External address the client would like; unspecified for "any"
    pub suggested_external_addr: IpAddr,
}

impl MapRequest {
    /// Encode into the fixed 60-byte wire frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAP_PACKET_LEN);
        buf.push(PCP_VERSION);
        buf.push(Opcode::Map as u8);
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&self.lifetime.to_be_bytes());
        buf.extend_from_slice(&encode_addr(self.client_addr));
        buf.extend_from_slice(self.nonce.as_bytes());
        buf.push(self.protocol as u8);
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&self.internal_port.to_be_bytes());
        buf.extend_from_slice(&self.suggested_external_port.to_be_bytes());
        buf.extend_from_slice(&encode_addr(self.suggested_external_addr));
        buf
    }

    /// Decode a MAP request frame (used by servers and simulators).
    ///
    /// # Errors
    ///
    /// Fails on short frames, unknown versions, a set response bit, a
    /// non-MAP opcode, or an unknown protocol number.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < MAP_PACKET_LEN {
            return Err(DecodeError::TooShort {
                expected: MAP_PACKET_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != PCP_VERSION {
            return Err(DecodeError::Version(bytes[0]));
        }
        if bytes[1] & RESPONSE_BIT != 0 {
            return Err(DecodeError::Opcode(bytes[1]));
        }
        if bytes[1] != Opcode::Map as u8 {
            return Err(DecodeError::Opcode(bytes[1]));
        }

        Ok(Self {
            client_addr: read_addr(&bytes[8..24]),
            lifetime: read_u32(&bytes[4..8]),
            nonce: read_nonce(&bytes[24..36]),
            protocol: Protocol::try_from(bytes[36])?,
            internal_port: read_u16(&bytes[40..42]),
            suggested_external_port: read_u16(&bytes[42..44]),
            suggested_external_addr: read_addr(&bytes[44..60]),
        })
    }
}

/// A MAP response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MapResponse {
    /// Result code; anything but `Success` means the mapping was refused
    pub result: ResultCode,
    /// Lifetime granted in seconds (may differ from the request)
    pub lifetime: u32,
    /// Server's seconds-since-start clock, for loss-of-state detection
    pub epoch: u32,
    /// Echo of the request nonce
    pub nonce: Nonce,
    /// Transport protocol of the mapping
    pub protocol: Protocol,
    /// Internal port of the mapping
    pub internal_port: u16,
    /// External port actually assigned
    pub external_port: u16,
    /// External address actually assigned
    pub external_addr: IpAddr,
}

impl MapResponse {
    /// Encode into the fixed 60-byte wire frame (used by servers and
    /// simulators).
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MAP_PACKET_LEN);
        buf.push(PCP_VERSION);
        buf.push(Opcode::Map as u8 | RESPONSE_BIT);
        buf.push(0);
        buf.push(self.result.as_u8());
        buf.extend_from_slice(&self.lifetime.to_be_bytes());
        buf.extend_from_slice(&self.epoch.to_be_bytes());
        buf.extend_from_slice(&[0u8; 12]);
        buf.extend_from_slice(self.nonce.as_bytes());
        buf.push(self.protocol as u8);
        buf.extend_from_slice(&[0u8; 3]);
        buf.extend_from_slice(&self.internal_port.to_be_bytes());
        buf.extend_from_slice(&self.external_port.to_be_bytes());
        buf.extend_from_slice(&encode_addr(self.external_addr));
        buf
    }

    /// Decode a MAP response frame.
    ///
    /// # Errors
    ///
    /// Fails on short frames, unknown versions, a clear response bit, a
    /// non-MAP opcode, or an unknown protocol number.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        check_response_header(bytes, Opcode::Map, MAP_PACKET_LEN)?;

        Ok(Self {
            result: ResultCode::from(bytes[3]),
            lifetime: read_u32(&bytes[4..8]),
            epoch: read_u32(&bytes[8..12]),
            nonce: read_nonce(&bytes[24..36]),
            protocol: Protocol::try_from(bytes[36])?,
            internal_port: read_u16(&bytes[40..42]),
            external_port: read_u16(&bytes[42..44]),
            external_addr: read_addr(&bytes[44..60]),
        })
    }
}

/// An ANNOUNCE request: a no-op probe that elicits a response from any
/// PCP server listening at the destination. Used by discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    /// Address of the requesting host
    pub client_addr: IpAddr,
}

impl AnnounceRequest {
    /// Encode into the fixed 24-byte wire frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.push(PCP_VERSION);
        buf.push(Opcode::Announce as u8);
        buf.extend_from_slice(&[0u8; 2]);
        buf.extend_from_slice(&0u32.to_be_bytes());
        buf.extend_from_slice(&encode_addr(self.client_addr));
        buf
    }

    /// Decode an ANNOUNCE request frame (used by servers and
    /// simulators).
    ///
    /// # Errors
    ///
    /// Fails on short frames, unknown versions, or the wrong opcode.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() < HEADER_LEN {
            return Err(DecodeError::TooShort {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        if bytes[0] != PCP_VERSION {
            return Err(DecodeError::Version(bytes[0]));
        }
        if bytes[1] != Opcode::Announce as u8 {
            return Err(DecodeError::Opcode(bytes[1]));
        }
        Ok(Self {
            client_addr: read_addr(&bytes[8..24]),
        })
    }
}

/// An ANNOUNCE response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Result code
    pub result: ResultCode,
    /// Lifetime field (0 for ANNOUNCE)
    pub lifetime: u32,
    /// Server's seconds-since-start clock
    pub epoch: u32,
}

impl AnnounceResponse {
    /// Encode into the fixed 24-byte wire frame.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.push(PCP_VERSION);
        buf.push(Opcode::Announce as u8 | RESPONSE_BIT);
        buf.push(0);
        buf.push(self.result.as_u8());
        buf.extend_from_slice(&self.lifetime.to_be_bytes());
        buf.extend_from_slice(&self.epoch.to_be_bytes());
        buf.extend_from_slice(&[0u8; 12]);
        buf
    }

    /// Decode an ANNOUNCE response frame.
    ///
    /// # Errors
    ///
    /// Fails on short frames, unknown versions, a clear response bit, or
    /// a non-ANNOUNCE opcode.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        check_response_header(bytes, Opcode::Announce, HEADER_LEN)?;
        Ok(Self {
            result: ResultCode::from(bytes[3]),
            lifetime: read_u32(&bytes[4..8]),
            epoch: read_u32(&bytes[8..12]),
        })
    }
}
