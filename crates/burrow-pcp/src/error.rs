//! Error types for the PCP engine.

use crate::packet::ResultCode;
use thiserror::Error;

/// Failures surfaced to the calling application.
///
/// Decode noise never appears here: undecodable or unmatched datagrams
/// are discarded by the exchange engine, and an exchange that only ever
/// saw noise ends in [`PcpError::Timeout`].
#[derive(Debug, Error)]
pub enum PcpError {
    /// Invalid argument, detected before any network I/O
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// The network gateway reported an OS-level failure
    #[error("transport failure: {0}")]
    Transport(String),

    /// No matching response within the retry budget.
    ///
    /// Discovery treats this as "no PCP device here"; explicit mapping
    /// calls treat it as a hard failure.
    #[error("no response from device within the retry budget")]
    Timeout,

    /// The device answered with a non-success result code
    #[error("device refused the request: {0:?}")]
    Refused(ResultCode),
}

/// Packet decode failures.
///
/// Always hard failures, never partial results. The exchange engine
/// treats them as noise to ignore while waiting for a matching response.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// Datagram shorter than the fixed frame for its opcode
    #[error("datagram too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Minimum frame size for the opcode
        expected: usize,
        /// Bytes actually received
        actual: usize,
    },

    /// Unrecognized PCP version byte
    #[error("unsupported PCP version: {0}")]
    Version(u8),

    /// The response bit is not set; this is a request, not a response
    #[error("not a response packet")]
    NotAResponse,

    /// Opcode does not answer the opcode that was sent
    #[error("unexpected opcode: 0x{0:02X}")]
    Opcode(u8),

    /// Protocol number is neither TCP (6) nor UDP (17)
    #[error("unknown protocol number: {0}")]
    Protocol(u8),
}
