//! # BURROW Gateways
//!
//! Concrete gateway actors that isolate all blocking OS work behind the
//! bus substrate:
//!
//! - [`NetworkGateway`]: owns UDP sockets; binds, sends datagrams, and
//!   pushes inbound datagrams to per-socket listener buses
//! - [`ProcessGateway`]: spawns and supervises child processes, streaming
//!   their stdout back as notifications
//!
//! Protocol engines never touch a socket or a child process directly;
//! they speak only the request/event message contracts defined here.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod network;
pub mod process;

pub use error::GatewayError;
pub use network::{NetConfig, NetEvent, NetRequest, NetworkGateway};
pub use process::{ProcEvent, ProcRequest, ProcessGateway};
