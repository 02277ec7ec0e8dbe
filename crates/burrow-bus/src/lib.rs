//! # BURROW Bus
//!
//! Actor substrate for the BURROW port-mapping stack.
//!
//! This crate provides:
//! - `Bus<T>`: a thread-safe, unbounded, order-preserving message inbox
//! - The `Gateway` trait: lifecycle contract for actors that own blocking
//!   I/O resources and are reached only through their bus
//! - Correlation-id allocation for request/response matching
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          Caller                                  │
//! │   (blocks on a private response bus, owns no sockets)           │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Bus<T>                                  │
//! │   (unbounded inbox; send never blocks, never reorders)          │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                          Gateway                                 │
//! │   (worker thread(s) performing blocking I/O on owned resources) │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every request a gateway accepts produces exactly one terminal outcome
//! on the request's response bus: the expected response, an error event
//! carrying the request's correlation id, or (for streaming operations)
//! zero or more notifications followed by one terminal notification.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bus;
pub mod gateway;

pub use bus::Bus;
pub use gateway::{Gateway, next_id, spawn_worker};
