//! Real-time broadcast hub served over WebSockets.
//!
//! Every connected client receives every chat message plus join, leave and
//! roster notifications. Each module owns one concern:
//!
//! - [`hub`] owns the membership set and runs the single control loop that
//!   serializes joins, leaves and broadcasts.
//! - [`session`] bridges one connection's inbound frames into hub events
//!   and picks display names.
//! - [`message`] defines the broadcast envelope and its JSON wire format.
//! - [`server`] exposes the `/ws` upgrade endpoint with axum.
//! - [`client`] is a terminal client for talking to a running hub.
//! - [`cli`] parses the command line for both modes.

pub mod cli;
pub mod client;
pub mod hub;
pub mod message;
pub mod server;
pub mod session;
