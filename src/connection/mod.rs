//! The data consumer side of a station connection: transport, frame I/O and the per-connection
//!  protocol state machine.

pub mod cd11_socket;
pub mod config;
pub mod publisher;
pub mod station_connection;
pub mod transport;
