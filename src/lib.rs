//! WebSocket hub for field devices and the experts who assist them.
//!
//! Devices and expert tablets log in over a WebSocket, are tracked per area,
//! and exchange help requests, call state and presence through a central
//! hub. See [`server::Server`] for the entry point.

pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod model;
pub mod protocol;
pub mod server;
pub mod store;
