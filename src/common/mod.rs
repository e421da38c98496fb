//! Shared components used by all three roles: the wire protocol, the framed
//! TCP connection and configuration loading.

pub mod config;
pub mod connection;
pub mod messages;
