//! Data models for Burrow.
//!
//! - `connection` - ConnectionConfig, SshTunnelConfig, Endpoint, ClientState
//! - `query` - QueryResult and row views

pub mod connection;
pub mod query;

pub use connection::{
    ClientState, ConnectionConfig, ConnectionConfigBuilder, ConnectionOptions, Endpoint,
    SshAuthMethod, SshTunnelConfig, DEFAULT_NATIVE_PORT,
};
pub use query::{QueryResult, Row};
