//! Core client for running ClickHouse queries, optionally through an SSH tunnel.
//!
//! - **client**: `DatabaseClient`, the blocking connect/query facade
//! - **error**: Error handling grouped by origin
//! - **models**: Connection/tunnel configuration and query results
//! - **services**: Native ClickHouse connections and SSH tunnels
//! - **logging**: Structured logging setup and the lifecycle line format

pub mod client;
pub mod error;
pub mod logging;
pub mod models;
pub mod services;

pub use client::{ConnectionHandle, DatabaseClient};
pub use error::BurrowError;
pub use models::{
    ClientState, ConnectionConfig, ConnectionOptions, Endpoint, QueryResult, Row, SshAuthMethod,
    SshTunnelConfig,
};
pub use services::{Connection, Connector, NativeConnector, SshTunnelBuilder, Tunnel, TunnelBuilder};
