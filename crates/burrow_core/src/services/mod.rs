//! Backend services for Burrow.
//!
//! - `connection` - ClickHouse native connections via klickhouse
//! - `tunnel` - SSH port forwarding via russh

pub mod connection;
pub mod tunnel;

pub use connection::{Connection, Connector, NativeConnection, NativeConnector};
pub use tunnel::{SshTunnel, SshTunnelBuilder, Tunnel, TunnelBuilder};
