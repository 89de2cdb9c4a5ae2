//! Blocking ClickHouse client with an optional SSH tunnel.
//!
//! [`DatabaseClient`] owns at most one tunnel and one connection. Both are
//! created lazily and released by `select` (tunnel) or `close`. Every
//! lifecycle step is logged as `<operation>: <STATUS> [→ <detail>]`.

use crate::error::BurrowError;
use crate::models::{ClientState, ConnectionConfig, Endpoint, QueryResult};
use crate::services::{
    Connection, Connector, NativeConnector, SshTunnelBuilder, Tunnel, TunnelBuilder,
};

use std::sync::Arc;
use tokio::runtime::Runtime;
use uuid::Uuid;

/// An open connection owned by a [`DatabaseClient`].
pub struct ConnectionHandle {
    id: Uuid,
    endpoint: Endpoint,
    tunneled: bool,
    connection: Box<dyn Connection>,
}

impl ConnectionHandle {
    /// Unique identifier of this connection.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Endpoint the connection was opened against.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Port the connection was opened against.
    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    /// Whether the connection goes through the SSH tunnel.
    pub fn is_tunneled(&self) -> bool {
        self.tunneled
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("tunneled", &self.tunneled)
            .finish()
    }
}

/// ClickHouse client.
///
/// Calls block the current thread on the client's own runtime, so they must
/// not be made from inside an async context.
pub struct DatabaseClient {
    config: ConnectionConfig,
    connector: Arc<dyn Connector>,
    tunnel_builder: Arc<dyn TunnelBuilder>,
    tunnel: Option<Box<dyn Tunnel>>,
    connection: Option<ConnectionHandle>,
    runtime: Runtime,
}

impl DatabaseClient {
    /// Create a client using the native protocol and russh tunnels.
    pub fn new(config: ConnectionConfig) -> Result<Self, BurrowError> {
        Self::with_backends(config, Arc::new(NativeConnector), Arc::new(SshTunnelBuilder))
    }

    /// Create a client with custom connection and tunnel backends.
    pub fn with_backends(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        tunnel_builder: Arc<dyn TunnelBuilder>,
    ) -> Result<Self, BurrowError> {
        config.validate().map_err(BurrowError::config)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .map_err(|e| BurrowError::internal(format!("Failed to create tokio runtime: {e}")))?;

        Ok(Self { config, connector, tunnel_builder, tunnel: None, connection: None, runtime })
    }

    /// Get the connection configuration.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Get the current lifecycle state.
    pub fn state(&self) -> ClientState {
        if self.connection.is_some() {
            ClientState::ConnectionOpen
        } else if self.tunnel.is_some() {
            ClientState::TunnelOpen
        } else {
            ClientState::Disconnected
        }
    }

    /// Get the open connection, if any.
    pub fn connection(&self) -> Option<&ConnectionHandle> {
        self.connection.as_ref()
    }

    /// Local endpoint of the running tunnel, if any.
    pub fn tunnel_endpoint(&self) -> Option<Endpoint> {
        self.tunnel.as_ref().and_then(|t| t.local_endpoint())
    }

    /// Build an unstarted tunnel from the stored SSH settings.
    pub fn create_tunnel(&self) -> Result<Box<dyn Tunnel>, BurrowError> {
        let tunnel_config = self
            .config
            .ssh_tunnel
            .as_ref()
            .ok_or_else(|| BurrowError::config("No SSH tunnel configured for this connection"))?;
        Ok(self.tunnel_builder.build(tunnel_config))
    }

    /// Open the database connection, through the tunnel if `use_tunnel`.
    ///
    /// Returns the existing handle unchanged when a connection is already open.
    pub fn open_connection(&mut self, use_tunnel: bool) -> Result<&ConnectionHandle, BurrowError> {
        if self.connection.is_some() {
            tracing::warn!(
                "connect: WARNING → Connection to database {} is already established",
                self.config.database
            );
            return self.connection.as_ref().ok_or_else(|| unreachable_state("connection"));
        }

        let started_tunnel = use_tunnel && self.tunnel.is_none();
        if started_tunnel {
            self.start_tunnel()?;
        }

        let (endpoint, tunneled) = match self.tunnel_endpoint() {
            Some(local) => (local, true),
            None => (self.config.direct_endpoint(), false),
        };

        let connect = self.connector.connect(&self.config, &endpoint);
        let connection = match self.runtime.block_on(connect) {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!("connect: ERROR → {e}");
                if started_tunnel {
                    self.release_tunnel();
                }
                return Err(e);
            }
        };

        tracing::info!(
            url = %self.config.display_url(&endpoint),
            "connect: SUCCESS → Connection to database \"{}\" established",
            self.config.database
        );

        let handle = ConnectionHandle { id: Uuid::new_v4(), endpoint, tunneled, connection };
        Ok(self.connection.insert(handle))
    }

    /// Run `sql` and return every row.
    ///
    /// Connects first if needed. A tunnel held when the query finishes is
    /// stopped, together with the connection routed through it.
    pub fn select(&mut self, sql: &str, use_tunnel: bool) -> Result<QueryResult, BurrowError> {
        tracing::info!("select: START");

        let outcome = self.run_select(sql, use_tunnel);
        if let Err(e) = &outcome {
            tracing::error!("select: ERROR → {e}");
        }

        tracing::info!("select: END");
        outcome
    }

    fn run_select(&mut self, sql: &str, use_tunnel: bool) -> Result<QueryResult, BurrowError> {
        if self.connection.is_none() {
            self.open_connection(use_tunnel)?;
        }
        let handle = self.connection.as_ref().ok_or_else(|| unreachable_state("connection"))?;

        let fetched = self.runtime.block_on(handle.connection.fetch_all(sql));
        if fetched.is_ok() {
            tracing::info!(
                "select: SUCCESS → Data from database \"{}\" extracted",
                self.config.database
            );
        }

        if self.tunnel.is_some() {
            self.release_tunnel();
        }
        fetched
    }

    /// Drop the connection and stop the tunnel, if held.
    pub fn close(&mut self) {
        if self.connection.take().is_some() {
            tracing::info!(
                "close: SUCCESS → Connection to database \"{}\" closed",
                self.config.database
            );
        }
        self.release_tunnel();
    }

    fn start_tunnel(&mut self) -> Result<(), BurrowError> {
        let mut tunnel = self.create_tunnel()?;
        match self.runtime.block_on(tunnel.start()) {
            Ok(local) => {
                tracing::info!("tunnel: SUCCESS → Listening on {local}");
                self.tunnel = Some(tunnel);
                Ok(())
            }
            Err(e) => {
                tracing::error!("tunnel: ERROR → {e}");
                tunnel.stop();
                Err(e)
            }
        }
    }

    /// Stop the tunnel. A connection routed through it is dropped too.
    fn release_tunnel(&mut self) {
        let Some(mut tunnel) = self.tunnel.take() else {
            return;
        };
        if self.connection.as_ref().is_some_and(ConnectionHandle::is_tunneled) {
            self.connection = None;
        }
        tunnel.stop();
        tracing::info!("tunnel: STOPPED");
    }
}

fn unreachable_state(what: &str) -> BurrowError {
    BurrowError::internal(format!("{what} missing after it was established"))
}
