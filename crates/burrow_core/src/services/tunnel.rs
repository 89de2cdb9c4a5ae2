//! SSH tunnel forwarding a local port to a host reachable from the SSH server.
//!
//! [`Tunnel`] is the seam the client talks to; [`SshTunnel`] implements it
//! with russh `direct-tcpip` channels, one per accepted local socket.

use crate::error::BurrowError;
use crate::models::{Endpoint, SshAuthMethod, SshTunnelConfig};

use async_trait::async_trait;
use russh::client;
use russh_keys::key::KeyPair;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Delay between attempts to reach the forward target.
const READY_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Buffer size for each direction of a forwarded socket.
const FORWARD_BUFFER_SIZE: usize = 8192;

/// A port forward that can be started and stopped.
#[async_trait]
pub trait Tunnel: Send {
    /// Start forwarding. Returns the local endpoint once it accepts connections.
    ///
    /// Starting a running tunnel returns its current endpoint.
    async fn start(&mut self) -> Result<Endpoint, BurrowError>;

    /// Local endpoint, if the tunnel is running.
    fn local_endpoint(&self) -> Option<Endpoint>;

    /// Stop forwarding. Stopping a stopped tunnel does nothing.
    fn stop(&mut self);

    /// Check if the tunnel is running.
    fn is_active(&self) -> bool {
        self.local_endpoint().is_some()
    }
}

/// Creates unstarted tunnels from configuration.
pub trait TunnelBuilder: Send + Sync {
    /// Build a tunnel for the given configuration. Does not start it.
    fn build(&self, config: &SshTunnelConfig) -> Box<dyn Tunnel>;
}

/// Builds [`SshTunnel`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshTunnelBuilder;

impl TunnelBuilder for SshTunnelBuilder {
    fn build(&self, config: &SshTunnelConfig) -> Box<dyn Tunnel> {
        Box::new(SshTunnel::new(config.clone()))
    }
}

/// SSH client handler for russh.
struct SshClientHandler;

#[async_trait]
impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // No known_hosts verification
        Ok(true)
    }
}

/// Tunnel over an SSH connection.
pub struct SshTunnel {
    config: SshTunnelConfig,
    local: Option<Endpoint>,
    cancel_token: Option<CancellationToken>,
}

impl SshTunnel {
    /// Create an unstarted tunnel.
    pub fn new(config: SshTunnelConfig) -> Self {
        Self { config, local: None, cancel_token: None }
    }

    /// Get the tunnel configuration.
    pub fn config(&self) -> &SshTunnelConfig {
        &self.config
    }

    /// Connect and authenticate to the SSH server.
    async fn connect_ssh(
        config: &SshTunnelConfig,
    ) -> Result<client::Handle<SshClientHandler>, BurrowError> {
        let ssh_config = Arc::new(client::Config::default());

        let mut handle = client::connect(
            ssh_config,
            (config.ssh_host.as_str(), config.ssh_port),
            SshClientHandler,
        )
        .await
        .map_err(|e| {
            BurrowError::ssh_with_hint(
                format!(
                    "Failed to connect to SSH server {}:{}: {e}",
                    config.ssh_host, config.ssh_port
                ),
                "Verify the SSH server is running and reachable",
            )
        })?;

        let authenticated = match &config.auth_method {
            SshAuthMethod::Key { path, passphrase } => {
                Self::authenticate_key_file(
                    &mut handle,
                    &config.ssh_username,
                    path,
                    passphrase.as_deref(),
                )
                .await?
            }
            SshAuthMethod::Agent => {
                Self::authenticate_with_agent(&mut handle, &config.ssh_username).await?
            }
        };

        if !authenticated {
            return Err(BurrowError::ssh_with_hint(
                format!("SSH authentication failed for {}", config.ssh_username),
                "Check your SSH username and key",
            ));
        }

        tracing::debug!(
            user = %config.ssh_username,
            ssh_host = %config.ssh_host,
            "SSH authentication successful"
        );

        Ok(handle)
    }

    /// Authenticate using a private key file.
    async fn authenticate_key_file(
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
        path: &Path,
        passphrase: Option<&str>,
    ) -> Result<bool, BurrowError> {
        let key = Self::load_private_key(path, passphrase).await?;

        handle.authenticate_publickey(username, key).await.map_err(|e| {
            BurrowError::ssh_with_hint(
                format!("SSH key authentication failed: {e}"),
                "Verify your SSH key is valid and has the correct permissions",
            )
        })
    }

    /// Load a private key from a file.
    async fn load_private_key(
        path: &Path,
        passphrase: Option<&str>,
    ) -> Result<Arc<KeyPair>, BurrowError> {
        let key_data = tokio::fs::read(path).await.map_err(|e| {
            BurrowError::ssh_with_hint(
                format!("Failed to read SSH key file {}: {e}", path.display()),
                "Check that the key file exists and is readable",
            )
        })?;

        let key = russh_keys::decode_secret_key(&String::from_utf8_lossy(&key_data), passphrase)
            .map_err(|e| {
                let hint = if passphrase.is_some() {
                    "Check your key passphrase is correct"
                } else {
                    "The key may be encrypted - provide the passphrase"
                };
                BurrowError::ssh_with_hint(format!("Failed to parse SSH key: {e}"), hint)
            })?;

        Ok(Arc::new(key))
    }

    /// Authenticate using the SSH agent, trying each identity in turn.
    #[cfg(unix)]
    async fn authenticate_with_agent(
        handle: &mut client::Handle<SshClientHandler>,
        username: &str,
    ) -> Result<bool, BurrowError> {
        use russh_keys::agent::client::AgentClient;
        use tokio::net::UnixStream;

        let socket_path = std::env::var("SSH_AUTH_SOCK").map_err(|_| {
            BurrowError::ssh_with_hint(
                "SSH agent not available (SSH_AUTH_SOCK not set)",
                "Start your SSH agent with: eval $(ssh-agent), or configure a key file",
            )
        })?;

        let stream = UnixStream::connect(&socket_path).await.map_err(|e| {
            BurrowError::ssh_with_hint(
                format!("Failed to connect to SSH agent: {e}"),
                "Ensure your SSH agent is running",
            )
        })?;

        let mut agent = AgentClient::connect(stream);
        let identities = agent.request_identities().await.map_err(|e| {
            BurrowError::ssh_with_hint(
                format!("Failed to get identities from SSH agent: {e}"),
                "Ensure your SSH agent is running and has keys loaded",
            )
        })?;

        if identities.is_empty() {
            return Err(BurrowError::ssh_with_hint(
                "No identities available in SSH agent",
                "Add your SSH key to the agent with: ssh-add",
            ));
        }

        for identity in identities {
            let (returned_agent, auth_result) =
                handle.authenticate_future(username, identity.clone(), agent).await;
            agent = returned_agent;

            match auth_result {
                Ok(true) => return Ok(true),
                Ok(false) => tracing::debug!("SSH agent key rejected, trying next"),
                Err(e) => tracing::debug!(error = %e, "SSH agent auth error, trying next"),
            }
        }

        Ok(false)
    }

    #[cfg(not(unix))]
    async fn authenticate_with_agent(
        _handle: &mut client::Handle<SshClientHandler>,
        _username: &str,
    ) -> Result<bool, BurrowError> {
        Err(BurrowError::ssh_with_hint(
            "SSH agent authentication is only supported on Unix",
            "Configure a private key file instead",
        ))
    }

    /// Accept local sockets and forward each through its own SSH channel.
    async fn run_tunnel(
        listener: TcpListener,
        ssh_client: Arc<Mutex<client::Handle<SshClientHandler>>>,
        remote_host: String,
        remote_port: u16,
        cancel_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((local_stream, peer_addr)) => {
                            tracing::trace!(%peer_addr, "New tunnel connection");

                            let ssh_client = ssh_client.clone();
                            let remote_host = remote_host.clone();
                            let cancel = cancel_token.clone();

                            tokio::spawn(async move {
                                if let Err(e) = Self::forward_connection(
                                    local_stream,
                                    ssh_client,
                                    &remote_host,
                                    remote_port,
                                    cancel,
                                )
                                .await
                                {
                                    tracing::warn!(error = %e, "Tunnel forwarding error");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Failed to accept tunnel connection");
                        }
                    }
                }
                _ = cancel_token.cancelled() => {
                    tracing::debug!(%remote_host, remote_port, "Tunnel forwarding loop stopped");
                    break;
                }
            }
        }
    }

    /// Forward a single connection through the SSH tunnel.
    async fn forward_connection(
        mut local_stream: TcpStream,
        ssh_client: Arc<Mutex<client::Handle<SshClientHandler>>>,
        remote_host: &str,
        remote_port: u16,
        cancel_token: CancellationToken,
    ) -> Result<(), BurrowError> {
        let channel = {
            let handle = ssh_client.lock().await;
            handle
                .channel_open_direct_tcpip(remote_host, remote_port as u32, "127.0.0.1", 0)
                .await
                .map_err(|e| {
                    BurrowError::ssh_with_hint(
                        format!("Failed to open SSH channel to {remote_host}:{remote_port}: {e}"),
                        "The SSH server may not allow TCP forwarding",
                    )
                })?
        };

        let mut channel = channel.into_stream();
        let mut buf_local = [0u8; FORWARD_BUFFER_SIZE];
        let mut buf_remote = [0u8; FORWARD_BUFFER_SIZE];

        loop {
            tokio::select! {
                n = local_stream.read(&mut buf_local) => {
                    match n {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if channel.write_all(&buf_local[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                n = channel.read(&mut buf_remote) => {
                    match n {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if local_stream.write_all(&buf_remote[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }

        Ok(())
    }

    /// Open and close one `direct-tcpip` channel to the forward target.
    ///
    /// The SSH server only confirms the channel once it has connected to
    /// `remote_host:remote_port` itself.
    async fn check_forward(
        ssh_client: &Mutex<client::Handle<SshClientHandler>>,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<(), BurrowError> {
        let channel = ssh_client
            .lock()
            .await
            .channel_open_direct_tcpip(remote_host, remote_port as u32, "127.0.0.1", 0)
            .await
            .map_err(|e| {
                BurrowError::ssh(format!(
                    "Failed to open SSH channel to {remote_host}:{remote_port}: {e}"
                ))
            })?;

        if let Err(e) = channel.close().await {
            tracing::trace!(error = %e, "Failed to close readiness channel");
        }
        Ok(())
    }
}

/// Bind the local end of a tunnel. A configured port of `None` asks the OS for one.
async fn bind_local(config: &SshTunnelConfig) -> Result<TcpListener, BurrowError> {
    let bind_port = config.local_bind_port.unwrap_or(0);
    TcpListener::bind((config.local_bind_host.as_str(), bind_port)).await.map_err(|e| {
        BurrowError::ssh_with_hint(
            format!(
                "Failed to bind {}:{bind_port} for SSH tunnel: {e}",
                config.local_bind_host
            ),
            "Try a different local port or let the system choose one automatically",
        )
    })
}

#[async_trait]
impl Tunnel for SshTunnel {
    async fn start(&mut self) -> Result<Endpoint, BurrowError> {
        if let Some(local) = &self.local {
            return Ok(local.clone());
        }

        let ssh_client = Self::connect_ssh(&self.config).await?;
        let ssh_client = Arc::new(Mutex::new(ssh_client));

        let remote_host = self.config.remote_host.clone();
        let remote_port = self.config.remote_port;
        let target = format!("{remote_host}:{remote_port}");
        let ready_timeout = Duration::from_millis(self.config.ready_timeout_ms);
        wait_until_ready(
            || Self::check_forward(&ssh_client, &remote_host, remote_port),
            ready_timeout,
            &target,
        )
        .await?;

        let listener = bind_local(&self.config).await?;
        let local_addr = listener.local_addr()?;

        let cancel_token = CancellationToken::new();
        tokio::spawn(Self::run_tunnel(
            listener,
            ssh_client,
            remote_host,
            remote_port,
            cancel_token.clone(),
        ));

        tracing::debug!(
            local = %local_addr,
            remote_host = %self.config.remote_host,
            remote_port = self.config.remote_port,
            ssh_host = %self.config.ssh_host,
            "SSH tunnel started"
        );

        let local = Endpoint::new(self.config.local_bind_host.clone(), local_addr.port());
        self.local = Some(local.clone());
        self.cancel_token = Some(cancel_token);
        Ok(local)
    }

    fn local_endpoint(&self) -> Option<Endpoint> {
        self.local.clone()
    }

    fn stop(&mut self) {
        if let Some(token) = self.cancel_token.take() {
            token.cancel();
        }
        if let Some(local) = self.local.take() {
            tracing::debug!(local = %local, "SSH tunnel stopped");
        }
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        if let Some(token) = &self.cancel_token {
            token.cancel();
        }
    }
}

/// Retry `check` until it succeeds or `timeout` elapses.
///
/// Each attempt is bounded by the time left, so a hanging check cannot
/// outlive the deadline.
pub(crate) async fn wait_until_ready<F, Fut>(
    mut check: F,
    timeout: Duration,
    target: impl fmt::Display,
) -> Result<(), BurrowError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), BurrowError>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let error = match tokio::time::timeout(remaining, check()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "no answer from SSH server".to_string(),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(BurrowError::ssh_with_hint(
                format!(
                    "Tunnel target {target} not reachable after {}ms: {error}",
                    timeout.as_millis()
                ),
                "Check remote_host and remote_port, or increase ready_timeout_ms",
            ));
        }

        tracing::trace!(%target, %error, "Tunnel target not ready yet");
        tokio::time::sleep(READY_POLL_INTERVAL.min(remaining)).await;
    }
}
