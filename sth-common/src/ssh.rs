//! SSH transport for remote counter reads.
//!
//! Provides connection management, bounded-timeout command execution, and a
//! per-node connection pool so a sampling tick costs one round trip per node
//! instead of one SSH handshake per node.

use crate::types::{NodeConfig, NodeId};
use openssh::{KnownHosts, Session, SessionBuilder, Stdio};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

/// Default SSH connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default command execution timeout.
///
/// Counter reads are tiny; anything beyond a few seconds means the node is
/// effectively unreachable for this tick.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from the SSH transport layer.
#[derive(Error, Debug)]
pub enum SshError {
    #[error("failed to connect to {destination}: {source}")]
    Connect {
        destination: String,
        #[source]
        source: openssh::Error,
    },

    #[error("not connected to {node}")]
    NotConnected { node: NodeId },

    #[error("failed to run command on {node}: {source}")]
    Exec {
        node: NodeId,
        #[source]
        source: openssh::Error,
    },

    #[error("i/o error reading command output on {node}: {source}")]
    Io {
        node: NodeId,
        #[source]
        source: std::io::Error,
    },

    #[error("command timed out on {node} after {after:?}")]
    Timeout { node: NodeId, after: Duration },
}

/// True if an SSH/transport error message looks like a transient network
/// failure rather than a configuration problem.
///
/// Intentionally conservative: false negatives only cost a failed tick,
/// false positives cause needless retries against a broken setup.
pub fn is_retryable_transport_error_text(message: &str) -> bool {
    let message = message.to_lowercase();

    // Fail-fast: authentication / host trust issues are never transient.
    if message.contains("permission denied")
        || message.contains("host key verification failed")
        || message.contains("could not resolve hostname")
        || message.contains("identity file")
        || message.contains("no such file or directory")
    {
        return false;
    }

    message.contains("timed out")
        || message.contains("connection reset")
        || message.contains("broken pipe")
        || message.contains("connection refused")
        || message.contains("network is unreachable")
        || message.contains("no route to host")
        || message.contains("connection closed")
        || message.contains("kex_exchange_identification")
}

/// Result of a remote command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    /// Exit code of the command.
    pub exit_code: i32,
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Execution duration in milliseconds.
    pub duration_ms: u64,
}

impl CommandResult {
    /// Check if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// SSH connection options.
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Command execution timeout.
    pub command_timeout: Duration,
    /// SSH control master mode for connection reuse.
    pub control_master: bool,
    /// Known hosts policy.
    pub known_hosts: KnownHostsPolicy,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            control_master: true,
            known_hosts: KnownHostsPolicy::Add,
        }
    }
}

/// Known hosts policy for SSH connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KnownHostsPolicy {
    /// Strictly verify known hosts (recommended for production).
    Strict,
    /// Add unknown hosts automatically (for development).
    Add,
    /// Accept all hosts without verification (INSECURE - testing only).
    AcceptAll,
}

/// SSH client for a single node connection.
pub struct SshClient {
    /// Node configuration.
    config: NodeConfig,
    /// SSH options.
    options: SshOptions,
    /// Active SSH session (if connected).
    session: Option<Session>,
}

impl SshClient {
    /// Create a new SSH client for a node.
    pub fn new(config: NodeConfig, options: SshOptions) -> Self {
        Self {
            config,
            options,
            session: None,
        }
    }

    /// Get the node ID.
    pub fn node_id(&self) -> &NodeId {
        &self.config.id
    }

    /// Check if connected to the node.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Connect to the remote node.
    pub async fn connect(&mut self) -> Result<(), SshError> {
        if self.session.is_some() {
            debug!("Already connected to {}", self.config.id);
            return Ok(());
        }

        let destination = format!("{}@{}", self.config.user, self.config.host);
        debug!("Connecting to {} via SSH...", destination);

        let known_hosts = match self.options.known_hosts {
            KnownHostsPolicy::Strict => KnownHosts::Strict,
            KnownHostsPolicy::Add => KnownHosts::Add,
            KnownHostsPolicy::AcceptAll => KnownHosts::Accept,
        };

        let mut builder = SessionBuilder::default();
        builder
            .known_hosts_check(known_hosts)
            .connect_timeout(self.options.connect_timeout);

        // Add identity file if specified
        let identity_path = shellexpand::tilde(&self.config.identity_file);
        if Path::new(identity_path.as_ref()).exists() {
            builder.keyfile(identity_path.as_ref());
        }

        // Enable control master for connection reuse
        if self.options.control_master {
            let control_dir = dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("sth-ssh");

            if let Err(e) = std::fs::create_dir_all(&control_dir) {
                warn!(
                    "Failed to create SSH control directory {:?}: {}",
                    control_dir, e
                );
            }
            builder.control_directory(&control_dir);
        }

        let session =
            builder
                .connect(&destination)
                .await
                .map_err(|source| SshError::Connect {
                    destination: destination.clone(),
                    source,
                })?;

        info!("Connected to {} ({})", self.config.id, self.config.host);
        self.session = Some(session);
        Ok(())
    }

    /// Disconnect from the node.
    pub async fn disconnect(&mut self) -> Result<(), SshError> {
        if let Some(session) = self.session.take() {
            debug!("Disconnecting from {}", self.config.id);
            session.close().await.map_err(|source| SshError::Exec {
                node: self.config.id.clone(),
                source,
            })?;
            info!("Disconnected from {}", self.config.id);
        }
        Ok(())
    }

    /// Execute a command on the remote node with the configured timeout.
    pub async fn execute(&self, command: &str) -> Result<CommandResult, SshError> {
        let node = self.config.id.clone();
        let session = self.session.as_ref().ok_or_else(|| SshError::NotConnected {
            node: node.clone(),
        })?;

        let start = std::time::Instant::now();
        debug!("Executing on {}: {}", node, command);

        let mut child = session
            .command("sh")
            .arg("-c")
            .arg(command)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .await
            .map_err(|source| SshError::Exec {
                node: node.clone(),
                source,
            })?;

        let execution_future = async {
            // Read stdout and stderr concurrently to avoid deadlock if one pipe fills.
            let stdout_handle = child.stdout().take();
            let stderr_handle = child.stderr().take();

            let stdout_fut = async {
                let mut buf = String::new();
                if let Some(mut out) = stdout_handle {
                    out.read_to_string(&mut buf)
                        .await
                        .map_err(|source| SshError::Io {
                            node: node.clone(),
                            source,
                        })?;
                }
                Ok::<String, SshError>(buf)
            };

            let stderr_fut = async {
                let mut buf = String::new();
                if let Some(mut err) = stderr_handle {
                    err.read_to_string(&mut buf)
                        .await
                        .map_err(|source| SshError::Io {
                            node: node.clone(),
                            source,
                        })?;
                }
                Ok::<String, SshError>(buf)
            };

            let (stdout, stderr) = tokio::try_join!(stdout_fut, stderr_fut)?;

            let status = child.wait().await.map_err(|source| SshError::Exec {
                node: node.clone(),
                source,
            })?;

            Ok::<_, SshError>((status, stdout, stderr))
        };

        match tokio::time::timeout(self.options.command_timeout, execution_future).await {
            Ok(result) => {
                let (status, stdout, stderr) = result?;
                let duration = start.elapsed();
                let exit_code = status.code().unwrap_or(-1);

                debug!(
                    "Command completed on {} (exit={}, duration={}ms)",
                    node,
                    exit_code,
                    duration.as_millis()
                );

                Ok(CommandResult {
                    exit_code,
                    stdout,
                    stderr,
                    duration_ms: duration.as_millis() as u64,
                })
            }
            Err(_) => {
                // Dropping the timed-out future drops child and terminates the
                // remote process.
                warn!(
                    "Command timed out on {} after {:?}",
                    node, self.options.command_timeout
                );
                Err(SshError::Timeout {
                    node,
                    after: self.options.command_timeout,
                })
            }
        }
    }

    /// Check if the node is reachable via SSH.
    pub async fn health_check(&self) -> bool {
        match self.execute("echo ok").await {
            Ok(result) => result.success() && result.stdout.trim() == "ok",
            Err(e) => {
                warn!("Health check failed for {}: {}", self.config.id, e);
                false
            }
        }
    }
}

/// Connection pool for managing multiple SSH connections.
pub struct SshPool {
    /// Pool of active connections.
    connections: Arc<RwLock<HashMap<NodeId, Arc<RwLock<SshClient>>>>>,
    /// Default SSH options.
    options: SshOptions,
}

impl SshPool {
    /// Create a new connection pool.
    pub fn new(options: SshOptions) -> Self {
        Self {
            connections: Arc::new(RwLock::new(HashMap::new())),
            options,
        }
    }

    /// Get or create a connection to a node.
    pub async fn get_or_connect(
        &self,
        config: &NodeConfig,
    ) -> Result<Arc<RwLock<SshClient>>, SshError> {
        let node_id = config.id.clone();

        // Check if we already have a connection
        {
            let connections = self.connections.read().await;
            if let Some(client) = connections.get(&node_id) {
                let client_guard = client.read().await;
                if client_guard.is_connected() {
                    debug!("Reusing existing connection to {}", node_id);
                    return Ok(client.clone());
                }
            }
        }

        // Create new connection
        let mut client = SshClient::new(config.clone(), self.options.clone());
        client.connect().await?;

        let client = Arc::new(RwLock::new(client));

        // Store in pool
        {
            let mut connections = self.connections.write().await;
            connections.insert(node_id, client.clone());
        }

        Ok(client)
    }

    /// Close a specific connection.
    pub async fn close(&self, node_id: &NodeId) -> Result<(), SshError> {
        let client = {
            let mut connections = self.connections.write().await;
            connections.remove(node_id)
        };

        if let Some(client) = client {
            let mut client = client.write().await;
            client.disconnect().await?;
        }

        Ok(())
    }

    /// Close all connections.
    pub async fn close_all(&self) {
        let clients: Vec<_> = {
            let mut connections = self.connections.write().await;
            connections.drain().map(|(_, v)| v).collect()
        };

        for client in clients {
            let mut client = client.write().await;
            if let Err(e) = client.disconnect().await {
                error!("Error closing connection: {}", e);
            }
        }
    }

    /// Get the number of active connections.
    pub async fn active_connections(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for SshPool {
    fn default() -> Self {
        Self::new(SshOptions::default())
    }
}
