//! SSH local port forwarding.
//!
//! Binds `127.0.0.1:0`, accepts connections on it and pipes each one
//! through a `direct-tcpip` channel to the database.

use crate::config::{Credentials, SecretStorage};
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use russh::client;
use russh_keys::key::KeyPair;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const DEFAULT_SSH_PORT: u16 = 22;
const MODE: &str = "ssh";

/// Where to SSH to and what to forward.
#[derive(Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub server_host: String,
    pub server_port: u16,
    pub user: String,
    pub key_path: Option<PathBuf>,
    pub password: Option<String>,
    /// Forward destination as seen from the SSH server.
    pub remote_host: String,
    pub remote_port: u16,
}

impl fmt::Debug for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshTarget")
            .field("server_host", &self.server_host)
            .field("server_port", &self.server_port)
            .field("user", &self.user)
            .field("key_path", &self.key_path)
            .field(
                "password",
                &self.password.as_deref().map(SecretStorage::mask_secret),
            )
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}

impl SshTarget {
    /// Builds the target for a database listening on `db_port`.
    ///
    /// Through a jump host the forward goes to `DB_HOST`; when the SSH
    /// server is the database host it goes to its loopback.
    pub fn from_credentials(credentials: &Credentials, db_port: u16) -> Result<Self> {
        let user = credentials.ssh_user.clone().ok_or_else(|| {
            CourierError::config("SSH_USER is required for SSH connections")
        })?;
        let server_host = credentials.ssh_server().to_string();
        let remote_host = if server_host == credentials.host {
            "127.0.0.1".to_string()
        } else {
            credentials.host.clone()
        };

        Ok(Self {
            server_host,
            server_port: credentials.ssh_port.unwrap_or(DEFAULT_SSH_PORT),
            user,
            key_path: credentials.ssh_key_path.clone(),
            password: credentials.ssh_password.clone(),
            remote_host,
            remote_port: db_port,
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }
}

/// SSH client handler for russh.
struct ForwardHandler;

#[async_trait]
impl client::Handler for ForwardHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // TODO: verify against ~/.ssh/known_hosts
        Ok(true)
    }
}

type SharedHandle = Arc<Mutex<client::Handle<ForwardHandler>>>;

/// An active local port forward. Dropping it stops forwarding.
pub struct SshForward {
    local_port: u16,
    remote_host: String,
    remote_port: u16,
    handle: SharedHandle,
    cancel_token: CancellationToken,
}

impl fmt::Debug for SshForward {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshForward")
            .field("local_port", &self.local_port)
            .field("remote_host", &self.remote_host)
            .field("remote_port", &self.remote_port)
            .finish()
    }
}

impl SshForward {
    /// Connects and authenticates to the SSH server, then starts forwarding
    /// an ephemeral local port.
    pub async fn establish(target: &SshTarget) -> Result<Self> {
        tracing::info!(
            "Establishing SSH tunnel via {}@{} to {}:{}",
            target.user,
            target.server_address(),
            target.remote_host,
            target.remote_port
        );

        let handle = Arc::new(Mutex::new(connect_ssh(target).await?));

        let listener = TcpListener::bind("127.0.0.1:0").await.map_err(|e| {
            CourierError::connection(MODE, format!("Failed to bind local port for SSH tunnel: {e}"))
        })?;
        let local_port = listener
            .local_addr()
            .map_err(|e| CourierError::connection(MODE, e.to_string()))?
            .port();

        let cancel_token = CancellationToken::new();
        tokio::spawn(run_tunnel(
            listener,
            handle.clone(),
            target.remote_host.clone(),
            target.remote_port,
            cancel_token.clone(),
        ));

        tracing::info!("SSH tunnel listening on 127.0.0.1:{local_port}");

        Ok(Self {
            local_port,
            remote_host: target.remote_host.clone(),
            remote_port: target.remote_port,
            handle,
            cancel_token,
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Stops accepting, closes open channels and disconnects from the server.
    pub async fn stop(self) {
        self.cancel_token.cancel();
        let handle = self.handle.lock().await;
        if let Err(e) = handle
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await
        {
            tracing::debug!("SSH disconnect failed: {e}");
        }
        tracing::info!("SSH tunnel stopped (local port {})", self.local_port);
    }
}

impl Drop for SshForward {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

async fn connect_ssh(target: &SshTarget) -> Result<client::Handle<ForwardHandler>> {
    let config = Arc::new(client::Config::default());

    let mut handle = client::connect(
        config,
        (target.server_host.as_str(), target.server_port),
        ForwardHandler,
    )
    .await
    .map_err(|e| {
        CourierError::connection(
            MODE,
            format!(
                "Failed to connect to SSH server {}: {e}",
                target.server_address()
            ),
        )
    })?;

    let authenticated = match (&target.key_path, &target.password) {
        (Some(path), _) => authenticate_key_file(&mut handle, &target.user, path).await?,
        (None, Some(password)) => handle
            .authenticate_password(&target.user, password)
            .await
            .map_err(|e| {
                CourierError::connection(MODE, format!("SSH password authentication failed: {e}"))
            })?,
        (None, None) => {
            let path = default_key_path().ok_or_else(|| {
                CourierError::connection(
                    MODE,
                    "No SSH_KEY or SSH_PASSWORD given and no home directory for ~/.ssh/id_rsa",
                )
            })?;
            authenticate_key_file(&mut handle, &target.user, &path).await?
        }
    };

    if !authenticated {
        return Err(CourierError::connection(
            MODE,
            format!(
                "SSH authentication rejected for {}@{}",
                target.user, target.server_host
            ),
        ));
    }

    tracing::info!(
        "SSH authentication successful for {}@{}",
        target.user,
        target.server_host
    );
    Ok(handle)
}

fn default_key_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".ssh").join("id_rsa"))
}

async fn authenticate_key_file(
    handle: &mut client::Handle<ForwardHandler>,
    user: &str,
    path: &Path,
) -> Result<bool> {
    let key = load_private_key(path).await?;
    handle
        .authenticate_publickey(user, key)
        .await
        .map_err(|e| CourierError::connection(MODE, format!("SSH key authentication failed: {e}")))
}

async fn load_private_key(path: &Path) -> Result<Arc<KeyPair>> {
    let key_data = tokio::fs::read(path).await.map_err(|e| {
        CourierError::connection(
            MODE,
            format!("Failed to read SSH key file {}: {e}", path.display()),
        )
    })?;

    russh_keys::decode_secret_key(&String::from_utf8_lossy(&key_data), None)
        .map(Arc::new)
        .map_err(|e| {
            CourierError::connection(
                MODE,
                format!("Failed to parse SSH key {}: {e}", path.display()),
            )
        })
}

async fn run_tunnel(
    listener: TcpListener,
    handle: SharedHandle,
    remote_host: String,
    remote_port: u16,
    cancel_token: CancellationToken,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((local_stream, peer)) => {
                    tracing::debug!("New tunnel connection from {peer}");
                    let handle = handle.clone();
                    let remote_host = remote_host.clone();
                    let cancel = cancel_token.clone();
                    tokio::spawn(async move {
                        if let Err(e) =
                            forward_connection(local_stream, handle, &remote_host, remote_port, cancel).await
                        {
                            tracing::warn!("Tunnel forwarding error: {e}");
                        }
                    });
                }
                Err(e) => tracing::error!("Failed to accept tunnel connection: {e}"),
            },
            _ = cancel_token.cancelled() => break,
        }
    }
}

async fn forward_connection(
    mut local_stream: TcpStream,
    handle: SharedHandle,
    remote_host: &str,
    remote_port: u16,
    cancel_token: CancellationToken,
) -> Result<()> {
    let channel = {
        let handle = handle.lock().await;
        handle
            .channel_open_direct_tcpip(remote_host, u32::from(remote_port), "127.0.0.1", 0)
            .await
            .map_err(|e| {
                CourierError::connection(
                    MODE,
                    format!("Failed to open SSH channel to {remote_host}:{remote_port}: {e}"),
                )
            })?
    };
    let mut channel = channel.into_stream();

    tokio::select! {
        copied = tokio::io::copy_bidirectional(&mut local_stream, &mut channel) => {
            if let Err(e) = copied {
                tracing::debug!("Tunnel stream closed: {e}");
            }
        }
        _ = cancel_token.cancelled() => {}
    }
    Ok(())
}
