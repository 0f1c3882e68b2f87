//! Scoped network paths to the database.
//!
//! A [`TunnelSession`] owns one live client and, in SSH mode, the local port
//! forward it talks through. [`TunnelManager::with_session`] pairs every
//! acquisition with a release, whatever the body returns.

mod iam;
mod mock;
mod ssh;

pub use iam::{AwsCliTokenProvider, IamToken, StaticTokenProvider, TokenProvider};
pub use mock::MockConnector;
pub use ssh::{SshForward, SshTarget};

use crate::config::{ConnectionConfig, Credentials, Settings};
use crate::db::{DatabaseBackend, DatabaseClient, Engine};
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// How the network path to the database is established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionMode {
    #[default]
    Direct,
    Iam,
    Ssh,
}

impl ConnectionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Iam => "iam",
            Self::Ssh => "ssh",
        }
    }
}

impl fmt::Display for ConnectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionMode {
    type Err = CourierError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "direct" => Ok(Self::Direct),
            "iam" => Ok(Self::Iam),
            "ssh" => Ok(Self::Ssh),
            other => Err(CourierError::config(format!(
                "Unknown connection mode '{other}'. Expected direct, iam or ssh"
            ))),
        }
    }
}

/// Opens database clients. Swapped for [`MockConnector`] in tests.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn DatabaseClient>>;
}

/// Connector backed by the sqlx clients.
#[derive(Debug, Default, Clone, Copy)]
pub struct SqlxConnector;

#[async_trait]
impl Connector for SqlxConnector {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn DatabaseClient>> {
        crate::db::connect(config).await
    }
}

/// A live path to the backend, owned by exactly one call.
pub struct TunnelSession {
    mode: ConnectionMode,
    engine: Engine,
    local_port: Option<u16>,
    client: Option<Arc<dyn DatabaseClient>>,
    forward: Option<SshForward>,
}

impl fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelSession")
            .field("mode", &self.mode)
            .field("engine", &self.engine)
            .field("local_port", &self.local_port)
            .field("open", &self.is_open())
            .finish()
    }
}

impl TunnelSession {
    pub fn mode(&self) -> ConnectionMode {
        self.mode
    }

    /// The concrete engine this session talks to.
    pub fn engine(&self) -> Engine {
        self.engine
    }

    /// Local forwarded port (SSH mode only).
    pub fn local_port(&self) -> Option<u16> {
        self.local_port
    }

    pub fn is_open(&self) -> bool {
        self.client.is_some()
    }

    /// The open database client. Fails once the session has been released.
    pub fn client(&self) -> Result<Arc<dyn DatabaseClient>> {
        self.client.clone().ok_or_else(|| {
            CourierError::connection(self.mode, "Tunnel session has already been released")
        })
    }

    /// Closes the client, then tears down the forward. Safe to call twice.
    pub async fn release(&mut self) -> Result<()> {
        let closed = match self.client.take() {
            Some(client) => client.close().await,
            None => Ok(()),
        };
        if let Some(forward) = self.forward.take() {
            forward.stop().await;
        }
        if closed.is_ok() {
            debug!("Released {} tunnel session", self.mode);
        }
        closed.map_err(|e| rewrap(e, self.mode))
    }
}

/// Acquires and releases [`TunnelSession`]s.
#[derive(Clone)]
pub struct TunnelManager {
    connector: Arc<dyn Connector>,
    token_provider: Arc<dyn TokenProvider>,
    connect_timeout: Duration,
    query_timeout: Duration,
}

impl TunnelManager {
    /// Creates a manager with the default timeouts and the AWS CLI token provider.
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        let settings = Settings::default();
        Self {
            connector,
            token_provider: Arc::new(AwsCliTokenProvider::new()),
            connect_timeout: settings.connect_timeout(),
            query_timeout: settings.query_timeout(),
        }
    }

    /// Creates a sqlx-backed manager using the timeouts in `settings`.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(Arc::new(SqlxConnector))
            .with_timeouts(settings.connect_timeout(), settings.query_timeout())
    }

    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = provider;
        self
    }

    pub fn with_timeouts(mut self, connect_timeout: Duration, query_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self.query_timeout = query_timeout;
        self
    }

    /// Opens a session. Nothing stays open when this returns an error.
    pub async fn acquire(
        &self,
        credentials: &Credentials,
        mode: ConnectionMode,
        engine: Engine,
    ) -> Result<TunnelSession> {
        let engine = credentials.engine(engine);
        credentials.validate_for(mode, engine)?;
        let mut config = self.base_config(credentials, engine);

        info!(
            "Opening {mode} connection to {}:{} ({engine})",
            credentials.host, config.port
        );

        let forward = match mode {
            ConnectionMode::Direct => None,
            ConnectionMode::Iam => {
                let token = self
                    .bounded(mode, credentials.host.as_str(), async {
                        self.token_provider.fetch_token(credentials, engine).await
                    })
                    .await?;
                config.user = Some(token.user);
                config.password = Some(token.password);
                if config.backend == DatabaseBackend::Postgres {
                    config.sslmode = Some("require".to_string());
                }
                None
            }
            ConnectionMode::Ssh => {
                let target = SshTarget::from_credentials(credentials, config.port)?;
                let forward = self
                    .bounded(mode, &target.server_address(), SshForward::establish(&target))
                    .await?;
                config.host = Some("127.0.0.1".to_string());
                config.port = forward.local_port();
                Some(forward)
            }
        };

        let address = format!(
            "{}:{}",
            config.host.as_deref().unwrap_or("localhost"),
            config.port
        );
        // A failed connect drops `forward`, which cancels it.
        let client = self
            .bounded(mode, &address, self.connector.connect(&config))
            .await?;

        Ok(TunnelSession {
            mode,
            engine,
            local_port: forward.as_ref().map(SshForward::local_port),
            client: Some(Arc::from(client)),
            forward,
        })
    }

    /// Releases a session. Equivalent to [`TunnelSession::release`].
    pub async fn release(&self, session: &mut TunnelSession) -> Result<()> {
        session.release().await
    }

    /// Runs `body` with the client of a freshly acquired session and always
    /// releases the session afterwards.
    ///
    /// A release failure is logged; it is returned only when the body succeeded.
    pub async fn with_session<T, F, Fut>(
        &self,
        credentials: &Credentials,
        mode: ConnectionMode,
        engine: Engine,
        body: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<dyn DatabaseClient>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut session = self.acquire(credentials, mode, engine).await?;
        let outcome = match session.client() {
            Ok(client) => body(client).await,
            Err(e) => Err(e),
        };
        let released = session.release().await;

        match (outcome, released) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_error)) => {
                warn!("Failed to release {mode} session after error: {release_error}");
                Err(e)
            }
        }
    }

    fn base_config(&self, credentials: &Credentials, engine: Engine) -> ConnectionConfig {
        ConnectionConfig {
            backend: engine.backend(),
            host: Some(credentials.host.clone()),
            port: credentials.port_for(engine),
            database: credentials.database.clone(),
            user: Some(credentials.user.clone()),
            password: credentials.password.clone(),
            sslmode: (engine == Engine::Redshift).then(|| "require".to_string()),
            connect_timeout: self.connect_timeout,
            query_timeout: self.query_timeout,
        }
    }

    /// Bounds a connection step by the connect timeout and tags errors with `mode`.
    async fn bounded<T>(
        &self,
        mode: ConnectionMode,
        address: &str,
        step: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.connect_timeout, step).await {
            Ok(result) => result.map_err(|e| rewrap(e, mode)),
            Err(_) => Err(CourierError::connection(
                mode,
                format!(
                    "Connection to {address} timed out after {} seconds",
                    self.connect_timeout.as_secs()
                ),
            )),
        }
    }
}

/// Re-tags a connection error with the session's mode.
fn rewrap(error: CourierError, mode: ConnectionMode) -> CourierError {
    match error {
        CourierError::Connection { message, .. } => CourierError::connection(mode, message),
        other => other,
    }
}
