//! Credential records and their resolution.
//!
//! A credential record is a flat key/value set (`DB_USER`, `DB_HOST`, ...)
//! read from an inline map, a JSON/TOML file, or a named file in the
//! credentials directory. The resolver produces one immutable
//! [`Credentials`] value per call.

use super::{SecretStorage, Settings};
use crate::db::Engine;
use crate::error::{CourierError, Result};
use crate::tunnel::ConnectionMode;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Keys understood in a credential record.
pub const RECOGNIZED_KEYS: &[&str] = &[
    "DB_USER",
    "DB_PASSWORD",
    "DB_HOST",
    "DB_PORT",
    "DB_DATABASE",
    "CLUSTER_NAME",
    "SSH_USER",
    "SSH_KEY",
    "SSH_PASSWORD",
    "SSH_HOST",
    "SSH_PORT",
];

/// Connection credentials for one call.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub user: String,
    pub password: Option<String>,
    pub host: String,
    pub port: Option<u16>,
    pub database: Option<String>,
    /// Redshift cluster identifier, used for IAM credentials.
    pub cluster_name: Option<String>,
    pub ssh_user: Option<String>,
    pub ssh_key_path: Option<PathBuf>,
    pub ssh_password: Option<String>,
    /// Jump host; the database host itself when unset.
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mask = |s: &Option<String>| s.as_deref().map(SecretStorage::mask_secret);
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &mask(&self.password))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("cluster_name", &self.cluster_name)
            .field("ssh_user", &self.ssh_user)
            .field("ssh_key_path", &self.ssh_key_path)
            .field("ssh_password", &mask(&self.ssh_password))
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .finish()
    }
}

impl Credentials {
    /// Builds credentials from a flat record. `DB_HOST` and `DB_USER` are required.
    pub fn from_record(record: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            record
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let require = |key: &str| {
            get(key).ok_or_else(|| {
                CourierError::config(format!("Missing required credential field {key}"))
            })
        };
        let port = |key: &str| -> Result<Option<u16>> {
            get(key)
                .map(|v| {
                    v.parse::<u16>().map_err(|_| {
                        CourierError::config(format!("{key} must be a port number, got '{v}'"))
                    })
                })
                .transpose()
        };

        Ok(Self {
            user: require("DB_USER")?,
            password: get("DB_PASSWORD"),
            host: require("DB_HOST")?,
            port: port("DB_PORT")?,
            database: get("DB_DATABASE"),
            cluster_name: get("CLUSTER_NAME"),
            ssh_user: get("SSH_USER"),
            ssh_key_path: get("SSH_KEY").map(PathBuf::from),
            ssh_password: get("SSH_PASSWORD"),
            ssh_host: get("SSH_HOST"),
            ssh_port: port("SSH_PORT")?,
        })
    }

    /// Resolves the requested engine against these credentials.
    pub fn engine(&self, requested: Engine) -> Engine {
        requested.resolve(self.cluster_name.as_deref(), self.port)
    }

    /// Database port, falling back to the engine's default.
    pub fn port_for(&self, engine: Engine) -> u16 {
        self.port.unwrap_or_else(|| engine.default_port())
    }

    /// SSH server to connect to: the jump host if configured, else the database host.
    pub fn ssh_server(&self) -> &str {
        self.ssh_host.as_deref().unwrap_or(&self.host)
    }

    /// Checks the fields a connection mode needs.
    pub fn validate_for(&self, mode: ConnectionMode, engine: Engine) -> Result<()> {
        match mode {
            ConnectionMode::Direct => Ok(()),
            ConnectionMode::Iam => {
                if engine == Engine::Redshift && self.cluster_name.is_none() {
                    return Err(CourierError::config(
                        "CLUSTER_NAME is required for IAM connections to Redshift",
                    ));
                }
                Ok(())
            }
            ConnectionMode::Ssh => {
                if self.ssh_user.is_none() {
                    return Err(CourierError::config(
                        "SSH_USER is required for SSH connections",
                    ));
                }
                Ok(())
            }
        }
    }
}

/// Where the credential record comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum CredentialSource {
    /// `config.json` in the credentials directory.
    #[default]
    Default,
    /// `<name>.json` (or `.toml`) in the credentials directory.
    Named(String),
    /// An explicit file path.
    File(PathBuf),
    /// A record supplied by the caller.
    Inline(HashMap<String, String>),
}

impl CredentialSource {
    /// Interprets a command-line value: empty is the default record, paths
    /// and `.json`/`.toml` names are files, anything else is a named record.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value.is_empty() {
            return Self::Default;
        }
        let lower = value.to_lowercase();
        if value.contains(std::path::MAIN_SEPARATOR)
            || value.contains('/')
            || lower.ends_with(".json")
            || lower.ends_with(".toml")
        {
            Self::File(PathBuf::from(value))
        } else {
            Self::Named(value.to_string())
        }
    }
}

/// Loads credential records and turns them into [`Credentials`].
#[derive(Debug, Clone)]
pub struct ConfigResolver {
    credentials_dir: PathBuf,
    env_fallback: bool,
    secrets: Option<SecretStorage>,
}

impl ConfigResolver {
    /// Creates a resolver reading named records from `credentials_dir`.
    pub fn new(credentials_dir: impl Into<PathBuf>) -> Self {
        Self {
            credentials_dir: credentials_dir.into(),
            env_fallback: false,
            secrets: None,
        }
    }

    /// Creates a resolver from application settings.
    pub fn from_settings(settings: &Settings) -> Self {
        let resolver = Self::new(settings.credentials_dir.clone()).with_env_fallback(true);
        if settings.use_keyring {
            resolver.with_secrets(SecretStorage::new())
        } else {
            resolver
        }
    }

    /// Fill keys missing from the record with same-named environment variables.
    pub fn with_env_fallback(mut self, enabled: bool) -> Self {
        self.env_fallback = enabled;
        self
    }

    /// Look up missing passwords in the keyring.
    pub fn with_secrets(mut self, secrets: SecretStorage) -> Self {
        self.secrets = Some(secrets);
        self
    }

    pub fn credentials_dir(&self) -> &Path {
        &self.credentials_dir
    }

    /// Returns the file a source reads from, if any.
    pub fn source_path(&self, source: &CredentialSource) -> Option<PathBuf> {
        match source {
            CredentialSource::Default => Some(self.credentials_dir.join("config.json")),
            CredentialSource::Named(name) => {
                let candidates = [
                    self.credentials_dir.join(format!("{name}.json")),
                    self.credentials_dir.join(format!("{name}.toml")),
                    self.credentials_dir.join(name),
                ];
                let fallback = candidates[0].clone();
                Some(
                    candidates
                        .into_iter()
                        .find(|p| p.is_file())
                        .unwrap_or(fallback),
                )
            }
            CredentialSource::File(path) => Some(path.clone()),
            CredentialSource::Inline(_) => None,
        }
    }

    /// Loads the flat record for a source, applying environment fallbacks.
    pub fn load_record(&self, source: &CredentialSource) -> Result<HashMap<String, String>> {
        let mut record = match source {
            CredentialSource::Inline(map) => map.clone(),
            _ => {
                let path = self
                    .source_path(source)
                    .ok_or_else(|| CourierError::internal("credential source has no path"))?;
                read_record_file(&path)?
            }
        };

        if self.env_fallback {
            for key in RECOGNIZED_KEYS {
                let missing = record.get(*key).map_or(true, |v| v.trim().is_empty());
                if missing {
                    if let Ok(value) = std::env::var(key) {
                        record.insert((*key).to_string(), value);
                    }
                }
            }
        }

        Ok(record)
    }

    /// Resolves the credentials for one call and validates them for `mode`.
    pub fn resolve(
        &self,
        source: &CredentialSource,
        mode: ConnectionMode,
        engine: Engine,
    ) -> Result<Credentials> {
        let record = self.load_record(source)?;
        let mut credentials = Credentials::from_record(&record)?;

        if let Some(secrets) = &self.secrets {
            if credentials.password.is_none() && mode != ConnectionMode::Iam {
                credentials.password = secrets.retrieve(&SecretStorage::database_password_key(
                    &credentials.user,
                    &credentials.host,
                ));
            }
            if mode == ConnectionMode::Ssh
                && credentials.ssh_password.is_none()
                && credentials.ssh_key_path.is_none()
            {
                if let Some(ssh_user) = &credentials.ssh_user {
                    credentials.ssh_password = secrets.retrieve(
                        &SecretStorage::ssh_password_key(ssh_user, credentials.ssh_server()),
                    );
                }
            }
        }

        let engine = credentials.engine(engine);
        credentials.validate_for(mode, engine)?;
        debug!(
            "Resolved credentials for {}@{} ({mode}, {engine})",
            credentials.user, credentials.host
        );
        Ok(credentials)
    }
}

/// Reads a JSON or TOML record file into a flat map of strings.
fn read_record_file(path: &Path) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        CourierError::config(format!(
            "Failed to read credentials from {}: {e}",
            path.display()
        ))
    })?;

    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));

    let pairs: Vec<(String, String)> = if is_toml {
        let table: toml::Table = toml::from_str(&content).map_err(|e| {
            CourierError::config(format!("Invalid credentials file {}: {e}", path.display()))
        })?;
        table
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    toml::Value::String(s) => s,
                    other => other.to_string(),
                };
                (k, value)
            })
            .collect()
    } else {
        let object: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&content)
            .map_err(|e| {
                CourierError::config(format!("Invalid credentials file {}: {e}", path.display()))
            })?;
        object
            .into_iter()
            .map(|(k, v)| {
                let value = match v {
                    serde_json::Value::String(s) => s,
                    serde_json::Value::Null => String::new(),
                    other => other.to_string(),
                };
                (k, value)
            })
            .collect()
    };

    Ok(pairs
        .into_iter()
        .filter(|(k, _)| !k.starts_with("__COMMENT"))
        .collect())
}
