//! Short-lived database credentials from AWS IAM.

use crate::config::{Credentials, SecretStorage};
use crate::db::Engine;
use crate::error::{CourierError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use tokio::process::Command;
use tracing::debug;

const MODE: &str = "iam";

/// A temporary user/password pair issued in place of a static password.
#[derive(Clone, PartialEq, Eq)]
pub struct IamToken {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for IamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IamToken")
            .field("user", &self.user)
            .field("password", &SecretStorage::mask_secret(&self.password))
            .finish()
    }
}

/// Issues IAM tokens for a connection.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    async fn fetch_token(&self, credentials: &Credentials, engine: Engine) -> Result<IamToken>;
}

/// Fetches tokens by running the AWS CLI.
///
/// Redshift clusters use `aws redshift get-cluster-credentials`; other
/// engines use `aws rds generate-db-auth-token`.
#[derive(Debug, Clone)]
pub struct AwsCliTokenProvider {
    program: String,
    region: Option<String>,
}

impl Default for AwsCliTokenProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl AwsCliTokenProvider {
    pub fn new() -> Self {
        Self {
            program: "aws".to_string(),
            region: std::env::var("AWS_REGION").ok().filter(|r| !r.is_empty()),
        }
    }

    /// Uses a different CLI binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = Some(region.into());
        self
    }

    /// CLI arguments for a token request.
    fn arguments(&self, credentials: &Credentials, engine: Engine) -> Result<Vec<String>> {
        let mut args: Vec<String> = match engine {
            Engine::Redshift => {
                let cluster = credentials.cluster_name.as_deref().ok_or_else(|| {
                    CourierError::config("CLUSTER_NAME is required for IAM connections to Redshift")
                })?;
                let mut args = vec![
                    "redshift".into(),
                    "get-cluster-credentials".into(),
                    "--cluster-identifier".into(),
                    cluster.into(),
                    "--db-user".into(),
                    credentials.user.clone(),
                ];
                if let Some(database) = &credentials.database {
                    args.extend(["--db-name".into(), database.clone()]);
                }
                args.extend(["--output".into(), "json".into()]);
                args
            }
            _ => vec![
                "rds".into(),
                "generate-db-auth-token".into(),
                "--hostname".into(),
                credentials.host.clone(),
                "--port".into(),
                credentials.port_for(engine).to_string(),
                "--username".into(),
                credentials.user.clone(),
            ],
        };
        if let Some(region) = &self.region {
            args.extend(["--region".into(), region.clone()]);
        }
        Ok(args)
    }
}

#[async_trait]
impl TokenProvider for AwsCliTokenProvider {
    async fn fetch_token(&self, credentials: &Credentials, engine: Engine) -> Result<IamToken> {
        let args = self.arguments(credentials, engine)?;
        debug!("Requesting IAM credentials: {} {}", self.program, args[..2].join(" "));

        let output = Command::new(&self.program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                CourierError::connection(MODE, format!("Failed to run {}: {e}", self.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CourierError::connection(
                MODE,
                format!("IAM credential request failed: {}", stderr.trim()),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match engine {
            Engine::Redshift => parse_cluster_credentials(&stdout),
            _ => parse_auth_token(&stdout, &credentials.user),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ClusterCredentials {
    db_user: String,
    db_password: String,
}

/// Parses `get-cluster-credentials` JSON output.
fn parse_cluster_credentials(output: &str) -> Result<IamToken> {
    let parsed: ClusterCredentials = serde_json::from_str(output).map_err(|e| {
        CourierError::connection(MODE, format!("Unexpected get-cluster-credentials output: {e}"))
    })?;
    Ok(IamToken {
        user: parsed.db_user,
        password: parsed.db_password,
    })
}

/// Parses `generate-db-auth-token` output, a bare token string.
fn parse_auth_token(output: &str, user: &str) -> Result<IamToken> {
    let token = output.trim();
    if token.is_empty() {
        return Err(CourierError::connection(MODE, "Empty IAM auth token"));
    }
    Ok(IamToken {
        user: user.to_string(),
        password: token.to_string(),
    })
}

/// Returns the same token every time.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: IamToken,
}

impl StaticTokenProvider {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            token: IamToken {
                user: user.into(),
                password: password.into(),
            },
        }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self, _credentials: &Credentials, _engine: Engine) -> Result<IamToken> {
        Ok(self.token.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn credentials(pairs: &[(&str, &str)]) -> Credentials {
        let record: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Credentials::from_record(&record).unwrap()
    }

    #[test]
    fn test_redshift_arguments() {
        let creds = credentials(&[
            ("DB_USER", "analyst"),
            ("DB_HOST", "cluster.example.com"),
            ("DB_DATABASE", "dev"),
            ("CLUSTER_NAME", "analytics"),
        ]);
        let args = AwsCliTokenProvider::new()
            .with_region("eu-west-1")
            .arguments(&creds, Engine::Redshift)
            .unwrap();

        assert_eq!(
            args,
            vec![
                "redshift",
                "get-cluster-credentials",
                "--cluster-identifier",
                "analytics",
                "--db-user",
                "analyst",
                "--db-name",
                "dev",
                "--output",
                "json",
                "--region",
                "eu-west-1",
            ]
        );
    }

    #[test]
    fn test_rds_arguments_use_engine_port() {
        let creds = credentials(&[("DB_USER", "app"), ("DB_HOST", "rds.example.com")]);
        let args = AwsCliTokenProvider {
            program: "aws".to_string(),
            region: None,
        }
        .arguments(&creds, Engine::Mysql)
        .unwrap();

        assert_eq!(args[1], "generate-db-auth-token");
        assert!(args.windows(2).any(|w| w == ["--port", "3306"]));
    }

    #[test]
    fn test_redshift_without_cluster_is_config_error() {
        let creds = credentials(&[("DB_USER", "analyst"), ("DB_HOST", "h")]);
        let err = AwsCliTokenProvider::new()
            .arguments(&creds, Engine::Redshift)
            .unwrap_err();
        assert!(matches!(err, CourierError::Configuration(_)));
    }

    #[test]
    fn test_parse_cluster_credentials() {
        let token = parse_cluster_credentials(
            r#"{"DbUser": "IAM:analyst", "DbPassword": "AskjdW==", "Expiration": "2026-01-01T00:15:00Z"}"#,
        )
        .unwrap();
        assert_eq!(token.user, "IAM:analyst");
        assert_eq!(token.password, "AskjdW==");

        assert!(parse_cluster_credentials("not json").is_err());
    }

    #[test]
    fn test_parse_auth_token() {
        let token = parse_auth_token("rds.example.com:5432/?Action=connect&X-Amz=abc\n", "app")
            .unwrap();
        assert_eq!(token.user, "app");
        assert!(token.password.starts_with("rds.example.com"));
        assert!(parse_auth_token("  \n", "app").is_err());
    }

    #[tokio::test]
    async fn test_missing_cli_is_connection_error() {
        let creds = credentials(&[("DB_USER", "app"), ("DB_HOST", "h")]);
        let err = AwsCliTokenProvider::new()
            .with_program("courier-no-such-aws-cli")
            .fetch_token(&creds, Engine::Postgres)
            .await
            .unwrap_err();
        assert!(matches!(err, CourierError::Connection { .. }));
    }
}
