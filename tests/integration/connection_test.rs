//! Connection integration tests.
//!
//! Tests tunnel acquisition and connection error handling.

use db_courier::config::{ConnectionConfig, Credentials};
use db_courier::db::Engine;
use db_courier::error::CourierError;
use db_courier::tunnel::{ConnectionMode, TunnelManager};
use std::collections::HashMap;
use std::time::Duration;

/// Helper to get test database URL from environment.
fn get_test_database_url() -> Option<String> {
    std::env::var("DATABASE_URL").ok()
}

/// Builds a credential record from a connection config.
fn credentials_from(config: &ConnectionConfig) -> Credentials {
    let mut record = HashMap::new();
    record.insert("DB_HOST".to_string(), config.host.clone().unwrap_or_default());
    record.insert("DB_PORT".to_string(), config.port.to_string());
    record.insert("DB_USER".to_string(), config.user.clone().unwrap_or_default());
    if let Some(password) = &config.password {
        record.insert("DB_PASSWORD".to_string(), password.clone());
    }
    if let Some(database) = &config.database {
        record.insert("DB_DATABASE".to_string(), database.clone());
    }
    Credentials::from_record(&record).unwrap()
}

fn manager() -> TunnelManager {
    TunnelManager::from_settings(&Default::default())
        .with_timeouts(Duration::from_secs(5), Duration::from_secs(30))
}

#[tokio::test]
async fn test_direct_session_with_valid_credentials() {
    let Some(url) = get_test_database_url() else {
        eprintln!("Skipping test: DATABASE_URL not set");
        return;
    };
    let config = ConnectionConfig::from_connection_string(&url).unwrap();
    let credentials = credentials_from(&config);

    let count = manager()
        .with_session(
            &credentials,
            ConnectionMode::Direct,
            Engine::Postgres,
            |client| async move { Ok(client.execute_query("SELECT 1").await?.row_count) },
        )
        .await
        .unwrap();

    assert_eq!(count, 1);
}

#[tokio::test(flavor = "current_thread")]
async fn test_direct_session_with_invalid_port() {
    let credentials = credentials_from(&ConnectionConfig {
        host: Some("127.0.0.1".to_string()),
        port: 1,
        user: Some("testuser".to_string()),
        password: Some("testpass".to_string()),
        ..Default::default()
    });

    let error = manager()
        .acquire(&credentials, ConnectionMode::Direct, Engine::Postgres)
        .await
        .unwrap_err();

    match error {
        CourierError::Connection { mode, .. } => assert_eq!(mode, "direct"),
        other => panic!("Expected connection error, got: {other:?}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn test_ssh_session_with_unreachable_server() {
    let mut record = HashMap::new();
    record.insert("DB_HOST".to_string(), "127.0.0.1".to_string());
    record.insert("DB_USER".to_string(), "app".to_string());
    record.insert("SSH_USER".to_string(), "nobody".to_string());
    record.insert("SSH_PORT".to_string(), "1".to_string());
    record.insert("SSH_PASSWORD".to_string(), "secret".to_string());
    let credentials = Credentials::from_record(&record).unwrap();

    let error = manager()
        .acquire(&credentials, ConnectionMode::Ssh, Engine::Postgres)
        .await
        .unwrap_err();

    match error {
        CourierError::Connection { mode, .. } => assert_eq!(mode, "ssh"),
        other => panic!("Expected connection error, got: {other:?}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn test_iam_without_cluster_name_fails_fast() {
    let mut record = HashMap::new();
    record.insert("DB_HOST".to_string(), "cluster.example.com".to_string());
    record.insert("DB_USER".to_string(), "analyst".to_string());
    let credentials = Credentials::from_record(&record).unwrap();

    let error = manager()
        .acquire(&credentials, ConnectionMode::Iam, Engine::Redshift)
        .await
        .unwrap_err();

    assert!(matches!(error, CourierError::Configuration(_)));
}
