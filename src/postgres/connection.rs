// ABOUTME: Opens PostgreSQL connections with optional TLS
// ABOUTME: Each caller owns the returned client for as long as it needs it

use anyhow::Result;
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::config::SslMode;
use tokio_postgres::{Client, Config};

use crate::error::BackupError;

/// Connects to the database and drives the connection on a background task.
///
/// Dropping the returned client closes the backend session.
pub async fn connect(connection_string: &str) -> Result<Client> {
    let config: Config = connection_string
        .parse()
        .map_err(|e| BackupError::Connection(format!("invalid connection string: {}", e)))?;

    // libpq only verifies certificates for verify-ca/verify-full
    let mut builder = TlsConnector::builder();
    if matches!(config.get_ssl_mode(), SslMode::Require) {
        builder.danger_accept_invalid_certs(true);
    }
    let connector = builder
        .build()
        .map_err(|e| BackupError::Connection(format!("failed to set up TLS: {}", e)))?;

    let (client, connection) = config
        .connect(MakeTlsConnector::new(connector))
        .await
        .map_err(|e| BackupError::Connection(format!("failed to connect to database: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::debug!("Connection closed with error: {}", e);
        }
    });

    Ok(client)
}
