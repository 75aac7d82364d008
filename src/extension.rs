// ABOUTME: Manages the TimescaleDB extension around a restore
// ABOUTME: Recreates it at the dumped version, runs restore hooks, updates and verifies it

use anyhow::{Context, Result};
use std::future::Future;
use tokio_postgres::Client;

use crate::error::BackupError;
use crate::info::ExtensionState;
use crate::postgres::{self, quote_ident, quote_literal};

const INSTALLED_EXTENSION_SQL: &str = "SELECT e.extversion, n.nspname \
     FROM pg_catalog.pg_extension e \
     INNER JOIN pg_catalog.pg_namespace n ON e.extnamespace = n.oid \
     WHERE e.extname = 'timescaledb'";

/// Version and schema of the installed extension, if any.
pub async fn installed_extension(client: &Client) -> Result<Option<ExtensionState>> {
    let row = client
        .query_opt(INSTALLED_EXTENSION_SQL, &[])
        .await
        .context("Failed to query TimescaleDB extension")?;
    Ok(row.map(|row| ExtensionState {
        version: row.get(0),
        schema: row.get(1),
    }))
}

/// Reads the extension state of the database being dumped.
pub async fn fetch_extension_state(db_uri: &str) -> Result<ExtensionState> {
    let client = postgres::connect(db_uri).await?;
    installed_extension(&client).await?.ok_or_else(|| {
        BackupError::Version(
            "TimescaleDB extension not found, make sure it is installed in the database being dumped"
                .to_string(),
        )
        .into()
    })
}

/// Drops any existing extension and creates it at exactly `target`.
pub async fn recreate_at_version(db_uri: &str, target: &ExtensionState) -> Result<()> {
    {
        let client = postgres::connect(db_uri).await?;
        // No CASCADE: anything depending on an existing extension must fail loudly
        client
            .batch_execute("DROP EXTENSION IF EXISTS timescaledb")
            .await
            .context("Failed to drop existing TimescaleDB extension")?;
    }

    // Some version transitions misbehave on the backend that dropped the old version
    let client = postgres::connect(db_uri).await?;
    let create = format!(
        "CREATE EXTENSION IF NOT EXISTS timescaledb WITH SCHEMA {} VERSION {}",
        quote_ident(&target.schema),
        quote_literal(&target.version)
    );
    client.batch_execute(&create).await.with_context(|| {
        format!(
            "Failed to create TimescaleDB {} in schema {}",
            target.version, target.schema
        )
    })?;

    let installed = installed_extension(&client).await?.ok_or_else(|| {
        BackupError::Consistency("could not confirm creation of TimescaleDB extension".to_string())
    })?;
    if &installed != target {
        return Err(BackupError::Consistency(format!(
            "TimescaleDB extension created as {} in schema {} instead of {} in schema {}, \
             please drop the extension and restart the restore",
            installed.version, installed.schema, target.version, target.schema
        ))
        .into());
    }
    tracing::info!(
        "Created TimescaleDB {} in schema {}",
        target.version,
        target.schema
    );
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreHook {
    Pre,
    Post,
}

impl RestoreHook {
    pub fn function_name(self) -> &'static str {
        match self {
            RestoreHook::Pre => "timescaledb_pre_restore",
            RestoreHook::Post => "timescaledb_post_restore",
        }
    }
}

/// Calls `<schema>.timescaledb_pre_restore()` or its post counterpart on a fresh connection.
pub async fn run_restore_hook(db_uri: &str, schema: &str, hook: RestoreHook) -> Result<()> {
    let client = postgres::connect(db_uri).await?;
    let sql = format!("SELECT {}.{}()", quote_ident(schema), hook.function_name());
    let succeeded: bool = client
        .query_one(&sql, &[])
        .await
        .with_context(|| format!("Failed to run {}", hook.function_name()))?
        .get(0);

    if !succeeded {
        return Err(BackupError::Consistency(format!(
            "{} reported failure",
            hook.function_name()
        ))
        .into());
    }
    tracing::debug!("{} succeeded", hook.function_name());
    Ok(())
}

/// Moves the extension into and out of restore mode.
pub trait RestoreHooks {
    fn run(&self, hook: RestoreHook) -> impl Future<Output = Result<()>> + Send;
}

pub struct PgRestoreHooks {
    db_uri: String,
    schema: String,
}

impl PgRestoreHooks {
    pub fn new(db_uri: impl Into<String>, schema: impl Into<String>) -> Self {
        Self {
            db_uri: db_uri.into(),
            schema: schema.into(),
        }
    }
}

impl RestoreHooks for PgRestoreHooks {
    fn run(&self, hook: RestoreHook) -> impl Future<Output = Result<()>> + Send {
        run_restore_hook(&self.db_uri, &self.schema, hook)
    }
}

/// Extension operations performed after the data has been restored.
pub trait ExtensionCatalog {
    /// Updates to the default installed version and returns that version.
    fn update_to_default(&self) -> impl Future<Output = Result<String>> + Send;

    fn installed(&self) -> impl Future<Output = Result<Option<ExtensionState>>> + Send;
}

pub struct PgExtensionCatalog {
    db_uri: String,
}

impl PgExtensionCatalog {
    pub fn new(db_uri: impl Into<String>) -> Self {
        Self {
            db_uri: db_uri.into(),
        }
    }
}

impl ExtensionCatalog for PgExtensionCatalog {
    fn update_to_default(&self) -> impl Future<Output = Result<String>> + Send {
        async move {
            {
                let client = postgres::connect(&self.db_uri).await?;
                client
                    .batch_execute("ALTER EXTENSION timescaledb UPDATE")
                    .await
                    .context("Failed to update extension version")?;
            }

            // A fresh backend proves the server survived loading the new version
            let client = postgres::connect(&self.db_uri)
                .await
                .context("Failed to connect after updating extension")?;
            let row = client
                .query_one(
                    "SELECT installed_version, default_version \
                     FROM pg_catalog.pg_available_extensions WHERE name = 'timescaledb'",
                    &[],
                )
                .await
                .context("Failed to read extension versions after update")?;
            let installed: Option<String> = row.get(0);
            let default: String = row.get(1);

            match installed {
                Some(installed) if installed == default => Ok(installed),
                installed => Err(BackupError::Consistency(format!(
                    "TimescaleDB extension was not updated to the default version {} (installed: {})",
                    default,
                    installed.as_deref().unwrap_or("none")
                ))
                .into()),
            }
        }
    }

    fn installed(&self) -> impl Future<Output = Result<Option<ExtensionState>>> + Send {
        async move {
            let client = postgres::connect(&self.db_uri).await?;
            installed_extension(&client).await
        }
    }
}

/// Optionally updates the extension, then checks it is where the restore left it.
///
/// `recorded` is the state from the dump metadata. After an update the
/// expected version is the one the update reported.
pub async fn finalize<C: ExtensionCatalog>(
    catalog: &C,
    recorded: &ExtensionState,
    do_update: bool,
) -> Result<()> {
    let mut expected = recorded.clone();
    if do_update {
        expected.version = catalog
            .update_to_default()
            .await
            .context("Restore failed while updating extension")?;
        tracing::info!("Updated TimescaleDB to {}", expected.version);
    }

    let installed = catalog.installed().await?;
    match installed {
        Some(installed) if installed == expected => Ok(()),
        Some(installed) => Err(BackupError::Consistency(format!(
            "TimescaleDB is {} in schema {} after restore, expected {} in schema {}; \
             something else modified the extension, please drop it and retry the restore",
            installed.version, installed.schema, expected.version, expected.schema
        ))
        .into()),
        None => Err(BackupError::Consistency(
            "TimescaleDB extension is missing after restore, please drop it and retry the restore"
                .to_string(),
        )
        .into()),
    }
}
