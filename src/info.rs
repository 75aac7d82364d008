// ABOUTME: TimescaleDB version metadata written next to a dump
// ABOUTME: The restore reads it back to recreate the extension at the dumped version

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use crate::error::BackupError;

pub const METADATA_VERSION: u32 = 1;

/// Extension version and schema as installed in a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionState {
    pub version: String,
    pub schema: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimescaleInfo {
    pub metadata_version: u32,
    pub extension_version: String,
    pub extension_schema: String,
}

impl TimescaleInfo {
    pub fn new(state: ExtensionState) -> Self {
        Self {
            metadata_version: METADATA_VERSION,
            extension_version: state.version,
            extension_schema: state.schema,
        }
    }

    pub fn extension_state(&self) -> ExtensionState {
        ExtensionState {
            version: self.extension_version.clone(),
            schema: self.extension_schema.clone(),
        }
    }

    /// Writes the metadata file; fails if it already exists.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .with_context(|| format!("Failed to create metadata file {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)
            .context("Failed to write TimescaleDB metadata")?;
        writer
            .write_all(b"\n")
            .and_then(|_| writer.flush())
            .context("Failed to write TimescaleDB metadata")?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            BackupError::Metadata(format!(
                "failed to open metadata file {}: {}",
                path.display(),
                e
            ))
        })?;
        let info: TimescaleInfo =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| {
                BackupError::Metadata(format!(
                    "failed to decode metadata file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        if info.metadata_version != METADATA_VERSION {
            return Err(BackupError::Metadata(format!(
                "metadata file {} has format version {}, expected {}",
                path.display(),
                info.metadata_version,
                METADATA_VERSION
            ))
            .into());
        }
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> TimescaleInfo {
        TimescaleInfo::new(ExtensionState {
            version: "2.11.2".to_string(),
            schema: "public".to_string(),
        })
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("info.json");
        sample().write_to(&path).unwrap();

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"metadataVersion\": 1"));
        assert!(raw.contains("\"extensionSchema\": \"public\""));

        assert_eq!(TimescaleInfo::read_from(&path).unwrap(), sample());
    }

    #[test]
    fn test_write_refuses_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("info.json");
        std::fs::write(&path, "{}").unwrap();
        assert!(sample().write_to(&path).is_err());
    }

    #[test]
    fn test_wrong_metadata_version_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("info.json");
        std::fs::write(
            &path,
            r#"{"metadataVersion": 7, "extensionVersion": "2.11.2", "extensionSchema": "public"}"#,
        )
        .unwrap();

        let err = TimescaleInfo::read_from(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BackupError>(),
            Some(BackupError::Metadata(_))
        ));
        assert!(err.to_string().contains("format version 7"));
    }

    #[test]
    fn test_legacy_field_names_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("info.json");
        std::fs::write(
            &path,
            r#"{"TsInfoVersion": 0, "TsVersion": "1.7.1", "TsSchema": "public"}"#,
        )
        .unwrap();
        let err = TimescaleInfo::read_from(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<BackupError>(),
            Some(BackupError::Metadata(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = TimescaleInfo::read_from(&dir.path().join("absent.json")).unwrap_err();
        assert!(err.to_string().contains("failed to open metadata file"));
    }
}
