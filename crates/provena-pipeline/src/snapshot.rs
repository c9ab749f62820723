//! Snapshot manifest written next to a filter's stored data

use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::data::DataType;
use crate::output::OutputId;
use crate::storage::TemporalStorage;
use provena_core::{Bounds, Spacing, StorageError};

/// File name of the manifest under a filter's base key
pub const MANIFEST_FILE: &str = "outputs.json";

/// Everything needed to restore a filter's outputs lazily
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterManifest {
    /// Type name of the filter that produced the outputs
    pub filter: String,
    pub uuid: Uuid,
    /// RFC 3339 time the snapshot was taken
    pub created_at: String,
    pub outputs: Vec<OutputManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputManifest {
    pub id: OutputId,
    pub spacing: Spacing,
    pub data: Vec<DataManifest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataManifest {
    pub data_type: DataType,
    #[serde(default)]
    pub dependencies: Vec<DataType>,
    #[serde(default)]
    pub edited_regions: Vec<Bounds>,
    /// SHA-256 of the stored bytes; absent when the data stored nothing
    #[serde(default)]
    pub checksum: Option<String>,
}

impl FilterManifest {
    pub fn key(base: &str) -> String {
        format!("{}/{}", base, MANIFEST_FILE)
    }

    /// Load the manifest stored under `base`, if any
    pub fn load(storage: &dyn TemporalStorage, base: &str) -> Result<Option<Self>, StorageError> {
        let key = Self::key(base);
        let bytes = match storage.read(&key) {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => {
                debug!(key, "no snapshot manifest");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    pub fn store(&self, storage: &dyn TemporalStorage, base: &str) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(self)?;
        storage.write(&Self::key(base), &json)
    }

    pub fn output(&self, id: OutputId) -> Option<&OutputManifest> {
        self.outputs.iter().find(|output| output.id == id)
    }
}

impl OutputManifest {
    pub fn data(&self, data_type: &DataType) -> Option<&DataManifest> {
        self.data.iter().find(|data| data.data_type == *data_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DirStorage;
    use tempfile::TempDir;

    fn manifest() -> FilterManifest {
        FilterManifest {
            filter: "SeedGrow".to_string(),
            uuid: Uuid::new_v4(),
            created_at: chrono::Utc::now().to_rfc3339(),
            outputs: vec![OutputManifest {
                id: 0,
                spacing: Spacing::new(2.0, 2.0, 5.0),
                data: vec![DataManifest {
                    data_type: DataType::from("Raster"),
                    dependencies: vec![],
                    edited_regions: vec![Bounds::new(0.0, 1.0, 0.0, 1.0, 0.0, 1.0)],
                    checksum: Some("abc".to_string()),
                }],
            }],
        }
    }

    #[test]
    fn test_store_and_load() {
        let temp = TempDir::new().unwrap();
        let storage = DirStorage::new(temp.path());
        let manifest = manifest();

        manifest.store(&storage, "Filters/x").unwrap();
        assert!(storage.exists("Filters/x/outputs.json"));

        let loaded = FilterManifest::load(&storage, "Filters/x").unwrap().unwrap();
        assert_eq!(loaded, manifest);
        assert!(loaded.output(0).unwrap().data(&DataType::from("Raster")).is_some());
        assert!(loaded.output(1).is_none());
    }

    #[test]
    fn test_missing_manifest() {
        let temp = TempDir::new().unwrap();
        let storage = DirStorage::new(temp.path());
        assert!(FilterManifest::load(&storage, "Filters/x").unwrap().is_none());
    }

    #[test]
    fn test_optional_fields_default() {
        let json = r#"{"data_type": "Mesh"}"#;
        let data: DataManifest = serde_json::from_str(json).unwrap();
        assert!(data.dependencies.is_empty());
        assert!(data.checksum.is_none());
    }
}
