//! Datasource cache
//!
//! Later stages of the same boot restore the resolved datasource from
//! `instances/<id>/datasource.json` instead of probing again. The file holds
//! a versioned, tagged snapshot:
//!
//! ```json
//! {"version": 1, "snapshot": {"datasource": "NoCloud", "instance_id": "...", ...}}
//! ```
//!
//! Anything we cannot read back (missing file, other version, unknown
//! variant, bad JSON) is a cache miss.

use super::DatasourceKind;
use crate::state::CloudPaths;
use crate::{CloudInitError, InstanceRecord};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::ErrorKind;
use tokio::fs;
use tracing::{debug, info, warn};

/// Snapshot layout version written by this build
pub const CACHE_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    version: u32,
    snapshot: Value,
}

/// Fields common to every datasource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceData {
    pub instance_id: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Base64 so arbitrary bytes survive JSON
    #[serde(default)]
    pub user_data: String,
    #[serde(default)]
    pub vendor_data: Option<String>,
}

/// Serialized form of the active datasource, tagged by variant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "datasource")]
pub enum DatasourceSnapshot {
    NoCloud(InstanceData),
    ConfigDrive(InstanceData),
    Ec2(InstanceData),
}

impl DatasourceSnapshot {
    /// Capture a resolved instance
    pub fn from_record(record: &InstanceRecord) -> Self {
        let data = InstanceData {
            instance_id: record.instance_id.clone(),
            metadata: record.metadata.clone(),
            user_data: BASE64.encode(&record.user_data),
            vendor_data: record.vendor_data.as_ref().map(|v| BASE64.encode(v)),
        };
        match record.datasource {
            DatasourceKind::NoCloud => Self::NoCloud(data),
            DatasourceKind::ConfigDrive => Self::ConfigDrive(data),
            DatasourceKind::Ec2 => Self::Ec2(data),
        }
    }

    fn parts(&self) -> (DatasourceKind, &InstanceData) {
        match self {
            Self::NoCloud(d) => (DatasourceKind::NoCloud, d),
            Self::ConfigDrive(d) => (DatasourceKind::ConfigDrive, d),
            Self::Ec2(d) => (DatasourceKind::Ec2, d),
        }
    }

    /// Rebuild the instance record
    pub fn into_record(self) -> Result<InstanceRecord, CloudInitError> {
        let (kind, data) = self.parts();
        let mut record = InstanceRecord::new(kind, data.instance_id.clone());
        record.metadata = data.metadata.clone();
        record.user_data = BASE64
            .decode(&data.user_data)
            .map_err(|e| CloudInitError::InvalidData(format!("cached user-data: {e}")))?;
        record.vendor_data = data
            .vendor_data
            .as_ref()
            .map(|v| BASE64.decode(v))
            .transpose()
            .map_err(|e| CloudInitError::InvalidData(format!("cached vendor-data: {e}")))?;
        Ok(record)
    }
}

/// Parse cache file contents; `None` on any kind of mismatch
pub fn decode(content: &str) -> Option<DatasourceSnapshot> {
    let entry: CacheEntry = match serde_json::from_str(content) {
        Ok(entry) => entry,
        Err(e) => {
            warn!("Unreadable datasource cache: {}", e);
            return None;
        }
    };
    if entry.version != CACHE_VERSION {
        info!(
            "Ignoring datasource cache version {} (expected {})",
            entry.version, CACHE_VERSION
        );
        return None;
    }
    match serde_json::from_value(entry.snapshot) {
        Ok(snapshot) => Some(snapshot),
        Err(e) => {
            warn!("Unknown datasource snapshot: {}", e);
            None
        }
    }
}

/// Serialize a snapshot into cache file contents
pub fn encode(snapshot: &DatasourceSnapshot) -> Result<String, CloudInitError> {
    let entry = CacheEntry {
        version: CACHE_VERSION,
        snapshot: serde_json::to_value(snapshot)?,
    };
    Ok(serde_json::to_string_pretty(&entry)?)
}

/// Restore the current instance from the cache
///
/// Returns `Ok(None)` on a cache miss. I/O errors other than a missing file
/// propagate.
pub async fn load(paths: &CloudPaths) -> Result<Option<InstanceRecord>, CloudInitError> {
    let path = paths.current_datasource_cache();
    let content = match fs::read_to_string(&path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("No datasource cache at {}", path.display());
            return Ok(None);
        }
        Err(e) if e.kind() == ErrorKind::InvalidData => {
            warn!("Datasource cache {} is not UTF-8", path.display());
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };

    let Some(snapshot) = decode(&content) else {
        return Ok(None);
    };
    match snapshot.into_record() {
        Ok(record) => {
            debug!(
                "Restored {} datasource for {} from cache",
                record.datasource, record.instance_id
            );
            Ok(Some(record))
        }
        Err(e) => {
            warn!("Discarding datasource cache: {}", e);
            Ok(None)
        }
    }
}

/// Write the cache entry for `record` into its instance directory
pub async fn save(paths: &CloudPaths, record: &InstanceRecord) -> Result<(), CloudInitError> {
    let path = paths.datasource_cache(&record.instance_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(&path, encode(&DatasourceSnapshot::from_record(record))?).await?;
    debug!("Wrote datasource cache {}", path.display());
    Ok(())
}
