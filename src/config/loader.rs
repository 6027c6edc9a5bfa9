//! Configuration loader
//!
//! Loads and merges configuration documents from standard locations.

use super::SystemConfig;
use super::merge::{self, ListMergeStrategy};
use crate::{CloudInitError, state::CloudPaths};
use serde_yaml::Value;
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info, warn};

/// Lists in later documents replace earlier ones, so a drop-in can shorten
/// `datasource_list` or a module list.
const SYSTEM_LIST_STRATEGY: ListMergeStrategy = ListMergeStrategy::Replace;

/// Load `cloud.cfg` and its drop-ins as one merged YAML document
pub async fn load_system_value(paths: &CloudPaths) -> Result<Value, CloudInitError> {
    let mut docs = Vec::new();

    // 1. Load base config (/etc/cloud/cloud.cfg)
    if let Some(doc) = load_config_file(paths.main_config()).await? {
        debug!("Loaded base config from {}", paths.main_config().display());
        docs.push(doc);
    }

    // 2. Load drop-in configs (/etc/cloud/cloud.cfg.d/*.cfg)
    docs.extend(load_dropin_configs(paths.config_d()).await?);

    Ok(merge::merge_all(&docs, SYSTEM_LIST_STRATEGY))
}

/// Load the merged system configuration, raw and typed
pub async fn load_system_config(
    paths: &CloudPaths,
) -> Result<(Value, SystemConfig), CloudInitError> {
    let value = load_system_value(paths).await?;
    let config = SystemConfig::from_value(&value)?;
    Ok((value, config))
}

/// The configuration modules see: system config overlaid with the
/// instance's merged cloud-config
pub async fn load_module_config(
    paths: &CloudPaths,
    system: &Value,
    instance_id: &str,
) -> Result<Value, CloudInitError> {
    let path = paths.cloud_config(instance_id);
    match load_config_file(&path).await? {
        Some(user) => {
            debug!("Overlaying {}", path.display());
            Ok(merge::merge_yaml_values(system, &user, SYSTEM_LIST_STRATEGY))
        }
        None => Ok(system.clone()),
    }
}

/// Load a YAML document from a single file
///
/// A missing file is `None`; an unparsable one is logged and skipped.
async fn load_config_file(path: impl AsRef<Path>) -> Result<Option<Value>, CloudInitError> {
    let path = path.as_ref();

    let content = match fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    match serde_yaml::from_str::<Value>(&content) {
        Ok(Value::Null) => Ok(None),
        Ok(Value::Mapping(map)) => Ok(Some(Value::Mapping(map))),
        Ok(_) => {
            warn!("Ignoring {}: top level is not a mapping", path.display());
            Ok(None)
        }
        Err(e) => {
            warn!("Failed to parse {}: {}", path.display(), e);
            Ok(None)
        }
    }
}

/// Load all drop-in configs from a directory (sorted alphabetically)
async fn load_dropin_configs(dir: impl AsRef<Path>) -> Result<Vec<Value>, CloudInitError> {
    let dir = dir.as_ref();

    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut entries = Vec::new();
    let mut read_dir = fs::read_dir(dir).await?;
    while let Some(entry) = read_dir.next_entry().await? {
        let path = entry.path();

        // Only process .cfg files
        if path.extension().is_some_and(|e| e == "cfg") {
            entries.push(path);
        }
    }

    entries.sort();

    let mut docs = Vec::new();
    for path in entries {
        if let Some(doc) = load_config_file(&path).await? {
            debug!("Loaded drop-in config from {}", path.display());
            docs.push(doc);
        }
    }

    info!("Loaded {} drop-in configs", docs.len());
    Ok(docs)
}
