//! NoCloud datasource
//!
//! Reads metadata and user data from local files or mounted ISO.
//! Common locations:
//! - /var/lib/cloud/seed/nocloud/
//! - /var/lib/cloud/seed/nocloud-net/
//! - Mounted filesystem with label 'cidata' or 'CIDATA'

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

use super::{Datasource, DatasourceKind, ProbeData};
use crate::{BootContext, CloudInitError};

/// Instance ID used when meta-data does not carry one
pub const DEFAULT_INSTANCE_ID: &str = "iid-dsnocloud";

/// NoCloud datasource for local file-based configuration
#[derive(Debug, Clone)]
pub struct NoCloud {
    seed_dirs: Vec<PathBuf>,
}

impl NoCloud {
    /// Search exactly these directories
    pub fn new(seed_dirs: Vec<PathBuf>) -> Self {
        Self { seed_dirs }
    }

    /// Configured seed dirs, then `<base>/seed/nocloud{,-net}`, then cidata mounts
    pub fn from_context(ctx: &BootContext) -> Self {
        let settings = &ctx.config.datasource.nocloud;
        let mut seed_dirs = settings.seed_dirs.clone();
        seed_dirs.push(ctx.paths.seed_dir().join("nocloud"));
        seed_dirs.push(ctx.paths.seed_dir().join("nocloud-net"));
        seed_dirs.extend(settings.mount_points.iter().cloned());
        Self::new(seed_dirs)
    }

    /// Find the seed directory containing meta-data
    async fn find_seed_dir(&self) -> Option<&Path> {
        for dir in &self.seed_dirs {
            if let Ok(metadata) = fs::metadata(dir.join("meta-data")).await {
                if metadata.is_file() {
                    return Some(dir);
                }
            }
        }
        None
    }
}

/// Read a seed file; a missing file is `None`
async fn read_optional(seed_dir: &Path, filename: &str) -> Result<Option<Vec<u8>>, CloudInitError> {
    match fs::read(seed_dir.join(filename)).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Parse `meta-data` (YAML, which includes JSON) into a metadata map
pub(crate) fn parse_meta_data(content: &str) -> Result<Map<String, Value>, CloudInitError> {
    let parsed: serde_yaml::Value = serde_yaml::from_str(content)?;
    match serde_json::to_value(parsed)? {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(CloudInitError::InvalidData(format!(
            "meta-data must be a mapping, got {other}"
        ))),
    }
}

#[async_trait]
impl Datasource for NoCloud {
    fn kind(&self) -> DatasourceKind {
        DatasourceKind::NoCloud
    }

    async fn probe(&self) -> Result<Option<ProbeData>, CloudInitError> {
        let Some(seed_dir) = self.find_seed_dir().await else {
            return Ok(None);
        };
        debug!("Reading NoCloud seed from {}", seed_dir.display());

        let meta_raw = fs::read_to_string(seed_dir.join("meta-data")).await?;
        let mut metadata = parse_meta_data(&meta_raw)?;

        let instance_id = match metadata.get("instance-id").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => {
                debug!("No instance-id in meta-data, using {}", DEFAULT_INSTANCE_ID);
                metadata.insert(
                    "instance-id".to_string(),
                    Value::String(DEFAULT_INSTANCE_ID.to_string()),
                );
                DEFAULT_INSTANCE_ID.to_string()
            }
        };
        metadata.insert("cloud-name".to_string(), Value::String("nocloud".to_string()));
        metadata.insert(
            "seed".to_string(),
            Value::String(seed_dir.display().to_string()),
        );

        Ok(Some(ProbeData {
            instance_id,
            metadata,
            user_data: read_optional(seed_dir, "user-data").await?.unwrap_or_default(),
            vendor_data: read_optional(seed_dir, "vendor-data").await?,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_probe_seed_dir() {
        let temp = TempDir::new().unwrap();
        let seed = temp.path().join("seed");
        fs::create_dir_all(&seed).await.unwrap();
        fs::write(seed.join("meta-data"), "instance-id: iid-local01\nlocal-hostname: box\n")
            .await
            .unwrap();
        fs::write(seed.join("user-data"), "#cloud-config\nhostname: box\n")
            .await
            .unwrap();

        let ds = NoCloud::new(vec![temp.path().join("missing"), seed]);
        let data = ds.probe().await.unwrap().unwrap();

        assert_eq!(data.instance_id, "iid-local01");
        assert_eq!(data.metadata["local-hostname"], "box");
        assert_eq!(data.metadata["cloud-name"], "nocloud");
        assert_eq!(data.user_data, b"#cloud-config\nhostname: box\n");
        assert!(data.vendor_data.is_none());
    }

    #[tokio::test]
    async fn test_probe_default_instance_id() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("meta-data"), "").await.unwrap();

        let ds = NoCloud::new(vec![temp.path().to_path_buf()]);
        let data = ds.probe().await.unwrap().unwrap();
        assert_eq!(data.instance_id, DEFAULT_INSTANCE_ID);
        assert!(data.user_data.is_empty());
    }

    #[tokio::test]
    async fn test_probe_json_meta_data() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("meta-data"), r#"{"instance-id": "i-json"}"#)
            .await
            .unwrap();
        fs::write(temp.path().join("vendor-data"), "#cloud-config\n")
            .await
            .unwrap();

        let ds = NoCloud::new(vec![temp.path().to_path_buf()]);
        let data = ds.probe().await.unwrap().unwrap();
        assert_eq!(data.instance_id, "i-json");
        assert_eq!(data.vendor_data.as_deref(), Some(&b"#cloud-config\n"[..]));
    }

    #[tokio::test]
    async fn test_probe_not_applicable() {
        let temp = TempDir::new().unwrap();
        let ds = NoCloud::new(vec![temp.path().join("nope")]);
        assert!(ds.probe().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_probe_invalid_meta_data() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("meta-data"), "- just\n- a list\n")
            .await
            .unwrap();

        let ds = NoCloud::new(vec![temp.path().to_path_buf()]);
        assert!(ds.probe().await.is_err());
    }

    #[test]
    fn test_from_context_search_order() {
        let ctx = BootContext::from_yaml(
            crate::state::CloudPaths::with_base("/var/tmp/ci"),
            "datasource:\n  NoCloud:\n    seed_dirs: [/srv/seed]\n",
        )
        .unwrap();
        let ds = NoCloud::from_context(&ctx);
        assert_eq!(ds.seed_dirs[0], PathBuf::from("/srv/seed"));
        assert_eq!(ds.seed_dirs[1], PathBuf::from("/var/tmp/ci/seed/nocloud"));
        assert_eq!(ds.seed_dirs[2], PathBuf::from("/var/tmp/ci/seed/nocloud-net"));
        assert!(ds.seed_dirs.contains(&PathBuf::from("/mnt/cidata")));
    }
}
