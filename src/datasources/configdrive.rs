//! OpenStack config drive datasource
//!
//! Reads the `openstack/latest` tree of an already-mounted config drive.
//! https://docs.openstack.org/nova/latest/user/metadata.html

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use super::{Datasource, DatasourceKind, ProbeData};
use crate::{BootContext, CloudInitError};

const METADATA_FILE: &str = "openstack/latest/meta_data.json";
const USER_DATA_FILE: &str = "openstack/latest/user_data";
const VENDOR_DATA_FILE: &str = "openstack/latest/vendor_data.json";

/// The fields of `meta_data.json` we interpret
#[derive(Debug, Deserialize)]
struct OpenStackMetadata {
    #[serde(default)]
    uuid: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    availability_zone: String,
}

/// Config drive datasource
#[derive(Debug, Clone)]
pub struct ConfigDrive {
    mount_points: Vec<PathBuf>,
}

impl ConfigDrive {
    pub fn new(mount_points: Vec<PathBuf>) -> Self {
        Self { mount_points }
    }

    pub fn from_context(ctx: &BootContext) -> Self {
        Self::new(ctx.config.datasource.config_drive.mount_points.clone())
    }

    /// First mount point that looks like a config drive
    async fn find_config_drive(&self) -> Option<&Path> {
        for mount in &self.mount_points {
            if fs::metadata(mount.join(METADATA_FILE)).await.is_ok() {
                debug!("Found config drive at {}", mount.display());
                return Some(mount);
            }
        }
        None
    }
}

/// Vendor data is either a JSON string or an object with a `cloud-init` key
fn extract_vendor_data(raw: &str) -> Option<Vec<u8>> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::String(s)) => Some(s.into_bytes()),
        Ok(Value::Object(map)) => match map.get("cloud-init") {
            Some(Value::String(s)) => Some(s.clone().into_bytes()),
            Some(_) => {
                warn!("Ignoring non-string cloud-init vendor data");
                None
            }
            None => None,
        },
        Ok(Value::Null) => None,
        Ok(_) => {
            warn!("Unsupported vendor_data.json layout");
            None
        }
        Err(e) => {
            warn!("Failed to parse vendor_data.json: {}", e);
            None
        }
    }
}

#[async_trait]
impl Datasource for ConfigDrive {
    fn kind(&self) -> DatasourceKind {
        DatasourceKind::ConfigDrive
    }

    async fn probe(&self) -> Result<Option<ProbeData>, CloudInitError> {
        let Some(drive) = self.find_config_drive().await else {
            return Ok(None);
        };

        let content = fs::read_to_string(drive.join(METADATA_FILE)).await?;
        let raw: Map<String, Value> = serde_json::from_str(&content).map_err(|e| {
            CloudInitError::Datasource(format!("Failed to parse config-drive metadata: {e}"))
        })?;
        let os_meta: OpenStackMetadata = serde_json::from_value(Value::Object(raw.clone()))?;

        if os_meta.uuid.is_empty() {
            return Err(CloudInitError::Datasource(
                "config-drive metadata has no uuid".to_string(),
            ));
        }

        let mut metadata = raw;
        metadata.insert("instance-id".into(), Value::String(os_meta.uuid.clone()));
        metadata.insert("cloud-name".into(), Value::String("openstack".into()));
        let hostname = if os_meta.hostname.is_empty() {
            os_meta.name
        } else {
            os_meta.hostname
        };
        if !hostname.is_empty() {
            metadata.insert("local-hostname".into(), Value::String(hostname));
        }
        if !os_meta.availability_zone.is_empty() {
            metadata.insert(
                "availability-zone".into(),
                Value::String(os_meta.availability_zone),
            );
        }

        let user_data = match fs::read(drive.join(USER_DATA_FILE)).await {
            Ok(data) => data,
            Err(e) if e.kind() == ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };

        let vendor_data = match fs::read_to_string(drive.join(VENDOR_DATA_FILE)).await {
            Ok(raw) => extract_vendor_data(&raw),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        Ok(Some(ProbeData {
            instance_id: os_meta.uuid,
            metadata,
            user_data,
            vendor_data,
        }))
    }
}
