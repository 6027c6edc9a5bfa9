//! Process-wide boot context
//!
//! Built once at process start and handed to datasources, handlers and
//! modules; nothing else holds global state.

use crate::config::{SystemConfig, loader};
use crate::state::CloudPaths;
use crate::{CloudInitError, InstanceRecord};
use serde_yaml::Value;
use std::sync::Arc;

/// Configuration, paths and the resolved instance for one invocation
#[derive(Debug, Clone)]
pub struct BootContext {
    /// State and config directory layout
    pub paths: CloudPaths,
    /// Typed system configuration
    pub config: SystemConfig,
    /// The merged system configuration as YAML
    pub system_cfg: Value,
    instance: Option<Arc<InstanceRecord>>,
}

impl BootContext {
    /// Load system configuration from the config directory of `paths`
    pub async fn load(paths: CloudPaths) -> Result<Self, CloudInitError> {
        let (system_cfg, config) = loader::load_system_config(&paths).await?;
        Ok(Self {
            paths,
            config,
            system_cfg,
            instance: None,
        })
    }

    /// Build from an already-parsed configuration document
    pub fn from_value(paths: CloudPaths, system_cfg: Value) -> Result<Self, CloudInitError> {
        let config = SystemConfig::from_value(&system_cfg)?;
        Ok(Self {
            paths,
            config,
            system_cfg,
            instance: None,
        })
    }

    /// Build from YAML text (handy in tests and tools)
    pub fn from_yaml(paths: CloudPaths, yaml: &str) -> Result<Self, CloudInitError> {
        Self::from_value(paths, serde_yaml::from_str(yaml)?)
    }

    /// The resolved instance
    pub fn instance(&self) -> Result<&InstanceRecord, CloudInitError> {
        self.instance.as_deref().ok_or(CloudInitError::NoInstance)
    }

    /// Instance ID of the resolved instance, if any
    pub fn instance_id(&self) -> Option<&str> {
        self.instance.as_deref().map(|r| r.instance_id.as_str())
    }

    /// Shared handle to the resolved instance
    pub fn shared_instance(&self) -> Option<Arc<InstanceRecord>> {
        self.instance.clone()
    }

    /// Attach the resolved instance
    pub fn set_instance(&mut self, record: InstanceRecord) -> Arc<InstanceRecord> {
        let record = Arc::new(record);
        self.instance = Some(Arc::clone(&record));
        record
    }
}
