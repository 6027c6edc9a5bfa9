//! Hostname configuration module
//!
//! The hostname comes from cloud-config (`fqdn`, then `hostname`) and falls
//! back to the `local-hostname` the datasource reported.

use super::Module;
use crate::{BootContext, CloudInitError};
use async_trait::async_trait;
use serde::Deserialize;
use serde_yaml::Value;
use std::path::PathBuf;
use tracing::{debug, info};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct HostnameConfig {
    preserve_hostname: bool,
    hostname: Option<String>,
    fqdn: Option<String>,
}

pub struct SetHostname {
    hostname_file: PathBuf,
    set_running: bool,
}

impl Default for SetHostname {
    fn default() -> Self {
        Self {
            hostname_file: PathBuf::from("/etc/hostname"),
            set_running: true,
        }
    }
}

impl SetHostname {
    /// Only write `hostname_file`; leave the running hostname alone
    pub fn with_file(hostname_file: impl Into<PathBuf>) -> Self {
        Self {
            hostname_file: hostname_file.into(),
            set_running: false,
        }
    }
}

#[async_trait]
impl Module for SetHostname {
    fn name(&self) -> &'static str {
        "set_hostname"
    }

    async fn handle(
        &self,
        name: &str,
        cfg: &Value,
        cloud: &BootContext,
        _args: &[String],
    ) -> Result<(), CloudInitError> {
        let config: HostnameConfig = match cfg {
            Value::Mapping(_) => serde_yaml::from_value(cfg.clone())
                .map_err(|e| CloudInitError::module(name, e.to_string()))?,
            _ => HostnameConfig::default(),
        };
        if config.preserve_hostname {
            debug!("preserve_hostname is set, not touching the hostname");
            return Ok(());
        }

        let hostname = config
            .fqdn
            .or(config.hostname)
            .or_else(|| {
                cloud
                    .instance()
                    .ok()
                    .and_then(|i| i.local_hostname())
                    .map(str::to_string)
            });
        let Some(hostname) = hostname.filter(|h| !h.trim().is_empty()) else {
            debug!("No hostname configured or reported");
            return Ok(());
        };

        info!("Setting hostname to: {}", hostname);
        set_hostname(&hostname, &self.hostname_file, self.set_running).await
    }
}

/// Set the system hostname
async fn set_hostname(
    hostname: &str,
    hostname_file: &std::path::Path,
    set_running: bool,
) -> Result<(), CloudInitError> {
    tokio::fs::write(hostname_file, format!("{}\n", hostname)).await?;

    if !set_running {
        return Ok(());
    }

    // Call hostname command to set it immediately
    let output = tokio::process::Command::new("hostname")
        .arg(hostname)
        .output()
        .await
        .map_err(|e| CloudInitError::Command(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CloudInitError::Command(format!(
            "Failed to set hostname: {}",
            stderr
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::CloudPaths;
    use crate::{DatasourceKind, InstanceRecord};
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_hostname_wins() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("hostname");
        let cloud = BootContext::from_yaml(CloudPaths::with_base(temp.path()), "{}").unwrap();
        let cfg: Value = serde_yaml::from_str("hostname: web1\nfqdn: web1.example.com").unwrap();

        SetHostname::with_file(&file)
            .handle("set_hostname", &cfg, &cloud, &[])
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "web1.example.com\n");
    }

    #[tokio::test]
    async fn test_falls_back_to_metadata() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("hostname");
        let mut cloud = BootContext::from_yaml(CloudPaths::with_base(temp.path()), "{}").unwrap();
        let mut record = InstanceRecord::new(DatasourceKind::NoCloud, "i-1");
        record.metadata.insert("local-hostname".into(), "from-meta".into());
        cloud.set_instance(record);

        SetHostname::with_file(&file)
            .handle("set_hostname", &Value::Null, &cloud, &[])
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(&file).unwrap(), "from-meta\n");
    }

    #[tokio::test]
    async fn test_preserve_hostname() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("hostname");
        let cloud = BootContext::from_yaml(CloudPaths::with_base(temp.path()), "{}").unwrap();
        let cfg: Value = serde_yaml::from_str("preserve_hostname: true\nhostname: x").unwrap();

        SetHostname::with_file(&file)
            .handle("set_hostname", &cfg, &cloud, &[])
            .await
            .unwrap();
        assert!(!file.exists());
    }
}
