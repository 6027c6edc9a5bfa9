//! System configuration
//!
//! `cloud.cfg` and its drop-ins are merged as plain YAML and then read into
//! the typed [`SystemConfig`]. Modules read their own sections out of the
//! merged document themselves.

pub mod loader;
pub mod merge;

use crate::{CloudInitError, Frequency};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::path::PathBuf;

/// Datasources tried when `datasource_list` is not configured
pub const DEFAULT_DATASOURCE_LIST: &[&str] = &["NoCloud", "ConfigDrive", "Ec2"];

/// Typed view of `/etc/cloud/cloud.cfg`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Candidate datasources in priority order
    pub datasource_list: Vec<String>,

    /// Keep the datasource cache across boots
    pub manual_cache_clean: bool,

    /// Per-datasource settings
    pub datasource: DatasourceConfig,

    /// Modules run by the network stage
    pub cloud_init_modules: Vec<ModuleEntry>,

    /// Modules run by the config stage
    pub cloud_config_modules: Vec<ModuleEntry>,

    /// Modules run by the final stage
    pub cloud_final_modules: Vec<ModuleEntry>,

    /// Directories searched for custom part handlers
    pub handler_dirs: Vec<PathBuf>,

    /// Where upstart job parts are installed
    pub upstart_dir: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            datasource_list: DEFAULT_DATASOURCE_LIST.iter().map(|s| s.to_string()).collect(),
            manual_cache_clean: false,
            datasource: DatasourceConfig::default(),
            cloud_init_modules: ["bootcmd", "write_files", "set_hostname"]
                .into_iter()
                .map(ModuleEntry::named)
                .collect(),
            cloud_config_modules: vec![ModuleEntry::named("runcmd")],
            cloud_final_modules: [
                "write_files_deferred",
                "scripts_per_once",
                "scripts_per_boot",
                "scripts_per_instance",
                "scripts_user",
                "final_message",
            ]
            .into_iter()
            .map(ModuleEntry::named)
            .collect(),
            handler_dirs: Vec::new(),
            upstart_dir: PathBuf::from("/etc/init"),
        }
    }
}

impl SystemConfig {
    /// Read the typed configuration out of a merged YAML document
    pub fn from_value(value: &Value) -> Result<Self, CloudInitError> {
        if value.is_null() {
            return Ok(Self::default());
        }
        serde_yaml::from_value(value.clone())
            .map_err(|e| CloudInitError::Config(format!("Invalid system configuration: {e}")))
    }

    /// Parse configuration YAML text
    pub fn from_yaml(yaml: &str) -> Result<Self, CloudInitError> {
        let value: Value = serde_yaml::from_str(yaml)?;
        Self::from_value(&value)
    }
}

/// Settings for the builtin datasources, keyed by datasource name
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DatasourceConfig {
    #[serde(rename = "NoCloud")]
    pub nocloud: NoCloudConfig,
    #[serde(rename = "ConfigDrive")]
    pub config_drive: ConfigDriveConfig,
    #[serde(rename = "Ec2")]
    pub ec2: Ec2Config,
}

/// NoCloud seed locations
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NoCloudConfig {
    /// Extra seed directories searched before the defaults
    pub seed_dirs: Vec<PathBuf>,
    /// Pre-mounted `cidata` volumes
    pub mount_points: Vec<PathBuf>,
}

impl Default for NoCloudConfig {
    fn default() -> Self {
        Self {
            seed_dirs: Vec::new(),
            mount_points: ["/mnt/cidata", "/media/cidata", "/run/cloud-init/cidata"]
                .into_iter()
                .map(PathBuf::from)
                .collect(),
        }
    }
}

/// Config drive locations
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConfigDriveConfig {
    /// Pre-mounted config drive volumes
    pub mount_points: Vec<PathBuf>,
}

impl Default for ConfigDriveConfig {
    fn default() -> Self {
        Self {
            mount_points: [
                "/mnt/config",
                "/config-2",
                "/media/configdrive",
                "/run/cloud-init/config-drive",
            ]
            .into_iter()
            .map(PathBuf::from)
            .collect(),
        }
    }
}

/// EC2 metadata service settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Ec2Config {
    /// Metadata service base URLs, polled in order
    pub metadata_urls: Vec<String>,
    /// Total seconds to wait for the metadata service
    pub max_wait: u64,
    /// Per-request timeout in seconds
    pub timeout: u64,
    /// Seconds to sleep between polling rounds
    pub sleep: u64,
    /// Require DMI evidence of EC2 before touching the network
    pub strict_id: bool,
}

impl Default for Ec2Config {
    fn default() -> Self {
        Self {
            metadata_urls: vec!["http://169.254.169.254".to_string()],
            max_wait: 120,
            timeout: 50,
            sleep: 1,
            strict_id: true,
        }
    }
}

/// One entry of a module list
///
/// Written as a bare `name` or as `[name, frequency, args...]`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Value")]
pub struct ModuleEntry {
    pub name: String,
    pub frequency: Option<Frequency>,
    pub args: Vec<String>,
}

impl ModuleEntry {
    /// Entry with only a name
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            frequency: None,
            args: Vec::new(),
        }
    }
}

impl TryFrom<Value> for ModuleEntry {
    type Error = CloudInitError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(name) => Ok(Self::named(&name)),
            Value::Sequence(items) => {
                let mut items = items.into_iter();
                let name = match items.next() {
                    Some(Value::String(name)) => name,
                    _ => {
                        return Err(CloudInitError::Config(
                            "Module entry must start with a name".to_string(),
                        ));
                    }
                };
                let frequency = match items.next() {
                    None | Some(Value::Null) => None,
                    Some(Value::String(freq)) if freq.is_empty() => None,
                    Some(Value::String(freq)) => Some(freq.parse()?),
                    Some(other) => {
                        return Err(CloudInitError::Config(format!(
                            "Invalid frequency for module {name}: {other:?}"
                        )));
                    }
                };
                let args = items.map(|v| scalar_to_string(&v)).collect();
                Ok(Self {
                    name,
                    frequency,
                    args,
                })
            }
            other => Err(CloudInitError::Config(format!(
                "Invalid module entry: {other:?}"
            ))),
        }
    }
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

/// Command to run (can be string or list of args)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunCmd {
    /// Shell command as string
    Shell(String),
    /// Command with arguments
    Args(Vec<String>),
}
