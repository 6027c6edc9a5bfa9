//! Configuration modules
//!
//! Each module handles a specific aspect of cloud-init configuration.
//! The stage module lists (`cloud_init_modules`, `cloud_config_modules`,
//! `cloud_final_modules`) name modules from this registry; the orchestrator
//! runs each one under its semaphore.

pub mod bootcmd;
pub mod final_message;
pub mod hostname;
pub mod runcmd;
pub mod scripts;
pub mod write_files;

use crate::state::semaphore::canonical_name;
use crate::{BootContext, CloudInitError, Frequency};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_yaml::Value;
use std::collections::HashMap;

/// Trait for configuration modules
#[async_trait]
pub trait Module: Send + Sync {
    /// Name of this module
    fn name(&self) -> &'static str;

    /// Execution frequency for this module
    fn frequency(&self) -> Frequency {
        Frequency::PerInstance
    }

    /// Apply the module
    ///
    /// `name` is the name the module was invoked under, `cfg` the merged
    /// configuration and `args` the extra arguments of the module list entry.
    async fn handle(
        &self,
        name: &str,
        cfg: &Value,
        cloud: &BootContext,
        args: &[String],
    ) -> Result<(), CloudInitError>;
}

/// Compiled-in modules by canonical name
#[derive(Default)]
pub struct ModuleRegistry {
    modules: HashMap<String, Box<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every builtin module
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(bootcmd::BootCmd));
        registry.register(Box::new(write_files::WriteFiles));
        registry.register(Box::new(write_files::WriteFilesDeferred));
        registry.register(Box::new(hostname::SetHostname::default()));
        registry.register(Box::new(runcmd::RunCmdModule));
        for module in scripts::RunScripts::all() {
            registry.register(Box::new(module));
        }
        registry.register(Box::new(final_message::FinalMessage));
        registry
    }

    /// Add a module, replacing one with the same name
    pub fn register(&mut self, module: Box<dyn Module>) {
        self.modules.insert(canonical_name(module.name()), module);
    }

    /// Look a module up; `-` and `_` are interchangeable in `name`
    pub fn get(&self, name: &str) -> Option<&dyn Module> {
        self.modules.get(&canonical_name(name)).map(|m| m.as_ref())
    }
}

/// Deserialize the `key` section of `cfg`
///
/// A missing or null section yields the default.
pub fn section<T>(cfg: &Value, module: &str, key: &str) -> Result<T, CloudInitError>
where
    T: DeserializeOwned + Default,
{
    match cfg.get(key) {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_yaml::from_value(value.clone())
            .map_err(|e| CloudInitError::module(module, format!("invalid '{key}': {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        let registry = ModuleRegistry::builtin();
        for name in [
            "bootcmd",
            "write_files",
            "write-files-deferred",
            "set_hostname",
            "runcmd",
            "scripts_per_once",
            "scripts-per-boot",
            "scripts_per_instance",
            "scripts_user",
            "final_message",
        ] {
            assert!(registry.get(name).is_some(), "missing {name}");
        }
        assert!(registry.get("ntp").is_none());
    }

    #[test]
    fn test_declared_frequencies() {
        let registry = ModuleRegistry::builtin();
        let freq = |n: &str| registry.get(n).map(|m| m.frequency());
        assert_eq!(freq("bootcmd"), Some(Frequency::Always));
        assert_eq!(freq("scripts_per_once"), Some(Frequency::Once));
        assert_eq!(freq("scripts_per_boot"), Some(Frequency::Always));
        assert_eq!(freq("runcmd"), Some(Frequency::PerInstance));
        assert_eq!(freq("final_message"), Some(Frequency::Always));
    }

    #[test]
    fn test_section() {
        let cfg: Value = serde_yaml::from_str("runcmd: [a, b]\nbad: 3\n").unwrap();
        let cmds: Vec<String> = section(&cfg, "runcmd", "runcmd").unwrap();
        assert_eq!(cmds, vec!["a", "b"]);

        let missing: Vec<String> = section(&cfg, "x", "absent").unwrap();
        assert!(missing.is_empty());

        let bad: Result<Vec<String>, _> = section(&cfg, "x", "bad");
        assert!(bad.is_err());
    }
}
