//! Script directory modules
//!
//! `scripts_per_once`, `scripts_per_boot` and `scripts_per_instance` run the
//! executables an image ships under `<base>/scripts/per-*`.
//! `scripts_user` runs the scripts user-data delivered into the instance
//! `scripts/` directory. Every script runs even when an earlier one fails.

use super::Module;
use crate::{BootContext, CloudInitError, Frequency};
use async_trait::async_trait;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScriptDir {
    PerOnce,
    PerBoot,
    PerInstance,
    User,
}

pub struct RunScripts {
    name: &'static str,
    frequency: Frequency,
    dir: ScriptDir,
}

impl RunScripts {
    /// The four script runners
    pub fn all() -> [Self; 4] {
        [
            Self {
                name: "scripts_per_once",
                frequency: Frequency::Once,
                dir: ScriptDir::PerOnce,
            },
            Self {
                name: "scripts_per_boot",
                frequency: Frequency::Always,
                dir: ScriptDir::PerBoot,
            },
            Self {
                name: "scripts_per_instance",
                frequency: Frequency::PerInstance,
                dir: ScriptDir::PerInstance,
            },
            Self {
                name: "scripts_user",
                frequency: Frequency::PerInstance,
                dir: ScriptDir::User,
            },
        ]
    }

    fn directory(&self, cloud: &BootContext) -> Result<PathBuf, CloudInitError> {
        let paths = &cloud.paths;
        Ok(match self.dir {
            ScriptDir::PerOnce => paths.scripts_per_once(),
            ScriptDir::PerBoot => paths.scripts_per_boot(),
            ScriptDir::PerInstance => paths.scripts_per_instance(),
            ScriptDir::User => {
                let id = cloud.instance_id().ok_or(CloudInitError::NoInstance)?;
                paths.instance_scripts_dir(id)
            }
        })
    }
}

#[async_trait]
impl Module for RunScripts {
    fn name(&self) -> &'static str {
        self.name
    }

    fn frequency(&self) -> Frequency {
        self.frequency
    }

    async fn handle(
        &self,
        name: &str,
        _cfg: &Value,
        cloud: &BootContext,
        _args: &[String],
    ) -> Result<(), CloudInitError> {
        let dir = self.directory(cloud)?;
        let failed = run_parts(&dir).await?;
        if failed.is_empty() {
            Ok(())
        } else {
            Err(CloudInitError::module(
                name,
                format!("failed to run {} script(s): {}", failed.len(), failed.join(", ")),
            ))
        }
    }
}

/// Run the executables in `dir` in name order
///
/// Returns the names of the scripts that failed. A missing directory has
/// nothing to run.
pub async fn run_parts(dir: &Path) -> Result<Vec<String>, CloudInitError> {
    if !dir.is_dir() {
        debug!("Script directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }

    let mut scripts = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if metadata.is_file() && is_executable(&metadata) {
            scripts.push(entry.path());
        } else {
            debug!("Skipping non-executable {}", entry.path().display());
        }
    }
    scripts.sort();

    let mut failed = Vec::new();
    for script in scripts {
        let label = script
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        info!("Running script {}", script.display());
        match Command::new(&script).output().await {
            Ok(output) if output.status.success() => {
                if !output.stdout.is_empty() {
                    debug!("{} stdout: {}", label, String::from_utf8_lossy(&output.stdout));
                }
            }
            Ok(output) => {
                warn!(
                    "Script {} exited with status {}: {}",
                    label,
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                failed.push(label);
            }
            Err(e) => {
                warn!("Failed to run script {}: {}", label, e);
                failed.push(label);
            }
        }
    }
    Ok(failed)
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    true
}
