//! Semaphore file handling for cloud-init
//!
//! Semaphores give every named action an idempotency contract:
//! - once-per-instance: run once per instance ID
//! - once: run once ever (across all instances)
//! - always: run on every invocation, never recorded
//!
//! Per-instance semaphores live under the instance directory, so a new
//! instance ID starts with a clean slate. Exclusive file creation is the
//! only mutual-exclusion primitive: losing the race is not an error.

use super::paths::CloudPaths;
use crate::CloudInitError;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Semaphore frequency - how often an action should run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Frequency {
    /// Run on every invocation (no semaphore)
    #[serde(rename = "always", alias = "per-always", alias = "per-boot")]
    Always,
    /// Run once per instance ID
    #[default]
    #[serde(
        rename = "once-per-instance",
        alias = "instance",
        alias = "per-instance"
    )]
    PerInstance,
    /// Run once ever (even across instance changes)
    #[serde(rename = "once", alias = "per-once")]
    Once,
}

impl Frequency {
    /// Name used in semaphore file names and on the wire to handlers
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Always => "always",
            Self::PerInstance => "once-per-instance",
            Self::Once => "once",
        }
    }
}

impl FromStr for Frequency {
    type Err = CloudInitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "always" | "per-always" | "per-boot" => Ok(Self::Always),
            "once-per-instance" | "instance" | "per-instance" => Ok(Self::PerInstance),
            "once" | "per-once" => Ok(Self::Once),
            other => Err(CloudInitError::Config(format!("Unknown frequency: {other}"))),
        }
    }
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What [`SemaphoreStore::and_run`] did with its action
#[derive(Debug)]
pub enum RunOutcome {
    /// The semaphore was already held, the action did not run
    Skipped,
    /// The action ran and succeeded
    Ran,
    /// The action ran and returned this error
    Failed(CloudInitError),
}

impl RunOutcome {
    pub fn ran(&self) -> bool {
        matches!(self, Self::Ran)
    }
}

/// On-disk idempotency ledger
#[derive(Debug, Clone)]
pub struct SemaphoreStore {
    /// Per-instance semaphores (`/var/lib/cloud/instances/<id>/sem`)
    instance_dir: PathBuf,
    /// Semaphores shared by all instances (`/var/lib/cloud/sem`)
    shared_dir: PathBuf,
}

impl SemaphoreStore {
    /// Create a store over explicit directories
    pub fn new(instance_dir: impl AsRef<Path>, shared_dir: impl AsRef<Path>) -> Self {
        Self {
            instance_dir: instance_dir.as_ref().to_path_buf(),
            shared_dir: shared_dir.as_ref().to_path_buf(),
        }
    }

    /// Create the store for one instance
    pub fn for_instance(paths: &CloudPaths, instance_id: &str) -> Self {
        Self::new(paths.sem_dir(instance_id), paths.shared_sem_dir())
    }

    /// Lock file for `name` at `freq`
    fn sem_path(&self, name: &str, freq: Frequency) -> PathBuf {
        let file = format!("{}.{}", canonical_name(name), freq);
        match freq {
            Frequency::PerInstance => self.instance_dir.join(file),
            Frequency::Once | Frequency::Always => self.shared_dir.join(file),
        }
    }

    /// Whether `name` already ran at `freq`
    pub fn has_run(&self, name: &str, freq: Frequency) -> bool {
        if freq == Frequency::Always {
            return false;
        }
        let path = self.sem_path(name, freq);
        let exists = path.exists();
        debug!(
            "Semaphore check for {} ({}): {} -> {}",
            name,
            freq,
            path.display(),
            if exists { "skip" } else { "run" }
        );
        exists
    }

    /// Take the lock for `name` at `freq`
    ///
    /// Returns `false` when the lock file already exists.
    pub async fn acquire(&self, name: &str, freq: Frequency) -> Result<bool, CloudInitError> {
        if freq == Frequency::Always {
            return Ok(true);
        }

        let path = self.sem_path(name, freq);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Semaphore {} already held", path.display());
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let contents = format!("{}: {}\n", std::process::id(), unix_timestamp());
        file.write_all(contents.as_bytes()).await?;
        debug!("Created semaphore: {}", path.display());
        Ok(true)
    }

    /// Remove the lock for `name` at `freq` so the action runs again
    pub async fn clear(&self, name: &str, freq: Frequency) -> Result<(), CloudInitError> {
        if freq == Frequency::Always {
            return Ok(());
        }
        let path = self.sem_path(name, freq);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("Removed semaphore: {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Run `action` under the semaphore for `name` at `freq`
    ///
    /// An `Err` comes from the semaphore files themselves; a failing action
    /// is reported as [`RunOutcome::Failed`]. The lock of a failed action is
    /// removed only if `clear_on_fail` is set.
    #[allow(clippy::collapsible_if)]
    pub async fn and_run<F, Fut>(
        &self,
        name: &str,
        freq: Frequency,
        clear_on_fail: bool,
        action: F,
    ) -> Result<RunOutcome, CloudInitError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), CloudInitError>>,
    {
        if self.has_run(name, freq) {
            debug!("{} already ran ({})", name, freq);
            return Ok(RunOutcome::Skipped);
        }

        if !self.acquire(name, freq).await? {
            debug!("{} is being handled elsewhere ({})", name, freq);
            return Ok(RunOutcome::Skipped);
        }

        match action().await {
            Ok(()) => Ok(RunOutcome::Ran),
            Err(e) => {
                if clear_on_fail {
                    if let Err(clear_err) = self.clear(name, freq).await {
                        warn!("{} failed and its semaphore could not be cleared: {}", name, e);
                        return Err(clear_err);
                    }
                }
                Ok(RunOutcome::Failed(e))
            }
        }
    }

    /// List the per-instance semaphores that are set
    pub async fn list(&self) -> Result<Vec<String>, CloudInitError> {
        let mut semaphores = Vec::new();

        if self.instance_dir.exists() {
            let mut entries = fs::read_dir(&self.instance_dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if let Some(name) = entry.file_name().to_str() {
                    semaphores.push(name.to_string());
                }
            }
        }

        semaphores.sort();
        Ok(semaphores)
    }
}

/// Module names may use `-` or `_` interchangeably
pub fn canonical_name(name: &str) -> String {
    name.replace('-', "_")
}

/// Seconds since the epoch (lightweight, no chrono dependency)
pub(crate) fn unix_timestamp() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
