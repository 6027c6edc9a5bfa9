//! Instance state management for cloud-init
//!
//! Manages the /var/lib/cloud directory structure including:
//! - Instance tracking (current vs previous)
//! - Semaphore files for run-once bookkeeping
//! - Persisted user-data, metadata and status

pub mod paths;
pub mod semaphore;

pub use paths::CloudPaths;
pub use semaphore::{Frequency, RunOutcome, SemaphoreStore};

use crate::{CloudInitError, InstanceRecord};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

/// Instance state manager
#[derive(Debug)]
pub struct InstanceState {
    /// Cloud paths configuration
    paths: CloudPaths,
    /// Current instance ID (if known)
    instance_id: Option<String>,
    /// Semaphore store (initialized when instance ID is set)
    semaphores: Option<SemaphoreStore>,
}

/// Status of cloud-init execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudInitStatus {
    /// Current status (running, done, error)
    pub status: String,
    /// Whether boot is finished
    pub boot_finished: bool,
    /// Last stage that was executed
    pub stage: Option<String>,
    /// Errors recorded by the last stage
    #[serde(default)]
    pub errors: Vec<String>,
    /// Datasource name
    pub datasource: Option<String>,
}

impl Default for CloudInitStatus {
    fn default() -> Self {
        Self {
            status: "not-started".to_string(),
            boot_finished: false,
            stage: None,
            errors: Vec::new(),
            datasource: None,
        }
    }
}

impl Default for InstanceState {
    fn default() -> Self {
        Self::new()
    }
}

impl InstanceState {
    /// Create a new instance state manager with default paths
    pub fn new() -> Self {
        Self::with_paths(CloudPaths::new())
    }

    /// Create with custom paths (useful for testing)
    pub fn with_paths(paths: CloudPaths) -> Self {
        Self {
            paths,
            instance_id: None,
            semaphores: None,
        }
    }

    /// Get the paths configuration
    pub fn paths(&self) -> &CloudPaths {
        &self.paths
    }

    /// Get the current instance ID
    pub fn instance_id(&self) -> Option<&str> {
        self.instance_id.as_deref()
    }

    /// Get the semaphore store (requires instance ID to be set)
    pub fn semaphores(&self) -> Option<&SemaphoreStore> {
        self.semaphores.as_ref()
    }

    /// Initialize the cloud-init directory structure
    pub async fn initialize(&self) -> Result<(), CloudInitError> {
        fs::create_dir_all(self.paths.data_dir()).await?;
        fs::create_dir_all(self.paths.instances_dir()).await?;
        fs::create_dir_all(self.paths.shared_sem_dir()).await?;
        fs::create_dir_all(self.paths.scripts_per_boot()).await?;
        fs::create_dir_all(self.paths.scripts_per_instance()).await?;
        fs::create_dir_all(self.paths.scripts_per_once()).await?;

        debug!(
            "Created cloud-init directories under {}",
            self.paths.base.display()
        );
        Ok(())
    }

    /// Point the current-instance indirection at `instance_id`
    ///
    /// Creates the instance directory tree, re-points the `instance` symlink
    /// and records the ID. Returns whether this is a different instance than
    /// the one recorded last.
    pub async fn set_current_instance(&mut self, instance_id: &str) -> Result<bool, CloudInitError> {
        if instance_id.is_empty() || instance_id.contains('/') {
            return Err(CloudInitError::InvalidData(format!(
                "Unusable instance-id: {instance_id:?}"
            )));
        }

        if let Some(current) = &self.instance_id {
            if current != instance_id {
                return Err(CloudInitError::InvalidData(format!(
                    "Instance already pinned to {current}, refusing {instance_id}"
                )));
            }
        }

        let is_new_instance = self.check_instance_change(instance_id).await?;

        fs::create_dir_all(self.paths.sem_dir(instance_id)).await?;
        fs::create_dir_all(self.paths.instance_scripts_dir(instance_id)).await?;
        fs::create_dir_all(self.paths.handlers_dir(instance_id)).await?;
        fs::create_dir_all(self.paths.data_dir()).await?;

        self.update_instance_link(instance_id).await?;
        fs::write(self.paths.cached_instance_id(), instance_id).await?;

        self.semaphores = Some(SemaphoreStore::for_instance(&self.paths, instance_id));
        self.instance_id = Some(instance_id.to_string());

        if is_new_instance {
            info!("New instance detected: {}", instance_id);
        }

        Ok(is_new_instance)
    }

    /// Check if the instance has changed
    async fn check_instance_change(&self, new_id: &str) -> Result<bool, CloudInitError> {
        let cached_id = match fs::read_to_string(self.paths.cached_instance_id()).await {
            Ok(id) => id,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        };
        let cached_id = cached_id.trim();

        if cached_id != new_id {
            fs::write(self.paths.previous_instance_id(), cached_id).await?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Update the /var/lib/cloud/instance symlink
    async fn update_instance_link(&self, instance_id: &str) -> Result<(), CloudInitError> {
        let link_path = self.paths.instance_link();
        let target = self.paths.instance_dir(instance_id);

        remove_link(&link_path).await?;

        #[cfg(unix)]
        {
            fs::symlink(&target, &link_path).await?;
            debug!(
                "Created instance symlink: {} -> {}",
                link_path.display(),
                target.display()
            );
        }

        #[cfg(not(unix))]
        {
            fs::write(&link_path, target.to_string_lossy().as_bytes()).await?;
        }

        Ok(())
    }

    /// Drop the datasource cache and the current-instance pointer together
    pub async fn purge_cache(&mut self) -> Result<(), CloudInitError> {
        let cache = self.paths.current_datasource_cache();
        match fs::remove_file(&cache).await {
            Ok(()) => debug!("Removed datasource cache {}", cache.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        remove_link(&self.paths.instance_link()).await?;
        self.instance_id = None;
        self.semaphores = None;
        info!("Purged datasource cache and current instance pointer");
        Ok(())
    }

    /// Write the raw inputs and metadata of the resolved instance
    pub async fn persist_instance(&self, record: &InstanceRecord) -> Result<(), CloudInitError> {
        let id = self.instance_id.as_deref().ok_or(CloudInitError::NoInstance)?;

        fs::write(self.paths.user_data(id), &record.user_data).await?;
        fs::write(
            self.paths.vendor_data(id),
            record.vendor_data.as_deref().unwrap_or_default(),
        )
        .await?;
        fs::write(
            self.paths.meta_data(id),
            serde_json::to_vec_pretty(&record.metadata)?,
        )
        .await?;
        fs::write(self.paths.datasource_file(id), record.datasource.to_string()).await?;

        debug!("Saved instance data for {}", id);
        Ok(())
    }

    /// Save the normalized user-data (MIME) next to the raw copy
    pub async fn save_normalized_userdata(&self, mime: &[u8]) -> Result<(), CloudInitError> {
        let id = self.instance_id.as_deref().ok_or(CloudInitError::NoInstance)?;
        let path = self.paths.user_data_normalized(id);
        fs::write(&path, mime).await?;
        debug!("Saved normalized user-data to {}", path.display());
        Ok(())
    }

    /// Mark boot as finished
    pub async fn mark_boot_finished(&self) -> Result<(), CloudInitError> {
        let id = self.instance_id.as_deref().ok_or(CloudInitError::NoInstance)?;
        let timestamp = semaphore::unix_timestamp().to_string();
        fs::write(self.paths.boot_finished(id), timestamp).await?;
        info!("Boot finished marker created");
        Ok(())
    }

    /// Check if boot has finished
    pub fn is_boot_finished(&self) -> bool {
        self.instance_id
            .as_deref()
            .is_some_and(|id| self.paths.boot_finished(id).exists())
    }

    /// Update status
    pub async fn update_status(&self, status: &CloudInitStatus) -> Result<(), CloudInitError> {
        fs::create_dir_all(self.paths.data_dir()).await?;
        let json = serde_json::to_string_pretty(status)?;
        fs::write(self.paths.status_file(), json).await?;
        Ok(())
    }

    /// Read current status
    pub async fn read_status(&self) -> Result<CloudInitStatus, CloudInitError> {
        match fs::read_to_string(self.paths.status_file()).await {
            Ok(content) => Ok(serde_json::from_str(&content)?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(CloudInitStatus::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the final result file
    pub async fn write_result(
        &self,
        datasource: Option<&str>,
        errors: &[String],
    ) -> Result<(), CloudInitError> {
        let result = serde_json::json!({
            "v1": {
                "datasource": datasource,
                "errors": errors,
            }
        });
        fs::create_dir_all(self.paths.data_dir()).await?;
        fs::write(self.paths.result_file(), serde_json::to_string_pretty(&result)?).await?;
        Ok(())
    }

    /// Clean all cloud-init state (for testing or reset)
    pub async fn clean(&self, include_logs: bool) -> Result<(), CloudInitError> {
        info!("Cleaning cloud-init state");

        for dir in [
            self.paths.instances_dir(),
            self.paths.data_dir(),
            self.paths.shared_sem_dir(),
        ] {
            if dir.exists() {
                fs::remove_dir_all(&dir).await?;
            }
        }

        remove_link(&self.paths.instance_link()).await?;

        if include_logs {
            let log_patterns = ["/var/log/cloud-init.log", "/var/log/cloud-init-output.log"];
            for pattern in log_patterns {
                let path = Path::new(pattern);
                if path.exists() {
                    fs::remove_file(path).await.ok();
                }
            }
        }

        info!("Cloud-init state cleaned");
        Ok(())
    }

    /// Load cached instance ID from disk
    pub async fn load_cached_instance_id(&mut self) -> Result<Option<String>, CloudInitError> {
        let id = match fs::read_to_string(self.paths.cached_instance_id()).await {
            Ok(id) => id.trim().to_string(),
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if id.is_empty() {
            return Ok(None);
        }

        self.semaphores = Some(SemaphoreStore::for_instance(&self.paths, &id));
        self.instance_id = Some(id.clone());
        Ok(Some(id))
    }
}

/// Remove a symlink (or the file standing in for it) if present
async fn remove_link(link: &Path) -> Result<(), CloudInitError> {
    match fs::remove_file(link).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
