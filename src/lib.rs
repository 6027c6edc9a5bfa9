//! cloud-init-rs library
//!
//! This crate provides a safe Rust implementation of the cloud-init boot core:
//! datasource resolution with a cross-process cache, run-once semaphores, and
//! the user-data pipeline that turns operator input into typed parts routed to
//! part handlers.
//!
//! # Design Principles
//!
//! - **Safety First**: No unsafe code (`#![forbid(unsafe_code)]`)
//! - **Exactly once**: every action runs under an on-disk semaphore
//! - **Contained failures**: one datasource, part or module never aborts the rest
//! - **Backwards Compatible**: Parse existing cloud-config and user-data formats

pub mod config;
pub mod context;
pub mod datasources;
pub mod handlers;
pub mod modules;
pub mod stages;
pub mod state;
pub mod url_helper;
pub mod userdata;

mod error;

pub use context::BootContext;
pub use datasources::DatasourceKind;
pub use error::CloudInitError;
pub use state::{Frequency, SemaphoreStore};
pub use userdata::{Part, UserDataMessage};

use serde_json::{Map, Value};
use tokio::sync::OnceCell;
use tracing::info;

/// Cloud-init execution stages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Local stage - runs before network is available
    /// Handles: filesystem-only datasource discovery
    Local,
    /// Network stage - runs after network is configured
    /// Handles: metadata retrieval, user-data consumption, init modules
    Network,
    /// Config stage - applies user configuration
    /// Handles: cloud_config_modules
    Config,
    /// Final stage - runs user scripts
    /// Handles: cloud_final_modules, boot-finished marker
    Final,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Local => write!(f, "local"),
            Stage::Network => write!(f, "network"),
            Stage::Config => write!(f, "config"),
            Stage::Final => write!(f, "final"),
        }
    }
}

/// Run the specified cloud-init stages in order
///
/// Returns the exit code of the last stage that produced a non-zero code,
/// or 0 when every stage succeeded.
pub async fn run_stages(ctx: BootContext, stages: &[Stage]) -> Result<i32, CloudInitError> {
    let mut orchestrator = stages::Orchestrator::new(ctx)?;
    let mut exit_code = 0;
    for stage in stages {
        info!("Starting stage: {}", stage);
        let code = orchestrator.run(*stage).await?;
        info!("Completed stage: {} (exit code {})", stage, code);
        if code != 0 {
            exit_code = code;
        }
    }
    Ok(exit_code)
}

/// The resolved instance: what the active datasource found
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    /// Which datasource claimed this instance
    pub datasource: DatasourceKind,
    /// Stable instance identifier
    pub instance_id: String,
    /// Datasource metadata
    pub metadata: Map<String, Value>,
    /// Raw user-data exactly as delivered
    pub user_data: Vec<u8>,
    /// Raw vendor-data, if the platform provides it
    pub vendor_data: Option<Vec<u8>>,
    normalized: OnceCell<UserDataMessage>,
}

impl InstanceRecord {
    pub fn new(datasource: DatasourceKind, instance_id: impl Into<String>) -> Self {
        Self {
            datasource,
            instance_id: instance_id.into(),
            metadata: Map::new(),
            user_data: Vec::new(),
            vendor_data: None,
            normalized: OnceCell::new(),
        }
    }

    /// A string metadata value
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Hostname the platform assigned, if any
    pub fn local_hostname(&self) -> Option<&str> {
        self.metadata_str("local-hostname")
    }

    /// Normalized user-data, computed on first use
    pub async fn normalized_userdata(
        &self,
        processor: &userdata::UserDataProcessor<'_>,
    ) -> Result<&UserDataMessage, CloudInitError> {
        self.normalized
            .get_or_try_init(|| processor.process(&self.user_data))
            .await
    }
}
