//! Cloud-init execution stages
//!
//! Stages run in order during boot, normally as separate processes:
//! 1. Local - before network: filesystem-only datasource discovery
//! 2. Network - after network is up: metadata fetch, user-data consumption,
//!    `cloud_init_modules`
//! 3. Config - `cloud_config_modules`
//! 4. Final - `cloud_final_modules`, boot-finished marker and result
//!
//! The [`Orchestrator`] owns everything a stage needs and records
//! `status.json` after each one.

pub mod config;
pub mod final_stage;
pub mod local;
pub mod network;

use crate::config::ModuleEntry;
use crate::datasources::{Capability, DatasourceRegistry, cache};
use crate::modules::ModuleRegistry;
use crate::state::{CloudInitStatus, InstanceState, RunOutcome, SemaphoreStore};
use crate::userdata::{HttpFetcher, UrlFetcher};
use crate::{BootContext, CloudInitError, InstanceRecord, Stage};
use serde_yaml::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Per-request timeout for `#include` fetches
const INCLUDE_TIMEOUT: Duration = Duration::from_secs(30);

/// What a stage reports back
#[derive(Debug, Default)]
pub struct StageOutcome {
    /// Number of failed modules (and a failed user-data consumption)
    pub failures: i32,
    /// Every error worth reporting in status.json
    pub errors: Vec<String>,
}

impl StageOutcome {
    fn fail(&mut self, error: String) {
        self.failures += 1;
        self.errors.push(error);
    }
}

/// Sequences datasource resolution, user-data consumption and modules
pub struct Orchestrator {
    ctx: BootContext,
    state: InstanceState,
    datasources: DatasourceRegistry,
    modules: ModuleRegistry,
    fetcher: Box<dyn UrlFetcher>,
}

impl Orchestrator {
    /// Orchestrator with the builtin datasources and modules
    pub fn new(ctx: BootContext) -> Result<Self, CloudInitError> {
        Ok(Self {
            state: InstanceState::with_paths(ctx.paths.clone()),
            ctx,
            datasources: DatasourceRegistry::builtin(),
            modules: ModuleRegistry::builtin(),
            fetcher: Box::new(HttpFetcher::new(INCLUDE_TIMEOUT)?),
        })
    }

    pub fn with_datasources(mut self, datasources: DatasourceRegistry) -> Self {
        self.datasources = datasources;
        self
    }

    pub fn with_modules(mut self, modules: ModuleRegistry) -> Self {
        self.modules = modules;
        self
    }

    /// Use `fetcher` for `#include` targets
    pub fn with_fetcher(mut self, fetcher: Box<dyn UrlFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn context(&self) -> &BootContext {
        &self.ctx
    }

    /// Run one stage and record its status
    ///
    /// Returns the stage exit code: the number of failures. Infrastructure
    /// errors propagate.
    pub async fn run(&mut self, stage: Stage) -> Result<i32, CloudInitError> {
        self.state.initialize().await?;

        let result = match stage {
            Stage::Local => local::run(self).await,
            Stage::Network => network::run(self).await,
            Stage::Config => config::run(self).await,
            Stage::Final => final_stage::run(self).await,
        };

        match result {
            Ok(outcome) => {
                let status = if !outcome.errors.is_empty() {
                    "error"
                } else if stage == Stage::Final {
                    "done"
                } else {
                    "running"
                };
                self.record_status(stage, status, outcome.errors).await?;
                Ok(outcome.failures)
            }
            Err(e) => {
                error!("Stage {} failed: {}", stage, e);
                if let Err(status_err) = self
                    .record_status(stage, "error", vec![e.to_string()])
                    .await
                {
                    warn!("Could not record status: {}", status_err);
                }
                Err(e)
            }
        }
    }

    async fn record_status(
        &self,
        stage: Stage,
        status: &str,
        errors: Vec<String>,
    ) -> Result<(), CloudInitError> {
        let status = CloudInitStatus {
            status: status.to_string(),
            boot_finished: self.state.is_boot_finished(),
            stage: Some(stage.to_string()),
            errors,
            datasource: self
                .ctx
                .instance()
                .ok()
                .map(|record| record.datasource.to_string()),
        };
        self.state.update_status(&status).await
    }

    /// The instance for this stage: already resolved, restored from the
    /// cache, or freshly probed with `capability`
    ///
    /// `None` means no datasource applies.
    async fn ensure_instance(
        &mut self,
        capability: Capability,
    ) -> Result<Option<Arc<InstanceRecord>>, CloudInitError> {
        if let Some(record) = self.ctx.shared_instance() {
            return Ok(Some(record));
        }

        if let Some(record) = cache::load(&self.ctx.paths).await? {
            info!(
                "Restored datasource {} (instance {}) from cache",
                record.datasource, record.instance_id
            );
            return self.pin(record, false).await.map(Some);
        }

        match self.datasources.resolve(&self.ctx, capability).await {
            Ok(record) => self.pin(record, true).await.map(Some),
            Err(CloudInitError::NoDatasource) => {
                info!("No datasource found for capability {:?}", capability);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Make `record` the current instance
    async fn pin(
        &mut self,
        record: InstanceRecord,
        write_cache: bool,
    ) -> Result<Arc<InstanceRecord>, CloudInitError> {
        let is_new = self.state.set_current_instance(&record.instance_id).await?;
        if is_new {
            info!(
                "Instance {} is new, per-instance actions will run",
                record.instance_id
            );
        }
        if write_cache {
            cache::save(&self.ctx.paths, &record).await?;
        }
        Ok(self.ctx.set_instance(record))
    }

    /// Run a module list under the semaphore contract
    async fn run_modules(
        &self,
        entries: &[ModuleEntry],
        instance_id: &str,
        outcome: &mut StageOutcome,
    ) -> Result<(), CloudInitError> {
        let cfg: Value = crate::config::loader::load_module_config(
            &self.ctx.paths,
            &self.ctx.system_cfg,
            instance_id,
        )
        .await?;
        let semaphores = SemaphoreStore::for_instance(&self.ctx.paths, instance_id);

        for entry in entries {
            let Some(module) = self.modules.get(&entry.name) else {
                warn!("Unknown module {}, skipping", entry.name);
                continue;
            };
            let frequency = entry.frequency.unwrap_or_else(|| module.frequency());

            let result = semaphores
                .and_run(&entry.name, frequency, false, || {
                    module.handle(&entry.name, &cfg, &self.ctx, &entry.args)
                })
                .await?;

            match result {
                RunOutcome::Ran => info!("Module {} ran ({})", entry.name, frequency),
                RunOutcome::Skipped => debug!("Module {} skipped ({})", entry.name, frequency),
                RunOutcome::Failed(e) => {
                    error!("Module {} failed: {}", entry.name, e);
                    outcome.fail(format!("{}: {}", entry.name, e));
                }
            }
        }
        Ok(())
    }
}
