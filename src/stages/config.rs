//! Config stage - applies user configuration
//!
//! Restores the instance the earlier stages resolved and runs
//! `cloud_config_modules` against the merged configuration.

use super::{Orchestrator, StageOutcome};
use crate::CloudInitError;
use crate::datasources::Capability;
use tracing::info;

/// Run the config stage
pub(super) async fn run(orch: &mut Orchestrator) -> Result<StageOutcome, CloudInitError> {
    info!("Config stage: applying user configuration");
    let mut outcome = StageOutcome::default();

    let Some(record) = orch
        .ensure_instance(Capability::FILESYSTEM | Capability::NETWORK)
        .await?
    else {
        info!("Config stage: no datasource, nothing to configure");
        return Ok(outcome);
    };

    orch.run_modules(
        &orch.ctx.config.cloud_config_modules,
        &record.instance_id,
        &mut outcome,
    )
    .await?;

    info!("Config stage: completed ({} failures)", outcome.failures);
    Ok(outcome)
}
