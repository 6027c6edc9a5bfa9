//! Final stage - runs user scripts and final tasks
//!
//! Responsibilities:
//! - Run `cloud_final_modules` (deferred files, script directories, user
//!   scripts, final message)
//! - Mark boot as finished
//! - Write result.json

use super::{Orchestrator, StageOutcome};
use crate::CloudInitError;
use crate::datasources::Capability;
use tracing::info;

/// Run the final stage
pub(super) async fn run(orch: &mut Orchestrator) -> Result<StageOutcome, CloudInitError> {
    info!("Final stage: executing user scripts");
    let mut outcome = StageOutcome::default();

    let Some(record) = orch
        .ensure_instance(Capability::FILESYSTEM | Capability::NETWORK)
        .await?
    else {
        info!("Final stage: no datasource, nothing to finish");
        return Ok(outcome);
    };

    orch.run_modules(
        &orch.ctx.config.cloud_final_modules,
        &record.instance_id,
        &mut outcome,
    )
    .await?;

    orch.state.mark_boot_finished().await?;
    orch.state
        .write_result(Some(record.datasource.as_str()), &outcome.errors)
        .await?;

    info!("Final stage: completed ({} failures)", outcome.failures);
    Ok(outcome)
}
