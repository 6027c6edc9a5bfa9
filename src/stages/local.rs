//! Local stage - runs before network is available
//!
//! Responsibilities:
//! - Drop the previous boot's datasource cache (unless `manual_cache_clean`)
//! - Find a datasource that needs nothing but local filesystems
//! - Pin the instance and cache the datasource for later stages

use super::{Orchestrator, StageOutcome};
use crate::CloudInitError;
use crate::datasources::Capability;
use tracing::info;

/// Run the local stage
pub(super) async fn run(orch: &mut Orchestrator) -> Result<StageOutcome, CloudInitError> {
    info!("Local stage: starting pre-network initialization");

    if orch.ctx.config.manual_cache_clean {
        info!("manual_cache_clean set, keeping the datasource cache");
    } else {
        orch.state.purge_cache().await?;
    }

    match orch.ensure_instance(Capability::FILESYSTEM).await? {
        Some(record) => info!(
            "Local stage: found {} datasource, instance {}",
            record.datasource, record.instance_id
        ),
        None => info!("Local stage: no local datasource, leaving it to the network stage"),
    }

    info!("Local stage: completed");
    Ok(StageOutcome::default())
}
