//! Network stage - runs after network is configured
//!
//! Responsibilities:
//! - Resolve the datasource (cache first, then every capable datasource)
//! - Persist the raw user-data, vendor-data and metadata
//! - Normalize user-data and dispatch it to part handlers once per instance
//! - Run `cloud_init_modules`

use super::{Orchestrator, StageOutcome};
use crate::datasources::Capability;
use crate::handlers::{Dispatcher, HandlerContext, HandlerRegistry};
use crate::state::RunOutcome;
use crate::userdata::UserDataProcessor;
use crate::{CloudInitError, Frequency, InstanceRecord};
use tracing::{debug, info, warn};

/// Semaphore guarding user-data consumption
pub const CONSUME_USERDATA: &str = "consume_userdata";

/// Run the network stage
pub(super) async fn run(orch: &mut Orchestrator) -> Result<StageOutcome, CloudInitError> {
    info!("Network stage: fetching metadata and configuring instance");
    let mut outcome = StageOutcome::default();

    let Some(record) = orch
        .ensure_instance(Capability::FILESYSTEM | Capability::NETWORK)
        .await?
    else {
        info!("Network stage: no datasource found, nothing to do");
        return Ok(outcome);
    };

    orch.state.persist_instance(&record).await?;

    let orch = &*orch;
    let semaphores = orch
        .state
        .semaphores()
        .ok_or(CloudInitError::NoInstance)?
        .clone();

    let mut handler_errors = Vec::new();
    let first = semaphores
        .and_run(CONSUME_USERDATA, Frequency::PerInstance, true, || {
            consume_userdata(orch, &record, Frequency::PerInstance, &mut handler_errors)
        })
        .await?;

    let consumed = match first {
        RunOutcome::Ran => Ok(()),
        RunOutcome::Skipped => {
            debug!("User-data already consumed for this instance, re-dispatching");
            consume_userdata(orch, &record, Frequency::Always, &mut handler_errors).await
        }
        RunOutcome::Failed(e) => Err(e),
    };
    if let Err(e) = consumed {
        warn!("Consuming user-data failed: {}", e);
        outcome.fail(format!("{}: {}", CONSUME_USERDATA, e));
    }
    outcome.errors.extend(handler_errors);

    orch.run_modules(
        &orch.ctx.config.cloud_init_modules,
        &record.instance_id,
        &mut outcome,
    )
    .await?;

    info!("Network stage: completed");
    Ok(outcome)
}

/// Normalize the instance's user-data and walk it through the handlers
///
/// Handler failures are collected into `errors`; they never fail the walk.
async fn consume_userdata(
    orch: &Orchestrator,
    record: &InstanceRecord,
    frequency: Frequency,
    errors: &mut Vec<String>,
) -> Result<(), CloudInitError> {
    let paths = &orch.ctx.paths;
    let processor = UserDataProcessor::new(orch.fetcher.as_ref())
        .with_url_cache(paths.url_cache_dir(&record.instance_id));
    let message = record.normalized_userdata(&processor).await?;
    orch.state.save_normalized_userdata(&message.to_mime()).await?;

    let mut registry = HandlerRegistry::builtin();
    registry.discover(&orch.ctx.config.handler_dirs).await?;

    let ctx = HandlerContext {
        instance_id: &record.instance_id,
        paths,
        config: &orch.ctx.config,
    };
    errors.extend(
        Dispatcher::new(ctx, registry)
            .walk(message.parts(), frequency)
            .await,
    );
    Ok(())
}
