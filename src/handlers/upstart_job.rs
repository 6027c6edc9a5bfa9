//! `text/upstart-job` parts, installed as `<upstart_dir>/<name>.conf`

use super::{HandlerContext, PartEvent, PartHandler, safe_filename};
use crate::userdata::types::UPSTART_JOB;
use crate::{CloudInitError, Frequency};
use async_trait::async_trait;
use tokio::fs;
use tracing::info;

pub struct UpstartJobHandler;

#[async_trait]
impl PartHandler for UpstartJobHandler {
    fn name(&self) -> &str {
        "upstart-job"
    }

    fn content_types(&self) -> Vec<String> {
        vec![UPSTART_JOB.to_string()]
    }

    async fn handle_part(
        &mut self,
        ctx: &HandlerContext<'_>,
        event: PartEvent<'_>,
        _frequency: Option<Frequency>,
    ) -> Result<(), CloudInitError> {
        let PartEvent::Part(part) = event else {
            return Ok(());
        };

        let mut name = safe_filename(part.filename.as_deref(), "upstart-job");
        if !name.ends_with(".conf") {
            name.push_str(".conf");
        }

        let dir = &ctx.config.upstart_dir;
        fs::create_dir_all(dir).await?;
        let path = dir.join(name);
        let mut payload = part.payload.clone();
        if !payload.ends_with(b"\n") {
            payload.push(b'\n');
        }
        fs::write(&path, payload).await?;
        info!("Installed upstart job {}", path.display());
        Ok(())
    }
}
