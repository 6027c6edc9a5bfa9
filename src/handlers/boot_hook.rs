//! `text/cloud-boothook` parts
//!
//! Boothooks run as soon as they are seen, on every walk. A hook without an
//! interpreter line is run by `sh`.

use super::{HandlerContext, PartEvent, PartHandler, safe_filename, set_mode};
use crate::userdata::types::CLOUD_BOOTHOOK;
use crate::{CloudInitError, Frequency};
use async_trait::async_trait;
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, info};

pub struct BootHookHandler;

#[async_trait]
impl PartHandler for BootHookHandler {
    fn name(&self) -> &str {
        "cloud-boothook"
    }

    fn content_types(&self) -> Vec<String> {
        vec![CLOUD_BOOTHOOK.to_string()]
    }

    fn frequency(&self) -> Frequency {
        Frequency::Always
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

        let dir = ctx.paths.boothooks_dir(ctx.instance_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(safe_filename(part.filename.as_deref(), "boothook"));
        fs::write(&path, &part.payload).await?;
        set_mode(&path, 0o700).await?;

        info!("Running boothook {}", path.display());
        let mut cmd = if part.payload.starts_with(b"#!") {
            Command::new(&path)
        } else {
            let mut sh = Command::new("sh");
            sh.arg(&path);
            sh
        };
        let output = cmd
            .env("INSTANCE_ID", ctx.instance_id)
            .output()
            .await
            .map_err(|e| CloudInitError::handler(self.name(), e.to_string()))?;

        if !output.stdout.is_empty() {
            debug!("boothook stdout: {}", String::from_utf8_lossy(&output.stdout));
        }
        if !output.status.success() {
            return Err(CloudInitError::handler(
                self.name(),
                format!(
                    "{} exited with status {}: {}",
                    path.display(),
                    output.status.code().unwrap_or(-1),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::Part;
    use crate::config::SystemConfig;
    use crate::state::CloudPaths;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_boothook_runs_with_instance_id() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let config = SystemConfig::default();
        let ctx = HandlerContext {
            instance_id: "i-hook",
            paths: &paths,
            config: &config,
        };

        let marker = temp.path().join("ran");
        let part = Part::new(
            CLOUD_BOOTHOOK,
            format!("echo \"$INSTANCE_ID\" > {}\n", marker.display()),
        )
        .with_filename("part-001");

        BootHookHandler
            .handle_part(&ctx, PartEvent::Part(&part), None)
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(&marker).unwrap().trim(), "i-hook");
        assert!(temp.path().join("instances/i-hook/boothooks/part-001").exists());
    }

    #[tokio::test]
    async fn test_failing_boothook() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let config = SystemConfig::default();
        let ctx = HandlerContext {
            instance_id: "i-hook",
            paths: &paths,
            config: &config,
        };
        let part = Part::new(CLOUD_BOOTHOOK, "exit 7\n");
        let err = BootHookHandler
            .handle_part(&ctx, PartEvent::Part(&part), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("status 7"));
    }
}
