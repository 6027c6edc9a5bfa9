//! `text/x-shellscript` parts
//!
//! Scripts are only stored here; the `scripts_user` module runs them later
//! in the final stage.

use super::{HandlerContext, PartEvent, PartHandler, safe_filename, set_mode};
use crate::userdata::types::SHELLSCRIPT;
use crate::{CloudInitError, Frequency};
use async_trait::async_trait;
use tokio::fs;
use tracing::debug;

pub struct ShellScriptHandler;

#[async_trait]
impl PartHandler for ShellScriptHandler {
    fn name(&self) -> &str {
        "shell-script"
    }

    fn content_types(&self) -> Vec<String> {
        vec![SHELLSCRIPT.to_string()]
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

        let dir = ctx.paths.instance_scripts_dir(ctx.instance_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(safe_filename(part.filename.as_deref(), "part-script"));
        fs::write(&path, &part.payload).await?;
        set_mode(&path, 0o700).await?;
        debug!("Stored user script {}", path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Part;
    use crate::config::SystemConfig;
    use crate::state::CloudPaths;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_script_written_executable() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let config = SystemConfig::default();
        let ctx = HandlerContext {
            instance_id: "i-1",
            paths: &paths,
            config: &config,
        };

        let part = Part::new(SHELLSCRIPT, "#!/bin/sh\necho hi\n").with_filename("part-001");
        let mut handler = ShellScriptHandler;
        handler.handle_part(&ctx, PartEvent::Begin, None).await.unwrap();
        handler
            .handle_part(&ctx, PartEvent::Part(&part), None)
            .await
            .unwrap();

        let path = temp.path().join("instances/i-1/scripts/part-001");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "#!/bin/sh\necho hi\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700);
        }
    }
}
