//! Runcmd module - execute commands from cloud-config

use super::{Module, section};
use crate::config::RunCmd;
use crate::{BootContext, CloudInitError};
use async_trait::async_trait;
use serde_yaml::Value;
use tokio::process::Command;
use tracing::{debug, info, warn};

pub struct RunCmdModule;

#[async_trait]
impl Module for RunCmdModule {
    fn name(&self) -> &'static str {
        "runcmd"
    }

    async fn handle(
        &self,
        name: &str,
        cfg: &Value,
        cloud: &BootContext,
        _args: &[String],
    ) -> Result<(), CloudInitError> {
        let commands: Vec<RunCmd> = section(cfg, name, "runcmd")?;
        if commands.is_empty() {
            debug!("Skipping module {}: no 'runcmd' key", name);
            return Ok(());
        }
        info!("Executing {} runcmd commands", commands.len());
        run_commands(name, &commands, cloud.instance_id()).await
    }
}

/// Run every command, then fail if any of them failed
///
/// `INSTANCE_ID` is exported when an instance is known.
pub(crate) async fn run_commands(
    module: &str,
    commands: &[RunCmd],
    instance_id: Option<&str>,
) -> Result<(), CloudInitError> {
    let mut failed = Vec::new();

    for (i, cmd) in commands.iter().enumerate() {
        debug!("Executing {} {}/{}", module, i + 1, commands.len());
        if let Err(e) = execute_command(cmd, instance_id).await {
            warn!("{} command {} failed: {}", module, i + 1, e);
            failed.push(i + 1);
        }
    }

    if failed.is_empty() {
        Ok(())
    } else {
        Err(CloudInitError::module(
            module,
            format!("{} of {} commands failed: {:?}", failed.len(), commands.len(), failed),
        ))
    }
}

async fn execute_command(cmd: &RunCmd, instance_id: Option<&str>) -> Result<(), CloudInitError> {
    let mut command = match cmd {
        RunCmd::Shell(shell_cmd) => {
            debug!("Running shell command: {}", shell_cmd);
            let mut command = Command::new("sh");
            command.args(["-c", shell_cmd]);
            command
        }
        RunCmd::Args(args) => {
            let Some((program, rest)) = args.split_first() else {
                return Ok(());
            };
            debug!("Running command: {:?}", args);
            let mut command = Command::new(program);
            command.args(rest);
            command
        }
    };
    if let Some(id) = instance_id {
        command.env("INSTANCE_ID", id);
    }

    let output = command
        .output()
        .await
        .map_err(|e| CloudInitError::Command(e.to_string()))?;

    // Log stdout for debugging
    if !output.stdout.is_empty() {
        debug!("stdout: {}", String::from_utf8_lossy(&output.stdout));
    }

    if !output.status.success() {
        return Err(CloudInitError::Command(format!(
            "exited with status {}: {}",
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(())
}
