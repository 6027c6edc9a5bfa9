//! Bootcmd module - execute early boot commands
//!
//! These commands run very early in the boot process, on every boot, before
//! most other cloud-init modules. They should be used sparingly and only
//! when necessary for early system configuration.

use super::runcmd::run_commands;
use super::{Module, section};
use crate::config::RunCmd;
use crate::{BootContext, CloudInitError, Frequency};
use async_trait::async_trait;
use serde_yaml::Value;
use tracing::{debug, info};

pub struct BootCmd;

#[async_trait]
impl Module for BootCmd {
    fn name(&self) -> &'static str {
        "bootcmd"
    }

    fn frequency(&self) -> Frequency {
        Frequency::Always
    }

    async fn handle(
        &self,
        name: &str,
        cfg: &Value,
        cloud: &BootContext,
        _args: &[String],
    ) -> Result<(), CloudInitError> {
        let commands: Vec<RunCmd> = section(cfg, name, "bootcmd")?;
        if commands.is_empty() {
            debug!("Skipping module {}: no 'bootcmd' key", name);
            return Ok(());
        }

        info!("Executing {} bootcmd commands", commands.len());
        run_commands(name, &commands, cloud.instance_id()).await
    }
}
