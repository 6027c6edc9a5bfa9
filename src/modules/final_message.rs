//! Final message module - announce that boot configuration finished

use super::{Module, section};
use crate::state::semaphore::unix_timestamp;
use crate::{BootContext, CloudInitError, Frequency};
use async_trait::async_trait;
use serde_yaml::Value;
use tracing::info;

const DEFAULT_MESSAGE: &str =
    "cloud-init-rs v. $VERSION finished at $TIMESTAMP. Datasource $DATASOURCE. Up $UPTIME seconds";

pub struct FinalMessage;

#[async_trait]
impl Module for FinalMessage {
    fn name(&self) -> &'static str {
        "final_message"
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
        let template: Option<String> = section(cfg, name, "final_message")?;
        let template = template.unwrap_or_else(|| DEFAULT_MESSAGE.to_string());

        let uptime = tokio::fs::read_to_string("/proc/uptime")
            .await
            .ok()
            .and_then(|s| s.split_whitespace().next().map(str::to_string))
            .unwrap_or_else(|| "unknown".to_string());
        let datasource = cloud
            .instance()
            .map(|i| i.datasource.to_string())
            .unwrap_or_else(|_| "none".to_string());
        let timestamp = unix_timestamp().to_string();

        let vars = [
            ("INSTANCE_ID", cloud.instance_id().unwrap_or("unknown")),
            ("DATASOURCE", datasource.as_str()),
            ("VERSION", env!("CARGO_PKG_VERSION")),
            ("TIMESTAMP", timestamp.as_str()),
            ("UPTIME", uptime.as_str()),
        ];
        info!("{}", render(&template, &vars));
        Ok(())
    }
}

/// Replace `$NAME` and `${NAME}` with the matching value
fn render(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out
            .replace(&format!("${{{key}}}"), value)
            .replace(&format!("${key}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let vars = [("INSTANCE_ID", "i-9"), ("DATASOURCE", "NoCloud")];
        assert_eq!(
            render("done $INSTANCE_ID via ${DATASOURCE} ($OTHER)", &vars),
            "done i-9 via NoCloud ($OTHER)"
        );
    }

    #[tokio::test]
    async fn test_handle_without_instance() {
        let temp = tempfile::TempDir::new().unwrap();
        let cloud =
            BootContext::from_yaml(crate::state::CloudPaths::with_base(temp.path()), "{}").unwrap();
        let cfg: Value = serde_yaml::from_str("final_message: bye $INSTANCE_ID").unwrap();
        FinalMessage
            .handle("final_message", &cfg, &cloud, &[])
            .await
            .unwrap();
    }
}
