//! `text/cloud-config` parts
//!
//! Fragments are merged in walk order and the result is written once, at
//! `__end__`, to the instance `cloud-config.txt`. Lists append unless a
//! fragment picks another strategy with a `merge_how` key or a
//! `Merge-Type` header.

use super::{HandlerContext, PartEvent, PartHandler};
use crate::config::merge::{ListMergeStrategy, merge_yaml_values};
use crate::userdata::types::CLOUD_CONFIG;
use crate::{CloudInitError, Frequency, Part};
use async_trait::async_trait;
use serde_yaml::Value;
use tokio::fs;
use tracing::{debug, info};

const MERGE_HOW_KEY: &str = "merge_how";
const MERGE_TYPE_HEADER: &str = "merge-type";

#[derive(Debug, Default)]
pub struct CloudConfigHandler {
    merged: Option<Value>,
}

impl CloudConfigHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn merge_part(&mut self, part: &Part) -> Result<(), CloudInitError> {
        let mut fragment: Value = serde_yaml::from_slice(&part.payload)?;
        if fragment.is_null() {
            debug!("Empty cloud-config fragment");
            return Ok(());
        }
        let Some(map) = fragment.as_mapping_mut() else {
            return Err(CloudInitError::InvalidData(format!(
                "cloud-config part {} is not a mapping",
                part.filename.as_deref().unwrap_or("unnamed")
            )));
        };

        let declared = map.remove(MERGE_HOW_KEY);
        let strategy = declared
            .as_ref()
            .and_then(Value::as_str)
            .or_else(|| part.header(MERGE_TYPE_HEADER))
            .map(ListMergeStrategy::from_merge_how)
            .unwrap_or_default();

        self.merged = Some(match self.merged.take() {
            Some(base) => merge_yaml_values(&base, &fragment, strategy),
            None => fragment,
        });
        Ok(())
    }

    async fn flush(&self, ctx: &HandlerContext<'_>) -> Result<(), CloudInitError> {
        let Some(merged) = &self.merged else {
            return Ok(());
        };
        let path = ctx.paths.cloud_config(ctx.instance_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let body = format!("#cloud-config\n{}", serde_yaml::to_string(merged)?);
        fs::write(&path, body).await?;
        info!("Wrote merged cloud-config to {}", path.display());
        Ok(())
    }
}

#[async_trait]
impl PartHandler for CloudConfigHandler {
    fn name(&self) -> &str {
        "cloud-config"
    }

    fn content_types(&self) -> Vec<String> {
        vec![CLOUD_CONFIG.to_string()]
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
        match event {
            PartEvent::Begin => {
                self.merged = None;
                Ok(())
            }
            PartEvent::Part(part) => self.merge_part(part),
            PartEvent::End => self.flush(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SystemConfig;
    use crate::state::CloudPaths;
    use tempfile::TempDir;

    async fn run(parts: &[Part]) -> (TempDir, Option<Value>) {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let config = SystemConfig::default();
        let ctx = HandlerContext {
            instance_id: "i-cc",
            paths: &paths,
            config: &config,
        };

        let mut handler = CloudConfigHandler::new();
        handler.handle_part(&ctx, PartEvent::Begin, None).await.unwrap();
        for part in parts {
            handler
                .handle_part(&ctx, PartEvent::Part(part), None)
                .await
                .unwrap();
        }
        handler.handle_part(&ctx, PartEvent::End, None).await.unwrap();

        let written = std::fs::read_to_string(temp.path().join("instances/i-cc/cloud-config.txt"))
            .ok()
            .map(|body| {
                assert!(body.starts_with("#cloud-config\n"));
                serde_yaml::from_str(&body).unwrap()
            });
        (temp, written)
    }

    #[tokio::test]
    async fn test_fragments_merge_with_append() {
        let parts = vec![
            Part::new(CLOUD_CONFIG, "hostname: a\nruncmd: [one]\n"),
            Part::new(CLOUD_CONFIG, "hostname: b\nruncmd: [two]\n"),
        ];
        let (_temp, merged) = run(&parts).await;
        let merged = merged.unwrap();
        assert_eq!(merged["hostname"].as_str(), Some("b"));
        assert_eq!(merged["runcmd"], serde_yaml::from_str::<Value>("[one, two]").unwrap());
    }

    #[tokio::test]
    async fn test_merge_how_and_header() {
        let mut by_header = Part::new(CLOUD_CONFIG, "runcmd: [three]\n");
        by_header
            .headers
            .insert("merge-type".to_string(), "list(prepend)+dict()".to_string());
        let parts = vec![
            Part::new(CLOUD_CONFIG, "runcmd: [one]\n"),
            Part::new(CLOUD_CONFIG, "merge_how: replace\nruncmd: [two]\n"),
            by_header,
        ];
        let (_temp, merged) = run(&parts).await;
        let merged = merged.unwrap();
        assert_eq!(merged["runcmd"], serde_yaml::from_str::<Value>("[three, two]").unwrap());
        assert!(merged.get("merge_how").is_none());
    }

    #[tokio::test]
    async fn test_nothing_written_without_fragments() {
        let (_temp, merged) = run(&[]).await;
        assert!(merged.is_none());
    }

    #[tokio::test]
    async fn test_non_mapping_is_error() {
        let temp = TempDir::new().unwrap();
        let paths = CloudPaths::with_base(temp.path());
        let config = SystemConfig::default();
        let ctx = HandlerContext {
            instance_id: "i-cc",
            paths: &paths,
            config: &config,
        };
        let part = Part::new(CLOUD_CONFIG, "- just\n- a list\n");
        let mut handler = CloudConfigHandler::new();
        assert!(
            handler
                .handle_part(&ctx, PartEvent::Part(&part), None)
                .await
                .is_err()
        );
    }
}
