//! EC2 (AWS) datasource
//!
//! Fetches metadata from the EC2 Instance Metadata Service (IMDS).
//! Supports both IMDSv1 and IMDSv2 (preferred for security).

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use super::{Datasource, DatasourceKind, ProbeData};
use crate::config::Ec2Config;
use crate::url_helper::{self, WaitPolicy};
use crate::{BootContext, CloudInitError};

/// IMDSv2 token TTL in seconds
const TOKEN_TTL_SECONDS: u32 = 300;

/// Path polled to decide whether the metadata service is up
const PROBE_PATH: &str = "/latest/meta-data/instance-id";

const DMI_DIR: &str = "/sys/class/dmi/id";

/// EC2 datasource for AWS and compatible clouds
#[derive(Debug, Clone)]
pub struct Ec2 {
    settings: Ec2Config,
    dmi_dir: PathBuf,
}

impl Ec2 {
    pub fn new(settings: Ec2Config) -> Self {
        Self {
            settings,
            dmi_dir: PathBuf::from(DMI_DIR),
        }
    }

    pub fn from_context(ctx: &BootContext) -> Self {
        Self::new(ctx.config.datasource.ec2.clone())
    }

    /// Read DMI identification from another directory (for testing)
    pub fn with_dmi_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.dmi_dir = dir.as_ref().to_path_buf();
        self
    }

    fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy {
            max_wait: Duration::from_secs(self.settings.max_wait),
            timeout: Duration::from_secs(self.settings.timeout),
            sleep: Duration::from_secs(self.settings.sleep),
        }
    }

    /// Check if we're running on EC2 by looking for DMI data
    async fn check_dmi_data(&self) -> bool {
        for name in ["product_name", "bios_vendor", "sys_vendor", "product_uuid"] {
            if let Ok(content) = tokio::fs::read_to_string(self.dmi_dir.join(name)).await {
                let content = content.trim().to_lowercase();
                if content.contains("amazon") || content.starts_with("ec2") {
                    return true;
                }
            }
        }
        false
    }
}

/// One conversation with a metadata service that answered
struct Imds {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl Imds {
    async fn connect(client: Client, base_url: String) -> Self {
        let token = Self::get_imdsv2_token(&client, &base_url).await;
        if token.is_some() {
            debug!("Using IMDSv2 at {}", base_url);
        } else {
            debug!("IMDSv2 token unavailable, using IMDSv1 at {}", base_url);
        }
        Self {
            client,
            base_url,
            token,
        }
    }

    /// Get IMDSv2 token for authenticated requests
    async fn get_imdsv2_token(client: &Client, base_url: &str) -> Option<String> {
        let url = format!("{base_url}/latest/api/token");
        let response = client
            .put(&url)
            .header(
                "X-aws-ec2-metadata-token-ttl-seconds",
                TOKEN_TTL_SECONDS.to_string(),
            )
            .send()
            .await
            .ok()?;

        if response.status().is_success() {
            response.text().await.ok()
        } else {
            None
        }
    }

    /// GET `path` below the base URL; 404 is `None`
    async fn get(&self, path: &str) -> Result<Option<Vec<u8>>, CloudInitError> {
        let url = format!("{}/latest/{}", self.base_url, path);
        let mut request = self.client.get(&url);
        if let Some(token) = &self.token {
            request = request.header("X-aws-ec2-metadata-token", token);
        }
        let response = request.send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.bytes().await?.to_vec())),
            status => Err(CloudInitError::Datasource(format!(
                "Failed to fetch {path}: {status}"
            ))),
        }
    }

    async fn meta_data(&self, key: &str) -> Result<Option<String>, CloudInitError> {
        Ok(self
            .get(&format!("meta-data/{key}"))
            .await?
            .map(|body| String::from_utf8_lossy(&body).trim().to_string()))
    }
}

#[async_trait]
impl Datasource for Ec2 {
    fn kind(&self) -> DatasourceKind {
        DatasourceKind::Ec2
    }

    async fn probe(&self) -> Result<Option<ProbeData>, CloudInitError> {
        if self.settings.strict_id && !self.check_dmi_data().await {
            debug!("DMI data does not identify EC2");
            return Ok(None);
        }

        let client = url_helper::build_client(Duration::from_secs(self.settings.timeout))?;
        let urls: Vec<String> = self
            .settings
            .metadata_urls
            .iter()
            .map(|base| format!("{}{}", base.trim_end_matches('/'), PROBE_PATH))
            .collect();

        // 401 means the service is up but insists on IMDSv2
        let Some(found) = url_helper::wait_for_url(&client, &urls, self.wait_policy(), |s| {
            s.is_success() || s == StatusCode::UNAUTHORIZED
        })
        .await
        else {
            warn!("EC2 metadata service not reachable");
            return Ok(None);
        };
        let base_url = found.trim_end_matches(PROBE_PATH).to_string();

        let imds = Imds::connect(client, base_url).await;

        let instance_id = imds
            .meta_data("instance-id")
            .await?
            .filter(|id| !id.is_empty())
            .ok_or_else(|| CloudInitError::Datasource("IMDS returned no instance-id".into()))?;

        let mut metadata = Map::new();
        metadata.insert("instance-id".into(), Value::String(instance_id.clone()));
        metadata.insert("cloud-name".into(), Value::String("aws".into()));
        metadata.insert("platform".into(), Value::String("ec2".into()));
        metadata.insert("metadata-url".into(), Value::String(imds.base_url.clone()));

        // Individual items are optional
        for key in ["local-hostname", "instance-type"] {
            match imds.meta_data(key).await {
                Ok(Some(value)) => {
                    metadata.insert(key.to_string(), Value::String(value));
                }
                Ok(None) => {}
                Err(e) => warn!("Skipping {}: {}", key, e),
            }
        }

        if let Ok(Some(az)) = imds.meta_data("placement/availability-zone").await {
            // Region is AZ minus the last character (e.g., us-east-1a -> us-east-1)
            if az.len() > 1 {
                let mut region = az.clone();
                region.pop();
                metadata.insert("region".into(), Value::String(region));
            }
            metadata.insert("availability-zone".into(), Value::String(az));
        }

        // 404 means no user-data configured
        let user_data = imds.get("user-data").await?.unwrap_or_default();

        Ok(Some(ProbeData {
            instance_id,
            metadata,
            user_data,
            vendor_data: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_strict_id_without_dmi_is_not_applicable() {
        let temp = TempDir::new().unwrap();
        let ds = Ec2::new(Ec2Config {
            metadata_urls: vec!["http://127.0.0.1:9".to_string()],
            ..Default::default()
        })
        .with_dmi_dir(temp.path());

        assert!(ds.probe().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dmi_detection() {
        let temp = TempDir::new().unwrap();
        tokio::fs::write(temp.path().join("sys_vendor"), "Amazon EC2\n")
            .await
            .unwrap();

        let ds = Ec2::new(Ec2Config::default()).with_dmi_dir(temp.path());
        assert!(ds.check_dmi_data().await);
    }

    #[test]
    fn test_wait_policy_from_settings() {
        let ds = Ec2::new(Ec2Config {
            max_wait: 7,
            timeout: 3,
            sleep: 2,
            ..Default::default()
        });
        let policy = ds.wait_policy();
        assert_eq!(policy.max_wait, Duration::from_secs(7));
        assert_eq!(policy.timeout, Duration::from_secs(3));
        assert_eq!(policy.sleep, Duration::from_secs(2));
    }
}
