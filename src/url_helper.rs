//! URL fetching helpers
//!
//! - `read_url`: one-shot fetch of `http://`, `https://` or `file://` URLs
//! - `wait_for_url`: poll a list of URLs until one answers or time runs out

use crate::CloudInitError;
use reqwest::{Client, StatusCode};
use std::time::{Duration, Instant};
use tokio::fs;
use tracing::{debug, info, warn};

/// Build an HTTP client with the given per-request timeout
pub fn build_client(timeout: Duration) -> Result<Client, CloudInitError> {
    Ok(Client::builder()
        .timeout(timeout)
        .connect_timeout(timeout.min(Duration::from_secs(2)))
        .build()?)
}

/// Fetch the body of `url`
///
/// Non-success HTTP statuses are errors.
pub async fn read_url(client: &Client, url: &str) -> Result<Vec<u8>, CloudInitError> {
    if let Some(path) = url.strip_prefix("file://") {
        debug!("Reading {}", path);
        return Ok(fs::read(path).await?);
    }

    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(CloudInitError::Network(format!(
            "Unsupported URL scheme: {url}"
        )));
    }

    debug!("Fetching {}", url);
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CloudInitError::Network(format!(
            "GET {url} returned {status}"
        )));
    }
    Ok(response.bytes().await?.to_vec())
}

/// How long and how often to poll in [`wait_for_url`]
#[derive(Debug, Clone, Copy)]
pub struct WaitPolicy {
    /// Overall deadline
    pub max_wait: Duration,
    /// Per-request timeout
    pub timeout: Duration,
    /// Pause between polling rounds
    pub sleep: Duration,
}

/// Poll `urls` in order until one returns a status accepted by `accept`
///
/// Every URL is tried at least once. Returns the first URL that answered,
/// or `None` when `max_wait` elapsed.
pub async fn wait_for_url(
    client: &Client,
    urls: &[String],
    policy: WaitPolicy,
    accept: impl Fn(StatusCode) -> bool,
) -> Option<String> {
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        attempt += 1;
        for url in urls {
            let remaining = policy.max_wait.saturating_sub(start.elapsed());
            let timeout = if attempt == 1 {
                policy.timeout
            } else {
                policy.timeout.min(remaining)
            };
            if timeout.is_zero() {
                break;
            }

            match client.get(url).timeout(timeout).send().await {
                Ok(response) if accept(response.status()) => {
                    info!("Using metadata source: {} (attempt {})", url, attempt);
                    return Some(url.clone());
                }
                Ok(response) => {
                    debug!("{} answered {}", url, response.status());
                }
                Err(e) => {
                    debug!("{} not reachable: {}", url, e);
                }
            }
        }

        if start.elapsed() + policy.sleep >= policy.max_wait {
            warn!(
                "Giving up on {} URL(s) after {:.1}s",
                urls.len(),
                start.elapsed().as_secs_f64()
            );
            return None;
        }
        tokio::time::sleep(policy.sleep).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_file_url() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("payload");
        fs::write(&path, "#cloud-config\n").await.unwrap();

        let client = build_client(Duration::from_secs(1)).unwrap();
        let body = read_url(&client, &format!("file://{}", path.display()))
            .await
            .unwrap();
        assert_eq!(body, b"#cloud-config\n");
    }

    #[tokio::test]
    async fn test_read_unsupported_scheme() {
        let client = build_client(Duration::from_secs(1)).unwrap();
        assert!(read_url(&client, "ftp://example.com/x").await.is_err());
    }

    #[tokio::test]
    async fn test_wait_for_url_gives_up() {
        let client = build_client(Duration::from_millis(200)).unwrap();
        let policy = WaitPolicy {
            max_wait: Duration::from_millis(300),
            timeout: Duration::from_millis(100),
            sleep: Duration::from_millis(50),
        };
        // Port 9 (discard) on localhost is normally closed
        let found = wait_for_url(
            &client,
            &["http://127.0.0.1:9/".to_string()],
            policy,
            |s| s.is_success(),
        )
        .await;
        assert!(found.is_none());
    }
}
