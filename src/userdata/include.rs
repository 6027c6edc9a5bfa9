//! `#include` / `#include-once` support
//!
//! An include part is a newline separated list of URLs. `#include` and
//! `#include-once` lines switch the mode for the URLs that follow and may
//! carry a URL themselves. A URL prefixed with `?` is optional: when it
//! cannot be fetched it contributes nothing instead of failing the whole
//! user-data.

use crate::CloudInitError;
use crate::url_helper;
use async_trait::async_trait;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::debug;

/// How deep includes may nest
pub const MAX_INCLUDE_DEPTH: usize = 10;

/// Source of included content
#[async_trait]
pub trait UrlFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, CloudInitError>;
}

/// Fetches `http://`, `https://` and `file://` URLs
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, CloudInitError> {
        Ok(Self {
            client: url_helper::build_client(timeout)?,
        })
    }
}

#[async_trait]
impl UrlFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, CloudInitError> {
        url_helper::read_url(&self.client, url).await
    }
}

/// One URL out of an include list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludeTarget {
    pub url: String,
    pub once: bool,
    pub optional: bool,
}

/// Read the URLs of an include payload
///
/// `once` is the mode the part started in (its content type).
pub fn parse_include_list(payload: &str, once: bool) -> Vec<IncludeTarget> {
    let mut once = once;
    let mut targets = Vec::new();

    for line in payload.lines() {
        let mut line = line.trim();
        if let Some(rest) = strip_prefix_ignore_case(line, "#include-once") {
            once = true;
            line = rest.trim();
        } else if let Some(rest) = strip_prefix_ignore_case(line, "#include") {
            once = false;
            line = rest.trim();
        }

        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (url, optional) = match line.strip_prefix('?') {
            Some(url) => (url.trim(), true),
            None => (line, false),
        };
        if url.is_empty() {
            continue;
        }

        targets.push(IncludeTarget {
            url: url.to_string(),
            once,
            optional,
        });
    }
    targets
}

fn strip_prefix_ignore_case<'a>(line: &'a str, prefix: &str) -> Option<&'a str> {
    let head = line.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        line.get(prefix.len()..)
    } else {
        None
    }
}

/// File name of a URL in the include-once cache
pub fn cache_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

/// Per-instance cache of `#include-once` content
#[derive(Debug, Clone)]
pub struct UrlCache {
    dir: PathBuf,
}

impl UrlCache {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    fn path(&self, url: &str) -> PathBuf {
        self.dir.join(cache_key(url))
    }

    /// Cached content for `url`, if any
    pub async fn get(&self, url: &str) -> Result<Option<Vec<u8>>, CloudInitError> {
        match fs::read(self.path(url)).await {
            Ok(content) => {
                debug!("Serving {} from the include-once cache", url);
                Ok(Some(content))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remember content for `url`
    pub async fn put(&self, url: &str, content: &[u8]) -> Result<(), CloudInitError> {
        fs::create_dir_all(&self.dir).await?;
        fs::write(self.path(url), content).await?;
        Ok(())
    }
}
