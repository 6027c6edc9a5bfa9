//! User-data processing
//!
//! Turns raw user-data into an ordered list of typed [`Part`]s:
//! - Gzip compressed payloads
//! - MIME messages (multipart or single part)
//! - Header-less payloads typed by their magic first line
//! - `#include` / `#include-once` URL lists, fetched and spliced in
//! - `#cloud-config-archive` YAML lists

pub mod archive;
pub mod include;
pub mod mime;
pub mod types;

pub use include::{HttpFetcher, UrlFetcher};
pub use mime::MimePart;

use crate::CloudInitError;
use flate2::read::GzDecoder;
use include::{MAX_INCLUDE_DEPTH, UrlCache};
use std::collections::BTreeMap;
use std::future::Future;
use std::io::Read;
use std::path::Path;
use std::pin::Pin;
use tracing::{debug, info, warn};
use types::{CLOUD_CONFIG_ARCHIVE, INCLUDE_ONCE_URL, INCLUDE_URL};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Upper bound on decompressed user-data
const MAX_USERDATA_SIZE: u64 = 16 * 1024 * 1024;

/// One typed piece of user-data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    /// Normalized MIME type, e.g. `text/cloud-config`
    pub content_type: String,
    pub filename: Option<String>,
    /// Raw bytes, never re-encoded
    pub payload: Vec<u8>,
    /// Extra headers, lowercase names
    pub headers: BTreeMap<String, String>,
}

impl Part {
    pub fn new(content_type: &str, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            content_type: content_type.to_string(),
            filename: None,
            payload: payload.into(),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    fn from_mime(part: MimePart) -> Self {
        let declared = types::normalize_content_type(&part.content_type);
        let (content_type, payload) = if types::needs_sniffing(&declared) {
            let (ctype, payload) = types::classify(&part.content);
            (ctype.to_string(), payload)
        } else {
            (declared, part.content)
        };
        Self {
            content_type,
            filename: part.filename,
            payload,
            headers: part.headers,
        }
    }

    fn to_mime(&self) -> MimePart {
        MimePart {
            content_type: self.content_type.clone(),
            filename: self.filename.clone(),
            content: self.payload.clone(),
            headers: self.headers.clone(),
        }
    }
}

/// Normalized user-data: the leaf parts in order
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserDataMessage {
    parts: Vec<Part>,
}

impl UserDataMessage {
    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Number of parts attached so far
    pub fn attachment_count(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Append a part, normalizing its type and naming it if unnamed
    pub fn attach(&mut self, mut part: Part) {
        part.content_type = types::normalize_content_type(&part.content_type);
        let counter = self.parts.len() + 1;
        if part.filename.as_deref().is_none_or(str::is_empty) {
            part.filename = Some(format!("part-{counter:03}"));
        }
        debug!(
            "Attached {} as {}",
            part.content_type,
            part.filename.as_deref().unwrap_or_default()
        );
        self.parts.push(part);
    }

    /// Serialize as one multipart MIME document
    pub fn to_mime(&self) -> Vec<u8> {
        let parts: Vec<MimePart> = self.parts.iter().map(Part::to_mime).collect();
        let boundary = mime::choose_boundary(&parts);
        mime::create_multipart(&parts, &boundary)
    }
}

/// Normalizes raw user-data, resolving includes through a [`UrlFetcher`]
pub struct UserDataProcessor<'a> {
    fetcher: &'a dyn UrlFetcher,
    url_cache: Option<UrlCache>,
}

impl<'a> UserDataProcessor<'a> {
    pub fn new(fetcher: &'a dyn UrlFetcher) -> Self {
        Self {
            fetcher,
            url_cache: None,
        }
    }

    /// Keep `#include-once` content in `dir`
    pub fn with_url_cache(mut self, dir: impl AsRef<Path>) -> Self {
        self.url_cache = Some(UrlCache::new(dir));
        self
    }

    /// Normalize `raw` into parts
    pub async fn process(&self, raw: &[u8]) -> Result<UserDataMessage, CloudInitError> {
        let mut message = UserDataMessage::default();
        let mut stack = Vec::new();
        self.walk(raw.to_vec(), &mut stack, &mut message).await?;
        info!("Normalized user-data into {} part(s)", message.attachment_count());
        Ok(message)
    }

    fn walk<'s>(
        &'s self,
        raw: Vec<u8>,
        stack: &'s mut Vec<String>,
        out: &'s mut UserDataMessage,
    ) -> BoxFuture<'s, Result<(), CloudInitError>> {
        Box::pin(async move {
            let data = decompress_if_needed(&raw, MAX_USERDATA_SIZE)?;

            let leaves: Vec<Part> = if mime::is_mime(&data) {
                mime::parse_message(&data)?
                    .into_iter()
                    .map(Part::from_mime)
                    .collect()
            } else if data.trim_ascii().is_empty() {
                Vec::new()
            } else {
                let (ctype, payload) = types::classify(&data);
                vec![Part::new(ctype, payload)]
            };

            for part in leaves {
                match part.content_type.as_str() {
                    INCLUDE_URL => self.expand_includes(&part.payload, false, stack, out).await?,
                    INCLUDE_ONCE_URL => {
                        self.expand_includes(&part.payload, true, stack, out).await?
                    }
                    CLOUD_CONFIG_ARCHIVE => {
                        for exploded in archive::explode(&part.payload) {
                            out.attach(exploded);
                        }
                    }
                    _ => out.attach(part),
                }
            }
            Ok(())
        })
    }

    async fn expand_includes(
        &self,
        payload: &[u8],
        once: bool,
        stack: &mut Vec<String>,
        out: &mut UserDataMessage,
    ) -> Result<(), CloudInitError> {
        let list = std::str::from_utf8(payload).map_err(|e| {
            CloudInitError::InvalidData(format!("Include list is not valid UTF-8: {}", e))
        })?;
        for target in include::parse_include_list(list, once) {
            let content = match self.fetch_include(&target.url, target.once, stack).await {
                Ok(content) => content,
                Err(e) if target.optional => {
                    warn!("Skipping optional include {}: {}", target.url, e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            stack.push(target.url.clone());
            let result = self.walk(content, stack, out).await;
            stack.pop();
            result?;
        }
        Ok(())
    }

    async fn fetch_include(
        &self,
        url: &str,
        once: bool,
        stack: &[String],
    ) -> Result<Vec<u8>, CloudInitError> {
        if stack.len() >= MAX_INCLUDE_DEPTH {
            return Err(CloudInitError::include(
                url,
                format!("include depth limit of {MAX_INCLUDE_DEPTH} exceeded"),
            ));
        }
        if stack.iter().any(|seen| seen == url) {
            return Err(CloudInitError::include(url, "recursive include"));
        }

        let cache = if once { self.url_cache.as_ref() } else { None };
        if let Some(cache) = cache {
            if let Some(content) = cache.get(url).await? {
                return Ok(content);
            }
        }

        debug!("Including {}", url);
        let content = self
            .fetcher
            .fetch(url)
            .await
            .map_err(|e| CloudInitError::include(url, e.to_string()))?;

        if let Some(cache) = cache {
            cache.put(url, &content).await?;
        }
        Ok(content)
    }
}

/// Decompress gzip data if needed, refusing output beyond `limit` bytes
fn decompress_if_needed(data: &[u8], limit: u64) -> Result<Vec<u8>, CloudInitError> {
    // Check for gzip magic bytes
    if data.starts_with(&[0x1f, 0x8b]) {
        debug!("Decompressing gzip user-data");
        let mut decoder = GzDecoder::new(data).take(limit + 1);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).map_err(|e| {
            CloudInitError::InvalidData(format!("Gzip decompression failed: {}", e))
        })?;
        if decompressed.len() as u64 > limit {
            return Err(CloudInitError::InvalidData(format!(
                "Decompressed user-data exceeds {} bytes",
                limit
            )));
        }
        Ok(decompressed)
    } else {
        Ok(data.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::collections::HashMap;
    use std::io::Write;
    use std::sync::Mutex;
    use tempfile::TempDir;
    use types::{CLOUD_CONFIG, NOT_MULTIPART, SHELLSCRIPT};

    /// Serves canned content and records what was requested
    #[derive(Default)]
    struct FakeFetcher {
        pages: HashMap<String, Vec<u8>>,
        requests: Mutex<Vec<String>>,
    }

    impl FakeFetcher {
        fn with(mut self, url: &str, body: &str) -> Self {
            self.pages.insert(url.to_string(), body.as_bytes().to_vec());
            self
        }

        fn requests(&self) -> Vec<String> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl UrlFetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<Vec<u8>, CloudInitError> {
            self.requests.lock().unwrap().push(url.to_string());
            self.pages
                .get(url)
                .cloned()
                .ok_or_else(|| CloudInitError::Network(format!("404 for {url}")))
        }
    }

    async fn normalize(raw: &[u8]) -> UserDataMessage {
        let fetcher = FakeFetcher::default();
        UserDataProcessor::new(&fetcher).process(raw).await.unwrap()
    }

    #[tokio::test]
    async fn test_cloud_config_marker_stripped() {
        let message = normalize(b"#cloud-config\nkey: val\n").await;
        assert_eq!(message.attachment_count(), 1);
        let part = &message.parts()[0];
        assert_eq!(part.content_type, CLOUD_CONFIG);
        assert_eq!(part.payload, b"key: val\n");
        assert_eq!(part.filename.as_deref(), Some("part-001"));
    }

    #[tokio::test]
    async fn test_script_kept_verbatim() {
        let script = b"#!/bin/sh\necho hi\n";
        let message = normalize(script).await;
        assert_eq!(message.parts()[0].content_type, SHELLSCRIPT);
        assert_eq!(message.parts()[0].payload, script);
    }

    #[tokio::test]
    async fn test_non_utf8_script_bytes_preserved() {
        let script = b"#!/bin/sh\necho \xe9t\xe9\n";
        let message = normalize(script).await;
        assert_eq!(message.parts()[0].content_type, SHELLSCRIPT);
        assert_eq!(message.parts()[0].payload, script);
    }

    #[tokio::test]
    async fn test_non_utf8_survives_renormalizing() {
        let raw = b"MIME-Version: 1.0\nContent-Type: multipart/mixed; boundary=b\n\n\
--b\nContent-Type: text/x-shellscript\nContent-Transfer-Encoding: base64\n\nIyEvYmluL3NoCuk=\n\
--b--\n";
        let first = normalize(raw).await;
        assert_eq!(first.parts()[0].payload, b"#!/bin/sh\n\xe9");

        let second = normalize(&first.to_mime()).await;
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn test_non_utf8_include_list_rejected() {
        let fetcher = FakeFetcher::default();
        let result = UserDataProcessor::new(&fetcher)
            .process(b"#include\nhttp://h/\xff\n")
            .await;
        assert!(matches!(result, Err(CloudInitError::InvalidData(_))));
        assert!(fetcher.requests().is_empty());
    }

    #[tokio::test]
    async fn test_unrecognized_payload() {
        let message = normalize(b"just some text").await;
        assert_eq!(message.parts()[0].content_type, NOT_MULTIPART);
    }

    #[tokio::test]
    async fn test_empty_user_data_has_no_parts() {
        assert!(normalize(b"").await.is_empty());
        assert!(normalize(b"  \n").await.is_empty());
    }

    #[tokio::test]
    async fn test_gzip_user_data() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"#cloud-config\nhostname: gz\n").unwrap();
        let compressed = encoder.finish().unwrap();

        let message = normalize(&compressed).await;
        assert_eq!(message.parts()[0].content_type, CLOUD_CONFIG);
        assert_eq!(message.parts()[0].payload, b"hostname: gz\n");
    }

    #[test]
    fn test_gzip_output_is_capped() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&[b'a'; 4096]).unwrap();
        let compressed = encoder.finish().unwrap();

        assert_eq!(decompress_if_needed(&compressed, 4096).unwrap().len(), 4096);
        match decompress_if_needed(&compressed, 1024) {
            Err(CloudInitError::InvalidData(message)) => assert!(message.contains("1024")),
            other => panic!("expected invalid data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_mime_text_plain_is_resniffed() {
        let raw = b"MIME-Version: 1.0\nContent-Type: multipart/mixed; boundary=b\n\n\
--b\nContent-Type: text/plain\n\n#!/bin/sh\necho a\n\
--b\nContent-Type: Text/Cloud-Config; charset=utf-8\nContent-Disposition: attachment; filename=\"cfg\"\n\nx: 1\n\
--b--\n";
        let message = normalize(raw).await;
        let parts = message.parts();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].content_type, SHELLSCRIPT);
        assert_eq!(parts[0].filename.as_deref(), Some("part-001"));
        assert_eq!(parts[1].content_type, CLOUD_CONFIG);
        assert_eq!(parts[1].filename.as_deref(), Some("cfg"));
    }

    #[tokio::test]
    async fn test_archive_counts_parts() {
        let raw = b"#cloud-config-archive\n- content: 'a: 1'\n- type: text/x-shellscript\n  content: '#!/bin/sh'\n- 'b: 2'\n";
        let message = normalize(raw).await;
        assert_eq!(message.attachment_count(), 3);
        let names: Vec<_> = message
            .parts()
            .iter()
            .map(|p| p.filename.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["part-001", "part-002", "part-003"]);
    }

    #[tokio::test]
    async fn test_include_splices_in_order() {
        let fetcher = FakeFetcher::default()
            .with("http://h/a", "#cloud-config\na: 1\n")
            .with("http://h/b", "#!/bin/sh\necho b\n");
        let message = UserDataProcessor::new(&fetcher)
            .process(b"#include\nhttp://h/a\nhttp://h/b\n")
            .await
            .unwrap();

        let types: Vec<_> = message.parts().iter().map(|p| p.content_type.as_str()).collect();
        assert_eq!(types, vec![CLOUD_CONFIG, SHELLSCRIPT]);
        assert_eq!(fetcher.requests(), vec!["http://h/a", "http://h/b"]);
    }

    #[tokio::test]
    async fn test_include_failure_propagates() {
        let fetcher = FakeFetcher::default();
        let result = UserDataProcessor::new(&fetcher)
            .process(b"#include http://h/missing\n")
            .await;
        assert!(matches!(result, Err(CloudInitError::Include { .. })));
    }

    #[tokio::test]
    async fn test_optional_include_is_empty() {
        let fetcher = FakeFetcher::default().with("http://h/ok", "#!/bin/sh\n");
        let message = UserDataProcessor::new(&fetcher)
            .process(b"#include\n?http://h/missing\nhttp://h/ok\n")
            .await
            .unwrap();
        assert_eq!(message.attachment_count(), 1);
        assert_eq!(message.parts()[0].content_type, SHELLSCRIPT);
    }

    #[tokio::test]
    async fn test_include_once_uses_cache() {
        let temp = TempDir::new().unwrap();
        let fetcher = FakeFetcher::default().with("http://h/once", "#cloud-config\nonce: true\n");
        let processor = UserDataProcessor::new(&fetcher).with_url_cache(temp.path());

        let first = processor.process(b"#include-once\nhttp://h/once\n").await.unwrap();
        let second = processor.process(b"#include-once\nhttp://h/once\n").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(fetcher.requests().len(), 1);
    }

    #[tokio::test]
    async fn test_plain_include_not_cached() {
        let temp = TempDir::new().unwrap();
        let fetcher = FakeFetcher::default().with("http://h/x", "#!/bin/sh\n");
        let processor = UserDataProcessor::new(&fetcher).with_url_cache(temp.path());

        processor.process(b"#include http://h/x\n").await.unwrap();
        processor.process(b"#include http://h/x\n").await.unwrap();
        assert_eq!(fetcher.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_recursive_include_rejected() {
        let fetcher = FakeFetcher::default().with("http://h/self", "#include http://h/self\n");
        let result = UserDataProcessor::new(&fetcher)
            .process(b"#include http://h/self\n")
            .await;
        match result {
            Err(CloudInitError::Include { url, message }) => {
                assert_eq!(url, "http://h/self");
                assert!(message.contains("recursive"));
            }
            other => panic!("expected include error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_include_depth_limit() {
        let mut fetcher = FakeFetcher::default();
        for i in 0..12 {
            fetcher = fetcher.with(
                &format!("http://h/{i}"),
                &format!("#include http://h/{}\n", i + 1),
            );
        }
        let result = UserDataProcessor::new(&fetcher)
            .process(b"#include http://h/0\n")
            .await;
        match result {
            Err(CloudInitError::Include { message, .. }) => assert!(message.contains("depth")),
            other => panic!("expected include error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_renormalizing_mime_is_stable() {
        let raw = b"MIME-Version: 1.0\nContent-Type: multipart/mixed; boundary=b\n\n\
--b\nContent-Type: text/plain\n\n#cloud-config\nhostname: one\n\
--b\nContent-Type: text/x-shellscript\nMerge-Type: replace\n\n#!/bin/sh\r\necho two\r\n\
--b\nContent-Type: text/plain\n\nnothing to see\n\
--b--\n";
        let first = normalize(raw).await;
        let second = normalize(&first.to_mime()).await;
        assert_eq!(first, second);
        assert_eq!(first.attachment_count(), 3);
    }
}
