//! Write files module
//!
//! `write_files` writes every entry without `defer: true` early in boot;
//! `write_files_deferred` writes the deferred ones in the final stage, after
//! users and packages exist.

use super::{Module, section};
use crate::{BootContext, CloudInitError};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use flate2::read::GzDecoder;
use serde::Deserialize;
use serde_yaml::Value;
use std::io::Read;
use std::path::Path;
use tokio::fs;
use tracing::{debug, info};

/// One `write_files` entry
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct WriteFileConfig {
    pub path: String,
    pub content: String,
    pub encoding: Option<String>,
    pub owner: Option<String>,
    pub permissions: Option<String>,
    pub append: bool,
    pub defer: bool,
}

pub struct WriteFiles;

pub struct WriteFilesDeferred;

#[async_trait]
impl Module for WriteFiles {
    fn name(&self) -> &'static str {
        "write_files"
    }

    async fn handle(
        &self,
        name: &str,
        cfg: &Value,
        _cloud: &BootContext,
        _args: &[String],
    ) -> Result<(), CloudInitError> {
        let files: Vec<WriteFileConfig> = section(cfg, name, "write_files")?;
        for file in files.iter().filter(|f| !f.defer) {
            write_file(name, file).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Module for WriteFilesDeferred {
    fn name(&self) -> &'static str {
        "write_files_deferred"
    }

    async fn handle(
        &self,
        name: &str,
        cfg: &Value,
        _cloud: &BootContext,
        _args: &[String],
    ) -> Result<(), CloudInitError> {
        let files: Vec<WriteFileConfig> = section(cfg, name, "write_files")?;
        for file in files.iter().filter(|f| f.defer) {
            write_file(name, file).await?;
        }
        Ok(())
    }
}

async fn write_file(module: &str, config: &WriteFileConfig) -> Result<(), CloudInitError> {
    if config.path.is_empty() {
        return Err(CloudInitError::module(module, "write_files entry without a path"));
    }
    info!("Writing file: {}", config.path);

    let path = Path::new(&config.path);

    // Create parent directories if needed
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let content = decode_content(&config.content, config.encoding.as_deref())?;

    if config.append {
        let mut existing = match fs::read(path).await {
            Ok(existing) => existing,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        existing.extend_from_slice(&content);
        fs::write(path, existing).await?;
    } else {
        fs::write(path, &content).await?;
    }

    // Set permissions (default to 0644 if not specified)
    let perms = config.permissions.as_deref().unwrap_or("0644");
    set_permissions(path, perms).await?;

    if let Some(owner) = &config.owner {
        set_ownership(path, owner).await?;
    }

    Ok(())
}

/// Decode content based on encoding type
fn decode_content(content: &str, encoding: Option<&str>) -> Result<Vec<u8>, CloudInitError> {
    let encoding = encoding.map(|e| e.trim().to_ascii_lowercase());
    match encoding.as_deref() {
        None | Some("text/plain") => Ok(content.as_bytes().to_vec()),
        Some("base64" | "b64") => decode_base64(content),
        Some("gz+base64" | "gzip+base64" | "gz+b64" | "b64+gzip" | "base64+gzip") => {
            // Base64-encoded gzip data (most common)
            decompress_gzip(&decode_base64(content)?)
        }
        Some("gzip" | "gz") => decompress_gzip(content.as_bytes()),
        Some(other) => Err(CloudInitError::InvalidData(format!(
            "Unknown encoding: {}",
            other
        ))),
    }
}

fn decode_base64(content: &str) -> Result<Vec<u8>, CloudInitError> {
    let clean: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64
        .decode(clean)
        .map_err(|e| CloudInitError::InvalidData(format!("Invalid base64: {}", e)))
}

fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>, CloudInitError> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| CloudInitError::InvalidData(format!("Failed to decompress gzip: {}", e)))?;
    Ok(decompressed)
}

async fn set_permissions(path: &Path, perms: &str) -> Result<(), CloudInitError> {
    debug!("Setting permissions {} on {:?}", perms, path);

    // Parse octal permission string (e.g., "0644")
    let mode = u32::from_str_radix(perms.trim().trim_start_matches("0o"), 8)
        .map_err(|e| CloudInitError::InvalidData(format!("Invalid permissions {perms:?}: {e}")))?;

    crate::handlers::set_mode(path, mode).await
}

async fn set_ownership(path: &Path, owner: &str) -> Result<(), CloudInitError> {
    debug!("Setting ownership {} on {:?}", owner, path);

    let output = tokio::process::Command::new("chown")
        .arg(owner)
        .arg(path)
        .output()
        .await
        .map_err(|e| CloudInitError::Command(e.to_string()))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(CloudInitError::Command(format!(
            "Failed to set ownership: {}",
            stderr
        )));
    }

    Ok(())
}
