//! Subprocess part handlers
//!
//! A custom handler is an executable whose leading comment block declares
//! what it handles:
//!
//! ```text
//! #!/bin/sh
//! # content-types: text/x-custom, text/x-other
//! # frequency: always
//! # handler-version: 2
//! ```
//!
//! It is invoked once per event as
//! `<handler> <content-type> <filename> [<frequency>]` with the payload on
//! stdin and `INSTANCE_ID` in the environment. The frequency argument is
//! only passed to version 2 handlers. A non-zero exit status is a failure.
//! A script whose first line is not a `#!` interpreter line, such as the
//! sniffed `#part-handler` form, is run through `sh`.

use super::{BEGIN, END, HandlerContext, PartEvent, PartHandler};
use crate::userdata::types;
use crate::{CloudInitError, Frequency};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ExternalHandler {
    path: PathBuf,
    name: String,
    content_types: Vec<String>,
    frequency: Frequency,
    version: u8,
    /// No `#!` line, run through `sh`
    interpreted: bool,
}

impl ExternalHandler {
    /// Read the handler declaration out of `script`
    pub fn parse(path: &Path, script: &[u8]) -> Result<Self, CloudInitError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let mut content_types = Vec::new();
        let mut frequency = Frequency::PerInstance;
        let mut version = 1;

        for line in String::from_utf8_lossy(script).lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let Some(comment) = line.strip_prefix('#') else {
                break;
            };
            let Some((key, value)) = comment.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "content-types" | "content-type" => content_types.extend(
                    value
                        .split([',', ' '])
                        .filter(|t| !t.is_empty())
                        .map(types::normalize_content_type),
                ),
                "frequency" => frequency = value.parse()?,
                "handler-version" => {
                    version = value.parse().map_err(|_| {
                        CloudInitError::handler(&name, format!("bad handler-version {value:?}"))
                    })?;
                    if !(1..=2).contains(&version) {
                        return Err(CloudInitError::handler(
                            &name,
                            format!("unsupported handler-version {version}"),
                        ));
                    }
                }
                _ => {}
            }
        }

        if content_types.is_empty() {
            return Err(CloudInitError::handler(&name, "declares no content-types"));
        }

        Ok(Self {
            path: path.to_path_buf(),
            name,
            content_types,
            frequency,
            version,
            interpreted: !script.starts_with(b"#!"),
        })
    }

    /// Load and parse the handler at `path`
    pub async fn from_file(path: &Path) -> Result<Self, CloudInitError> {
        let bytes = tokio::fs::read(path).await?;
        Self::parse(path, &bytes)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PartHandler for ExternalHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn content_types(&self) -> Vec<String> {
        self.content_types.clone()
    }

    fn frequency(&self) -> Frequency {
        self.frequency
    }

    fn handler_version(&self) -> u8 {
        self.version
    }

    async fn handle_part(
        &mut self,
        ctx: &HandlerContext<'_>,
        event: PartEvent<'_>,
        frequency: Option<Frequency>,
    ) -> Result<(), CloudInitError> {
        let (ctype, filename, payload) = match event {
            PartEvent::Begin => (BEGIN, "", &[][..]),
            PartEvent::End => (END, "", &[][..]),
            PartEvent::Part(part) => (
                part.content_type.as_str(),
                part.filename.as_deref().unwrap_or_default(),
                part.payload.as_slice(),
            ),
        };

        let mut cmd = if self.interpreted {
            let mut sh = Command::new("sh");
            sh.arg(&self.path);
            sh
        } else {
            Command::new(&self.path)
        };
        cmd.arg(ctype).arg(filename);
        if let Some(freq) = frequency {
            cmd.arg(freq.as_str());
        }
        cmd.env("INSTANCE_ID", ctx.instance_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!("Running part handler {} for {}", self.name, ctype);
        let mut child = cmd
            .spawn()
            .map_err(|e| CloudInitError::handler(&self.name, e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            // A handler may exit without reading its input
            if let Err(e) = stdin.write_all(payload).await {
                debug!("Handler {} did not read stdin: {}", self.name, e);
            }
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| CloudInitError::handler(&self.name, e.to_string()))?;

        if !output.stdout.is_empty() {
            debug!(
                "{} stdout: {}",
                self.name,
                String::from_utf8_lossy(&output.stdout)
            );
        }

        if !output.status.success() {
            return Err(CloudInitError::handler(
                &self.name,
                format!(
                    "exited with status {} on {}: {}",
                    output.status.code().unwrap_or(-1),
                    ctype,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(())
    }
}
