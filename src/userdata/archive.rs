//! `#cloud-config-archive` expansion
//!
//! An archive is a YAML list and every entry becomes one part. Mappings
//! carry their own type and headers; any other entry is cloud-config text:
//!
//! ```yaml
//! #cloud-config-archive
//! - type: text/x-shellscript
//!   filename: setup.sh
//!   content: |
//!     #!/bin/sh
//!     echo hi
//! - content: "#cloud-config\nhostname: web1\n"
//! - "runcmd: [ls]"
//! ```

use super::Part;
use super::types::{self, CLOUD_CONFIG, NOT_MULTIPART};
use serde_yaml::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Entry keys that are not copied into part headers
const SKIP_KEYS: &[&str] = &[
    "content",
    "filename",
    "type",
    "launch-index",
    "content-disposition",
    "content-type",
    "mime-version",
];

/// Explode an archive payload into parts
///
/// A payload that is not a YAML list yields no parts.
pub fn explode(payload: &[u8]) -> Vec<Part> {
    let entries = match serde_yaml::from_slice::<Value>(payload) {
        Ok(Value::Sequence(entries)) => entries,
        Ok(Value::Null) => return Vec::new(),
        Ok(_) => {
            warn!("cloud-config-archive is not a list, ignoring it");
            return Vec::new();
        }
        Err(e) => {
            warn!("Failed to parse cloud-config-archive: {}", e);
            return Vec::new();
        }
    };

    entries
        .iter()
        .map(|entry| match entry {
            Value::Mapping(map) => from_mapping(map),
            other => Part::new(CLOUD_CONFIG, scalar_string(other)),
        })
        .collect()
}

fn from_mapping(map: &serde_yaml::Mapping) -> Part {
    let content = match map.get("content") {
        None | Some(Value::Null) => String::new(),
        Some(value) => scalar_string(value),
    };

    let declared = map
        .get("type")
        .and_then(Value::as_str)
        .map(types::normalize_content_type)
        .filter(|t| !types::needs_sniffing(t));

    let mut part = match declared {
        Some(ctype) => Part::new(&ctype, content),
        None => {
            let (ctype, payload) = types::classify(content.as_bytes());
            let ctype = if ctype == NOT_MULTIPART {
                CLOUD_CONFIG
            } else {
                ctype
            };
            Part::new(ctype, payload)
        }
    };

    part.filename = map
        .get("filename")
        .and_then(Value::as_str)
        .map(str::to_string);

    let mut headers = BTreeMap::new();
    for (key, value) in map {
        let Some(key) = key.as_str() else { continue };
        let key = key.to_ascii_lowercase();
        if SKIP_KEYS.contains(&key.as_str()) {
            continue;
        }
        headers.insert(key, scalar_string(value));
    }
    part.headers = headers;
    part
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other).unwrap_or_default(),
    }
}
