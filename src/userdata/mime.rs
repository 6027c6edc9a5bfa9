//! MIME message parsing for cloud-init user-data
//!
//! Parses MIME messages as used by cloud-init for combining multiple
//! user-data parts (scripts, configs, etc.). Nested multipart containers are
//! flattened into their leaf parts; a single-part MIME message yields one
//! part.

use super::types::TEXT_PLAIN;
use crate::CloudInitError;
use base64::Engine;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::debug;

/// How far into the payload we look for a MIME-Version header
const MIME_SNIFF_LEN: usize = 4096;

/// Nesting limit for multipart containers
const MAX_NESTING: usize = 10;

/// Headers that are represented by dedicated fields
const RESERVED_HEADERS: &[&str] = &[
    "content-type",
    "content-disposition",
    "content-transfer-encoding",
    "mime-version",
    "number-attachments",
];

/// A single leaf part from a MIME message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimePart {
    /// Raw Content-Type header value (`text/plain` when absent)
    pub content_type: String,
    /// Optional filename from Content-Disposition
    pub filename: Option<String>,
    /// Decoded content of this part
    pub content: Vec<u8>,
    /// Additional headers, lowercase names
    pub headers: BTreeMap<String, String>,
}

/// Whether `data` looks like a MIME message
pub fn is_mime(data: &[u8]) -> bool {
    let head = &data[..data.len().min(MIME_SNIFF_LEN)];
    String::from_utf8_lossy(head)
        .to_ascii_lowercase()
        .contains("mime-version:")
}

/// Parse a MIME message into its leaf parts
pub fn parse_message(data: &[u8]) -> Result<Vec<MimePart>, CloudInitError> {
    let mut parts = Vec::new();
    parse_entity(data, 0, &mut parts)?;
    debug!("Parsed {} MIME parts", parts.len());
    Ok(parts)
}

fn parse_entity(data: &[u8], depth: usize, out: &mut Vec<MimePart>) -> Result<(), CloudInitError> {
    if depth > MAX_NESTING {
        return Err(CloudInitError::InvalidData(
            "MIME multipart nesting too deep".to_string(),
        ));
    }

    let (header_block, body) = split_headers(data);
    let mut headers = parse_headers(header_block);

    let content_type = headers
        .get("content-type")
        .cloned()
        .unwrap_or_else(|| TEXT_PLAIN.to_string());

    if content_type.trim_start().to_ascii_lowercase().starts_with("multipart/") {
        let boundary = extract_param(&content_type, "boundary").ok_or_else(|| {
            CloudInitError::InvalidData("Multipart message without boundary".to_string())
        })?;
        debug!("Found MIME boundary: {}", boundary);
        for section in split_multipart(body, &boundary) {
            if section.trim_ascii().is_empty() {
                continue;
            }
            parse_entity(section, depth + 1, out)?;
        }
        return Ok(());
    }

    let content = match headers
        .get("content-transfer-encoding")
        .map(|s| s.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("base64") => decode_base64(body)?,
        Some("quoted-printable") => decode_quoted_printable(body),
        _ => body.to_vec(),
    };

    let filename = headers
        .get("content-disposition")
        .and_then(|cd| extract_param(cd, "filename"));

    headers.retain(|name, _| !RESERVED_HEADERS.contains(&name.as_str()));

    out.push(MimePart {
        content_type,
        filename,
        content,
        headers,
    });
    Ok(())
}

/// Split an entity at the first empty line
///
/// Without an empty line the whole entity is body.
fn split_headers(data: &[u8]) -> (&[u8], &[u8]) {
    let mut offset = 0;
    for line in data.split_inclusive(|&b| b == b'\n') {
        if matches!(line, b"\n" | b"\r\n") {
            return (&data[..offset], &data[offset + line.len()..]);
        }
        offset += line.len();
    }
    (&data[..0], data)
}

/// Parse header lines, joining folded continuations
fn parse_headers(block: &[u8]) -> BTreeMap<String, String> {
    let mut headers = BTreeMap::new();
    let mut current: Option<(String, String)> = None;

    for line in String::from_utf8_lossy(block).lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            // Continuation of previous header
            if let Some((_, value)) = current.as_mut() {
                value.push(' ');
                value.push_str(line.trim());
            }
        } else if let Some((name, value)) = line.split_once(':') {
            if let Some((n, v)) = current.take() {
                headers.insert(n, v);
            }
            current = Some((name.trim().to_ascii_lowercase(), value.trim().to_string()));
        }
    }

    if let Some((n, v)) = current {
        headers.insert(n, v);
    }
    headers
}

/// Sections between `--boundary` delimiter lines
///
/// The line break before a delimiter belongs to the delimiter, so a section
/// is exactly the bytes that were written between two delimiters.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{boundary}").into_bytes();
    let close = format!("--{boundary}--").into_bytes();

    let mut sections = Vec::new();
    let mut start: Option<usize> = None;
    let mut offset = 0;

    for line in body.split_inclusive(|&b| b == b'\n') {
        let trimmed = line.trim_ascii_end();
        if trimmed == delimiter || trimmed == close {
            if let Some(s) = start {
                sections.push(strip_one_newline(&body[s..offset]));
            }
            if trimmed == close {
                return sections;
            }
            start = Some(offset + line.len());
        }
        offset += line.len();
    }

    // Unterminated: keep whatever followed the last delimiter
    if let Some(s) = start {
        sections.push(&body[s..]);
    }
    sections
}

fn strip_one_newline(s: &[u8]) -> &[u8] {
    s.strip_suffix(b"\r\n")
        .or_else(|| s.strip_suffix(b"\n"))
        .unwrap_or(s)
}

/// Extract a `name=value` parameter from a header value
fn extract_param(header: &str, name: &str) -> Option<String> {
    for param in header.split(';').skip(1) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        if key.trim().eq_ignore_ascii_case(name) {
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Decode base64 content
fn decode_base64(data: &[u8]) -> Result<Vec<u8>, CloudInitError> {
    let clean: Vec<u8> = data
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    base64::engine::general_purpose::STANDARD
        .decode(&clean)
        .map_err(|e| CloudInitError::InvalidData(format!("Base64 decode error: {}", e)))
}

/// Decode quoted-printable content
fn decode_quoted_printable(bytes: &[u8]) -> Vec<u8> {
    let mut result = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        if bytes[i] != b'=' {
            result.push(bytes[i]);
            i += 1;
            continue;
        }

        // Soft line break (=\r\n or =\n)
        if bytes[i + 1..].starts_with(b"\r\n") {
            i += 3;
            continue;
        }
        if bytes[i + 1..].starts_with(b"\n") {
            i += 2;
            continue;
        }

        // Hex encoded byte
        let hex = bytes
            .get(i + 1..i + 3)
            .and_then(|h| std::str::from_utf8(h).ok());
        match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
            Some(byte) => {
                result.push(byte);
                i += 3;
            }
            None => {
                // Invalid encoding, pass through
                result.push(b'=');
                i += 1;
            }
        }
    }

    result
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

/// A boundary that occurs in none of the payloads
pub fn choose_boundary(parts: &[MimePart]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(&part.content);
    }
    let digest = hex::encode(hasher.finalize());
    let base = format!("==============={}==", &digest[..16]);

    let mut boundary = base.clone();
    let mut n = 0;
    while parts
        .iter()
        .any(|p| contains(&p.content, boundary.as_bytes()))
    {
        n += 1;
        boundary = format!("{base}{n}");
    }
    boundary
}

/// Create a MIME multipart message from parts
pub fn create_multipart(parts: &[MimePart], boundary: &str) -> Vec<u8> {
    let mut output = Vec::new();

    // MIME headers
    output.extend_from_slice(
        format!("Content-Type: multipart/mixed; boundary=\"{}\"\r\n", boundary).as_bytes(),
    );
    output.extend_from_slice(b"MIME-Version: 1.0\r\n");
    output.extend_from_slice(format!("Number-Attachments: {}\r\n", parts.len()).as_bytes());
    output.extend_from_slice(b"\r\n");

    // Parts
    for part in parts {
        let mut head = format!("--{}\r\n", boundary);
        head.push_str(&format!("Content-Type: {}\r\n", part.content_type));
        head.push_str("MIME-Version: 1.0\r\n");

        if let Some(filename) = &part.filename {
            head.push_str(&format!(
                "Content-Disposition: attachment; filename=\"{}\"\r\n",
                filename
            ));
        }
        for (name, value) in &part.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");

        output.extend_from_slice(head.as_bytes());
        output.extend_from_slice(&part.content);
        output.extend_from_slice(b"\r\n");
    }

    // End boundary
    output.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());

    output
}
