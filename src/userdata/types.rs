//! User-data content types
//!
//! Content types are plain MIME type strings, because custom part handlers
//! may claim types this crate has never heard of. The well-known ones are
//! constants here, together with the magic-prefix table used to type
//! payloads that arrive without a MIME header.

/// `#include` list of URLs
pub const INCLUDE_URL: &str = "text/x-include-url";
/// `#include-once` list of URLs, fetched once per instance
pub const INCLUDE_ONCE_URL: &str = "text/x-include-once-url";
/// Shell script (any `#!` interpreter)
pub const SHELLSCRIPT: &str = "text/x-shellscript";
/// Cloud-config YAML
pub const CLOUD_CONFIG: &str = "text/cloud-config";
/// YAML list of parts
pub const CLOUD_CONFIG_ARCHIVE: &str = "text/cloud-config-archive";
/// Upstart job definition
pub const UPSTART_JOB: &str = "text/upstart-job";
/// Executable part handler
pub const PART_HANDLER: &str = "text/part-handler";
/// Script run as soon as it is seen
pub const CLOUD_BOOTHOOK: &str = "text/cloud-boothook";
/// Payload nothing recognized
pub const NOT_MULTIPART: &str = "text/x-not-multipart";
/// Default MIME type of a part without Content-Type
pub const TEXT_PLAIN: &str = "text/plain";

/// Magic prefixes, longest first, so `#include-once` beats `#include` and
/// `#cloud-config-archive` beats `#cloud-config`
const STARTS_WITH: &[(&str, &str)] = &[
    ("#cloud-config-archive", CLOUD_CONFIG_ARCHIVE),
    ("#cloud-boothook", CLOUD_BOOTHOOK),
    ("#include-once", INCLUDE_ONCE_URL),
    ("#cloud-config", CLOUD_CONFIG),
    ("#part-handler", PART_HANDLER),
    ("#upstart-job", UPSTART_JOB),
    ("#include", INCLUDE_URL),
    ("#!", SHELLSCRIPT),
];

/// Types whose marker line is only a type tag and is dropped from the payload
const MARKER_ONLY: &[&str] = &[CLOUD_CONFIG, CLOUD_CONFIG_ARCHIVE, CLOUD_BOOTHOOK];

/// Content type by magic prefix, or `default` when nothing matches
///
/// Matching ignores case and leading whitespace.
pub fn type_from_starts_with(data: &[u8], default: &'static str) -> &'static str {
    let head = data.trim_ascii_start();
    for (prefix, ctype) in STARTS_WITH {
        if head
            .get(..prefix.len())
            .is_some_and(|h| h.eq_ignore_ascii_case(prefix.as_bytes()))
        {
            return ctype;
        }
    }
    default
}

/// Type a header-less payload and strip a pure marker line
///
/// Returns the content type and the payload as it should be handed on.
pub fn classify(data: &[u8]) -> (&'static str, Vec<u8>) {
    let ctype = type_from_starts_with(data, NOT_MULTIPART);
    if MARKER_ONLY.contains(&ctype) {
        (ctype, strip_marker_line(data))
    } else {
        (ctype, data.to_vec())
    }
}

/// Drop the first line (the magic marker) of `data`
fn strip_marker_line(data: &[u8]) -> Vec<u8> {
    let head = data.trim_ascii_start();
    match head.iter().position(|&b| b == b'\n') {
        Some(idx) => head[idx + 1..].to_vec(),
        None => Vec::new(),
    }
}

/// MIME types that still need sniffing
pub fn needs_sniffing(ctype: &str) -> bool {
    ctype == TEXT_PLAIN || ctype == NOT_MULTIPART
}

/// Lowercase, drop parameters, and prefix a bare subtype with `text/`
pub fn normalize_content_type(ctype: &str) -> String {
    let base = ctype.split(';').next().unwrap_or_default().trim().to_lowercase();
    if base.is_empty() {
        return NOT_MULTIPART.to_string();
    }
    if base.contains('/') {
        base
    } else {
        format!("text/{base}")
    }
}
