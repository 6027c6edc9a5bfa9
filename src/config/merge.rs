//! Configuration merging
//!
//! Merges YAML documents with explicit precedence, later documents winning:
//! 1. /etc/cloud/cloud.cfg (base)
//! 2. /etc/cloud/cloud.cfg.d/*.cfg (sorted alphabetically)
//! 3. Instance cloud-config.txt (merged user-data fragments)
//!
//! Mappings merge recursively and overlay scalars win. Lists follow a
//! [`ListMergeStrategy`]; cloud-config fragments may pick theirs via
//! `merge_how`.

use serde_yaml::Value;
use tracing::debug;

/// Merge strategy for list fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListMergeStrategy {
    /// Append new items to existing list
    #[default]
    Append,
    /// Prepend new items to existing list
    Prepend,
    /// Replace entire list
    Replace,
    /// No change (keep original)
    NoReplace,
}

impl ListMergeStrategy {
    /// Parse from string (as used in merge_how)
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "append" => Self::Append,
            "prepend" => Self::Prepend,
            "replace" => Self::Replace,
            "no_replace" | "noreplace" => Self::NoReplace,
            _ => Self::Append,
        }
    }

    /// Pick the list strategy out of a `merge_how` / `Merge-Type` value
    ///
    /// Accepts a bare strategy (`replace`) or the merger syntax
    /// `list(append)+dict(recurse_array)`; only the `list(...)` term matters.
    pub fn from_merge_how(how: &str) -> Self {
        for term in how.split('+') {
            let term = term.trim();
            if let Some(rest) = term.strip_prefix("list(") {
                let options = rest.trim_end_matches(')');
                return options
                    .split(',')
                    .map(str::trim)
                    .find(|o| !o.is_empty())
                    .map(Self::parse)
                    .unwrap_or(Self::Replace);
            }
        }
        Self::parse(how)
    }
}

/// Merge two YAML values recursively
pub fn merge_yaml_values(base: &Value, overlay: &Value, list_strategy: ListMergeStrategy) -> Value {
    match (base, overlay) {
        // Both are mappings - merge recursively
        (Value::Mapping(base_map), Value::Mapping(overlay_map)) => {
            let mut result = base_map.clone();

            for (key, overlay_value) in overlay_map {
                let merged = match result.get(key) {
                    Some(base_value) => merge_yaml_values(base_value, overlay_value, list_strategy),
                    None => overlay_value.clone(),
                };
                result.insert(key.clone(), merged);
            }

            Value::Mapping(result)
        }

        // Both are sequences - merge according to strategy
        (Value::Sequence(base_seq), Value::Sequence(overlay_seq)) => match list_strategy {
            ListMergeStrategy::Append => {
                let mut result = base_seq.clone();
                for item in overlay_seq {
                    if !result.contains(item) {
                        result.push(item.clone());
                    }
                }
                Value::Sequence(result)
            }
            ListMergeStrategy::Prepend => {
                let mut result = overlay_seq.clone();
                for item in base_seq {
                    if !result.contains(item) {
                        result.push(item.clone());
                    }
                }
                Value::Sequence(result)
            }
            ListMergeStrategy::Replace => Value::Sequence(overlay_seq.clone()),
            ListMergeStrategy::NoReplace => Value::Sequence(base_seq.clone()),
        },

        // Overlay is null - keep base value
        (base_value, Value::Null) => base_value.clone(),

        // All other cases - overlay wins
        (_, overlay_value) => overlay_value.clone(),
    }
}

/// Merge documents in order (later documents have higher priority)
pub fn merge_all(values: &[Value], list_strategy: ListMergeStrategy) -> Value {
    let mut iter = values.iter();
    let Some(first) = iter.next() else {
        return Value::Mapping(Default::default());
    };

    let mut result = first.clone();
    for value in iter {
        debug!("Merging configuration document");
        result = merge_yaml_values(&result, value, list_strategy);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yaml(s: &str) -> Value {
        serde_yaml::from_str(s).unwrap()
    }

    #[test]
    fn test_merge_scalar_overlay_wins() {
        let merged = merge_yaml_values(
            &yaml("hostname: base-host"),
            &yaml("hostname: overlay-host"),
            ListMergeStrategy::Append,
        );
        assert_eq!(merged["hostname"].as_str(), Some("overlay-host"));
    }

    #[test]
    fn test_merge_keeps_base_when_overlay_missing() {
        let merged = merge_yaml_values(
            &yaml("hostname: base-host\nmanual_cache_clean: true"),
            &yaml("datasource_list: [NoCloud]"),
            ListMergeStrategy::Append,
        );
        assert_eq!(merged["hostname"].as_str(), Some("base-host"));
        assert_eq!(merged["manual_cache_clean"].as_bool(), Some(true));
        assert!(merged["datasource_list"].is_sequence());
    }

    #[test]
    fn test_merge_nested_mappings() {
        let merged = merge_yaml_values(
            &yaml("datasource:\n  Ec2:\n    timeout: 5\n    max_wait: 10"),
            &yaml("datasource:\n  Ec2:\n    timeout: 2"),
            ListMergeStrategy::Append,
        );
        assert_eq!(merged["datasource"]["Ec2"]["timeout"].as_u64(), Some(2));
        assert_eq!(merged["datasource"]["Ec2"]["max_wait"].as_u64(), Some(10));
    }

    #[test]
    fn test_merge_lists_append_no_duplicates() {
        let merged = merge_yaml_values(
            &yaml("runcmd: [a, b]"),
            &yaml("runcmd: [b, c]"),
            ListMergeStrategy::Append,
        );
        assert_eq!(merged["runcmd"], yaml("[a, b, c]"));
    }

    #[test]
    fn test_merge_lists_prepend() {
        let merged = merge_yaml_values(&yaml("[1, 2]"), &yaml("[3]"), ListMergeStrategy::Prepend);
        assert_eq!(merged, yaml("[3, 1, 2]"));
    }

    #[test]
    fn test_merge_yaml_values_replace() {
        let merged = merge_yaml_values(&yaml("[1, 2, 3]"), &yaml("[4, 5]"), ListMergeStrategy::Replace);
        assert_eq!(merged.as_sequence().unwrap().len(), 2);
    }

    #[test]
    fn test_null_overlay_keeps_base() {
        let merged = merge_yaml_values(&yaml("a: 1"), &Value::Null, ListMergeStrategy::Append);
        assert_eq!(merged, yaml("a: 1"));
    }

    #[test]
    fn test_merge_all() {
        let merged = merge_all(
            &[
                yaml("hostname: first"),
                yaml("hostname: second\nlocale: en_US"),
                yaml("hostname: third"),
            ],
            ListMergeStrategy::Replace,
        );
        assert_eq!(merged["hostname"].as_str(), Some("third"));
        assert_eq!(merged["locale"].as_str(), Some("en_US"));
    }

    #[test]
    fn test_merge_all_empty() {
        let merged = merge_all(&[], ListMergeStrategy::Append);
        assert!(merged.as_mapping().unwrap().is_empty());
    }

    #[test]
    fn test_list_merge_strategy_parse() {
        assert_eq!(ListMergeStrategy::parse("append"), ListMergeStrategy::Append);
        assert_eq!(ListMergeStrategy::parse("PREPEND"), ListMergeStrategy::Prepend);
        assert_eq!(ListMergeStrategy::parse("replace"), ListMergeStrategy::Replace);
        assert_eq!(ListMergeStrategy::parse("no_replace"), ListMergeStrategy::NoReplace);
    }

    #[test]
    fn test_from_merge_how() {
        assert_eq!(
            ListMergeStrategy::from_merge_how("list(append)+dict(recurse_array)+str()"),
            ListMergeStrategy::Append
        );
        assert_eq!(
            ListMergeStrategy::from_merge_how("dict()+list()"),
            ListMergeStrategy::Replace
        );
        assert_eq!(ListMergeStrategy::from_merge_how("prepend"), ListMergeStrategy::Prepend);
    }
}
