//! Workload selectors and their canonical cache-key encoding.

use crate::pb::authority::delegated::v1::Selector as ProtoSelector;

const UNIX_TYPE: &str = "unix";

/// Converts user-defined selectors into authority API selectors.
impl From<Selector> for ProtoSelector {
    fn from(s: Selector) -> Self {
        match s {
            Selector::Unix(unix_selector) => Self {
                r#type: UNIX_TYPE.to_string(),
                value: unix_selector.into(),
            },
            Selector::Generic((k, v)) => Self {
                r#type: k,
                value: v,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Represents various types of workload identity selectors.
pub enum Selector {
    /// Represents a selector based on Unix process attributes such as UID, GID, and binary path.
    Unix(Unix),
    /// Represents a generic selector defined by a key-value pair.
    Generic((String, String)),
}

const UNIX_UID_TYPE: &str = "uid";
const UNIX_GID_TYPE: &str = "gid";
const UNIX_PATH_TYPE: &str = "path";

/// Converts a Unix selector into a formatted string representation.
impl From<Unix> for String {
    fn from(value: Unix) -> Self {
        match value {
            Unix::Uid(s) => format!("{UNIX_UID_TYPE}:{s}"),
            Unix::Gid(s) => format!("{UNIX_GID_TYPE}:{s}"),
            Unix::Path(s) => format!("{UNIX_PATH_TYPE}:{s}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Represents workload identity selectors based on Unix process-related attributes.
pub enum Unix {
    /// Specifies a selector for a Unix user ID (UID).
    Uid(u32),
    /// Specifies a selector for a Unix group ID (GID).
    Gid(u32),
    /// Specifies a selector for the path of the process executable.
    Path(String),
}

/// Computes the canonical cache key for a selector set.
///
/// Each selector is rendered as `"type:value"`, the renderings are sorted
/// lexicographically, and the result is joined with `,`. The key depends only
/// on set membership, never on discovery order.
///
/// Distinct selector sets produce distinct keys unless a type or value itself
/// contains the delimiter characters; selectors are not escaped.
#[must_use]
pub fn selectors_key(selectors: &[Selector]) -> String {
    let mut parts: Vec<String> = selectors
        .iter()
        .map(|s| {
            let proto: ProtoSelector = s.clone().into();
            format!("{}:{}", proto.r#type, proto.value)
        })
        .collect();
    parts.sort_unstable();
    parts.join(",")
}
