//! Path-like group names.
//!
//! Groups are addressed like filesystem paths: `/` is the root, `/site/ct12`
//! is a nested group. Paths are normalized on parse (leading slash added,
//! repeated and trailing slashes removed) so that `"site/ct12/"` and
//! `"/site//ct12"` name the same group.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::error::SchemaError;

/// A normalized group path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct GroupPath(String);

impl GroupPath {
    /// The root group, `/`.
    pub fn root() -> Self {
        GroupPath("/".to_string())
    }

    /// Parse and normalize a group path.
    ///
    /// Components must be non-empty after normalization, must not be `.` or
    /// `..`, and may only contain ASCII alphanumerics, `_`, `-` and `.`.
    pub fn parse(raw: &str) -> Result<Self, SchemaError> {
        let mut parts = Vec::new();
        for part in raw.split('/').filter(|p| !p.is_empty()) {
            if part == "." || part == ".." {
                return Err(SchemaError::InvalidGroupPath {
                    path: raw.to_string(),
                    reason: "relative components are not allowed",
                });
            }
            if !part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
            {
                return Err(SchemaError::InvalidGroupPath {
                    path: raw.to_string(),
                    reason: "components may only contain ASCII alphanumerics, '_', '-' and '.'",
                });
            }
            parts.push(part);
        }
        Ok(GroupPath(format!("/{}", parts.join("/"))))
    }

    /// The normalized path string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the root group.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Last path component (`"/"` for the root).
    pub fn name(&self) -> &str {
        match self.0.rsplit_once('/') {
            Some((_, name)) if !name.is_empty() => name,
            _ => "/",
        }
    }

    /// Proper ancestors below the root, shallowest first.
    ///
    /// `/a/b/c` yields `/a` and `/a/b`.
    pub fn ancestors(&self) -> Vec<GroupPath> {
        let mut out = Vec::new();
        let mut prefix = String::new();
        let parts: Vec<&str> = self.0.split('/').filter(|p| !p.is_empty()).collect();
        if let Some((_, parents)) = parts.split_last() {
            for part in parents {
                prefix.push('/');
                prefix.push_str(part);
                out.push(GroupPath(prefix.clone()));
            }
        }
        out
    }
}

impl fmt::Display for GroupPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GroupPath {
    type Err = SchemaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GroupPath::parse(s)
    }
}

impl TryFrom<String> for GroupPath {
    type Error = SchemaError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        GroupPath::parse(&value)
    }
}

impl From<GroupPath> for String {
    fn from(value: GroupPath) -> Self {
        value.0
    }
}
