//! Identifiers shared across cast crates.

use std::fmt;

use serde::{Deserialize, Serialize};

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Instance and application names: ASCII alphanumerics, `_`, `-`.
pub fn is_valid_identifier(value: &str) -> bool {
    !value.is_empty() && value.chars().all(is_name_char)
}

/// Bundle versions additionally allow dots, but never a leading dot or `..`.
pub fn is_valid_version(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('.')
        && !value.contains("..")
        && value.chars().all(|c| is_name_char(c) || c == '.')
}

/// Identity of a bundle: `(application name, version)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BundleId {
    pub app: String,
    pub version: String,
}

impl BundleId {
    pub fn new(app: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            app: app.into(),
            version: version.into(),
        }
    }

    /// Parse an `app@version` key.
    pub fn parse(key: &str) -> Option<Self> {
        let (app, version) = key.split_once('@')?;
        if app.is_empty() || version.is_empty() {
            return None;
        }
        Some(Self::new(app, version))
    }

    pub fn is_valid(&self) -> bool {
        is_valid_identifier(&self.app) && is_valid_version(&self.version)
    }

    /// The key used for directory names and in-flight tracking: `app@version`.
    pub fn key(&self) -> String {
        format!("{}@{}", self.app, self.version)
    }

    /// File name of the stored tarball: `app@version.tar.gz`.
    pub fn file_name(&self) -> String {
        format!("{}.tar.gz", self.key())
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.app, self.version)
    }
}
