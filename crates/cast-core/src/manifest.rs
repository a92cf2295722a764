//! Bundle manifest (`cast.json`) parsing and validation.
//!
//! A manifest is validated in three passes: per-type defaults are merged
//! in, the set of field names is checked (required fields present, no
//! unknown fields), then each field's value is checked. File-existence
//! checks for templates are left to the caller since they need I/O.

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Name of the manifest file at the root of every bundle.
pub const MANIFEST_FILENAME: &str = "cast.json";

/// Health check types a manifest may declare.
pub const HEALTH_CHECK_TYPES: &[&str] = &["http", "tcp"];

const REQUIRED_FIELDS: &[&str] = &[
    "name",
    "description",
    "type",
    "entry_file",
    "open_ports",
    "template_files",
    "data_files",
];

const OPTIONAL_FIELDS: &[&str] = &["health_checks"];

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ManifestError {
    #[error("Invalid path to the manifest file: {0}")]
    Unreadable(String),

    #[error("Manifest file is not valid JSON: {0}")]
    Json(String),

    #[error("Manifest must be a JSON object")]
    NotAnObject,

    #[error("Manifest file is missing required fields: {0}")]
    MissingFields(String),

    #[error("Manifest contains invalid fields: {0}")]
    UnknownFields(String),

    #[error("Field {field} is not valid ({message})")]
    InvalidField { field: String, message: String },
}

/// Application runtime, selects defaults and the service run command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppType {
    Nodejs,
    Shell,
}

impl AppType {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "nodejs" => Some(AppType::Nodejs),
            "shell" => Some(AppType::Shell),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AppType::Nodejs => "nodejs",
            AppType::Shell => "shell",
        }
    }

    fn defaults(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        match self {
            AppType::Nodejs => {
                defaults.insert("entry_file".into(), Value::from("server.js"));
                defaults.insert("open_ports".into(), Value::from(vec![80]));
            }
            AppType::Shell => {
                defaults.insert("entry_file".into(), Value::from("shell.sh"));
            }
        }
        defaults
    }
}

impl fmt::Display for AppType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A health check declared by a bundle. Arguments are check-specific and
/// are interpreted by the health subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub check: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub name: String,
    pub description: String,
    #[serde(rename = "type")]
    pub app_type: AppType,
    pub entry_file: String,
    pub open_ports: Vec<u16>,
    #[serde(default)]
    pub health_checks: Vec<HealthCheckSpec>,
    pub template_files: Vec<String>,
    pub data_files: Vec<String>,
}

impl Manifest {
    /// Load `cast.json` from a bundle root and check that every declared
    /// template exists under it.
    pub fn load(root: &Path) -> Result<Self, ManifestError> {
        let manifest = Self::from_file(&root.join(MANIFEST_FILENAME))?;
        manifest.check_templates(root)?;
        Ok(manifest)
    }

    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ManifestError::Unreadable(format!("{}: {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn check_templates(&self, root: &Path) -> Result<(), ManifestError> {
        for template in &self.template_files {
            if !root.join(template).is_file() {
                return Err(invalid(
                    "template_files",
                    &format!("Template file {template} does not exist"),
                ));
            }
        }
        Ok(())
    }

    /// Parse and validate manifest text.
    pub fn parse(text: &str) -> Result<Self, ManifestError> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| ManifestError::Json(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn from_value(value: Value) -> Result<Self, ManifestError> {
        let Value::Object(fields) = value else {
            return Err(ManifestError::NotAnObject);
        };

        let app_type = match fields.get("type") {
            Some(Value::String(t)) => AppType::parse(t).ok_or_else(|| invalid("type", "invalid application type"))?,
            Some(_) => return Err(invalid("type", "value is not a string")),
            None => return Err(ManifestError::MissingFields("type".to_string())),
        };

        let mut merged = app_type.defaults();
        merged.extend(fields);

        let missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|f| !merged.contains_key(*f))
            .collect();
        if !missing.is_empty() {
            return Err(ManifestError::MissingFields(missing.join(", ")));
        }

        let unknown: Vec<&str> = merged
            .keys()
            .map(String::as_str)
            .filter(|k| !REQUIRED_FIELDS.contains(k) && !OPTIONAL_FIELDS.contains(k))
            .collect();
        if !unknown.is_empty() {
            return Err(ManifestError::UnknownFields(unknown.join(", ")));
        }

        validate_ports(&merged)?;

        let manifest: Manifest = serde_json::from_value(Value::Object(merged))
            .map_err(|e| invalid("manifest", &e.to_string()))?;
        manifest.validate()?;
        Ok(manifest)
    }

    fn validate(&self) -> Result<(), ManifestError> {
        if self.entry_file.is_empty() {
            return Err(invalid("entry_file", "value is an empty string"));
        }

        for template in &self.template_files {
            if template.is_empty() {
                return Err(invalid("template_files", "Template file is an empty string"));
            }
            if !is_relative_path(template) {
                return Err(invalid(
                    "template_files",
                    "All the paths must be relative to the application root directory",
                ));
            }
        }

        for data_file in &self.data_files {
            if data_file.is_empty() || !is_relative_path(data_file) {
                return Err(invalid(
                    "data_files",
                    "All the paths must be relative to the application root directory",
                ));
            }
        }

        for check in &self.health_checks {
            if !HEALTH_CHECK_TYPES.contains(&check.check.as_str()) {
                return Err(invalid(
                    "health_checks",
                    &format!("Invalid check type: {}", check.check),
                ));
            }
        }

        Ok(())
    }

    /// Paths which are not hard-linked into a version: templates are
    /// rendered, data files are resolved against the instance data dir.
    pub fn excluded_paths(&self) -> BTreeSet<String> {
        self.template_files
            .iter()
            .chain(self.data_files.iter())
            .map(|p| p.trim_end_matches('/').to_string())
            .collect()
    }
}

fn invalid(field: &str, message: &str) -> ManifestError {
    ManifestError::InvalidField {
        field: field.to_string(),
        message: message.to_string(),
    }
}

fn validate_ports(fields: &Map<String, Value>) -> Result<(), ManifestError> {
    let Some(Value::Array(ports)) = fields.get("open_ports") else {
        return Err(invalid("open_ports", "value is not an array"));
    };
    for port in ports {
        match port.as_u64() {
            Some(p) if (1..=65535).contains(&p) => {}
            Some(_) => return Err(invalid("open_ports", "Port number must be between 1 and 65535")),
            None => return Err(invalid("open_ports", "value is not a number")),
        }
    }
    Ok(())
}

fn is_relative_path(path: &str) -> bool {
    !(path.starts_with('/')
        || path.starts_with("~/")
        || path.starts_with("./")
        || path.starts_with("..")
        || path.split('/').any(|segment| segment == ".."))
}
