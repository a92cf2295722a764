//! Rendering of manifest-declared template files.
//!
//! The template engine is pluggable through [`TemplateRenderer`]. The
//! built-in [`PlaceholderRenderer`] substitutes `{{ dotted.path }}`
//! placeholders from a JSON context; unknown paths render as empty text.

use std::fs;
use std::path::Path;

use cast_core::{HostFacts, Manifest};
use regex::{Captures, Regex};
use serde_json::{Value, json};

use crate::error::{DeployError, DeployResult};

const PLACEHOLDER: &str = r"\{\{\s*([A-Za-z0-9_]+(?:\.[A-Za-z0-9_]+)*)\s*\}\}";

pub trait TemplateRenderer: Send + Sync {
    /// Render `template` against `context`.
    fn render(&self, template: &str, context: &Value) -> Result<String, String>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderRenderer;

impl TemplateRenderer for PlaceholderRenderer {
    fn render(&self, template: &str, context: &Value) -> Result<String, String> {
        let placeholder = Regex::new(PLACEHOLDER).map_err(|e| e.to_string())?;
        Ok(placeholder
            .replace_all(template, |caps: &Captures<'_>| {
                lookup(context, &caps[1]).map(display).unwrap_or_default()
            })
            .into_owned())
    }
}

fn lookup<'a>(context: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(context, |value, key| match value {
        Value::Object(map) => map.get(key),
        Value::Array(items) => key.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn display(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Identity of the version being rendered.
pub struct TemplateTarget<'a> {
    pub instance: &'a str,
    pub bundle: &'a str,
    pub version: &'a str,
    pub version_path: &'a Path,
    pub data_path: &'a Path,
}

/// The context every template is rendered with.
pub fn build_context(target: &TemplateTarget<'_>, manifest: &Manifest, facts: &HostFacts) -> Value {
    json!({
        "instance": {
            "name": target.instance,
            "version": target.version,
            "version_path": target.version_path,
            "data_path": target.data_path,
        },
        "bundle": {
            "name": target.bundle,
            "version": target.version,
        },
        "manifest": manifest,
        "facts": facts,
    })
}

/// Render each of `templates` from `bundle` into `version`, keeping the
/// source file's permissions.
pub fn realize_templates(
    renderer: &dyn TemplateRenderer,
    bundle: &Path,
    version: &Path,
    templates: &[String],
    context: &Value,
) -> DeployResult<()> {
    for template in templates {
        let src = bundle.join(template);
        let dest = version.join(template);
        let text = fs::read_to_string(&src).map_err(|e| DeployError::at("reading", &src, e))?;
        let rendered = renderer
            .render(&text, context)
            .map_err(|message| DeployError::Template {
                path: template.clone(),
                message,
            })?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| DeployError::at("creating", parent, e))?;
        }
        fs::write(&dest, rendered).map_err(|e| DeployError::at("writing", &dest, e))?;
        if let Ok(meta) = fs::metadata(&src) {
            let _ = fs::set_permissions(&dest, meta.permissions());
        }
    }
    Ok(())
}
