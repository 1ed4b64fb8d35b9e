//! Declaration files
//!
//! A declaration file lists resources as TOML or JSON:
//!
//! ```toml
//! [[resources]]
//! id = "vhost"
//! type = "rabbitmq:VHost"
//! properties = { name = "product-vhost" }
//!
//! [[resources]]
//! id = "requests"
//! type = "rabbitmq:Queue"
//! depends_on = ["permissions"]
//! properties = { name = "product-requests", vhost = "${vhost:name}" }
//! ```
//!
//! A string property of the exact form `${resource:output.path}` is a
//! reference to another resource's output.

use declarative::{Properties, ResourceDecl, Value};
use regex::Regex;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use thiserror::Error;

static REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\$\{([^:}\s]+):([^}\s]+)\}$").expect("reference pattern is valid")
});

static EMBEDDED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{[^}]*\}").expect("embedded pattern is valid"));

#[derive(Debug, Error)]
pub enum DeclarationError {
    #[error("could not read {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML in {path}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid JSON in {path}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("resource #{index} has an empty {field}")]
    Empty { index: usize, field: &'static str },
}

#[derive(Debug, Deserialize)]
struct DeclarationFile {
    #[serde(default)]
    resources: Vec<RawResource>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawResource {
    id: String,
    #[serde(rename = "type")]
    resource_type: String,
    #[serde(default)]
    properties: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    depends_on: Vec<String>,
}

/// Load declarations from a file, choosing the format by extension
pub fn load(path: &Path) -> Result<Vec<ResourceDecl>, DeclarationError> {
    let content = std::fs::read_to_string(path).map_err(|source| DeclarationError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let file: DeclarationFile = if is_json {
        serde_json::from_str(&content).map_err(|source| DeclarationError::Json {
            path: path.to_path_buf(),
            source,
        })?
    } else {
        toml::from_str(&content).map_err(|source| DeclarationError::Toml {
            path: path.to_path_buf(),
            source,
        })?
    };

    let decls = into_decls(file)?;
    log::debug!("Loaded {} declarations from {}", decls.len(), path.display());
    Ok(decls)
}

fn into_decls(file: DeclarationFile) -> Result<Vec<ResourceDecl>, DeclarationError> {
    file.resources
        .into_iter()
        .enumerate()
        .map(|(index, raw)| {
            if raw.id.trim().is_empty() {
                return Err(DeclarationError::Empty { index, field: "id" });
            }
            if raw.resource_type.trim().is_empty() {
                return Err(DeclarationError::Empty {
                    index,
                    field: "type",
                });
            }

            let properties: Properties = raw
                .properties
                .into_iter()
                .map(|(name, value)| {
                    let value = parse_value(&raw.id, value);
                    (name, value)
                })
                .collect();

            Ok(ResourceDecl {
                id: raw.id,
                resource_type: raw.resource_type,
                properties,
                depends_on: raw.depends_on,
            })
        })
        .collect()
}

/// Turn a raw value into a property value, recognising references
///
/// Lists and maps stay literal unless something inside them is a reference.
fn parse_value(resource: &str, value: serde_json::Value) -> Value {
    match value {
        serde_json::Value::String(s) => match REFERENCE.captures(&s) {
            Some(caps) => Value::reference(&caps[1], &caps[2]),
            None => {
                if EMBEDDED.is_match(&s) {
                    log::warn!(
                        "'{resource}': \"{s}\" embeds a reference inside a string; \
                         only whole-string references are resolved"
                    );
                }
                Value::Literal(serde_json::Value::String(s))
            }
        },
        serde_json::Value::Array(items) => {
            let parsed: Vec<Value> = items
                .into_iter()
                .map(|item| parse_value(resource, item))
                .collect();
            if parsed.iter().all(is_literal) {
                Value::Literal(serde_json::Value::Array(
                    parsed.into_iter().filter_map(into_literal).collect(),
                ))
            } else {
                Value::List(parsed)
            }
        }
        serde_json::Value::Object(entries) => {
            let parsed: Properties = entries
                .into_iter()
                .map(|(key, item)| (key, parse_value(resource, item)))
                .collect();
            if parsed.values().all(is_literal) {
                Value::Literal(serde_json::Value::Object(
                    parsed
                        .into_iter()
                        .filter_map(|(key, item)| into_literal(item).map(|v| (key, v)))
                        .collect(),
                ))
            } else {
                Value::Map(parsed)
            }
        }
        other => Value::Literal(other),
    }
}

fn is_literal(value: &Value) -> bool {
    matches!(value, Value::Literal(_))
}

fn into_literal(value: Value) -> Option<serde_json::Value> {
    match value {
        Value::Literal(v) => Some(v),
        _ => None,
    }
}
