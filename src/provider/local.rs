//! Filesystem-backed provider
//!
//! Each resource is a JSON document at `<root>/<type>/<identity>.json`
//! holding its outputs. Good enough to drive a stack end to end without
//! any real infrastructure.

use declarative::{Created, DiffKind, PropertyBag, Provider, ProviderError};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn document_path(&self, resource_type: &str, identity: &str) -> PathBuf {
        self.root
            .join(sanitize(resource_type))
            .join(format!("{}.json", sanitize(identity)))
    }

    fn write_document(&self, path: &Path, outputs: &PropertyBag) -> Result<(), ProviderError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        let content = serde_json::to_string_pretty(outputs).map_err(|e| ProviderError::Rejected {
            message: format!("could not serialize outputs: {e}"),
        })?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, content).map_err(io_error)?;
        fs::rename(&tmp, path).map_err(io_error)?;
        log::debug!("Wrote {}", path.display());
        Ok(())
    }
}

impl Provider for LocalProvider {
    fn create(&self, resource_type: &str, inputs: &PropertyBag) -> Result<Created, ProviderError> {
        let identity = identity_for(resource_type, inputs);
        let path = self.document_path(resource_type, &identity);
        if path.exists() {
            return Err(ProviderError::Rejected {
                message: format!("{resource_type} '{identity}' already exists"),
            });
        }

        let outputs = outputs_for(&identity, inputs);
        self.write_document(&path, &outputs)?;
        Ok(Created { identity, outputs })
    }

    fn read(
        &self,
        resource_type: &str,
        identity: &str,
    ) -> Result<Option<PropertyBag>, ProviderError> {
        let path = self.document_path(resource_type, identity);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error(e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| ProviderError::Rejected {
                message: format!("corrupt document {}: {e}", path.display()),
            })
    }

    fn update(
        &self,
        resource_type: &str,
        identity: &str,
        _old: &PropertyBag,
        new: &PropertyBag,
    ) -> Result<PropertyBag, ProviderError> {
        let path = self.document_path(resource_type, identity);
        if !path.exists() {
            return Err(ProviderError::NotFound {
                identity: identity.to_string(),
            });
        }

        let outputs = outputs_for(identity, new);
        self.write_document(&path, &outputs)?;
        Ok(outputs)
    }

    fn delete(
        &self,
        resource_type: &str,
        identity: &str,
        _inputs: &PropertyBag,
    ) -> Result<(), ProviderError> {
        let path = self.document_path(resource_type, identity);
        match fs::remove_file(&path) {
            Ok(()) => {
                log::debug!("Removed {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ProviderError::NotFound {
                identity: identity.to_string(),
            }),
            Err(e) => Err(io_error(e)),
        }
    }

    /// A different explicit name is a different resource
    fn diff(&self, _resource_type: &str, old: &PropertyBag, new: &PropertyBag) -> DiffKind {
        if old == new {
            DiffKind::Same
        } else if explicit_name(old) != explicit_name(new) {
            DiffKind::Replace
        } else {
            DiffKind::Update
        }
    }
}

/// `name`, then `metadata.name`
fn explicit_name(inputs: &PropertyBag) -> Option<&str> {
    inputs.get("name").and_then(|v| v.as_str()).or_else(|| {
        inputs
            .get("metadata")
            .and_then(|m| m.get("name"))
            .and_then(|v| v.as_str())
    })
}

/// Explicit name, or `<kind>-<hash of inputs>`
fn identity_for(resource_type: &str, inputs: &PropertyBag) -> String {
    if let Some(name) = explicit_name(inputs) {
        return name.to_string();
    }

    let kind = resource_type
        .rsplit(':')
        .next()
        .unwrap_or(resource_type)
        .to_lowercase();
    let bytes = serde_json::to_vec(inputs).unwrap_or_default();
    let hash = blake3::hash(&bytes).to_hex();
    format!("{kind}-{}", &hash[..8])
}

/// Inputs plus `id`, with `metadata.name` filled in when metadata lacks one
fn outputs_for(identity: &str, inputs: &PropertyBag) -> PropertyBag {
    let mut outputs = inputs.clone();
    outputs.insert("id".to_string(), identity.into());
    if let Some(serde_json::Value::Object(metadata)) = outputs.get_mut("metadata") {
        metadata
            .entry("name")
            .or_insert_with(|| identity.into());
    }
    outputs
}

fn sanitize(component: &str) -> String {
    component
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

fn io_error(e: io::Error) -> ProviderError {
    match e.kind() {
        ErrorKind::Interrupted | ErrorKind::WouldBlock | ErrorKind::TimedOut => {
            ProviderError::Transient {
                message: e.to_string(),
            }
        }
        _ => ProviderError::Rejected {
            message: e.to_string(),
        },
    }
}
