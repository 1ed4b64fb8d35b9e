//! Provider trait - the external collaborator that owns real resources
//!
//! The engine never talks to infrastructure itself. Every create, read,
//! update and delete goes through a [`Provider`], which lets the same
//! engine drive a cloud SDK, a local simulation, or a test double.

use crate::types::{PropertyBag, type_package};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by providers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Temporary failure (network, throttling); worth retrying
    #[error("transient failure: {message}")]
    Transient { message: String },

    /// The provider refused the request
    #[error("{message}")]
    Rejected { message: String },

    /// The resource does not exist on the provider side
    #[error("resource not found: {identity}")]
    NotFound { identity: String },

    /// No provider handles this type tag
    #[error("no provider for resource type '{resource_type}'")]
    UnsupportedType { resource_type: String },

    /// The provider does not implement this operation
    #[error("operation '{operation}' is not supported by this provider")]
    Unsupported { operation: &'static str },
}

impl ProviderError {
    /// Whether this error is typically transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Result of a successful create
#[derive(Debug, Clone, PartialEq)]
pub struct Created {
    /// Provider-assigned identity, used for later update/delete calls
    pub identity: String,
    /// Observed outputs, available to dependents through references
    pub outputs: PropertyBag,
}

/// How a provider classifies a change of inputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffKind {
    Same,
    Update,
    Replace,
}

/// Lifecycle operations against real infrastructure
///
/// Implementations must be thread-safe; the executor calls them from
/// several workers at once for independent resources.
pub trait Provider: Send + Sync {
    /// Create a resource from fully resolved inputs
    fn create(&self, resource_type: &str, inputs: &PropertyBag) -> Result<Created, ProviderError>;

    /// Read the current outputs of a resource, `None` if it no longer exists
    fn read(
        &self,
        _resource_type: &str,
        _identity: &str,
    ) -> Result<Option<PropertyBag>, ProviderError> {
        Err(ProviderError::Unsupported { operation: "read" })
    }

    /// Update a resource in place, returning its new outputs
    fn update(
        &self,
        resource_type: &str,
        identity: &str,
        old: &PropertyBag,
        new: &PropertyBag,
    ) -> Result<PropertyBag, ProviderError>;

    /// Delete a resource
    fn delete(
        &self,
        resource_type: &str,
        identity: &str,
        inputs: &PropertyBag,
    ) -> Result<(), ProviderError>;

    /// Classify a change of inputs
    ///
    /// Default: equal inputs are the same, anything else is an in-place update.
    fn diff(&self, _resource_type: &str, old: &PropertyBag, new: &PropertyBag) -> DiffKind {
        if old == new {
            DiffKind::Same
        } else {
            DiffKind::Update
        }
    }
}

/// Dispatches to a provider by type package (`rabbitmq` in `rabbitmq:Queue`)
#[derive(Default, Clone)]
pub struct Providers {
    by_package: BTreeMap<String, Arc<dyn Provider>>,
    fallback: Option<Arc<dyn Provider>>,
}

impl Providers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provider for one type package
    pub fn register(mut self, package: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.by_package.insert(package.into(), provider);
        self
    }

    /// Provider used when no package matches
    pub fn with_fallback(mut self, provider: Arc<dyn Provider>) -> Self {
        self.fallback = Some(provider);
        self
    }

    fn resolve(&self, resource_type: &str) -> Result<&dyn Provider, ProviderError> {
        self.by_package
            .get(type_package(resource_type))
            .or(self.fallback.as_ref())
            .map(|provider| &**provider)
            .ok_or_else(|| ProviderError::UnsupportedType {
                resource_type: resource_type.to_string(),
            })
    }
}

impl Provider for Providers {
    fn create(&self, resource_type: &str, inputs: &PropertyBag) -> Result<Created, ProviderError> {
        self.resolve(resource_type)?.create(resource_type, inputs)
    }

    fn read(
        &self,
        resource_type: &str,
        identity: &str,
    ) -> Result<Option<PropertyBag>, ProviderError> {
        self.resolve(resource_type)?.read(resource_type, identity)
    }

    fn update(
        &self,
        resource_type: &str,
        identity: &str,
        old: &PropertyBag,
        new: &PropertyBag,
    ) -> Result<PropertyBag, ProviderError> {
        self.resolve(resource_type)?
            .update(resource_type, identity, old, new)
    }

    fn delete(
        &self,
        resource_type: &str,
        identity: &str,
        inputs: &PropertyBag,
    ) -> Result<(), ProviderError> {
        self.resolve(resource_type)?
            .delete(resource_type, identity, inputs)
    }

    fn diff(&self, resource_type: &str, old: &PropertyBag, new: &PropertyBag) -> DiffKind {
        match self.resolve(resource_type) {
            Ok(provider) => provider.diff(resource_type, old, new),
            Err(_) if old == new => DiffKind::Same,
            Err(_) => DiffKind::Update,
        }
    }
}
