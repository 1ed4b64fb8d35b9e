//! Providers available to the CLI

mod local;

pub use local::LocalProvider;

use declarative::Providers;
use std::path::Path;
use std::sync::Arc;

/// Registry used by every command
///
/// Every type package currently falls through to the local provider.
pub fn registry(root: &Path) -> Providers {
    log::debug!("Local provider root: {}", root.display());
    Providers::new().with_fallback(Arc::new(LocalProvider::new(root)))
}
