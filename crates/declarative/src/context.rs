//! Engine context and callback traits
//!
//! Everything an operation needs is passed explicitly through
//! [`EngineContext`]; there is no global "current stack". Callbacks let the
//! engine report progress and ask for confirmation without depending on a
//! particular terminal UI.

use crate::provider::Provider;
use crate::state::StateStore;
use crate::types::{ExecuteOptions, ResourceStatus};
use anyhow::Result;

/// Provider, state store and options for one engine operation
#[derive(Clone, Copy)]
pub struct EngineContext<'a> {
    pub provider: &'a dyn Provider,
    pub store: &'a dyn StateStore,
    pub options: &'a ExecuteOptions,
}

impl<'a> EngineContext<'a> {
    pub fn new(
        provider: &'a dyn Provider,
        store: &'a dyn StateStore,
        options: &'a ExecuteOptions,
    ) -> Self {
        Self {
            provider,
            store,
            options,
        }
    }
}

/// Execution phase reported to progress callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Creating, updating and replacing declared resources
    Apply,
    /// Deleting resources that are no longer declared
    Delete,
}

/// Progress callback for execution operations
pub trait ProgressCallback: Send {
    /// Called when a phase starts with the number of resources in it
    fn on_phase_start(&mut self, phase: Phase, count: usize);

    /// Called when a resource is handed to a worker
    fn on_resource_start(&mut self, id: &str);

    /// Called when a resource reaches a terminal status
    fn on_resource_complete(&mut self, id: &str, status: &ResourceStatus);

    /// Called when a phase completes
    fn on_phase_complete(&mut self, phase: Phase);
}

/// Confirmation callback for user interaction
pub trait ConfirmCallback: Send {
    /// Ask the user to confirm an action
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// No-op progress callback
pub struct NoProgress;

impl ProgressCallback for NoProgress {
    fn on_phase_start(&mut self, _phase: Phase, _count: usize) {}
    fn on_resource_start(&mut self, _id: &str) {}
    fn on_resource_complete(&mut self, _id: &str, _status: &ResourceStatus) {}
    fn on_phase_complete(&mut self, _phase: Phase) {}
}

/// Auto-confirm callback (always returns true)
pub struct AutoConfirm;

impl ConfirmCallback for AutoConfirm {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Auto-decline callback (always returns false)
pub struct AutoDecline;

impl ConfirmCallback for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(false)
    }
}
