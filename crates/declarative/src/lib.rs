//! # Declarative
//!
//! An engine for declarative resource reconciliation.
//!
//! Callers declare resources (identity, type tag, properties, explicit
//! dependencies). Properties may reference outputs of other resources. The
//! engine turns declarations into a dependency graph, compares them with
//! recorded state, and drives a [`Provider`] to create, update, replace,
//! or delete real resources in dependency order, as concurrently as the
//! graph allows.
//!
//! ## Core Concepts
//!
//! - **ResourceGraph**: declarations as nodes plus edges from references
//!   and `depends_on`; rejects cycles, duplicates, and dangling references
//! - **Plan**: one [`ResourceChange`] per resource, plus deletions for
//!   records that are no longer declared
//! - **Scheduler**: hands out nodes once their prerequisites finish
//! - **Executor**: applies a plan on a worker pool, retrying transient
//!   provider errors and skipping dependents of failures
//! - **StateStore**: last applied inputs and observed outputs per identity
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{
//!     AutoConfirm, EngineContext, ExecuteOptions, MemoryStore, NoProgress, Plan,
//!     ResourceDecl, Value, execute,
//! };
//!
//! let decls = vec![
//!     ResourceDecl::new("vhost", "rabbitmq:VHost").with("name", "product-vhost"),
//!     ResourceDecl::new("queue", "rabbitmq:Queue")
//!         .with("name", "product-requests")
//!         .with("vhost", Value::reference("vhost", "name")),
//! ];
//!
//! let store = MemoryStore::new();
//! let options = ExecuteOptions::default();
//! let ctx = EngineContext::new(&my_provider, &store, &options);
//!
//! let plan = Plan::build(ctx, &decls)?;
//! let report = execute(ctx, plan, &mut NoProgress, &mut AutoConfirm)?;
//! assert!(report.is_success());
//! ```
//!
//! ## Seams
//!
//! - [`Provider`]: talks to real infrastructure
//! - [`StateStore`]: persists records ([`MemoryStore`], [`FileStore`])
//! - [`ProgressCallback`]: receives progress updates
//! - [`ConfirmCallback`]: handles user confirmations
//!
//! Nothing is global: every operation takes an [`EngineContext`].

pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod graph;
pub mod planner;
pub mod provider;
pub mod retry;
pub mod scheduler;
pub mod state;
pub mod types;

// Re-export main types at crate root
pub use context::{
    AutoConfirm, AutoDecline, ConfirmCallback, EngineContext, NoProgress, Phase,
    ProgressCallback,
};
pub use diff::{DiffSummary, ResourceChange, decide_action, group_by_type};
pub use error::{Error, Result, error_chain};
pub use executor::{ExecutionReport, RefreshSummary, ResourceOutcome, execute, refresh};
pub use graph::{DependencyGraph, ResourceGraph, ResourceNode};
pub use planner::Plan;
pub use provider::{Created, DiffKind, Provider, ProviderError, Providers};
pub use retry::RetryPolicy;
pub use scheduler::{Direction, Scheduler};
pub use state::{FileStore, MemoryStore, STATE_VERSION, StateRecord, StateStore};
pub use types::{
    Action, ExecuteOptions, ExecuteSummary, FailurePolicy, Lookup, Properties, PropertyBag,
    Reference, ResourceDecl, ResourceStatus, Value,
};
