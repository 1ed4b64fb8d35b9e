//! Core types for declarative resource reconciliation

use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A resolved property bag: inputs after reference substitution, or outputs
pub type PropertyBag = BTreeMap<String, serde_json::Value>;

/// Declared properties, which may still contain references
pub type Properties = BTreeMap<String, Value>;

/// Pointer from an input property to another resource's output property
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    /// Identity of the referenced resource
    pub resource: String,
    /// Dotted path into the referenced resource's outputs (e.g. "metadata.name")
    pub output: String,
}

impl Reference {
    pub fn new(resource: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            output: output.into(),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${{{}:{}}}", self.resource, self.output)
    }
}

/// Outcome of looking up a reference while resolving a property
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// The referenced output is available
    Known(serde_json::Value),
    /// The referenced resource has not produced outputs yet
    Unknown,
    /// The referenced resource produced outputs without this path
    Missing,
}

/// A declared property value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Plain data, passed to the provider unchanged
    Literal(serde_json::Value),
    /// Output of another resource, known only after it is applied
    Reference(Reference),
    /// List that may contain references
    List(Vec<Value>),
    /// Map that may contain references
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Shorthand for a reference value
    pub fn reference(resource: impl Into<String>, output: impl Into<String>) -> Self {
        Self::Reference(Reference::new(resource, output))
    }

    /// Collect every reference nested in this value
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<&'a Reference>) {
        match self {
            Self::Literal(_) => {}
            Self::Reference(r) => refs.push(r),
            Self::List(items) => items.iter().for_each(|v| v.collect_references(refs)),
            Self::Map(entries) => entries.values().for_each(|v| v.collect_references(refs)),
        }
    }

    /// Substitute references using `lookup`
    ///
    /// Returns `Ok(None)` when some reference is not known yet and
    /// `Err(reference)` for the first reference whose output is missing.
    pub fn resolve<F>(&self, lookup: &mut F) -> Result<Option<serde_json::Value>, Reference>
    where
        F: FnMut(&Reference) -> Lookup,
    {
        match self {
            Self::Literal(v) => Ok(Some(v.clone())),
            Self::Reference(r) => match lookup(r) {
                Lookup::Known(v) => Ok(Some(v)),
                Lookup::Unknown => Ok(None),
                Lookup::Missing => Err(r.clone()),
            },
            Self::List(items) => {
                let mut out = Vec::with_capacity(items.len());
                let mut known = true;
                for item in items {
                    match item.resolve(lookup)? {
                        Some(v) => out.push(v),
                        None => known = false,
                    }
                }
                Ok(known.then_some(serde_json::Value::Array(out)))
            }
            Self::Map(entries) => {
                let mut out = serde_json::Map::new();
                let mut known = true;
                for (key, item) in entries {
                    match item.resolve(lookup)? {
                        Some(v) => {
                            out.insert(key.clone(), v);
                        }
                        None => known = false,
                    }
                }
                Ok(known.then_some(serde_json::Value::Object(out)))
            }
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        Self::Literal(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Literal(serde_json::Value::String(value.to_string()))
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Literal(serde_json::Value::String(value))
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Literal(serde_json::Value::Bool(value))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Literal(serde_json::Value::from(value))
    }
}

impl From<Reference> for Value {
    fn from(value: Reference) -> Self {
        Self::Reference(value)
    }
}

/// Follow a dotted path (`metadata.name`, `ports.0`) into a property bag
pub fn lookup_path<'a>(bag: &'a PropertyBag, path: &str) -> Option<&'a serde_json::Value> {
    let mut segments = path.split('.');
    let mut current = bag.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// A declared unit of desired state
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDecl {
    /// Stable identity across runs
    pub id: String,
    /// Type tag, conventionally `package:Kind` (e.g. "rabbitmq:Queue")
    pub resource_type: String,
    /// Desired properties
    pub properties: Properties,
    /// Ordering-only dependencies that carry no data
    pub depends_on: Vec<String>,
}

impl ResourceDecl {
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource_type: resource_type.into(),
            properties: Properties::new(),
            depends_on: Vec::new(),
        }
    }

    /// Set a property
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(name.into(), value.into());
        self
    }

    /// Add an explicit dependency
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Every reference in the property bag
    pub fn references(&self) -> Vec<&Reference> {
        self.properties
            .values()
            .flat_map(Value::references)
            .collect()
    }

    /// Package part of the type tag (`rabbitmq` for `rabbitmq:Queue`)
    pub fn package(&self) -> &str {
        type_package(&self.resource_type)
    }
}

/// Package part of a type tag
pub fn type_package(resource_type: &str) -> &str {
    resource_type
        .split_once(':')
        .map_or(resource_type, |(package, _)| package)
}

/// What the engine will do (or did) to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Inputs unchanged, nothing to do
    NoOp,
    /// Not yet recorded in state
    Create,
    /// Provider can change the resource in place
    Update,
    /// Provider must delete and recreate the resource
    Replace,
    /// Recorded in state but no longer declared
    Delete,
}

impl Action {
    /// Plan symbol
    pub fn symbol(self) -> &'static str {
        match self {
            Self::NoOp => " ",
            Self::Create => "+",
            Self::Update => "~",
            Self::Replace => "-/+",
            Self::Delete => "-",
        }
    }

    pub fn is_change(self) -> bool {
        !matches!(self, Self::NoOp)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::NoOp => "no-op",
            Self::Create => "create",
            Self::Update => "update",
            Self::Replace => "replace",
            Self::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Lifecycle status of a single resource during execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceStatus {
    /// Waiting for dependencies
    Pending,
    /// Substituting dependency outputs into inputs
    Resolving,
    /// Provider call in progress
    Applying { attempt: u32 },
    /// Provider call succeeded (or nothing needed doing)
    Applied,
    /// The resource failed; dependents will be skipped
    Failed { error: String },
    /// Never attempted
    Skipped { reason: String },
}

impl ResourceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Applied | Self::Failed { .. } | Self::Skipped { .. }
        )
    }
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Resolving => f.write_str("resolving"),
            Self::Applying { attempt } => write!(f, "applying (attempt {attempt})"),
            Self::Applied => f.write_str("applied"),
            Self::Failed { error } => write!(f, "failed: {error}"),
            Self::Skipped { reason } => write!(f, "skipped: {reason}"),
        }
    }
}

/// What to do with independent branches once something fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Keep starting resources that do not depend on the failure
    #[default]
    Continue,
    /// Start nothing new; in-flight work is allowed to finish
    Halt,
}

/// Options for execution
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Compute and report, but make no provider calls
    pub dry_run: bool,
    /// Number of parallel workers
    pub jobs: usize,
    /// Retry policy for transient provider errors
    pub retry: RetryPolicy,
    /// Behaviour of independent branches after a failure
    pub failure_policy: FailurePolicy,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            jobs: 4,
            retry: RetryPolicy::no_retry(),
            failure_policy: FailurePolicy::Continue,
        }
    }
}

/// Summary of execution results
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteSummary {
    pub created: usize,
    pub updated: usize,
    pub replaced: usize,
    pub deleted: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ExecuteSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.updated + self.replaced + self.deleted
    }

    /// Check if execution was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Total number of resources processed
    pub fn total(&self) -> usize {
        self.total_changes() + self.unchanged + self.failed + self.skipped
    }

    /// Count one finished resource
    pub fn add(&mut self, action: Option<Action>, status: &ResourceStatus) {
        match status {
            ResourceStatus::Failed { .. } => self.failed += 1,
            ResourceStatus::Skipped { .. } => self.skipped += 1,
            ResourceStatus::Applied => match action {
                Some(Action::Create) => self.created += 1,
                Some(Action::Update) => self.updated += 1,
                Some(Action::Replace) => self.replaced += 1,
                Some(Action::Delete) => self.deleted += 1,
                Some(Action::NoOp) | None => self.unchanged += 1,
            },
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outputs() -> PropertyBag {
        let mut bag = PropertyBag::new();
        bag.insert("name".into(), json!("product-vhost"));
        bag.insert(
            "metadata".into(),
            json!({ "name": "product-ns-dev", "labels": { "istio-injection": "enabled" } }),
        );
        bag.insert("ports".into(), json!([{ "port": 80 }, { "port": 443 }]));
        bag
    }

    #[test]
    fn test_lookup_path() {
        let bag = outputs();
        assert_eq!(lookup_path(&bag, "name"), Some(&json!("product-vhost")));
        assert_eq!(
            lookup_path(&bag, "metadata.labels.istio-injection"),
            Some(&json!("enabled"))
        );
        assert_eq!(lookup_path(&bag, "ports.1.port"), Some(&json!(443)));
        assert_eq!(lookup_path(&bag, "ports.9.port"), None);
        assert_eq!(lookup_path(&bag, "name.first"), None);
        assert_eq!(lookup_path(&bag, "missing"), None);
    }

    #[test]
    fn test_nested_references_are_collected() {
        let mut meta = BTreeMap::new();
        meta.insert("namespace".to_string(), Value::reference("ns", "metadata.name"));
        let decl = ResourceDecl::new("svc", "kubernetes:core/v1:Service")
            .with("metadata", Value::Map(meta))
            .with(
                "hosts",
                Value::List(vec!["*".into(), Value::reference("gw", "name")]),
            );

        let mut targets: Vec<_> = decl.references().iter().map(|r| r.resource.clone()).collect();
        targets.sort();
        assert_eq!(targets, vec!["gw", "ns"]);
        assert_eq!(decl.package(), "kubernetes");
    }

    #[test]
    fn test_resolve_known_unknown_missing() {
        let value = Value::List(vec!["static".into(), Value::reference("vhost", "name")]);

        let known = value.resolve(&mut |_| Lookup::Known(json!("product-vhost")));
        assert_eq!(known, Ok(Some(json!(["static", "product-vhost"]))));

        let unknown = value.resolve(&mut |_| Lookup::Unknown);
        assert_eq!(unknown, Ok(None));

        let missing = value.resolve(&mut |_| Lookup::Missing);
        assert_eq!(missing, Err(Reference::new("vhost", "name")));
    }

    #[test]
    fn test_summary_counts_by_action() {
        let mut summary = ExecuteSummary::default();
        summary.add(Some(Action::Create), &ResourceStatus::Applied);
        summary.add(Some(Action::NoOp), &ResourceStatus::Applied);
        summary.add(Some(Action::Delete), &ResourceStatus::Applied);
        summary.add(
            None,
            &ResourceStatus::Skipped {
                reason: "dependency failed".into(),
            },
        );
        summary.add(
            Some(Action::Update),
            &ResourceStatus::Failed {
                error: "boom".into(),
            },
        );

        assert_eq!(summary.total_changes(), 2);
        assert_eq!(summary.total(), 5);
        assert!(!summary.is_success());
    }

    #[test]
    fn test_reference_display() {
        assert_eq!(
            Reference::new("product-ns", "metadata.name").to_string(),
            "${product-ns:metadata.name}"
        );
        assert_eq!(type_package("rabbitmq:Queue"), "rabbitmq");
        assert_eq!(type_package("plain"), "plain");
    }
}
