//! End-to-end reconciliation runs against a recording provider

use declarative::{
    Action, AutoConfirm, EngineContext, Error, ExecuteOptions, ExecutionReport, FailurePolicy,
    FileStore, MemoryStore, NoProgress, Plan, PropertyBag, Provider, ProviderError,
    ResourceDecl, ResourceStatus, RetryPolicy, StateStore, Value, execute,
};
use declarative::provider::Created;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;

/// One provider call with logical start and end ticks
#[derive(Debug, Clone)]
struct Call {
    op: &'static str,
    name: String,
    start: usize,
    end: usize,
}

/// Records every call; outputs echo inputs plus an `id`
#[derive(Default)]
struct Recorder {
    clock: AtomicUsize,
    calls: Mutex<Vec<Call>>,
    /// Names whose create is rejected
    reject: Vec<&'static str>,
    /// Names whose delete is rejected
    undeletable: Vec<&'static str>,
    /// Names whose create fails transiently this many times first
    flaky: Mutex<HashMap<&'static str, u32>>,
}

impl Recorder {
    fn rejecting(names: &[&'static str]) -> Self {
        Self {
            reject: names.to_vec(),
            ..Self::default()
        }
    }

    fn flaky(name: &'static str, failures: u32) -> Self {
        let recorder = Self::default();
        recorder.flaky.lock().unwrap().insert(name, failures);
        recorder
    }

    fn undeletable(names: &[&'static str]) -> Self {
        Self {
            undeletable: names.to_vec(),
            ..Self::default()
        }
    }

    fn ops(&self) -> Vec<(&'static str, String)> {
        self.calls().into_iter().map(|c| (c.op, c.name)).collect()
    }

    fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn names(&self, op: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.op == op)
            .map(|c| c.name)
            .collect()
    }

    fn record(&self, op: &'static str, name: &str) {
        let start = self.clock.fetch_add(1, Ordering::SeqCst);
        // Give concurrent workers a chance to overlap
        thread::sleep(Duration::from_millis(5));
        let end = self.clock.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(Call {
            op,
            name: name.to_string(),
            start,
            end,
        });
    }
}

fn name_of(inputs: &PropertyBag) -> String {
    inputs
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

impl Provider for Recorder {
    fn create(&self, _: &str, inputs: &PropertyBag) -> Result<Created, ProviderError> {
        let name = name_of(inputs);
        self.record("create", &name);

        if self.reject.contains(&name.as_str()) {
            return Err(ProviderError::Rejected {
                message: format!("{name} is not allowed"),
            });
        }
        let mut flaky = self.flaky.lock().unwrap();
        if let Some(left) = flaky.get_mut(name.as_str())
            && *left > 0
        {
            *left -= 1;
            return Err(ProviderError::Transient {
                message: "connection reset".into(),
            });
        }

        let mut outputs = inputs.clone();
        outputs.insert("id".into(), json!(format!("{name}-id")));
        Ok(Created {
            identity: format!("{name}-id"),
            outputs,
        })
    }

    fn update(
        &self,
        _: &str,
        identity: &str,
        _: &PropertyBag,
        new: &PropertyBag,
    ) -> Result<PropertyBag, ProviderError> {
        self.record("update", &name_of(new));
        let mut outputs = new.clone();
        outputs.insert("id".into(), json!(identity));
        Ok(outputs)
    }

    fn delete(&self, _: &str, _: &str, inputs: &PropertyBag) -> Result<(), ProviderError> {
        let name = name_of(inputs);
        self.record("delete", &name);
        if self.undeletable.contains(&name.as_str()) {
            return Err(ProviderError::Rejected {
                message: format!("{name} is still in use"),
            });
        }
        Ok(())
    }

    fn diff(&self, _: &str, old: &PropertyBag, new: &PropertyBag) -> declarative::DiffKind {
        if old.get("name") == new.get("name") {
            declarative::DiffKind::Update
        } else {
            declarative::DiffKind::Replace
        }
    }
}

/// The messaging and database topology of a small product stack
fn product_stack() -> Vec<ResourceDecl> {
    vec![
        ResourceDecl::new("vhost", "rabbitmq:VHost").with("name", "product-vhost"),
        ResourceDecl::new("exchange", "rabbitmq:Exchange")
            .with("name", "product")
            .with("vhost", Value::reference("vhost", "name")),
        ResourceDecl::new("requests", "rabbitmq:Queue")
            .with("name", "product-requests")
            .with("vhost", Value::reference("vhost", "name")),
        ResourceDecl::new("requests-binding", "rabbitmq:Binding")
            .with("name", "product-requests-binding")
            .with("source", Value::reference("exchange", "name"))
            .with("destination", Value::reference("requests", "name"))
            .with("vhost", Value::reference("vhost", "name")),
        ResourceDecl::new("database", "postgresql:Database").with("name", "product"),
        ResourceDecl::new("role", "postgresql:Role").with("name", "product-app"),
        ResourceDecl::new("grant", "postgresql:Grant")
            .with("name", "product-app-grant")
            .with("database", Value::reference("database", "name"))
            .with("role", Value::reference("role", "name")),
        ResourceDecl::new("config", "kubernetes:core/v1:ConfigMap")
            .with("name", "product-config")
            .with("vhost", Value::reference("vhost", "name"))
            .with("database", Value::reference("database", "name"))
            .depends_on("grant"),
    ]
}

fn apply(
    provider: &Recorder,
    store: &dyn StateStore,
    options: &ExecuteOptions,
    decls: &[ResourceDecl],
) -> ExecutionReport {
    let ctx = EngineContext::new(provider, store, options);
    let plan = Plan::build(ctx, decls).unwrap();
    execute(ctx, plan, &mut NoProgress, &mut AutoConfirm).unwrap()
}

fn parallel() -> ExecuteOptions {
    ExecuteOptions {
        jobs: 4,
        ..ExecuteOptions::default()
    }
}

#[test]
fn test_dependents_start_after_dependencies_end() {
    let provider = Recorder::default();
    let store = MemoryStore::new();
    let decls = product_stack();
    let report = apply(&provider, &store, &parallel(), &decls);
    assert!(report.is_success());
    assert_eq!(report.summary.created, decls.len());

    let calls: BTreeMap<String, Call> = provider
        .calls()
        .into_iter()
        .map(|c| (c.name.clone(), c))
        .collect();
    let name = |id: &str| {
        decls
            .iter()
            .find(|d| d.id == id)
            .and_then(|d| match d.properties.get("name") {
                Some(Value::Literal(v)) => v.as_str().map(String::from),
                _ => None,
            })
            .unwrap()
    };

    for decl in &decls {
        let mine = &calls[&name(&decl.id)];
        let deps = decl
            .references()
            .into_iter()
            .map(|r| r.resource.clone())
            .chain(decl.depends_on.iter().cloned());
        for dep in deps {
            let theirs = &calls[&name(&dep)];
            assert!(
                theirs.end < mine.start,
                "{} started at {} before {} ended at {}",
                decl.id,
                mine.start,
                dep,
                theirs.end
            );
        }
    }
}

#[test]
fn test_cycle_causes_no_provider_calls() {
    let provider = Recorder::default();
    let store = MemoryStore::new();
    let options = ExecuteOptions::default();
    let decls = vec![
        ResourceDecl::new("a", "t:A")
            .with("name", "a")
            .with("peer", Value::reference("c", "id")),
        ResourceDecl::new("b", "t:B")
            .with("name", "b")
            .with("peer", Value::reference("a", "id")),
        ResourceDecl::new("c", "t:C")
            .with("name", "c")
            .with("peer", Value::reference("b", "id")),
    ];

    let ctx = EngineContext::new(&provider, &store, &options);
    match Plan::build(ctx, &decls) {
        Err(Error::CycleDetected { cycle }) => {
            assert_eq!(cycle.first(), cycle.last());
            assert_eq!(cycle.len(), 4);
        }
        other => panic!("expected a cycle, got {other:?}"),
    }
    assert!(provider.calls().is_empty());
    assert!(store.is_empty());
}

#[test]
fn test_duplicate_identity_causes_no_provider_calls() {
    let provider = Recorder::default();
    let store = MemoryStore::new();
    let options = ExecuteOptions::default();
    let mut decls = product_stack();
    decls.push(ResourceDecl::new("role", "postgresql:Role").with("name", "other"));

    let ctx = EngineContext::new(&provider, &store, &options);
    let err = Plan::build(ctx, &decls).unwrap_err();
    assert!(matches!(err, Error::DuplicateIdentity { ref id } if id == "role"));
    assert!(provider.calls().is_empty());
}

#[test]
fn test_failure_skips_every_transitive_dependent() {
    let provider = Recorder::rejecting(&["product-vhost"]);
    let store = MemoryStore::new();
    let report = apply(&provider, &store, &parallel(), &product_stack());

    assert!(!report.is_success());
    for id in ["exchange", "requests", "requests-binding", "config"] {
        let outcome = report.outcome(id).unwrap();
        assert!(
            matches!(outcome.status, ResourceStatus::Skipped { .. }),
            "{id} should be skipped, was {}",
            outcome.status
        );
        assert!(
            !outcome
                .history
                .iter()
                .any(|s| matches!(s, ResourceStatus::Applying { .. })),
            "{id} must never start applying"
        );
        assert!(store.get(id).unwrap().is_none());
    }
    for id in ["database", "role", "grant"] {
        assert_eq!(report.outcome(id).unwrap().status, ResourceStatus::Applied);
    }
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.skipped, 4);
    assert_eq!(report.failures().count(), 1);
}

#[test]
fn test_halt_policy_starts_nothing_new() {
    let provider = Recorder::rejecting(&["product-vhost"]);
    let store = MemoryStore::new();
    let options = ExecuteOptions {
        jobs: 1,
        failure_policy: FailurePolicy::Halt,
        ..ExecuteOptions::default()
    };
    let report = apply(&provider, &store, &options, &product_stack());

    // vhost is first in order, so with one worker nothing else has started
    assert_eq!(provider.names("create"), vec!["product-vhost"]);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.skipped, product_stack().len() - 1);
}

#[test]
fn test_second_apply_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    let provider = Recorder::default();

    {
        let store = FileStore::open(&path).unwrap();
        apply(&provider, &store, &parallel(), &product_stack());
    }
    let calls = provider.calls().len();

    let store = FileStore::open(&path).unwrap();
    let report = apply(&provider, &store, &parallel(), &product_stack());
    assert_eq!(provider.calls().len(), calls);
    assert_eq!(report.summary.unchanged, product_stack().len());
    assert_eq!(report.summary.total_changes(), 0);
}

#[test]
fn test_removed_resources_are_deleted_dependents_first() {
    let provider = Recorder::default();
    let store = MemoryStore::new();
    let options = parallel();
    apply(&provider, &store, &options, &product_stack());

    let remaining: Vec<ResourceDecl> = product_stack()
        .into_iter()
        .filter(|d| !d.id.starts_with("requests") && d.id != "exchange")
        .collect();

    let ctx = EngineContext::new(&provider, &store, &options);
    let plan = Plan::build(ctx, &remaining).unwrap();
    assert_eq!(plan.summary().deletes, 3);

    let report = execute(ctx, plan, &mut NoProgress, &mut AutoConfirm).unwrap();
    assert_eq!(report.summary.deleted, 3);
    assert_eq!(report.summary.unchanged, remaining.len());

    let deletes: BTreeMap<String, Call> = provider
        .calls()
        .into_iter()
        .filter(|c| c.op == "delete")
        .map(|c| (c.name.clone(), c))
        .collect();
    let binding = &deletes["product-requests-binding"];
    assert!(binding.end < deletes["product"].start);
    assert!(binding.end < deletes["product-requests"].start);
    assert!(store.get("exchange").unwrap().is_none());
    assert!(store.get("vhost").unwrap().is_some());
}

#[test]
fn test_renamed_resource_is_replaced() {
    let provider = Recorder::default();
    let store = MemoryStore::new();
    let options = parallel();
    apply(&provider, &store, &options, &product_stack());

    let mut decls = product_stack();
    decls[4] = ResourceDecl::new("database", "postgresql:Database").with("name", "product-v2");
    let report = apply(&provider, &store, &options, &decls);

    assert_eq!(report.outcome("database").unwrap().action, Some(Action::Replace));
    assert_eq!(report.outcome("grant").unwrap().action, Some(Action::Update));
    assert_eq!(
        store.get("database").unwrap().unwrap().provider_id,
        "product-v2-id"
    );
    assert_eq!(
        store.get("config").unwrap().unwrap().inputs["database"],
        json!("product-v2")
    );
    assert_eq!(provider.names("delete"), vec!["product"]);

    let database = report.outcome("database").unwrap();
    assert_eq!(database.attempts, 2);
    assert_eq!(
        database.history,
        vec![
            ResourceStatus::Pending,
            ResourceStatus::Resolving,
            ResourceStatus::Applying { attempt: 1 },
            ResourceStatus::Applying { attempt: 2 },
            ResourceStatus::Applied,
        ]
    );
}

/// A database with a grant and a schema that both reference it
fn database_with_dependents(database: &str) -> Vec<ResourceDecl> {
    vec![
        ResourceDecl::new("db", "postgresql:Database").with("name", database),
        ResourceDecl::new("grant", "postgresql:Grant")
            .with("name", "g")
            .with("database", Value::reference("db", "name")),
        ResourceDecl::new("schema", "postgresql:Schema")
            .with("name", "s")
            .with("database", Value::reference("db", "name")),
    ]
}

#[test]
fn test_removed_dependent_is_deleted_before_replacement() {
    let provider = Recorder::default();
    let store = MemoryStore::new();
    let options = parallel();
    let mut decls = database_with_dependents("db1");
    decls.truncate(2);
    apply(&provider, &store, &options, &decls);
    let before = provider.calls().len();

    let decls = vec![ResourceDecl::new("db", "postgresql:Database").with("name", "db2")];
    let report = apply(&provider, &store, &options, &decls);

    assert!(report.is_success());
    assert_eq!(
        provider.ops()[before..],
        [
            ("delete", "g".to_string()),
            ("delete", "db1".to_string()),
            ("create", "db2".to_string()),
        ]
    );
    assert_eq!(report.summary.replaced, 1);
    assert_eq!(report.summary.deleted, 1);
    assert!(store.get("grant").unwrap().is_none());
    assert_eq!(store.get("db").unwrap().unwrap().provider_id, "db2-id");
}

#[test]
fn test_replacement_is_held_back_while_dependent_remains() {
    let provider = Recorder::undeletable(&["g"]);
    let store = MemoryStore::new();
    let options = parallel();
    apply(&provider, &store, &options, &database_with_dependents("db1"));
    let before = provider.calls().len();

    let decls: Vec<ResourceDecl> = database_with_dependents("db2")
        .into_iter()
        .filter(|d| d.id != "grant")
        .collect();
    let report = apply(&provider, &store, &options, &decls);

    assert_eq!(provider.ops()[before..], [("delete", "g".to_string())]);
    assert!(matches!(
        report.outcome("grant").unwrap().status,
        ResourceStatus::Failed { .. }
    ));
    assert_eq!(
        report.outcome("db").unwrap().status,
        ResourceStatus::Skipped {
            reason: "dependent 'grant' could not be deleted".into()
        }
    );
    assert_eq!(
        report.outcome("schema").unwrap().status,
        ResourceStatus::Skipped {
            reason: "dependency 'db' was skipped".into()
        }
    );
    assert_eq!(store.get("db").unwrap().unwrap().provider_id, "db1-id");
    assert!(store.get("grant").unwrap().is_some());
}

#[test]
fn test_targeted_destroy_takes_recorded_dependents() {
    let provider = Recorder::default();
    let store = MemoryStore::new();
    let options = parallel();
    apply(&provider, &store, &options, &product_stack());

    let ctx = EngineContext::new(&provider, &store, &options);
    let plan = Plan::destroy(ctx)
        .unwrap()
        .filter_by_targets(&["vhost".to_string()]);
    let report = execute(ctx, plan, &mut NoProgress, &mut AutoConfirm).unwrap();

    assert!(report.is_success());
    assert_eq!(report.summary.deleted, 5);
    let mut remaining: Vec<String> = store.list().unwrap().into_iter().map(|r| r.id).collect();
    remaining.sort();
    assert_eq!(remaining, vec!["database", "grant", "role"]);

    let deletes: BTreeMap<String, Call> = provider
        .calls()
        .into_iter()
        .filter(|c| c.op == "delete")
        .map(|c| (c.name.clone(), c))
        .collect();
    let vhost = &deletes["product-vhost"];
    for dependent in ["product", "product-requests", "product-config"] {
        assert!(deletes[dependent].end < vhost.start, "{dependent} outlived the vhost");
    }
    let binding = &deletes["product-requests-binding"];
    assert!(binding.end < deletes["product"].start);
    assert!(binding.end < deletes["product-requests"].start);
}

#[test]
fn test_transient_failures_are_retried_as_explicit_attempts() {
    let provider = Recorder::flaky("product-app", 2);
    let store = MemoryStore::new();
    let options = ExecuteOptions {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_millis(10),
        },
        ..parallel()
    };
    let report = apply(&provider, &store, &options, &product_stack());

    let role = report.outcome("role").unwrap();
    assert_eq!(role.status, ResourceStatus::Applied);
    assert_eq!(role.attempts, 3);
    assert_eq!(
        role.history,
        vec![
            ResourceStatus::Pending,
            ResourceStatus::Resolving,
            ResourceStatus::Applying { attempt: 1 },
            ResourceStatus::Applying { attempt: 2 },
            ResourceStatus::Applying { attempt: 3 },
            ResourceStatus::Applied,
        ]
    );
    assert!(report.is_success());
}

#[test]
fn test_retries_are_off_by_default() {
    let provider = Recorder::flaky("product-app", 1);
    let store = MemoryStore::new();
    let report = apply(&provider, &store, &parallel(), &product_stack());

    let role = report.outcome("role").unwrap();
    assert!(matches!(
        role.status,
        ResourceStatus::Failed { ref error } if error.contains("connection reset")
    ));
    assert!(matches!(
        report.outcome("grant").unwrap().status,
        ResourceStatus::Skipped { .. }
    ));
}

#[test]
fn test_targeted_apply_touches_only_selection() {
    let provider = Recorder::default();
    let store = MemoryStore::new();
    let options = parallel();
    let ctx = EngineContext::new(&provider, &store, &options);

    let plan = Plan::build(ctx, &product_stack())
        .unwrap()
        .filter_by_targets(&["grant".to_string()]);
    let report = execute(ctx, plan, &mut NoProgress, &mut AutoConfirm).unwrap();

    let mut created = provider.names("create");
    created.sort();
    assert_eq!(created, vec!["product", "product-app", "product-app-grant"]);
    assert_eq!(report.outcomes.len(), 3);
    assert!(store.get("vhost").unwrap().is_none());
}
