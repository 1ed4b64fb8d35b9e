//! Diff computation - what each resource needs to reach its desired state

use crate::provider::{DiffKind, Provider};
use crate::state::StateRecord;
use crate::types::{Action, PropertyBag};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Decide the action for a resource from its record and resolved inputs
///
/// Equal inputs short-circuit to `NoOp` without consulting the provider.
pub fn decide_action(
    provider: &dyn Provider,
    record: Option<&StateRecord>,
    resource_type: &str,
    inputs: &PropertyBag,
) -> Action {
    let Some(record) = record else {
        return Action::Create;
    };
    if record.resource_type != resource_type {
        return Action::Replace;
    }
    if &record.inputs == inputs {
        return Action::NoOp;
    }
    match provider.diff(resource_type, &record.inputs, inputs) {
        DiffKind::Same => Action::NoOp,
        DiffKind::Update => Action::Update,
        DiffKind::Replace => Action::Replace,
    }
}

/// Planned change for one resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceChange {
    /// Identity of the resource
    pub resource_id: String,
    /// Type of the resource
    pub resource_type: String,
    /// What will happen
    pub action: Action,
    /// Inputs from the state record, if any
    pub old_inputs: Option<PropertyBag>,
    /// Desired inputs that are known now
    pub new_inputs: Option<PropertyBag>,
    /// Properties only known after dependencies are applied
    #[serde(default)]
    pub unknown: Vec<String>,
}

impl ResourceChange {
    /// Change for a record that is no longer declared
    pub fn deletion(record: &StateRecord) -> Self {
        Self {
            resource_id: record.id.clone(),
            resource_type: record.resource_type.clone(),
            action: Action::Delete,
            old_inputs: Some(record.inputs.clone()),
            new_inputs: None,
            unknown: Vec::new(),
        }
    }

    pub fn is_removal(&self) -> bool {
        self.action == Action::Delete
    }

    pub fn is_modification(&self) -> bool {
        matches!(self.action, Action::Update | Action::Replace)
    }

    /// Names of properties that differ between old and new inputs
    pub fn changed_properties(&self) -> Vec<String> {
        let empty = PropertyBag::new();
        let old = self.old_inputs.as_ref().unwrap_or(&empty);
        let new = self.new_inputs.as_ref().unwrap_or(&empty);

        let mut names: BTreeSet<&String> = BTreeSet::new();
        for key in old.keys().chain(new.keys()) {
            if old.get(key) != new.get(key) {
                names.insert(key);
            }
        }
        names.extend(self.unknown.iter());
        names.into_iter().cloned().collect()
    }
}

/// Diff summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffSummary {
    pub creates: usize,
    pub updates: usize,
    pub replaces: usize,
    pub deletes: usize,
    pub unchanged: usize,
}

impl DiffSummary {
    /// Create a summary from a list of changes
    pub fn from_changes<'a>(changes: impl IntoIterator<Item = &'a ResourceChange>) -> Self {
        let mut summary = Self::default();
        for change in changes {
            match change.action {
                Action::NoOp => summary.unchanged += 1,
                Action::Create => summary.creates += 1,
                Action::Update => summary.updates += 1,
                Action::Replace => summary.replaces += 1,
                Action::Delete => summary.deletes += 1,
            }
        }
        summary
    }

    /// Total number of changes
    pub fn total(&self) -> usize {
        self.creates + self.updates + self.replaces + self.deletes
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}

/// Group changes by resource type
pub fn group_by_type<'a>(
    changes: impl IntoIterator<Item = &'a ResourceChange>,
) -> BTreeMap<String, Vec<&'a ResourceChange>> {
    let mut groups: BTreeMap<String, Vec<&ResourceChange>> = BTreeMap::new();
    for change in changes {
        groups
            .entry(change.resource_type.clone())
            .or_default()
            .push(change);
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{Created, ProviderError};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Name changes force replacement, and diff calls are counted
    #[derive(Default)]
    struct NameSensitive {
        diffs: AtomicUsize,
    }

    impl Provider for NameSensitive {
        fn create(&self, _: &str, _: &PropertyBag) -> Result<Created, ProviderError> {
            unreachable!("diffing never creates")
        }

        fn update(
            &self,
            _: &str,
            _: &str,
            _: &PropertyBag,
            _: &PropertyBag,
        ) -> Result<PropertyBag, ProviderError> {
            unreachable!("diffing never updates")
        }

        fn delete(&self, _: &str, _: &str, _: &PropertyBag) -> Result<(), ProviderError> {
            unreachable!("diffing never deletes")
        }

        fn diff(&self, _: &str, old: &PropertyBag, new: &PropertyBag) -> DiffKind {
            self.diffs.fetch_add(1, Ordering::SeqCst);
            if old.get("name") == new.get("name") {
                DiffKind::Update
            } else {
                DiffKind::Replace
            }
        }
    }

    fn bag(name: &str, durable: bool) -> PropertyBag {
        let mut bag = PropertyBag::new();
        bag.insert("name".into(), json!(name));
        bag.insert("durable".into(), json!(durable));
        bag
    }

    fn record(inputs: PropertyBag) -> StateRecord {
        StateRecord::new("q", "rabbitmq:Queue", "q-1", inputs.clone(), inputs, vec![])
    }

    #[test]
    fn test_decide_action() {
        let provider = NameSensitive::default();
        let current = record(bag("requests", true));

        assert_eq!(
            decide_action(&provider, None, "rabbitmq:Queue", &bag("requests", true)),
            Action::Create
        );
        assert_eq!(
            decide_action(&provider, Some(&current), "rabbitmq:Queue", &bag("requests", true)),
            Action::NoOp
        );
        assert_eq!(provider.diffs.load(Ordering::SeqCst), 0);

        assert_eq!(
            decide_action(&provider, Some(&current), "rabbitmq:Queue", &bag("requests", false)),
            Action::Update
        );
        assert_eq!(
            decide_action(&provider, Some(&current), "rabbitmq:Queue", &bag("approvals", true)),
            Action::Replace
        );
        assert_eq!(
            decide_action(&provider, Some(&current), "rabbitmq:Exchange", &bag("requests", true)),
            Action::Replace
        );
        assert_eq!(provider.diffs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_changed_properties() {
        let change = ResourceChange {
            resource_id: "q".into(),
            resource_type: "rabbitmq:Queue".into(),
            action: Action::Update,
            old_inputs: Some(bag("requests", true)),
            new_inputs: Some(bag("requests", false)),
            unknown: vec!["vhost".into()],
        };
        assert_eq!(change.changed_properties(), vec!["durable", "vhost"]);
        assert!(change.is_modification());

        let deletion = ResourceChange::deletion(&record(bag("requests", true)));
        assert!(deletion.is_removal());
        assert_eq!(deletion.changed_properties(), vec!["durable", "name"]);
    }

    #[test]
    fn test_summary_and_grouping() {
        let mk = |id: &str, ty: &str, action| ResourceChange {
            resource_id: id.into(),
            resource_type: ty.into(),
            action,
            old_inputs: None,
            new_inputs: None,
            unknown: vec![],
        };
        let changes = vec![
            mk("a", "rabbitmq:Queue", Action::Create),
            mk("b", "rabbitmq:Queue", Action::NoOp),
            mk("c", "postgresql:Role", Action::Replace),
            mk("d", "postgresql:Grant", Action::Delete),
        ];

        let summary = DiffSummary::from_changes(&changes);
        assert_eq!(summary.total(), 3);
        assert_eq!(summary.unchanged, 1);
        assert!(summary.has_changes());

        let groups = group_by_type(&changes);
        assert_eq!(groups["rabbitmq:Queue"].len(), 2);
        assert_eq!(groups.len(), 3);
    }
}
