//! Resource graph - declarations become a DAG of explicit node identities
//!
//! An edge `a -> b` means "a's inputs depend on b's outputs". Edges come
//! from references in property values and from explicit `depends_on`
//! entries. Nodes are addressed by index; identities map to indices once
//! at build time, so nothing holds a pointer to another node.

use crate::error::{Error, Result};
use crate::types::{Lookup, Properties, PropertyBag, Reference, ResourceDecl, lookup_path};
use std::collections::{BTreeSet, HashMap, VecDeque};

/// Identities plus dependency edges, checked to be acyclic
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    ids: Vec<String>,
    index: HashMap<String, usize>,
    dependencies: Vec<Vec<usize>>,
    dependents: Vec<Vec<usize>>,
    order: Vec<usize>,
}

impl DependencyGraph {
    /// Build from identities and, per identity, the indices it depends on
    pub fn new(ids: Vec<String>, dependencies: Vec<Vec<usize>>) -> Result<Self> {
        debug_assert_eq!(ids.len(), dependencies.len());

        let mut index = HashMap::with_capacity(ids.len());
        for (i, id) in ids.iter().enumerate() {
            if index.insert(id.clone(), i).is_some() {
                return Err(Error::DuplicateIdentity { id: id.clone() });
            }
        }

        let dependencies: Vec<Vec<usize>> = dependencies
            .into_iter()
            .map(|mut deps| {
                deps.sort_unstable();
                deps.dedup();
                deps
            })
            .collect();

        let mut dependents = vec![Vec::new(); ids.len()];
        for (node, deps) in dependencies.iter().enumerate() {
            for &dep in deps {
                dependents[dep].push(node);
            }
        }

        let mut graph = Self {
            ids,
            index,
            dependencies,
            dependents,
            order: Vec::new(),
        };
        graph.order = graph.kahn()?;
        Ok(graph)
    }

    /// Build from identities and dependency identities, ignoring unknown ones
    pub fn from_named<I>(nodes: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, Vec<String>)>,
    {
        let (ids, named): (Vec<String>, Vec<Vec<String>>) = nodes.into_iter().unzip();
        let positions: HashMap<&str, usize> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();
        let dependencies = named
            .iter()
            .map(|deps| {
                deps.iter()
                    .filter_map(|d| positions.get(d.as_str()).copied())
                    .collect()
            })
            .collect();
        Self::new(ids, dependencies)
    }

    /// Kahn's algorithm; ready nodes are taken in declaration order
    fn kahn(&self) -> Result<Vec<usize>> {
        let mut waiting: Vec<usize> = self.dependencies.iter().map(Vec::len).collect();
        let mut ready: BTreeSet<usize> = (0..self.len()).filter(|&i| waiting[i] == 0).collect();
        let mut order = Vec::with_capacity(self.len());

        while let Some(node) = ready.pop_first() {
            order.push(node);
            for &dependent in &self.dependents[node] {
                waiting[dependent] -= 1;
                if waiting[dependent] == 0 {
                    ready.insert(dependent);
                }
            }
        }

        if order.len() == self.len() {
            return Ok(order);
        }

        let leftover: BTreeSet<usize> = (0..self.len()).filter(|&i| waiting[i] > 0).collect();
        Err(Error::CycleDetected {
            cycle: self.find_cycle(&leftover),
        })
    }

    /// Walk dependencies inside the unsorted remainder until a node repeats.
    ///
    /// Every leftover node still waits on another leftover node, so the walk
    /// always closes a loop.
    fn find_cycle(&self, leftover: &BTreeSet<usize>) -> Vec<String> {
        let Some(&start) = leftover.first() else {
            return Vec::new();
        };
        let mut path = vec![start];
        let mut seen: HashMap<usize, usize> = HashMap::from([(start, 0)]);
        let mut current = start;

        loop {
            let Some(&next) = self.dependencies[current]
                .iter()
                .find(|&&d| leftover.contains(&d))
            else {
                break;
            };
            if let Some(&pos) = seen.get(&next) {
                let mut cycle: Vec<String> =
                    path[pos..].iter().map(|&i| self.ids[i].clone()).collect();
                cycle.push(self.ids[next].clone());
                return cycle;
            }
            seen.insert(next, path.len());
            path.push(next);
            current = next;
        }

        path.iter().map(|&i| self.ids[i].clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn id(&self, node: usize) -> &str {
        &self.ids[node]
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Direct dependencies of a node
    pub fn dependencies(&self, node: usize) -> &[usize] {
        &self.dependencies[node]
    }

    /// Direct dependents of a node
    pub fn dependents(&self, node: usize) -> &[usize] {
        &self.dependents[node]
    }

    /// Dependencies before dependents, ties in declaration order
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    /// Groups of nodes whose dependencies all sit in earlier groups
    pub fn levels(&self) -> Vec<Vec<usize>> {
        let mut depth = vec![0usize; self.len()];
        for &node in &self.order {
            depth[node] = self.dependencies[node]
                .iter()
                .map(|&d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }
        let mut levels: Vec<Vec<usize>> = Vec::new();
        for node in 0..self.len() {
            if levels.len() <= depth[node] {
                levels.resize(depth[node] + 1, Vec::new());
            }
            levels[depth[node]].push(node);
        }
        levels
    }

    /// Every node that depends on `node`, directly or not, in topological order
    pub fn transitive_dependents(&self, node: usize) -> Vec<usize> {
        self.reachable(node, &self.dependents)
    }

    /// Every node `node` depends on, directly or not, in topological order
    pub fn transitive_dependencies(&self, node: usize) -> Vec<usize> {
        self.reachable(node, &self.dependencies)
    }

    fn reachable(&self, node: usize, edges: &[Vec<usize>]) -> Vec<usize> {
        let mut seen = vec![false; self.len()];
        let mut queue = VecDeque::from([node]);
        while let Some(current) = queue.pop_front() {
            for &next in &edges[current] {
                if !seen[next] {
                    seen[next] = true;
                    queue.push_back(next);
                }
            }
        }
        self.order.iter().copied().filter(|&i| seen[i]).collect()
    }
}

/// A declared resource owned by the graph
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceNode {
    pub id: String,
    pub resource_type: String,
    pub properties: Properties,
    pub depends_on: Vec<String>,
    /// Outputs, populated once the resource is applied
    pub outputs: Option<PropertyBag>,
}

/// Resolved inputs, plus properties that are only known after apply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedInputs {
    pub inputs: PropertyBag,
    pub unknown: Vec<String>,
}

/// Declared resources and the dependency edges between them
#[derive(Debug, Clone, Default)]
pub struct ResourceGraph {
    nodes: Vec<ResourceNode>,
    edges: DependencyGraph,
}

impl ResourceGraph {
    /// Build the graph from declarations
    ///
    /// Declarations are cloned; the caller's copies are never modified.
    /// Fails on duplicate identities, references to undeclared resources,
    /// and dependency cycles.
    pub fn build(decls: &[ResourceDecl]) -> Result<Self> {
        let mut index: HashMap<&str, usize> = HashMap::with_capacity(decls.len());
        for (i, decl) in decls.iter().enumerate() {
            if index.insert(decl.id.as_str(), i).is_some() {
                return Err(Error::DuplicateIdentity {
                    id: decl.id.clone(),
                });
            }
        }

        let mut dependencies = Vec::with_capacity(decls.len());
        for decl in decls {
            let mut deps = Vec::new();
            for reference in decl.references() {
                let dep = index.get(reference.resource.as_str()).ok_or_else(|| {
                    Error::UnresolvedReference {
                        resource: decl.id.clone(),
                        target: reference.to_string(),
                    }
                })?;
                deps.push(*dep);
            }
            for name in &decl.depends_on {
                let dep = index
                    .get(name.as_str())
                    .ok_or_else(|| Error::UnresolvedReference {
                        resource: decl.id.clone(),
                        target: format!("undeclared resource '{name}' in depends_on"),
                    })?;
                deps.push(*dep);
            }
            dependencies.push(deps);
        }

        let ids = decls.iter().map(|d| d.id.clone()).collect();
        let edges = DependencyGraph::new(ids, dependencies)?;

        let nodes = decls
            .iter()
            .map(|d| ResourceNode {
                id: d.id.clone(),
                resource_type: d.resource_type.clone(),
                properties: d.properties.clone(),
                depends_on: d.depends_on.clone(),
                outputs: None,
            })
            .collect();

        log::debug!(
            "Built resource graph: {} nodes, {} edges",
            edges.len(),
            (0..edges.len()).map(|i| edges.dependencies(i).len()).sum::<usize>()
        );

        Ok(Self { nodes, edges })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[ResourceNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> &ResourceNode {
        &self.nodes[index]
    }

    pub fn index_of(&self, id: &str) -> Option<usize> {
        self.edges.index_of(id)
    }

    /// The underlying edge structure
    pub fn edges(&self) -> &DependencyGraph {
        &self.edges
    }

    /// Identities this node depends on, sorted
    pub fn dependency_ids(&self, index: usize) -> Vec<String> {
        let mut ids: Vec<String> = self
            .edges
            .dependencies(index)
            .iter()
            .map(|&d| self.nodes[d].id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn topological_order(&self) -> &[usize] {
        self.edges.topological_order()
    }

    pub fn levels(&self) -> Vec<Vec<usize>> {
        self.edges.levels()
    }

    /// Record the outputs of an applied node
    pub fn set_outputs(&mut self, index: usize, outputs: PropertyBag) {
        self.nodes[index].outputs = Some(outputs);
    }

    /// Resolve a node's inputs with a custom lookup
    pub fn resolve_with<F>(&self, index: usize, mut lookup: F) -> Result<ResolvedInputs>
    where
        F: FnMut(usize, &Reference) -> Lookup,
    {
        let node = &self.nodes[index];
        let mut resolved = ResolvedInputs::default();

        for (name, value) in &node.properties {
            let outcome = value.resolve(&mut |reference: &Reference| {
                match self.index_of(&reference.resource) {
                    Some(dep) => lookup(dep, reference),
                    None => Lookup::Missing,
                }
            });
            match outcome {
                Ok(Some(v)) => {
                    resolved.inputs.insert(name.clone(), v);
                }
                Ok(None) => resolved.unknown.push(name.clone()),
                Err(reference) => {
                    return Err(Error::UnresolvedReference {
                        resource: node.id.clone(),
                        target: reference.to_string(),
                    });
                }
            }
        }

        Ok(resolved)
    }

    /// Resolve a node's inputs from the outputs of its applied dependencies
    pub fn resolve_inputs(&self, index: usize) -> Result<PropertyBag> {
        let resolved = self.resolve_with(index, |dep, reference| {
            match &self.nodes[dep].outputs {
                Some(outputs) => lookup_path(outputs, &reference.output)
                    .cloned()
                    .map_or(Lookup::Missing, Lookup::Known),
                None => Lookup::Unknown,
            }
        })?;

        if let Some(name) = resolved.unknown.first() {
            return Err(Error::UnresolvedReference {
                resource: self.nodes[index].id.clone(),
                target: format!("property '{name}' whose dependency has no outputs"),
            });
        }
        Ok(resolved.inputs)
    }
}
