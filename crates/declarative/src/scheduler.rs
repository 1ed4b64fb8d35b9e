//! Topological scheduler - hands out nodes as their prerequisites finish
//!
//! The scheduler is a ready set over a [`DependencyGraph`]. In the forward
//! direction a node's prerequisites are its dependencies (apply order);
//! in reverse they are its dependents (delete order). Ready nodes are
//! handed out lowest index first, so runs are deterministic for a given
//! completion order.

use crate::graph::DependencyGraph;
use std::collections::BTreeSet;

/// Which way edges are followed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Dependencies before dependents
    Forward,
    /// Dependents before dependencies
    Reverse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Waiting,
    Ready,
    Running,
    Done,
    Blocked,
    Excluded,
}

/// Ready-set scheduler for one run over a graph
#[derive(Debug)]
pub struct Scheduler<'g> {
    graph: &'g DependencyGraph,
    direction: Direction,
    slots: Vec<Slot>,
    waiting_on: Vec<usize>,
    ready: BTreeSet<usize>,
}

impl<'g> Scheduler<'g> {
    pub fn new(graph: &'g DependencyGraph, direction: Direction) -> Self {
        Self::with_selection(graph, direction, &vec![true; graph.len()])
    }

    /// Schedule only selected nodes
    ///
    /// Unselected nodes are never handed out and do not hold anything back.
    /// The selection should be closed over prerequisites.
    pub fn with_selection(
        graph: &'g DependencyGraph,
        direction: Direction,
        selected: &[bool],
    ) -> Self {
        let mut scheduler = Self {
            graph,
            direction,
            slots: vec![Slot::Waiting; graph.len()],
            waiting_on: vec![0; graph.len()],
            ready: BTreeSet::new(),
        };

        for node in 0..graph.len() {
            if !selected.get(node).copied().unwrap_or(false) {
                scheduler.slots[node] = Slot::Excluded;
                continue;
            }
            let waiting = scheduler
                .prerequisites(node)
                .iter()
                .filter(|&&p| selected.get(p).copied().unwrap_or(false))
                .count();
            scheduler.waiting_on[node] = waiting;
            if waiting == 0 {
                scheduler.slots[node] = Slot::Ready;
                scheduler.ready.insert(node);
            }
        }

        scheduler
    }

    fn prerequisites(&self, node: usize) -> &'g [usize] {
        match self.direction {
            Direction::Forward => self.graph.dependencies(node),
            Direction::Reverse => self.graph.dependents(node),
        }
    }

    fn successors(&self, node: usize) -> &'g [usize] {
        match self.direction {
            Direction::Forward => self.graph.dependents(node),
            Direction::Reverse => self.graph.dependencies(node),
        }
    }

    /// Take the next eligible node and mark it running
    pub fn next_ready(&mut self) -> Option<usize> {
        let node = self.ready.pop_first()?;
        self.slots[node] = Slot::Running;
        Some(node)
    }

    /// Whether any node is eligible right now
    pub fn has_ready(&self) -> bool {
        !self.ready.is_empty()
    }

    /// Mark a node finished; returns nodes that became eligible
    pub fn complete(&mut self, node: usize) -> Vec<usize> {
        self.slots[node] = Slot::Done;
        let mut unlocked = Vec::new();
        for &next in self.successors(node) {
            if self.slots[next] != Slot::Waiting {
                continue;
            }
            self.waiting_on[next] -= 1;
            if self.waiting_on[next] == 0 {
                self.slots[next] = Slot::Ready;
                self.ready.insert(next);
                unlocked.push(next);
            }
        }
        unlocked
    }

    /// Mark a node failed; every transitive successor is blocked and returned
    pub fn fail(&mut self, node: usize) -> Vec<usize> {
        self.slots[node] = Slot::Done;
        let mut blocked = Vec::new();
        let mut stack: Vec<usize> = self.successors(node).to_vec();

        while let Some(next) = stack.pop() {
            match self.slots[next] {
                Slot::Waiting | Slot::Ready => {
                    self.ready.remove(&next);
                    self.slots[next] = Slot::Blocked;
                    blocked.push(next);
                    stack.extend_from_slice(self.successors(next));
                }
                _ => {}
            }
        }

        blocked.sort_unstable();
        blocked
    }

    /// Block every node that has not started yet; running nodes are untouched
    pub fn cancel_pending(&mut self) -> Vec<usize> {
        let mut cancelled = Vec::new();
        for node in 0..self.slots.len() {
            if matches!(self.slots[node], Slot::Waiting | Slot::Ready) {
                self.slots[node] = Slot::Blocked;
                cancelled.push(node);
            }
        }
        self.ready.clear();
        cancelled
    }

    /// No node is waiting, ready, or running
    pub fn is_finished(&self) -> bool {
        self.slots
            .iter()
            .all(|s| matches!(s, Slot::Done | Slot::Blocked | Slot::Excluded))
    }

    /// Static preview of the schedule: groups that may run together
    pub fn waves(graph: &DependencyGraph, direction: Direction) -> Vec<Vec<usize>> {
        let mut levels = graph.levels();
        if direction == Direction::Reverse {
            let mut height = vec![0usize; graph.len()];
            for &node in graph.topological_order().iter().rev() {
                height[node] = graph
                    .dependents(node)
                    .iter()
                    .map(|&d| height[d] + 1)
                    .max()
                    .unwrap_or(0);
            }
            levels = Vec::new();
            for node in 0..graph.len() {
                if levels.len() <= height[node] {
                    levels.resize(height[node] + 1, Vec::new());
                }
                levels[height[node]].push(node);
            }
        }
        levels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// a <- b <- d, a <- c, e independent
    fn diamond() -> DependencyGraph {
        DependencyGraph::new(
            vec!["a".into(), "b".into(), "c".into(), "d".into(), "e".into()],
            vec![vec![], vec![0], vec![0], vec![1, 2], vec![]],
        )
        .unwrap()
    }

    fn drain(s: &mut Scheduler<'_>) -> Vec<usize> {
        let mut out = Vec::new();
        while let Some(n) = s.next_ready() {
            out.push(n);
        }
        out
    }

    #[test]
    fn test_forward_waits_for_all_dependencies() {
        let graph = diamond();
        let mut s = Scheduler::new(&graph, Direction::Forward);

        assert_eq!(drain(&mut s), vec![0, 4]);
        assert_eq!(s.complete(0), vec![1, 2]);
        assert_eq!(drain(&mut s), vec![1, 2]);
        assert!(s.complete(1).is_empty());
        assert_eq!(s.complete(2), vec![3]);
        assert_eq!(s.next_ready(), Some(3));
        s.complete(3);
        assert!(!s.is_finished());
        s.complete(4);
        assert!(s.is_finished());
    }

    #[test]
    fn test_reverse_runs_dependents_first() {
        let graph = diamond();
        let mut s = Scheduler::new(&graph, Direction::Reverse);

        assert_eq!(drain(&mut s), vec![3, 4]);
        assert_eq!(s.complete(3), vec![1, 2]);
        assert_eq!(drain(&mut s), vec![1, 2]);
        assert!(s.complete(1).is_empty());
        assert!(!s.has_ready());
        assert_eq!(s.complete(2), vec![0]);
        assert_eq!(s.next_ready(), Some(0));
    }

    #[test]
    fn test_fail_blocks_transitive_successors_only() {
        let graph = diamond();
        let mut s = Scheduler::new(&graph, Direction::Forward);
        assert_eq!(drain(&mut s), vec![0, 4]);

        assert_eq!(s.fail(0), vec![1, 2, 3]);
        assert_eq!(s.next_ready(), None);
        s.complete(4);
        assert!(s.is_finished());
    }

    #[test]
    fn test_fail_after_sibling_completed() {
        let graph = diamond();
        let mut s = Scheduler::new(&graph, Direction::Forward);
        drain(&mut s);
        s.complete(0);
        drain(&mut s);
        s.complete(1);
        // d still waits on c; c failing must block it
        assert_eq!(s.fail(2), vec![3]);
        assert_eq!(s.next_ready(), None);
    }

    #[test]
    fn test_cancel_pending_leaves_running_alone() {
        let graph = diamond();
        let mut s = Scheduler::new(&graph, Direction::Forward);
        assert_eq!(s.next_ready(), Some(0));
        assert_eq!(s.cancel_pending(), vec![1, 2, 3, 4]);
        assert!(!s.is_finished());
        s.complete(0);
        assert_eq!(s.next_ready(), None);
        assert!(s.is_finished());
    }

    #[test]
    fn test_selection_excludes_nodes() {
        let graph = diamond();
        let selected = [true, true, false, false, false];
        let mut s = Scheduler::with_selection(&graph, Direction::Forward, &selected);
        assert_eq!(drain(&mut s), vec![0]);
        assert_eq!(s.complete(0), vec![1]);
        assert_eq!(s.next_ready(), Some(1));
        s.complete(1);
        assert!(s.is_finished());
    }

    #[test]
    fn test_waves() {
        let graph = diamond();
        assert_eq!(
            Scheduler::waves(&graph, Direction::Forward),
            vec![vec![0, 4], vec![1, 2], vec![3]]
        );
        assert_eq!(
            Scheduler::waves(&graph, Direction::Reverse),
            vec![vec![3, 4], vec![1, 2], vec![0]]
        );
    }
}
