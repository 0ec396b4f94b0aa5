// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Directed dependency graph over in-flight transactions. An edge `u -> v`
//! means v must serialize after u; cascade edges (write-write, write-read)
//! additionally propagate aborts to dependents, read-write edges only order
//! commits. A single inner lock makes every operation linearizable, and the
//! cycle check is an exact reachability walk, never an approximation.

use crate::{counters, op_log::LogInfo, types::TxnId};
use claims::assert_some;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, trace};

#[derive(Default)]
struct Node {
    committed: bool,
    needs_abort: bool,
    /// Edge maps carry the cascade flag; a cascade edge between the same
    /// pair of nodes subsumes a read-write one.
    in_edges: HashMap<TxnId, bool>,
    out_edges: HashMap<TxnId, bool>,
}

#[derive(Default)]
struct GraphInner {
    nodes: HashMap<TxnId, Node>,
}

impl GraphInner {
    /// Exact reachability over out-edges, iterative so deep graphs cannot
    /// blow the stack.
    fn reaches(&self, start: TxnId, target: TxnId) -> bool {
        let mut stack = vec![start];
        let mut visited = HashSet::new();
        while let Some(current) = stack.pop() {
            if current == target {
                return true;
            }
            if !visited.insert(current) {
                continue;
            }
            if let Some(node) = self.nodes.get(&current) {
                stack.extend(node.out_edges.keys().copied());
            }
        }
        false
    }

    fn detach(&mut self, txn: TxnId, node: &Node) {
        for succ in node.out_edges.keys() {
            if let Some(s) = self.nodes.get_mut(succ) {
                s.in_edges.remove(&txn);
            }
        }
        for pred in node.in_edges.keys() {
            if let Some(p) = self.nodes.get_mut(pred) {
                p.out_edges.remove(&txn);
            }
        }
    }
}

pub(crate) struct SerializationGraph {
    inner: Mutex<GraphInner>,
    #[cfg(feature = "op-log")]
    op_log: crate::op_log::OpLog,
}

impl SerializationGraph {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(GraphInner::default()),
            #[cfg(feature = "op-log")]
            op_log: crate::op_log::OpLog::new(),
        }
    }

    /// Registers a freshly started transaction.
    pub(crate) fn create_node(&self, txn: TxnId) {
        let previous = self.inner.lock().nodes.insert(txn, Node::default());
        debug_assert!(previous.is_none(), "node {} registered twice", txn);
    }

    /// Adds `from -> to` and reports whether the graph stays acyclic.
    /// Edges from finished (absent) or committed predecessors are no-ops:
    /// their serialization point already passed.
    pub(crate) fn insert_and_check(&self, from: TxnId, to: TxnId, cascade: bool) -> bool {
        if from == to {
            return true;
        }
        let mut inner = self.inner.lock();
        match inner.nodes.get(&from) {
            None => return true,
            Some(node) if node.committed => return true,
            Some(_) => {},
        }
        debug_assert!(inner.nodes.contains_key(&to), "edge target {} not registered", to);
        // The new edge closes a cycle exactly when `from` is already
        // reachable from `to`.
        if inner.reaches(to, from) {
            counters::CYCLE_DETECTED_COUNT.inc();
            debug!(from, to, cascade, "dependency cycle detected");
            return false;
        }
        if let Some(node) = inner.nodes.get_mut(&from) {
            let flag = node.out_edges.entry(to).or_insert(false);
            *flag |= cascade;
        }
        if let Some(node) = inner.nodes.get_mut(&to) {
            let flag = node.in_edges.entry(from).or_insert(false);
            *flag |= cascade;
        }
        true
    }

    /// True when a cascading predecessor abort marked this transaction.
    pub(crate) fn needs_abort(&self, txn: TxnId) -> bool {
        self.inner
            .lock()
            .nodes
            .get(&txn)
            .map_or(false, |node| node.needs_abort)
    }

    /// True once `txn` reached its commit point. Absent nodes count as
    /// committed: finished transactions are unlinked, and an aborted
    /// predecessor would have cascaded before unlinking.
    pub(crate) fn is_committed(&self, txn: TxnId) -> bool {
        self.inner
            .lock()
            .nodes
            .get(&txn)
            .map_or(true, |node| node.committed)
    }

    /// True iff every 1-hop predecessor reached its commit point; by
    /// induction the whole ancestor set has then committed.
    pub(crate) fn check_committed(&self, txn: TxnId) -> bool {
        let inner = self.inner.lock();
        let Some(node) = inner.nodes.get(&txn) else {
            debug_assert!(false, "commit check for unregistered node {}", txn);
            return false;
        };
        if node.needs_abort {
            return false;
        }
        node.in_edges
            .keys()
            .all(|pred| inner.nodes.get(pred).map_or(true, |p| p.committed))
    }

    /// Marks the commit point. The node stays linked until
    /// [`finalize_commit`] so concurrent edge inserts still resolve.
    pub(crate) fn mark_committed(&self, txn: TxnId) {
        if let Some(node) = self.inner.lock().nodes.get_mut(&txn) {
            node.committed = true;
        }
    }

    /// Unlinks a committed node; successors observe the predecessor as
    /// finished from here on.
    pub(crate) fn finalize_commit(&self, txn: TxnId) {
        let mut inner = self.inner.lock();
        let node = assert_some!(inner.nodes.remove(&txn), "committed node must be registered");
        debug_assert!(node.committed);
        inner.detach(txn, &node);
    }

    /// Cascade-aborts every dependent reachable over cascade edges,
    /// collecting the victims into `abort_set`, then unlinks the aborting
    /// node. Victims run their own undo when they observe the mark.
    pub(crate) fn abort(&self, txn: TxnId, abort_set: &mut HashSet<TxnId>) {
        let mut inner = self.inner.lock();
        let Some(node) = inner.nodes.remove(&txn) else {
            return;
        };

        let mut queue: VecDeque<TxnId> = node
            .out_edges
            .iter()
            .filter(|(_, cascade)| **cascade)
            .map(|(succ, _)| *succ)
            .collect();
        while let Some(victim) = queue.pop_front() {
            if let Some(v) = inner.nodes.get_mut(&victim) {
                // Cascades stop at commit points.
                if v.committed || v.needs_abort {
                    continue;
                }
                v.needs_abort = true;
                abort_set.insert(victim);
                counters::CASCADE_ABORT_COUNT.inc();
                trace!(victim, by = txn, "cascading abort");
                queue.extend(
                    v.out_edges
                        .iter()
                        .filter(|(_, cascade)| **cascade)
                        .map(|(succ, _)| *succ),
                );
            }
        }

        inner.detach(txn, &node);
    }

    #[cfg(feature = "op-log")]
    pub(crate) fn log(&self, info: LogInfo) {
        self.op_log.append(info);
    }

    #[cfg(not(feature = "op-log"))]
    pub(crate) fn log(&self, _info: LogInfo) {}

    #[cfg(feature = "op-log")]
    pub(crate) fn take_log(&self) -> Vec<LogInfo> {
        self.op_log.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_two_node_cycle() {
        let graph = SerializationGraph::new();
        graph.create_node(1);
        graph.create_node(2);
        assert!(graph.insert_and_check(1, 2, true));
        assert!(!graph.insert_and_check(2, 1, false));
    }

    #[test]
    fn detects_transitive_cycle() {
        let graph = SerializationGraph::new();
        for txn in 1..=3 {
            graph.create_node(txn);
        }
        assert!(graph.insert_and_check(1, 2, false));
        assert!(graph.insert_and_check(2, 3, true));
        assert!(!graph.insert_and_check(3, 1, true));
        // The failed edge was not installed; the DAG is still extendable.
        assert!(graph.insert_and_check(1, 3, false));
    }

    #[test]
    fn duplicate_edges_and_self_edges_are_noops() {
        let graph = SerializationGraph::new();
        graph.create_node(1);
        graph.create_node(2);
        assert!(graph.insert_and_check(1, 1, true));
        assert!(graph.insert_and_check(1, 2, false));
        assert!(graph.insert_and_check(1, 2, true));
        assert!(!graph.insert_and_check(2, 1, false));
    }

    #[test]
    fn commit_gate_requires_committed_predecessors() {
        let graph = SerializationGraph::new();
        graph.create_node(1);
        graph.create_node(2);
        assert!(graph.insert_and_check(1, 2, true));

        assert!(graph.check_committed(1));
        assert!(!graph.check_committed(2));

        graph.mark_committed(1);
        assert!(graph.check_committed(2));
        graph.finalize_commit(1);
        assert!(graph.is_committed(1));
        assert!(graph.check_committed(2));
    }

    #[test]
    fn abort_cascades_only_over_cascade_edges() {
        let graph = SerializationGraph::new();
        for txn in 1..=4 {
            graph.create_node(txn);
        }
        assert!(graph.insert_and_check(1, 2, true));
        assert!(graph.insert_and_check(2, 3, true));
        assert!(graph.insert_and_check(1, 4, false));

        let mut victims = HashSet::new();
        graph.abort(1, &mut victims);
        assert_eq!(victims, HashSet::from([2, 3]));
        assert!(graph.needs_abort(2));
        assert!(graph.needs_abort(3));
        assert!(!graph.needs_abort(4));
        // The read-write successor lost its predecessor and may commit.
        assert!(graph.check_committed(4));
    }

    #[test]
    fn committed_nodes_stop_cascades() {
        let graph = SerializationGraph::new();
        for txn in 1..=3 {
            graph.create_node(txn);
        }
        assert!(graph.insert_and_check(1, 2, true));
        assert!(graph.insert_and_check(2, 3, true));
        graph.mark_committed(2);

        let mut victims = HashSet::new();
        graph.abort(1, &mut victims);
        assert!(victims.is_empty());
        assert!(!graph.needs_abort(3));
    }
}
