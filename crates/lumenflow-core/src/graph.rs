//! The dependency graph (C6): topological sort, critical path, impact
//! score, bottleneck ranking, cycle detection, orphan-reference
//! detection. Grounded on the teacher's dependency-resolution pass in
//! `shipper/src/cargo.rs` (building an in-memory graph from parsed
//! manifests, then walking it), generalised from Cargo's single
//! dependency edge to WU's `blocks`/`blocked_by` pair.
//!
//! Edge-direction note (spec.md §3.1 I4): `blocked_by[x] = p` encodes the
//! edge `p -> x` ("x depends on p"). `blocks`/`blocked_by` are not
//! required to be stored symmetrically, so every ranking algorithm below
//! (topo sort, critical path, impact score, bottlenecks) derives edges
//! from `blocked_by` alone and computes successors via a reverse lookup
//! rather than trusting the `blocks` field directly. Cycle detection
//! (I5) is the exception: it must catch a cycle introduced by either
//! field, so it walks the union of edges derived from both, over the
//! full node set rather than just the active subgraph.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use lumenflow_types::{LumenError, Status, WorkUnit, WuId};

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub wu: WorkUnit,
}

/// The full WU graph, built once per command invocation from every
/// `WU-*.yaml` file in `wu_dir`. Invalid files are skipped non-fatally
/// (spec.md §4.5), matching `lumenflow_yaml::scan_wu_dir`'s contract.
#[derive(Debug, Clone, Default)]
pub struct Graph {
    pub nodes: BTreeMap<WuId, GraphNode>,
}

/// Result of a topological sort over the active subgraph.
#[derive(Debug, Clone, Default)]
pub struct TopoSortResult {
    pub order: Vec<WuId>,
    pub cycle_nodes: Vec<WuId>,
    pub warning: Option<String>,
}

impl Graph {
    pub fn build(wu_dir: &Path) -> Result<Graph, LumenError> {
        let mut nodes = BTreeMap::new();
        for entry in lumenflow_yaml::scan_wu_dir(wu_dir)? {
            if let Ok(wu) = entry.result {
                nodes.insert(wu.id, GraphNode { wu });
            }
        }
        Ok(Graph { nodes })
    }

    /// Every node whose status has not reached `done` (after normalizing
    /// the legacy `completed` alias, spec.md §3.1).
    pub fn active_subgraph(&self) -> BTreeSet<WuId> {
        self.nodes
            .iter()
            .filter(|(_, n)| n.wu.status.normalize() != Status::Done)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Predecessors of `id` as declared by `blocked_by`, restricted to
    /// nodes actually present in the graph (spec.md I3: dangling
    /// references are reported separately, not treated as edges).
    fn predecessors(&self, id: WuId) -> Vec<WuId> {
        self.nodes
            .get(&id)
            .map(|n| n.wu.blocked_by.iter().copied().filter(|p| self.nodes.contains_key(p)).collect())
            .unwrap_or_default()
    }

    /// Reverse lookup: every node whose `blocked_by` names `id` — i.e.
    /// `id`'s successors, computed authoritatively from `blocked_by`
    /// rather than trusting each node's own `blocks` field.
    fn successors_via_blocked_by(&self) -> HashMap<WuId, Vec<WuId>> {
        let mut succ: HashMap<WuId, Vec<WuId>> = HashMap::new();
        for (id, node) in &self.nodes {
            for pred in &node.wu.blocked_by {
                succ.entry(*pred).or_default().push(*id);
            }
        }
        succ
    }

    /// Kahn's algorithm over the active subgraph. The ready queue is a
    /// `BTreeSet` so ties break on numeric id, giving a deterministic
    /// order run to run. A residual cycle within the active subgraph is
    /// reported via `cycle_nodes`/`warning` rather than failing outright
    /// — callers still get a best-effort partial order for the acyclic
    /// remainder.
    pub fn topo_sort(&self) -> TopoSortResult {
        let active = self.active_subgraph();
        let mut in_degree: BTreeMap<WuId, usize> = BTreeMap::new();
        for id in &active {
            let deg = self.predecessors(*id).iter().filter(|p| active.contains(p)).count();
            in_degree.insert(*id, deg);
        }

        let succ = self.successors_via_blocked_by();
        let mut ready: BTreeSet<WuId> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(id, _)| *id)
            .collect();

        let mut order = Vec::new();
        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            order.push(next);
            if let Some(successors) = succ.get(&next) {
                for &s in successors {
                    if let Some(deg) = in_degree.get_mut(&s) {
                        *deg -= 1;
                        if *deg == 0 {
                            ready.insert(s);
                        }
                    }
                }
            }
        }

        if order.len() == active.len() {
            TopoSortResult { order, cycle_nodes: Vec::new(), warning: None }
        } else {
            let cycle_nodes: Vec<WuId> = active.difference(&order.iter().copied().collect()).copied().collect();
            TopoSortResult {
                order,
                warning: Some(format!(
                    "{} active work unit(s) could not be ordered: a dependency cycle exists among {:?}",
                    cycle_nodes.len(),
                    cycle_nodes
                )),
                cycle_nodes,
            }
        }
    }

    /// Longest path (by node count) through the active subgraph, walked
    /// in topological order so each node's distance is final once
    /// visited. Returns the path of ids achieving the maximum length.
    pub fn critical_path(&self) -> Vec<WuId> {
        let topo = self.topo_sort();
        let mut dist: HashMap<WuId, usize> = HashMap::new();
        let mut prev: HashMap<WuId, WuId> = HashMap::new();
        let succ = self.successors_via_blocked_by();

        for &id in &topo.order {
            dist.entry(id).or_insert(1);
            let current = dist[&id];
            if let Some(successors) = succ.get(&id) {
                for &s in successors {
                    if !topo.order.contains(&s) {
                        continue;
                    }
                    if current + 1 > *dist.get(&s).unwrap_or(&1) {
                        dist.insert(s, current + 1);
                        prev.insert(s, id);
                    }
                }
            }
        }

        let Some((&end, _)) = dist.iter().max_by_key(|(_, d)| **d) else {
            return Vec::new();
        };
        let mut path = vec![end];
        let mut cursor = end;
        while let Some(&p) = prev.get(&cursor) {
            path.push(p);
            cursor = p;
        }
        path.reverse();
        path
    }

    /// Number of distinct active nodes transitively unblocked by
    /// completing `id` — a BFS over `blocked_by`-derived successors.
    pub fn impact_score(&self, id: WuId) -> usize {
        let succ = self.successors_via_blocked_by();
        let mut visited: HashSet<WuId> = HashSet::new();
        let mut queue = std::collections::VecDeque::new();
        if let Some(direct) = succ.get(&id) {
            queue.extend(direct.iter().copied());
        }
        while let Some(next) = queue.pop_front() {
            if !visited.insert(next) {
                continue;
            }
            if let Some(further) = succ.get(&next) {
                queue.extend(further.iter().copied());
            }
        }
        visited.len()
    }

    /// Top `limit` active nodes by impact score, highest first; ties
    /// break on id for determinism.
    pub fn bottlenecks(&self, limit: usize) -> Vec<(WuId, usize)> {
        let mut scored: Vec<(WuId, usize)> = self
            .active_subgraph()
            .into_iter()
            .map(|id| (id, self.impact_score(id)))
            .collect();
        scored.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(limit);
        scored
    }

    /// DFS white/grey/black cycle detection over the union of edges
    /// derived from both `blocks` and `blocked_by`, across every node
    /// (not just the active subgraph) — spec.md I5.
    pub fn detect_cycle(&self) -> Option<Vec<WuId>> {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Color {
            White,
            Grey,
            Black,
        }

        let edges = self.union_edges();
        let mut color: HashMap<WuId, Color> = self.nodes.keys().map(|id| (*id, Color::White)).collect();
        let mut stack: Vec<WuId> = Vec::new();

        fn visit(
            id: WuId,
            edges: &HashMap<WuId, Vec<WuId>>,
            color: &mut HashMap<WuId, Color>,
            stack: &mut Vec<WuId>,
        ) -> Option<Vec<WuId>> {
            color.insert(id, Color::Grey);
            stack.push(id);
            if let Some(next_nodes) = edges.get(&id) {
                for &next in next_nodes {
                    match color.get(&next).copied().unwrap_or(Color::White) {
                        Color::White => {
                            if let Some(cycle) = visit(next, edges, color, stack) {
                                return Some(cycle);
                            }
                        }
                        Color::Grey => {
                            let start = stack.iter().position(|n| *n == next).unwrap_or(0);
                            let mut cycle = stack[start..].to_vec();
                            cycle.push(next);
                            return Some(cycle);
                        }
                        Color::Black => {}
                    }
                }
            }
            stack.pop();
            color.insert(id, Color::Black);
            None
        }

        let ids: Vec<WuId> = self.nodes.keys().copied().collect();
        for id in ids {
            if color.get(&id).copied() == Some(Color::White) {
                if let Some(cycle) = visit(id, &edges, &mut color, &mut stack) {
                    return Some(cycle);
                }
            }
        }
        None
    }

    fn union_edges(&self) -> HashMap<WuId, Vec<WuId>> {
        let mut edges: HashMap<WuId, Vec<WuId>> = HashMap::new();
        for (id, node) in &self.nodes {
            for &pred in &node.wu.blocked_by {
                if self.nodes.contains_key(&pred) {
                    edges.entry(pred).or_default().push(*id);
                }
            }
            for &succ in &node.wu.blocks {
                if self.nodes.contains_key(&succ) {
                    edges.entry(*id).or_default().push(succ);
                }
            }
        }
        edges
    }

    /// Every `blocks`/`blocked_by` reference pointing at a WU id absent
    /// from the graph (spec.md I3).
    pub fn detect_orphans(&self) -> Vec<(WuId, WuId)> {
        let mut orphans = Vec::new();
        for (id, node) in &self.nodes {
            for &target in node.wu.blocks.iter().chain(node.wu.blocked_by.iter()) {
                if !self.nodes.contains_key(&target) {
                    orphans.push((*id, target));
                }
            }
        }
        orphans
    }
}
