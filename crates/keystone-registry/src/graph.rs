//! Dependency graph over an index arena. Edges point from a dependency to its dependent.

use keystone_core::{Error, Manifest, NodeId, Result};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::Direction;
use std::collections::{HashMap, HashSet, VecDeque};

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    graph: StableDiGraph<NodeId, ()>,
    index: HashMap<NodeId, NodeIndex>,
    /// Topological order, ties broken by (depth, id).
    order: Vec<NodeId>,
    depth: HashMap<NodeId, usize>,
}

impl DependencyGraph {
    /// Build and sort the graph. Fails on unknown dependencies or the first cycle found.
    pub fn build<'a>(manifests: impl IntoIterator<Item = &'a Manifest>) -> Result<Self> {
        let manifests: Vec<&Manifest> = manifests.into_iter().collect();
        let mut graph = StableDiGraph::new();
        let mut index = HashMap::with_capacity(manifests.len());
        for m in &manifests {
            let idx = graph.add_node(m.id.clone());
            index.insert(m.id.clone(), idx);
        }
        for m in &manifests {
            let to = index[&m.id];
            for dep in &m.dependencies {
                let from = *index.get(dep).ok_or_else(|| {
                    Error::validation(m.id.as_str(), format!("unknown dependency '{}'", dep))
                })?;
                graph.add_edge(from, to, ());
            }
        }

        let sorted = petgraph::algo::toposort(&graph, None).map_err(|cycle| Error::Cycle {
            cycle: cycle_path(&graph, cycle.node_id()),
        })?;

        let mut depth: HashMap<NodeId, usize> = HashMap::with_capacity(sorted.len());
        for idx in &sorted {
            let d = graph
                .neighbors_directed(*idx, Direction::Incoming)
                .map(|dep| depth[&graph[dep]] + 1)
                .max()
                .unwrap_or(0);
            depth.insert(graph[*idx].clone(), d);
        }
        let mut order: Vec<NodeId> = sorted.iter().map(|i| graph[*i].clone()).collect();
        order.sort_by(|a, b| depth[a].cmp(&depth[b]).then_with(|| a.cmp(b)));

        Ok(Self {
            graph,
            index,
            order,
            depth,
        })
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.index.contains_key(id)
    }

    pub fn topological_order(&self) -> &[NodeId] {
        &self.order
    }

    /// Longest dependency chain below the node; roots have depth 0.
    pub fn depth(&self, id: &NodeId) -> Option<usize> {
        self.depth.get(id).copied()
    }

    /// Direct dependencies, sorted by id.
    pub fn dependencies_of(&self, id: &NodeId) -> Result<Vec<NodeId>> {
        self.neighbors(id, Direction::Incoming)
    }

    /// Direct dependents, sorted by id.
    pub fn direct_dependents_of(&self, id: &NodeId) -> Result<Vec<NodeId>> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Transitive closure of nodes depending on `id`, ordered by depth ascending.
    pub fn dependents_of(&self, id: &NodeId) -> Result<Vec<NodeId>> {
        let start = *self
            .index
            .get(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([start]);
        while let Some(idx) = queue.pop_front() {
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        let mut out: Vec<NodeId> = seen.into_iter().map(|i| self.graph[i].clone()).collect();
        self.sort_by_depth(&mut out);
        Ok(out)
    }

    /// Sort ids into topological order: depth ascending, then id.
    pub fn sort_by_depth(&self, ids: &mut [NodeId]) {
        ids.sort_by(|a, b| {
            let da = self.depth.get(a).copied().unwrap_or(usize::MAX);
            let db = self.depth.get(b).copied().unwrap_or(usize::MAX);
            da.cmp(&db).then_with(|| a.cmp(b))
        });
    }

    fn neighbors(&self, id: &NodeId, dir: Direction) -> Result<Vec<NodeId>> {
        let idx = *self
            .index
            .get(id)
            .ok_or_else(|| Error::NotFound(id.clone()))?;
        let mut out: Vec<NodeId> = self
            .graph
            .neighbors_directed(idx, dir)
            .map(|i| self.graph[i].clone())
            .collect();
        out.sort();
        out.dedup();
        Ok(out)
    }
}

/// Recover one cycle through `start`, in "depends on" direction, closed on `start`.
fn cycle_path(graph: &StableDiGraph<NodeId, ()>, start: NodeIndex) -> Vec<NodeId> {
    let mut parent: HashMap<NodeIndex, NodeIndex> = HashMap::new();
    let mut queue = VecDeque::from([start]);
    let mut seen = HashSet::from([start]);
    let mut last = None;

    'search: while let Some(idx) = queue.pop_front() {
        let mut deps: Vec<NodeIndex> = graph.neighbors_directed(idx, Direction::Incoming).collect();
        deps.sort_by(|a, b| graph[*a].cmp(&graph[*b]));
        for dep in deps {
            if dep == start {
                last = Some(idx);
                break 'search;
            }
            if seen.insert(dep) {
                parent.insert(dep, idx);
                queue.push_back(dep);
            }
        }
    }

    let Some(mut cur) = last else {
        return vec![graph[start].clone()];
    };
    let mut chain = Vec::new();
    while cur != start {
        chain.push(graph[cur].clone());
        cur = parent[&cur];
    }
    chain.reverse();

    let mut path = Vec::with_capacity(chain.len() + 2);
    path.push(graph[start].clone());
    path.extend(chain);
    path.push(graph[start].clone());
    path
}
