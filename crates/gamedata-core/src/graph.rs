use serde::{Deserialize, Serialize};
use slotmap::{SecondaryMap, SlotMap, new_key_type};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

new_key_type! {
    /// Identifies a table node in the dependency graph.
    pub struct TableNodeId;
}

// ---------------------------------------------------------------------------
// Core data structures
// ---------------------------------------------------------------------------

/// Per-node data stored in the dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableNode {
    /// Table name.
    pub name: String,
    /// Order in which the table was first added. Used to break ties.
    pub position: usize,
}

/// Adjacency for one node.
#[derive(Debug, Clone, Default)]
struct NodeAdjacency {
    /// Tables this node must load after.
    dependencies: Vec<TableNodeId>,
    /// Tables that must load after this node.
    dependents: Vec<TableNodeId>,
}

/// A computed load order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOrder {
    /// Every table, dependencies first. Members of a cycle are contiguous.
    pub order: Vec<String>,
    /// Groups of tables that reference each other, in emitted order.
    pub cycles: Vec<Vec<String>>,
}

// ---------------------------------------------------------------------------
// DependencyGraph
// ---------------------------------------------------------------------------

/// Directed graph of "table A must load after table B" relations with a
/// cached, cycle-tolerant load order.
///
/// The order is computed by condensing strongly connected components
/// (Tarjan) and running Kahn's algorithm over the condensed graph. Ready
/// components are emitted lowest insertion position first, so independent
/// tables keep the order they were added in.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    nodes: SlotMap<TableNodeId, TableNode>,
    adjacency: SecondaryMap<TableNodeId, NodeAdjacency>,
    by_name: HashMap<String, TableNodeId>,
    edge_count: usize,

    /// Cached order. Recomputed lazily when `dirty` is true.
    order_cache: LoadOrder,
    dirty: bool,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self {
            dirty: true,
            ..Self::default()
        }
    }

    /// Add a table if not already present. Returns its node id.
    pub fn add_table(&mut self, name: &str) -> TableNodeId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = self.nodes.insert(TableNode {
            name: name.to_string(),
            position: self.nodes.len(),
        });
        self.adjacency.insert(id, NodeAdjacency::default());
        self.by_name.insert(name.to_string(), id);
        self.dirty = true;
        id
    }

    /// Record that `dependent` must load after `dependency`. Both tables are
    /// added if missing. Duplicate edges are ignored.
    pub fn add_dependency(&mut self, dependent: &str, dependency: &str) {
        let from = self.add_table(dependency);
        let to = self.add_table(dependent);
        let exists = self
            .adjacency
            .get(to)
            .map(|adj| adj.dependencies.contains(&from))
            .unwrap_or(false);
        if exists {
            return;
        }
        if let Some(adj) = self.adjacency.get_mut(to) {
            adj.dependencies.push(from);
        }
        if let Some(adj) = self.adjacency.get_mut(from) {
            adj.dependents.push(to);
        }
        self.edge_count += 1;
        self.dirty = true;
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn node_id(&self, name: &str) -> Option<TableNodeId> {
        self.by_name.get(name).copied()
    }

    pub fn get_node(&self, id: TableNodeId) -> Option<&TableNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Names of the tables `name` depends on.
    pub fn dependencies_of(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, |adj| &adj.dependencies)
    }

    /// Names of the tables that depend on `name`.
    pub fn dependents_of(&self, name: &str) -> Vec<&str> {
        self.neighbours(name, |adj| &adj.dependents)
    }

    fn neighbours<F>(&self, name: &str, pick: F) -> Vec<&str>
    where
        F: Fn(&NodeAdjacency) -> &Vec<TableNodeId>,
    {
        self.node_id(name)
            .and_then(|id| self.adjacency.get(id))
            .map(|adj| {
                pick(adj)
                    .iter()
                    .filter_map(|&n| self.nodes.get(n).map(|node| node.name.as_str()))
                    .collect()
            })
            .unwrap_or_default()
    }

    // -----------------------------------------------------------------------
    // Load order
    // -----------------------------------------------------------------------

    /// The cached load order, recomputing if the graph changed.
    pub fn load_order(&mut self) -> &LoadOrder {
        if self.dirty {
            self.order_cache = self.compute_load_order();
            self.dirty = false;
        }
        &self.order_cache
    }

    fn compute_load_order(&self) -> LoadOrder {
        let components = self.strongly_connected_components();

        let mut component_of: SecondaryMap<TableNodeId, usize> = SecondaryMap::new();
        for (idx, members) in components.iter().enumerate() {
            for &node in members {
                component_of.insert(node, idx);
            }
        }

        // Rank each component by its earliest member.
        let rank: Vec<usize> = components
            .iter()
            .map(|members| {
                members
                    .iter()
                    .filter_map(|&n| self.nodes.get(n).map(|node| node.position))
                    .min()
                    .unwrap_or(usize::MAX)
            })
            .collect();

        // Condensed edges: dependency component -> dependent component.
        let mut in_degree = vec![0usize; components.len()];
        let mut successors: Vec<HashSet<usize>> = vec![HashSet::new(); components.len()];
        for (node, adj) in &self.adjacency {
            let Some(&from) = component_of.get(node) else {
                continue;
            };
            for &dependent in &adj.dependents {
                if let Some(&to) = component_of.get(dependent)
                    && to != from
                    && successors[from].insert(to)
                {
                    in_degree[to] += 1;
                }
            }
        }

        // Kahn's algorithm, lowest rank first.
        let mut ready: BinaryHeap<Reverse<(usize, usize)>> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(idx, _)| Reverse((rank[idx], idx)))
            .collect();

        let mut result = LoadOrder::default();
        while let Some(Reverse((_, idx))) = ready.pop() {
            let mut members: Vec<&TableNode> = components[idx]
                .iter()
                .filter_map(|&n| self.nodes.get(n))
                .collect();
            members.sort_by_key(|node| node.position);
            let names: Vec<String> = members.iter().map(|node| node.name.clone()).collect();

            if names.len() > 1 {
                result.cycles.push(names.clone());
            }
            result.order.extend(names);

            for &next in &successors[idx] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push(Reverse((rank[next], next)));
                }
            }
        }

        result
    }

    /// Tarjan's algorithm. Components are returned in discovery order; the
    /// order inside each component is unspecified.
    fn strongly_connected_components(&self) -> Vec<Vec<TableNodeId>> {
        struct Frame {
            node: TableNodeId,
            dependents: Vec<TableNodeId>,
            next: usize,
        }

        struct Tarjan<'g> {
            graph: &'g DependencyGraph,
            index: usize,
            indices: SecondaryMap<TableNodeId, usize>,
            lowlink: SecondaryMap<TableNodeId, usize>,
            on_stack: HashSet<TableNodeId>,
            stack: Vec<TableNodeId>,
            components: Vec<Vec<TableNodeId>>,
        }

        impl Tarjan<'_> {
            fn enter(&mut self, node: TableNodeId, frames: &mut Vec<Frame>) {
                self.indices.insert(node, self.index);
                self.lowlink.insert(node, self.index);
                self.index += 1;
                self.stack.push(node);
                self.on_stack.insert(node);

                let dependents = self
                    .graph
                    .adjacency
                    .get(node)
                    .map(|adj| adj.dependents.clone())
                    .unwrap_or_default();
                frames.push(Frame {
                    node,
                    dependents,
                    next: 0,
                });
            }

            /// Depth-first from `root` with an explicit frame stack, so chain
            /// length is not bounded by the thread's stack size.
            fn visit(&mut self, root: TableNodeId) {
                let mut frames = Vec::new();
                self.enter(root, &mut frames);

                while let Some(frame) = frames.last_mut() {
                    let node = frame.node;
                    let next = frame.dependents.get(frame.next).copied();
                    frame.next += 1;

                    if let Some(next) = next {
                        if !self.indices.contains_key(next) {
                            self.enter(next, &mut frames);
                        } else if self.on_stack.contains(&next) {
                            let low = self.lowlink[node].min(self.indices[next]);
                            self.lowlink.insert(node, low);
                        }
                        continue;
                    }

                    frames.pop();
                    if let Some(parent) = frames.last() {
                        let low = self.lowlink[parent.node].min(self.lowlink[node]);
                        self.lowlink.insert(parent.node, low);
                    }

                    if self.lowlink[node] == self.indices[node] {
                        let mut component = Vec::new();
                        while let Some(member) = self.stack.pop() {
                            self.on_stack.remove(&member);
                            component.push(member);
                            if member == node {
                                break;
                            }
                        }
                        self.components.push(component);
                    }
                }
            }
        }

        let mut tarjan = Tarjan {
            graph: self,
            index: 0,
            indices: SecondaryMap::new(),
            lowlink: SecondaryMap::new(),
            on_stack: HashSet::new(),
            stack: Vec::new(),
            components: Vec::new(),
        };

        let mut roots: Vec<(usize, TableNodeId)> = self
            .nodes
            .iter()
            .map(|(id, node)| (node.position, id))
            .collect();
        roots.sort();
        for (_, id) in roots {
            if !tarjan.indices.contains_key(id) {
                tarjan.visit(id);
            }
        }

        tarjan.components
    }
}
