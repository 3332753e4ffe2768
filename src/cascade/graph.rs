// ============================================================================
// Dependency Graph
// ============================================================================
//
// Arena of transaction nodes with an index by id and an adjacency list of
// rollback precedence: an edge `a -> b` means `a` is rolled back before `b`.
// A dependent transaction always precedes the transaction it builds on.
//
// ============================================================================

use crate::core::{Result, TransactionId, TxError};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};

/// Answers which transactions build on a given one.
#[async_trait]
pub trait DependencySource: Send + Sync {
    async fn dependents_of(&self, transaction_id: TransactionId) -> Result<Vec<TransactionId>>;
}

/// Fixed dependency map, mostly for tests and offline planning.
#[derive(Debug, Clone, Default)]
pub struct StaticDependencies {
    dependents: HashMap<TransactionId, Vec<TransactionId>>,
}

impl StaticDependencies {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares that `dependent` builds on `upstream`.
    pub fn add(&mut self, upstream: TransactionId, dependent: TransactionId) -> &mut Self {
        let entry = self.dependents.entry(upstream).or_default();
        if !entry.contains(&dependent) {
            entry.push(dependent);
        }
        self
    }
}

#[async_trait]
impl DependencySource for StaticDependencies {
    async fn dependents_of(&self, transaction_id: TransactionId) -> Result<Vec<TransactionId>> {
        Ok(self
            .dependents
            .get(&transaction_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub id: TransactionId,
    /// BFS distance from the root.
    pub depth: usize,
}

#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<TransactionId, usize>,
    edges: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Graph holding only `root`.
    pub fn new(root: TransactionId) -> Self {
        let mut graph = Self {
            nodes: Vec::new(),
            index: HashMap::new(),
            edges: Vec::new(),
        };
        graph.add_node(root, 0);
        graph
    }

    /// Builds the graph breadth-first from `root`, following dependents.
    ///
    /// # Errors
    /// `DependencyCycle` when a transaction depends on itself, `Validation`
    /// when the graph is deeper than `max_depth`. Source errors pass through.
    pub async fn build(
        root: TransactionId,
        source: &dyn DependencySource,
        max_depth: usize,
    ) -> Result<Self> {
        let mut graph = Self::new(root);
        let mut queue = VecDeque::from([0_usize]);
        while let Some(current) = queue.pop_front() {
            let GraphNode { id, depth } = graph.nodes[current].clone();
            let dependents = source.dependents_of(id).await?;
            if dependents.is_empty() {
                continue;
            }
            if depth >= max_depth {
                return Err(TxError::Validation(format!(
                    "dependency graph of {} is deeper than {} levels",
                    root, max_depth
                )));
            }
            for dependent in dependents {
                let known = graph.index.contains_key(&dependent);
                let node = graph.add_node(dependent, depth + 1);
                graph.add_edge(dependent, id)?;
                if !known {
                    queue.push_back(node);
                }
            }
        }
        Ok(graph)
    }

    /// Adds `id` if absent and returns its arena index.
    pub fn add_node(&mut self, id: TransactionId, depth: usize) -> usize {
        if let Some(existing) = self.index.get(&id) {
            return *existing;
        }
        let index = self.nodes.len();
        self.nodes.push(GraphNode { id, depth });
        self.edges.push(Vec::new());
        self.index.insert(id, index);
        index
    }

    /// Records that `before` is rolled back before `after`.
    ///
    /// # Errors
    /// `DependencyCycle` for a self loop, `Validation` for an unknown node.
    pub fn add_edge(&mut self, before: TransactionId, after: TransactionId) -> Result<()> {
        if before == after {
            return Err(TxError::DependencyCycle {
                path: vec![before.to_string(), after.to_string()],
            });
        }
        let from = self.index_of(before)?;
        let to = self.index_of(after)?;
        if !self.edges[from].contains(&to) {
            self.edges[from].push(to);
        }
        Ok(())
    }

    fn index_of(&self, id: TransactionId) -> Result<usize> {
        self.index
            .get(&id)
            .copied()
            .ok_or_else(|| TxError::TransactionNotFound(id.to_string()))
    }

    pub fn root(&self) -> TransactionId {
        self.nodes[0].id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: TransactionId) -> bool {
        self.index.contains_key(&id)
    }

    pub fn node(&self, index: usize) -> Option<&GraphNode> {
        self.nodes.get(index)
    }

    pub fn node_ids(&self) -> Vec<TransactionId> {
        self.nodes.iter().map(|node| node.id).collect()
    }

    /// Transactions reachable from the root, the root excluded.
    pub fn dependent_count(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    /// Largest BFS distance from the root.
    pub fn depth(&self) -> usize {
        self.nodes.iter().map(|node| node.depth).max().unwrap_or(0)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.iter().map(Vec::len).sum()
    }

    /// Every cycle found by depth-first search, each as the exact path that
    /// closes it (first and last id equal).
    pub fn find_cycles(&self) -> Vec<Vec<TransactionId>> {
        let mut visited = vec![false; self.nodes.len()];
        let mut on_stack = vec![false; self.nodes.len()];
        let mut stack = Vec::new();
        let mut cycles = Vec::new();
        for start in 0..self.nodes.len() {
            if !visited[start] {
                self.visit(start, &mut visited, &mut on_stack, &mut stack, &mut cycles);
            }
        }
        cycles
    }

    fn visit(
        &self,
        node: usize,
        visited: &mut [bool],
        on_stack: &mut [bool],
        stack: &mut Vec<usize>,
        cycles: &mut Vec<Vec<TransactionId>>,
    ) {
        visited[node] = true;
        on_stack[node] = true;
        stack.push(node);

        for &next in &self.edges[node] {
            if on_stack[next] {
                if let Some(position) = stack.iter().position(|entry| *entry == next) {
                    let mut path: Vec<TransactionId> =
                        stack[position..].iter().map(|i| self.nodes[*i].id).collect();
                    path.push(self.nodes[next].id);
                    cycles.push(path);
                }
            } else if !visited[next] {
                self.visit(next, visited, on_stack, stack, cycles);
            }
        }

        stack.pop();
        on_stack[node] = false;
    }

    /// Kahn levels over the precedence edges. Level 0 holds transactions
    /// nothing else must precede; each following level only holds
    /// transactions whose predecessors are all in earlier levels. Nodes on
    /// or behind a cycle cannot be levelled and are returned separately,
    /// deepest first so the root stays last.
    pub fn levels(&self) -> (Vec<Vec<TransactionId>>, Vec<TransactionId>) {
        let mut in_degree = vec![0_usize; self.nodes.len()];
        for targets in &self.edges {
            for &to in targets {
                in_degree[to] += 1;
            }
        }

        let mut levels = Vec::new();
        let mut placed = vec![false; self.nodes.len()];
        let mut current: Vec<usize> = (0..self.nodes.len())
            .filter(|index| in_degree[*index] == 0)
            .collect();
        while !current.is_empty() {
            let mut next = Vec::new();
            for &node in &current {
                placed[node] = true;
                for &to in &self.edges[node] {
                    in_degree[to] -= 1;
                    if in_degree[to] == 0 {
                        next.push(to);
                    }
                }
            }
            levels.push(current.iter().map(|index| self.nodes[*index].id).collect());
            next.sort_unstable();
            current = next;
        }

        let mut unplaced: Vec<usize> = (0..self.nodes.len())
            .filter(|index| !placed[*index])
            .collect();
        unplaced.sort_by(|a, b| {
            self.nodes[*b]
                .depth
                .cmp(&self.nodes[*a].depth)
                .then(a.cmp(b))
        });
        let unplaced = unplaced
            .into_iter()
            .map(|index| self.nodes[index].id)
            .collect();
        (levels, unplaced)
    }
}
