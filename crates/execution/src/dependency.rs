//! Dependency resolution for tasks.
//!
//! A [`DependencyGraph`] is an immutable snapshot built once per scheduling
//! pass. Only hard edges constrain the order produced by
//! [`DependencyResolver::topological_sort`]; soft edges are carried for
//! reporting and never block a sort.

use conductor_core::{DependencyKind, Task, TaskId, TaskPriority};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use thiserror::Error;

/// Errors raised while building or sorting a dependency graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// An edge references a task that is not part of the graph.
    #[error("task {task} depends on unknown task {dependency}")]
    UnknownDependency {
        /// Task declaring the edge
        task: TaskId,
        /// Missing predecessor
        dependency: TaskId,
    },

    /// The same task id was supplied twice.
    #[error("task {0} appears more than once")]
    DuplicateTask(TaskId),

    /// Hard dependencies form a cycle.
    #[error("hard dependency cycle detected: {}", format_cycle(.cycle))]
    CycleDetected {
        /// Members of the cycle, each depending on the next
        cycle: Vec<TaskId>,
    },
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// A typed edge: `dependent` cannot start before `depends_on`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DependencyEdge {
    /// The waiting task
    pub dependent: TaskId,
    /// The predecessor
    pub depends_on: TaskId,
    /// Edge kind
    pub kind: DependencyKind,
}

impl DependencyEdge {
    /// Collect the edges declared on a set of tasks.
    pub fn from_tasks(tasks: &[Task]) -> Vec<DependencyEdge> {
        tasks
            .iter()
            .flat_map(|task| {
                task.dependencies.iter().map(move |dep| DependencyEdge {
                    dependent: task.id,
                    depends_on: dep.task_id,
                    kind: dep.kind,
                })
            })
            .collect()
    }
}

/// Whether a cycle blocks scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// Every edge is hard; no valid order exists.
    Hard,
    /// At least one edge is soft; the sort ignores it.
    Soft,
}

/// A cycle found by [`DependencyResolver::detect_cycles`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyCycle {
    /// Members in edge order; the last depends on the first.
    pub members: Vec<TaskId>,
    /// Hard or soft
    pub kind: CycleKind,
}

impl DependencyCycle {
    /// Whether this cycle makes a full ordering impossible.
    pub fn is_fatal(&self) -> bool {
        self.kind == CycleKind::Hard
    }
}

/// A dependency graph.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Nodes in submission order
    tasks: Vec<Task>,
    /// task id -> node index
    index: HashMap<TaskId, usize>,
    /// node -> [(dependency, kind)]
    dependencies: Vec<Vec<(usize, DependencyKind)>>,
    /// node -> [(dependent, kind)]
    dependents: Vec<Vec<(usize, DependencyKind)>>,
    edge_count: usize,
}

impl DependencyGraph {
    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the graph has no nodes.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Number of edges, hard and soft.
    pub fn edge_count(&self) -> usize {
        self.edge_count
    }

    /// Nodes in submission order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Look up a node.
    pub fn task(&self, id: TaskId) -> Option<&Task> {
        self.index.get(&id).map(|&i| &self.tasks[i])
    }

    /// Whether `id` is a node.
    pub fn contains(&self, id: TaskId) -> bool {
        self.index.contains_key(&id)
    }

    /// Hard predecessors of `id`.
    pub fn hard_dependencies_of(&self, id: TaskId) -> Vec<TaskId> {
        self.neighbours(&self.dependencies, id, Some(DependencyKind::Hard))
    }

    /// Tasks that depend on `id`, by any edge kind.
    pub fn dependents_of(&self, id: TaskId) -> Vec<TaskId> {
        self.neighbours(&self.dependents, id, None)
    }

    fn neighbours(
        &self,
        adjacency: &[Vec<(usize, DependencyKind)>],
        id: TaskId,
        kind: Option<DependencyKind>,
    ) -> Vec<TaskId> {
        let Some(&i) = self.index.get(&id) else {
            return Vec::new();
        };
        adjacency[i]
            .iter()
            .filter(|(_, k)| kind.map_or(true, |want| *k == want))
            .map(|&(j, _)| self.tasks[j].id)
            .collect()
    }

    fn has_hard_edge(&self, from: usize, to: usize) -> bool {
        self.dependencies[from]
            .iter()
            .any(|&(j, kind)| j == to && kind == DependencyKind::Hard)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Visit {
    Unvisited,
    OnStack,
    Done,
}

/// Builds dependency graphs, detects cycles and orders tasks.
#[derive(Debug, Clone, Copy, Default)]
pub struct DependencyResolver;

impl DependencyResolver {
    /// Create a new resolver.
    pub fn new() -> Self {
        Self
    }

    /// Build a graph from tasks and explicit edges.
    ///
    /// Task order is taken as submission order and drives the tie-break in
    /// [`Self::topological_sort`].
    pub fn build_graph(
        &self,
        tasks: Vec<Task>,
        edges: &[DependencyEdge],
    ) -> Result<DependencyGraph, GraphError> {
        let mut index = HashMap::with_capacity(tasks.len());
        for (i, task) in tasks.iter().enumerate() {
            if index.insert(task.id, i).is_some() {
                return Err(GraphError::DuplicateTask(task.id));
            }
        }

        let mut dependencies = vec![Vec::new(); tasks.len()];
        let mut dependents = vec![Vec::new(); tasks.len()];

        for edge in edges {
            let (Some(&from), Some(&to)) = (index.get(&edge.dependent), index.get(&edge.depends_on))
            else {
                let missing = if index.contains_key(&edge.dependent) {
                    edge.depends_on
                } else {
                    edge.dependent
                };
                return Err(GraphError::UnknownDependency {
                    task: edge.dependent,
                    dependency: missing,
                });
            };
            dependencies[from].push((to, edge.kind));
            dependents[to].push((from, edge.kind));
        }

        tracing::debug!(nodes = tasks.len(), edges = edges.len(), "built dependency graph");

        Ok(DependencyGraph {
            tasks,
            index,
            dependencies,
            dependents,
            edge_count: edges.len(),
        })
    }

    /// Build a graph using the dependencies declared on each task.
    pub fn build_from_tasks(&self, tasks: Vec<Task>) -> Result<DependencyGraph, GraphError> {
        let edges = DependencyEdge::from_tasks(&tasks);
        self.build_graph(tasks, &edges)
    }

    /// Report every cycle in the graph.
    ///
    /// Cycles made only of hard edges are reported as [`CycleKind::Hard`];
    /// cycles that need a soft edge to close are [`CycleKind::Soft`].
    pub fn detect_cycles(&self, graph: &DependencyGraph) -> Vec<DependencyCycle> {
        let mut cycles: Vec<DependencyCycle> = self
            .find_cycles(graph, false)
            .into_iter()
            .map(|members| DependencyCycle {
                members: members.iter().map(|&i| graph.tasks[i].id).collect(),
                kind: CycleKind::Hard,
            })
            .collect();

        for members in self.find_cycles(graph, true) {
            let all_hard = members
                .iter()
                .zip(members.iter().cycle().skip(1))
                .all(|(&from, &to)| graph.has_hard_edge(from, to));
            if all_hard {
                // Already reported by the hard-only pass.
                continue;
            }
            cycles.push(DependencyCycle {
                members: members.iter().map(|&i| graph.tasks[i].id).collect(),
                kind: CycleKind::Soft,
            });
        }

        if !cycles.is_empty() {
            tracing::debug!(cycles = cycles.len(), "dependency cycles detected");
        }
        cycles
    }

    /// Order tasks so each appears after all of its hard dependencies.
    ///
    /// Among simultaneously ready tasks, higher priority goes first, then
    /// earlier submission.
    pub fn topological_sort(&self, graph: &DependencyGraph) -> Result<Vec<TaskId>, GraphError> {
        self.topological_sort_by(graph, |task, position| {
            (Reverse(task.priority), position)
        })
    }

    /// Kahn's algorithm over hard edges with a caller-supplied tie-break.
    ///
    /// `key` receives each task and its submission position; among ready
    /// tasks the smallest key is emitted first. Keys must be unique per task
    /// for the result to be deterministic, which including the position
    /// guarantees.
    pub fn topological_sort_by<K, F>(
        &self,
        graph: &DependencyGraph,
        key: F,
    ) -> Result<Vec<TaskId>, GraphError>
    where
        K: Ord,
        F: Fn(&Task, usize) -> K,
    {
        let n = graph.len();
        let mut in_degree: Vec<usize> = graph
            .dependencies
            .iter()
            .map(|deps| deps.iter().filter(|(_, k)| *k == DependencyKind::Hard).count())
            .collect();

        let mut ready = BinaryHeap::new();
        for (i, degree) in in_degree.iter().enumerate() {
            if *degree == 0 {
                ready.push(Reverse((key(&graph.tasks[i], i), i)));
            }
        }

        let mut order = Vec::with_capacity(n);
        while let Some(Reverse((_, node))) = ready.pop() {
            order.push(graph.tasks[node].id);
            for &(dependent, kind) in &graph.dependents[node] {
                if kind != DependencyKind::Hard {
                    continue;
                }
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push(Reverse((key(&graph.tasks[dependent], dependent), dependent)));
                }
            }
        }

        if order.len() < n {
            let cycle = self
                .find_cycles(graph, false)
                .into_iter()
                .next()
                .map(|members| members.iter().map(|&i| graph.tasks[i].id).collect())
                .unwrap_or_else(|| {
                    // Unreachable for a well-formed graph: report the
                    // unsorted remainder instead of dropping it.
                    (0..n)
                        .filter(|&i| in_degree[i] > 0)
                        .map(|i| graph.tasks[i].id)
                        .collect()
                });
            tracing::warn!(sorted = order.len(), total = n, "topological sort blocked by cycle");
            return Err(GraphError::CycleDetected { cycle });
        }

        Ok(order)
    }

    /// Iterative DFS tracking recursion-stack membership. Each back edge
    /// yields one cycle.
    fn find_cycles(&self, graph: &DependencyGraph, include_soft: bool) -> Vec<Vec<usize>> {
        let n = graph.len();
        let mut state = vec![Visit::Unvisited; n];
        let mut depth: Vec<usize> = vec![0; n];
        let mut cycles = Vec::new();

        for root in 0..n {
            if state[root] != Visit::Unvisited {
                continue;
            }
            let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
            state[root] = Visit::OnStack;
            depth[root] = 0;

            while let Some(&(node, cursor)) = stack.last() {
                let edges = &graph.dependencies[node];
                if cursor == edges.len() {
                    state[node] = Visit::Done;
                    stack.pop();
                    continue;
                }
                let top = stack.len() - 1;
                stack[top].1 += 1;

                let (next, kind) = edges[cursor];
                if !include_soft && kind != DependencyKind::Hard {
                    continue;
                }
                match state[next] {
                    Visit::Unvisited => {
                        state[next] = Visit::OnStack;
                        depth[next] = stack.len();
                        stack.push((next, 0));
                    }
                    Visit::OnStack => {
                        let cycle = stack[depth[next]..].iter().map(|&(i, _)| i).collect();
                        cycles.push(cycle);
                    }
                    Visit::Done => {}
                }
            }
        }

        cycles
    }
}

/// Canonical tie-break rank for a priority: smaller runs first.
pub(crate) fn priority_rank(priority: TaskPriority) -> u64 {
    match priority {
        TaskPriority::Critical => 0,
        TaskPriority::High => 1,
        TaskPriority::Medium => 2,
        TaskPriority::Low => 3,
        TaskPriority::Background => 4,
    }
}
