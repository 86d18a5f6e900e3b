//! Immutable task graph.
//!
//! A [`Graph`] is a set of tasks plus "must succeed before" edges. It is
//! validated once at construction (unique ids, valid parameters, edge
//! endpoints, no cycles) and never changes afterwards, so every run works
//! from the same topological order instead of re-deriving it at dispatch
//! time.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

use thiserror::Error;

use super::task::{ParamError, Task};
use super::types::{PipelineId, TaskId};

/// Errors that prevent a graph from being built. A run never starts on one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopologyError {
    /// Two tasks share an id.
    #[error("duplicate task: {0}")]
    DuplicateTask(TaskId),

    /// A task's parameters can never execute correctly.
    #[error("invalid task '{task}': {reason}")]
    InvalidTask {
        task: TaskId,
        #[source]
        reason: ParamError,
    },

    /// An edge references a task that doesn't exist.
    #[error("edge {upstream} -> {downstream} references unknown task '{missing}'")]
    DanglingEdge {
        upstream: TaskId,
        downstream: TaskId,
        missing: TaskId,
    },

    /// A task depends on itself.
    #[error("task '{0}' depends on itself")]
    SelfDependency(TaskId),

    /// The edges contain a cycle; `cycle` lists its members in edge order.
    #[error("cycle detected: {}", CyclePath(.cycle))]
    CycleDetected { cycle: Vec<TaskId> },
}

struct CyclePath<'a>(&'a [TaskId]);

impl fmt::Display for CyclePath<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for id in self.0 {
            write!(f, "{} -> ", id)?;
        }
        match self.0.first() {
            Some(first) => write!(f, "{}", first),
            None => Ok(()),
        }
    }
}

/// A validated, immutable pipeline graph.
#[derive(Debug, Clone)]
pub struct Graph {
    /// Pipeline identifier.
    id: PipelineId,

    /// Tasks in declaration order.
    tasks: Vec<Task>,

    /// Position of each task in `tasks`.
    index: HashMap<TaskId, usize>,

    /// task -> tasks that must succeed before it.
    upstream: HashMap<TaskId, Vec<TaskId>>,

    /// task -> tasks waiting on it.
    downstream: HashMap<TaskId, Vec<TaskId>>,

    /// A topological order; ties follow declaration order.
    order: Vec<TaskId>,
}

impl Graph {
    /// Build and validate a graph from tasks and `(upstream, downstream)`
    /// edges. Repeated edges are collapsed.
    pub fn build<I, A, B>(
        id: impl Into<PipelineId>,
        tasks: Vec<Task>,
        edges: I,
    ) -> Result<Self, TopologyError>
    where
        I: IntoIterator<Item = (A, B)>,
        A: Into<TaskId>,
        B: Into<TaskId>,
    {
        let mut index = HashMap::with_capacity(tasks.len());
        for (pos, task) in tasks.iter().enumerate() {
            if index.insert(task.id.clone(), pos).is_some() {
                return Err(TopologyError::DuplicateTask(task.id.clone()));
            }
            task.params
                .validate()
                .map_err(|reason| TopologyError::InvalidTask {
                    task: task.id.clone(),
                    reason,
                })?;
        }

        let mut upstream: HashMap<TaskId, Vec<TaskId>> = tasks
            .iter()
            .map(|t| (t.id.clone(), Vec::new()))
            .collect();
        let mut downstream = upstream.clone();
        let mut seen = HashSet::new();

        for (from, to) in edges {
            let (from, to): (TaskId, TaskId) = (from.into(), to.into());
            for endpoint in [&from, &to] {
                if !index.contains_key(endpoint) {
                    return Err(TopologyError::DanglingEdge {
                        upstream: from.clone(),
                        downstream: to.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
            if from == to {
                return Err(TopologyError::SelfDependency(from));
            }
            if !seen.insert((from.clone(), to.clone())) {
                continue;
            }
            upstream.entry(to.clone()).or_default().push(from.clone());
            downstream.entry(from).or_default().push(to);
        }

        let order = topological_sort(&tasks, &upstream, &downstream)?;

        Ok(Self {
            id: id.into(),
            tasks,
            index,
            upstream,
            downstream,
            order,
        })
    }

    /// Get the pipeline ID.
    pub fn id(&self) -> &PipelineId {
        &self.id
    }

    /// Get the number of tasks in the graph.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Get a task by ID.
    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.index.get(id).map(|pos| &self.tasks[*pos])
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.iter()
    }

    /// Tasks that must succeed before `id` may run.
    pub fn upstream(&self, id: &TaskId) -> &[TaskId] {
        self.upstream.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tasks waiting on `id`.
    pub fn downstream(&self, id: &TaskId) -> &[TaskId] {
        self.downstream.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Tasks with no upstream dependencies, in declaration order.
    pub fn roots(&self) -> Vec<&TaskId> {
        self.tasks
            .iter()
            .map(|t| &t.id)
            .filter(|id| self.upstream(id).is_empty())
            .collect()
    }

    /// All tasks in an order where every task follows its upstreams.
    pub fn topological_order(&self) -> &[TaskId] {
        &self.order
    }

    /// Group tasks into layers: a task sits one layer below its deepest
    /// upstream. Tasks in the same layer never depend on each other.
    pub fn waves(&self) -> Vec<Vec<TaskId>> {
        let mut depth: HashMap<&TaskId, usize> = HashMap::with_capacity(self.len());
        let mut waves: Vec<Vec<TaskId>> = Vec::new();

        for id in &self.order {
            let level = self
                .upstream(id)
                .iter()
                .filter_map(|up| depth.get(up))
                .map(|d| d + 1)
                .max()
                .unwrap_or(0);
            depth.insert(id, level);
            if waves.len() <= level {
                waves.resize_with(level + 1, Vec::new);
            }
            waves[level].push(id.clone());
        }

        waves
    }
}

/// Kahn's algorithm. On failure, walks back through the unresolved tasks to
/// report a real cycle rather than a task that merely sits behind one.
fn topological_sort(
    tasks: &[Task],
    upstream: &HashMap<TaskId, Vec<TaskId>>,
    downstream: &HashMap<TaskId, Vec<TaskId>>,
) -> Result<Vec<TaskId>, TopologyError> {
    let mut in_degree: HashMap<&TaskId, usize> = tasks
        .iter()
        .map(|t| (&t.id, upstream.get(&t.id).map_or(0, Vec::len)))
        .collect();

    let mut queue: VecDeque<&TaskId> = tasks
        .iter()
        .map(|t| &t.id)
        .filter(|id| in_degree[id] == 0)
        .collect();

    let mut order = Vec::with_capacity(tasks.len());

    while let Some(id) = queue.pop_front() {
        order.push(id.clone());

        for next in downstream.get(id).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(next) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(next);
                }
            }
        }
    }

    if order.len() == tasks.len() {
        return Ok(order);
    }

    // Every unresolved task still has an unresolved upstream, so following
    // upstream links from any of them must eventually revisit a task.
    let unresolved = |id: &TaskId| in_degree.get(id).is_some_and(|d| *d > 0);
    let mut path: Vec<&TaskId> = Vec::new();
    let mut current = tasks
        .iter()
        .map(|t| &t.id)
        .find(|id| unresolved(id))
        .ok_or_else(|| TopologyError::CycleDetected { cycle: Vec::new() })?;

    loop {
        if let Some(start) = path.iter().position(|id| *id == current) {
            let mut cycle: Vec<TaskId> = path[start..].iter().map(|id| (*id).clone()).collect();
            cycle.reverse();
            return Err(TopologyError::CycleDetected { cycle });
        }
        path.push(current);
        current = match upstream
            .get(current)
            .and_then(|ups| ups.iter().find(|up| unresolved(up)))
        {
            Some(next) => next,
            None => {
                return Err(TopologyError::CycleDetected {
                    cycle: vec![current.clone()],
                });
            }
        };
    }
}

/// Builder for constructing graphs fluently, mirroring `a >> [b, c]`
/// style wiring.
pub struct GraphBuilder {
    id: PipelineId,
    tasks: Vec<Task>,
    edges: Vec<(TaskId, TaskId)>,
}

impl GraphBuilder {
    /// Create a new graph builder.
    pub fn new(id: impl Into<PipelineId>) -> Self {
        Self {
            id: id.into(),
            tasks: Vec::new(),
            edges: Vec::new(),
        }
    }

    /// Add a task.
    pub fn task(mut self, task: Task) -> Self {
        self.tasks.push(task);
        self
    }

    /// `upstream >> downstream`.
    pub fn edge(mut self, upstream: &str, downstream: &str) -> Self {
        self.edges
            .push((TaskId::new(upstream), TaskId::new(downstream)));
        self
    }

    /// `upstream >> [a, b, ...]`.
    pub fn fan_out(mut self, upstream: &str, downstream: &[&str]) -> Self {
        for to in downstream {
            self = self.edge(upstream, to);
        }
        self
    }

    /// `[a, b, ...] >> downstream`.
    pub fn fan_in(mut self, upstream: &[&str], downstream: &str) -> Self {
        for from in upstream {
            self = self.edge(from, downstream);
        }
        self
    }

    /// `a >> b >> c >> ...`.
    pub fn chain(mut self, ids: &[&str]) -> Self {
        for pair in ids.windows(2) {
            self = self.edge(pair[0], pair[1]);
        }
        self
    }

    /// Build the graph, validating it in the process.
    pub fn build(self) -> Result<Graph, TopologyError> {
        Graph::build(self.id, self.tasks, self.edges)
    }
}
