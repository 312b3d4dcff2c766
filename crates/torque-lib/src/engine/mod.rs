mod execute;

use std::collections::{HashMap, HashSet};

pub use execute::{ExecuteError, ExecutionOptions, Message, StopExecution};
use petgraph::Graph;
use thiserror::Error;

use crate::{task_graph::TaskDefinition, task_id::TaskId};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskNode {
    Root,
    Task(TaskId<'static>),
}

impl From<TaskId<'static>> for TaskNode {
    fn from(value: TaskId<'static>) -> Self {
        Self::Task(value)
    }
}

impl std::fmt::Display for TaskNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskNode::Root => f.write_str("___ROOT___"),
            TaskNode::Task(task_id) => task_id.fmt(f),
        }
    }
}

#[derive(Debug, Default)]
pub struct Building;
#[derive(Debug, Default)]
pub struct Built;

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error(transparent)]
    Graph(#[from] torque_graph::Error),
    #[error("{task_id} depends on {dependency}, which has no task definition")]
    MissingDependency {
        task_id: TaskId<'static>,
        dependency: TaskId<'static>,
    },
}

/// The task graph plus everything needed to execute it. Mutation is only
/// possible while `Building`; `seal` validates the graph and freezes it.
#[derive(Debug)]
pub struct Engine<S = Built> {
    marker: std::marker::PhantomData<S>,
    task_graph: Graph<TaskNode, ()>,
    root_index: petgraph::graph::NodeIndex,
    task_lookup: HashMap<TaskId<'static>, petgraph::graph::NodeIndex>,
    task_definitions: HashMap<TaskId<'static>, TaskDefinition>,
}

impl Engine<Building> {
    pub fn new() -> Self {
        let mut task_graph = Graph::default();
        let root_index = task_graph.add_node(TaskNode::Root);
        Self {
            marker: std::marker::PhantomData,
            task_graph,
            root_index,
            task_lookup: HashMap::default(),
            task_definitions: HashMap::default(),
        }
    }

    pub fn get_index(&mut self, task_id: &TaskId<'static>) -> petgraph::graph::NodeIndex {
        self.task_lookup.get(task_id).copied().unwrap_or_else(|| {
            let index = self.task_graph.add_node(TaskNode::Task(task_id.clone()));
            self.task_lookup.insert(task_id.clone(), index);
            index
        })
    }

    /// Marks a task as an entry point of the run.
    pub fn connect_to_root(&mut self, task_id: &TaskId<'static>) {
        let source = self.get_index(task_id);
        self.task_graph.add_edge(source, self.root_index, ());
    }

    /// Records that `task_id` must wait for `dependency`.
    pub fn add_dependency(&mut self, task_id: &TaskId<'static>, dependency: &TaskId<'static>) {
        let source = self.get_index(task_id);
        let target = self.get_index(dependency);
        self.task_graph.add_edge(source, target, ());
    }

    pub fn add_definition(
        &mut self,
        task_id: TaskId<'static>,
        definition: TaskDefinition,
    ) -> Option<TaskDefinition> {
        self.task_definitions.insert(task_id, definition)
    }

    /// Validates the graph and seals it against further mutation. Cycles,
    /// self-dependencies, and edges to tasks that never got a definition are
    /// all rejected here, before anything runs.
    pub fn seal(self) -> Result<Engine<Built>, BuilderError> {
        let Engine {
            task_graph,
            task_lookup,
            root_index,
            task_definitions,
            ..
        } = self;

        torque_graph::validate_graph(&task_graph)?;

        for (task_id, index) in &task_lookup {
            for neighbor in task_graph.neighbors_directed(*index, petgraph::Direction::Outgoing) {
                if let TaskNode::Task(dependency) = &task_graph[neighbor] {
                    if !task_definitions.contains_key(dependency) {
                        return Err(BuilderError::MissingDependency {
                            task_id: task_id.clone(),
                            dependency: dependency.clone(),
                        });
                    }
                }
            }
        }

        Ok(Engine {
            marker: std::marker::PhantomData,
            task_graph,
            task_lookup,
            root_index,
            task_definitions,
        })
    }
}

impl Default for Engine<Building> {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine<Built> {
    /// Direct prerequisites of a task.
    pub fn dependencies(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Outgoing)
    }

    /// Direct dependents of a task.
    pub fn dependents(&self, task_id: &TaskId) -> Option<HashSet<&TaskNode>> {
        self.neighbors(task_id, petgraph::Direction::Incoming)
    }

    fn neighbors(
        &self,
        task_id: &TaskId,
        direction: petgraph::Direction,
    ) -> Option<HashSet<&TaskNode>> {
        let index = self.task_lookup.get(task_id)?;
        Some(
            self.task_graph
                .neighbors_directed(*index, direction)
                .map(|index| {
                    self.task_graph
                        .node_weight(index)
                        .expect("node index comes from iterating the graph")
                })
                .filter(|node| !matches!(node, TaskNode::Root))
                .collect(),
        )
    }

    pub fn task_definition<'a>(&'a self, task_id: &TaskId<'a>) -> Option<&'a TaskDefinition> {
        self.task_definitions.get(task_id)
    }

    pub fn task_definitions(&self) -> &HashMap<TaskId<'static>, TaskDefinition> {
        &self.task_definitions
    }

    pub fn tasks(&self) -> impl Iterator<Item = &TaskNode> {
        self.task_graph.node_weights()
    }

    pub fn task_ids(&self) -> impl Iterator<Item = &TaskId<'static>> {
        self.tasks().filter_map(|node| match node {
            TaskNode::Task(task_id) => Some(task_id),
            TaskNode::Root => None,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn definition() -> TaskDefinition {
        TaskDefinition::default()
    }

    #[test]
    fn test_dependencies_and_dependents() {
        let build = TaskId::new("app", "build").into_owned();
        let codegen = TaskId::new("app", "codegen").into_owned();

        let mut engine = Engine::new();
        engine.add_definition(build.clone(), definition());
        engine.add_definition(codegen.clone(), definition());
        engine.connect_to_root(&build);
        engine.add_dependency(&build, &codegen);
        let engine = engine.seal().unwrap();

        let deps = engine.dependencies(&build).unwrap();
        assert_eq!(deps.len(), 1);
        assert!(deps.contains(&TaskNode::Task(codegen.clone())));

        let dependents = engine.dependents(&codegen).unwrap();
        assert_eq!(dependents.len(), 1);
        assert!(dependents.contains(&TaskNode::Task(build)));
    }

    #[test]
    fn test_seal_rejects_cycles() {
        let build = TaskId::new("app", "build").into_owned();
        let codegen = TaskId::new("app", "codegen").into_owned();

        let mut engine = Engine::new();
        engine.add_definition(build.clone(), definition());
        engine.add_definition(codegen.clone(), definition());
        engine.add_dependency(&build, &codegen);
        engine.add_dependency(&codegen, &build);

        assert!(matches!(
            engine.seal(),
            Err(BuilderError::Graph(
                torque_graph::Error::CyclicDependencies { .. }
            ))
        ));
    }

    #[test]
    fn test_seal_rejects_unknown_dependency() {
        let build = TaskId::new("app", "build").into_owned();
        let missing = TaskId::new("app", "missing").into_owned();

        let mut engine = Engine::new();
        engine.add_definition(build.clone(), definition());
        engine.add_dependency(&build, &missing);

        assert!(matches!(
            engine.seal(),
            Err(BuilderError::MissingDependency { .. })
        ));
    }
}
