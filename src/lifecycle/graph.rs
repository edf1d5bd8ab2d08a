//! Startup dependency graph.
//!
//! # Responsibilities
//! - Reject duplicate names and dependencies on undeclared components
//! - Detect cycles before anything is initialized
//! - Produce a topological order and the reverse (dependents) adjacency
//!
//! # Design Decisions
//! - Kahn's algorithm; ties broken by name so the planned order is stable
//! - Nodes Kahn cannot place are reported only if they lie on a cycle
//! - The graph is immutable once built and shared read-only by the coordinator

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::lifecycle::startup::ComponentDescriptor;

/// Fatal problems in a declared component graph.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("component {0} is declared more than once")]
    Duplicate(String),

    #[error("component {component} depends on undeclared component {dependency}")]
    UnknownDependency {
        component: String,
        dependency: String,
    },

    #[error("dependency cycle among components: {}", .members.join(", "))]
    Cycle { members: Vec<String> },
}

/// Validated, acyclic component graph.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    nodes: BTreeMap<String, ComponentDescriptor>,
    dependents: BTreeMap<String, BTreeSet<String>>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Validate descriptors and compute a topological order.
    pub fn build(descriptors: Vec<ComponentDescriptor>) -> Result<Self, GraphError> {
        let mut nodes = BTreeMap::new();
        for descriptor in descriptors {
            if nodes.contains_key(&descriptor.name) {
                return Err(GraphError::Duplicate(descriptor.name));
            }
            nodes.insert(descriptor.name.clone(), descriptor);
        }

        let mut dependents: BTreeMap<String, BTreeSet<String>> = nodes
            .keys()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();

        for descriptor in nodes.values() {
            for dependency in &descriptor.dependencies {
                match dependents.get_mut(dependency) {
                    Some(set) => {
                        set.insert(descriptor.name.clone());
                    }
                    None => {
                        return Err(GraphError::UnknownDependency {
                            component: descriptor.name.clone(),
                            dependency: dependency.clone(),
                        })
                    }
                }
            }
        }

        let mut remaining: BTreeMap<&str, usize> = nodes
            .values()
            .map(|d| (d.name.as_str(), d.dependencies.len()))
            .collect();
        let mut ready: VecDeque<&str> = remaining
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| *name)
            .collect();
        let mut order = Vec::with_capacity(nodes.len());

        while let Some(name) = ready.pop_front() {
            order.push(name.to_string());
            for dependent in &dependents[name] {
                if let Some(count) = remaining.get_mut(dependent.as_str()) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push_back(dependent.as_str());
                    }
                }
            }
        }

        if order.len() != nodes.len() {
            let placed: BTreeSet<&str> = order.iter().map(String::as_str).collect();
            let members = nodes
                .keys()
                .filter(|name| !placed.contains(name.as_str()) && reaches_itself(&nodes, name))
                .cloned()
                .collect();
            return Err(GraphError::Cycle { members });
        }

        Ok(Self {
            nodes,
            dependents,
            order,
        })
    }

    /// Components in an order where every node follows its dependencies.
    pub fn topological_order(&self) -> &[String] {
        &self.order
    }

    pub fn descriptor(&self, name: &str) -> Option<&ComponentDescriptor> {
        self.nodes.get(name)
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &ComponentDescriptor> {
        self.nodes.values()
    }

    /// Components that declare `name` as a direct dependency.
    pub fn dependents(&self, name: &str) -> impl Iterator<Item = &String> {
        self.dependents.get(name).into_iter().flatten()
    }

    /// Every component reachable from `name` through dependents, excluding `name`.
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&String> = self.dependents(name).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents(next));
            }
        }
        seen
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Whether following dependencies from `start` leads back to it.
fn reaches_itself(nodes: &BTreeMap<String, ComponentDescriptor>, start: &str) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack: Vec<&str> = nodes[start].dependencies.iter().map(String::as_str).collect();
    while let Some(next) = stack.pop() {
        if next == start {
            return true;
        }
        if seen.insert(next) {
            if let Some(descriptor) = nodes.get(next) {
                stack.extend(descriptor.dependencies.iter().map(String::as_str));
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn node(name: &str, deps: &[&str]) -> ComponentDescriptor {
        ComponentDescriptor {
            name: name.to_string(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
            critical: true,
            init_timeout: Duration::from_secs(1),
        }
    }

    fn position(order: &[String], name: &str) -> usize {
        order.iter().position(|n| n == name).unwrap()
    }

    #[test]
    fn orders_dependencies_first() {
        let graph = DependencyGraph::build(vec![
            node("api", &["cache", "storage"]),
            node("cache", &["storage"]),
            node("storage", &[]),
        ])
        .unwrap();

        let order = graph.topological_order();
        assert_eq!(order.len(), 3);
        assert!(position(order, "storage") < position(order, "cache"));
        assert!(position(order, "cache") < position(order, "api"));
    }

    #[test]
    fn detects_two_node_cycle() {
        let err = DependencyGraph::build(vec![node("a", &["b"]), node("b", &["a"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                members: vec!["a".into(), "b".into()]
            }
        );
    }

    #[test]
    fn cycle_members_exclude_components_merely_behind_it() {
        let err = DependencyGraph::build(vec![
            node("a", &["b"]),
            node("b", &["a"]),
            node("c", &["a"]),
            node("d", &["c"]),
            node("e", &[]),
        ])
        .unwrap_err();
        assert_eq!(
            err,
            GraphError::Cycle {
                members: vec!["a".into(), "b".into()]
            }
        );
    }

    #[test]
    fn detects_self_dependency() {
        let err = DependencyGraph::build(vec![node("a", &["a"])]).unwrap_err();
        assert!(matches!(err, GraphError::Cycle { .. }));
    }

    #[test]
    fn rejects_unknown_and_duplicate_names() {
        let err = DependencyGraph::build(vec![node("a", &["ghost"])]).unwrap_err();
        assert_eq!(
            err,
            GraphError::UnknownDependency {
                component: "a".into(),
                dependency: "ghost".into()
            }
        );

        let err = DependencyGraph::build(vec![node("a", &[]), node("a", &[])]).unwrap_err();
        assert_eq!(err, GraphError::Duplicate("a".into()));
    }

    #[test]
    fn transitive_dependents_follow_chains() {
        let graph = DependencyGraph::build(vec![
            node("a", &[]),
            node("b", &["a"]),
            node("c", &["b"]),
            node("d", &[]),
        ])
        .unwrap();

        let skipped = graph.transitive_dependents("a");
        assert_eq!(skipped.into_iter().collect::<Vec<_>>(), vec!["b", "c"]);
        assert!(graph.transitive_dependents("d").is_empty());
    }
}
