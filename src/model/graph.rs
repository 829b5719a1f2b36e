//! Dependency graph of a model and its acyclicity check.

use std::collections::BTreeMap;

/// Directed graph from each node to the nodes it depends on.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<String, Vec<String>>,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    pub fn add_node(&mut self, node: &str) {
        self.edges.entry(node.to_string()).or_default();
    }

    /// Record that `node` depends on `dependency`.
    pub fn add_edge(&mut self, node: &str, dependency: &str) {
        self.add_node(dependency);
        let targets = self.edges.entry(node.to_string()).or_default();
        if !targets.iter().any(|existing| existing == dependency) {
            targets.push(dependency.to_string());
        }
    }

    #[must_use]
    pub fn dependencies(&self, node: &str) -> &[String] {
        self.edges.get(node).map_or(&[], Vec::as_slice)
    }

    /// First cycle found, as the path `a -> b -> ... -> a`.
    #[must_use]
    pub fn find_cycle(&self) -> Option<Vec<String>> {
        let names: Vec<&String> = self.edges.keys().collect();
        let index: BTreeMap<&str, usize> = names
            .iter()
            .enumerate()
            .map(|(position, name)| (name.as_str(), position))
            .collect();
        let mut marks = vec![Mark::Unvisited; names.len()];
        let mut stack = Vec::new();

        for start in 0..names.len() {
            if marks[start] == Mark::Unvisited
                && let Some(cycle) = self.visit(start, &names, &index, &mut marks, &mut stack)
            {
                return Some(cycle);
            }
        }
        None
    }

    fn visit(
        &self,
        node: usize,
        names: &[&String],
        index: &BTreeMap<&str, usize>,
        marks: &mut [Mark],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        marks[node] = Mark::InProgress;
        stack.push(node);
        for dependency in self.dependencies(names[node]) {
            let next = index[dependency.as_str()];
            match marks[next] {
                Mark::InProgress => {
                    let start = stack.iter().position(|entry| *entry == next).unwrap_or(0);
                    let mut cycle: Vec<String> =
                        stack[start..].iter().map(|entry| names[*entry].clone()).collect();
                    cycle.push(names[next].clone());
                    return Some(cycle);
                }
                Mark::Unvisited => {
                    if let Some(cycle) = self.visit(next, names, index, marks, stack) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        stack.pop();
        marks[node] = Mark::Done;
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acyclic_graph_has_no_cycle() {
        let mut graph = DependencyGraph::default();
        graph.add_edge("y", "mu");
        graph.add_edge("mu", "beta");
        graph.add_edge("mu", "x");
        graph.add_edge("ypred", "beta");
        assert!(graph.find_cycle().is_none());
    }

    #[test]
    fn cycle_is_reported_as_closed_path() {
        let mut graph = DependencyGraph::default();
        graph.add_edge("y", "mu");
        graph.add_edge("mu", "y");
        graph.add_edge("mu", "beta");
        let cycle = graph.find_cycle().expect("cycle expected");
        assert_eq!(cycle.first(), cycle.last());
        assert!(cycle.contains(&"mu".to_string()));
        assert!(cycle.contains(&"y".to_string()));
    }

    #[test]
    fn self_loop_is_a_cycle() {
        let mut graph = DependencyGraph::default();
        graph.add_edge("x", "x");
        assert_eq!(
            graph.find_cycle(),
            Some(vec!["x".to_string(), "x".to_string()])
        );
    }
}
