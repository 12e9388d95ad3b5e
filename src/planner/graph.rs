//! Resource graph builder.
//!
//! Turns an ordered list of [`ResourceSpec`]s into a DAG keyed by logical
//! name. Building is pure: it either returns a graph whose every edge points
//! at a declared node and which has no cycles, or a configuration error.

use std::collections::{BTreeSet, HashMap};
use tracing::debug;

use crate::config::is_valid_name;
use crate::error::ConfigError;
use crate::resource::ResourceSpec;

/// A node of the graph.
#[derive(Debug, Clone)]
pub struct GraphNode {
    /// The declaration.
    pub spec: ResourceSpec,
    /// Direct dependencies (explicit edges and references).
    pub dependencies: Vec<String>,
    /// Direct dependents, in declaration order.
    pub dependents: Vec<String>,
}

/// A validated dependency graph.
#[derive(Debug, Clone)]
pub struct ResourceGraph {
    nodes: Vec<GraphNode>,
    index: HashMap<String, usize>,
    order: Vec<usize>,
}

impl ResourceGraph {
    /// Builds a graph from declarations.
    ///
    /// # Errors
    ///
    /// Returns `InvalidName`, `DuplicateName`, `DanglingReference` or
    /// `CycleDetected`, or a validation error for a malformed reference.
    pub fn build(specs: Vec<ResourceSpec>) -> Result<Self, ConfigError> {
        let mut index = HashMap::with_capacity(specs.len());
        for (i, spec) in specs.iter().enumerate() {
            if !is_valid_name(&spec.name) {
                return Err(ConfigError::InvalidName {
                    name: spec.name.clone(),
                    reason: String::from(
                        "must start with a letter and contain only letters, digits, '-' or '_' (max 128)",
                    ),
                });
            }
            if index.insert(spec.name.clone(), i).is_some() {
                return Err(ConfigError::DuplicateName {
                    resource_type: String::from("resource"),
                    name: spec.name.clone(),
                });
            }
        }

        let mut nodes = Vec::with_capacity(specs.len());
        for spec in specs {
            let dependencies = spec
                .dependencies()
                .map_err(|e| ConfigError::validation(e.to_string(), format!("{}.inputs", spec.name)))?;
            for dep in &dependencies {
                if !index.contains_key(dep) {
                    return Err(ConfigError::DanglingReference {
                        from: spec.name.clone(),
                        to: dep.clone(),
                    });
                }
            }
            nodes.push(GraphNode {
                spec,
                dependencies,
                dependents: Vec::new(),
            });
        }

        for i in 0..nodes.len() {
            let name = nodes[i].spec.name.clone();
            let deps = nodes[i].dependencies.clone();
            for dep in deps {
                let j = index[&dep];
                nodes[j].dependents.push(name.clone());
            }
        }

        let order = Self::topological_sort(&nodes, &index)?;
        debug!("Built resource graph with {} nodes", nodes.len());

        Ok(Self { nodes, index, order })
    }

    /// Kahn's algorithm; ready nodes are taken in declaration order.
    fn topological_sort(nodes: &[GraphNode], index: &HashMap<String, usize>) -> Result<Vec<usize>, ConfigError> {
        let mut remaining: Vec<usize> = nodes.iter().map(|n| n.dependencies.len()).collect();
        let mut ready: BTreeSet<usize> = remaining
            .iter()
            .enumerate()
            .filter(|(_, count)| **count == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(nodes.len());

        while let Some(i) = ready.pop_first() {
            order.push(i);
            for dependent in &nodes[i].dependents {
                let j = index[dependent];
                remaining[j] -= 1;
                if remaining[j] == 0 {
                    ready.insert(j);
                }
            }
        }

        if order.len() == nodes.len() {
            return Ok(order);
        }

        let stuck: BTreeSet<usize> = (0..nodes.len()).filter(|i| remaining[*i] > 0).collect();
        Err(ConfigError::CycleDetected {
            cycle: Self::find_cycle(nodes, index, &stuck),
        })
    }

    /// Renders one cycle among `stuck` nodes as `A -> B -> A`.
    fn find_cycle(nodes: &[GraphNode], index: &HashMap<String, usize>, stuck: &BTreeSet<usize>) -> String {
        #[derive(Clone, Copy, PartialEq, Eq)]
        enum Mark {
            New,
            Active,
            Done,
        }

        fn visit(
            i: usize,
            nodes: &[GraphNode],
            index: &HashMap<String, usize>,
            stuck: &BTreeSet<usize>,
            marks: &mut [Mark],
            path: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            marks[i] = Mark::Active;
            path.push(i);
            for dep in &nodes[i].dependencies {
                let j = index[dep];
                if !stuck.contains(&j) {
                    continue;
                }
                match marks[j] {
                    Mark::Active => {
                        let start = path.iter().position(|p| *p == j).unwrap_or(0);
                        let mut cycle = path[start..].to_vec();
                        cycle.push(j);
                        return Some(cycle);
                    }
                    Mark::New => {
                        if let Some(cycle) = visit(j, nodes, index, stuck, marks, path) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            path.pop();
            marks[i] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::New; nodes.len()];
        for &i in stuck {
            if marks[i] == Mark::New {
                let mut path = Vec::new();
                if let Some(cycle) = visit(i, nodes, index, stuck, &mut marks, &mut path) {
                    return cycle
                        .iter()
                        .map(|c| nodes[*c].spec.name.as_str())
                        .collect::<Vec<_>>()
                        .join(" -> ");
                }
            }
        }

        stuck
            .iter()
            .map(|i| nodes[*i].spec.name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Number of nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the graph has no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Returns true if `name` is a node.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Gets a node by name.
    #[must_use]
    pub fn node(&self, name: &str) -> Option<&GraphNode> {
        self.index.get(name).map(|i| &self.nodes[*i])
    }

    /// Gets a declaration by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&ResourceSpec> {
        self.node(name).map(|n| &n.spec)
    }

    /// Direct dependencies of `name`.
    #[must_use]
    pub fn dependencies(&self, name: &str) -> &[String] {
        self.node(name).map_or(&[], |n| n.dependencies.as_slice())
    }

    /// Direct dependents of `name`.
    #[must_use]
    pub fn dependents(&self, name: &str) -> &[String] {
        self.node(name).map_or(&[], |n| n.dependents.as_slice())
    }

    /// Every node that depends on `name`, directly or not.
    #[must_use]
    pub fn transitive_dependents(&self, name: &str) -> BTreeSet<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&str> = self.dependents(name).iter().map(String::as_str).collect();
        while let Some(current) = stack.pop() {
            if seen.insert(current.to_string()) {
                stack.extend(self.dependents(current).iter().map(String::as_str));
            }
        }
        seen
    }

    /// Node names in topological order, ties broken by declaration order.
    #[must_use]
    pub fn topological_order(&self) -> Vec<&str> {
        self.order.iter().map(|i| self.nodes[*i].spec.name.as_str()).collect()
    }

    /// Nodes in topological order.
    pub fn nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.order.iter().map(|i| &self.nodes[*i])
    }
}
