//! Dependency Graph Builder
//!
//! Builds an immutable DAG over a declaration set. An edge `A -> B` exists iff
//! A's config contains a deferred reference into B or A lists B in
//! `depends_on`. All structural problems are reported here, before anything is
//! provisioned.

use crate::context::DeploymentContext;
use crate::error::GraphError;
use crate::model::{ConfigValue, ResourceDeclaration, ResourceId, ResourceKind, ENVIRONMENT_KEY};
use petgraph::algo::tarjan_scc;
use petgraph::dot::{Config as DotConfig, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Validated dependency graph
///
/// Node indices follow declaration order, which is also the tie-breaker for
/// the provisioning order.
#[derive(Debug)]
pub struct DependencyGraph {
    declarations: Vec<ResourceDeclaration>,
    index: HashMap<ResourceId, NodeIndex>,
    // dependent -> dependency
    graph: DiGraph<ResourceId, ()>,
    order: Vec<NodeIndex>,
}

impl DependencyGraph {
    /// Build and validate the graph
    ///
    /// # Errors
    /// - `DuplicateId` if two declarations share an id
    /// - `UnknownReference` if a reference, dependency or grant target names
    ///   an undeclared id
    /// - `MissingContext` if a context value is not configured
    /// - `MissingEnvironment` if a function's environment lacks a required
    ///   variable
    /// - `GrantOnNonActor` if a resource other than a function or role
    ///   declares grants
    /// - `Cycle` if the declarations depend on each other in a loop
    pub fn build(
        declarations: Vec<ResourceDeclaration>,
        context: &DeploymentContext,
    ) -> Result<Self, GraphError> {
        let mut graph = DiGraph::with_capacity(declarations.len(), declarations.len());
        let mut index = HashMap::with_capacity(declarations.len());

        for decl in &declarations {
            if index.contains_key(&decl.id) {
                return Err(GraphError::DuplicateId(decl.id.clone()));
            }
            let node = graph.add_node(decl.id.clone());
            index.insert(decl.id.clone(), node);
        }

        for decl in &declarations {
            let referrer = format!("resource `{}`", decl.id);
            check_context(&referrer, decl.config.values(), context)?;
            check_environment(decl)?;

            let from = index[&decl.id];
            for dependency in decl.dependency_ids() {
                let to = *index
                    .get(dependency)
                    .ok_or_else(|| GraphError::UnknownReference {
                        referrer: referrer.clone(),
                        missing: dependency.clone(),
                    })?;
                graph.update_edge(from, to, ());
            }

            if !decl.grants.is_empty() && !decl.kind.is_actor() {
                return Err(GraphError::GrantOnNonActor {
                    resource: decl.id.clone(),
                    kind: decl.kind,
                });
            }
            for grant in &decl.grants {
                for target in &grant.targets {
                    if let Some(id) = target.resource_id() {
                        if !index.contains_key(id) {
                            return Err(GraphError::UnknownReference {
                                referrer: format!("grant of `{}`", decl.id),
                                missing: id.clone(),
                            });
                        }
                    }
                }
            }
        }

        let mut built = Self {
            declarations,
            index,
            graph,
            order: Vec::new(),
        };

        built.order = built.topological_order()?;
        tracing::debug!(
            "Built dependency graph: {} resources, {} edges",
            built.len(),
            built.graph.edge_count()
        );
        Ok(built)
    }

    /// Check that every reference in `values` names a declared resource and
    /// every context field is configured
    ///
    /// Used for values that live outside the declarations, such as outputs
    /// and pipeline actions.
    pub fn check_references<'v>(
        &self,
        referrer: &str,
        values: impl IntoIterator<Item = &'v ConfigValue> + Clone,
        context: &DeploymentContext,
    ) -> Result<(), GraphError> {
        check_context(referrer, values.clone(), context)?;

        let mut refs = Vec::new();
        for value in values {
            value.collect_references(&mut refs);
        }
        match refs.into_iter().find(|r| !self.contains(r.resource.as_str())) {
            Some(r) => Err(GraphError::UnknownReference {
                referrer: referrer.to_string(),
                missing: r.resource.clone(),
            }),
            None => Ok(()),
        }
    }

    /// Kahn's algorithm with a min-heap on declaration index
    fn topological_order(&self) -> Result<Vec<NodeIndex>, GraphError> {
        let n = self.graph.node_count();
        let mut pending: Vec<usize> = self
            .graph
            .node_indices()
            .map(|node| self.graph.neighbors(node).count())
            .collect();

        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .enumerate()
            .filter(|(_, deps)| **deps == 0)
            .map(|(i, _)| Reverse(i))
            .collect();

        let mut order = Vec::with_capacity(n);
        while let Some(Reverse(i)) = ready.pop() {
            let node = NodeIndex::new(i);
            order.push(node);
            for dependent in self.graph.neighbors_directed(node, Direction::Incoming) {
                let slot = &mut pending[dependent.index()];
                *slot -= 1;
                if *slot == 0 {
                    ready.push(Reverse(dependent.index()));
                }
            }
        }

        if order.len() < n {
            return Err(GraphError::Cycle {
                cycle: self.find_cycle(),
            });
        }
        Ok(order)
    }

    /// Extract one concrete cycle, starting from the earliest declared
    /// resource that sits on a cycle
    fn find_cycle(&self) -> Vec<ResourceId> {
        let graph = &self.graph;
        let Some(component) = tarjan_scc(graph)
            .into_iter()
            .filter(|scc| scc.len() > 1 || graph.contains_edge(scc[0], scc[0]))
            .min_by_key(|scc| scc.iter().map(|n| n.index()).min())
        else {
            return Vec::new();
        };

        let members: HashSet<NodeIndex> = component.iter().copied().collect();
        let start = component
            .iter()
            .copied()
            .min_by_key(|n| n.index())
            .unwrap_or(component[0]);

        fn walk(
            graph: &DiGraph<ResourceId, ()>,
            node: NodeIndex,
            start: NodeIndex,
            members: &HashSet<NodeIndex>,
            visited: &mut HashSet<NodeIndex>,
            path: &mut Vec<NodeIndex>,
        ) -> bool {
            let mut next: Vec<NodeIndex> =
                graph.neighbors(node).filter(|n| members.contains(n)).collect();
            next.sort_by_key(|n| n.index());

            for neighbor in next {
                if neighbor == start {
                    return true;
                }
                if visited.insert(neighbor) {
                    path.push(neighbor);
                    if walk(graph, neighbor, start, members, visited, path) {
                        return true;
                    }
                    path.pop();
                }
            }
            false
        }

        let mut visited = HashSet::from([start]);
        let mut path = vec![start];
        walk(graph, start, start, &members, &mut visited, &mut path);

        path.into_iter().map(|n| graph[n].clone()).collect()
    }

    /// Number of declarations
    #[must_use]
    pub fn len(&self) -> usize {
        self.declarations.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.declarations.is_empty()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    /// Declaration by id
    #[must_use]
    pub fn declaration(&self, id: &str) -> Option<&ResourceDeclaration> {
        self.index.get(id).map(|n| &self.declarations[n.index()])
    }

    /// Declarations in declaration order
    pub fn declarations(&self) -> impl Iterator<Item = &ResourceDeclaration> + '_ {
        self.declarations.iter()
    }

    /// Provisioning order: every resource after all of its dependencies,
    /// ties broken by declaration order
    pub fn provisioning_order(&self) -> impl Iterator<Item = &ResourceDeclaration> + '_ {
        self.order.iter().map(|n| &self.declarations[n.index()])
    }

    /// Ids in provisioning order
    #[must_use]
    pub fn order_ids(&self) -> Vec<&ResourceId> {
        self.provisioning_order().map(|d| &d.id).collect()
    }

    /// Group resources into waves: every member of a wave depends only on
    /// members of earlier waves, so a wave may be provisioned concurrently
    #[must_use]
    pub fn waves(&self) -> Vec<Vec<&ResourceDeclaration>> {
        let mut level = vec![0usize; self.graph.node_count()];
        for &node in &self.order {
            level[node.index()] = self
                .graph
                .neighbors(node)
                .map(|dep| level[dep.index()] + 1)
                .max()
                .unwrap_or(0);
        }

        let depth = level.iter().copied().max().map_or(0, |max| max + 1);
        let mut waves: Vec<Vec<&ResourceDeclaration>> = vec![Vec::new(); depth];
        for (i, decl) in self.declarations.iter().enumerate() {
            waves[level[i]].push(decl);
        }
        waves
    }

    /// Direct dependencies of `id`, in declaration order
    #[must_use]
    pub fn dependencies(&self, id: &str) -> Vec<&ResourceId> {
        self.neighbors(id, Direction::Outgoing)
    }

    /// Resources that depend directly on `id`, in declaration order
    #[must_use]
    pub fn dependents(&self, id: &str) -> Vec<&ResourceId> {
        self.neighbors(id, Direction::Incoming)
    }

    fn neighbors(&self, id: &str, direction: Direction) -> Vec<&ResourceId> {
        let Some(&node) = self.index.get(id) else {
            return Vec::new();
        };
        let mut nodes: Vec<NodeIndex> = self.graph.neighbors_directed(node, direction).collect();
        nodes.sort_by_key(|n| n.index());
        nodes.into_iter().map(|n| &self.graph[n]).collect()
    }

    /// Actors (functions and roles) that declare grants
    pub fn actors(&self) -> impl Iterator<Item = &ResourceDeclaration> + '_ {
        self.declarations
            .iter()
            .filter(|d| d.kind.is_actor() && !d.grants.is_empty())
    }

    /// Declarations of one kind
    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &ResourceDeclaration> + '_ {
        self.declarations.iter().filter(move |d| d.kind == kind)
    }

    /// Graphviz rendering, edges pointing from dependent to dependency
    #[must_use]
    pub fn to_dot(&self) -> String {
        let labelled = self.graph.map(
            |node, id| format!("{} ({})", id, self.declarations[node.index()].kind),
            |_, _| String::new(),
        );
        format!("{}", Dot::with_config(&labelled, &[DotConfig::EdgeNoLabel]))
    }
}

fn check_context<'v>(
    referrer: &str,
    values: impl IntoIterator<Item = &'v ConfigValue>,
    context: &DeploymentContext,
) -> Result<(), GraphError> {
    let mut fields = Vec::new();
    for value in values {
        value.collect_context_fields(&mut fields);
    }
    match fields.into_iter().find(|f| context.get(*f).is_none()) {
        Some(field) => Err(GraphError::MissingContext {
            referrer: referrer.to_string(),
            field,
        }),
        None => Ok(()),
    }
}

fn check_environment(decl: &ResourceDeclaration) -> Result<(), GraphError> {
    let Some(function) = &decl.function else {
        return Ok(());
    };
    let provided = match decl.config.get(ENVIRONMENT_KEY) {
        Some(ConfigValue::Map(env)) => Some(env),
        _ => None,
    };
    for variable in &function.required_env {
        if !provided.is_some_and(|env| env.contains_key(variable)) {
            return Err(GraphError::MissingEnvironment {
                resource: decl.id.clone(),
                variable: variable.clone(),
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ContextField;
    use crate::model::{attr, FunctionInterface};

    fn ctx() -> DeploymentContext {
        DeploymentContext::new("test").with_region("us-east-1")
    }

    fn ids(graph: &DependencyGraph) -> Vec<&str> {
        graph.order_ids().into_iter().map(ResourceId::as_str).collect()
    }

    #[test]
    fn orders_dependencies_first_with_declaration_tiebreak() {
        let decls = vec![
            ResourceDeclaration::new("fn", ResourceKind::Function)
                .with("topic", ConfigValue::reference("topic", attr::ARN)),
            ResourceDeclaration::new("topic", ResourceKind::Topic),
            ResourceDeclaration::new("bucket", ResourceKind::ObjectStore),
        ];

        let graph = DependencyGraph::build(decls, &ctx()).unwrap();
        assert_eq!(ids(&graph), vec!["topic", "fn", "bucket"]);
        assert_eq!(graph.dependencies("fn"), vec![&ResourceId::new("topic")]);
        assert_eq!(graph.dependents("topic"), vec![&ResourceId::new("fn")]);
    }

    #[test]
    fn rejects_duplicate_ids() {
        let decls = vec![
            ResourceDeclaration::new("a", ResourceKind::Topic),
            ResourceDeclaration::new("a", ResourceKind::ObjectStore),
        ];
        assert_eq!(
            DependencyGraph::build(decls, &ctx()).unwrap_err(),
            GraphError::DuplicateId(ResourceId::new("a"))
        );
    }

    #[test]
    fn self_reference_is_a_cycle_of_one() {
        let decls = vec![ResourceDeclaration::new("a", ResourceKind::Topic)
            .with("me", ConfigValue::reference("a", attr::ARN))];
        assert_eq!(
            DependencyGraph::build(decls, &ctx()).unwrap_err(),
            GraphError::Cycle {
                cycle: vec![ResourceId::new("a")]
            }
        );
    }

    #[test]
    fn reports_the_cycle_not_its_upstream() {
        let decls = vec![
            ResourceDeclaration::new("entry", ResourceKind::Gateway).depends_on("a"),
            ResourceDeclaration::new("a", ResourceKind::Function).depends_on("b"),
            ResourceDeclaration::new("b", ResourceKind::Function).depends_on("c"),
            ResourceDeclaration::new("c", ResourceKind::Function).depends_on("a"),
        ];
        let GraphError::Cycle { cycle } = DependencyGraph::build(decls, &ctx()).unwrap_err() else {
            panic!("expected a cycle");
        };
        let cycle: Vec<&str> = cycle.iter().map(ResourceId::as_str).collect();
        assert_eq!(cycle, vec!["a", "b", "c"]);
    }

    #[test]
    fn rejects_missing_context() {
        let decls = vec![ResourceDeclaration::new("fn", ResourceKind::Function)
            .with("account", ConfigValue::context(ContextField::Account))];
        assert!(matches!(
            DependencyGraph::build(decls, &ctx()).unwrap_err(),
            GraphError::MissingContext {
                field: ContextField::Account,
                ..
            }
        ));
    }

    #[test]
    fn rejects_missing_required_environment() {
        let decls = vec![ResourceDeclaration::new("fn", ResourceKind::Function)
            .function(
                FunctionInterface::new("python3.9", "index.handler", "lambda/fn")
                    .requires_env(["TOPIC"]),
            )
            .with(
                "environment",
                ConfigValue::map([("OTHER", ConfigValue::literal("x"))]),
            )];
        assert_eq!(
            DependencyGraph::build(decls, &ctx()).unwrap_err(),
            GraphError::MissingEnvironment {
                resource: ResourceId::new("fn"),
                variable: "TOPIC".into(),
            }
        );
    }

    #[test]
    fn grants_are_only_accepted_on_actors() {
        let decls = vec![ResourceDeclaration::new("t", ResourceKind::Topic).grant(
            crate::policy::Grant::new(["iam:*"], [crate::policy::TargetRef::Wildcard]),
        )];
        assert_eq!(
            DependencyGraph::build(decls, &ctx()).unwrap_err(),
            GraphError::GrantOnNonActor {
                resource: ResourceId::new("t"),
                kind: ResourceKind::Topic,
            }
        );
    }

    #[test]
    fn waves_group_independent_resources() {
        let decls = vec![
            ResourceDeclaration::new("net", ResourceKind::Network),
            ResourceDeclaration::new("cluster", ResourceKind::ComputeCluster).depends_on("net"),
            ResourceDeclaration::new("bucket", ResourceKind::ObjectStore),
            ResourceDeclaration::new("fn", ResourceKind::Function)
                .with("bucket", ConfigValue::reference("bucket", attr::NAME))
                .depends_on("cluster"),
        ];
        let graph = DependencyGraph::build(decls, &ctx()).unwrap();
        let waves: Vec<Vec<&str>> = graph
            .waves()
            .iter()
            .map(|wave| wave.iter().map(|d| d.id.as_str()).collect())
            .collect();
        assert_eq!(waves, vec![vec!["net", "bucket"], vec!["cluster"], vec!["fn"]]);
    }

    #[test]
    fn dot_lists_every_resource() {
        let decls = vec![
            ResourceDeclaration::new("net", ResourceKind::Network),
            ResourceDeclaration::new("cluster", ResourceKind::ComputeCluster).depends_on("net"),
        ];
        let dot = DependencyGraph::build(decls, &ctx()).unwrap().to_dot();
        assert!(dot.contains("net (network)"));
        assert!(dot.contains("cluster (compute_cluster)"));
        assert!(dot.contains("->"));
    }
}
