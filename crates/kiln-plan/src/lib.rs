//! Depth-sorted build planner.
//!
//! Walks an element's runtime and build dependencies and produces a flat,
//! deepest-first order: leaf elements (no uncached dependencies) come
//! first, so a scheduler pulling from the front of the list always has
//! work it can actually start.

use std::collections::{BTreeMap, BTreeSet};

use kiln_types::LoadError;

/// Read-only view of the dependency edges a plan walks.
///
/// Implemented by whatever owns the loaded element set (a project loader,
/// a test fixture, or `kiln-state`'s graph via a thin adapter); the planner
/// itself holds no element data.
pub trait DependencyGraph {
    /// Runtime dependencies recursed into at the same depth as `name`.
    fn runtime_dependencies(&self, name: &str) -> &[String];
    /// Build dependencies recursed into one depth deeper than `name`.
    fn build_dependencies(&self, name: &str) -> &[String];
    /// Whether `name` already has a usable artifact (locally or remotely).
    fn is_cached(&self, name: &str) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    /// Recurse into build-deps and keep cached elements in the plan anyway.
    pub ignore_cache: bool,
}

/// Produces a depth-sorted plan rooted at `roots`.
///
/// Algorithm: DFS from each root tracking the greatest depth an
/// element is observed at; runtime-deps recurse at the current depth,
/// build-deps recurse at `depth + 1` and only when the element is neither
/// cached nor `ignore_cache`; an on-stack set catches cycles. The result is
/// sorted by depth descending (ties broken by name, for determinism) and
/// already-cached elements are dropped unless `ignore_cache`.
pub fn build_plan(
    roots: &[String],
    graph: &impl DependencyGraph,
    opts: &PlanOptions,
) -> Result<Vec<String>, LoadError> {
    let mut depths: BTreeMap<String, usize> = BTreeMap::new();
    let mut on_stack: BTreeSet<String> = BTreeSet::new();

    for root in roots {
        visit(root, 0, graph, opts, &mut depths, &mut on_stack)?;
    }

    let mut ordered: Vec<(String, usize)> = depths
        .into_iter()
        .filter(|(name, _)| opts.ignore_cache || !graph.is_cached(name))
        .collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    Ok(ordered.into_iter().map(|(name, _)| name).collect())
}

fn visit(
    name: &str,
    depth: usize,
    graph: &impl DependencyGraph,
    opts: &PlanOptions,
    depths: &mut BTreeMap<String, usize>,
    on_stack: &mut BTreeSet<String>,
) -> Result<(), LoadError> {
    if on_stack.contains(name) {
        return Err(LoadError::CircularDependency(name.to_string()));
    }

    let already_deep_enough = depths.get(name).is_some_and(|&d| d >= depth);
    if already_deep_enough {
        return Ok(());
    }
    depths.insert(name.to_string(), depth);

    on_stack.insert(name.to_string());

    for dep in graph.runtime_dependencies(name) {
        visit(dep, depth, graph, opts, depths, on_stack)?;
    }

    if opts.ignore_cache || !graph.is_cached(name) {
        for dep in graph.build_dependencies(name) {
            visit(dep, depth + 1, graph, opts, depths, on_stack)?;
        }
    }

    on_stack.remove(name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[derive(Default)]
    struct FakeGraph {
        runtime: BTreeMap<String, Vec<String>>,
        build: BTreeMap<String, Vec<String>>,
        cached: BTreeSet<String>,
    }

    impl FakeGraph {
        fn runtime(mut self, name: &str, deps: &[&str]) -> Self {
            self.runtime
                .insert(name.to_string(), deps.iter().map(|s| s.to_string()).collect());
            self
        }
        fn build(mut self, name: &str, deps: &[&str]) -> Self {
            self.build
                .insert(name.to_string(), deps.iter().map(|s| s.to_string()).collect());
            self
        }
        fn cache(mut self, name: &str) -> Self {
            self.cached.insert(name.to_string());
            self
        }
    }

    impl DependencyGraph for FakeGraph {
        fn runtime_dependencies(&self, name: &str) -> &[String] {
            self.runtime.get(name).map(Vec::as_slice).unwrap_or(&[])
        }
        fn build_dependencies(&self, name: &str) -> &[String] {
            self.build.get(name).map(Vec::as_slice).unwrap_or(&[])
        }
        fn is_cached(&self, name: &str) -> bool {
            self.cached.contains(name)
        }
    }

    #[test]
    fn leaf_only_plan() {
        let g = FakeGraph::default();
        let plan = build_plan(&["a".to_string()], &g, &PlanOptions::default()).unwrap();
        assert_eq!(plan, vec!["a".to_string()]);
    }

    #[test]
    fn build_deps_sort_deeper_first() {
        let g = FakeGraph::default().build("top", &["mid"]).build("mid", &["leaf"]);
        let plan = build_plan(&["top".to_string()], &g, &PlanOptions::default()).unwrap();
        assert_eq!(plan, vec!["leaf".to_string(), "mid".to_string(), "top".to_string()]);
    }

    #[test]
    fn runtime_deps_share_depth() {
        let g = FakeGraph::default().runtime("top", &["a", "b"]);
        let plan = build_plan(&["top".to_string()], &g, &PlanOptions::default()).unwrap();
        // same depth, tie-broken alphabetically
        assert_eq!(plan, vec!["a".to_string(), "b".to_string(), "top".to_string()]);
    }

    #[test]
    fn cached_element_is_dropped_unless_ignore_cache() {
        let g = FakeGraph::default().build("top", &["leaf"]).cache("leaf");
        let plan = build_plan(&["top".to_string()], &g, &PlanOptions::default()).unwrap();
        assert_eq!(plan, vec!["top".to_string()]);

        let opts = PlanOptions { ignore_cache: true };
        let plan = build_plan(&["top".to_string()], &g, &opts).unwrap();
        assert_eq!(plan, vec!["leaf".to_string(), "top".to_string()]);
    }

    #[test]
    fn cached_element_does_not_recurse_into_its_build_deps() {
        let g = FakeGraph::default()
            .build("top", &["mid"])
            .build("mid", &["leaf"])
            .cache("mid");
        let plan = build_plan(&["top".to_string()], &g, &PlanOptions::default()).unwrap();
        assert_eq!(plan, vec!["top".to_string()]);
    }

    #[test]
    fn detects_circular_build_dependency() {
        let g = FakeGraph::default().build("a", &["b"]).build("b", &["a"]);
        let err = build_plan(&["a".to_string()], &g, &PlanOptions::default()).unwrap_err();
        assert!(matches!(err, LoadError::CircularDependency(_)));
    }

    #[test]
    fn revisiting_at_greater_depth_updates_and_recurses_again() {
        // `leaf` is reached at depth 0 via runtime-dep, then at depth 2 via
        // a deeper build-dep chain; the final depth must be the greater one.
        let g = FakeGraph::default()
            .runtime("top", &["leaf"])
            .build("top", &["mid"])
            .build("mid", &["leaf"]);
        let plan = build_plan(&["top".to_string()], &g, &PlanOptions::default()).unwrap();
        assert_eq!(plan.last(), Some(&"top".to_string()));
        let leaf_pos = plan.iter().position(|n| n == "leaf").unwrap();
        let mid_pos = plan.iter().position(|n| n == "mid").unwrap();
        assert!(leaf_pos < mid_pos);
    }

    proptest! {
        #[test]
        fn linear_build_chain_always_plans_leaf_to_root(chain_len in 1usize..12) {
            // element "n" build-depends on "n+1" for n in 0..chain_len, forming
            // a straight line with no branching or cycles.
            let names: Vec<String> = (0..=chain_len).map(|i| i.to_string()).collect();
            let mut g = FakeGraph::default();
            for i in 0..chain_len {
                g = g.build(&names[i], &[names[i + 1].as_str()]);
            }
            let root = names[0].clone();
            let plan = build_plan(&[root], &g, &PlanOptions::default()).unwrap();

            prop_assert_eq!(plan.len(), chain_len + 1);
            for i in 0..chain_len {
                let pos_dependent = plan.iter().position(|n| n == &i.to_string()).unwrap();
                let pos_dependency = plan.iter().position(|n| n == &(i + 1).to_string()).unwrap();
                prop_assert!(pos_dependency < pos_dependent);
            }
        }
    }
}
