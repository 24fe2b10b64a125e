//! An in-memory loaded project: elements plus their dependency edges,
//! standing in for the YAML element loader kept out of scope.
//! Callers build a [`Project`] directly (a test fixture, or a future
//! loader crate) and hand it to [`crate::session::BuildSession`].

use std::collections::BTreeMap;

use kiln_cachekey::CanonicalValue;
use kiln_types::{Element, LoadError};

/// A loaded set of elements, keyed by name, with their dependency edges
/// already resolved to other names in the same project.
#[derive(Debug, Default, Clone)]
pub struct Project {
    elements: BTreeMap<String, Element>,
}

impl Project {
    pub fn new() -> Self {
        Project::default()
    }

    /// Adds an element, rejecting the ones that fail `Element::validate`
    /// (the junction no-dependencies invariant).
    pub fn insert(&mut self, element: Element) -> Result<(), LoadError> {
        element.validate()?;
        self.elements.insert(element.name.clone(), element);
        Ok(())
    }

    pub fn element(&self, name: &str) -> Option<&Element> {
        self.elements.get(name)
    }

    pub fn elements(&self) -> &BTreeMap<String, Element> {
        &self.elements
    }

    pub fn contains(&self, name: &str) -> bool {
        self.elements.contains_key(name)
    }

    /// The forward build-dependency edges every element declares, the shape
    /// [`kiln_state::StateGraph::new`] wants.
    pub fn build_deps_map(&self) -> BTreeMap<String, Vec<String>> {
        self.elements.iter().map(|(name, el)| (name.clone(), el.build_dependencies.clone())).collect()
    }

    /// The element's `config_dict`: kind, configuration,
    /// variables, and environment (minus `environment_nocache` keys),
    /// folded into a [`CanonicalValue::Map`] so its serialization is
    /// deterministic regardless of the source `BTreeMap`'s insertion order.
    pub fn config_dict(&self, name: &str) -> CanonicalValue {
        let Some(element) = self.elements.get(name) else {
            return CanonicalValue::Null;
        };

        let mut top = BTreeMap::new();
        top.insert("kind".to_string(), CanonicalValue::Str(element.kind.clone()));

        let config: BTreeMap<String, CanonicalValue> =
            element.configuration.iter().map(|(k, v)| (k.clone(), json_to_canonical(v))).collect();
        top.insert("config".to_string(), CanonicalValue::Map(config));

        let variables: BTreeMap<String, CanonicalValue> =
            element.variables.iter().map(|(k, v)| (k.clone(), CanonicalValue::Str(v.clone()))).collect();
        top.insert("variables".to_string(), CanonicalValue::Map(variables));

        let environment: BTreeMap<String, CanonicalValue> = element
            .environment
            .iter()
            .filter(|(k, _)| !element.environment_nocache.contains(k))
            .map(|(k, v)| (k.clone(), CanonicalValue::Str(v.clone())))
            .collect();
        top.insert("environment".to_string(), CanonicalValue::Map(environment));

        CanonicalValue::Map(top)
    }

    /// The transitive closure of `roots` over both dependency kinds — the
    /// set of elements a build of `roots` makes `required`.
    pub fn closure(&self, roots: &[String]) -> Vec<String> {
        let mut seen: Vec<String> = Vec::new();
        let mut stack: Vec<String> = roots.to_vec();
        while let Some(name) = stack.pop() {
            if seen.contains(&name) {
                continue;
            }
            seen.push(name.clone());
            if let Some(element) = self.elements.get(&name) {
                stack.extend(element.build_dependencies.iter().cloned());
                stack.extend(element.runtime_dependencies.iter().cloned());
            }
        }
        seen
    }
}

fn json_to_canonical(value: &serde_json::Value) -> CanonicalValue {
    match value {
        serde_json::Value::Null => CanonicalValue::Null,
        serde_json::Value::Bool(b) => CanonicalValue::Bool(*b),
        serde_json::Value::Number(n) => {
            n.as_i64().map(CanonicalValue::Int).unwrap_or_else(|| CanonicalValue::Float(n.as_f64().unwrap_or_default()))
        }
        serde_json::Value::String(s) => CanonicalValue::Str(s.clone()),
        serde_json::Value::Array(items) => CanonicalValue::List(items.iter().map(json_to_canonical).collect()),
        serde_json::Value::Object(fields) => {
            CanonicalValue::Map(fields.iter().map(|(k, v)| (k.clone(), json_to_canonical(v))).collect())
        }
    }
}

/// Adapter exposing a [`Project`] (plus a caller-supplied local-cache
/// predicate) as a [`kiln_plan::DependencyGraph`], so the planner doesn't
/// need to know how caching is actually checked.
pub struct PlanGraph<'a, F: Fn(&str) -> bool> {
    project: &'a Project,
    is_cached: F,
}

impl<'a, F: Fn(&str) -> bool> PlanGraph<'a, F> {
    pub fn new(project: &'a Project, is_cached: F) -> Self {
        PlanGraph { project, is_cached }
    }
}

impl<'a, F: Fn(&str) -> bool> kiln_plan::DependencyGraph for PlanGraph<'a, F> {
    fn runtime_dependencies(&self, name: &str) -> &[String] {
        self.project.element(name).map(|e| e.runtime_dependencies.as_slice()).unwrap_or(&[])
    }

    fn build_dependencies(&self, name: &str) -> &[String] {
        self.project.element(name).map(|e| e.build_dependencies.as_slice()).unwrap_or(&[])
    }

    fn is_cached(&self, name: &str) -> bool {
        (self.is_cached)(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_rejects_invalid_junction() {
        let mut project = Project::new();
        let mut junction = Element::new("base.bst", "junction");
        junction.build_dependencies.push("other.bst".to_string());
        assert!(project.insert(junction).is_err());
    }

    #[test]
    fn config_dict_excludes_nocache_environment_keys() {
        let mut project = Project::new();
        let mut el = Element::new("a.bst", "manual");
        el.environment.insert("PATH".to_string(), "/usr/bin".to_string());
        el.environment.insert("BUILD_TIMESTAMP".to_string(), "12345".to_string());
        el.environment_nocache.push("BUILD_TIMESTAMP".to_string());
        project.insert(el).unwrap();

        let CanonicalValue::Map(top) = project.config_dict("a.bst") else { panic!("expected map") };
        let CanonicalValue::Map(env) = &top["environment"] else { panic!("expected map") };
        assert!(env.contains_key("PATH"));
        assert!(!env.contains_key("BUILD_TIMESTAMP"));
    }

    #[test]
    fn closure_walks_both_dependency_kinds() {
        let mut project = Project::new();
        let mut top = Element::new("top.bst", "manual");
        top.build_dependencies.push("mid.bst".to_string());
        let mut mid = Element::new("mid.bst", "manual");
        mid.runtime_dependencies.push("leaf.bst".to_string());
        let leaf = Element::new("leaf.bst", "manual");
        project.insert(top).unwrap();
        project.insert(mid).unwrap();
        project.insert(leaf).unwrap();

        let mut closure = project.closure(&["top.bst".to_string()]);
        closure.sort();
        assert_eq!(closure, vec!["leaf.bst".to_string(), "mid.bst".to_string(), "top.bst".to_string()]);
    }
}
