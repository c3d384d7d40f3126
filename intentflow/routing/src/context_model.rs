//! Context model: command inheritance (`base`) and structural ancestry (`parent`).
//!
//! The two relations share a name space but nothing else. Each one is resolved by its
//! own memoised walk with its own visiting set, so a cycle in one never masks or
//! triggers a cycle report in the other.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    fs,
    path::Path,
    sync::Arc,
};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::{
    directory::COMMANDS_DIR,
    error::{Relation, Result, RoutingError},
    names::{self, WILDCARD_CONTEXT},
};

/// Inheritance map file, inside `_commands`.
pub const CONTEXT_INHERITANCE_FILE: &str = "context_inheritance_model.json";
/// Hierarchy map file, at the workflow root.
pub const CONTEXT_HIERARCHY_FILE: &str = "context_hierarchy_model.json";

/// Provides the commands discovered for each context.
pub trait ContextCommandSource: Send + Sync {
    /// Every context with discovered commands.
    fn context_names(&self) -> Vec<String>;
    /// Qualified names discovered for `context`, `None` when it has no folder.
    fn context_commands(&self, context: &str) -> Option<Vec<String>>;
}

/// One entry of the inheritance file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InheritanceEntry {
    /// Base contexts; `None` when the key is absent or null.
    #[serde(default)]
    pub base: Option<Vec<String>>,
}

/// One entry of the hierarchy file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HierarchyEntry {
    /// Structural parents.
    #[serde(default)]
    pub parent: Vec<String>,
}

/// Declared inheritance, keyed by context.
pub type InheritanceMap = BTreeMap<String, InheritanceEntry>;
/// Declared hierarchy, keyed by context; `null` entries have no parents.
pub type HierarchyMap = BTreeMap<String, Option<HierarchyEntry>>;

/// Memoised walk over one relation.
///
/// A context is unvisited until first requested, visiting while it sits on the
/// current walk, and resolved once its result is cached. Resolved is terminal.
#[derive(Debug)]
struct Resolution {
    relation: Relation,
    resolved: Mutex<HashMap<String, Vec<String>>>,
}

impl Resolution {
    fn new(relation: Relation) -> Self {
        Self {
            relation,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    fn cached(&self, context: &str) -> Option<Vec<String>> {
        self.resolved.lock().get(context).cloned()
    }

    fn enter(&self, context: &str, visiting: &mut Vec<String>) -> Result<()> {
        if let Some(pos) = visiting.iter().position(|name| name == context) {
            let mut chain = visiting[pos..].to_vec();
            chain.push(context.to_string());
            return Err(RoutingError::CycleDetected {
                relation: self.relation,
                chain,
            });
        }
        visiting.push(context.to_string());
        Ok(())
    }

    fn finish(&self, context: &str, value: Vec<String>, visiting: &mut Vec<String>) -> Vec<String> {
        visiting.pop();
        self.resolved
            .lock()
            .insert(context.to_string(), value.clone());
        value
    }
}

/// Resolves effective command lists and ancestor chains per context.
pub struct ContextModel {
    source: Arc<dyn ContextCommandSource>,
    inheritance: BTreeMap<String, Vec<String>>,
    hierarchy: BTreeMap<String, Vec<String>>,
    contexts: BTreeSet<String>,
    commands: Resolution,
    ancestors: Resolution,
}

impl std::fmt::Debug for ContextModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextModel")
            .field("contexts", &self.contexts)
            .field("inheritance", &self.inheritance)
            .field("hierarchy", &self.hierarchy)
            .finish_non_exhaustive()
    }
}

impl ContextModel {
    /// Reads both relation files under `root` (each optional) and validates them.
    pub fn load(root: &Path, source: Arc<dyn ContextCommandSource>) -> Result<Self> {
        let inheritance: InheritanceMap =
            read_optional(&root.join(COMMANDS_DIR).join(CONTEXT_INHERITANCE_FILE))?
                .unwrap_or_default();
        let hierarchy: HierarchyMap =
            read_optional(&root.join(CONTEXT_HIERARCHY_FILE))?.unwrap_or_default();
        Self::new(source, inheritance, hierarchy)
    }

    /// Builds and validates a model from already parsed relations.
    pub fn new(
        source: Arc<dyn ContextCommandSource>,
        inheritance: InheritanceMap,
        hierarchy: HierarchyMap,
    ) -> Result<Self> {
        let mut contexts: BTreeSet<String> = source.context_names().into_iter().collect();
        contexts.extend(inheritance.keys().cloned());
        contexts.insert(WILDCARD_CONTEXT.to_string());

        let mut bases = BTreeMap::new();
        for (context, entry) in inheritance {
            let base = match entry.base {
                Some(base) => base,
                None if has_commands(source.as_ref(), &context) => Vec::new(),
                None => return Err(RoutingError::MissingBase(context)),
            };
            if let Some(unknown) = base.iter().find(|name| !contexts.contains(*name)) {
                return Err(RoutingError::UnknownBase {
                    context,
                    base: unknown.clone(),
                });
            }
            bases.insert(context, base);
        }

        let hierarchy = hierarchy
            .into_iter()
            .map(|(context, entry)| (context, entry.map(|e| e.parent).unwrap_or_default()))
            .collect();

        Ok(Self {
            source,
            inheritance: bases,
            hierarchy,
            contexts,
            commands: Resolution::new(Relation::Inheritance),
            ancestors: Resolution::new(Relation::Hierarchy),
        })
    }

    /// Known contexts (discovered, declared and `*`), sorted.
    #[must_use]
    pub fn contexts(&self) -> Vec<String> {
        self.contexts.iter().cloned().collect()
    }

    /// True when `context` is known.
    #[must_use]
    pub fn contains(&self, context: &str) -> bool {
        self.contexts.contains(context)
    }

    /// Declared bases of `context`.
    #[must_use]
    pub fn bases(&self, context: &str) -> &[String] {
        self.inheritance.get(context).map_or(&[], Vec::as_slice)
    }

    /// Declared structural parents of `context`.
    #[must_use]
    pub fn parents(&self, context: &str) -> &[String] {
        self.hierarchy.get(context).map_or(&[], Vec::as_slice)
    }

    /// Effective qualified commands of `context`: own commands plus inherited ones
    /// whose simple name is not already taken, sorted.
    pub fn commands(&self, context: &str) -> Result<Vec<String>> {
        if !self.contains(context) {
            return Err(RoutingError::UnknownContext(context.to_string()));
        }
        self.resolve_commands(context, &mut Vec::new())
    }

    fn resolve_commands(&self, context: &str, visiting: &mut Vec<String>) -> Result<Vec<String>> {
        if let Some(cached) = self.commands.cached(context) {
            return Ok(cached);
        }
        self.commands.enter(context, visiting)?;

        let mut by_simple: BTreeMap<String, String> = self
            .source
            .context_commands(context)
            .unwrap_or_default()
            .into_iter()
            .map(|qualified| (names::simple_name(&qualified).to_string(), qualified))
            .collect();
        for base in self.bases(context) {
            for inherited in self.resolve_commands(base, visiting)? {
                by_simple
                    .entry(names::simple_name(&inherited).to_string())
                    .or_insert(inherited);
            }
        }

        let mut resolved: Vec<String> = by_simple.into_values().collect();
        resolved.sort();
        Ok(self.commands.finish(context, resolved, visiting))
    }

    /// Transitive structural ancestors of `context`, nearest first, without duplicates.
    pub fn get_ancestor_contexts(&self, context: &str) -> Result<Vec<String>> {
        self.resolve_ancestors(context, &mut Vec::new())
    }

    fn resolve_ancestors(&self, context: &str, visiting: &mut Vec<String>) -> Result<Vec<String>> {
        if let Some(cached) = self.ancestors.cached(context) {
            return Ok(cached);
        }
        self.ancestors.enter(context, visiting)?;

        let parents = self.parents(context);
        let mut ancestors: Vec<String> = Vec::new();
        for parent in parents {
            push_unique(&mut ancestors, parent);
        }
        for parent in parents {
            for ancestor in self.resolve_ancestors(parent, visiting)? {
                push_unique(&mut ancestors, &ancestor);
            }
        }
        Ok(self.ancestors.finish(context, ancestors, visiting))
    }
}

fn has_commands(source: &dyn ContextCommandSource, context: &str) -> bool {
    source
        .context_commands(context)
        .is_some_and(|commands| !commands.is_empty())
}

fn push_unique(list: &mut Vec<String>, name: &str) {
    if !list.iter().any(|existing| existing == name) {
        list.push(name.to_string());
    }
}

fn read_optional<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    if !path.is_file() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|err| RoutingError::io(path, err))?;
    serde_json::from_str(&raw)
        .map(Some)
        .map_err(|err| RoutingError::json(path, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSource {
        commands: BTreeMap<String, Vec<String>>,
        lookups: AtomicUsize,
    }

    impl CountingSource {
        fn with(entries: &[(&str, &[&str])]) -> Arc<Self> {
            Arc::new(Self {
                commands: entries
                    .iter()
                    .map(|(ctx, cmds)| {
                        (
                            (*ctx).to_string(),
                            cmds.iter().map(|c| names::qualify(ctx, c)).collect(),
                        )
                    })
                    .collect(),
                lookups: AtomicUsize::new(0),
            })
        }
    }

    impl ContextCommandSource for CountingSource {
        fn context_names(&self) -> Vec<String> {
            self.commands.keys().cloned().collect()
        }

        fn context_commands(&self, context: &str) -> Option<Vec<String>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.commands.get(context).cloned()
        }
    }

    fn inheritance(value: serde_json::Value) -> InheritanceMap {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn own_commands_override_inherited() {
        let source = CountingSource::with(&[
            ("Order", &["cancel", "track"]),
            ("Refund", &["cancel"]),
        ]);
        let model = ContextModel::new(
            source,
            inheritance(json!({ "Refund": { "base": ["Order"] } })),
            HierarchyMap::new(),
        )
        .unwrap();
        assert_eq!(
            model.commands("Refund").unwrap(),
            vec!["Order/track", "Refund/cancel"]
        );
    }

    #[test]
    fn inheritance_cycle_is_reported_with_chain() {
        let model = ContextModel::new(
            CountingSource::with(&[]),
            inheritance(json!({ "X": { "base": ["Y"] }, "Y": { "base": ["X"] } })),
            HierarchyMap::new(),
        )
        .unwrap();
        match model.commands("X") {
            Err(RoutingError::CycleDetected { relation, chain }) => {
                assert_eq!(relation, Relation::Inheritance);
                assert_eq!(chain, vec!["X", "Y", "X"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn resolution_is_memoised() {
        let source = CountingSource::with(&[("Order", &["cancel"]), ("Vip", &["upgrade"])]);
        let model = ContextModel::new(
            source.clone(),
            inheritance(json!({ "Vip": { "base": ["Order"] } })),
            HierarchyMap::new(),
        )
        .unwrap();
        let first = model.commands("Vip").unwrap();
        let lookups = source.lookups.load(Ordering::SeqCst);
        let second = model.commands("Vip").unwrap();
        assert_eq!(first, second);
        assert_eq!(source.lookups.load(Ordering::SeqCst), lookups);
    }

    #[test]
    fn base_rules_are_validated() {
        let missing = ContextModel::new(
            CountingSource::with(&[]),
            inheritance(json!({ "Ghost": {} })),
            HierarchyMap::new(),
        );
        assert!(matches!(missing, Err(RoutingError::MissingBase(ref c)) if c == "Ghost"));

        let with_commands = ContextModel::new(
            CountingSource::with(&[("Order", &["cancel"])]),
            inheritance(json!({ "Order": { "base": null } })),
            HierarchyMap::new(),
        );
        assert!(with_commands.is_ok());

        let unknown = ContextModel::new(
            CountingSource::with(&[("Order", &["cancel"])]),
            inheritance(json!({ "Order": { "base": ["Nowhere"] } })),
            HierarchyMap::new(),
        );
        assert!(matches!(unknown, Err(RoutingError::UnknownBase { .. })));
    }

    #[test]
    fn declared_empty_context_is_known() {
        let model = ContextModel::new(
            CountingSource::with(&[("Order", &["cancel"])]),
            inheritance(json!({ "Alias": { "base": ["Order"] } })),
            HierarchyMap::new(),
        )
        .unwrap();
        assert_eq!(model.contexts(), vec!["*", "Alias", "Order"]);
        assert_eq!(model.commands("Alias").unwrap(), vec!["Order/cancel"]);
        assert!(matches!(
            model.commands("Nope"),
            Err(RoutingError::UnknownContext(_))
        ));
    }

    #[test]
    fn ancestors_are_nearest_first_and_deduplicated() {
        let hierarchy: HierarchyMap = serde_json::from_value(json!({
            "Item": { "parent": ["Order", "Cart"] },
            "Order": { "parent": ["Customer"] },
            "Cart": { "parent": ["Customer"] },
            "Customer": null
        }))
        .unwrap();
        let model =
            ContextModel::new(CountingSource::with(&[]), InheritanceMap::new(), hierarchy).unwrap();
        assert_eq!(
            model.get_ancestor_contexts("Item").unwrap(),
            vec!["Order", "Cart", "Customer"]
        );
        assert!(model.get_ancestor_contexts("Unlisted").unwrap().is_empty());
    }

    #[test]
    fn relations_keep_separate_visiting_sets() {
        let hierarchy: HierarchyMap = serde_json::from_value(json!({
            "A": { "parent": ["B"] },
            "B": { "parent": ["A"] }
        }))
        .unwrap();
        let model = ContextModel::new(
            CountingSource::with(&[("A", &["one"]), ("B", &["two"])]),
            inheritance(json!({ "A": { "base": ["B"] } })),
            hierarchy,
        )
        .unwrap();
        assert_eq!(model.commands("A").unwrap(), vec!["A/one", "B/two"]);
        assert!(matches!(
            model.get_ancestor_contexts("A"),
            Err(RoutingError::CycleDetected {
                relation: Relation::Hierarchy,
                ..
            })
        ));
    }
}
