//! The shared variable store mutated by cell execution.

use std::collections::BTreeMap;

use rustc_hash::FxHashMap;

use super::value::Value;
use crate::graph::CellId;

/// Single mapping from variable name to value, shared by every cell of a
/// session. Each binding remembers the cell that wrote it, so bindings can be
/// dropped when their owner is edited, fails or is deleted.
#[derive(Debug, Default, Clone)]
pub struct Namespace {
    values: FxHashMap<String, Value>,
    owners: FxHashMap<String, CellId>,
}

impl Namespace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn owner(&self, name: &str) -> Option<&CellId> {
        self.owners.get(name)
    }

    /// Create or overwrite a binding on behalf of `owner`.
    pub fn insert(&mut self, owner: &CellId, name: impl Into<String>, value: Value) {
        let name = name.into();
        self.owners.insert(name.clone(), owner.clone());
        self.values.insert(name, value);
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.owners.remove(name);
        self.values.remove(name)
    }

    /// Names currently bound by `owner`, sorted.
    pub fn owned_by(&self, owner: &CellId) -> Vec<String> {
        let mut names: Vec<String> = self
            .owners
            .iter()
            .filter(|(_, o)| *o == owner)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Drop every binding owned by `owner`. Returns the dropped names.
    pub fn remove_owned(&mut self, owner: &CellId) -> Vec<String> {
        self.remove_owned_except(owner, |_| false)
    }

    /// Drop bindings owned by `owner` for which `keep` returns false.
    pub fn remove_owned_except(
        &mut self,
        owner: &CellId,
        keep: impl Fn(&str) -> bool,
    ) -> Vec<String> {
        let dropped: Vec<String> = self
            .owned_by(owner)
            .into_iter()
            .filter(|name| !keep(name))
            .collect();
        for name in &dropped {
            self.remove(name);
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Sorted copy of all bindings.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_tracking() {
        let a = CellId::from("a");
        let b = CellId::from("b");
        let mut ns = Namespace::new();
        ns.insert(&a, "x", Value::Int(1));
        ns.insert(&a, "y", Value::Int(2));
        ns.insert(&b, "z", Value::Int(3));

        assert_eq!(ns.owned_by(&a), vec!["x", "y"]);
        assert_eq!(ns.owner("z"), Some(&b));

        let dropped = ns.remove_owned_except(&a, |name| name == "y");
        assert_eq!(dropped, vec!["x"]);
        assert!(!ns.contains("x"));
        assert!(ns.contains("y"));
        assert!(ns.contains("z"));
    }

    #[test]
    fn test_overwrite_transfers_ownership() {
        let a = CellId::from("a");
        let b = CellId::from("b");
        let mut ns = Namespace::new();
        ns.insert(&a, "x", Value::Int(1));
        ns.insert(&b, "x", Value::Int(2));

        assert!(ns.remove_owned(&a).is_empty());
        assert_eq!(ns.get("x"), Some(&Value::Int(2)));
    }
}
