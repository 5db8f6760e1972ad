//! Group trees — hierarchical arrangement of run specs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::RunSpecId;
use crate::runspec::RunSpec;

/// A node in the group hierarchy. The root group has id `/`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Group {
    /// Run specs directly under this group, keyed by id.
    pub apps: BTreeMap<RunSpecId, RunSpec>,
    /// Child groups, keyed by their path id.
    pub groups: BTreeMap<RunSpecId, Group>,
    /// Version timestamp of this tree revision.
    pub version: u64,
}

impl Group {
    /// Group containing the given run specs at the top level.
    pub fn with_apps(apps: impl IntoIterator<Item = RunSpec>, version: u64) -> Self {
        Self {
            apps: apps.into_iter().map(|a| (a.id.clone(), a)).collect(),
            groups: BTreeMap::new(),
            version,
        }
    }

    /// All run specs in this group and every transitive child group.
    pub fn transitive_run_specs(&self) -> Vec<&RunSpec> {
        let mut out: Vec<&RunSpec> = self.apps.values().collect();
        for child in self.groups.values() {
            out.extend(child.transitive_run_specs());
        }
        out
    }

    /// Ids of all transitive run specs.
    pub fn transitive_ids(&self) -> Vec<RunSpecId> {
        self.transitive_run_specs()
            .into_iter()
            .map(|s| s.id.clone())
            .collect()
    }

    /// Find a run spec anywhere in the tree.
    pub fn find_run_spec(&self, id: &RunSpecId) -> Option<&RunSpec> {
        if let Some(spec) = self.apps.get(id) {
            return Some(spec);
        }
        self.groups.values().find_map(|g| g.find_run_spec(id))
    }

    /// Whether the tree contains no run specs at all.
    pub fn is_empty(&self) -> bool {
        self.apps.is_empty() && self.groups.values().all(Group::is_empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(path: &str) -> RunSpecId {
        RunSpecId::parse(path).unwrap()
    }

    fn nested_tree() -> Group {
        let mut root = Group::with_apps([RunSpec::app(id("/top"), 1)], 1);
        let child = Group::with_apps(
            [
                RunSpec::app(id("/foo/app1"), 2),
                RunSpec::app(id("/foo/app2"), 1),
            ],
            1,
        );
        root.groups.insert(id("/foo"), child);
        root
    }

    #[test]
    fn transitive_walk_covers_children() {
        let tree = nested_tree();
        let mut ids = tree.transitive_ids();
        ids.sort();
        assert_eq!(ids, vec![id("/foo/app1"), id("/foo/app2"), id("/top")]);
    }

    #[test]
    fn find_descends_into_groups() {
        let tree = nested_tree();
        assert_eq!(tree.find_run_spec(&id("/foo/app2")).unwrap().instances, 1);
        assert!(tree.find_run_spec(&id("/foo/nope")).is_none());
    }

    #[test]
    fn emptiness_ignores_empty_subgroups() {
        let mut root = Group::default();
        root.groups.insert(id("/empty"), Group::default());
        assert!(root.is_empty());
        root.apps
            .insert(id("/app"), RunSpec::app(id("/app"), 1));
        assert!(!root.is_empty());
    }
}
