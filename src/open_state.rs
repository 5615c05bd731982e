use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::config::PreserveOpenState;
use crate::node::{NodeId, NodeKey};
use crate::store::NodeStore;

/// A value snapshot of which folders are expanded, detached from the live
/// cache so it survives a full reload.
///
/// Identity capture records server ids; positional capture records child
/// index paths from root. Positional matching can attach state to a node
/// that merely occupies the same position after a structural change, which
/// is why it only happens under the `Always` policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpenState {
    Ids(BTreeSet<NodeId>),
    Paths(BTreeSet<Vec<usize>>),
}

impl OpenState {
    /// Snapshot the expanded folders of `store` under the given policy.
    ///
    /// Returns `None` when the policy forbids preservation: always for
    /// `Never`, and for `WhenUnique` when any expanded folder lacks a
    /// unique id.
    pub fn capture(store: &NodeStore, policy: PreserveOpenState) -> Option<OpenState> {
        if policy == PreserveOpenState::Never {
            return None;
        }
        let expanded: Vec<NodeKey> = store
            .subtree_keys(store.root())
            .into_iter()
            .filter(|&k| k != store.root())
            .filter(|&k| store.node(k).is_some_and(|n| n.expanded))
            .collect();

        let mut ids = BTreeSet::new();
        let mut identifiable = true;
        for &key in &expanded {
            match store.node(key).and_then(|n| n.record.id.clone()) {
                Some(id) => {
                    if !ids.insert(id) {
                        identifiable = false;
                        break;
                    }
                }
                None => {
                    identifiable = false;
                    break;
                }
            }
        }

        if identifiable {
            return Some(OpenState::Ids(ids));
        }
        match policy {
            PreserveOpenState::Always => {
                let paths = expanded.iter().filter_map(|&k| store.path_to(k)).collect();
                Some(OpenState::Paths(paths))
            }
            _ => {
                tracing::debug!("expanded folders not uniquely identifiable, open state dropped");
                None
            }
        }
    }

    /// Whether the snapshot marks this node as expanded.
    pub fn contains(&self, store: &NodeStore, key: NodeKey) -> bool {
        match self {
            OpenState::Ids(ids) => store
                .node(key)
                .and_then(|n| n.record.id.as_ref())
                .is_some_and(|id| ids.contains(id)),
            OpenState::Paths(paths) => store.path_to(key).is_some_and(|p| paths.contains(&p)),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            OpenState::Ids(ids) => ids.is_empty(),
            OpenState::Paths(paths) => paths.is_empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Record;

    fn store_with_open_folders() -> (NodeStore, NodeKey, NodeKey) {
        let mut s = NodeStore::new(false, false);
        let root = s.root();
        let keys = s
            .attach_children(
                root,
                vec![Record::folder("f1", "first"), Record::folder("f2", "second")],
                0,
                None,
            )
            .unwrap();
        let inner = s
            .attach_children(keys[0], vec![Record::folder("f1a", "inner")], 0, None)
            .unwrap()[0];
        s.set_expanded(keys[0], true);
        s.set_expanded(inner, true);
        (s, keys[0], inner)
    }

    #[test]
    fn never_captures_nothing() {
        let (s, _, _) = store_with_open_folders();
        assert_eq!(OpenState::capture(&s, PreserveOpenState::Never), None);
    }

    #[test]
    fn when_unique_captures_ids() {
        let (s, outer, inner) = store_with_open_folders();
        let state = OpenState::capture(&s, PreserveOpenState::WhenUnique).unwrap();
        assert!(state.contains(&s, outer));
        assert!(state.contains(&s, inner));
        let closed = s.key_of("f2").unwrap();
        assert!(!state.contains(&s, closed));
        match state {
            OpenState::Ids(ids) => assert_eq!(ids.len(), 2),
            OpenState::Paths(_) => panic!("expected identity capture"),
        }
    }

    #[test]
    fn when_unique_gives_up_without_ids() {
        let mut s = NodeStore::new(true, false);
        let root = s.root();
        let keys = s
            .attach_children(
                root,
                vec![Record {
                    name: "anonymous".into(),
                    is_folder: Some(true),
                    ..Default::default()
                }],
                0,
                None,
            )
            .unwrap();
        s.set_expanded(keys[0], true);
        assert_eq!(OpenState::capture(&s, PreserveOpenState::WhenUnique), None);
    }

    #[test]
    fn always_falls_back_to_paths() {
        let mut s = NodeStore::new(true, false);
        let root = s.root();
        let keys = s
            .attach_children(
                root,
                vec![
                    Record {
                        name: "anonymous".into(),
                        is_folder: Some(true),
                        ..Default::default()
                    },
                    Record::folder("f2", "named"),
                ],
                0,
                None,
            )
            .unwrap();
        s.set_expanded(keys[0], true);
        let state = OpenState::capture(&s, PreserveOpenState::Always).unwrap();
        match &state {
            OpenState::Paths(paths) => assert!(paths.contains(&vec![0])),
            OpenState::Ids(_) => panic!("expected positional capture"),
        }
        assert!(state.contains(&s, keys[0]));
        assert!(!state.contains(&s, keys[1]));
    }

    #[test]
    fn positional_state_matches_whatever_sits_there_now() {
        let (s, _, _) = store_with_open_folders();
        let mut paths = BTreeSet::new();
        paths.insert(vec![1]);
        let state = OpenState::Paths(paths);
        // f2 occupies index 1, so it matches regardless of identity
        let f2 = s.key_of("f2").unwrap();
        assert!(state.contains(&s, f2));
    }

    #[test]
    fn capture_is_stable_across_duplicate_captures() {
        let (s, _, _) = store_with_open_folders();
        let a = OpenState::capture(&s, PreserveOpenState::WhenUnique);
        let b = OpenState::capture(&s, PreserveOpenState::WhenUnique);
        assert_eq!(a, b);
    }
}
