//! Client-side filtering and the flattened row view.
//!
//! Filtering never mutates the cache: the full data stays in the store and
//! the filter only controls which rows the flattened view emits, so
//! relaxing or removing criteria is a pure re-derivation.

use crate::config::{FetchMode, FilterMode, TreeConfig};
use crate::criteria::Criteria;
use crate::error::Result;
use crate::node::NodeKey;
use crate::store::{NodeStore, Slot};

/// One visible row of the flattened tree, top to bottom in depth-first
/// expansion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatRow {
    pub parent: NodeKey,
    pub child_index: usize,
    pub slot: Slot,
    pub depth: usize,
}

/// Build the visible row list: children of expanded folders, in order,
/// placeholder gaps included.
pub fn flatten(
    store: &NodeStore,
    criteria: &Criteria,
    mode: FilterMode,
    filter_locally: bool,
) -> Vec<FlatRow> {
    let mut rows = Vec::new();
    if filter_locally && !criteria.is_empty() {
        walk_filtered(store, store.root(), 1, criteria, mode, &mut rows);
    } else {
        walk_plain(store, store.root(), 1, &mut rows);
    }
    rows
}

fn row_count(store: &NodeStore, parent: NodeKey) -> usize {
    store
        .declared_child_count(parent)
        .unwrap_or_else(|| store.node(parent).map_or(0, |n| n.children.len()))
}

fn walk_plain(store: &NodeStore, parent: NodeKey, depth: usize, rows: &mut Vec<FlatRow>) {
    let count = row_count(store, parent);
    for (i, slot) in store.child_range(parent, 0, count).into_iter().enumerate() {
        rows.push(FlatRow {
            parent,
            child_index: i,
            slot,
            depth,
        });
        if let Slot::Loaded(key) = slot {
            if store.node(key).is_some_and(|n| n.expanded && n.is_folder()) {
                walk_plain(store, key, depth + 1, rows);
            }
        }
    }
}

/// Filtered walk. Placeholder gaps always survive: an unfetched row cannot
/// be evaluated on the client.
fn walk_filtered(
    store: &NodeStore,
    parent: NodeKey,
    depth: usize,
    criteria: &Criteria,
    mode: FilterMode,
    rows: &mut Vec<FlatRow>,
) {
    let count = row_count(store, parent);
    for (i, slot) in store.child_range(parent, 0, count).into_iter().enumerate() {
        let row = FlatRow {
            parent,
            child_index: i,
            slot,
            depth,
        };
        let Slot::Loaded(key) = slot else {
            rows.push(row);
            continue;
        };
        let Some(node) = store.node(key) else { continue };
        let matched = criteria.matches(&node.record);
        match mode {
            FilterMode::Strict => {
                if matched {
                    rows.push(row);
                    if node.expanded && node.is_folder() {
                        walk_filtered(store, key, depth + 1, criteria, mode, rows);
                    }
                }
            }
            FilterMode::KeepParents => {
                // survival needs the children's verdict even when collapsed
                let mut sub = Vec::new();
                if node.is_folder() {
                    walk_filtered(store, key, depth + 1, criteria, mode, &mut sub);
                }
                let unloaded_folder = node.is_folder() && !node.children_loaded();
                if matched || !sub.is_empty() || unloaded_folder {
                    rows.push(row);
                    if node.expanded {
                        rows.append(&mut sub);
                    }
                }
            }
        }
    }
}

/// What a criteria change requires of the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CriteriaOutcome {
    /// Same criteria by value; nothing to do.
    Unchanged,
    /// Cached data is a superset of the new result set; re-derive the view
    /// on the client without touching the cache.
    LocalRefilter { client: Criteria },
    /// The cache cannot answer the new criteria; drop it and refetch.
    Refetch { server: Criteria, client: Criteria },
}

/// Decide how to honor new criteria given the fetch strategy.
///
/// Basic and paged trees hold server-filtered data, so any real change
/// means a refetch with the full criteria. A local tree holds everything
/// its server subset allows; only a change to that subset forces a refetch.
pub fn plan_criteria_change(
    config: &TreeConfig,
    current: &Criteria,
    new: &Criteria,
) -> Result<CriteriaOutcome> {
    if current.same_as(new) {
        return Ok(CriteriaOutcome::Unchanged);
    }
    match config.effective_fetch_mode() {
        FetchMode::Local => {
            let (server, client) = new.split(config.server_filter_fields())?;
            let (current_server, _) = current.split(config.server_filter_fields())?;
            if server.same_as(&current_server) {
                Ok(CriteriaOutcome::LocalRefilter { client })
            } else {
                Ok(CriteriaOutcome::Refetch { server, client })
            }
        }
        FetchMode::Basic | FetchMode::Paged => Ok(CriteriaOutcome::Refetch {
            server: new.clone(),
            client: Criteria::none(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::criteria::Clause;
    use crate::node::Record;

    /// root ├ docs/ ├ report.txt, notes.md
    ///      └ src/  └ main.rs
    fn sample_store() -> NodeStore {
        let mut s = NodeStore::new(false, false);
        let root = s.root();
        let folders = s
            .attach_children(
                root,
                vec![Record::folder("docs", "docs"), Record::folder("src", "src")],
                0,
                None,
            )
            .unwrap();
        s.attach_children(
            folders[0],
            vec![
                Record::leaf("r", "report.txt"),
                Record::leaf("n", "notes.md"),
            ],
            0,
            None,
        )
        .unwrap();
        s.attach_children(folders[1], vec![Record::leaf("m", "main.rs")], 0, None)
            .unwrap();
        s.set_expanded(folders[0], true);
        s.set_expanded(folders[1], true);
        s
    }

    fn names(store: &NodeStore, rows: &[FlatRow]) -> Vec<String> {
        rows.iter()
            .map(|r| match r.slot {
                Slot::Loaded(k) => store.node(k).unwrap().record.name.clone(),
                Slot::Placeholder => "<gap>".to_string(),
            })
            .collect()
    }

    #[test]
    fn plain_flatten_walks_expanded_folders() {
        let s = sample_store();
        let rows = flatten(&s, &Criteria::none(), FilterMode::Strict, true);
        assert_eq!(
            names(&s, &rows),
            ["docs", "report.txt", "notes.md", "src", "main.rs"]
        );
        assert_eq!(rows[0].depth, 1);
        assert_eq!(rows[1].depth, 2);
    }

    #[test]
    fn plain_flatten_keeps_placeholder_gaps() {
        let mut s = NodeStore::new(false, false);
        let root = s.root();
        s.attach_children(root, vec![Record::leaf("a", "a")], 0, Some(3))
            .unwrap();
        let rows = flatten(&s, &Criteria::none(), FilterMode::Strict, true);
        assert_eq!(names(&s, &rows), ["a", "<gap>", "<gap>"]);
    }

    #[test]
    fn strict_filter_drops_nonmatching_subtrees() {
        let s = sample_store();
        let criteria = Criteria::all(vec![Clause::contains("name", "s")]);
        let rows = flatten(&s, &criteria, FilterMode::Strict, true);
        // report.txt has no "s" and is the only casualty
        assert_eq!(names(&s, &rows), ["docs", "notes.md", "src", "main.rs"]);
    }

    #[test]
    fn strict_filter_drops_children_of_dropped_folders() {
        let s = sample_store();
        let criteria = Criteria::all(vec![Clause::contains("name", "main")]);
        let rows = flatten(&s, &criteria, FilterMode::Strict, true);
        // no folder matches, so nothing survives even though main.rs would
        assert!(rows.is_empty());
    }

    #[test]
    fn keep_parents_retains_the_ancestor_chain() {
        let s = sample_store();
        let criteria = Criteria::all(vec![Clause::contains("name", "main")]);
        let rows = flatten(&s, &criteria, FilterMode::KeepParents, true);
        assert_eq!(names(&s, &rows), ["src", "main.rs"]);
    }

    #[test]
    fn keep_parents_retains_unloaded_folders() {
        let mut s = NodeStore::new(false, false);
        let root = s.root();
        s.attach_children(
            root,
            vec![
                Record::folder("u", "unexplored").with_child_count(9),
                Record::leaf("x", "nomatch"),
            ],
            0,
            None,
        )
        .unwrap();
        let criteria = Criteria::all(vec![Clause::contains("name", "zzz")]);
        let rows = flatten(&s, &criteria, FilterMode::KeepParents, true);
        assert_eq!(names(&s, &rows), ["unexplored"]);
    }

    #[test]
    fn collapsed_surviving_folder_hides_its_rows() {
        let mut s = sample_store();
        let src = s.key_of("src").unwrap();
        s.set_expanded(src, false);
        let criteria = Criteria::all(vec![Clause::contains("name", "main")]);
        let rows = flatten(&s, &criteria, FilterMode::KeepParents, true);
        assert_eq!(names(&s, &rows), ["src"]);
    }

    #[test]
    fn removing_criteria_restores_the_full_view() {
        let s = sample_store();
        let criteria = Criteria::all(vec![Clause::contains("name", "main")]);
        let filtered = flatten(&s, &criteria, FilterMode::KeepParents, true);
        assert_eq!(filtered.len(), 2);
        let unfiltered = flatten(&s, &Criteria::none(), FilterMode::KeepParents, true);
        assert_eq!(unfiltered.len(), 5);
    }

    #[test]
    fn server_side_filtering_skips_the_local_walk() {
        let s = sample_store();
        let criteria = Criteria::all(vec![Clause::contains("name", "main")]);
        let rows = flatten(&s, &criteria, FilterMode::Strict, false);
        assert_eq!(rows.len(), 5, "server-filtered data is shown as-is");
    }

    fn local_config() -> TreeConfig {
        TreeConfig {
            fetch_mode: Some(FetchMode::Local),
            server_filter_fields: Some(vec!["owner".to_string()]),
            ..Default::default()
        }
    }

    #[test]
    fn unchanged_criteria_are_detected_by_value() {
        let cfg = local_config();
        let a = Criteria::all(vec![
            Clause::equals("owner", "kim"),
            Clause::contains("name", "rep"),
        ]);
        let b = Criteria::all(vec![
            Clause::contains("name", "rep"),
            Clause::equals("owner", "kim"),
        ]);
        assert_eq!(
            plan_criteria_change(&cfg, &a, &b).unwrap(),
            CriteriaOutcome::Unchanged
        );
    }

    #[test]
    fn client_only_change_refilters_locally() {
        let cfg = local_config();
        let current = Criteria::all(vec![Clause::equals("owner", "kim")]);
        let new = Criteria::all(vec![
            Clause::equals("owner", "kim"),
            Clause::contains("name", "rep"),
        ]);
        match plan_criteria_change(&cfg, &current, &new).unwrap() {
            CriteriaOutcome::LocalRefilter { client } => {
                assert_eq!(client.clauses().len(), 1);
                assert_eq!(client.clauses()[0].field, "name");
            }
            other => panic!("expected local refilter, got {other:?}"),
        }
    }

    #[test]
    fn server_subset_change_forces_refetch() {
        let cfg = local_config();
        let current = Criteria::all(vec![Clause::equals("owner", "kim")]);
        let new = Criteria::all(vec![Clause::equals("owner", "lee")]);
        assert!(matches!(
            plan_criteria_change(&cfg, &current, &new).unwrap(),
            CriteriaOutcome::Refetch { .. }
        ));
    }

    #[test]
    fn basic_tree_always_refetches_on_change() {
        let cfg = TreeConfig::default();
        let new = Criteria::all(vec![Clause::contains("name", "rep")]);
        match plan_criteria_change(&cfg, &Criteria::none(), &new).unwrap() {
            CriteriaOutcome::Refetch { server, client } => {
                assert_eq!(server.clauses().len(), 1);
                assert!(client.is_empty());
            }
            other => panic!("expected refetch, got {other:?}"),
        }
    }

    #[test]
    fn keep_parents_on_basic_refilters_locally() {
        // keep-parents shifts a basic tree to local strategy, so a filter
        // change must not drop the cache
        let cfg = TreeConfig {
            keep_parents_on_filter: Some(true),
            ..Default::default()
        };
        let new = Criteria::all(vec![Clause::contains("name", "rep")]);
        assert!(matches!(
            plan_criteria_change(&cfg, &Criteria::none(), &new).unwrap(),
            CriteriaOutcome::LocalRefilter { .. }
        ));
    }
}
