//! Applying external record changes to an already-loaded tree cache.
//!
//! Changes come from the same server the tree fetches from (another view
//! saved an edit, a push notification arrived). They are applied in place
//! without refetching; a change that cannot be placed is dropped with a
//! debug log rather than treated as an error.

use crate::error::Result;
use crate::node::{NodeId, Record};
use crate::store::NodeStore;

/// One externally observed record change.
#[derive(Debug, Clone)]
pub enum RecordChange {
    Added(Record),
    Updated(Record),
    Removed(NodeId),
}

/// Whether a change took effect on the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied,
    /// Dropped: stale version, unknown target, or an unplaceable parent.
    Ignored,
}

/// Apply one change to the cache. Idempotent: applying the same change
/// twice leaves the cache as after the first application.
///
/// `new_records_to_root` controls where an added record with no resolvable
/// parent goes: under root when true, dropped when false.
///
/// Versioned records guard against out-of-order delivery: a change strictly
/// older than the cached version is ignored, an equal version overwrites
/// (latest write wins).
pub fn apply_change(
    store: &mut NodeStore,
    new_records_to_root: bool,
    change: RecordChange,
) -> Result<SyncOutcome> {
    match change {
        RecordChange::Added(record) => apply_upsert(store, new_records_to_root, record),
        RecordChange::Updated(record) => apply_upsert(store, new_records_to_root, record),
        RecordChange::Removed(id) => match store.key_of(&id) {
            Some(key) => {
                store.remove(key)?;
                Ok(SyncOutcome::Applied)
            }
            None => {
                tracing::debug!(%id, "removal of uncached record ignored");
                Ok(SyncOutcome::Ignored)
            }
        },
    }
}

/// Adds and updates share one path: an add for a cached id behaves as an
/// update, an update for an uncached id behaves as an add. Sync streams
/// deliver both orderings.
fn apply_upsert(
    store: &mut NodeStore,
    new_records_to_root: bool,
    record: Record,
) -> Result<SyncOutcome> {
    let existing = record.id.as_deref().and_then(|id| store.key_of(id));
    match existing {
        Some(key) => update_cached(store, new_records_to_root, key, record),
        None => add_new(store, new_records_to_root, record),
    }
}

fn add_new(
    store: &mut NodeStore,
    new_records_to_root: bool,
    record: Record,
) -> Result<SyncOutcome> {
    let parent = match record.parent_id.as_deref() {
        Some(pid) => match store.key_of(pid) {
            Some(key) => key,
            None if new_records_to_root => store.root(),
            None => {
                tracing::debug!(parent_id = %pid, "added record has no cached parent, dropped");
                return Ok(SyncOutcome::Ignored);
            }
        },
        None => store.root(),
    };

    if store.node(parent).is_some_and(|n| n.children_loaded()) {
        store.insert(record, parent, usize::MAX)?;
    } else {
        // children not cached yet; keep the declared total honest so the
        // row shows up once the folder loads
        let node = store.node_mut(parent)?;
        if let Some(count) = node.record.child_count.as_mut() {
            *count += 1;
        }
        node.record.is_folder = Some(true);
    }
    Ok(SyncOutcome::Applied)
}

fn update_cached(
    store: &mut NodeStore,
    new_records_to_root: bool,
    key: crate::node::NodeKey,
    record: Record,
) -> Result<SyncOutcome> {
    let node = store.node_mut(key)?;
    if let (Some(cached), Some(incoming)) = (node.record.version, record.version) {
        if incoming < cached {
            tracing::debug!(
                id = node.record.id.as_deref().unwrap_or(""),
                cached,
                incoming,
                "stale update ignored"
            );
            return Ok(SyncOutcome::Ignored);
        }
    }

    let old_parent = node.parent;
    let new_parent = match record.parent_id.as_deref() {
        Some(pid) => store.key_of(pid),
        None => Some(store.root()),
    };

    match new_parent {
        Some(pk) if Some(pk) == old_parent => {
            let record = store.normalize(record);
            store.node_mut(key)?.record = record;
        }
        Some(pk) => {
            let record = store.normalize(record);
            store.node_mut(key)?.record = record;
            store.move_node(key, pk, usize::MAX)?;
        }
        None if new_records_to_root => {
            let record = store.normalize(record);
            store.node_mut(key)?.record = record;
            store.move_node(key, store.root(), usize::MAX)?;
        }
        None => {
            // moved under a folder we have not cached; the record leaves
            // our view
            store.remove(key)?;
        }
    }
    Ok(SyncOutcome::Applied)
}
