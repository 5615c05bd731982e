use std::collections::{HashMap, HashSet};

use tokio::sync::{mpsc, oneshot};

use crate::config::FetchMode;
use crate::criteria::Criteria;
use crate::error::{Result, TreeError};
use crate::node::{LoadState, NodeId, NodeKey, Record};
use crate::store::{NodeStore, Slot};

pub type RequestId = u64;

/// A half-open row range `start..end` within one folder's child list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRange {
    pub start: usize,
    pub end: usize,
}

impl RowRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn single(row: usize) -> Self {
        Self {
            start: row,
            end: row + 1,
        }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn overlaps(&self, other: &RowRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// A child-load request handed to the record source.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub id: RequestId,
    /// Filter generation the request belongs to. Responses carrying an old
    /// generation are discarded on arrival.
    pub generation: u64,
    /// Server id of the folder to load; `None` is the tree root.
    pub parent: Option<NodeId>,
    /// Row window for paged trees; `None` asks for the complete child set.
    pub range: Option<RowRange>,
    /// Criteria the server is expected to evaluate.
    pub criteria: Criteria,
}

/// What the record source returns for one request.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub records: Vec<Record>,
    /// Server-declared total child count. `None` means the records are the
    /// complete child set.
    pub total_rows: Option<usize>,
}

/// One response merged into the cache.
#[derive(Debug)]
pub struct MergeOutcome {
    pub parent: NodeKey,
    pub attached: Vec<NodeKey>,
}

struct Pending {
    request: FetchRequest,
    parent_key: NodeKey,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

/// Future-like handle for a load triggered by `ensure_loaded`.
///
/// Resolves once every request covering the asked-for rows has merged (or
/// failed). Already-cached rows resolve immediately.
#[derive(Debug)]
pub struct LoadHandle {
    ready: Option<Result<()>>,
    receivers: Vec<oneshot::Receiver<Result<()>>>,
}

impl LoadHandle {
    fn settled(result: Result<()>) -> Self {
        Self {
            ready: Some(result),
            receivers: Vec::new(),
        }
    }

    /// A handle that is already resolved, for demands the cache can answer.
    pub(crate) fn settled_ok() -> Self {
        Self::settled(Ok(()))
    }

    fn empty() -> Self {
        Self {
            ready: None,
            receivers: Vec::new(),
        }
    }

    /// True when no fetch is outstanding for the asked-for rows.
    pub fn is_settled(&self) -> bool {
        self.receivers.is_empty()
    }

    pub async fn wait(self) -> Result<()> {
        if let Some(result) = self.ready {
            return result;
        }
        for rx in self.receivers {
            match rx.await {
                Ok(result) => result?,
                Err(_) => return Err(TreeError::FetchFailed("load cancelled".into())),
            }
        }
        Ok(())
    }
}

/// Issues child-load requests and merges responses into the store.
///
/// Guarantees, per tree:
///   - at most one request in flight for any given row of a folder
///     (overlapping demands coalesce onto the pending request),
///   - responses for the same folder merge in request-issue order, buffering
///     early arrivals,
///   - responses from before the last filter change are discarded wholesale.
pub struct FetchCoordinator {
    mode: FetchMode,
    result_size: usize,
    load_on_demand: bool,
    generation: u64,
    next_id: RequestId,
    pending: Vec<Pending>,
    arrived: HashMap<RequestId, Result<FetchResponse>>,
    request_tx: mpsc::UnboundedSender<FetchRequest>,
    criteria: Criteria,
}

impl FetchCoordinator {
    pub fn new(
        mode: FetchMode,
        result_size: usize,
        load_on_demand: bool,
        request_tx: mpsc::UnboundedSender<FetchRequest>,
    ) -> Self {
        Self {
            mode,
            result_size,
            load_on_demand,
            generation: 0,
            next_id: 1,
            pending: Vec::new(),
            arrived: HashMap::new(),
            request_tx,
            criteria: Criteria::none(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending_for(&self, parent: NodeKey) -> bool {
        self.pending.iter().any(|p| p.parent_key == parent)
    }

    /// Criteria sent with every subsequent request.
    pub fn set_criteria(&mut self, criteria: Criteria) {
        self.criteria = criteria;
    }

    /// Advance the filter generation, cancelling everything in flight.
    /// Responses for earlier generations will be discarded on arrival.
    pub fn bump_generation(&mut self) -> u64 {
        self.generation += 1;
        let dropped = self.pending.len();
        self.pending.clear();
        self.arrived.clear();
        if dropped > 0 {
            tracing::debug!(dropped, generation = self.generation, "cancelled in-flight fetches");
        }
        self.generation
    }

    /// Cancel pending fetches for a node and everything below it. Call
    /// before dropping the node's cached children.
    pub fn invalidate_scope(&mut self, store: &NodeStore, key: NodeKey) {
        let scope: HashSet<NodeKey> = store.subtree_keys(key).into_iter().collect();
        let arrived = &mut self.arrived;
        let before = self.pending.len();
        self.pending.retain(|p| {
            if scope.contains(&p.parent_key) {
                arrived.remove(&p.request.id);
                false
            } else {
                true
            }
        });
        let dropped = before - self.pending.len();
        if dropped > 0 {
            tracing::debug!(dropped, "cancelled fetches under invalidated node");
        }
    }

    /// Make sure the given rows of `parent` are loaded or being loaded,
    /// issuing the minimal set of requests. `range: None` asks for the
    /// folder's natural unit: the first window on a paged tree, the complete
    /// child set otherwise.
    pub fn ensure_loaded(
        &mut self,
        store: &mut NodeStore,
        parent: NodeKey,
        range: Option<RowRange>,
    ) -> Result<LoadHandle> {
        let node = store
            .node(parent)
            .ok_or_else(|| TreeError::DanglingReference(format!("load on unknown node {parent:?}")))?;
        if node.load_state == LoadState::FullyLoaded {
            return Ok(LoadHandle::settled(Ok(())));
        }

        let mut handle = LoadHandle::empty();
        if self.mode == FetchMode::Paged {
            let range = range.unwrap_or(RowRange::new(0, self.result_size));
            self.ensure_windows(store, parent, range, &mut handle)?;
        } else {
            match self.pending.iter().position(|p| p.parent_key == parent) {
                Some(i) => {
                    let (tx, rx) = oneshot::channel();
                    self.pending[i].waiters.push(tx);
                    handle.receivers.push(rx);
                }
                None => {
                    let rx = self.issue(store, parent, None)?;
                    handle.receivers.push(rx);
                }
            }
        }
        Ok(handle)
    }

    /// Align the demanded rows to fetch windows and issue or join one
    /// request per uncovered window.
    fn ensure_windows(
        &mut self,
        store: &mut NodeStore,
        parent: NodeKey,
        range: RowRange,
        handle: &mut LoadHandle,
    ) -> Result<()> {
        let rs = self.result_size;
        let mut wstart = (range.start / rs) * rs;
        let mut wend = range.end.div_ceil(rs) * rs;
        if let Some(total) = store.declared_child_count(parent) {
            wend = wend.min(total);
            wstart = wstart.min(wend);
        }

        let mut joined: HashSet<RequestId> = HashSet::new();
        let mut window = wstart;
        while window < wend {
            let window_end = (window + rs).min(wend);
            let covered = store
                .child_range(parent, window, window_end)
                .iter()
                .all(|s| matches!(s, Slot::Loaded(_)));
            if covered {
                window += rs;
                continue;
            }
            let w = RowRange::new(window, window_end);
            let in_flight = self.pending.iter().position(|p| {
                p.parent_key == parent && p.request.range.is_some_and(|r| r.overlaps(&w))
            });
            match in_flight {
                Some(i) => {
                    if joined.insert(self.pending[i].request.id) {
                        let (tx, rx) = oneshot::channel();
                        self.pending[i].waiters.push(tx);
                        handle.receivers.push(rx);
                    }
                }
                None => {
                    let rx = self.issue(store, parent, Some(w))?;
                    handle.receivers.push(rx);
                }
            }
            window += rs;
        }
        Ok(())
    }

    fn issue(
        &mut self,
        store: &mut NodeStore,
        parent: NodeKey,
        range: Option<RowRange>,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let parent_id = store.node(parent).and_then(|n| n.record.id.clone());
        let id = self.next_id;
        self.next_id += 1;
        let request = FetchRequest {
            id,
            generation: self.generation,
            parent: parent_id,
            range,
            criteria: self.criteria.clone(),
        };
        self.request_tx
            .send(request.clone())
            .map_err(|_| TreeError::ChannelClosed)?;
        let node = store.node_mut(parent)?;
        if node.load_state == LoadState::Unloaded {
            node.load_state = LoadState::Loading;
        }
        tracing::debug!(request = id, ?range, "issued child fetch");
        let (tx, rx) = oneshot::channel();
        self.pending.push(Pending {
            request,
            parent_key: parent,
            waiters: vec![tx],
        });
        Ok(rx)
    }

    /// Accept one response from the record source.
    ///
    /// A response merges only when it is the oldest outstanding request for
    /// its folder; earlier arrivals are buffered and drained once their
    /// predecessors land.
    pub fn handle_response(
        &mut self,
        store: &mut NodeStore,
        request_id: RequestId,
        generation: u64,
        result: Result<FetchResponse>,
    ) -> Result<Vec<MergeOutcome>> {
        if generation != self.generation {
            tracing::debug!(
                request = request_id,
                generation,
                current = self.generation,
                "discarding response from a previous filter generation"
            );
            return Ok(Vec::new());
        }
        if !self.pending.iter().any(|p| p.request.id == request_id) {
            tracing::debug!(request = request_id, "response for a cancelled request discarded");
            return Ok(Vec::new());
        }
        self.arrived.insert(request_id, result);

        let mut outcomes = Vec::new();
        loop {
            let mut ready = None;
            let mut seen = HashSet::new();
            for (i, p) in self.pending.iter().enumerate() {
                // pending is in issue order, so the first entry per parent
                // is the oldest
                if seen.insert(p.parent_key) && self.arrived.contains_key(&p.request.id) {
                    ready = Some(i);
                    break;
                }
            }
            let Some(i) = ready else { break };
            let pending = self.pending.remove(i);
            if let Some(result) = self.arrived.remove(&pending.request.id) {
                outcomes.extend(self.merge(store, pending, result)?);
            }
        }
        Ok(outcomes)
    }

    fn merge(
        &mut self,
        store: &mut NodeStore,
        pending: Pending,
        result: Result<FetchResponse>,
    ) -> Result<Vec<MergeOutcome>> {
        let parent = pending.parent_key;
        match result {
            Ok(response) => {
                if !store.contains(parent) {
                    tracing::debug!(request = pending.request.id, "fetched folder no longer cached");
                    for w in pending.waiters {
                        let _ = w.send(Ok(()));
                    }
                    return Ok(Vec::new());
                }
                // a local tree's single fetch and a bulk load both deliver
                // the whole tree as one parent-linked record set
                let whole_tree = !self.load_on_demand || self.mode == FetchMode::Local;
                let attached = match pending.request.range {
                    Some(range) => {
                        store.attach_children(parent, response.records, range.start, response.total_rows)?
                    }
                    None if whole_tree => store.link_tree(response.records)?,
                    None => {
                        store.attach_children(parent, response.records, 0, response.total_rows)?
                    }
                };
                for w in pending.waiters {
                    let _ = w.send(Ok(()));
                }
                Ok(vec![MergeOutcome { parent, attached }])
            }
            Err(err) => {
                tracing::warn!(request = pending.request.id, %err, "child fetch failed");
                // last-known-good: roll Loading back only when nothing else
                // is in flight for this folder
                if !self.pending.iter().any(|p| p.parent_key == parent) {
                    if let Some(node) = store.node(parent) {
                        if node.load_state == LoadState::Loading {
                            store.node_mut(parent)?.load_state = LoadState::Unloaded;
                        }
                    }
                }
                for w in pending.waiters {
                    let _ = w.send(Err(err.clone()));
                }
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paged(rs: usize) -> (FetchCoordinator, mpsc::UnboundedReceiver<FetchRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FetchCoordinator::new(FetchMode::Paged, rs, true, tx), rx)
    }

    fn basic() -> (FetchCoordinator, mpsc::UnboundedReceiver<FetchRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (FetchCoordinator::new(FetchMode::Basic, 75, true, tx), rx)
    }

    fn records(prefix: &str, range: RowRange) -> Vec<Record> {
        (range.start..range.end)
            .map(|i| Record::leaf(&format!("{prefix}{i}"), &format!("{prefix}{i}")))
            .collect()
    }

    #[test]
    fn row_range_overlap() {
        let a = RowRange::new(0, 75);
        assert!(a.overlaps(&RowRange::new(74, 80)));
        assert!(!a.overlaps(&RowRange::new(75, 150)));
        assert!(RowRange::single(3).overlaps(&RowRange::new(0, 75)));
    }

    #[test]
    fn demand_is_aligned_to_one_window() {
        let mut store = NodeStore::new(false, false);
        let root = store.root();
        // one known child out of 200
        store
            .attach_children(root, vec![Record::leaf("r0", "r0")], 0, Some(200))
            .unwrap();
        let (mut coord, mut rx) = paged(75);
        coord
            .ensure_loaded(&mut store, root, Some(RowRange::single(120)))
            .unwrap();
        let req = rx.try_recv().unwrap();
        assert_eq!(req.range, Some(RowRange::new(75, 150)));
        assert!(rx.try_recv().is_err(), "exactly one request expected");
    }

    #[test]
    fn overlapping_demand_joins_the_pending_request() {
        let mut store = NodeStore::new(false, false);
        let root = store.root();
        store
            .attach_children(root, vec![Record::leaf("r0", "r0")], 0, Some(10))
            .unwrap();
        let (mut coord, mut rx) = paged(2);
        coord
            .ensure_loaded(&mut store, root, Some(RowRange::single(4)))
            .unwrap();
        assert!(rx.try_recv().is_ok());
        let handle = coord
            .ensure_loaded(&mut store, root, Some(RowRange::single(5)))
            .unwrap();
        assert!(rx.try_recv().is_err(), "second demand must coalesce");
        assert!(!handle.is_settled());
        assert_eq!(coord.pending_count(), 1);
    }

    #[test]
    fn demand_beyond_total_is_clamped() {
        let mut store = NodeStore::new(false, false);
        let root = store.root();
        store
            .attach_children(root, records("r", RowRange::new(0, 2)), 0, Some(3))
            .unwrap();
        let (mut coord, mut rx) = paged(2);
        let handle = coord
            .ensure_loaded(&mut store, root, Some(RowRange::new(5, 9)))
            .unwrap();
        assert!(rx.try_recv().is_err());
        assert!(handle.is_settled());
    }

    #[test]
    fn responses_merge_in_issue_order_per_parent() {
        let mut store = NodeStore::new(false, false);
        let root = store.root();
        store
            .attach_children(root, vec![Record::leaf("seed", "seed")], 0, Some(6))
            .unwrap();
        let (mut coord, mut rx) = paged(2);
        coord
            .ensure_loaded(&mut store, root, Some(RowRange::new(2, 4)))
            .unwrap();
        coord
            .ensure_loaded(&mut store, root, Some(RowRange::new(4, 6)))
            .unwrap();
        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();

        // the later request's response arrives first: it must buffer
        let merged = coord
            .handle_response(
                &mut store,
                second.id,
                second.generation,
                Ok(FetchResponse {
                    records: records("b", RowRange::new(4, 6)),
                    total_rows: Some(6),
                }),
            )
            .unwrap();
        assert!(merged.is_empty());
        assert!(store.key_of("b4").is_none());

        // the older response lands and both merge, oldest first
        let merged = coord
            .handle_response(
                &mut store,
                first.id,
                first.generation,
                Ok(FetchResponse {
                    records: records("a", RowRange::new(2, 4)),
                    total_rows: Some(6),
                }),
            )
            .unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].parent, root);
        assert!(store.key_of("a2").is_some());
        assert!(store.key_of("b5").is_some());
        assert_eq!(coord.pending_count(), 0);
    }

    #[test]
    fn stale_generation_response_is_discarded() {
        let mut store = NodeStore::new(false, false);
        let root = store.root();
        let (mut coord, mut rx) = basic();
        coord.ensure_loaded(&mut store, root, None).unwrap();
        let req = rx.try_recv().unwrap();

        coord.bump_generation();
        let merged = coord
            .handle_response(
                &mut store,
                req.id,
                req.generation,
                Ok(FetchResponse {
                    records: records("x", RowRange::new(0, 2)),
                    total_rows: None,
                }),
            )
            .unwrap();
        assert!(merged.is_empty());
        assert!(store.key_of("x0").is_none());
        assert_eq!(store.node(root).unwrap().load_state, LoadState::Loading);
    }

    #[test]
    fn basic_fetch_merges_complete_child_set() {
        let mut store = NodeStore::new(false, false);
        let root = store.root();
        let (mut coord, mut rx) = basic();
        coord.ensure_loaded(&mut store, root, None).unwrap();
        assert_eq!(store.node(root).unwrap().load_state, LoadState::Loading);
        let req = rx.try_recv().unwrap();
        let merged = coord
            .handle_response(
                &mut store,
                req.id,
                req.generation,
                Ok(FetchResponse {
                    records: records("x", RowRange::new(0, 3)),
                    total_rows: None,
                }),
            )
            .unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].attached.len(), 3);
        assert_eq!(store.node(root).unwrap().load_state, LoadState::FullyLoaded);
    }

    #[test]
    fn bulk_mode_links_a_whole_tree() {
        let mut store = NodeStore::new(false, false);
        let root = store.root();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut coord = FetchCoordinator::new(FetchMode::Basic, 75, false, tx);
        coord.ensure_loaded(&mut store, root, None).unwrap();
        let req = rx.try_recv().unwrap();
        coord
            .handle_response(
                &mut store,
                req.id,
                req.generation,
                Ok(FetchResponse {
                    records: vec![
                        Record::folder("f", "folder"),
                        Record::leaf("c", "child").with_parent("f"),
                    ],
                    total_rows: None,
                }),
            )
            .unwrap();
        let f = store.key_of("f").unwrap();
        assert_eq!(store.node(f).unwrap().loaded_child_count(), 1);
        assert_eq!(store.node(f).unwrap().load_state, LoadState::FullyLoaded);
    }

    #[test]
    fn already_loaded_rows_settle_immediately() {
        let mut store = NodeStore::new(false, false);
        let root = store.root();
        store
            .attach_children(root, records("r", RowRange::new(0, 4)), 0, Some(4))
            .unwrap();
        let (mut coord, mut rx) = paged(2);
        let handle = coord
            .ensure_loaded(&mut store, root, Some(RowRange::new(1, 3)))
            .unwrap();
        assert!(handle.is_settled());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_fetch_resolves_waiters_with_the_error() {
        let mut store = NodeStore::new(false, false);
        let root = store.root();
        let (mut coord, mut rx) = basic();
        let handle = coord.ensure_loaded(&mut store, root, None).unwrap();
        let req = rx.try_recv().unwrap();
        coord
            .handle_response(
                &mut store,
                req.id,
                req.generation,
                Err(TreeError::FetchFailed("boom".into())),
            )
            .unwrap();
        assert_eq!(store.node(root).unwrap().load_state, LoadState::Unloaded);
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err, TreeError::FetchFailed("boom".into()));
    }

    #[tokio::test]
    async fn generation_bump_cancels_waiters() {
        let mut store = NodeStore::new(false, false);
        let root = store.root();
        let (mut coord, _rx) = basic();
        let handle = coord.ensure_loaded(&mut store, root, None).unwrap();
        coord.bump_generation();
        assert_eq!(coord.pending_count(), 0);
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, TreeError::FetchFailed(_)));
    }

    #[test]
    fn invalidate_scope_drops_pending_below_the_node() {
        let mut store = NodeStore::new(false, false);
        let root = store.root();
        let f = store
            .attach_children(root, vec![Record::folder("f", "f")], 0, None)
            .unwrap()[0];
        let (mut coord, _rx) = basic();
        coord.ensure_loaded(&mut store, f, None).unwrap();
        assert_eq!(coord.pending_count(), 1);
        coord.invalidate_scope(&store, root);
        assert_eq!(coord.pending_count(), 0);
    }
}
