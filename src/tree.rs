//! The tree facade: one object owning the store, the fetch coordinator and
//! the flattened row view, driven by an event loop.
//!
//! All cache mutation happens on the thread that calls `handle_event` (or
//! `pump`); the only asynchrony is at the record-source boundary, where
//! requests leave through a channel and completions come back as events.

use tokio::sync::mpsc;

use crate::config::{FetchMode, TreeConfig};
use crate::criteria::Criteria;
use crate::error::{Result, TreeError};
use crate::event::{spawn_record_source, RecordSource, TreeEvent, TreeNotice};
use crate::fetch::{FetchCoordinator, FetchRequest, LoadHandle, RowRange};
use crate::filter::{flatten, plan_criteria_change, CriteriaOutcome, FlatRow};
use crate::node::{Node, NodeKey};
use crate::open_state::OpenState;
use crate::store::{NodeStore, Slot};
use crate::sync::{self, SyncOutcome};

/// What lives at a visible row index.
#[derive(Debug)]
pub enum Row {
    Loaded(NodeKey),
    /// Not cached yet. A fetch has been triggered; the handle resolves when
    /// the row's window has merged.
    Pending(LoadHandle),
}

/// A lazily-loaded, optionally paged view of a server-resident tree.
pub struct ResultTree {
    config: TreeConfig,
    store: NodeStore,
    coordinator: FetchCoordinator,
    /// Criteria as set by the caller.
    criteria: Criteria,
    /// Client-evaluated subset of `criteria` under local filtering.
    local_criteria: Criteria,
    rows: Vec<FlatRow>,
    /// Open-state snapshot still being reapplied after a reload.
    restore_target: Option<OpenState>,
    event_tx: mpsc::UnboundedSender<TreeEvent>,
    event_rx: mpsc::UnboundedReceiver<TreeEvent>,
    request_rx: Option<mpsc::UnboundedReceiver<FetchRequest>>,
}

impl ResultTree {
    pub fn new(config: TreeConfig) -> Result<Self> {
        config.validate()?;
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let store = NodeStore::new(config.default_is_folder(), config.discard_parentless());
        let coordinator = FetchCoordinator::new(
            config.effective_fetch_mode(),
            config.result_size(),
            config.load_on_demand(),
            request_tx,
        );
        Ok(Self {
            config,
            store,
            coordinator,
            criteria: Criteria::none(),
            local_criteria: Criteria::none(),
            rows: Vec::new(),
            restore_target: None,
            event_tx,
            event_rx,
            request_rx: Some(request_rx),
        })
    }

    /// The stream of fetch requests, for callers driving a source by hand.
    /// Taken once; `connect_source` consumes it too.
    pub fn take_request_stream(&mut self) -> Option<mpsc::UnboundedReceiver<FetchRequest>> {
        self.request_rx.take()
    }

    /// Sender for feeding externally observed record changes (and fetch
    /// completions) into the tree.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<TreeEvent> {
        self.event_tx.clone()
    }

    /// Wire a record source to this tree's request stream.
    pub fn connect_source<S: RecordSource>(
        &mut self,
        source: S,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let request_rx = self.request_rx.take().ok_or(TreeError::ChannelClosed)?;
        Ok(spawn_record_source(source, request_rx, self.event_tx.clone()))
    }

    /// Kick off the initial load: the first window on a paged tree, root's
    /// children on a basic one, the whole tree on a local or bulk one.
    pub fn start(&mut self) -> Result<LoadHandle> {
        let root = self.store.root();
        let handle = self.coordinator.ensure_loaded(&mut self.store, root, None)?;
        self.reflatten();
        Ok(handle)
    }

    // ── The flattened view ───────────────────────────────────────────────────

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn rows(&self) -> &[FlatRow] {
        &self.rows
    }

    pub fn node(&self, key: NodeKey) -> Option<&Node> {
        self.store.node(key)
    }

    pub fn key_of(&self, id: &str) -> Option<NodeKey> {
        self.store.key_of(id)
    }

    /// Look up a visible row. Never blocks: a row that is not cached comes
    /// back as `Pending` with its fetch already under way.
    pub fn get_row(&mut self, index: usize) -> Result<Option<Row>> {
        let Some(row) = self.rows.get(index).copied() else {
            return Ok(None);
        };
        match row.slot {
            Slot::Loaded(key) => Ok(Some(Row::Loaded(key))),
            Slot::Placeholder => {
                let handle = self.coordinator.ensure_loaded(
                    &mut self.store,
                    row.parent,
                    Some(RowRange::single(row.child_index)),
                )?;
                Ok(Some(Row::Pending(handle)))
            }
        }
    }

    // ── Expansion ────────────────────────────────────────────────────────────

    /// Expand a folder, fetching its children (or first window) if absent.
    /// Expanding a loaded folder or a leaf settles immediately.
    pub fn expand(&mut self, key: NodeKey) -> Result<LoadHandle> {
        let node = self
            .store
            .node(key)
            .ok_or_else(|| TreeError::DanglingReference(format!("expand of unknown node {key:?}")))?;
        if !node.is_folder() {
            return Ok(LoadHandle::settled_ok());
        }
        self.store.set_expanded(key, true);
        let handle = self.coordinator.ensure_loaded(&mut self.store, key, None)?;
        self.reflatten();
        Ok(handle)
    }

    /// Collapse a folder. Cached children stay cached.
    pub fn collapse(&mut self, key: NodeKey) {
        self.store.set_expanded(key, false);
        self.reflatten();
    }

    // ── Filtering ────────────────────────────────────────────────────────────

    pub fn criteria(&self) -> &Criteria {
        &self.criteria
    }

    /// Change the filter. Returns a handle when the change forces a refetch,
    /// `None` when it was absorbed client-side.
    pub fn set_criteria(&mut self, criteria: Criteria) -> Result<Option<LoadHandle>> {
        match plan_criteria_change(&self.config, &self.criteria, &criteria)? {
            CriteriaOutcome::Unchanged => Ok(None),
            CriteriaOutcome::LocalRefilter { client } => {
                self.criteria = criteria;
                self.local_criteria = client;
                self.reflatten();
                Ok(None)
            }
            CriteriaOutcome::Refetch { server, client } => {
                self.criteria = criteria;
                self.local_criteria = client;
                self.reload_with(server).map(Some)
            }
        }
    }

    // ── Cache lifecycle ──────────────────────────────────────────────────────

    /// Drop the whole cache and refetch under the current criteria,
    /// preserving open state per the configured policy.
    pub fn reload(&mut self) -> Result<LoadHandle> {
        let server = self.server_criteria()?;
        self.reload_with(server)
    }

    /// Same as [`reload`](Self::reload), for callers thinking in cache
    /// terms.
    pub fn invalidate_cache(&mut self) -> Result<LoadHandle> {
        self.reload()
    }

    /// Drop one folder's cached children and refetch them if it is open.
    /// In-flight loads below the folder are cancelled first.
    pub fn invalidate_node(&mut self, key: NodeKey) -> Result<LoadHandle> {
        self.coordinator.invalidate_scope(&self.store, key);
        self.store.invalidate(key)?;
        let open = self
            .store
            .node(key)
            .is_some_and(|n| n.expanded && n.is_folder());
        let handle = if open {
            self.coordinator.ensure_loaded(&mut self.store, key, None)?
        } else {
            LoadHandle::settled_ok()
        };
        self.reflatten();
        Ok(handle)
    }

    fn server_criteria(&self) -> Result<Criteria> {
        if self.config.effective_fetch_mode() == FetchMode::Local {
            Ok(self.criteria.split(self.config.server_filter_fields())?.0)
        } else {
            Ok(self.criteria.clone())
        }
    }

    fn reload_with(&mut self, server: Criteria) -> Result<LoadHandle> {
        self.restore_target = OpenState::capture(&self.store, self.config.preserve_open_state());
        self.coordinator.bump_generation();
        self.coordinator.set_criteria(server);
        self.store = NodeStore::new(
            self.config.default_is_folder(),
            self.config.discard_parentless(),
        );
        let root = self.store.root();
        let handle = self.coordinator.ensure_loaded(&mut self.store, root, None)?;
        self.reflatten();
        Ok(handle)
    }

    // ── Open state ───────────────────────────────────────────────────────────

    /// Snapshot the expanded folders, by identity when possible and by
    /// position otherwise.
    pub fn open_state(&self) -> Option<OpenState> {
        OpenState::capture(&self.store, crate::config::PreserveOpenState::Always)
    }

    /// Reapply a snapshot: close everything, then reopen what it marks,
    /// fetching closed-over folders as needed. Idempotent.
    pub fn set_open_state(&mut self, state: OpenState) -> Result<()> {
        let root = self.store.root();
        for key in self.store.subtree_keys(root) {
            if key != root {
                self.store.set_expanded(key, false);
            }
        }
        self.restore_target = Some(state);
        self.apply_restore()?;
        self.reflatten();
        Ok(())
    }

    /// One cascade step of open-state restoration: reopen every marked
    /// folder that is now cached, loading the ones whose children are still
    /// missing. Clears the target once nothing is outstanding.
    fn apply_restore(&mut self) -> Result<()> {
        let Some(target) = self.restore_target.clone() else {
            return Ok(());
        };
        let mut outstanding = false;
        let root = self.store.root();
        for key in self.store.subtree_keys(root) {
            if key == root || !target.contains(&self.store, key) {
                continue;
            }
            self.store.set_expanded(key, true);
            let loaded = self.store.node(key).is_some_and(|n| n.children_loaded());
            if !loaded {
                self.coordinator.ensure_loaded(&mut self.store, key, None)?;
                outstanding = true;
            }
        }
        if !outstanding {
            self.restore_target = None;
        }
        Ok(())
    }

    // ── Event loop ───────────────────────────────────────────────────────────

    /// Process one event. Returns the consumer-visible notices it caused.
    pub fn handle_event(&mut self, event: TreeEvent) -> Result<Vec<TreeNotice>> {
        match event {
            TreeEvent::FetchCompleted {
                request,
                generation,
                result,
            } => {
                let outcomes =
                    self.coordinator
                        .handle_response(&mut self.store, request, generation, result)?;
                if outcomes.is_empty() {
                    return Ok(Vec::new());
                }
                self.apply_restore()?;
                self.reflatten();
                Ok(outcomes
                    .iter()
                    .map(|o| TreeNotice::DataArrived { parent: o.parent })
                    .collect())
            }
            TreeEvent::RecordsChanged(change) => {
                let outcome =
                    sync::apply_change(&mut self.store, self.config.new_records_to_root(), change)?;
                match outcome {
                    SyncOutcome::Applied => {
                        self.reflatten();
                        Ok(vec![TreeNotice::CacheUpdated])
                    }
                    SyncOutcome::Ignored => Ok(Vec::new()),
                }
            }
        }
    }

    /// Await and process the next event.
    pub async fn pump(&mut self) -> Result<Vec<TreeNotice>> {
        match self.event_rx.recv().await {
            Some(event) => self.handle_event(event),
            None => Err(TreeError::ChannelClosed),
        }
    }

    /// Process everything already queued without waiting.
    pub fn drain_events(&mut self) -> Result<Vec<TreeNotice>> {
        let mut notices = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            notices.extend(self.handle_event(event)?);
        }
        Ok(notices)
    }

    fn reflatten(&mut self) {
        let filter_locally = self.config.effective_fetch_mode() == FetchMode::Local;
        self.rows = flatten(
            &self.store,
            &self.local_criteria,
            self.config.filter_mode(),
            filter_locally,
        );
    }
}
