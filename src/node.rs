use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Identity of a record as assigned by the server. Unique across the whole
/// tree when present; may be absent for trees in positional mode.
pub type NodeId = String;

/// Arena key of a cached node. Stable for the lifetime of the node within
/// one tree generation; never reused across removals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeKey(pub(crate) u64);

/// An opaque server record plus the tree metadata the cache cares about.
///
/// Payload fields beyond the known metadata are kept in `fields`, accessed
/// by name rather than by runtime shape probing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Record {
    pub id: Option<NodeId>,
    /// `None` means child of root.
    pub parent_id: Option<NodeId>,
    pub name: String,
    /// Explicit folder flag; when absent, folderness is derived from the
    /// presence of children or the store's default.
    pub is_folder: Option<bool>,
    /// Total number of children, for folders returned with a partial child
    /// list in paged multi-level responses.
    pub child_count: Option<usize>,
    /// Per-record version used to detect stale sync notifications.
    pub version: Option<u64>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Record {
    /// A leaf record with an id and display name.
    pub fn leaf(id: &str, name: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            name: name.to_string(),
            is_folder: Some(false),
            ..Default::default()
        }
    }

    /// A folder record with an id and display name.
    pub fn folder(id: &str, name: &str) -> Self {
        Self {
            id: Some(id.to_string()),
            name: name.to_string(),
            is_folder: Some(true),
            ..Default::default()
        }
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_child_count(mut self, count: usize) -> Self {
        self.child_count = Some(count);
        self
    }

    /// Look up a field by name for criteria matching. The display name is
    /// addressable as the `"name"` field.
    pub fn field(&self, name: &str) -> Option<Value> {
        if name == "name" {
            return Some(Value::String(self.name.clone()));
        }
        self.fields.get(name).cloned()
    }
}

/// Whether a node may own children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Folder,
    Leaf,
}

/// Per-folder load state.
///
/// Monotonic except on explicit invalidation: it only advances
/// Unloaded -> Loading -> (Partially|Fully)Loaded, and invalidation resets
/// it to Unloaded while dropping cached children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    /// Some children are cached; `child_count` is the server-declared total.
    PartiallyLoaded { child_count: usize },
    FullyLoaded,
}

/// A cached tree node: record payload, parent back-reference and child slots.
///
/// The parent exclusively owns the child list; `parent` is a non-owning key
/// kept for upward navigation only. A `None` child slot is an explicit
/// placeholder gap that has not been fetched yet.
#[derive(Debug)]
pub struct Node {
    pub key: NodeKey,
    pub parent: Option<NodeKey>,
    pub record: Record,
    pub children: Vec<Option<NodeKey>>,
    pub load_state: LoadState,
    pub expanded: bool,
    pub depth: usize,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        if self.is_folder() {
            NodeKind::Folder
        } else {
            NodeKind::Leaf
        }
    }

    pub fn is_folder(&self) -> bool {
        self.record.is_folder.unwrap_or(false)
            || !self.children.is_empty()
            || self.record.child_count.is_some()
    }

    /// Whether any children have been attached (fully or partially).
    pub fn children_loaded(&self) -> bool {
        matches!(
            self.load_state,
            LoadState::PartiallyLoaded { .. } | LoadState::FullyLoaded
        )
    }

    /// Keys of the currently cached children, skipping placeholder gaps.
    pub fn loaded_children(&self) -> impl Iterator<Item = NodeKey> + '_ {
        self.children.iter().filter_map(|slot| *slot)
    }

    /// Number of cached (non-placeholder) children.
    pub fn loaded_child_count(&self) -> usize {
        self.children.iter().filter(|slot| slot.is_some()).count()
    }
}
