//! Tree configuration: fetch strategy, paging, filter and cache-sync policies.
//!
//! All fields are optional so that partial configs from different sources
//! (deserialized files, programmatic overrides) can be merged together;
//! convenience getters apply the built-in defaults.

use serde::Deserialize;

use crate::error::{Result, TreeError};

/// Fetch strategy, selected per tree at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMode {
    /// Any filter change discards the tree and re-fetches; children are
    /// fetched folder-by-folder on first expansion (or the whole tree in
    /// one response when incremental loading is off).
    Basic,
    /// Like basic, but children of a folder are fetched in fixed-size
    /// windows with read-ahead. Requires discoverable child totals.
    Paged,
    /// All data fetched once, unfiltered; later filter changes are handled
    /// entirely on the client.
    Local,
}

/// How local filtering treats ancestors of matching descendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterMode {
    /// Only nodes that match survive; a folder that does not match is
    /// dropped along with everything below it.
    Strict,
    /// A folder is retained if it matches, has a surviving descendant, or
    /// has not loaded its children yet.
    KeepParents,
}

/// Open-state preservation policy across full reloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreserveOpenState {
    /// Never preserve; folders come back closed.
    Never,
    /// Preserve by identity when every expanded node is uniquely
    /// identifiable, otherwise not at all.
    WhenUnique,
    /// Preserve by identity when possible, else by structural position.
    /// Positional matching can attach state to unrelated nodes after
    /// structural changes; it is an explicit opt-in.
    Always,
}

/// Tree cache configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TreeConfig {
    /// Fetch strategy. Default: basic.
    pub fetch_mode: Option<FetchMode>,
    /// Window size for paged fetches. Default: 75.
    pub result_size: Option<usize>,
    /// Load children folder-by-folder on first expansion. When off, the
    /// whole tree arrives in one parent-linked response. Default: true.
    pub load_on_demand: Option<bool>,
    /// Keep ancestor folders of matching descendants when filtering.
    /// Default: false (strict filtering).
    pub keep_parents_on_filter: Option<bool>,
    /// Field names evaluated by the server when criteria are split under
    /// local filtering. Default: empty.
    pub server_filter_fields: Option<Vec<String>>,
    /// Open-state preservation across reloads. Default: when_unique.
    pub preserve_open_state: Option<PreserveOpenState>,
    /// Whether fetched records whose parent reference resolves to no known
    /// node are dropped (true) or attached under the requested folder
    /// (false). Default: false.
    pub discard_parentless: Option<bool>,
    /// Whether synced records with no resolvable parent are attached under
    /// root (true) or dropped (false). Default: false.
    pub new_records_to_root: Option<bool>,
    /// Whether a node without an explicit folder flag is assumed to be a
    /// folder. Default: follows `load_on_demand`.
    pub default_is_folder: Option<bool>,
}

/// Default paged fetch window size.
pub const DEFAULT_RESULT_SIZE: usize = 75;

impl TreeConfig {
    /// Merge `other` on top of `self` — `other`'s `Some` values win.
    pub fn merge(self, other: &TreeConfig) -> TreeConfig {
        TreeConfig {
            fetch_mode: other.fetch_mode.or(self.fetch_mode),
            result_size: other.result_size.or(self.result_size),
            load_on_demand: other.load_on_demand.or(self.load_on_demand),
            keep_parents_on_filter: other
                .keep_parents_on_filter
                .or(self.keep_parents_on_filter),
            server_filter_fields: other
                .server_filter_fields
                .clone()
                .or(self.server_filter_fields),
            preserve_open_state: other.preserve_open_state.or(self.preserve_open_state),
            discard_parentless: other.discard_parentless.or(self.discard_parentless),
            new_records_to_root: other.new_records_to_root.or(self.new_records_to_root),
            default_is_folder: other.default_is_folder.or(self.default_is_folder),
        }
    }

    /// Reject configurations that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.result_size == Some(0) {
            return Err(TreeError::InvalidConfig(
                "result_size must be at least 1".into(),
            ));
        }
        if self.fetch_mode() == FetchMode::Paged && !self.load_on_demand() {
            return Err(TreeError::InvalidConfig(
                "paged fetching requires load_on_demand".into(),
            ));
        }
        Ok(())
    }

    // ── Convenience getters with built-in defaults ──────────────────────────

    pub fn fetch_mode(&self) -> FetchMode {
        self.fetch_mode.unwrap_or(FetchMode::Basic)
    }

    /// The strategy actually used: keep-parents filtering on a basic tree
    /// shifts all filtering to the client, so the tree behaves as local.
    /// Keep-parents on a paged tree stays paged; the server is then
    /// required to evaluate the full criteria.
    pub fn effective_fetch_mode(&self) -> FetchMode {
        match (self.fetch_mode(), self.keep_parents_on_filter()) {
            (FetchMode::Basic, true) => FetchMode::Local,
            (mode, _) => mode,
        }
    }

    pub fn result_size(&self) -> usize {
        self.result_size.unwrap_or(DEFAULT_RESULT_SIZE)
    }

    pub fn load_on_demand(&self) -> bool {
        self.load_on_demand.unwrap_or(true)
    }

    pub fn keep_parents_on_filter(&self) -> bool {
        self.keep_parents_on_filter.unwrap_or(false)
    }

    pub fn filter_mode(&self) -> FilterMode {
        if self.keep_parents_on_filter() {
            FilterMode::KeepParents
        } else {
            FilterMode::Strict
        }
    }

    pub fn server_filter_fields(&self) -> &[String] {
        self.server_filter_fields.as_deref().unwrap_or(&[])
    }

    pub fn preserve_open_state(&self) -> PreserveOpenState {
        self.preserve_open_state
            .unwrap_or(PreserveOpenState::WhenUnique)
    }

    pub fn discard_parentless(&self) -> bool {
        self.discard_parentless.unwrap_or(false)
    }

    pub fn new_records_to_root(&self) -> bool {
        self.new_records_to_root.unwrap_or(false)
    }

    pub fn default_is_folder(&self) -> bool {
        self.default_is_folder.unwrap_or_else(|| self.load_on_demand())
    }
}
