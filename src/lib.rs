//! Lazily-loaded, optionally paged cache for server-resident trees.
//!
//! A [`ResultTree`] mirrors a hierarchical data set that lives on a server:
//! folders load their children on first expansion (whole or in fixed-size
//! windows), unfetched rows show up as placeholders instead of blocking,
//! and filter changes either re-derive the view from cache or discard it
//! and refetch, depending on the configured strategy.
//!
//! The cache itself is a synchronous state machine; asynchrony exists only
//! at the record-source boundary. Requests leave through a channel, and
//! completions (plus externally observed record changes) come back as
//! [`TreeEvent`]s which the owner feeds through [`ResultTree::handle_event`]
//! or [`ResultTree::pump`].
//!
//! ```no_run
//! use lazytree::{ResultTree, TreeConfig, FetchMode};
//!
//! # async fn demo() -> lazytree::Result<()> {
//! let mut tree = ResultTree::new(TreeConfig {
//!     fetch_mode: Some(FetchMode::Paged),
//!     ..Default::default()
//! })?;
//! // tree.connect_source(my_source)?;
//! tree.start()?;
//! while tree.pump().await?.is_empty() {}
//! println!("{} visible rows", tree.row_count());
//! # Ok(())
//! # }
//! ```

mod config;
mod criteria;
mod error;
mod event;
mod fetch;
mod filter;
mod node;
mod open_state;
mod store;
mod sync;
mod tree;

pub use config::{
    FetchMode, FilterMode, PreserveOpenState, TreeConfig, DEFAULT_RESULT_SIZE,
};
pub use criteria::{Clause, Criteria, MatchOp};
pub use error::{Result, TreeError};
pub use event::{spawn_record_source, RecordSource, TreeEvent, TreeNotice};
pub use fetch::{
    FetchRequest, FetchResponse, LoadHandle, RequestId, RowRange,
};
pub use filter::{CriteriaOutcome, FlatRow};
pub use node::{LoadState, Node, NodeId, NodeKey, NodeKind, Record};
pub use open_state::OpenState;
pub use store::{NodeStore, Slot};
pub use sync::{RecordChange, SyncOutcome};
pub use tree::{ResultTree, Row};
