use std::future::Future;
use std::pin::Pin;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::fetch::{FetchRequest, FetchResponse, RequestId};
use crate::node::NodeKey;
use crate::sync::RecordChange;

/// Everything the tree's event loop reacts to.
#[derive(Debug)]
pub enum TreeEvent {
    /// A child-load request finished at the record source.
    FetchCompleted {
        request: RequestId,
        generation: u64,
        result: Result<FetchResponse>,
    },
    /// An external record change observed on the server.
    RecordsChanged(RecordChange),
}

/// What a processed event meant for consumers of the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeNotice {
    /// New rows were merged under this folder; visible row indices may
    /// have shifted.
    DataArrived { parent: NodeKey },
    /// Cached records changed in place without a fetch.
    CacheUpdated,
}

/// Where child records come from.
///
/// One call per fetch request; the returned future resolves to the records
/// (and total, for paged folders) or a failure. Implementations are free to
/// hit the network, a database, or a fixture.
pub trait RecordSource: Send + Sync + 'static {
    fn fetch_children(
        &self,
        request: FetchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<FetchResponse>> + Send>>;
}

impl<F> RecordSource for F
where
    F: Fn(FetchRequest) -> Pin<Box<dyn Future<Output = Result<FetchResponse>> + Send>>
        + Send
        + Sync
        + 'static,
{
    fn fetch_children(
        &self,
        request: FetchRequest,
    ) -> Pin<Box<dyn Future<Output = Result<FetchResponse>> + Send>> {
        self(request)
    }
}

/// Drive a record source from the tree's request stream.
///
/// Each request runs in its own task so a slow folder never blocks its
/// siblings; completions are reported as events in whatever order they
/// finish. The pump exits when the request channel closes.
pub fn spawn_record_source<S: RecordSource>(
    source: S,
    mut request_rx: mpsc::UnboundedReceiver<FetchRequest>,
    event_tx: mpsc::UnboundedSender<TreeEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(request) = request_rx.recv().await {
            let id = request.id;
            let generation = request.generation;
            let fut = source.fetch_children(request);
            let tx = event_tx.clone();
            tokio::spawn(async move {
                let result = fut.await;
                if tx
                    .send(TreeEvent::FetchCompleted {
                        request: id,
                        generation,
                        result,
                    })
                    .is_err()
                {
                    tracing::debug!(request = id, "tree dropped before fetch completion");
                }
            });
        }
        tracing::debug!("request channel closed, record source pump exiting");
    })
}
