//! Registry-wide package search.
//!
//! Search walks every package document across all storage namespaces. It is
//! single-pass: items arrive as rows are read, and the walk ends either
//! with [`SearchEvent::End`] or with [`SearchEvent::Error`] after whatever
//! items were already delivered.

use crate::error::{RegistryError, RegistryResult};
use futures::{Stream, StreamExt};
use pgreg_core::SearchItem;
use pgreg_metadata::MetadataStore;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Stream of search results; an `Err` item is terminal.
pub type RegistrySearchStream = Pin<Box<dyn Stream<Item = RegistryResult<SearchItem>> + Send>>;

/// One step of a search delivered over a channel.
#[derive(Debug)]
pub enum SearchEvent {
    Item(SearchItem),
    /// Every package was delivered.
    End,
    /// The walk broke off; earlier items stand.
    Error(RegistryError),
}

pub(crate) fn search_stream(metadata: &Arc<dyn MetadataStore>) -> RegistrySearchStream {
    Box::pin(
        metadata
            .search_packages()
            .map(|item| item.map_err(RegistryError::from)),
    )
}

/// Feed every item of `stream` to `on_item`, stopping at the first error.
///
/// Returns how many items were delivered.
pub(crate) async fn drive<F, Fut>(mut stream: RegistrySearchStream, mut on_item: F) -> RegistryResult<u64>
where
    F: FnMut(SearchItem) -> Fut,
    Fut: Future<Output = RegistryResult<()>>,
{
    let mut delivered = 0u64;
    while let Some(item) = stream.next().await {
        on_item(item?).await?;
        delivered += 1;
    }
    Ok(delivered)
}

/// Run a search in the background, sending its events to the returned receiver.
///
/// The last event is always `End` or `Error`, unless the receiver is dropped
/// first, which stops the search.
pub(crate) fn spawn_events(stream: RegistrySearchStream, capacity: usize) -> mpsc::Receiver<SearchEvent> {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        let outcome = drive(stream, |item| {
            let tx = tx.clone();
            async move {
                tx.send(SearchEvent::Item(item))
                    .await
                    .map_err(|_| RegistryError::Aborted("search receiver dropped".to_string()))
            }
        })
        .await;

        let last = match outcome {
            Ok(delivered) => {
                tracing::debug!(delivered, "Search finished");
                SearchEvent::End
            }
            Err(RegistryError::Aborted(_)) if tx.is_closed() => return,
            Err(err) => {
                tracing::warn!(error = %err, "Search broke off");
                SearchEvent::Error(err)
            }
        };
        let _ = tx.send(last).await;
    });
    rx
}
