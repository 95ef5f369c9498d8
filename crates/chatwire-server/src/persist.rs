//! Forwarding hub activity to the chat store.
//!
//! Nothing here sits on the fan-out path: writes run on their own tasks and
//! failures are logged and counted, never reported back to the publisher.

use crate::metrics;
use chatwire_core::{ChatStore, Hub, StoreEvent, StoreWrite};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Spawn a write derived from a client publish.
pub fn spawn_write(store: Arc<dyn ChatStore>, write: StoreWrite) -> JoinHandle<()> {
    tokio::spawn(async move {
        let operation = match &write {
            StoreWrite::AppendMessage(_) => "append_message",
            StoreWrite::DeliveryState { .. } => "update_delivery_state",
        };
        if let Err(e) = write.apply(store.as_ref()).await {
            warn!(store = store.name(), operation, error = %e, "Store write failed");
            metrics::record_store_error(operation);
        }
    })
}

/// Spawn the worker that records last-seen times and finished calls.
///
/// Drains the hub's store feed, so writes are delayed by a slow store but
/// never skipped. Returns `None` if the feed was already taken.
pub fn spawn_store_writer(hub: &Hub, store: Arc<dyn ChatStore>) -> Option<JoinHandle<()>> {
    let mut feed = hub.open_store_feed()?;

    Some(tokio::spawn(async move {
        while let Some(event) = feed.recv().await {
            if let StoreEvent::CallRecord(record) = &event {
                metrics::record_call(record.state);
            }
            if let Err(e) = event.apply(store.as_ref()).await {
                let operation = event.operation();
                warn!(store = store.name(), operation, error = %e, "Store write failed");
                metrics::record_store_error(operation);
            }
        }

        debug!("Store writer stopped");
    }))
}
