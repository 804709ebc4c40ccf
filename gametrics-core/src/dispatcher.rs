//! Background batch delivery
//!
//! A dispatcher generation runs from trigger to completion: wait out the
//! send interval, wait for connectivity, drain the queue, then sign and
//! POST each batch, deleting exactly the delivered sequence ids. The
//! facade guarantees at most one generation is active at a time.
//!
//! Connectivity polling is unbounded: a generation parks until the network
//! returns rather than giving up, favoring eventual delivery. The
//! cancellation token is the only way to interrupt the waits, so host
//! shutdown stays graceful.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::auth;
use crate::net::{CollectorClient, Connectivity, DeliveryOutcome};
use crate::store::{Batch, EventStore};

/// How a generation was triggered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Interval-driven: waits out the send interval and polls for
    /// connectivity indefinitely
    Auto,
    /// User-requested one-shot flush: no interval wait, and an unavailable
    /// network aborts immediately without clearing the queue
    Manual,
}

/// Terminal state of a generation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every batch was attempted (each succeeding or failing on its own)
    Done,
    /// Exited before sending: offline, or cancelled
    Aborted,
}

/// One delivery generation; construct, then `run().await` exactly once
pub struct Dispatcher {
    store: Arc<EventStore>,
    client: Arc<CollectorClient>,
    connectivity: Arc<dyn Connectivity>,
    send_interval: Duration,
    poll_interval: Duration,
    cache_locally: bool,
    mode: DispatchMode,
    cancel: CancellationToken,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<EventStore>,
        client: Arc<CollectorClient>,
        connectivity: Arc<dyn Connectivity>,
        send_interval: Duration,
        poll_interval: Duration,
        cache_locally: bool,
        mode: DispatchMode,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            client,
            connectivity,
            send_interval,
            poll_interval,
            cache_locally,
            mode,
            cancel,
        }
    }

    /// Run the generation to completion
    pub async fn run(self) -> DispatchOutcome {
        tracing::debug!(mode = ?self.mode, "dispatcher generation started");

        // Wait out the send interval (zero for manual flushes)
        if !self.send_interval.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.send_interval) => {}
                _ = self.cancel.cancelled() => {
                    tracing::debug!("cancelled during send interval wait");
                    return DispatchOutcome::Aborted;
                }
            }
            tracing::debug!("send interval elapsed");
        }

        if !self.connectivity.is_connected() {
            if !self.cache_locally {
                // The host opted out of offline buffering: discard rather
                // than hold events it asked us not to keep
                tracing::info!("offline with local caching disabled, clearing events");
                if let Err(e) = self.store.clear() {
                    tracing::error!(error = %e, "failed to clear event queue");
                }
                return DispatchOutcome::Aborted;
            }

            if self.mode == DispatchMode::Manual {
                tracing::info!("offline, manual flush aborted; events retained");
                return DispatchOutcome::Aborted;
            }

            loop {
                tracing::debug!("polling network");
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = self.cancel.cancelled() => {
                        tracing::debug!("cancelled while waiting for network");
                        return DispatchOutcome::Aborted;
                    }
                }
                if self.connectivity.is_connected() {
                    break;
                }
            }
        }

        tracing::debug!("network available, sending events");
        self.send_pending().await;
        DispatchOutcome::Done
    }

    /// Drain the queue and attempt every non-empty batch. Each batch
    /// succeeds or fails independently.
    async fn send_pending(&self) {
        let batches = match self.store.drain() {
            Ok(batches) => batches,
            Err(e) => {
                tracing::error!(error = %e, "failed to read pending events");
                return;
            }
        };

        if batches.is_empty() {
            tracing::debug!("no events to send");
            return;
        }

        for batch in &batches {
            if batch.is_empty() {
                continue;
            }
            self.send_batch(batch).await;
        }
    }

    async fn send_batch(&self, batch: &Batch) {
        let body = match serde_json::to_string(&batch.events()) {
            Ok(body) => body,
            Err(e) => {
                // Retained: the records stay pending for the next cycle
                tracing::error!(
                    category = %batch.category,
                    error = %e,
                    "failed to serialize batch, skipping this cycle"
                );
                return;
            }
        };

        let signature = auth::sign(&body, &batch.secret);
        tracing::info!(
            category = %batch.category,
            app_key = %batch.app_key,
            count = batch.len(),
            "sending batch"
        );

        match self
            .client
            .post_batch(&batch.app_key, batch.category, body, &signature)
            .await
        {
            DeliveryOutcome::Delivered => {
                match self.store.delete_records(&batch.sequence_ids()) {
                    Ok(()) => tracing::info!(
                        category = %batch.category,
                        count = batch.len(),
                        "batch delivered"
                    ),
                    Err(e) => tracing::error!(
                        category = %batch.category,
                        error = %e,
                        "delivered but failed to delete records; duplicates possible next cycle"
                    ),
                }
            }
            DeliveryOutcome::Retryable => {
                tracing::warn!(
                    category = %batch.category,
                    count = batch.len(),
                    "delivery failed, events retained for retry"
                );
            }
            DeliveryOutcome::Rejected(status) => {
                match self
                    .store
                    .dead_letter_records(&batch.sequence_ids(), status)
                {
                    Ok(moved) => tracing::error!(
                        category = %batch.category,
                        status,
                        moved,
                        "batch rejected by collector, moved to dead letters"
                    ),
                    Err(e) => tracing::error!(
                        category = %batch.category,
                        error = %e,
                        "failed to dead-letter rejected batch"
                    ),
                }
            }
        }
    }
}
