use super::codec;
use crate::domain::ports::{EventSink, LedgerStoreRef};
use crate::error::Result;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const BATCH: usize = 100;

/// Forwards committed ledger notifications from the store's outbox to the
/// bus. A record leaves the outbox only once the sink has accepted it, so
/// a crash between the two republishes rather than loses.
pub struct OutboxRelay {
    store: LedgerStoreRef,
    sink: Arc<dyn EventSink>,
    interval: Duration,
    published: AtomicU64,
    failed: AtomicU64,
}

impl OutboxRelay {
    pub fn new(store: LedgerStoreRef, sink: Arc<dyn EventSink>, interval: Duration) -> Self {
        Self {
            store,
            sink,
            interval,
            published: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        }
    }

    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Publishes pending records in order until the outbox is empty or the
    /// sink refuses one. Returns how many went out.
    pub async fn flush_once(&self) -> Result<usize> {
        let mut sent = 0;
        loop {
            let batch = self.store.pending_outbox(BATCH).await?;
            if batch.is_empty() {
                return Ok(sent);
            }
            let mut acked = Vec::with_capacity(batch.len());
            let mut blocked = false;
            for record in &batch {
                let message = codec::encode_account_log(&record.event)?;
                match self.sink.publish(message).await {
                    Ok(()) => acked.push(record.id),
                    Err(e) => {
                        // Keep ordering: stop at the first refusal.
                        self.failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(record = record.id, "Outbox publish failed: {}", e);
                        blocked = true;
                        break;
                    }
                }
            }
            self.store.ack_outbox(&acked).await?;
            self.published.fetch_add(acked.len() as u64, Ordering::Relaxed);
            sent += acked.len();
            if blocked {
                return Ok(sent);
            }
        }
    }

    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.flush_once().await {
                tracing::error!("Outbox relay failed: {}", e);
            }
        }
        // Last sweep so notifications committed before shutdown go out.
        if let Err(e) = self.flush_once().await {
            tracing::error!("Final outbox flush failed: {}", e);
        }
        tracing::info!(
            published = self.published(),
            failed = self.failed(),
            "Outbox relay stopped"
        );
    }
}
