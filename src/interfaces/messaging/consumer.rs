use super::codec;
use crate::application::engine::LedgerEngine;
use crate::application::retry::RetryPolicy;
use crate::application::router::Disposition;
use crate::domain::event::Delivery;
use crate::domain::ports::EventSource;
use crate::error::{LedgerError, Result};
use serde::Serialize;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct ConsumerConfig {
    pub workers: usize,
    pub poll_timeout: Duration,
    /// Backoff for every redelivery, and the attempt limit for storage failures.
    pub retry: RetryPolicy,
    /// Attempts after which an event whose user or task never showed up is
    /// dead-lettered. `None` keeps redelivering it at the capped delay.
    pub orphan_attempts: Option<u32>,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_timeout: Duration::from_millis(500),
            retry: RetryPolicy::default(),
            orphan_attempts: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ConsumerStats {
    applied: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerSnapshot {
    pub applied: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub retried: u64,
    pub dead_lettered: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handles one delivery to a terminal outcome or hands it back.
#[derive(Clone)]
struct Handler {
    source: Arc<dyn EventSource>,
    engine: Arc<LedgerEngine>,
    stats: Arc<ConsumerStats>,
    retry: RetryPolicy,
    orphan_attempts: Option<u32>,
}

impl Handler {
    fn exhausted(&self, error: &LedgerError, attempt: u32) -> bool {
        if error.is_referential() {
            self.orphan_attempts.is_some_and(|limit| attempt >= limit)
        } else {
            self.retry.exhausted(attempt)
        }
    }

    async fn handle(&self, delivery: Delivery) {
        let event = match codec::decode(&delivery.message) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(topic = %delivery.message.topic, key = %delivery.message.key, "Dropping undecodable message: {}", e);
                self.park(delivery, e.to_string()).await;
                return;
            }
        };
        let name = event.name();

        match self.engine.process_event(event).await {
            Ok(disposition) => {
                match &disposition {
                    Disposition::Duplicate => ConsumerStats::bump(&self.stats.duplicates),
                    Disposition::Ignored(reason) => {
                        tracing::warn!(event = name, key = %delivery.message.key, "Ignored: {}", reason);
                        ConsumerStats::bump(&self.stats.rejected)
                    }
                    _ => ConsumerStats::bump(&self.stats.applied),
                }
                self.ack(&delivery).await;
            }
            Err(e) if e.is_retryable() => {
                if self.exhausted(&e, delivery.attempt) {
                    tracing::error!(
                        event = name,
                        key = %delivery.message.key,
                        attempt = delivery.attempt,
                        "Giving up on event: {}",
                        e
                    );
                    self.park(delivery, e.to_string()).await;
                    return;
                }
                let delay = self.retry.delay(delivery.attempt);
                if e.is_referential() && delivery.attempt == self.retry.max_attempts {
                    tracing::warn!(
                        event = name,
                        key = %delivery.message.key,
                        "Still waiting for a referent, redelivering every {:?}: {}",
                        self.retry.max_delay,
                        e
                    );
                }
                tracing::debug!(
                    event = name,
                    key = %delivery.message.key,
                    attempt = delivery.attempt,
                    ?delay,
                    "Redelivering later: {}",
                    e
                );
                ConsumerStats::bump(&self.stats.retried);
                if let Err(e) = self.source.nack(delivery, delay).await {
                    tracing::error!("Failed to nack delivery: {}", e);
                }
            }
            Err(e) => {
                tracing::warn!(event = name, key = %delivery.message.key, "Rejected event: {}", e);
                ConsumerStats::bump(&self.stats.rejected);
                self.ack(&delivery).await;
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.source.ack(delivery).await {
            tracing::error!(delivery = delivery.id, "Failed to ack delivery: {}", e);
        }
    }

    async fn park(&self, delivery: Delivery, reason: String) {
        ConsumerStats::bump(&self.stats.dead_lettered);
        let id = delivery.id;
        if let Err(e) = self.source.dead_letter(delivery, reason).await {
            tracing::error!(delivery = id, "Failed to dead-letter delivery: {}", e);
        }
    }
}

fn shard_for(key: &str, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % shards as u64) as usize
}

/// Pulls events off the bus and feeds them to the ledger.
///
/// Deliveries are sharded by message key, so events about one entity are
/// handled in arrival order by one worker while different entities proceed
/// in parallel.
pub struct EventConsumer {
    handler: Handler,
    config: ConsumerConfig,
}

impl EventConsumer {
    pub fn new(
        source: Arc<dyn EventSource>,
        engine: Arc<LedgerEngine>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            handler: Handler {
                source,
                engine,
                stats: Arc::new(ConsumerStats::default()),
                retry: config.retry,
                orphan_attempts: config.orphan_attempts,
            },
            config,
        }
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        self.handler.stats.clone()
    }

    /// Runs until `shutdown` fires. Deliveries already handed to a worker
    /// are finished before this returns.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let shards = self.config.workers.max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut workers = JoinSet::new();
        for shard in 0..shards {
            let (tx, mut rx) = mpsc::channel::<Delivery>(64);
            senders.push(tx);
            let handler = self.handler.clone();
            workers.spawn(async move {
                while let Some(delivery) = rx.recv().await {
                    handler.handle(delivery).await;
                }
                tracing::debug!(shard, "Worker drained");
            });
        }
        tracing::info!(workers = shards, "Event consumer started");

        loop {
            let polled = tokio::select! {
                _ = shutdown.cancelled() => break,
                polled = self.handler.source.poll(self.config.poll_timeout) => polled,
            };
            match polled {
                Ok(Some(delivery)) => {
                    let shard = shard_for(&delivery.message.key, shards);
                    if let Err(e) = senders[shard].send(delivery).await {
                        tracing::error!(shard, "Worker is gone, handing delivery back");
                        let _ = self.handler.source.nack(e.0, Duration::ZERO).await;
                        break;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!("Polling the bus failed: {}", e);
                    tokio::time::sleep(self.config.retry.delay(1)).await;
                }
            }
        }

        drop(senders);
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Worker panicked: {}", e);
            }
        }
        tracing::info!(stats = ?self.handler.stats.snapshot(), "Event consumer stopped");
        Ok(())
    }
}
