//! Offline replay: feeds a CSV event log through the same bus, codec and
//! consumer a live deployment uses, so ordering and duplicate handling are
//! exercised exactly as in production.

use crate::application::engine::LedgerEngine;
use crate::domain::event::topics;
use crate::domain::ports::EventSink;
use crate::error::{LedgerError, Result};
use crate::infrastructure::in_memory::InMemoryBus;
use crate::interfaces::csv::event_reader::{EventReader, ReplayStep};
use crate::interfaces::messaging::codec;
use crate::interfaces::messaging::consumer::{ConsumerConfig, ConsumerSnapshot, EventConsumer};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const INGRESS: [&str; 2] = [topics::USER_LIFECYCLE, topics::TASK_LIFECYCLE];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    pub rows_skipped: usize,
    pub cycles_closed: usize,
    pub consumer: ConsumerSnapshot,
    pub dead_letters: usize,
}

pub struct Replayer {
    engine: Arc<LedgerEngine>,
    config: ConsumerConfig,
}

impl Replayer {
    /// Events whose user or task never appears in the log are dead-lettered
    /// once the retry budget runs out, since a finite log cannot deliver the
    /// referent later.
    pub fn new(engine: Arc<LedgerEngine>, mut config: ConsumerConfig) -> Self {
        config.orphan_attempts = config.orphan_attempts.or(Some(config.retry.max_attempts));
        Self { engine, config }
    }

    /// Replays `source`, then closes a final cycle when `close_cycle` is set.
    pub async fn run<R: Read>(&self, source: R, close_cycle: bool) -> Result<ReplaySummary> {
        let bus = InMemoryBus::new();
        let consumer = EventConsumer::new(
            Arc::new(bus.subscribe(&INGRESS)),
            self.engine.clone(),
            self.config,
        );
        let stats = consumer.stats();
        let shutdown = CancellationToken::new();
        let running = tokio::spawn(consumer.run(shutdown.clone()));

        let mut rows_skipped = 0;
        let mut cycles_closed = 0;
        let result = async {
            for step in EventReader::new(source).steps() {
                match step {
                    Ok(ReplayStep::Event(event)) => bus.publish(codec::encode(&event)?).await?,
                    Ok(ReplayStep::CloseCycle) => {
                        settle(&bus).await;
                        self.close().await?;
                        cycles_closed += 1;
                    }
                    Err(e) => {
                        tracing::warn!("Skipping replay row: {}", e);
                        rows_skipped += 1;
                    }
                }
            }
            settle(&bus).await;
            if close_cycle {
                self.close().await?;
                cycles_closed += 1;
            }
            Ok::<(), LedgerError>(())
        }
        .await;

        shutdown.cancel();
        running
            .await
            .map_err(|e| LedgerError::storage(format!("Consumer task failed: {e}")))??;
        result?;

        let dead_letters = bus.dead_letters().await;
        for (delivery, reason) in &dead_letters {
            tracing::error!(
                topic = %delivery.message.topic,
                key = %delivery.message.key,
                "Event was never applied: {}",
                reason
            );
        }
        Ok(ReplaySummary {
            rows_skipped,
            cycles_closed,
            consumer: stats.snapshot(),
            dead_letters: dead_letters.len(),
        })
    }

    async fn close(&self) -> Result<()> {
        let report = self.engine.close_cycle().await?;
        tracing::info!(
            cycle = report.cycle.id,
            paid = report.paid.len(),
            retagged = report.retagged,
            "Closed billing cycle"
        );
        Ok(())
    }
}

/// Waits until nothing is queued or in flight. Messages waiting out a
/// redelivery delay count as queued.
async fn settle(bus: &InMemoryBus) {
    while bus.pending(&INGRESS).await > 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
