use crate::domain::event::{HEADER_EVENT, Message};
use crate::domain::ports::EventSink;
use crate::error::Result;
use async_trait::async_trait;

/// Sink for a single-node deployment with no broker: outbound notifications
/// are written to the log under the `ledger_events` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl EventSink for TracingSink {
    async fn publish(&self, message: Message) -> Result<()> {
        tracing::info!(
            target: "ledger_events",
            topic = %message.topic,
            key = %message.key,
            event = message.header(HEADER_EVENT).unwrap_or("?"),
            bytes = message.payload.len(),
            "Published"
        );
        Ok(())
    }
}
