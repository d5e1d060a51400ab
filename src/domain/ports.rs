use super::account::{Account, UserId};
use super::event::{Delivery, Message, OutboxRecord};
use super::ledger::{BillingCycle, BillingCycleId, EntryFilter, EntryId, LedgerCommit, LedgerEntry};
use super::task::Task;
use super::user::{NewUser, User, UserUpsert};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Durable state of the ledger: user and task mirrors, accounts, the entry
/// log, billing cycles and the outbound notification queue.
///
/// Implementations must make every `commit` and `assign_to_cycle` atomic: a
/// reader never sees a balance without its entry, and every committed
/// mutation carries its outbox record.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Mirrors a user keyed on its public id and makes sure its account exists.
    async fn upsert_user(&self, user: NewUser) -> Result<UserUpsert>;
    async fn user(&self, user_id: UserId) -> Result<Option<User>>;
    async fn user_by_public_id(&self, public_id: &str) -> Result<Option<User>>;

    async fn task_by_public_id(&self, public_id: &str) -> Result<Option<Task>>;

    async fn account(&self, user_id: UserId) -> Result<Option<Account>>;
    async fn accounts(&self) -> Result<Vec<Account>>;

    /// Appends the entry, writes the resulting balance and applies the task
    /// change as one unit. Returns the entry with its assigned id.
    async fn commit(&self, commit: LedgerCommit) -> Result<LedgerEntry>;
    /// Entries matching `filter`, in id order.
    async fn entries(&self, filter: EntryFilter) -> Result<Vec<LedgerEntry>>;
    async fn last_entry_id(&self) -> Result<EntryId>;

    async fn create_billing_cycle(&self, closed_at: DateTime<Utc>) -> Result<BillingCycle>;
    async fn billing_cycles_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BillingCycle>>;
    /// Tags every open entry with `id <= up_to`, plus the listed entries, with
    /// `cycle`. Returns the number of entries re-tagged.
    async fn assign_to_cycle(
        &self,
        cycle: BillingCycleId,
        up_to: EntryId,
        extra: &[EntryId],
    ) -> Result<usize>;

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>>;
    async fn ack_outbox(&self, ids: &[u64]) -> Result<()>;
}

pub type LedgerStoreRef = Arc<dyn LedgerStore>;

/// Inbound side of the message bus.
///
/// A delivery that is neither acked nor nacked is considered in flight and
/// must not be handed out again while the consumer holds it.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Waits up to `timeout` for the next delivery on the subscribed topics.
    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery>>;
    async fn ack(&self, delivery: &Delivery) -> Result<()>;
    /// Hands the delivery back for redelivery after `delay`.
    async fn nack(&self, delivery: Delivery, delay: Duration) -> Result<()>;
    /// Parks a message that can never be processed.
    async fn dead_letter(&self, delivery: Delivery, reason: String) -> Result<()>;
}

/// Outbound side of the message bus.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, message: Message) -> Result<()>;
}

/// The external auth service: resolves a bearer token to a user's public id.
#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, authorization: &str) -> Result<String>;
}
