use crate::domain::account::{Account, UserId};
use crate::domain::event::{AccountLogEvent, AccountLogKind, Delivery, Message, OutboxRecord};
use crate::domain::ledger::{
    BillingCycle, BillingCycleId, EntryFilter, EntryId, LedgerCommit, LedgerEntry, TaskChange,
};
use crate::domain::ports::{EventSink, EventSource, LedgerStore};
use crate::domain::task::{Task, TaskId};
use crate::domain::user::{NewUser, User, UserUpsert};
use crate::error::{LedgerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::time::Instant;

#[derive(Default)]
struct LedgerState {
    users: BTreeMap<UserId, User>,
    user_index: HashMap<String, UserId>,
    tasks: HashMap<String, Task>,
    accounts: BTreeMap<UserId, Account>,
    entries: Vec<LedgerEntry>,
    cycles: Vec<BillingCycle>,
    outbox: BTreeMap<u64, OutboxRecord>,
    next_task_id: TaskId,
    next_outbox_id: u64,
}

impl LedgerState {
    fn enqueue(&mut self, kind: AccountLogKind, entry: &LedgerEntry) {
        self.next_outbox_id += 1;
        let id = self.next_outbox_id;
        self.outbox.insert(
            id,
            OutboxRecord {
                id,
                event: AccountLogEvent::from_entry(kind, entry),
            },
        );
    }
}

/// A thread-safe in-memory ledger.
///
/// All state sits behind one `RwLock`, so every write is trivially atomic.
/// Per-account serialization is the applier's job, not the store's.
#[derive(Default, Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<LedgerState>>,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn upsert_user(&self, user: NewUser) -> Result<UserUpsert> {
        let mut state = self.state.write().await;
        let upsert = match state.user_index.get(&user.public_id).copied() {
            Some(id) => {
                let existing = state
                    .users
                    .get_mut(&id)
                    .ok_or_else(|| LedgerError::storage("User index points at a missing user"))?;
                if existing.login == user.login && existing.role == user.role {
                    UserUpsert::Unchanged(existing.clone())
                } else {
                    existing.login = user.login;
                    existing.role = user.role;
                    existing.version += 1;
                    UserUpsert::Updated(existing.clone())
                }
            }
            None => {
                let id = state.users.keys().next_back().copied().unwrap_or_default() + 1;
                let created = User {
                    id,
                    public_id: user.public_id,
                    login: user.login,
                    role: user.role,
                    version: 1,
                };
                state.user_index.insert(created.public_id.clone(), id);
                state.users.insert(id, created.clone());
                UserUpsert::Created(created)
            }
        };
        let id = upsert.user().id;
        state.accounts.entry(id).or_insert_with(|| Account::new(id));
        Ok(upsert)
    }

    async fn user(&self, user_id: UserId) -> Result<Option<User>> {
        let state = self.state.read().await;
        Ok(state.users.get(&user_id).cloned())
    }

    async fn user_by_public_id(&self, public_id: &str) -> Result<Option<User>> {
        let state = self.state.read().await;
        Ok(state
            .user_index
            .get(public_id)
            .and_then(|id| state.users.get(id))
            .cloned())
    }

    async fn task_by_public_id(&self, public_id: &str) -> Result<Option<Task>> {
        let state = self.state.read().await;
        Ok(state.tasks.get(public_id).cloned())
    }

    async fn account(&self, user_id: UserId) -> Result<Option<Account>> {
        let state = self.state.read().await;
        Ok(state.accounts.get(&user_id).cloned())
    }

    async fn accounts(&self) -> Result<Vec<Account>> {
        let state = self.state.read().await;
        Ok(state.accounts.values().cloned().collect())
    }

    async fn commit(&self, commit: LedgerCommit) -> Result<LedgerEntry> {
        let mut state = self.state.write().await;
        let LedgerCommit { mut entry, task } = commit;

        // Validate everything before the first mutation.
        let task = match task {
            Some(TaskChange::Insert(new_task)) => {
                if state.tasks.contains_key(&new_task.public_id) {
                    return Err(LedgerError::ValidationError(format!(
                        "Task {} is already mirrored",
                        new_task.public_id
                    )));
                }
                let task = new_task.into_task(state.next_task_id + 1);
                entry.task_id = Some(task.id);
                Some(task)
            }
            Some(TaskChange::Update(task)) => {
                if !state.tasks.contains_key(&task.public_id) {
                    return Err(LedgerError::UnknownTask(task.public_id));
                }
                Some(task)
            }
            None => None,
        };

        let entry = entry.into_entry(state.entries.len() as EntryId + 1);
        if let Some(task) = task {
            state.next_task_id = state.next_task_id.max(task.id);
            state.tasks.insert(task.public_id.clone(), task);
        }
        state.accounts.insert(
            entry.user_id,
            Account {
                user_id: entry.user_id,
                balance: entry.resulting_balance,
            },
        );
        state.enqueue(AccountLogKind::Created, &entry);
        state.entries.push(entry.clone());
        Ok(entry)
    }

    async fn entries(&self, filter: EntryFilter) -> Result<Vec<LedgerEntry>> {
        let state = self.state.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn last_entry_id(&self) -> Result<EntryId> {
        let state = self.state.read().await;
        Ok(state.entries.len() as EntryId)
    }

    async fn create_billing_cycle(&self, closed_at: DateTime<Utc>) -> Result<BillingCycle> {
        let mut state = self.state.write().await;
        let cycle = BillingCycle {
            id: state.cycles.len() as BillingCycleId + 1,
            closed_at,
        };
        state.cycles.push(cycle.clone());
        Ok(cycle)
    }

    async fn billing_cycles_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<BillingCycle>> {
        let state = self.state.read().await;
        Ok(state
            .cycles
            .iter()
            .filter(|c| c.closed_at >= from && c.closed_at < to)
            .cloned()
            .collect())
    }

    async fn assign_to_cycle(
        &self,
        cycle: BillingCycleId,
        up_to: EntryId,
        extra: &[EntryId],
    ) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut retagged = Vec::new();
        for entry in state.entries.iter_mut() {
            if entry.is_open() && (entry.id <= up_to || extra.contains(&entry.id)) {
                entry.billing_cycle_id = cycle;
                retagged.push(entry.clone());
            }
        }
        for entry in &retagged {
            state.enqueue(AccountLogKind::Updated, entry);
        }
        Ok(retagged.len())
    }

    async fn pending_outbox(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let state = self.state.read().await;
        Ok(state.outbox.values().take(limit).cloned().collect())
    }

    async fn ack_outbox(&self, ids: &[u64]) -> Result<()> {
        let mut state = self.state.write().await;
        for id in ids {
            state.outbox.remove(id);
        }
        Ok(())
    }
}

struct Queued {
    delivery: Delivery,
    ready_at: Instant,
}

#[derive(Default)]
struct BusState {
    queues: HashMap<String, VecDeque<Queued>>,
    in_flight: HashMap<u64, Delivery>,
    dead_letters: Vec<(Delivery, String)>,
    next_id: u64,
}

enum Poll {
    Ready(Delivery),
    Idle(Option<Instant>),
}

impl BusState {
    fn take_ready(&mut self, topics: &[String], now: Instant) -> Poll {
        let mut next_wake: Option<Instant> = None;
        for topic in topics {
            let Some(queue) = self.queues.get_mut(topic) else {
                continue;
            };
            if let Some(pos) = queue.iter().position(|q| q.ready_at <= now) {
                if let Some(queued) = queue.remove(pos) {
                    self.in_flight
                        .insert(queued.delivery.id, queued.delivery.clone());
                    return Poll::Ready(queued.delivery);
                }
            }
            if let Some(earliest) = queue.iter().map(|q| q.ready_at).min() {
                next_wake = Some(next_wake.map_or(earliest, |w| w.min(earliest)));
            }
        }
        Poll::Idle(next_wake)
    }
}

/// An in-process message bus with per-topic queues and delayed redelivery.
///
/// Stands in for the broker in tests, in the replay tool and in a
/// single-node deployment.
#[derive(Default, Clone)]
pub struct InMemoryBus {
    state: Arc<Mutex<BusState>>,
    notify: Arc<Notify>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a consumer handle over the given topics.
    pub fn subscribe(&self, topics: &[&str]) -> InMemoryConsumer {
        InMemoryConsumer {
            bus: self.clone(),
            topics: topics.iter().map(|t| t.to_string()).collect(),
        }
    }

    /// Removes and returns every queued message on `topic`.
    pub async fn drain(&self, topic: &str) -> Vec<Message> {
        let mut state = self.state.lock().await;
        state
            .queues
            .remove(topic)
            .map(|q| q.into_iter().map(|q| q.delivery.message).collect())
            .unwrap_or_default()
    }

    /// Number of messages on `topics` that are queued or in flight.
    pub async fn pending(&self, topics: &[&str]) -> usize {
        let state = self.state.lock().await;
        let queued: usize = topics
            .iter()
            .filter_map(|t| state.queues.get(*t))
            .map(VecDeque::len)
            .sum();
        let in_flight = state
            .in_flight
            .values()
            .filter(|d| topics.contains(&d.message.topic.as_str()))
            .count();
        queued + in_flight
    }

    pub async fn dead_letters(&self) -> Vec<(Delivery, String)> {
        self.state.lock().await.dead_letters.clone()
    }
}

#[async_trait]
impl EventSink for InMemoryBus {
    async fn publish(&self, message: Message) -> Result<()> {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        let delivery = Delivery {
            id: state.next_id,
            attempt: 1,
            message,
        };
        state
            .queues
            .entry(delivery.message.topic.clone())
            .or_default()
            .push_back(Queued {
                delivery,
                ready_at: Instant::now(),
            });
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }
}

pub struct InMemoryConsumer {
    bus: InMemoryBus,
    topics: Vec<String>,
}

#[async_trait]
impl EventSource for InMemoryConsumer {
    async fn poll(&self, timeout: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register interest before looking, so a publish in between is not missed.
            let notified = self.bus.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut state = self.bus.state.lock().await;
                match state.take_ready(&self.topics, Instant::now()) {
                    Poll::Ready(delivery) => return Ok(Some(delivery)),
                    Poll::Idle(next_wake) => next_wake,
                }
            };
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let wake = next_wake.map_or(deadline, |w| w.min(deadline));
            let _ = tokio::time::timeout_at(wake, notified).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.bus.state.lock().await.in_flight.remove(&delivery.id);
        Ok(())
    }

    async fn nack(&self, delivery: Delivery, delay: Duration) -> Result<()> {
        let mut state = self.bus.state.lock().await;
        state.in_flight.remove(&delivery.id);
        let delivery = Delivery {
            attempt: delivery.attempt.saturating_add(1),
            ..delivery
        };
        state
            .queues
            .entry(delivery.message.topic.clone())
            .or_default()
            .push_back(Queued {
                delivery,
                ready_at: Instant::now() + delay,
            });
        drop(state);
        self.bus.notify.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, delivery: Delivery, reason: String) -> Result<()> {
        let mut state = self.bus.state.lock().await;
        state.in_flight.remove(&delivery.id);
        state.dead_letters.push((delivery, reason));
        Ok(())
    }
}
