//! Typed domain events and the transport-level message they travel in.
//!
//! Decoding from the wire happens once, at the ingress boundary, into the
//! closed [`DomainEvent`] set; nothing past the codec looks at event names.

use super::ledger::{BillingCycleId, EntryId, LedgerEntry};
use super::task::TaskStatus;
use super::user::UserRole;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod topics {
    pub const USER_LIFECYCLE: &str = "user.lifecycle";
    pub const TASK_LIFECYCLE: &str = "task.lifecycle";
    pub const ACCOUNTLOG_LIFECYCLE: &str = "accountlog.lifecycle";
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserCreated {
    pub public_id: String,
    pub login: String,
    pub role: UserRole,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskEvent {
    pub public_id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub assignee_public_id: String,
    /// Only present from payload version 2 on.
    pub jira_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainEvent {
    UserCreated(UserCreated),
    TaskCreated(TaskEvent),
    TaskCompleted(TaskEvent),
    TaskReassigned(TaskEvent),
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::UserCreated(_) => "User.Created",
            DomainEvent::TaskCreated(_) => "Task.Created",
            DomainEvent::TaskCompleted(_) => "Task.Completed",
            DomainEvent::TaskReassigned(_) => "Task.Reassigned",
        }
    }

    pub fn topic(&self) -> &'static str {
        match self {
            DomainEvent::UserCreated(_) => topics::USER_LIFECYCLE,
            _ => topics::TASK_LIFECYCLE,
        }
    }

    /// Public id of the entity the event is about.
    pub fn key(&self) -> &str {
        match self {
            DomainEvent::UserCreated(u) => &u.public_id,
            DomainEvent::TaskCreated(t)
            | DomainEvent::TaskCompleted(t)
            | DomainEvent::TaskReassigned(t) => &t.public_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum AccountLogKind {
    Created,
    Updated,
}

impl AccountLogKind {
    pub fn event_name(&self) -> &'static str {
        match self {
            AccountLogKind::Created => "AccountLog.Created",
            AccountLogKind::Updated => "AccountLog.Updated",
        }
    }
}

/// Notification about a ledger entry for downstream analytics.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AccountLogEvent {
    pub kind: AccountLogKind,
    pub log_id: EntryId,
    pub user_id: u64,
    /// Zero for cycle-level entries.
    pub task_id: u64,
    pub billing_cycle_id: BillingCycleId,
    pub operation_id: u32,
    pub debit: u64,
    pub credit: u64,
    pub balance: i64,
}

impl AccountLogEvent {
    pub fn from_entry(kind: AccountLogKind, entry: &LedgerEntry) -> Self {
        Self {
            kind,
            log_id: entry.id,
            user_id: entry.user_id,
            task_id: entry.task_id.unwrap_or_default(),
            billing_cycle_id: entry.billing_cycle_id,
            operation_id: entry.operation_type.id(),
            debit: entry.debit,
            credit: entry.credit,
            balance: entry.resulting_balance.value(),
        }
    }
}

/// A pending outbound notification, persisted with the write that caused it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct OutboxRecord {
    pub id: u64,
    pub event: AccountLogEvent,
}

pub const HEADER_EVENT: &str = "event";
pub const HEADER_PRODUCER: &str = "producer";
pub const HEADER_EVENT_VERSION: &str = "eventVersion";

/// A message as it sits on the bus: topic, partition key, headers and an
/// opaque payload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub topic: String,
    pub key: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// A message handed to a consumer. It stays owned by the source until acked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: u64,
    pub attempt: u32,
    pub message: Message,
}
