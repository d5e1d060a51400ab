use super::account::{Balance, UserId};
use super::task::{NewTask, Task, TaskId};
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub type EntryId = u64;

/// Identifier of a closed billing cycle. `OPEN_CYCLE` tags entries that no
/// close has swept yet.
pub type BillingCycleId = u64;

pub const OPEN_CYCLE: BillingCycleId = 0;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    AssignmentCost,
    CompletionReward,
    WagePayment,
    ReassignmentCost,
}

impl OperationType {
    /// Stable numeric id carried on the wire.
    pub fn id(&self) -> u32 {
        match self {
            OperationType::AssignmentCost => 1,
            OperationType::CompletionReward => 2,
            OperationType::WagePayment => 3,
            OperationType::ReassignmentCost => 4,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(OperationType::AssignmentCost),
            2 => Some(OperationType::CompletionReward),
            3 => Some(OperationType::WagePayment),
            4 => Some(OperationType::ReassignmentCost),
            _ => None,
        }
    }
}

/// One immutable, signed balance change.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    pub id: EntryId,
    pub user_id: UserId,
    pub task_id: Option<TaskId>,
    pub operation_type: OperationType,
    pub debit: u64,
    pub credit: u64,
    pub resulting_balance: Balance,
    pub billing_cycle_id: BillingCycleId,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn is_open(&self) -> bool {
        self.billing_cycle_id == OPEN_CYCLE
    }
}

/// An entry that has been computed by the applier but not yet committed.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NewLedgerEntry {
    pub user_id: UserId,
    pub task_id: Option<TaskId>,
    pub operation_type: OperationType,
    pub debit: u64,
    pub credit: u64,
    pub resulting_balance: Balance,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl NewLedgerEntry {
    pub fn into_entry(self, id: EntryId) -> LedgerEntry {
        LedgerEntry {
            id,
            user_id: self.user_id,
            task_id: self.task_id,
            operation_type: self.operation_type,
            debit: self.debit,
            credit: self.credit,
            resulting_balance: self.resulting_balance,
            billing_cycle_id: OPEN_CYCLE,
            message: self.message,
            created_at: self.created_at,
        }
    }
}

/// Task mirror mutation committed together with an entry.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum TaskChange {
    /// First sight of a task. The store allocates its id and stamps it on the entry.
    Insert(NewTask),
    Update(Task),
}

/// The unit the store must persist atomically: entry, balance and task mirror.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct LedgerCommit {
    pub entry: NewLedgerEntry,
    pub task: Option<TaskChange>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BillingCycle {
    pub id: BillingCycleId,
    pub closed_at: DateTime<Utc>,
}

/// Selection over the entry log. Empty fields match everything.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EntryFilter {
    pub user_id: Option<UserId>,
    pub cycles: Option<Vec<BillingCycleId>>,
    pub operation_types: Option<Vec<OperationType>>,
}

impl EntryFilter {
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }

    pub fn in_cycles(mut self, cycles: Vec<BillingCycleId>) -> Self {
        self.cycles = Some(cycles);
        self
    }

    pub fn of_types(mut self, types: Vec<OperationType>) -> Self {
        self.operation_types = Some(types);
        self
    }

    pub fn matches(&self, entry: &LedgerEntry) -> bool {
        self.user_id.is_none_or(|u| u == entry.user_id)
            && self
                .cycles
                .as_ref()
                .is_none_or(|c| c.contains(&entry.billing_cycle_id))
            && self
                .operation_types
                .as_ref()
                .is_none_or(|t| t.contains(&entry.operation_type))
    }
}

/// Checks that every user's entries form an unbroken running-balance chain
/// starting from zero. Entries must be given in id order.
pub fn verify_chain(entries: &[LedgerEntry]) -> Result<HashMap<UserId, Balance>> {
    let mut running: HashMap<UserId, Balance> = HashMap::new();
    for entry in entries {
        let previous = running.get(&entry.user_id).copied().unwrap_or(Balance::ZERO);
        let expected = previous.apply(entry.debit, entry.credit)?;
        if expected != entry.resulting_balance {
            return Err(LedgerError::ValidationError(format!(
                "Entry {} of user {} records balance {} but chain yields {}",
                entry.id, entry.user_id, entry.resulting_balance, expected
            )));
        }
        running.insert(entry.user_id, expected);
    }
    Ok(running)
}
