use super::locks::KeyedLocks;
use crate::domain::account::{Account, Balance, UserId};
use crate::domain::ledger::{LedgerCommit, LedgerEntry, NewLedgerEntry, OperationType, TaskChange};
use crate::domain::ports::LedgerStoreRef;
use crate::domain::task::TaskId;
use crate::error::{LedgerError, Result};
use chrono::Utc;

/// A typed request to move a user's balance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Operation {
    pub user_id: UserId,
    pub task_id: Option<TaskId>,
    pub operation_type: OperationType,
    pub debit: u64,
    pub credit: u64,
    pub message: String,
}

impl Operation {
    pub fn charge(
        user_id: UserId,
        task_id: Option<TaskId>,
        operation_type: OperationType,
        amount: u64,
        message: String,
    ) -> Self {
        Self {
            user_id,
            task_id,
            operation_type,
            debit: 0,
            credit: amount,
            message,
        }
    }

    pub fn reward(user_id: UserId, task_id: TaskId, amount: u64, message: String) -> Self {
        Self {
            user_id,
            task_id: Some(task_id),
            operation_type: OperationType::CompletionReward,
            debit: amount,
            credit: 0,
            message,
        }
    }
}

/// The single write path for balances.
///
/// Each call holds the target account's lock across the read of the current
/// balance and the commit of the new entry, so concurrent operations on one
/// account are applied one after another against the live balance.
pub struct OperationApplier {
    store: LedgerStoreRef,
    locks: KeyedLocks<UserId>,
}

impl OperationApplier {
    pub fn new(store: LedgerStoreRef) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
        }
    }

    pub async fn apply(&self, operation: Operation) -> Result<LedgerEntry> {
        self.apply_with_task(operation, None).await
    }

    /// Applies `operation` and commits `task` in the same atomic unit.
    pub async fn apply_with_task(
        &self,
        operation: Operation,
        task: Option<TaskChange>,
    ) -> Result<LedgerEntry> {
        let _guard = self.locks.acquire(&operation.user_id).await;
        self.commit_locked(operation, task).await
    }

    /// Drains a positive balance to zero with a wage payment.
    ///
    /// The amount is read under the account lock, after any in-flight
    /// operation on the account has settled. Returns `None` when there is
    /// nothing to pay.
    pub async fn pay_wages(&self, user_id: UserId) -> Result<Option<LedgerEntry>> {
        let _guard = self.locks.acquire(&user_id).await;
        let balance = self.current_balance(user_id).await?;
        if !balance.is_positive() {
            return Ok(None);
        }
        let amount = u64::try_from(balance.value())
            .map_err(|_| LedgerError::ValidationError(format!("Cannot pay {balance}")))?;
        let operation = Operation::charge(
            user_id,
            None,
            OperationType::WagePayment,
            amount,
            format!("Paid out {amount} at billing cycle close"),
        );
        self.commit_locked(operation, None).await.map(Some)
    }

    async fn current_balance(&self, user_id: UserId) -> Result<Balance> {
        Ok(self
            .store
            .account(user_id)
            .await?
            .unwrap_or_else(|| Account::new(user_id))
            .balance)
    }

    async fn commit_locked(
        &self,
        operation: Operation,
        task: Option<TaskChange>,
    ) -> Result<LedgerEntry> {
        let balance = self.current_balance(operation.user_id).await?;
        let resulting_balance = balance.apply(operation.debit, operation.credit)?;
        let entry = NewLedgerEntry {
            user_id: operation.user_id,
            task_id: operation.task_id,
            operation_type: operation.operation_type,
            debit: operation.debit,
            credit: operation.credit,
            resulting_balance,
            message: operation.message,
            created_at: Utc::now(),
        };

        match self.store.commit(LedgerCommit { entry, task }).await {
            Ok(entry) => {
                tracing::info!(
                    user_id = entry.user_id,
                    entry_id = entry.id,
                    operation = ?entry.operation_type,
                    balance = %entry.resulting_balance,
                    "{}",
                    entry.message
                );
                Ok(entry)
            }
            Err(e) => {
                tracing::error!(
                    user_id = operation.user_id,
                    operation = ?operation.operation_type,
                    "Failed to commit ledger entry: {}",
                    e
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ledger::{EntryFilter, verify_chain};
    use crate::domain::ports::LedgerStore;
    use crate::infrastructure::in_memory::InMemoryLedgerStore;
    use std::sync::Arc;

    fn applier() -> (Arc<InMemoryLedgerStore>, OperationApplier) {
        let store = Arc::new(InMemoryLedgerStore::new());
        let applier = OperationApplier::new(store.clone());
        (store, applier)
    }

    #[tokio::test]
    async fn test_apply_creates_account_lazily() {
        let (store, applier) = applier();
        let entry = applier
            .apply(Operation::charge(
                5,
                None,
                OperationType::AssignmentCost,
                12,
                "charge".into(),
            ))
            .await
            .unwrap();

        assert_eq!(entry.resulting_balance, Balance::new(-12));
        assert_eq!(entry.credit, 12);
        assert!(entry.is_open());
        assert_eq!(
            store.account(5).await.unwrap().unwrap().balance,
            Balance::new(-12)
        );
    }

    #[tokio::test]
    async fn test_resulting_balance_is_running_prefix_sum() {
        let (store, applier) = applier();
        let amounts: [(u64, u64); 6] = [(0, 12), (30, 0), (0, 17), (5, 5), (40, 0), (0, 1)];
        let mut expected = 0i64;
        for (debit, credit) in amounts {
            let entry = applier
                .apply(Operation {
                    user_id: 1,
                    task_id: None,
                    operation_type: OperationType::AssignmentCost,
                    debit,
                    credit,
                    message: String::new(),
                })
                .await
                .unwrap();
            expected += debit as i64 - credit as i64;
            assert_eq!(entry.resulting_balance, Balance::new(expected));
        }

        let entries = store.entries(EntryFilter::for_user(1)).await.unwrap();
        let folded = verify_chain(&entries).unwrap();
        assert_eq!(folded[&1], Balance::new(expected));
        assert_eq!(
            store.account(1).await.unwrap().unwrap().balance,
            Balance::new(expected)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_applies_do_not_lose_updates() {
        let (store, applier) = applier();
        let applier = Arc::new(applier);

        let mut handles = Vec::new();
        for i in 0..50u64 {
            let applier = applier.clone();
            handles.push(tokio::spawn(async move {
                let op = if i % 2 == 0 {
                    Operation::charge(1, None, OperationType::AssignmentCost, 5, String::new())
                } else {
                    Operation::reward(1, i, 5, String::new())
                };
                applier.apply(op).await.unwrap()
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let entries = store.entries(EntryFilter::for_user(1)).await.unwrap();
        assert_eq!(entries.len(), 50);
        verify_chain(&entries).unwrap();
        assert_eq!(store.account(1).await.unwrap().unwrap().balance, Balance::ZERO);
    }

    #[tokio::test]
    async fn test_pay_wages_only_for_positive_balance() {
        let (store, applier) = applier();
        assert!(applier.pay_wages(1).await.unwrap().is_none());

        applier
            .apply(Operation::reward(1, 1, 18, String::new()))
            .await
            .unwrap();
        let wage = applier.pay_wages(1).await.unwrap().unwrap();
        assert_eq!(wage.operation_type, OperationType::WagePayment);
        assert_eq!(wage.credit, 18);
        assert_eq!(wage.resulting_balance, Balance::ZERO);
        assert_eq!(store.account(1).await.unwrap().unwrap().balance, Balance::ZERO);
        assert!(applier.pay_wages(1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_overflow_leaves_no_partial_state() {
        let (store, applier) = applier();
        let result = applier
            .apply(Operation::reward(1, 1, u64::MAX, String::new()))
            .await;

        assert!(matches!(result, Err(LedgerError::ValidationError(_))));
        assert!(store.account(1).await.unwrap().is_none());
        assert!(store.entries(EntryFilter::default()).await.unwrap().is_empty());
    }
}
