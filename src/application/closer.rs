use super::applier::OperationApplier;
use super::retry::RetryPolicy;
use crate::domain::account::UserId;
use crate::domain::ledger::{BillingCycle, EntryId};
use crate::domain::ports::LedgerStoreRef;
use crate::error::{LedgerError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WagePaid {
    pub user_id: UserId,
    pub amount: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseReport {
    pub cycle: BillingCycle,
    pub paid: Vec<WagePaid>,
    pub retagged: usize,
}

/// Closes billing cycles.
///
/// A close never holds more than one account lock at a time and never
/// rolls back a wage payment. Accounts whose payment fails are retried
/// with backoff; whatever settled is re-tagged to the cycle either way.
pub struct BillingCycleCloser {
    store: LedgerStoreRef,
    applier: Arc<OperationApplier>,
    retry: RetryPolicy,
    close_lock: Mutex<()>,
}

impl BillingCycleCloser {
    pub fn new(store: LedgerStoreRef, applier: Arc<OperationApplier>, retry: RetryPolicy) -> Self {
        Self {
            store,
            applier,
            retry,
            close_lock: Mutex::new(()),
        }
    }

    pub async fn close(&self) -> Result<CloseReport> {
        self.close_at(Utc::now()).await
    }

    pub async fn close_at(&self, closed_at: DateTime<Utc>) -> Result<CloseReport> {
        let _close = self.close_lock.lock().await;

        let watermark = self.store.last_entry_id().await?;
        let cycle = self.store.create_billing_cycle(closed_at).await?;
        tracing::info!(cycle = cycle.id, watermark, "Closing billing cycle");

        let mut pending: Vec<UserId> = self
            .store
            .accounts()
            .await?
            .into_iter()
            .filter(|a| a.balance.is_positive())
            .map(|a| a.user_id)
            .collect();
        let mut paid = Vec::new();
        let mut wage_entries: Vec<EntryId> = Vec::new();

        let mut attempt = 1;
        loop {
            let mut failed = Vec::new();
            for user_id in pending {
                match self.applier.pay_wages(user_id).await {
                    Ok(Some(entry)) => {
                        paid.push(WagePaid {
                            user_id,
                            amount: entry.credit,
                        });
                        wage_entries.push(entry.id);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(cycle = cycle.id, user_id, attempt, "Wage payment failed: {}", e);
                        failed.push(user_id);
                    }
                }
            }
            pending = failed;
            if pending.is_empty() || self.retry.exhausted(attempt) {
                break;
            }
            tokio::time::sleep(self.retry.delay(attempt)).await;
            attempt += 1;
        }

        let retagged = self
            .store
            .assign_to_cycle(cycle.id, watermark, &wage_entries)
            .await?;
        tracing::info!(
            cycle = cycle.id,
            retagged,
            paid = ?paid.iter().map(|p| p.user_id).collect::<Vec<_>>(),
            "Wages paid"
        );

        if !pending.is_empty() {
            tracing::error!(cycle = cycle.id, failed = ?pending, "Billing cycle close incomplete");
            return Err(LedgerError::CloseIncomplete {
                cycle: cycle.id,
                failed: pending,
            });
        }
        Ok(CloseReport {
            cycle,
            paid,
            retagged,
        })
    }
}
