use crate::domain::account::{Account, UserId};
use crate::domain::ledger::{
    BillingCycleId, EntryFilter, LedgerEntry, OPEN_CYCLE, OperationType, verify_chain,
};
use crate::domain::ports::LedgerStoreRef;
use crate::error::{LedgerError, Result};
use chrono::{NaiveDate, TimeDelta};
use serde::Serialize;

pub fn parse_day(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|e| LedgerError::ValidationError(format!("Malformed day '{raw}': {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeSummary {
    pub rewards_paid: u64,
    pub costs_charged: u64,
    /// Rewards minus costs, as seen from the ledger.
    pub income: i64,
}

/// Read-only projections over the ledger.
pub struct QueryService {
    store: LedgerStoreRef,
}

impl QueryService {
    pub fn new(store: LedgerStoreRef) -> Self {
        Self { store }
    }

    /// Users without an account yet read as a zero balance.
    pub async fn balance(&self, user_id: UserId) -> Result<Account> {
        Ok(self
            .store
            .account(user_id)
            .await?
            .unwrap_or_else(|| Account::new(user_id)))
    }

    /// Entries of the open cycle, or of the cycles closed on `day` (UTC).
    pub async fn log(&self, user_id: UserId, day: Option<NaiveDate>) -> Result<Vec<LedgerEntry>> {
        let cycles = self.cycles_for(day).await?;
        if cycles.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .entries(EntryFilter::for_user(user_id).in_cycles(cycles))
            .await
    }

    pub async fn income(&self, day: Option<NaiveDate>) -> Result<IncomeSummary> {
        let cycles = self.cycles_for(day).await?;
        let mut summary = IncomeSummary {
            rewards_paid: 0,
            costs_charged: 0,
            income: 0,
        };
        if cycles.is_empty() {
            return Ok(summary);
        }
        let entries = self
            .store
            .entries(EntryFilter::default().in_cycles(cycles).of_types(vec![
                OperationType::CompletionReward,
                OperationType::AssignmentCost,
                OperationType::ReassignmentCost,
            ]))
            .await?;
        for entry in &entries {
            match entry.operation_type {
                OperationType::CompletionReward => {
                    summary.rewards_paid = summary.rewards_paid.saturating_add(entry.debit)
                }
                _ => summary.costs_charged = summary.costs_charged.saturating_add(entry.credit),
            }
        }
        summary.income = i128::from(summary.rewards_paid)
            .saturating_sub(i128::from(summary.costs_charged))
            .clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64;
        Ok(summary)
    }

    /// Replays the user's entries and checks them against the stored balance.
    pub async fn audit(&self, user_id: UserId) -> Result<Account> {
        let entries = self.store.entries(EntryFilter::for_user(user_id)).await?;
        let folded = verify_chain(&entries)?;
        let account = self.balance(user_id).await?;
        let replayed = folded.get(&user_id).copied().unwrap_or_default();
        if replayed != account.balance {
            return Err(LedgerError::ValidationError(format!(
                "Account {} holds {} but its entries sum to {}",
                user_id, account.balance, replayed
            )));
        }
        Ok(account)
    }

    async fn cycles_for(&self, day: Option<NaiveDate>) -> Result<Vec<BillingCycleId>> {
        let Some(day) = day else {
            return Ok(vec![OPEN_CYCLE]);
        };
        let from = day.and_time(chrono::NaiveTime::MIN).and_utc();
        let to = from + TimeDelta::days(1);
        Ok(self
            .store
            .billing_cycles_between(from, to)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect())
    }
}
