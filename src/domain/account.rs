use crate::error::{LedgerError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Internal identifier of a mirrored user.
pub type UserId = u64;

/// A signed monetary value in whole units.
///
/// Balances go negative when a user has been charged for assignments
/// without having completed enough tasks to cover them.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Balance(pub i64);

impl Balance {
    pub const ZERO: Self = Self(0);

    pub fn new(amount: i64) -> Self {
        Self(amount)
    }

    pub fn value(&self) -> i64 {
        self.0
    }

    pub fn is_positive(&self) -> bool {
        self.0 > 0
    }

    /// Returns the balance after adding `debit` and removing `credit`.
    pub fn apply(self, debit: u64, credit: u64) -> Result<Self> {
        let debit = i64::try_from(debit)
            .map_err(|_| LedgerError::ValidationError(format!("Debit {debit} out of range")))?;
        let credit = i64::try_from(credit)
            .map_err(|_| LedgerError::ValidationError(format!("Credit {credit} out of range")))?;
        self.0
            .checked_add(debit)
            .and_then(|b| b.checked_sub(credit))
            .map(Self)
            .ok_or_else(|| LedgerError::ValidationError("Balance overflow".to_string()))
    }
}

impl fmt::Display for Balance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The materialized balance of a single user.
///
/// `balance` is a fold over the user's ledger entries and is only ever
/// written by the store as part of an entry commit.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
pub struct Account {
    #[serde(rename = "userId")]
    pub user_id: UserId,
    pub balance: Balance,
}

impl Account {
    pub fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            balance: Balance::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balance_apply_any_combination() {
        let b = Balance::new(-12);
        assert_eq!(b.apply(30, 0).unwrap(), Balance::new(18));
        assert_eq!(b.apply(0, 3).unwrap(), Balance::new(-15));
        assert_eq!(b.apply(5, 5).unwrap(), Balance::new(-12));
        assert_eq!(b.apply(0, 0).unwrap(), b);
    }

    #[test]
    fn test_balance_apply_overflow() {
        let b = Balance::new(i64::MAX);
        assert!(matches!(
            b.apply(1, 0),
            Err(LedgerError::ValidationError(_))
        ));
        assert!(matches!(
            Balance::ZERO.apply(u64::MAX, 0),
            Err(LedgerError::ValidationError(_))
        ));
    }

    #[test]
    fn test_new_account_is_empty() {
        let account = Account::new(7);
        assert_eq!(account.user_id, 7);
        assert_eq!(account.balance, Balance::ZERO);
        assert!(!account.balance.is_positive());
    }

    #[test]
    fn test_account_serialization() {
        let account = Account {
            user_id: 3,
            balance: Balance::new(-4),
        };
        let json = serde_json::to_string(&account).unwrap();
        assert_eq!(json, r#"{"userId":3,"balance":-4}"#);
    }
}
