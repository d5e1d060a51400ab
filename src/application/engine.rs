use super::applier::OperationApplier;
use super::closer::{BillingCycleCloser, CloseReport};
use super::identity::IdentityCache;
use super::pricing::PricingPolicy;
use super::query::QueryService;
use super::retry::RetryPolicy;
use super::router::{Disposition, EventRouter};
use crate::domain::account::Balance;
use crate::domain::event::DomainEvent;
use crate::domain::ports::LedgerStoreRef;
use crate::error::Result;
use serde::Serialize;
use std::sync::Arc;

/// One row of the end-of-run account statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountStatement {
    pub user: String,
    pub login: String,
    pub balance: Balance,
}

/// The ledger's entry point: routes events, closes cycles and answers queries
/// over a single store.
///
/// Cheap to share behind an `Arc`; every component inside handles its own
/// locking.
pub struct LedgerEngine {
    store: LedgerStoreRef,
    router: EventRouter,
    closer: BillingCycleCloser,
    query: QueryService,
    identity: Arc<IdentityCache>,
}

impl LedgerEngine {
    pub fn new(store: LedgerStoreRef, pricing: Arc<dyn PricingPolicy>, retry: RetryPolicy) -> Self {
        let applier = Arc::new(OperationApplier::new(store.clone()));
        let identity = Arc::new(IdentityCache::new(store.clone()));
        Self {
            router: EventRouter::new(store.clone(), applier.clone(), pricing, identity.clone()),
            closer: BillingCycleCloser::new(store.clone(), applier, retry),
            query: QueryService::new(store.clone()),
            identity,
            store,
        }
    }

    pub async fn process_event(&self, event: DomainEvent) -> Result<Disposition> {
        self.router.route(event).await
    }

    pub async fn close_cycle(&self) -> Result<CloseReport> {
        self.closer.close().await
    }

    pub fn query(&self) -> &QueryService {
        &self.query
    }

    pub fn identity(&self) -> Arc<IdentityCache> {
        self.identity.clone()
    }

    pub fn store(&self) -> LedgerStoreRef {
        self.store.clone()
    }

    /// Every account with the mirrored user it belongs to, in user id order.
    pub async fn statement(&self) -> Result<Vec<AccountStatement>> {
        let mut rows = Vec::new();
        for account in self.store.accounts().await? {
            let user = self.store.user(account.user_id).await?;
            rows.push(AccountStatement {
                user: user
                    .as_ref()
                    .map_or_else(|| account.user_id.to_string(), |u| u.public_id.clone()),
                login: user.map(|u| u.login).unwrap_or_default(),
                balance: account.balance,
            });
        }
        Ok(rows)
    }
}
