use crate::domain::ports::{IdentityVerifier, LedgerStoreRef};
use crate::domain::user::{User, UserRole};
use crate::error::{LedgerError, Result};
use dashmap::DashMap;
use std::sync::Arc;

/// Read-through cache of the user mirror, keyed by public id.
///
/// Entries carry the mirror's version; an older copy never replaces a newer
/// one, so a slow read racing a `User.Created` refresh cannot resurrect a
/// stale role. Misses are not cached.
pub struct IdentityCache {
    store: LedgerStoreRef,
    users: DashMap<String, User>,
}

impl IdentityCache {
    pub fn new(store: LedgerStoreRef) -> Self {
        Self {
            store,
            users: DashMap::new(),
        }
    }

    pub async fn get(&self, public_id: &str) -> Result<Option<User>> {
        if let Some(user) = self.users.get(public_id) {
            return Ok(Some(user.clone()));
        }
        let user = self.store.user_by_public_id(public_id).await?;
        if let Some(user) = &user {
            self.remember(user.clone());
        }
        Ok(user)
    }

    pub fn remember(&self, user: User) {
        self.users
            .entry(user.public_id.clone())
            .and_modify(|cached| {
                if user.version > cached.version {
                    *cached = user.clone();
                }
            })
            .or_insert(user);
    }
}

/// Turns a bearer token into a mirrored user holding one of the allowed roles.
pub struct Authorizer {
    verifier: Arc<dyn IdentityVerifier>,
    identity: Arc<IdentityCache>,
}

impl Authorizer {
    pub fn new(verifier: Arc<dyn IdentityVerifier>, identity: Arc<IdentityCache>) -> Self {
        Self { verifier, identity }
    }

    pub async fn authorize(&self, authorization: Option<&str>, roles: &[UserRole]) -> Result<User> {
        let authorization = authorization
            .filter(|h| !h.trim().is_empty())
            .ok_or_else(|| LedgerError::AuthFailure("Missing authorization header".to_string()))?;
        let public_id = self.verifier.verify(authorization).await.inspect_err(|e| {
            tracing::info!("Auth failed: {}", e);
        })?;
        let user = self
            .identity
            .get(&public_id)
            .await?
            .ok_or_else(|| LedgerError::AuthFailure(format!("User {public_id} is not mirrored")))?;
        if !user.has_any_role(roles) {
            return Err(LedgerError::AuthFailure(format!(
                "Role {:?} of {} is not allowed",
                user.role, user.public_id
            )));
        }
        Ok(user)
    }
}
