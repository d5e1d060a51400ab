use super::account::UserId;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "lowercase")]
pub enum UserRole {
    Admin,
    User,
    Manager,
    Accountant,
}

impl UserRole {
    pub fn id(&self) -> u32 {
        match self {
            UserRole::Admin => 1,
            UserRole::User => 2,
            UserRole::Manager => 3,
            UserRole::Accountant => 4,
        }
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(UserRole::Admin),
            2 => Some(UserRole::User),
            3 => Some(UserRole::Manager),
            4 => Some(UserRole::Accountant),
            _ => None,
        }
    }
}

/// Read-only replica of a user owned by the auth service.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub public_id: String,
    pub login: String,
    pub role: UserRole,
    /// Bumped every time an upsert changes login or role.
    pub version: u64,
}

impl User {
    pub fn has_any_role(&self, roles: &[UserRole]) -> bool {
        roles.contains(&self.role)
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NewUser {
    pub public_id: String,
    pub login: String,
    pub role: UserRole,
}

/// Result of mirroring a `User.Created` event.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum UserUpsert {
    Created(User),
    Updated(User),
    Unchanged(User),
}

impl UserUpsert {
    pub fn user(&self) -> &User {
        match self {
            UserUpsert::Created(u) | UserUpsert::Updated(u) | UserUpsert::Unchanged(u) => u,
        }
    }
}
