use super::applier::{Operation, OperationApplier};
use super::identity::IdentityCache;
use super::locks::KeyedLocks;
use super::pricing::PricingPolicy;
use crate::domain::event::{DomainEvent, TaskEvent, UserCreated};
use crate::domain::ledger::{LedgerEntry, OperationType, TaskChange};
use crate::domain::ports::LedgerStoreRef;
use crate::domain::task::{NewTask, Task, TaskStatus};
use crate::domain::user::{NewUser, User, UserUpsert};
use crate::error::{LedgerError, Result};
use std::sync::Arc;

/// What handling one event did. Every variant is a terminal outcome that
/// allows the event to be acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The user mirror was created or changed.
    UserMirrored(User),
    /// A ledger entry was committed.
    Applied(LedgerEntry),
    /// The event had already been applied; nothing changed.
    Duplicate,
    /// The event conflicts with the task's terminal state and was dropped.
    Ignored(String),
}

/// Translates domain events into applier calls and mirror upserts.
///
/// Task events take the task's lock before the applier takes the account
/// lock, and nothing takes them in the other order.
pub struct EventRouter {
    store: LedgerStoreRef,
    applier: Arc<OperationApplier>,
    pricing: Arc<dyn PricingPolicy>,
    identity: Arc<IdentityCache>,
    task_locks: KeyedLocks<String>,
}

impl EventRouter {
    pub fn new(
        store: LedgerStoreRef,
        applier: Arc<OperationApplier>,
        pricing: Arc<dyn PricingPolicy>,
        identity: Arc<IdentityCache>,
    ) -> Self {
        Self {
            store,
            applier,
            pricing,
            identity,
            task_locks: KeyedLocks::new(),
        }
    }

    pub async fn route(&self, event: DomainEvent) -> Result<Disposition> {
        match event {
            DomainEvent::UserCreated(user) => self.user_created(user).await,
            DomainEvent::TaskCreated(task) => self.task_created(task).await,
            DomainEvent::TaskCompleted(task) => self.task_completed(task).await,
            DomainEvent::TaskReassigned(task) => self.task_reassigned(task).await,
        }
    }

    async fn user_created(&self, event: UserCreated) -> Result<Disposition> {
        let upsert = self
            .store
            .upsert_user(NewUser {
                public_id: event.public_id,
                login: event.login,
                role: event.role,
            })
            .await?;
        match upsert {
            UserUpsert::Unchanged(_) => Ok(Disposition::Duplicate),
            UserUpsert::Created(user) | UserUpsert::Updated(user) => {
                tracing::info!(public_id = %user.public_id, version = user.version, "Mirrored user");
                self.identity.remember(user.clone());
                Ok(Disposition::UserMirrored(user))
            }
        }
    }

    async fn resolve_user(&self, public_id: &str) -> Result<User> {
        self.store
            .user_by_public_id(public_id)
            .await?
            .ok_or_else(|| LedgerError::UnknownUser(public_id.to_string()))
    }

    async fn resolve_task(&self, public_id: &str) -> Result<Task> {
        self.store
            .task_by_public_id(public_id)
            .await?
            .ok_or_else(|| LedgerError::UnknownTask(public_id.to_string()))
    }

    async fn task_created(&self, event: TaskEvent) -> Result<Disposition> {
        let _guard = self.task_locks.acquire(&event.public_id).await;
        if self.store.task_by_public_id(&event.public_id).await?.is_some() {
            tracing::debug!(task = %event.public_id, "Task already charged, skipping redelivery");
            return Ok(Disposition::Duplicate);
        }
        let assignee = self.resolve_user(&event.assignee_public_id).await?;

        let price = self.pricing.price(&event.public_id);
        let operation = Operation::charge(
            assignee.id,
            None,
            OperationType::AssignmentCost,
            price.cost_of_assignment,
            format!(
                "Deducted {} on assignment of task {}",
                price.cost_of_assignment, event.public_id
            ),
        );
        let task = NewTask {
            public_id: event.public_id,
            title: event.title,
            assigned_to_id: assignee.id,
            price,
        };
        let entry = self
            .applier
            .apply_with_task(operation, Some(TaskChange::Insert(task)))
            .await?;
        Ok(Disposition::Applied(entry))
    }

    async fn task_completed(&self, event: TaskEvent) -> Result<Disposition> {
        let _guard = self.task_locks.acquire(&event.public_id).await;
        let task = self.resolve_task(&event.public_id).await?;
        if task.is_completed() {
            tracing::debug!(task = %task.public_id, "Task already rewarded, skipping redelivery");
            return Ok(Disposition::Duplicate);
        }
        let claimed = self.store.user_by_public_id(&event.assignee_public_id).await?;
        if claimed.as_ref().map(|u| u.id) != Some(task.assigned_to_id) {
            tracing::warn!(
                task = %task.public_id,
                claimed = %event.assignee_public_id,
                "Completion claimed by a user the task is not assigned to"
            );
            return Err(LedgerError::AssignmentMismatch {
                task: task.public_id,
                user: event.assignee_public_id,
            });
        }

        let operation = Operation::reward(
            task.assigned_to_id,
            task.id,
            task.completion_reward,
            format!(
                "Added {} on completion of task {}",
                task.completion_reward, task.public_id
            ),
        );
        let completed = Task {
            status: TaskStatus::Completed,
            ..task
        };
        let entry = self
            .applier
            .apply_with_task(operation, Some(TaskChange::Update(completed)))
            .await?;
        Ok(Disposition::Applied(entry))
    }

    async fn task_reassigned(&self, event: TaskEvent) -> Result<Disposition> {
        let _guard = self.task_locks.acquire(&event.public_id).await;
        let task = self.resolve_task(&event.public_id).await?;
        if task.is_completed() {
            let reason = format!("Task {} is completed and cannot be reassigned", task.public_id);
            tracing::warn!("{}", reason);
            return Ok(Disposition::Ignored(reason));
        }
        let assignee = self.resolve_user(&event.assignee_public_id).await?;
        if assignee.id == task.assigned_to_id {
            tracing::debug!(task = %task.public_id, "Task already assigned to {}", assignee.public_id);
            return Ok(Disposition::Duplicate);
        }

        let operation = Operation::charge(
            assignee.id,
            Some(task.id),
            OperationType::ReassignmentCost,
            task.cost_of_assignment,
            format!(
                "Deducted {} on reassignment of task {}",
                task.cost_of_assignment, task.public_id
            ),
        );
        let reassigned = Task {
            assigned_to_id: assignee.id,
            ..task
        };
        let entry = self
            .applier
            .apply_with_task(operation, Some(TaskChange::Update(reassigned)))
            .await?;
        Ok(Disposition::Applied(entry))
    }
}
