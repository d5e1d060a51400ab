#![allow(dead_code)]

use ates_ledger::application::engine::LedgerEngine;
use ates_ledger::application::pricing::FixedPricing;
use ates_ledger::application::retry::RetryPolicy;
use ates_ledger::domain::event::{DomainEvent, TaskEvent, UserCreated};
use ates_ledger::domain::task::TaskStatus;
use ates_ledger::domain::user::UserRole;
use ates_ledger::infrastructure::in_memory::InMemoryLedgerStore;
use std::io::Write;
use std::sync::Arc;
use tempfile::NamedTempFile;

pub const HEADER: &str = "event, user, login, role, task, title, assignee, jira";

/// Writes a replay file with the standard header followed by `rows`.
pub fn events_csv(rows: &[&str]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "{HEADER}").unwrap();
    for row in rows {
        writeln!(file, "{row}").unwrap();
    }
    file.flush().unwrap();
    file
}

/// Writes `users` users, each assigned and completing `tasks_per_user` tasks.
pub fn generate_economy(users: usize, tasks_per_user: usize) -> NamedTempFile {
    let mut rows = Vec::new();
    for u in 1..=users {
        rows.push(format!("User.Created, u-{u}, popug-{u}, user"));
    }
    for t in 1..=users * tasks_per_user {
        let assignee = (t % users) + 1;
        rows.push(format!("Task.Created, , , , t-{t}, task {t}, u-{assignee}"));
        rows.push(format!("Task.Completed, , , , t-{t}, task {t}, u-{assignee}"));
    }
    let rows: Vec<&str> = rows.iter().map(String::as_str).collect();
    events_csv(&rows)
}

pub fn engine() -> Arc<LedgerEngine> {
    Arc::new(LedgerEngine::new(
        Arc::new(InMemoryLedgerStore::new()),
        Arc::new(FixedPricing::new(12, 30)),
        RetryPolicy::immediate(3),
    ))
}

pub fn user(public_id: &str, role: UserRole) -> DomainEvent {
    DomainEvent::UserCreated(UserCreated {
        public_id: public_id.into(),
        login: public_id.into(),
        role,
    })
}

pub fn task(public_id: &str, assignee: &str) -> TaskEvent {
    TaskEvent {
        public_id: public_id.into(),
        title: format!("task {public_id}"),
        description: String::new(),
        status: TaskStatus::Open,
        assignee_public_id: assignee.into(),
        jira_id: None,
    }
}
