use crate::domain::event::{DomainEvent, TaskEvent, UserCreated};
use crate::domain::task::TaskStatus;
use crate::domain::user::UserRole;
use crate::error::{LedgerError, Result};
use serde::Deserialize;
use std::io::Read;

/// One line of a replay file. Which columns matter depends on `event`.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event: String,
    pub user: Option<String>,
    pub login: Option<String>,
    pub role: Option<UserRole>,
    pub task: Option<String>,
    pub title: Option<String>,
    pub assignee: Option<String>,
    pub jira: Option<String>,
}

/// A replay instruction: feed an event, or close the billing cycle once
/// everything before it has settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayStep {
    Event(DomainEvent),
    CloseCycle,
}

fn required(field: Option<String>, name: &str, event: &str) -> Result<String> {
    field
        .filter(|v| !v.is_empty())
        .ok_or_else(|| LedgerError::ValidationError(format!("{event} row without {name}")))
}

impl TryFrom<EventRecord> for ReplayStep {
    type Error = LedgerError;

    fn try_from(record: EventRecord) -> Result<Self> {
        let name = record.event.as_str();
        match name {
            "close" => Ok(ReplayStep::CloseCycle),
            "User.Created" => {
                let public_id = required(record.user, "user", name)?;
                let role = record
                    .role
                    .ok_or_else(|| LedgerError::ValidationError(format!("{name} row without role")))?;
                Ok(ReplayStep::Event(DomainEvent::UserCreated(UserCreated {
                    login: record.login.unwrap_or_else(|| public_id.clone()),
                    public_id,
                    role,
                })))
            }
            "Task.Created" | "Task.Completed" | "Task.Reassigned" => {
                let task = TaskEvent {
                    public_id: required(record.task, "task", name)?,
                    title: record.title.unwrap_or_default(),
                    description: String::new(),
                    status: if name == "Task.Completed" {
                        TaskStatus::Completed
                    } else {
                        TaskStatus::Open
                    },
                    assignee_public_id: required(record.assignee, "assignee", name)?,
                    jira_id: record.jira.filter(|j| !j.is_empty()),
                };
                Ok(ReplayStep::Event(match name {
                    "Task.Created" => DomainEvent::TaskCreated(task),
                    "Task.Completed" => DomainEvent::TaskCompleted(task),
                    _ => DomainEvent::TaskReassigned(task),
                }))
            }
            other => Err(LedgerError::ValidationError(format!(
                "Unknown event '{other}'"
            ))),
        }
    }
}

/// Reads replay steps from a CSV source.
///
/// Whitespace is trimmed and rows may omit trailing columns.
pub struct EventReader<R: Read> {
    reader: csv::Reader<R>,
}

impl<R: Read> EventReader<R> {
    pub fn new(source: R) -> Self {
        let reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(source);
        Self { reader }
    }

    /// Lazily parses rows, so large replays are streamed.
    pub fn steps(self) -> impl Iterator<Item = Result<ReplayStep>> {
        self.reader.into_deserialize::<EventRecord>().map(|result| {
            result
                .map_err(LedgerError::from)
                .and_then(ReplayStep::try_from)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const HEADER: &str = "event, user, login, role, task, title, assignee, jira\n";

    fn read(rows: &str) -> Vec<Result<ReplayStep>> {
        EventReader::new(format!("{HEADER}{rows}").as_bytes())
            .steps()
            .collect()
    }

    #[test]
    fn test_reader_valid_stream() {
        let steps = read(
            "User.Created, u-1, popug, user\n\
             Task.Created, , , , t-1, feed, u-1\n\
             Task.Completed, , , , t-1, feed, u-1, POPUG-1\n\
             close\n",
        );
        assert_eq!(steps.len(), 4);
        let ReplayStep::Event(DomainEvent::UserCreated(user)) = steps[0].as_ref().unwrap() else {
            panic!("expected a user");
        };
        assert_eq!(user.role, UserRole::User);
        assert_eq!(user.login, "popug");

        let ReplayStep::Event(DomainEvent::TaskCompleted(task)) = steps[2].as_ref().unwrap() else {
            panic!("expected a completion");
        };
        assert_eq!(task.assignee_public_id, "u-1");
        assert_eq!(task.jira_id.as_deref(), Some("POPUG-1"));
        assert_eq!(steps[3].as_ref().unwrap(), &ReplayStep::CloseCycle);
    }

    #[test]
    fn test_reader_malformed_lines() {
        let steps = read(
            "Task.Deleted, , , , t-1\n\
             User.Created, u-1, popug, overlord\n\
             User.Created, u-1\n\
             Task.Created, , , , t-1\n",
        );
        assert_eq!(steps.len(), 4);
        assert!(matches!(steps[0], Err(LedgerError::ValidationError(_))));
        assert!(matches!(steps[1], Err(LedgerError::CsvError(_))));
        assert!(matches!(steps[2], Err(LedgerError::ValidationError(_))));
        assert!(matches!(steps[3], Err(LedgerError::ValidationError(_))));
    }
}
