//! Wire format of the bus: CBOR payloads described by the `event`,
//! `producer` and `eventVersion` headers.

use crate::domain::event::{
    AccountLogEvent, AccountLogKind, DomainEvent, HEADER_EVENT, HEADER_EVENT_VERSION,
    HEADER_PRODUCER, Message, TaskEvent, UserCreated, topics,
};
use crate::domain::ledger::OperationType;
use crate::domain::task::TaskStatus;
use crate::domain::user::UserRole;
use crate::error::{LedgerError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PRODUCER: &str = "accounting";

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserPayload {
    uid: String,
    #[serde(default)]
    login: String,
    role_id: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct AssigneeRef {
    uid: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskPayloadV1 {
    tid: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status_id: u32,
    assigned_to: AssigneeRef,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskPayloadV2 {
    tid: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    status_id: u32,
    assigned_to: AssigneeRef,
    #[serde(default)]
    jira_id: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountLogPayload {
    log_id: u64,
    user_id: u64,
    task_id: u64,
    billing_cycle_id: u64,
    operation_id: u32,
    debit: u64,
    credit: u64,
    balance: i64,
}

fn from_cbor<T: DeserializeOwned>(event: &str, payload: &[u8]) -> Result<T> {
    serde_cbor::from_slice(payload)
        .map_err(|e| LedgerError::Codec(format!("Bad {event} payload: {e}")))
}

fn to_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_cbor::to_vec(value).map_err(|e| LedgerError::Codec(e.to_string()))
}

fn envelope(topic: &str, key: String, event: &str, version: u32, payload: Vec<u8>) -> Message {
    let headers = BTreeMap::from([
        (HEADER_EVENT.to_string(), event.to_string()),
        (HEADER_PRODUCER.to_string(), PRODUCER.to_string()),
        (HEADER_EVENT_VERSION.to_string(), version.to_string()),
    ]);
    Message {
        topic: topic.to_string(),
        key,
        headers,
        payload,
    }
}

fn event_header(message: &Message) -> Result<(&str, u32)> {
    let name = message
        .header(HEADER_EVENT)
        .ok_or_else(|| LedgerError::Codec(format!("Message {} has no event header", message.key)))?;
    let version = match message.header(HEADER_EVENT_VERSION) {
        None => 1,
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| LedgerError::Codec(format!("Bad event version '{raw}' on {name}")))?,
    };
    Ok((name, version))
}

/// Decodes an ingress message into the closed event set.
pub fn decode(message: &Message) -> Result<DomainEvent> {
    let (name, version) = event_header(message)?;
    match (name, version) {
        ("User.Created", 1) => {
            let p: UserPayload = from_cbor(name, &message.payload)?;
            let role = UserRole::from_id(p.role_id)
                .ok_or_else(|| LedgerError::Codec(format!("Unknown role {} for {}", p.role_id, p.uid)))?;
            Ok(DomainEvent::UserCreated(UserCreated {
                public_id: p.uid,
                login: p.login,
                role,
            }))
        }
        ("Task.Created" | "Task.Completed" | "Task.Reassigned", 1 | 2) => {
            let task = if version == 1 {
                let p: TaskPayloadV1 = from_cbor(name, &message.payload)?;
                TaskEvent {
                    public_id: p.tid,
                    title: p.title,
                    description: p.description,
                    status: TaskStatus::from_id(p.status_id),
                    assignee_public_id: p.assigned_to.uid,
                    jira_id: None,
                }
            } else {
                let p: TaskPayloadV2 = from_cbor(name, &message.payload)?;
                TaskEvent {
                    public_id: p.tid,
                    title: p.title,
                    description: p.description,
                    status: TaskStatus::from_id(p.status_id),
                    assignee_public_id: p.assigned_to.uid,
                    jira_id: Some(p.jira_id).filter(|j| !j.is_empty()),
                }
            };
            if task.public_id.is_empty() || task.assignee_public_id.is_empty() {
                return Err(LedgerError::Codec(format!("{name} without task or assignee id")));
            }
            Ok(match name {
                "Task.Created" => DomainEvent::TaskCreated(task),
                "Task.Completed" => DomainEvent::TaskCompleted(task),
                _ => DomainEvent::TaskReassigned(task),
            })
        }
        _ => Err(LedgerError::Codec(format!(
            "Unsupported event {name} v{version} on {}",
            message.topic
        ))),
    }
}

/// Encodes an event the way its producing service would. Tasks carrying a
/// Jira id go out as version 2.
pub fn encode(event: &DomainEvent) -> Result<Message> {
    let (version, payload) = match event {
        DomainEvent::UserCreated(u) => (
            1,
            to_cbor(&UserPayload {
                uid: u.public_id.clone(),
                login: u.login.clone(),
                role_id: u.role.id(),
            })?,
        ),
        DomainEvent::TaskCreated(t) | DomainEvent::TaskCompleted(t) | DomainEvent::TaskReassigned(t) => {
            let status_id = if t.status == TaskStatus::Completed { 2 } else { 1 };
            let assigned_to = AssigneeRef {
                uid: t.assignee_public_id.clone(),
            };
            match &t.jira_id {
                Some(jira_id) => (
                    2,
                    to_cbor(&TaskPayloadV2 {
                        tid: t.public_id.clone(),
                        title: t.title.clone(),
                        description: t.description.clone(),
                        status_id,
                        assigned_to,
                        jira_id: jira_id.clone(),
                    })?,
                ),
                None => (
                    1,
                    to_cbor(&TaskPayloadV1 {
                        tid: t.public_id.clone(),
                        title: t.title.clone(),
                        description: t.description.clone(),
                        status_id,
                        assigned_to,
                    })?,
                ),
            }
        }
    };
    Ok(envelope(
        event.topic(),
        event.key().to_string(),
        event.name(),
        version,
        payload,
    ))
}

pub fn encode_account_log(event: &AccountLogEvent) -> Result<Message> {
    let payload = to_cbor(&AccountLogPayload {
        log_id: event.log_id,
        user_id: event.user_id,
        task_id: event.task_id,
        billing_cycle_id: event.billing_cycle_id,
        operation_id: event.operation_id,
        debit: event.debit,
        credit: event.credit,
        balance: event.balance,
    })?;
    Ok(envelope(
        topics::ACCOUNTLOG_LIFECYCLE,
        event.log_id.to_string(),
        event.kind.event_name(),
        1,
        payload,
    ))
}

pub fn decode_account_log(message: &Message) -> Result<AccountLogEvent> {
    let (name, _) = event_header(message)?;
    let kind = match name {
        "AccountLog.Created" => AccountLogKind::Created,
        "AccountLog.Updated" => AccountLogKind::Updated,
        other => return Err(LedgerError::Codec(format!("Unsupported event {other}"))),
    };
    let p: AccountLogPayload = from_cbor(name, &message.payload)?;
    if OperationType::from_id(p.operation_id).is_none() {
        return Err(LedgerError::Codec(format!(
            "{name} carries unknown operation {}",
            p.operation_id
        )));
    }
    Ok(AccountLogEvent {
        kind,
        log_id: p.log_id,
        user_id: p.user_id,
        task_id: p.task_id,
        billing_cycle_id: p.billing_cycle_id,
        operation_id: p.operation_id,
        debit: p.debit,
        credit: p.credit,
        balance: p.balance,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(jira_id: Option<&str>) -> TaskEvent {
        TaskEvent {
            public_id: "t-1".into(),
            title: "sort the seeds".into(),
            description: "all of them".into(),
            status: TaskStatus::Open,
            assignee_public_id: "u-1".into(),
            jira_id: jira_id.map(String::from),
        }
    }

    fn raw(event: &str, version: Option<&str>, payload: Vec<u8>) -> Message {
        let mut headers = BTreeMap::from([(HEADER_EVENT.to_string(), event.to_string())]);
        if let Some(v) = version {
            headers.insert(HEADER_EVENT_VERSION.to_string(), v.to_string());
        }
        Message {
            topic: topics::TASK_LIFECYCLE.into(),
            key: "t-1".into(),
            headers,
            payload,
        }
    }

    #[test]
    fn test_task_versions_decode_to_same_event() {
        let v1 = encode(&DomainEvent::TaskCreated(task(None))).unwrap();
        let v2 = encode(&DomainEvent::TaskCreated(task(Some("POPUG-7")))).unwrap();
        assert_eq!(v1.header(HEADER_EVENT_VERSION), Some("1"));
        assert_eq!(v2.header(HEADER_EVENT_VERSION), Some("2"));
        assert_eq!(v1.header(HEADER_PRODUCER), Some(PRODUCER));
        assert_eq!(v2.key, "t-1");

        let DomainEvent::TaskCreated(a) = decode(&v1).unwrap() else {
            panic!("expected Task.Created");
        };
        let DomainEvent::TaskCreated(b) = decode(&v2).unwrap() else {
            panic!("expected Task.Created");
        };
        assert_eq!(a, task(None));
        assert_eq!(b.jira_id.as_deref(), Some("POPUG-7"));
        assert_eq!(TaskEvent { jira_id: None, ..b }, a);
    }

    #[test]
    fn test_missing_version_defaults_to_one() {
        let mut message = encode(&DomainEvent::TaskCompleted(task(None))).unwrap();
        message.headers.remove(HEADER_EVENT_VERSION);
        assert!(matches!(decode(&message).unwrap(), DomainEvent::TaskCompleted(_)));
    }

    #[test]
    fn test_user_created() {
        let event = DomainEvent::UserCreated(UserCreated {
            public_id: "u-1".into(),
            login: "popug".into(),
            role: UserRole::Manager,
        });
        let message = encode(&event).unwrap();
        assert_eq!(message.topic, topics::USER_LIFECYCLE);
        assert_eq!(decode(&message).unwrap(), event);
    }

    #[test]
    fn test_poison_messages_are_codec_errors() {
        let good = encode(&DomainEvent::TaskReassigned(task(None))).unwrap().payload;
        let cases = [
            Message {
                payload: good.clone(),
                ..Message::default()
            },
            raw("Task.Deleted", Some("1"), good.clone()),
            raw("Task.Created", Some("3"), good.clone()),
            raw("Task.Created", Some("two"), good.clone()),
            raw("Task.Created", Some("1"), b"not cbor".to_vec()),
            raw(
                "User.Created",
                Some("1"),
                to_cbor(&UserPayload {
                    uid: "u-1".into(),
                    login: String::new(),
                    role_id: 9,
                })
                .unwrap(),
            ),
            raw(
                "Task.Created",
                Some("1"),
                to_cbor(&TaskPayloadV1 {
                    tid: String::new(),
                    title: String::new(),
                    description: String::new(),
                    status_id: 1,
                    assigned_to: AssigneeRef { uid: "u-1".into() },
                })
                .unwrap(),
            ),
        ];
        for message in cases {
            assert!(
                matches!(decode(&message), Err(LedgerError::Codec(_))),
                "{message:?} should not decode"
            );
        }
    }

    #[test]
    fn test_account_log_envelope() {
        let event = AccountLogEvent {
            kind: AccountLogKind::Updated,
            log_id: 4,
            user_id: 1,
            task_id: 0,
            billing_cycle_id: 2,
            operation_id: 3,
            debit: 0,
            credit: 18,
            balance: 0,
        };
        let message = encode_account_log(&event).unwrap();
        assert_eq!(message.topic, topics::ACCOUNTLOG_LIFECYCLE);
        assert_eq!(message.header(HEADER_EVENT), Some("AccountLog.Updated"));
        assert_eq!(decode_account_log(&message).unwrap(), event);
    }

    #[test]
    fn test_account_log_with_unknown_operation_is_rejected() {
        let event = AccountLogEvent {
            kind: AccountLogKind::Created,
            log_id: 1,
            user_id: 1,
            task_id: 1,
            billing_cycle_id: 0,
            operation_id: 9,
            debit: 0,
            credit: 12,
            balance: -12,
        };
        let message = encode_account_log(&event).unwrap();
        assert!(matches!(
            decode_account_log(&message),
            Err(LedgerError::Codec(msg)) if msg.contains("unknown operation 9")
        ));
    }
}
