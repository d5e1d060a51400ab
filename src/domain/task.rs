use super::account::UserId;
use serde::{Deserialize, Serialize};

pub type TaskId = u64;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Open,
    Completed,
}

impl TaskStatus {
    pub fn from_id(id: u32) -> Self {
        match id {
            2 => TaskStatus::Completed,
            _ => TaskStatus::Open,
        }
    }
}

/// What a task costs its assignee and what it pays out on completion.
///
/// Rolled once when the task is first seen and never changed afterwards.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
pub struct TaskPrice {
    pub cost_of_assignment: u64,
    pub completion_reward: u64,
}

/// Local mirror of a task owned by the task service.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub public_id: String,
    pub title: String,
    pub assigned_to_id: UserId,
    pub status: TaskStatus,
    pub cost_of_assignment: u64,
    pub completion_reward: u64,
}

impl Task {
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct NewTask {
    pub public_id: String,
    pub title: String,
    pub assigned_to_id: UserId,
    pub price: TaskPrice,
}

impl NewTask {
    pub fn into_task(self, id: TaskId) -> Task {
        Task {
            id,
            public_id: self.public_id,
            title: self.title,
            assigned_to_id: self.assigned_to_id,
            status: TaskStatus::Open,
            cost_of_assignment: self.price.cost_of_assignment,
            completion_reward: self.price.completion_reward,
        }
    }
}
