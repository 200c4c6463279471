//! Delivery tasks
//!
//! A task is one leg of a letter's physical journey, assigned to exactly one
//! courier. At most one non-terminal task exists per barcode; reassignment
//! closes the old leg (`Reassigned`) and opens a fresh one so the history of
//! hand-offs stays queryable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::error::CoreError;
use crate::opcode::OpCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Accepted,
    InProgress,
    Completed,
    Failed,
    /// Closed in favour of a replacement leg after a timeout.
    Reassigned,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Accepted => "accepted",
            TaskState::InProgress => "in_progress",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Reassigned => "reassigned",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Reassigned
        )
    }
}

impl std::str::FromStr for TaskState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "accepted" => Ok(TaskState::Accepted),
            "in_progress" => Ok(TaskState::InProgress),
            "completed" => Ok(TaskState::Completed),
            "failed" => Ok(TaskState::Failed),
            "reassigned" => Ok(TaskState::Reassigned),
            other => Err(CoreError::bad_input(format!("unknown task state: {other:?}"))),
        }
    }
}

/// One delivery leg.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryTask {
    pub id: Uuid,
    pub barcode_id: Uuid,
    pub assigned_courier_id: Option<Uuid>,
    pub pickup_op_code: OpCode,
    pub dropoff_op_code: OpCode,
    pub state: TaskState,
    pub deadline: DateTime<Utc>,
    /// How many legs preceded this one for the same barcode.
    pub reassign_count: i32,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DeliveryTask {
    pub fn new(
        barcode_id: Uuid,
        pickup_op_code: OpCode,
        dropoff_op_code: OpCode,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            barcode_id,
            assigned_courier_id: None,
            pickup_op_code,
            dropoff_op_code,
            state: TaskState::Pending,
            deadline,
            reassign_count: 0,
            metadata: json!({}),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Clone this leg as its replacement after a timeout, carrying the prior
    /// assignee into the metadata trail.
    pub fn successor(&self, deadline: DateTime<Utc>) -> Self {
        let mut next = DeliveryTask::new(
            self.barcode_id,
            self.pickup_op_code.clone(),
            self.dropoff_op_code.clone(),
            deadline,
        );
        next.reassign_count = self.reassign_count + 1;
        let mut prior: Vec<serde_json::Value> = self
            .metadata
            .get("prior_assignees")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        if let Some(courier_id) = self.assigned_courier_id {
            prior.push(json!(courier_id.to_string()));
        }
        next.metadata = json!({ "prior_assignees": prior });
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task() -> DeliveryTask {
        DeliveryTask::new(
            Uuid::new_v4(),
            OpCode::parse("PK5F01").expect("valid code"),
            OpCode::parse("PK5F3D").expect("valid code"),
            Utc::now() + chrono::Duration::hours(48),
        )
    }

    #[test]
    fn terminal_states() {
        assert!(!TaskState::Pending.is_terminal());
        assert!(!TaskState::Accepted.is_terminal());
        assert!(!TaskState::InProgress.is_terminal());
        assert!(TaskState::Completed.is_terminal());
        assert!(TaskState::Failed.is_terminal());
        assert!(TaskState::Reassigned.is_terminal());
    }

    #[test]
    fn successor_tracks_prior_assignees() {
        let mut first = task();
        let bob = Uuid::new_v4();
        first.assigned_courier_id = Some(bob);

        let second = first.successor(Utc::now() + chrono::Duration::hours(48));
        assert_eq!(second.reassign_count, 1);
        assert_eq!(second.barcode_id, first.barcode_id);
        let prior = second.metadata["prior_assignees"]
            .as_array()
            .expect("prior assignees");
        assert_eq!(prior.len(), 1);
        assert_eq!(prior[0], json!(bob.to_string()));

        let charlie = Uuid::new_v4();
        let mut second = second;
        second.assigned_courier_id = Some(charlie);
        let third = second.successor(Utc::now() + chrono::Duration::hours(48));
        assert_eq!(third.reassign_count, 2);
        let prior = third.metadata["prior_assignees"]
            .as_array()
            .expect("prior assignees");
        assert_eq!(prior.len(), 2);
    }
}
