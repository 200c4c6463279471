//! Task dispatcher
//!
//! Matches unassigned delivery legs to eligible couriers and sweeps overdue
//! legs for reassignment. Matching prefers the courier with the longest
//! managed prefix covering the dropoff (the lowest feasible tier), breaking
//! ties by lower current load, then higher success rate.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::collaborators::Notifier;
use crate::config::CourierConfig;
use crate::courier::Courier;
use crate::error::{CoreError, CoreResult};
use crate::opcode::OpCode;
use crate::store::CoreStore;
use crate::task::{DeliveryTask, TaskState};

/// Outcome counters for one timeout sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub reassigned: usize,
    pub escalated: usize,
    pub failed: usize,
}

pub struct TaskDispatcher {
    store: Arc<dyn CoreStore>,
    notifier: Arc<dyn Notifier>,
    config: CourierConfig,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<dyn CoreStore>,
        notifier: Arc<dyn Notifier>,
        config: CourierConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            config,
        }
    }

    fn default_deadline(&self, from: DateTime<Utc>) -> DateTime<Utc> {
        from + Duration::minutes(self.config.timeout_minutes)
    }

    /// Open a delivery leg for a barcode and assign the best courier. The
    /// store rejects a second active leg for the same barcode.
    pub async fn create_task(
        &self,
        barcode_id: Uuid,
        pickup: OpCode,
        dropoff: OpCode,
        deadline: Option<DateTime<Utc>>,
    ) -> CoreResult<DeliveryTask> {
        let mut task = DeliveryTask::new(
            barcode_id,
            pickup,
            dropoff.clone(),
            deadline.unwrap_or_else(|| self.default_deadline(Utc::now())),
        );
        if let Some(courier) = self.choose_courier(&dropoff, &[]).await? {
            task.assigned_courier_id = Some(courier.id);
        }
        let task = self.store.insert_task(task).await?;
        info!(
            task_id = %task.id,
            barcode_id = %barcode_id,
            courier = ?task.assigned_courier_id,
            "delivery task created"
        );
        Ok(task)
    }

    /// Courier acknowledges a pending leg.
    pub async fn accept(&self, courier_id: Uuid, task_id: Uuid) -> CoreResult<DeliveryTask> {
        self.advance(courier_id, task_id, TaskState::Pending, TaskState::Accepted)
            .await
    }

    /// Courier picks the letter up and starts the leg.
    pub async fn start(&self, courier_id: Uuid, task_id: Uuid) -> CoreResult<DeliveryTask> {
        self.advance(courier_id, task_id, TaskState::Accepted, TaskState::InProgress)
            .await
    }

    async fn advance(
        &self,
        courier_id: Uuid,
        task_id: Uuid,
        from: TaskState,
        to: TaskState,
    ) -> CoreResult<DeliveryTask> {
        let mut task = self
            .store
            .task_by_id(task_id)
            .await?
            .ok_or_else(|| CoreError::not_found("task", task_id.to_string()))?;
        if task.assigned_courier_id != Some(courier_id) {
            return Err(CoreError::Conflict(format!(
                "task {task_id} is not assigned to courier {courier_id}"
            )));
        }
        if task.state != from {
            return Err(CoreError::Conflict(format!(
                "task {task_id} is {}, expected {}",
                task.state.as_str(),
                from.as_str()
            )));
        }
        task.state = to;
        self.store.update_task(task.clone()).await?;
        Ok(task)
    }

    /// Longest covering prefix wins; ties break by (lower active load,
    /// higher success rate).
    async fn choose_courier(
        &self,
        dropoff: &OpCode,
        exclude: &[Uuid],
    ) -> CoreResult<Option<Courier>> {
        let candidates = self.store.active_couriers_covering(dropoff).await?;
        let best_len = candidates
            .iter()
            .filter(|c| !exclude.contains(&c.id))
            .map(|c| c.managed_prefix.len())
            .max();
        let Some(best_len) = best_len else {
            return Ok(None);
        };

        let mut ranked = Vec::new();
        for courier in candidates {
            if exclude.contains(&courier.id) || courier.managed_prefix.len() != best_len {
                continue;
            }
            let load = self.store.active_task_count(courier.id).await?;
            ranked.push((load, courier));
        }
        ranked.sort_by(|(load_a, a), (load_b, b)| {
            load_a.cmp(load_b).then(
                b.success_rate()
                    .partial_cmp(&a.success_rate())
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
        });
        Ok(ranked.into_iter().next().map(|(_, courier)| courier))
    }

    /// Flag overdue pending/accepted legs and reassign them; after
    /// `courier.reassign_limit` hand-offs the leg escalates to the parent
    /// tier, and with nowhere left to go it fails.
    pub async fn sweep_timeouts(&self, now: DateTime<Utc>) -> CoreResult<SweepReport> {
        let mut report = SweepReport::default();
        for task in self.store.overdue_tasks(now, 100).await? {
            if task.reassign_count < self.config.reassign_limit {
                self.reassign(&task, now, &mut report).await?;
            } else {
                self.escalate(&task, now, &mut report).await?;
            }
        }
        if report != SweepReport::default() {
            info!(?report, "courier timeout sweep");
        }
        Ok(report)
    }

    async fn reassign(
        &self,
        task: &DeliveryTask,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> CoreResult<()> {
        let mut exclude: Vec<Uuid> = task.assigned_courier_id.into_iter().collect();
        for prior in prior_assignees(task) {
            exclude.push(prior);
        }

        let mut closed = task.clone();
        closed.state = TaskState::Reassigned;
        self.store.update_task(closed).await?;

        let mut successor = task.successor(self.default_deadline(now));
        if let Some(courier) = self.choose_courier(&task.dropoff_op_code, &exclude).await? {
            successor.assigned_courier_id = Some(courier.id);
        }
        let successor = self.store.insert_task(successor).await?;
        report.reassigned += 1;
        info!(
            old_task = %task.id,
            new_task = %successor.id,
            courier = ?successor.assigned_courier_id,
            "overdue task reassigned"
        );
        Ok(())
    }

    async fn escalate(
        &self,
        task: &DeliveryTask,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> CoreResult<()> {
        // Walk to the assignee's parent; fall back to any broader active
        // courier covering the dropoff.
        let parent = match task.assigned_courier_id {
            Some(courier_id) => match self.store.courier_by_id(courier_id).await? {
                Some(courier) => match courier.parent_id {
                    Some(parent_id) => self.store.courier_by_id(parent_id).await?,
                    None => None,
                },
                None => None,
            },
            None => None,
        };
        let parent = match parent {
            Some(p) => Some(p),
            None => self
                .store
                .active_couriers_covering(&task.dropoff_op_code)
                .await?
                .into_iter()
                .filter(|c| {
                    task.assigned_courier_id != Some(c.id)
                        && !prior_assignees(task).contains(&c.id)
                })
                .min_by_key(|c| c.managed_prefix.len()),
        };

        let Some(parent) = parent else {
            let mut failed = task.clone();
            failed.state = TaskState::Failed;
            failed.completed_at = Some(now);
            self.store.update_task(failed).await?;
            report.failed += 1;
            warn!(task_id = %task.id, "no courier available after escalation; task failed");
            self.notify(
                "courier.task_failed",
                json!({ "task_id": task.id, "barcode_id": task.barcode_id }),
            )
            .await;
            return Ok(());
        };

        let mut closed = task.clone();
        closed.state = TaskState::Reassigned;
        self.store.update_task(closed).await?;

        let mut successor = task.successor(self.default_deadline(now));
        successor.assigned_courier_id = Some(parent.id);
        successor.metadata["escalated"] = json!(true);
        let successor = self.store.insert_task(successor).await?;
        report.escalated += 1;
        warn!(
            old_task = %task.id,
            new_task = %successor.id,
            manager = %parent.user_ref,
            "task escalated to parent tier"
        );
        self.notify(
            "courier.task_escalated",
            json!({
                "task_id": successor.id,
                "barcode_id": successor.barcode_id,
                "manager_ref": parent.user_ref,
            }),
        )
        .await;
        Ok(())
    }

    async fn notify(&self, topic: &str, payload: serde_json::Value) {
        if let Err(err) = self.notifier.publish(topic, payload).await {
            warn!(topic, %err, "notification publish failed");
        }
    }
}

fn prior_assignees(task: &DeliveryTask) -> Vec<Uuid> {
    task.metadata
        .get("prior_assignees")
        .and_then(|v| v.as_array())
        .map(|ids| {
            ids.iter()
                .filter_map(|v| v.as_str())
                .filter_map(|s| s.parse().ok())
                .collect()
        })
        .unwrap_or_default()
}
