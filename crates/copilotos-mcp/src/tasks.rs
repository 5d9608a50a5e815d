use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low,
    #[default]
    Normal,
    High,
}

/// A long-running tool invocation with a pollable lifecycle.
#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub task_id: String,
    pub tool: String,
    pub payload: Value,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Monotonically non-decreasing within a task, in [0, 1].
    pub progress: f64,
    pub progress_message: Option<String>,
    pub result: Option<Value>,
    pub error: Option<Value>,
    pub cancellation_requested: bool,
}

/// Manages long-running MCP tasks.
///
/// The map is shared; lifecycle fields of any given task are only written
/// by its background executor (single-writer), while `cancellation_requested`
/// is the one flag the HTTP surface flips.
pub struct TaskManager {
    tasks: DashMap<String, Task>,
    ttl: chrono::Duration,
}

impl TaskManager {
    pub fn new(ttl_hours: u64) -> Self {
        Self {
            tasks: DashMap::new(),
            ttl: chrono::Duration::hours(ttl_hours as i64),
        }
    }

    pub fn create_task(
        &self,
        tool: &str,
        payload: Value,
        user_id: &str,
        priority: TaskPriority,
    ) -> String {
        let task_id = Uuid::new_v4().to_string();
        let task = Task {
            task_id: task_id.clone(),
            tool: tool.to_string(),
            payload,
            status: TaskStatus::Pending,
            priority,
            user_id: user_id.to_string(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            progress: 0.0,
            progress_message: None,
            result: None,
            error: None,
            cancellation_requested: false,
        };
        self.tasks.insert(task_id.clone(), task);
        metrics::record_task_created(tool);
        info!(task_id = %task_id, tool, user_id, "task created");
        task_id
    }

    pub fn get_task(&self, task_id: &str) -> Option<Task> {
        self.tasks.get(task_id).map(|t| t.clone())
    }

    /// Progress only moves forward; regressions from racy reporters are
    /// clamped away.
    pub fn update_progress(&self, task_id: &str, progress: f64, message: Option<String>) {
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            task.progress = task.progress.max(progress.clamp(0.0, 1.0));
            if message.is_some() {
                task.progress_message = message;
            }
        }
    }

    pub fn mark_running(&self, task_id: &str) {
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
            info!(task_id, tool = %task.tool, "task started");
        }
    }

    pub fn mark_completed(&self, task_id: &str, result: Value) {
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            task.progress = 1.0;
            task.result = Some(result);
            metrics::record_task_completed(&task.tool);
            info!(task_id, tool = %task.tool, "task completed");
        }
    }

    pub fn mark_failed(&self, task_id: &str, error: Value) {
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
            metrics::record_task_failed(&task.tool);
            error!(task_id, tool = %task.tool, error_code = %error["code"], "task failed");
            task.error = Some(error);
        }
    }

    pub fn mark_cancelled(&self, task_id: &str) {
        if let Some(mut task) = self.tasks.get_mut(task_id) {
            task.status = TaskStatus::Cancelled;
            task.completed_at = Some(Utc::now());
            metrics::record_task_cancelled(&task.tool);
            info!(task_id, tool = %task.tool, "task cancelled");
        }
    }

    /// Request cancellation. Terminal tasks are left untouched; repeating
    /// the request is idempotent.
    pub fn request_cancellation(&self, task_id: &str) -> bool {
        let Some(mut task) = self.tasks.get_mut(task_id) else {
            return false;
        };
        if task.status.is_terminal() {
            warn!(task_id, status = task.status.as_str(), "cannot cancel terminal task");
            return false;
        }
        task.cancellation_requested = true;
        info!(task_id, tool = %task.tool, "task cancellation requested");
        true
    }

    pub fn is_cancellation_requested(&self, task_id: &str) -> bool {
        self.tasks
            .get(task_id)
            .map(|t| t.cancellation_requested)
            .unwrap_or(false)
    }

    pub fn list_tasks(
        &self,
        user_id: Option<&str>,
        tool: Option<&str>,
        status: Option<TaskStatus>,
    ) -> Vec<Task> {
        let mut tasks: Vec<Task> = self
            .tasks
            .iter()
            .map(|t| t.clone())
            .filter(|t| user_id.is_none_or(|u| t.user_id == u))
            .filter(|t| tool.is_none_or(|name| t.tool == name))
            .filter(|t| status.is_none_or(|s| t.status == s))
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Drop terminal tasks older than the TTL (from completion, or from
    /// creation when they never started). Returns the number removed.
    pub fn cleanup_old_tasks(&self) -> usize {
        let now = Utc::now();
        let before = self.tasks.len();
        self.tasks.retain(|_, task| {
            if !task.status.is_terminal() {
                return true;
            }
            let anchor = task.completed_at.unwrap_or(task.created_at);
            now - anchor <= self.ttl
        });
        let removed = before - self.tasks.len();
        if removed > 0 {
            info!(count = removed, "cleaned up old tasks");
        }
        removed
    }

    /// Hourly cleanup loop. Runs until `shutdown` flips to true.
    pub async fn run_cleanup_loop(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(Duration::from_secs(3600));
        // The first tick fires immediately; skip it.
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.cleanup_old_tasks();
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("task cleanup loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Duration estimate surfaced with the 202 response.
    ///
    /// Heuristics: audit 5 s base; analyzer 10 s + 2 s per declared
    /// operation; viz 3 s; everything else 5 s.
    pub fn estimate_duration_ms(tool: &str, payload: &Value) -> u64 {
        match tool {
            "audit_file" => 5000,
            "excel_analyzer" => {
                let operations = payload
                    .get("operations")
                    .and_then(|o| o.as_array())
                    .map(|a| a.len() as u64)
                    .unwrap_or(0);
                10_000 + operations * 2000
            }
            "viz_tool" => 3000,
            _ => 5000,
        }
    }
}
