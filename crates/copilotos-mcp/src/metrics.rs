//! Metric names and emission helpers for the MCP subsystem.
//!
//! Counters carry `{tool, version, status, outcome, user_type}` labels;
//! durations go to a histogram. The exporter is installed by the gateway.

use metrics::{counter, histogram};

pub const TOOL_INVOCATIONS: &str = "mcp_tool_invocations_total";
pub const TOOL_DURATION_MS: &str = "mcp_tool_duration_ms";
pub const TASKS_CREATED: &str = "mcp_tasks_created_total";
pub const TASKS_COMPLETED: &str = "mcp_tasks_completed_total";
pub const TASKS_CANCELLED: &str = "mcp_tasks_cancelled_total";
pub const TASKS_FAILED: &str = "mcp_tasks_failed_total";

pub fn record_invocation(
    tool: &str,
    version: &str,
    success: bool,
    outcome: &str,
    user_type: &str,
    duration_ms: f64,
) {
    let status = if success { "ok" } else { "error" };
    counter!(
        TOOL_INVOCATIONS,
        "tool" => tool.to_string(),
        "version" => version.to_string(),
        "status" => status,
        "outcome" => outcome.to_string(),
        "user_type" => user_type.to_string(),
    )
    .increment(1);
    histogram!(
        TOOL_DURATION_MS,
        "tool" => tool.to_string(),
        "version" => version.to_string(),
    )
    .record(duration_ms);
}

pub fn record_task_created(tool: &str) {
    counter!(TASKS_CREATED, "tool" => tool.to_string()).increment(1);
}

pub fn record_task_completed(tool: &str) {
    counter!(TASKS_COMPLETED, "tool" => tool.to_string()).increment(1);
}

pub fn record_task_cancelled(tool: &str) {
    counter!(TASKS_CANCELLED, "tool" => tool.to_string()).increment(1);
}

pub fn record_task_failed(tool: &str) {
    counter!(TASKS_FAILED, "tool" => tool.to_string()).increment(1);
}
