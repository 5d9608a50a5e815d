use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::spec::ToolSpec;
use crate::tool::{Tool, ToolContext, ToolError};

#[derive(Debug, Clone, Deserialize)]
struct AggregationOperation {
    #[serde(rename = "type")]
    op_type: String,
    column: String,
}

#[derive(Debug, Deserialize)]
struct ExcelAnalyzerInput {
    #[serde(default)]
    file_id: Option<String>,
    #[serde(default)]
    sheet_name: Option<String>,
    operations: Vec<AggregationOperation>,
    /// Inline rows for quick previews; without them the job is queued.
    #[serde(default)]
    sample_rows: Option<Vec<HashMap<String, Value>>>,
    #[serde(default = "default_limit_rows")]
    limit_rows: usize,
}

fn default_limit_rows() -> usize {
    500
}

#[derive(Debug, Serialize)]
struct AggregationResult {
    operation: String,
    column: String,
    value: Option<f64>,
    rows_scanned: usize,
}

const SUPPORTED_OPS: [&str; 5] = ["sum", "avg", "min", "max", "count"];

/// Runs lightweight aggregations inline or defers heavy jobs.
pub struct ExcelAnalyzerTool;

#[async_trait]
impl Tool for ExcelAnalyzerTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "excel_analyzer".to_string(),
            version: "1.0.0".to_string(),
            display_name: "Análisis de hojas de cálculo".to_string(),
            description: "Lee hojas de cálculo, valida tipos básicos y genera agregados."
                .to_string(),
            category: "analytics".to_string(),
            capabilities: vec![
                "spreadsheets".to_string(),
                "analytics".to_string(),
                "preview".to_string(),
            ],
            input_schema: json!({
                "type": "object",
                "required": ["operations"],
                "properties": {
                    "file_id": { "type": "string" },
                    "sheet_name": { "type": "string" },
                    "operations": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "required": ["type", "column"],
                            "properties": {
                                "type": { "type": "string", "enum": SUPPORTED_OPS },
                                "column": { "type": "string" }
                            }
                        }
                    },
                    "sample_rows": { "type": "array" },
                    "limit_rows": { "type": "integer", "default": 500 }
                }
            }),
            output_schema: json!({
                "type": "object",
                "properties": {
                    "status": { "type": "string", "enum": ["inline", "queued"] },
                    "message": { "type": "string" },
                    "operations": { "type": "array" },
                    "data_preview": { "type": "array" }
                }
            }),
            tags: vec!["excel".to_string(), "analytics".to_string()],
            owner: "copilot-os".to_string(),
            rate_limit: None,
            timeout_ms: 15_000,
            max_payload_kb: 32,
            requires_auth: true,
        }
    }

    async fn invoke(&self, payload: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let input: ExcelAnalyzerInput = serde_json::from_value(payload)
            .map_err(|e| ToolError::invalid_payload(e.to_string()))?;

        if input.operations.is_empty() {
            return Err(ToolError::invalid_payload(
                "at least one operation is required",
            ));
        }
        if let Some(op) = input
            .operations
            .iter()
            .find(|op| !SUPPORTED_OPS.contains(&op.op_type.as_str()))
        {
            return Err(ToolError::invalid_payload(format!(
                "unsupported operation '{}'",
                op.op_type
            )));
        }
        if input.limit_rows == 0 || input.limit_rows > 5000 {
            return Err(ToolError::invalid_payload(
                "limit_rows must be between 1 and 5000",
            ));
        }

        if let Some(rows) = &input.sample_rows {
            info!(
                request_id = %ctx.request_id,
                operations = input.operations.len(),
                sheet = ?input.sheet_name,
                "excel analyzer running inline preview"
            );
            let preview: Vec<&HashMap<String, Value>> =
                rows.iter().take(input.limit_rows).collect();
            return Ok(json!({
                "status": "inline",
                "message": "Preview generated from supplied rows",
                "operations": run_aggregations(&input),
                "data_preview": preview,
            }));
        }

        let Some(file_id) = &input.file_id else {
            return Err(ToolError::invalid_payload(
                "file_id is required when sample_rows are not provided",
            ));
        };

        info!(
            file_id = %file_id,
            sheet = ?input.sheet_name,
            request_id = %ctx.request_id,
            "excel analyzer scheduled asynchronous run"
        );
        Ok(json!({
            "status": "queued",
            "message": "Requested analysis was queued; results will be attached asynchronously.",
            "operations": [],
            "data_preview": null,
        }))
    }
}

fn run_aggregations(input: &ExcelAnalyzerInput) -> Vec<AggregationResult> {
    let rows = input.sample_rows.as_deref().unwrap_or(&[]);
    let scanned: Vec<&HashMap<String, Value>> = rows.iter().take(input.limit_rows).collect();

    input
        .operations
        .iter()
        .map(|op| {
            let values: Vec<f64> = scanned
                .iter()
                .filter_map(|row| row.get(&op.column))
                .filter_map(as_number)
                .collect();

            let value = match op.op_type.as_str() {
                "count" => Some(values.len() as f64),
                _ if values.is_empty() => None,
                "sum" => Some(values.iter().sum()),
                "avg" => Some(values.iter().sum::<f64>() / values.len() as f64),
                "min" => values.iter().copied().reduce(f64::min),
                "max" => values.iter().copied().reduce(f64::max),
                _ => None,
            };

            AggregationResult {
                operation: op.op_type.clone(),
                column: op.column.clone(),
                value,
                rows_scanned: scanned.len(),
            }
        })
        .collect()
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows() -> Value {
        json!([
            {"importe": 100.0, "region": "norte"},
            {"importe": 250.0, "region": "sur"},
            {"importe": "50",  "region": "norte"},
            {"importe": null,  "region": "este"}
        ])
    }

    #[tokio::test]
    async fn inline_aggregations() {
        let tool = ExcelAnalyzerTool;
        let result = tool
            .invoke(
                json!({
                    "operations": [
                        {"type": "sum", "column": "importe"},
                        {"type": "avg", "column": "importe"},
                        {"type": "count", "column": "importe"},
                        {"type": "max", "column": "importe"}
                    ],
                    "sample_rows": rows(),
                }),
                &ToolContext::new("r", "u-1"),
            )
            .await
            .expect("invoke");

        assert_eq!(result["status"], "inline");
        let ops = result["operations"].as_array().expect("ops");
        assert_eq!(ops[0]["value"], 400.0); // sum, "50" coerced
        assert!((ops[1]["value"].as_f64().expect("avg") - 400.0 / 3.0).abs() < 1e-9);
        assert_eq!(ops[2]["value"], 3.0); // count skips the null
        assert_eq!(ops[3]["value"], 250.0);
    }

    #[tokio::test]
    async fn queued_when_only_file_id() {
        let tool = ExcelAnalyzerTool;
        let result = tool
            .invoke(
                json!({
                    "file_id": "sheet-9",
                    "operations": [{"type": "sum", "column": "importe"}]
                }),
                &ToolContext::new("r", "u-1"),
            )
            .await
            .expect("invoke");
        assert_eq!(result["status"], "queued");
    }

    #[tokio::test]
    async fn operations_required() {
        let tool = ExcelAnalyzerTool;
        let err = tool
            .invoke(json!({"operations": []}), &ToolContext::new("r", "u-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "invalid_payload");
    }

    #[tokio::test]
    async fn unsupported_operation_rejected() {
        let tool = ExcelAnalyzerTool;
        let err = tool
            .invoke(
                json!({"operations": [{"type": "median", "column": "x"}], "sample_rows": []}),
                &ToolContext::new("r", "u-1"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "invalid_payload");
    }
}
