use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::spec::ToolSpec;
use crate::tool::{Tool, ToolContext, ToolError};

const CHART_TYPES: [&str; 5] = ["bar", "line", "pie", "table", "scatter"];

#[derive(Debug, Deserialize)]
struct VizToolInput {
    query: String,
    #[serde(default = "default_chart_type")]
    chart_type: String,
    #[serde(default)]
    x: Option<String>,
    #[serde(default)]
    y: Vec<String>,
    /// Inline dataset for preview rendering; without it the query is queued.
    #[serde(default)]
    dataset: Option<Vec<Value>>,
    #[serde(default)]
    connection_id: Option<String>,
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_chart_type() -> String {
    "bar".to_string()
}
fn default_limit() -> usize {
    250
}

/// Generates chart specs from preview data or defers heavy queries.
pub struct VizTool;

#[async_trait]
impl Tool for VizTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "viz_tool".to_string(),
            version: "1.0.0".to_string(),
            display_name: "Visualización de datos".to_string(),
            description: "Ejecuta consultas y regresa un spec de gráfica para el frontend."
                .to_string(),
            category: "visualization".to_string(),
            capabilities: vec![
                "analytics".to_string(),
                "visualization".to_string(),
                "sql-gateway".to_string(),
            ],
            input_schema: json!({
                "type": "object",
                "required": ["query"],
                "properties": {
                    "query": { "type": "string" },
                    "chart_type": { "type": "string", "enum": CHART_TYPES, "default": "bar" },
                    "x": { "type": "string" },
                    "y": { "type": "array", "items": { "type": "string" } },
                    "dataset": { "type": "array" },
                    "connection_id": { "type": "string" },
                    "limit": { "type": "integer", "default": 250 }
                }
            }),
            output_schema: json!({
                "type": "object",
                "properties": {
                    "status": { "type": "string" },
                    "spec": { "type": "object" },
                    "insights": { "type": "array" },
                    "result_preview": { "type": "array" }
                }
            }),
            tags: vec!["charts".to_string()],
            owner: "copilot-os".to_string(),
            rate_limit: None,
            timeout_ms: 20_000,
            max_payload_kb: 32,
            requires_auth: true,
        }
    }

    async fn invoke(&self, payload: Value, ctx: &ToolContext) -> Result<Value, ToolError> {
        let input: VizToolInput = serde_json::from_value(payload)
            .map_err(|e| ToolError::invalid_payload(e.to_string()))?;

        if !CHART_TYPES.contains(&input.chart_type.as_str()) {
            return Err(ToolError::invalid_payload(format!(
                "unsupported chart_type '{}'",
                input.chart_type
            )));
        }
        if input.limit == 0 || input.limit > 5000 {
            return Err(ToolError::invalid_payload("limit must be between 1 and 5000"));
        }

        if let Some(dataset) = &input.dataset {
            info!(
                chart_type = %input.chart_type,
                request_id = %ctx.request_id,
                rows = dataset.len(),
                "viz tool generating inline spec"
            );
            let preview: Vec<Value> = dataset.iter().take(input.limit).cloned().collect();
            return Ok(json!({
                "status": "inline",
                "spec": build_spec(&input),
                "insights": generate_insights(&input),
                "result_preview": preview,
            }));
        }

        let Some(connection_id) = &input.connection_id else {
            return Err(ToolError::invalid_payload(
                "connection_id is required when dataset preview is absent",
            ));
        };

        info!(
            connection_id = %connection_id,
            chart_type = %input.chart_type,
            request_id = %ctx.request_id,
            "viz tool queued execution"
        );
        Ok(json!({
            "status": "queued",
            "spec": {
                "type": input.chart_type,
                "config": { "query": input.query, "status": "pending" },
            },
            "insights": [],
            "result_preview": null,
        }))
    }
}

fn build_spec(input: &VizToolInput) -> Value {
    let dataset = input.dataset.as_deref().unwrap_or(&[]);

    let x_values: Vec<Value> = match &input.x {
        Some(x) => dataset
            .iter()
            .map(|row| row.get(x).cloned().unwrap_or(Value::Null))
            .collect(),
        None => (0..dataset.len()).map(|i| json!(i)).collect(),
    };

    let metrics: Vec<String> = if input.y.is_empty() {
        vec!["value".to_string()]
    } else {
        input.y.clone()
    };

    let traces: Vec<Value> = metrics
        .iter()
        .map(|metric| {
            json!({
                "type": if input.chart_type == "line" { "scatter" } else { input.chart_type.as_str() },
                "mode": if input.chart_type == "line" { "lines+markers" } else { "markers" },
                "name": metric,
                "x": x_values.clone(),
                "y": dataset
                    .iter()
                    .map(|row| row.get(metric).cloned().unwrap_or(Value::Null))
                    .collect::<Vec<Value>>(),
            })
        })
        .collect();

    let title = if input.query.len() > 80 {
        format!("{}...", &input.query[..80])
    } else {
        input.query.clone()
    };

    json!({
        "data": traces,
        "layout": {
            "title": title,
            "xaxis": { "title": input.x.clone().unwrap_or_else(|| "index".to_string()) },
            "yaxis": { "title": metrics.join(", ") },
        }
    })
}

fn generate_insights(input: &VizToolInput) -> Vec<String> {
    let Some(dataset) = &input.dataset else {
        return Vec::new();
    };
    let Some(first_metric) = input.y.first() else {
        return Vec::new();
    };

    let values: Vec<f64> = dataset
        .iter()
        .filter_map(|row| row.get(first_metric))
        .filter_map(|v| v.as_f64())
        .collect();
    if values.is_empty() {
        return Vec::new();
    }

    let max = values.iter().copied().fold(f64::MIN, f64::max);
    let min = values.iter().copied().fold(f64::MAX, f64::min);
    let avg = values.iter().sum::<f64>() / values.len() as f64;
    vec![
        format!("Valor máximo de {first_metric}: {max}"),
        format!("Valor mínimo de {first_metric}: {min}"),
        format!("Promedio de {first_metric}: {}", (avg * 100.0).round() / 100.0),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> Value {
        json!([
            {"mes": "enero", "ventas": 120.0},
            {"mes": "febrero", "ventas": 180.0},
            {"mes": "marzo", "ventas": 90.0}
        ])
    }

    #[tokio::test]
    async fn inline_spec_with_insights() {
        let tool = VizTool;
        let result = tool
            .invoke(
                json!({
                    "query": "ventas por mes",
                    "chart_type": "line",
                    "x": "mes",
                    "y": ["ventas"],
                    "dataset": dataset(),
                }),
                &ToolContext::new("r", "u-1"),
            )
            .await
            .expect("invoke");

        assert_eq!(result["status"], "inline");
        let trace = &result["spec"]["data"][0];
        assert_eq!(trace["type"], "scatter");
        assert_eq!(trace["mode"], "lines+markers");
        assert_eq!(trace["x"][0], "enero");
        assert_eq!(trace["y"][1], 180.0);

        let insights = result["insights"].as_array().expect("insights");
        assert_eq!(insights.len(), 3);
        assert!(insights[0].as_str().expect("max").contains("180"));
    }

    #[tokio::test]
    async fn queued_without_dataset() {
        let tool = VizTool;
        let result = tool
            .invoke(
                json!({"query": "select 1", "connection_id": "warehouse"}),
                &ToolContext::new("r", "u-1"),
            )
            .await
            .expect("invoke");
        assert_eq!(result["status"], "queued");
        assert_eq!(result["spec"]["config"]["status"], "pending");
    }

    #[tokio::test]
    async fn connection_required_without_dataset() {
        let tool = VizTool;
        let err = tool
            .invoke(json!({"query": "select 1"}), &ToolContext::new("r", "u-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "invalid_payload");
    }

    #[tokio::test]
    async fn bad_chart_type_rejected() {
        let tool = VizTool;
        let err = tool
            .invoke(
                json!({"query": "q", "chart_type": "sankey", "dataset": []}),
                &ToolContext::new("r", "u-1"),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, "invalid_payload");
    }
}
