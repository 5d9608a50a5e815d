//! Built-in MCP tools.
//!
//! Each tool lives in its own module and implements [`crate::tool::Tool`].
//! Auditor plugins consumed by `audit_file` are opaque callables behind
//! the [`audit_file::Auditor`] trait.

pub mod audit_file;
pub mod excel_analyzer;
pub mod viz_tool;

use std::sync::Arc;

use copilotos_core::cache::MemoryCache;

use crate::lazy::LazyToolRegistry;
use crate::registry::ToolRegistry;
use crate::tool::Tool;

/// Build the eager registry with every built-in tool.
pub fn builtin_registry(cache: Arc<MemoryCache>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    // Registration cannot fail for compile-time version strings.
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(audit_file::AuditFileTool::with_default_auditors(Arc::clone(&cache))),
        Arc::new(excel_analyzer::ExcelAnalyzerTool),
        Arc::new(viz_tool::VizTool),
    ];
    for tool in tools {
        if let Err(e) = registry.register(tool) {
            tracing::error!(error = %e, "builtin tool registration failed");
        }
    }
    registry
}

/// Build the lazy registry mirroring the built-ins with on-demand loading.
pub fn builtin_lazy_registry(cache: Arc<MemoryCache>) -> LazyToolRegistry {
    let mut registry = LazyToolRegistry::new();
    let audit_cache = Arc::clone(&cache);
    registry.register_factory(
        "audit_file",
        "audit",
        "Audita un documento y publica el reporte de hallazgos.",
        move || {
            Arc::new(audit_file::AuditFileTool::with_default_auditors(Arc::clone(
                &audit_cache,
            ))) as Arc<dyn Tool>
        },
    );
    registry.register_factory(
        "excel_analyzer",
        "analytics",
        "Lee hojas de cálculo y genera agregados básicos.",
        || Arc::new(excel_analyzer::ExcelAnalyzerTool) as Arc<dyn Tool>,
    );
    registry.register_factory(
        "viz_tool",
        "visualization",
        "Genera un spec de visualización a partir de datos tabulares.",
        || Arc::new(viz_tool::VizTool) as Arc<dyn Tool>,
    );
    registry
}
