use std::sync::Arc;

use axum::http::{HeaderValue, Method};
use axum::middleware;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use rusqlite::Connection;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

use copilotos_chat::context::DocumentContextCache;
use copilotos_chat::handlers::HandlerChain;
use copilotos_chat::{ChatService, SaptivaClient};
use copilotos_core::cache::MemoryCache;
use copilotos_core::config::CopilotConfig;
use copilotos_core::{ApiError, Result};
use copilotos_mcp::cache::ToolResultCache;
use copilotos_mcp::lazy::LazyToolRegistry;
use copilotos_mcp::security::RateLimiter;
use copilotos_mcp::tasks::TaskManager;
use copilotos_mcp::{McpInvoker, RateLimitConfig};
use copilotos_prompts::PromptRegistry;
use copilotos_retrieval::analyze::HeuristicAnalyzer;
use copilotos_retrieval::embedding::EmbeddingService;
use copilotos_retrieval::index::Embedder;
use copilotos_retrieval::intent::IntentClassifier;
use copilotos_retrieval::AdaptiveRetrievalOrchestrator;
use copilotos_sessions::SessionStore;
use copilotos_users::{AuthService, TokenService};

use crate::http;
use crate::middleware::{
    auth_middleware, cache_control_middleware, rate_limit_middleware, telemetry_middleware,
    trusted_host_middleware, FixedWindowState,
};
use crate::retrieval::{HashEmbedder, MemoryVectorIndex};

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
///
/// Every process-wide singleton (prompt registry, rate limiter, task
/// manager, tool cache, lazy registry) is owned here and initialized once
/// at startup; nothing lives in ambient globals.
pub struct AppState {
    pub config: CopilotConfig,
    pub cache: Arc<MemoryCache>,
    pub auth: AuthService,
    pub sessions: Arc<SessionStore>,
    pub chat: ChatService,
    pub chain: HandlerChain,
    pub invoker: Arc<McpInvoker>,
    pub lazy: LazyToolRegistry,
    pub tasks: Arc<TaskManager>,
    pub tool_cache: Arc<ToolResultCache>,
    pub intent: IntentClassifier,
    pub prompts: Arc<PromptRegistry>,
    pub retrieval: AdaptiveRetrievalOrchestrator,
    pub embeddings: Arc<EmbeddingService>,
    pub vector_index: Arc<MemoryVectorIndex>,
    pub metrics_handle: PrometheusHandle,
    pub request_windows: FixedWindowState,
}

impl AppState {
    pub fn build(config: CopilotConfig, metrics_handle: PrometheusHandle) -> Result<Self> {
        let cache = Arc::new(MemoryCache::new());

        // Prompt registry: required, validated for a `default` entry.
        let prompts = match PromptRegistry::load(&config.prompts.registry_path) {
            Ok(registry) => {
                registry
                    .validate()
                    .map_err(|e| ApiError::Config(e.to_string()))?;
                Arc::new(registry)
            }
            Err(e) => {
                warn!(error = %e, path = %config.prompts.registry_path, "prompt registry missing, using built-in default");
                Arc::new(builtin_prompt_registry()?)
            }
        };

        let open = |path: &str| -> Result<Connection> {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(path).map_err(|e| ApiError::Database(e.to_string()))?;
            // Two subsystems share the database file; wait out writer locks
            // instead of surfacing SQLITE_BUSY.
            conn.busy_timeout(std::time::Duration::from_secs(5))
                .map_err(|e| ApiError::Database(e.to_string()))?;
            Ok(conn)
        };

        let sessions = Arc::new(
            SessionStore::new(open(&config.database.path)?, Arc::clone(&cache))
                .map_err(|e| ApiError::Database(e.to_string()))?,
        );
        let auth = AuthService::new(
            open(&config.database.path)?,
            Arc::clone(&cache),
            TokenService::new(
                &config.auth.jwt_secret_key,
                config.auth.access_token_ttl_secs,
                config.auth.refresh_token_ttl_secs,
            ),
        )?;

        let tool_registry = Arc::new(copilotos_mcp::tools::builtin_registry(Arc::clone(&cache)));
        let tool_cache = Arc::new(ToolResultCache::new(Arc::clone(&cache)));
        let invoker = Arc::new(McpInvoker::new(
            Arc::clone(&tool_registry),
            Arc::new(RateLimiter::new()),
            Arc::clone(&tool_cache),
            RateLimitConfig {
                calls_per_minute: config.mcp.calls_per_minute,
                calls_per_hour: config.mcp.calls_per_hour,
            },
            config.mcp.max_payload_kb,
        ));
        let lazy = copilotos_mcp::tools::builtin_lazy_registry(Arc::clone(&cache));
        let tasks = Arc::new(TaskManager::new(config.mcp.task_ttl_hours));

        let client = Arc::new(SaptivaClient::new(config.saptiva.clone()));
        let chat = ChatService::new(
            Arc::clone(&prompts),
            Arc::clone(&client),
            Arc::clone(&sessions),
            DocumentContextCache::new(Arc::clone(&cache)),
            Arc::clone(&tool_registry),
            config.prompts.enable_model_system_prompt,
        );
        let chain = HandlerChain::with_dependencies(Some(Arc::clone(&invoker)));

        // Retrieval stack: heuristic analyzer + in-process embedder and
        // vector index (stand-ins for the external model/index backends).
        let vector_index = Arc::new(MemoryVectorIndex::new());
        let embeddings = Arc::new(EmbeddingService::new(|| {
            Arc::new(HashEmbedder) as Arc<dyn Embedder>
        }));
        let retrieval = AdaptiveRetrievalOrchestrator::new(
            Arc::new(HeuristicAnalyzer::new()),
            Arc::clone(&vector_index) as Arc<dyn copilotos_retrieval::index::VectorIndex>,
            Arc::clone(&embeddings),
        );

        info!(
            models = prompts.available_models().len(),
            tools = tool_registry.tool_names().len(),
            mock = client.is_mock(),
            "application state initialized"
        );

        Ok(Self {
            config,
            cache,
            auth,
            sessions,
            chat,
            chain,
            invoker,
            lazy,
            tasks,
            tool_cache,
            intent: IntentClassifier::new(),
            prompts,
            retrieval,
            embeddings,
            vector_index,
            metrics_handle,
            request_windows: FixedWindowState::default(),
        })
    }
}

/// Fallback registry used when no YAML file is deployed; keeps local
/// development working with the default entry the validator requires.
fn builtin_prompt_registry() -> Result<PromptRegistry> {
    const DEFAULT_REGISTRY: &str = r#"
version: "builtin-v1"
copilot_name: "CopilotOS"
org_name: "Saptiva"
models:
  default:
    system_base: |
      Eres {CopilotOS}, el copiloto conversacional de {Saptiva}.
      Responde en español de forma clara y directa.
      Herramientas disponibles
      {TOOLS}
"#;
    PromptRegistry::parse(DEFAULT_REGISTRY).map_err(|e| ApiError::Config(e.to_string()))
}

/// Assemble the full router with the middleware stack
/// (outer → inner): trusted hosts → CORS → telemetry → auth →
/// per-user rate limit → cache-control.
pub fn build_router(state: Arc<AppState>) -> Router {
    let public = Router::new()
        .route("/health", get(http::misc::health))
        .route("/api/auth/register", post(http::auth::register))
        .route("/api/auth/login", post(http::auth::login))
        .route("/api/auth/refresh", post(http::auth::refresh))
        .route("/api/auth/forgot-password", post(http::auth::forgot_password))
        .route("/api/auth/reset-password", post(http::auth::reset_password));

    let protected = Router::new()
        .route("/api/auth/me", get(http::auth::me))
        .route("/api/auth/logout", post(http::auth::logout))
        .route("/api/chat", post(http::chat::chat))
        .route("/api/stream", post(http::chat::stream))
        .route("/api/history/{chat_id}", get(http::sessions::history))
        .route("/api/sessions", get(http::sessions::list_sessions))
        .route(
            "/api/sessions/{id}",
            patch(http::sessions::update_session).delete(http::sessions::delete_session),
        )
        .route(
            "/api/sessions/{id}/canvas",
            get(http::sessions::get_canvas).patch(http::sessions::patch_canvas),
        )
        .route(
            "/api/sessions/{id}/research",
            get(http::sessions::session_research),
        )
        .route("/api/sessions/{id}/export", get(http::sessions::export))
        .route(
            "/api/documents/{id}/index",
            post(http::documents::index_document),
        )
        .route("/api/documents/search", post(http::documents::search_documents))
        .route("/api/intent", post(http::misc::classify_intent))
        .route("/api/models", get(http::misc::models))
        .route("/api/features", get(http::misc::features))
        .route(
            "/api/settings",
            get(http::misc::get_settings).patch(http::misc::patch_settings),
        )
        .route("/api/metrics", get(http::misc::metrics))
        .route(
            "/api/research",
            get(http::misc::research_list).post(http::misc::research_trigger),
        )
        .route("/api/mcp/tools", get(http::mcp::list_tools))
        .route("/api/mcp/invoke", post(http::mcp::invoke))
        .route("/api/mcp/health", get(http::mcp::mcp_health))
        .route("/api/mcp/discover", get(http::mcp::discover))
        .route("/api/mcp/schema/{tool}", get(http::mcp::schema))
        .route(
            "/api/mcp/tasks",
            post(http::mcp::create_task).get(http::mcp::list_tasks),
        )
        .route(
            "/api/mcp/tasks/{id}",
            get(http::mcp::get_task).delete(http::mcp::cancel_task),
        )
        .route(
            "/api/mcp/cache/tool/{tool}/{doc}",
            delete(http::mcp::invalidate_tool_cache),
        )
        .route(
            "/api/mcp/cache/document/{doc}",
            delete(http::mcp::invalidate_document_cache),
        )
        .route("/api/mcp/cache/all", delete(http::mcp::invalidate_all_caches))
        .route("/api/mcp/cache/stats", get(http::mcp::cache_stats))
        .route("/api/mcp/cache/warmup", post(http::mcp::warmup_cache))
        .route("/api/mcp/lazy/discover", get(http::mcp::lazy_discover))
        .route("/api/mcp/lazy/tools/{name}", get(http::mcp::lazy_tool_spec))
        .route("/api/mcp/lazy/invoke", post(http::mcp::lazy_invoke))
        .route("/api/mcp/lazy/stats", get(http::mcp::lazy_stats))
        .route(
            "/api/mcp/lazy/tools/{name}/unload",
            post(http::mcp::lazy_unload),
        )
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit_middleware,
        ))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    let cors = cors_layer(&state.config.gateway.cors_origins);

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(middleware::from_fn(cache_control_middleware))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            telemetry_middleware,
        ))
        .layer(cors)
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            trusted_host_middleware,
        ))
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            axum::http::header::AUTHORIZATION,
            axum::http::header::CONTENT_TYPE,
        ])
        .allow_credentials(true);

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| o.parse::<HeaderValue>().ok())
        .collect();
    if parsed.is_empty() {
        layer
    } else {
        layer.allow_origin(AllowOrigin::list(parsed))
    }
}
