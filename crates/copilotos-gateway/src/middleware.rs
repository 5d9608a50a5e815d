use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use metrics::{counter, histogram};
use tracing::{info, warn};

use copilotos_core::ApiError;
use copilotos_users::user_scopes;

use crate::app::AppState;
use crate::problem::ApiProblem;

/// Authenticated caller attached to the request extensions.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: String,
    pub username: String,
    pub email: String,
    pub scopes: HashSet<String>,
}

/// Bearer authentication. SSE-capable endpoints also accept the token via
/// the `token` query parameter because EventSource cannot set headers.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let token = bearer_token(&request).or_else(|| query_token(&request));
    let Some(token) = token else {
        return ApiProblem(ApiError::InvalidToken).into_response();
    };

    let user_id = match state.auth.authenticate_bearer(&token) {
        Ok(user_id) => user_id,
        Err(e) => return ApiProblem(e).into_response(),
    };
    let user = match state.auth.get_user(&user_id) {
        Ok(Some(user)) => user,
        Ok(None) => return ApiProblem(ApiError::InvalidToken).into_response(),
        Err(e) => return ApiProblem(e).into_response(),
    };

    let scopes = user_scopes(&user, &state.config.mcp.admin_users);
    request.extensions_mut().insert(AuthUser {
        user_id: user.id.clone(),
        username: user.username.clone(),
        email: user.email.clone(),
        scopes,
    });
    next.run(request).await
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(String::from)
}

fn query_token(request: &Request) -> Option<String> {
    let query = request.uri().query()?;
    query.split('&').find_map(|pair| {
        pair.strip_prefix("token=")
            .map(|value| value.to_string())
    })
}

/// Fixed-window per-user request budget (default 1000/h). Key is the
/// authenticated user, or the client address for unauthenticated paths.
#[derive(Default)]
pub struct FixedWindowState {
    windows: DashMap<String, (u64, u32)>,
}

impl FixedWindowState {
    /// Returns false when the hourly budget is exhausted.
    pub fn admit(&self, key: &str, limit: u32) -> bool {
        let hour = chrono::Utc::now().timestamp() as u64 / 3600;
        let mut entry = self.windows.entry(key.to_string()).or_insert((hour, 0));
        if entry.0 != hour {
            *entry = (hour, 0);
        }
        if entry.1 >= limit {
            return false;
        }
        entry.1 += 1;
        true
    }
}

pub async fn rate_limit_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let key = match request.extensions().get::<AuthUser>() {
        Some(user) => format!("user:{}", user.user_id),
        None => {
            let ip = request
                .headers()
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown");
            format!("ip:{ip}")
        }
    };

    if !state
        .request_windows
        .admit(&key, state.config.gateway.rate_limit_per_hour)
    {
        warn!(key = %key, "request rate limit exceeded");
        return ApiProblem(ApiError::RateLimited {
            retry_after_ms: 60_000,
        })
        .into_response();
    }
    next.run(request).await
}

/// Per-request counter + duration histogram + structured log line.
pub async fn telemetry_middleware(
    State(_state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();

    let response = next.run(request).await;

    let status = response.status().as_u16();
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "path" => metric_path(&path),
        "status" => status.to_string(),
    )
    .increment(1);
    histogram!(
        "http_request_duration_ms",
        "method" => method.to_string(),
        "path" => metric_path(&path),
    )
    .record(elapsed_ms);

    info!(
        method = %method,
        path = %path,
        status,
        elapsed_ms = format!("{elapsed_ms:.1}"),
        "request"
    );
    response
}

/// Collapse ids so metric label cardinality stays bounded.
fn metric_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            let id_like = segment.len() >= 16
                || segment.chars().all(|c| c.is_ascii_digit()) && !segment.is_empty();
            if id_like {
                "{id}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Force no-store on every API response.
pub async fn cache_control_middleware(request: Request, next: Next) -> Response {
    let is_api = request.uri().path().starts_with("/api");
    let mut response = next.run(request).await;
    if is_api {
        let headers = response.headers_mut();
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-store, no-cache, must-revalidate, max-age=0"),
        );
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(header::EXPIRES, HeaderValue::from_static("0"));
    }
    response
}

/// Host header allow-list. Disabled when the list is empty.
pub async fn trusted_host_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let allowed = &state.config.gateway.allowed_hosts;
    if !allowed.is_empty() {
        let host = request
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_string())
            .unwrap_or_default();
        let permitted = allowed
            .iter()
            .any(|a| a == "*" || a.eq_ignore_ascii_case(&host));
        if !permitted {
            warn!(host = %host, "rejected untrusted host");
            return (StatusCode::BAD_REQUEST, "invalid host header").into_response();
        }
    }
    next.run(request).await
}
