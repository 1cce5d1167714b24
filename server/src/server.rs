//! HTTP front end of the recording store.
//!
//! Routes:
//!   POST /                     → action endpoint (multipart `action` form)
//!   GET  /recordings/{name}    → stream a stored recording (prefix from PUBLIC_PATH)
//!   GET  /api/health           → health check
//!
//! Every mutating action passes the CSRF check, then the rate limiter, and
//! only then reaches the store.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::body::Body;
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use chrono::Local;
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use screenreel_common::config::{ActionLimits, Config};
use screenreel_common::format::format_bytes;
use screenreel_common::protocol::{
    CleanResponse, HealthResponse, ListResponse, MessageResponse, RecordingInfo, TokenResponse,
    UploadResponse,
};

use crate::error::StoreError;
use crate::guard::NameGuard;
use crate::rate_limit::RateLimiter;
use crate::request::{ActionForm, StoreRequest, UploadForm};
use crate::security::{session_cookie, ClientIdentity, SecurityGate, SessionGrant};
use crate::store::{Listing, QuotaStore, StoreLimits};

/// Room for the non-file form fields on top of the largest accepted file.
const BODY_SLACK: u64 = 1024 * 1024;

/// Shared state for route handlers.
#[derive(Clone)]
pub struct AppState {
    store: Arc<QuotaStore>,
    limiter: RateLimiter,
    gate: Arc<SecurityGate>,
    limits: ActionLimits,
    /// Public URL prefix of stored files, without trailing slash.
    public_prefix: String,
    start_time: Instant,
}

impl AppState {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let store = QuotaStore::open(
            &config.recordings_dir,
            StoreLimits {
                max_file_size: config.max_file_size,
                quota: config.quota_bytes,
            },
        )
        .with_context(|| {
            format!(
                "Cannot open recordings directory {}",
                config.recordings_dir.display()
            )
        })?;
        let limiter = RateLimiter::from_config(config).context("Cannot open rate-limit store")?;

        Ok(Self {
            store: Arc::new(store),
            limiter,
            gate: Arc::new(SecurityGate::new(config.session_ttl)),
            limits: config.limits,
            public_prefix: config.public_path.trim_end_matches('/').to_string(),
            start_time: Instant::now(),
        })
    }
}

/// Assemble the router with its middleware stack.
pub fn build_router(state: AppState) -> Router {
    let body_limit = state
        .store
        .limits()
        .max_file_size
        .saturating_add(BODY_SLACK);
    let body_limit = usize::try_from(body_limit).unwrap_or(usize::MAX);
    let files_route = format!("{}/{{name}}", state.public_prefix);

    Router::new()
        .route("/", post(action))
        .route(&files_route, get(serve_recording))
        .route("/api/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(security_header(header::X_FRAME_OPTIONS, "DENY"))
        .layer(security_header(header::X_CONTENT_TYPE_OPTIONS, "nosniff"))
        .layer(security_header(
            header::REFERRER_POLICY,
            "strict-origin-when-cross-origin",
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn security_header(name: HeaderName, value: &'static str) -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::overriding(name, HeaderValue::from_static(value))
}

/// Start the HTTP server. Blocks until shutdown.
pub async fn run(config: Config, shutdown: Arc<AtomicBool>) -> anyhow::Result<()> {
    let state = AppState::from_config(&config)?;
    let app = build_router(state);

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Cannot bind {}", config.listen_addr))?;
    info!("Recording server listening on {}", config.listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
            if shutdown.load(Ordering::Relaxed) {
                break;
            }
        }
    })
    .await?;

    Ok(())
}

// ── route handlers ───────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
    })
}

async fn action(
    State(state): State<AppState>,
    ClientIdentity(identity): ClientIdentity,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let grant = state.gate.session(session_cookie(&headers).as_deref());

    let mut response = match handle_action(&state, &identity, &grant, multipart).await {
        Ok(response) => response,
        Err(e) => e.into_response(),
    };

    if grant.is_new {
        if let Ok(cookie) = HeaderValue::from_str(&grant.cookie()) {
            response.headers_mut().insert(header::SET_COOKIE, cookie);
        }
    }
    response
}

async fn handle_action(
    state: &AppState,
    identity: &str,
    grant: &SessionGrant,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Response, StoreError> {
    let multipart = multipart.map_err(|e| StoreError::BadRequest(e.body_text()))?;
    let max_file_size = state.store.limits().max_file_size;
    let form = ActionForm::from_multipart(multipart, max_file_size, |token| {
        state.gate.verify(grant, token)
    })
    .await?;
    let request = form.request;

    if request.is_mutating() {
        state.gate.verify(grant, form.csrf_token.as_deref())?;
    }
    if let Some(limited) = request.limited_action() {
        let limiter = state.limiter.clone();
        let limits = state.limits;
        let who = identity.to_string();
        blocking(move || limiter.admit_action(&who, limited, &limits)).await?;
    }

    let store = state.store.clone();
    let response = match request {
        StoreRequest::Upload(UploadForm {
            bytes,
            file_name,
            content_type,
            duration,
        }) => {
            let stored = blocking(move || {
                store.put(&bytes, file_name.as_deref(), content_type.as_deref())
            })
            .await?;
            info!(
                target: "audit",
                action = "upload",
                identity,
                file = %stored.filename,
                size = stored.size,
                "Recording stored"
            );
            Json(UploadResponse {
                success: true,
                filename: stored.filename,
                size: stored.size,
                duration,
            })
            .into_response()
        }
        StoreRequest::List => {
            let listing = blocking(move || store.list()).await?;
            Json(list_response(listing, &state.public_prefix)).into_response()
        }
        StoreRequest::Rename { old_name, new_name } => {
            let old = old_name.clone();
            let renamed = blocking(move || store.rename(&old, &new_name)).await?;
            info!(
                target: "audit",
                action = "rename",
                identity,
                from = %old_name,
                to = %renamed.filename,
                "Recording renamed"
            );
            Json(MessageResponse {
                success: true,
                message: format!("Renamed to {}", renamed.filename),
            })
            .into_response()
        }
        StoreRequest::Delete { filename } => {
            let deleted = blocking(move || store.delete(&filename)).await?;
            info!(
                target: "audit",
                action = "delete",
                identity,
                file = %deleted.filename,
                size = deleted.size,
                "Recording deleted"
            );
            Json(MessageResponse {
                success: true,
                message: format!("Deleted {}", deleted.filename),
            })
            .into_response()
        }
        StoreRequest::CleanOld { days } => {
            let report = blocking(move || store.clean_older_than(days)).await?;
            info!(
                target: "audit",
                action = "clean_old",
                identity,
                days,
                deleted_files = report.deleted_files,
                deleted_bytes = report.deleted_bytes,
                "Old recordings cleaned"
            );
            Json(CleanResponse {
                success: true,
                deleted_files: report.deleted_files,
                deleted_size: format_bytes(report.deleted_bytes),
                message: format!(
                    "Deleted {} recording(s) older than {days} day(s)",
                    report.deleted_files
                ),
            })
            .into_response()
        }
        StoreRequest::GetToken => Json(TokenResponse {
            token: grant.csrf_token.clone(),
        })
        .into_response(),
    };
    Ok(response)
}

async fn serve_recording(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Response, StoreError> {
    let store = state.store.clone();
    let path = blocking(move || store.readable(&name)).await?;

    let content_type = match NameGuard::extension_of(&path.to_string_lossy()).as_deref() {
        Some("webm") => "video/webm",
        Some("mkv") => "video/x-matroska",
        _ => "video/mp4",
    };

    let file = tokio::fs::File::open(&path).await?;
    let len = file.metadata().await?.len();

    Ok((
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

// ── helpers ──────────────────────────────────────────────────────────────

/// Run filesystem work on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))?
}

fn list_response(listing: Listing, prefix: &str) -> ListResponse {
    let totals = listing.totals;
    let recordings = listing
        .entries
        .into_iter()
        .map(|r| RecordingInfo {
            url: format!("{prefix}/{}", r.filename),
            size_formatted: format_bytes(r.size),
            created: r.created.timestamp(),
            created_formatted: r
                .created
                .with_timezone(&Local)
                .format("%d/%m/%Y %H:%M:%S")
                .to_string(),
            filename: r.filename,
            size: r.size,
            extension: r.extension,
        })
        .collect();

    ListResponse {
        recordings,
        total_files: totals.count,
        total_size: totals.used,
        total_size_formatted: format_bytes(totals.used),
        space_limit: totals.limit,
        space_limit_formatted: format_bytes(totals.limit),
        space_available: totals.available,
        space_available_formatted: format_bytes(totals.available),
        percentage_used: totals.percent_used,
    }
}
