use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use axum::{
    extract::{rejection::FormRejection, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Form, Router,
};
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    config::Credentials,
    ports,
    scanner::Prober,
    types::ScanRequest,
};

/// Up/down flag reported by `/health`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Up,
    Down,
}

/// State shared by every handler.
///
/// Lock discipline: each lock guards one field and no handler holds two locks
/// at once. `health` is only written by `POST /health`; `request_count` is
/// read and incremented under a single guard; `scan_lock` is held for the
/// whole duration of a scan so scans never overlap.
#[derive(Debug)]
pub struct ServiceState {
    health: RwLock<Health>,
    request_count: Mutex<u64>,
    scan_lock: Mutex<()>,
    credentials: Credentials,
    prober: Prober,
    default_timeout: Duration,
}

#[derive(Clone, Debug)]
pub struct AppState {
    inner: Arc<ServiceState>,
}

impl AppState {
    pub fn new(credentials: Credentials, prober: Prober, default_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ServiceState {
                health: RwLock::new(Health::Up),
                request_count: Mutex::new(0),
                scan_lock: Mutex::new(()),
                credentials,
                prober,
                default_timeout,
            }),
        }
    }

    pub async fn health(&self) -> Health {
        *self.inner.health.read().await
    }
}

#[derive(Debug, Deserialize)]
pub struct ScanParams {
    pub ip: Option<String>,
    pub ports: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct HealthForm {
    pub state: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FilesParams {
    pub root: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/scan", get(get_scan))
        .route("/count", get(get_count))
        .route("/health", get(get_health).post(post_health))
        .route("/files", get(get_files))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `bind` and serve until `shutdown` is cancelled.
pub async fn spawn_server(bind: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    info!(addr = %listener.local_addr()?, "starting server");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("http server failed")?;
    Ok(())
}

async fn get_scan(State(app): State<AppState>, Query(q): Query<ScanParams>) -> Response {
    let ip = q.ip.as_deref().map(str::trim).unwrap_or("");
    if ip.is_empty() {
        return (StatusCode::BAD_REQUEST, "no valid ip provided\n").into_response();
    }

    let range = match ports::parse_port_range(q.ports.as_deref().unwrap_or("")) {
        Ok(r) => r,
        Err(e) => return (StatusCode::BAD_REQUEST, format!("{e}\n")).into_response(),
    };
    let timeout = q
        .timeout_ms
        .map(Duration::from_millis)
        .unwrap_or(app.inner.default_timeout);
    let request = ScanRequest::new(ip, range, timeout);
    if let Err(e) = request.validate() {
        return (StatusCode::BAD_REQUEST, format!("{e}\n")).into_response();
    }

    let _serial = app.inner.scan_lock.lock().await;

    // Dropped with this future when the client goes away, which stops the scan.
    let cancel = CancellationToken::new();
    let _abort_on_disconnect = cancel.clone().drop_guard();

    info!(host = %request.host, "starting network scan");
    match app.inner.prober.scan_with_cancel(&request, cancel).await {
        Ok(report) => (StatusCode::OK, report.render_open_lines()).into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, format!("{e}\n")).into_response(),
    }
}

async fn get_count(State(app): State<AppState>) -> String {
    let mut count = app.inner.request_count.lock().await;
    *count += 1;
    format!("count is {}\n", *count)
}

async fn get_health(State(app): State<AppState>) -> Response {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    match app.health().await {
        Health::Up => (StatusCode::OK, format!("Service is up\ntime is {now}\n")).into_response(),
        Health::Down => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Service is down\ntime is {now}\n"),
        )
            .into_response(),
    }
}

async fn post_health(
    State(app): State<AppState>,
    form: Result<Form<HealthForm>, FormRejection>,
) -> Response {
    let Ok(Form(form)) = form else {
        return (StatusCode::BAD_REQUEST, "Invalid post form\n").into_response();
    };

    let (next, reply) = match form.state.as_deref() {
        Some("up") => (Health::Up, "Uping service\n"),
        Some("down") => (Health::Down, "Downing service\n"),
        _ => {
            return (
                StatusCode::BAD_REQUEST,
                "Invalid post form: state not found\n",
            )
                .into_response()
        }
    };

    *app.inner.health.write().await = next;
    info!(health = ?next, "health flag changed");
    (StatusCode::OK, reply).into_response()
}

async fn get_files(
    State(app): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<FilesParams>,
) -> Response {
    if !authorized(&headers, &app.inner.credentials) {
        return (StatusCode::UNAUTHORIZED, "Invalid Username or Password").into_response();
    }

    let root = match q.root {
        Some(r) if !r.is_empty() => PathBuf::from(r),
        _ => return (StatusCode::BAD_REQUEST, "Invalid url no root provided").into_response(),
    };

    let walked = tokio::task::spawn_blocking(move || walk(&root)).await;
    match walked {
        Ok(Ok(files)) => {
            let mut body = String::new();
            for f in files {
                body.push_str(&f.display().to_string());
                body.push('\n');
            }
            (StatusCode::OK, body).into_response()
        }
        Ok(Err(e)) => {
            warn!(error = %e, "directory walk failed");
            (StatusCode::BAD_REQUEST, "Error walking").into_response()
        }
        Err(e) => {
            warn!(error = %e, "directory walk task failed");
            (StatusCode::BAD_REQUEST, "Error walking").into_response()
        }
    }
}

/// Check an `Authorization: Basic ...` header against the configured credentials.
fn authorized(headers: &HeaderMap, creds: &Credentials) -> bool {
    let Some(value) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
    else {
        return false;
    };
    let Some((scheme, encoded)) = value.split_once(' ') else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("basic") {
        return false;
    }
    let Ok(decoded) = general_purpose::STANDARD.decode(encoded.trim()) else {
        return false;
    };
    let Ok(pair) = String::from_utf8(decoded) else {
        return false;
    };
    match pair.split_once(':') {
        Some((user, pass)) => user == creds.username && pass == creds.password,
        None => false,
    }
}

/// Depth-first listing of `root` and everything below it, in lexical order.
/// The root itself must be readable; unreadable subdirectories are skipped.
fn walk(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    fs::symlink_metadata(root)?;
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(path) = stack.pop() {
        let is_dir = fs::symlink_metadata(&path)
            .map(|m| m.is_dir())
            .unwrap_or(false);
        out.push(path.clone());
        if !is_dir {
            continue;
        }
        let mut children: Vec<PathBuf> = match fs::read_dir(&path) {
            Ok(rd) => rd.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(e) if path == root => return Err(e),
            Err(_) => continue,
        };
        children.sort();
        stack.extend(children.into_iter().rev());
    }
    Ok(out)
}
