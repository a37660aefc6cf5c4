//! Node agent HTTP/WS surface.
//!
//! Everything except `/health` requires `Authorization: Bearer <AUTH_TOKEN>`.
//! Errors are returned as JSON envelopes; stack traces never leave the
//! process.

use crate::config::AgentConfig;
use crate::fsops;
use crate::qemu::boot::read_console_tail;
use crate::runner::Runner;
use crate::ssh::{self, SshCache};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use skiff_common::types::{
    FileContent, ListDirItem, MachineMetrics, SearchHit, SearchRequest, VmActionKind,
    VmActionRequest, VmCreate, VmOut, VmPath, VmPaths, VmRecord, VmSh, VmShResponse, VmState,
    VmUploadFiles,
};
use skiff_common::{now_ts, Error, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AgentConfig>,
    pub store: Store,
    pub runner: Arc<Runner>,
    pub ssh: Arc<SshCache>,
}

/// Wrapper turning `skiff_common::Error` into a JSON error response.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut body = json!({ "error": self.0.to_string() });
        if let Error::Conflict { current } = &self.0 {
            body["rev"] = json!(current);
        }
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

pub fn router(state: AppState) -> Router {
    let authed = Router::new()
        .route("/vms", post(create_vm).get(list_vms))
        .route("/vms/list/:vm_ids", get(get_vms_csv))
        .route("/vms/:id", get(get_vm).delete(delete_vm))
        .route("/vms/:id/actions", post(action_vm))
        .route("/vms/:id/upload-files", post(upload_files))
        .route("/vms/:id/list-dirs", post(list_dirs))
        .route("/vms/:id/read-file", post(read_file))
        .route("/vms/:id/create-dir", post(create_dir))
        .route("/vms/:id/execute-sh", post(execute_sh))
        .route("/vms/:id/search", post(search_vm))
        .route("/vms/:id/download-file", get(download_file))
        .route("/vms/:id/download-folder", get(download_folder))
        .route("/vms/:id/console/tail", get(console_tail))
        .route("/vms/:id/tty", get(tty_ws))
        .route("/metrics/:id", get(vm_metrics))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_bearer));

    Router::new()
        .route("/health", get(health))
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match presented {
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Not authenticated"})),
        )
            .into_response(),
        Some(token) if token != state.config.auth_token => (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid token"})),
        )
            .into_response(),
        Some(_) => next.run(request).await,
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"ok": "True"}))
}

// ---------------------------------------------------------------------------
// VM lifecycle
// ---------------------------------------------------------------------------

async fn create_vm(
    State(state): State<AppState>,
    Json(req): Json<VmCreate>,
) -> ApiResult<(StatusCode, Json<VmOut>)> {
    if req.vcpus < 1 {
        return Err(Error::Validation("vcpus must be >= 1".into()).into());
    }
    if req.mem_mib < 256 {
        return Err(Error::Validation("mem_mib must be >= 256".into()).into());
    }
    if req.disk_gib < 5 {
        return Err(Error::Validation("disk_gib must be >= 5".into()).into());
    }

    let vm_id = uuid::Uuid::new_v4().to_string();
    let workdir = state.runner.workdir(&vm_id).await?;
    let vm = VmRecord::new(
        vm_id,
        workdir.display().to_string(),
        req.vcpus,
        req.mem_mib,
        req.disk_gib,
    );
    let vm = state.store.put(vm).await?;
    let vm = state.runner.start(vm).await?;
    info!(vm_id = %vm.id, "VM created");
    Ok((
        StatusCode::CREATED,
        Json(VmOut::from_record(&vm, state.runner.node_name())),
    ))
}

async fn list_vms(State(state): State<AppState>) -> ApiResult<Json<Vec<VmOut>>> {
    let vms = state.store.all().await?;
    let node = state.runner.node_name();
    Ok(Json(vms.iter().map(|vm| VmOut::from_record(vm, node)).collect()))
}

async fn get_vms_csv(
    State(state): State<AppState>,
    Path(vm_ids): Path<String>,
) -> ApiResult<Json<Vec<VmOut>>> {
    let node = state.runner.node_name().to_string();
    let mut out = Vec::new();
    for vm_id in vm_ids.split(',').filter(|s| !s.is_empty()) {
        match state.store.get(vm_id).await {
            Ok(vm) => out.push(VmOut::from_record(&vm, &node)),
            Err(Error::NotFound { .. }) => {
                debug!(vm_id, "Skipping unknown id in bulk fetch");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(Json(out))
}

async fn get_vm(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
) -> ApiResult<Json<VmOut>> {
    let vm = state.store.get(&vm_id).await?;
    Ok(Json(VmOut::from_record(&vm, state.runner.node_name())))
}

async fn delete_vm(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
) -> ApiResult<Json<VmOut>> {
    let vm = state.store.get(&vm_id).await?;
    let vm = state.runner.stop(vm, true).await?;
    Ok(Json(VmOut::from_record(&vm, state.runner.node_name())))
}

async fn action_vm(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
    Json(act): Json<VmActionRequest>,
) -> ApiResult<Json<VmOut>> {
    let vm = state.store.get(&vm_id).await?;
    let node = state.runner.node_name().to_string();
    let cleanup = act.cleanup_disks.unwrap_or(false);

    let vm = match act.action {
        VmActionKind::Stop => state.runner.stop(vm, cleanup).await?,
        VmActionKind::Start => {
            if vm.state == VmState::Running {
                // Start on a running VM is a no-op returning success.
                return Ok(Json(VmOut::from_record(&vm, &node)));
            }
            let vm = state
                .store
                .set_status(vm, VmState::Provisioning, None)
                .await?;
            state.runner.start(vm).await?
        }
        VmActionKind::Reboot => {
            let stopped = state.runner.stop(vm, false).await?;
            let vm = state
                .store
                .set_status(stopped, VmState::Provisioning, None)
                .await?;
            let runner = state.runner.clone();
            let restart = vm.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if let Err(e) = runner.start(restart).await {
                    error!(error = %e, "Reboot restart failed");
                }
            });
            vm
        }
    };

    Ok(Json(VmOut::from_record(&vm, &node)))
}

// ---------------------------------------------------------------------------
// Guest file operations
// ---------------------------------------------------------------------------

async fn running_vm(state: &AppState, vm_id: &str) -> Result<VmRecord, Error> {
    let vm = state.store.get(vm_id).await?;
    if vm.state != VmState::Running || vm.ssh_port.is_none() || vm.ssh_user.is_none() {
        return Err(Error::Validation("VM is not running".into()));
    }
    Ok(vm)
}

async fn upload_files(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
    Json(req): Json<VmUploadFiles>,
) -> ApiResult<Json<skiff_common::types::ElementResponse>> {
    let vm = running_vm(&state, &vm_id).await?;
    let entry = state.ssh.resolve(&vm).await?;
    Ok(Json(fsops::upload_files(&entry, &req).await?))
}

async fn list_dirs(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
    Json(req): Json<VmPaths>,
) -> ApiResult<Json<Vec<ListDirItem>>> {
    let vm = running_vm(&state, &vm_id).await?;
    let entry = state.ssh.resolve(&vm).await?;
    Ok(Json(fsops::list_dirs(&entry, &req.paths, req.depth).await?))
}

async fn read_file(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
    Json(req): Json<VmPath>,
) -> ApiResult<Json<FileContent>> {
    let vm = running_vm(&state, &vm_id).await?;
    let entry = state.ssh.resolve(&vm).await?;
    Ok(Json(fsops::read_file(&entry, &req.path).await))
}

async fn create_dir(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
    Json(req): Json<VmPath>,
) -> ApiResult<Json<skiff_common::types::ElementResponse>> {
    let vm = running_vm(&state, &vm_id).await?;
    let entry = state.ssh.resolve(&vm).await?;
    Ok(Json(fsops::create_dir(&entry, &req.path).await?))
}

async fn execute_sh(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
    Json(req): Json<VmSh>,
) -> Json<VmShResponse> {
    let vm = match running_vm(&state, &vm_id).await {
        Ok(vm) => vm,
        Err(e) => {
            return Json(VmShResponse {
                ok: false,
                reason: e.to_string(),
                stdout: String::new(),
                stderr: String::new(),
                exit_status: None,
            })
        }
    };

    let entry = match state.ssh.resolve(&vm).await {
        Ok(entry) => entry,
        Err(e) => {
            return Json(VmShResponse {
                ok: false,
                reason: format!("SSH error: {e}"),
                stdout: String::new(),
                stderr: String::new(),
                exit_status: None,
            })
        }
    };

    match ssh::exec_capture(
        &entry.handle,
        &req.command,
        Some(Duration::from_secs(req.timeout)),
    )
    .await
    {
        Ok(out) => {
            // Binary stdout is delivered base64-encoded.
            let stdout = match String::from_utf8(out.stdout.clone()) {
                Ok(s) => s,
                Err(_) => {
                    use base64::Engine;
                    base64::engine::general_purpose::STANDARD.encode(&out.stdout)
                }
            };
            Json(VmShResponse {
                ok: true,
                reason: String::new(),
                stdout,
                stderr: out.stderr_lossy(),
                exit_status: out.exit_status,
            })
        }
        Err(e) => Json(VmShResponse {
            ok: false,
            reason: e.to_string(),
            stdout: String::new(),
            stderr: String::new(),
            exit_status: None,
        }),
    }
}

async fn search_vm(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
    Json(req): Json<SearchRequest>,
) -> ApiResult<Json<Vec<SearchHit>>> {
    let vm = running_vm(&state, &vm_id).await?;
    let entry = state.ssh.resolve(&vm).await?;
    Ok(Json(fsops::search(&entry, &req).await?))
}

#[derive(Deserialize)]
struct DownloadFileQuery {
    path: String,
}

async fn download_file(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
    Query(q): Query<DownloadFileQuery>,
) -> ApiResult<Response> {
    let vm = running_vm(&state, &vm_id).await?;
    let entry = state.ssh.resolve(&vm).await?;
    let (data, media_type, filename) = fsops::download_file(&entry, &q.path).await?;
    Ok(attachment_response(data, &media_type, &filename))
}

#[derive(Deserialize)]
struct DownloadFolderQuery {
    #[serde(default = "default_root")]
    root: String,
    #[serde(default = "default_fmt")]
    prefer_fmt: String,
}

fn default_root() -> String {
    "/app".to_string()
}

fn default_fmt() -> String {
    "zip".to_string()
}

async fn download_folder(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
    Query(q): Query<DownloadFolderQuery>,
) -> ApiResult<Response> {
    if q.prefer_fmt != "zip" && q.prefer_fmt != "tar.gz" {
        return Err(Error::Validation("prefer_fmt must be zip or tar.gz".into()).into());
    }
    let vm = running_vm(&state, &vm_id).await?;
    let entry = state.ssh.resolve(&vm).await?;
    let (data, media_type, filename) = fsops::download_folder(&entry, &q.root, &q.prefer_fmt).await?;
    Ok(attachment_response(data, &media_type, &filename))
}

fn attachment_response(data: Vec<u8>, media_type: &str, filename: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, media_type.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        data,
    )
        .into_response()
}

#[derive(Deserialize)]
struct TailQuery {
    #[serde(default = "default_tail_lines")]
    lines: usize,
}

fn default_tail_lines() -> usize {
    120
}

async fn console_tail(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
    Query(q): Query<TailQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let vm = state.store.get(&vm_id).await?;
    let console_log = std::path::Path::new(&vm.workdir).join("console.log");
    let console = read_console_tail(&console_log, q.lines).await;
    Ok(Json(json!({
        "vm_id": vm_id,
        "lines": q.lines,
        "console": console,
    })))
}

// ---------------------------------------------------------------------------
// Metrics
// ---------------------------------------------------------------------------

async fn vm_metrics(
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
) -> ApiResult<Json<MachineMetrics>> {
    let pidfile = state.config.vms_root().join(&vm_id).join("qemu.pid");
    let pid: u32 = tokio::fs::read_to_string(&pidfile)
        .await
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(|| Error::not_found("pidfile", &vm_id))?;

    use sysinfo::{Pid, ProcessesToUpdate, System};
    let spid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[spid]), true);
    tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    sys.refresh_processes(ProcessesToUpdate::Some(&[spid]), true);

    let proc = sys
        .process(spid)
        .ok_or_else(|| Error::Upstream("QEMU process not inspectable".into()))?;

    let rss = proc.memory();
    Ok(Json(MachineMetrics {
        ts: now_ts(),
        cpu_percent: proc.cpu_usage(),
        rss_bytes: rss,
        rss_mib: rss as f64 / (1024.0 * 1024.0),
    }))
}

// ---------------------------------------------------------------------------
// Interactive console (WS)
// ---------------------------------------------------------------------------

async fn tty_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(vm_id): Path<String>,
) -> Response {
    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_tty(socket, state, vm_id).await {
            warn!(error = %e, "TTY session ended with error");
        }
    })
}

/// Bridge the WebSocket to a fresh interactive shell channel. Text frames
/// get a trailing newline appended when missing, so plain text means "run a
/// command"; binary frames pass through untouched.
async fn handle_tty(socket: WebSocket, state: AppState, vm_id: String) -> Result<(), Error> {
    let vm = running_vm(&state, &vm_id).await?;
    let entry = state.ssh.resolve(&vm).await?;
    let channel = ssh::open_shell(&entry.handle).await?;
    let stream = channel.into_stream();

    let (mut shell_read, mut shell_write) = tokio::io::split(stream);
    let (mut ws_write, mut ws_read) = socket.split();

    let ws_to_shell = async {
        while let Some(msg) = ws_read.next().await {
            match msg {
                Ok(Message::Text(mut text)) => {
                    if !text.ends_with('\n') {
                        text.push('\n');
                    }
                    if shell_write.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Binary(data)) => {
                    if shell_write.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    };

    let shell_to_ws = async {
        let mut buf = vec![0u8; 4096];
        loop {
            match shell_read.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if ws_write
                        .send(Message::Binary(buf[..n].to_vec()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
        let _ = ws_write.close().await;
    };

    tokio::select! {
        _ = ws_to_shell => debug!(vm_id, "TTY client side closed"),
        _ = shell_to_ws => debug!(vm_id, "TTY shell side closed"),
    }
    Ok(())
}
