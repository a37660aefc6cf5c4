//! Control-plane HTTP/WS surface: container lifecycle with admission and
//! scheduling, node and type administration, interactive proxying, and the
//! AI tool call surface (exec/upload/read through the owning node).

use crate::client::NodeClient;
use crate::console;
use crate::db::{Container, Db, DesiredState, Node, User};
use crate::editor::{self, EditorDeps, EditorHub};
use crate::reconciler;
use crate::scheduler;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;
use skiff_common::types::{VmActionKind, VmActionRequest, VmCreate, VmUploadFiles};
use skiff_common::{Error, Store};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::warn;

#[derive(Clone)]
pub struct WebState {
    pub db: Db,
    pub store: Store,
    pub hub: Arc<EditorHub>,
}

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
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Clone)]
pub struct AuthUser(pub User);

pub fn router(state: WebState) -> Router {
    let authed = Router::new()
        .route("/users", post(create_user))
        .route("/users/me", get(user_info))
        .route("/nodes", post(create_node).get(list_nodes))
        .route("/container-types", post(create_type).get(list_types))
        .route("/quotas", post(upsert_quota))
        .route("/templates", post(create_template).get(list_templates))
        .route("/containers", get(list_containers).post(create_container))
        .route(
            "/containers/:id",
            get(get_container).delete(delete_container),
        )
        .route("/containers/:id/power_on", post(power_on))
        .route("/containers/:id/power_off", post(power_off))
        .route("/containers/:id/exec", post(exec_command))
        .route("/containers/:id/upload", post(upload_files))
        .route("/containers/:id/download-file", get(download_file))
        .route("/containers/:id/download-folder", get(download_folder))
        .route("/containers/:id/statistics", get(statistics))
        .route("/ws/containers/:id/console", get(console_ws))
        .route("/ws/containers/:id/editor", get(editor_ws))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_user));

    Router::new()
        .route("/health", get(health))
        .merge(authed)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn require_user(State(state): State<WebState>, mut request: Request, next: Next) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(token) = token else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Not authenticated"})),
        )
            .into_response();
    };

    match state.db.user_by_token(token) {
        Ok(Some(user)) => {
            request.extensions_mut().insert(AuthUser(user));
            next.run(request).await
        }
        Ok(None) => (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid token"})),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Token lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "auth backend unavailable"})),
            )
                .into_response()
        }
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"ok": "True"}))
}

fn require_admin(user: &User) -> Result<(), Error> {
    if user.is_admin {
        Ok(())
    } else {
        Err(Error::PermissionDenied("admin required".into()))
    }
}

/// Resolve a container the user may touch, plus its node and client.
fn owned_container(
    state: &WebState,
    user: &User,
    id: i64,
) -> Result<(Container, Node, NodeClient), Error> {
    let container = state
        .db
        .container_by_id(id)?
        .ok_or_else(|| Error::not_found("container", id.to_string()))?;
    if !user.is_admin && container.user_id != user.id {
        return Err(Error::not_found("container", id.to_string()));
    }
    let node = state
        .db
        .node_by_id(container.node_id)?
        .ok_or_else(|| Error::Internal("container references unknown node".into()))?;
    let client = NodeClient::new(&node);
    Ok((container, node, client))
}

// ---------------------------------------------------------------------------
// Users / nodes / types / templates
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct CreateUserReq {
    username: String,
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    is_admin: bool,
    #[serde(default = "default_credits")]
    credits: i64,
    #[serde(default = "default_ai_uses")]
    ai_use_per_day: i64,
}

fn default_credits() -> i64 {
    3
}

fn default_ai_uses() -> i64 {
    5
}

async fn create_user(
    State(state): State<WebState>,
    Extension(AuthUser(actor)): Extension<AuthUser>,
    Json(req): Json<CreateUserReq>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    require_admin(&actor)?;
    let token = req
        .token
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let user = state.db.create_user(&req.username, &token, req.is_admin)?;
    state.db.upsert_quota(user.id, req.credits, req.ai_use_per_day)?;
    state.db.allow_public_types(user.id)?;
    Ok((
        StatusCode::CREATED,
        Json(json!({"id": user.id, "username": user.username, "token": token})),
    ))
}

async fn user_info(
    State(state): State<WebState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> ApiResult<Json<serde_json::Value>> {
    let quota = state.db.quota_for_user(user.id)?;
    let credits_left = match &quota {
        Some(_) => state.db.credits_left(user.id)?,
        None => 0,
    };
    Ok(Json(json!({
        "username": user.username,
        "is_admin": user.is_admin,
        "quota": quota,
        "credits_left": credits_left,
    })))
}

#[derive(Deserialize)]
struct CreateNodeReq {
    name: String,
    base_url: String,
    #[serde(default)]
    auth_token: String,
    #[serde(default = "default_node_vcpus")]
    capacity_vcpus: i64,
    #[serde(default = "default_node_mem")]
    capacity_mem_mb: i64,
}

fn default_node_vcpus() -> i64 {
    4
}

fn default_node_mem() -> i64 {
    4096
}

async fn create_node(
    State(state): State<WebState>,
    Extension(AuthUser(actor)): Extension<AuthUser>,
    Json(req): Json<CreateNodeReq>,
) -> ApiResult<(StatusCode, Json<Node>)> {
    require_admin(&actor)?;
    let node = state.db.create_node(
        &req.name,
        &req.base_url,
        &req.auth_token,
        req.capacity_vcpus,
        req.capacity_mem_mb,
    )?;
    Ok((StatusCode::CREATED, Json(node)))
}

async fn list_nodes(
    State(state): State<WebState>,
    Extension(AuthUser(actor)): Extension<AuthUser>,
) -> ApiResult<Json<Vec<Node>>> {
    require_admin(&actor)?;
    Ok(Json(state.db.list_nodes()?))
}

#[derive(Deserialize)]
struct CreateTypeReq {
    name: String,
    vcpus: i64,
    memory_mb: i64,
    disk_gib: i64,
    #[serde(default = "default_cost")]
    credits_cost: i64,
    #[serde(default)]
    private: bool,
}

fn default_cost() -> i64 {
    1
}

async fn create_type(
    State(state): State<WebState>,
    Extension(AuthUser(actor)): Extension<AuthUser>,
    Json(req): Json<CreateTypeReq>,
) -> ApiResult<(StatusCode, Json<crate::db::ContainerType>)> {
    require_admin(&actor)?;
    let ct = state.db.create_container_type(
        &req.name,
        req.vcpus,
        req.memory_mb,
        req.disk_gib,
        req.credits_cost,
        req.private,
    )?;
    Ok((StatusCode::CREATED, Json(ct)))
}

#[derive(Deserialize)]
struct UpsertQuotaReq {
    user_id: i64,
    credits: i64,
    #[serde(default = "default_ai_uses")]
    ai_use_per_day: i64,
    /// Explicit type grants on top of the public set.
    #[serde(default)]
    allowed_types: Vec<i64>,
}

async fn upsert_quota(
    State(state): State<WebState>,
    Extension(AuthUser(actor)): Extension<AuthUser>,
    Json(req): Json<UpsertQuotaReq>,
) -> ApiResult<Json<crate::db::Quota>> {
    require_admin(&actor)?;
    let quota = state
        .db
        .upsert_quota(req.user_id, req.credits, req.ai_use_per_day)?;
    state.db.allow_public_types(req.user_id)?;
    for type_id in req.allowed_types {
        state.db.allow_type(req.user_id, type_id)?;
    }
    Ok(Json(quota))
}

async fn list_types(
    State(state): State<WebState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> ApiResult<Json<Vec<crate::db::ContainerType>>> {
    Ok(Json(state.db.list_container_types(user.is_admin)?))
}

#[derive(Deserialize)]
struct TemplateItemReq {
    path: String,
    #[serde(default)]
    content: String,
    #[serde(default = "default_mode")]
    mode: u32,
    #[serde(default)]
    order: i64,
}

fn default_mode() -> u32 {
    0o644
}

#[derive(Deserialize)]
struct CreateTemplateReq {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default = "default_public")]
    public: bool,
    items: Vec<TemplateItemReq>,
}

fn default_public() -> bool {
    true
}

async fn create_template(
    State(state): State<WebState>,
    Extension(AuthUser(actor)): Extension<AuthUser>,
    Json(req): Json<CreateTemplateReq>,
) -> ApiResult<(StatusCode, Json<crate::db::FileTemplate>)> {
    require_admin(&actor)?;
    let tpl = state
        .db
        .create_template(&req.name, &req.description, req.public)?;
    for item in &req.items {
        state
            .db
            .add_template_item(tpl.id, &item.path, &item.content, item.mode, item.order)?;
    }
    Ok((StatusCode::CREATED, Json(tpl)))
}

async fn list_templates(
    State(state): State<WebState>,
) -> ApiResult<Json<Vec<serde_json::Value>>> {
    // Only the default template matters for now; expose latest-first.
    let latest = state.db.latest_template()?;
    Ok(Json(latest.into_iter().map(|t| json!(t)).collect()))
}

// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

async fn list_containers(
    State(state): State<WebState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
) -> ApiResult<Json<Vec<Container>>> {
    let containers = if user.is_admin {
        state.db.all_containers()?
    } else {
        state.db.containers_for_user(user.id)?
    };
    // Observe real states before answering.
    let refreshed = reconciler::sync_statuses(&state.db, containers).await?;
    Ok(Json(refreshed))
}

#[derive(Deserialize)]
struct CreateContainerReq {
    container_type: i64,
    #[serde(default)]
    container_name: String,
}

async fn create_container(
    State(state): State<WebState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Json(req): Json<CreateContainerReq>,
) -> ApiResult<Response> {
    let ct = state
        .db
        .container_type_by_id(req.container_type)?
        .ok_or_else(|| Error::Validation("Invalid container type".into()))?;

    if let Err(e) = scheduler::check_admission(&state.db, &user, &ct) {
        state.db.audit(
            Some(user.id),
            "container.create",
            "container",
            "",
            &e.to_string(),
            false,
            Some(json!({"container_type": ct.id})),
        );
        return Err(e.into());
    }

    let placement = scheduler::place(&state.db, ct.vcpus, ct.memory_mb)?;
    let client = NodeClient::new(&placement.node);
    let vm = client
        .create_vm(&VmCreate {
            vcpus: ct.vcpus as u32,
            mem_mib: ct.memory_mb as u64,
            disk_gib: ct.disk_gib as u64,
        })
        .await?;

    let container = state.db.create_container(
        user.id,
        placement.node.id,
        Some(ct.id),
        &req.container_name,
        &vm.id,
        ct.memory_mb,
        ct.vcpus,
        ct.disk_gib,
        "creating",
    )?;

    state.db.audit(
        Some(user.id),
        "container.create",
        "container",
        &container.id.to_string(),
        "Container record created and VM boot scheduled",
        true,
        Some(json!({
            "container_id": container.container_id,
            "container_type": ct.id,
            "credits_cost": ct.credits_cost,
        })),
    );

    let mut body = serde_json::to_value(&container).map_err(Error::from)?;
    let mut response_builder = Response::builder().status(StatusCode::CREATED);
    if let Some(warning) = &placement.warning {
        body["warning"] = json!(warning);
        response_builder = response_builder.header("X-Warning", warning);
    }
    let response = response_builder
        .header(header::CONTENT_TYPE, "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .map_err(|e| Error::Internal(e.to_string()))?;
    Ok(response)
}

async fn get_container(
    State(state): State<WebState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<Container>> {
    let (container, _node, client) = owned_container(&state, &user, id)?;
    // Observe the real state on retrieve.
    match client.get_vm(&container.container_id).await {
        Ok(vm) => state
            .db
            .update_container_status(container.id, &vm.state.to_string())?,
        Err(e) => {
            warn!(container = id, error = %e, "Status fetch failed on retrieve");
            state.db.update_container_status(container.id, "error")?;
        }
    }
    let container = state
        .db
        .container_by_id(id)?
        .ok_or_else(|| Error::not_found("container", id.to_string()))?;
    Ok(Json(container))
}

async fn delete_container(
    State(state): State<WebState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let (container, _node, client) = owned_container(&state, &user, id)?;

    if let Err(e) = client.delete_vm(&container.container_id).await {
        warn!(container = id, error = %e, "Could not stop VM, deleting anyway");
    }

    state.db.audit(
        Some(user.id),
        "container.destroy",
        "container",
        &id.to_string(),
        "Requested container deletion (attempting soft shutdown)",
        true,
        Some(json!({"container_id": container.container_id})),
    );
    state.db.delete_container(id)?;
    Ok(Json(json!({"status": "stopped"})))
}

async fn power_on(
    State(state): State<WebState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let (container, _node, client) = owned_container(&state, &user, id)?;

    client
        .action_vm(
            &container.container_id,
            &VmActionRequest {
                action: VmActionKind::Start,
                cleanup_disks: Some(false),
            },
        )
        .await?;
    state.db.update_desired_state(id, DesiredState::Running)?;

    state.db.audit(
        Some(user.id),
        "container.power_on",
        "container",
        &id.to_string(),
        "Power on requested",
        true,
        Some(json!({"container_id": container.container_id})),
    );
    Ok(Json(
        json!({"status": "starting...", "desired_state": "running"}),
    ))
}

async fn power_off(
    State(state): State<WebState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    let (container, _node, client) = owned_container(&state, &user, id)?;

    client
        .action_vm(
            &container.container_id,
            &VmActionRequest {
                action: VmActionKind::Stop,
                cleanup_disks: Some(false),
            },
        )
        .await?;
    state.db.update_desired_state(id, DesiredState::Stopped)?;

    state.db.audit(
        Some(user.id),
        "container.power_off",
        "container",
        &id.to_string(),
        "Power off requested",
        true,
        Some(json!({"container_id": container.container_id})),
    );
    Ok(Json(
        json!({"status": "stopping...", "desired_state": "stopped"}),
    ))
}

// ---------------------------------------------------------------------------
// Tool surface: exec / upload / downloads / metrics
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct ExecReq {
    cmd: String,
    #[serde(default = "default_exec_timeout")]
    timeout: u64,
}

fn default_exec_timeout() -> u64 {
    5
}

async fn exec_command(
    State(state): State<WebState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(req): Json<ExecReq>,
) -> ApiResult<Json<skiff_common::types::VmShResponse>> {
    if req.cmd.is_empty() {
        return Err(Error::Validation("No command".into()).into());
    }
    let (container, _node, client) = owned_container(&state, &user, id)?;
    let response = client
        .execute_sh(&container.container_id, &req.cmd, req.timeout)
        .await?;

    state.db.audit(
        Some(user.id),
        "container.send_command",
        "container",
        &id.to_string(),
        &req.cmd,
        response.ok,
        None,
    );
    Ok(Json(response))
}

async fn upload_files(
    State(state): State<WebState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<i64>,
    Json(req): Json<VmUploadFiles>,
) -> ApiResult<Json<skiff_common::types::ElementResponse>> {
    let (container, _node, client) = owned_container(&state, &user, id)?;
    let response = client.upload_files(&container.container_id, &req).await?;

    state.db.audit(
        Some(user.id),
        "container.upload_file",
        "container",
        &id.to_string(),
        "Files uploaded via node agent",
        response.ok,
        Some(json!({"dest_path": req.dest_path, "count": req.files.len()})),
    );
    Ok(Json(response))
}

#[derive(Deserialize)]
struct DownloadFileQuery {
    path: String,
}

async fn download_file(
    State(state): State<WebState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<i64>,
    Query(q): Query<DownloadFileQuery>,
) -> ApiResult<Response> {
    let (container, _node, client) = owned_container(&state, &user, id)?;
    let (bytes, content_type, disposition) =
        client.download_file(&container.container_id, &q.path).await?;
    Ok(passthrough_download(bytes, &content_type, &disposition))
}

#[derive(Deserialize)]
struct DownloadFolderQuery {
    #[serde(default = "default_folder_root")]
    root: String,
    #[serde(default = "default_folder_fmt")]
    prefer_fmt: String,
}

fn default_folder_root() -> String {
    "/app".to_string()
}

fn default_folder_fmt() -> String {
    "zip".to_string()
}

async fn download_folder(
    State(state): State<WebState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<i64>,
    Query(q): Query<DownloadFolderQuery>,
) -> ApiResult<Response> {
    let (container, _node, client) = owned_container(&state, &user, id)?;
    let (bytes, content_type, disposition) = client
        .download_folder(&container.container_id, &q.root, &q.prefer_fmt)
        .await?;
    Ok(passthrough_download(bytes, &content_type, &disposition))
}

fn passthrough_download(bytes: Vec<u8>, content_type: &str, disposition: &str) -> Response {
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition.to_string()),
        ],
        bytes,
    )
        .into_response()
}

async fn statistics(
    State(state): State<WebState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Json<skiff_common::types::MachineMetrics>> {
    let (container, _node, client) = owned_container(&state, &user, id)?;
    if container.status != "running" {
        return Err(Error::Validation("VM off".into()).into());
    }
    Ok(Json(client.metrics(&container.container_id).await?))
}

// ---------------------------------------------------------------------------
// Interactive WebSockets
// ---------------------------------------------------------------------------

async fn console_ws(
    ws: WebSocketUpgrade,
    State(state): State<WebState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let (container, _node, client) = owned_container(&state, &user, id)?;
    state.db.audit(
        Some(user.id),
        "ws.connect",
        "container",
        &id.to_string(),
        "Console attached",
        true,
        None,
    );
    let vm_id = container.container_id;
    Ok(ws.on_upgrade(move |socket| console::run_console(socket, client, vm_id)))
}

async fn editor_ws(
    ws: WebSocketUpgrade,
    State(state): State<WebState>,
    Extension(AuthUser(user)): Extension<AuthUser>,
    Path(id): Path<i64>,
) -> ApiResult<Response> {
    let (container, _node, client) = owned_container(&state, &user, id)?;
    let deps = EditorDeps {
        db: state.db.clone(),
        store: state.store.clone(),
        client,
        hub: state.hub.clone(),
        container,
    };
    Ok(ws.on_upgrade(move |socket| editor::run_editor(socket, deps)))
}
