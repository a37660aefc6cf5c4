//! Editor protocol: request/response file operations over one WebSocket per
//! container, with per-path monotonic revisions for optimistic concurrency
//! and change broadcasts to every socket attached to the same container.

use crate::client::NodeClient;
use crate::db::{Container, Db};
use crate::templates;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use skiff_common::types::{SearchRequest, VmFile, VmPaths, VmUploadFiles};
use skiff_common::{Error, Result, Store};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const SAFE_ROOT: &str = "/app";
const SEARCH_MAX_RESULTS: usize = 250;
const SEARCH_TIMEOUT_S: u64 = 10;

/// Per-container fan-out channels and write locks, owned by the server and
/// shared by every editor socket.
pub struct EditorHub {
    groups: Mutex<HashMap<i64, broadcast::Sender<String>>>,
    write_locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl EditorHub {
    pub fn new() -> Self {
        Self {
            groups: Mutex::new(HashMap::new()),
            write_locks: Mutex::new(HashMap::new()),
        }
    }

    fn group(&self, container_pk: i64) -> broadcast::Sender<String> {
        self.groups
            .lock()
            .entry(container_pk)
            .or_insert_with(|| broadcast::channel(64).0)
            .clone()
    }

    /// Serializes check -> upload -> bump per container so concurrent writes
    /// with the same `prev_rev` linearize: exactly one wins.
    fn write_lock(&self, container_pk: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.write_locks
            .lock()
            .entry(container_pk)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl Default for EditorHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Collapse repeated slashes and strip the trailing slash.
pub fn path_norm(p: &str) -> String {
    let mut out = String::with_capacity(p.len());
    let mut last_slash = false;
    for c in p.chars() {
        if c == '/' {
            if !last_slash {
                out.push('/');
            }
            last_slash = true;
        } else {
            out.push(c);
            last_slash = false;
        }
    }
    let trimmed = out.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Resolve `.`/`..` segments without letting the path climb above root.
fn resolve_dots(p: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for seg in p.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Normalize and require the path to stay under `/app`.
pub fn check_path(p: &str) -> Result<String> {
    let normalized = resolve_dots(&path_norm(p));
    if normalized == SAFE_ROOT || normalized.starts_with(&format!("{SAFE_ROOT}/")) {
        Ok(normalized)
    } else {
        Err(Error::Validation(format!("path must be under {SAFE_ROOT}")))
    }
}

pub struct EditorDeps {
    pub db: Db,
    pub store: Store,
    pub client: NodeClient,
    pub hub: Arc<EditorHub>,
    pub container: Container,
}

/// Drive one editor socket to completion.
pub async fn run_editor(socket: WebSocket, deps: EditorDeps) {
    let group = deps.hub.group(deps.container.id);
    let mut broadcast_rx = group.subscribe();

    // Seed /app on the first attach of a fresh container.
    templates::ensure_first_start(&deps.db, &deps.client, &deps.container).await;

    let (mut ws_write, mut ws_read) = socket.split();
    if ws_write
        .send(WsMessage::Text(json!({"event": "connected"}).to_string()))
        .await
        .is_err()
    {
        return;
    }

    let session = EditorSession {
        store: deps.store,
        client: deps.client,
        cid: deps.container.container_id.clone(),
        write_lock: deps.hub.write_lock(deps.container.id),
        group,
    };

    loop {
        tokio::select! {
            msg = ws_read.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let reply = session.handle(&text).await;
                        if ws_write.send(WsMessage::Text(reply.to_string())).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(error = %e, "Editor socket error");
                        break;
                    }
                }
            }
            event = broadcast_rx.recv() => {
                match event {
                    Ok(payload) => {
                        if ws_write.send(WsMessage::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Editor broadcast receiver lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

struct EditorSession {
    store: Store,
    client: NodeClient,
    cid: String,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    group: broadcast::Sender<String>,
}

impl EditorSession {
    /// Dispatch one request; every outcome is a JSON reply.
    async fn handle(&self, text: &str) -> Value {
        let content: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(e) => {
                return json!({"event": "error", "req_id": -1, "error": format!("invalid json: {e}")})
            }
        };
        let req_id = content.get("req_id").and_then(Value::as_i64).unwrap_or(-1);
        let action = content
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string();

        let result = match action.as_str() {
            "list_dirs" => self.list_dirs(&content, req_id).await,
            "read_file" => self.read_file(&content, req_id).await,
            "write_file" => self.write_file(&content, req_id).await,
            "create_dir" => self.create_dir(&content, req_id).await,
            "move_path" => self.move_path(&content, req_id).await,
            "delete_path" => self.delete_path(&content, req_id).await,
            "search" => self.search(&content, req_id).await,
            _ => Err(Error::Validation(format!("unknown action: {action}"))),
        };

        match result {
            Ok(reply) => reply,
            Err(Error::Conflict { current }) => {
                json!({"event": "error", "req_id": req_id, "error": "conflict", "rev": current})
            }
            Err(e) => json!({"event": "error", "req_id": req_id, "error": e.to_string()}),
        }
    }

    fn broadcast(&self, payload: Value) {
        // Our own subscriber always exists, so send cannot fail while the
        // session lives; broadcasts are idempotent by rev on the client.
        let _ = self.group.send(payload.to_string());
    }

    fn str_field(content: &Value, key: &str) -> Result<String> {
        content
            .get(key)
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Validation(format!("missing field: {key}")))
    }

    async fn list_dirs(&self, content: &Value, req_id: i64) -> Result<Value> {
        let raw = content
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or(SAFE_ROOT);
        let mut paths = Vec::new();
        for part in raw.split(',') {
            let part = if part.is_empty() { SAFE_ROOT } else { part };
            paths.push(check_path(part)?);
        }

        let entries = self
            .client
            .list_dirs(&self.cid, &VmPaths { paths: paths.clone(), depth: 1 })
            .await?;
        Ok(json!({
            "event": "ok",
            "req_id": req_id,
            "data": {"entries": entries, "path": paths},
        }))
    }

    async fn read_file(&self, content: &Value, req_id: i64) -> Result<Value> {
        let path = check_path(&Self::str_field(content, "path")?)?;
        let file = self.client.read_file(&self.cid, &path).await?;
        let rev = self.store.get_rev(&self.cid, &path).await?;

        let mut data = serde_json::to_value(&file)?;
        data["rev"] = json!(rev);
        Ok(json!({"event": "ok", "req_id": req_id, "data": data}))
    }

    async fn write_file(&self, content: &Value, req_id: i64) -> Result<Value> {
        let path = check_path(&Self::str_field(content, "path")?)?;
        let body = content
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        // An absent prev_rev means an unconditional write; a present one
        // (zero included) must match the current revision exactly.
        let prev = content.get("prev_rev").and_then(Value::as_u64);

        // Held across check -> upload -> bump so one of two same-prev_rev
        // writers loses with a conflict.
        let _guard = self.write_lock.lock().await;

        let current = self.store.get_rev(&self.cid, &path).await?;
        if let Some(prev) = prev {
            if prev != current {
                return Err(Error::Conflict { current });
            }
        }

        let upload = VmUploadFiles {
            dest_path: "/".to_string(),
            clean: false,
            files: vec![VmFile {
                path: path.clone(),
                text: Some(body.clone()),
                content_b64: None,
                mode: 0o644,
            }],
        };
        let resp = self.client.upload_files(&self.cid, &upload).await?;
        if !resp.ok {
            return Err(Error::Upstream(format!("write failed: {}", resp.reason)));
        }

        let rev = self.store.bump_rev(&self.cid, &path).await?;
        self.broadcast(json!({
            "event": "file_changed",
            "path": path,
            "rev": rev,
            "meta": {"op": "write_file", "bytes": body.len()},
        }));
        Ok(json!({"event": "ok", "req_id": req_id, "rev": rev}))
    }

    async fn create_dir(&self, content: &Value, req_id: i64) -> Result<Value> {
        let path = check_path(&Self::str_field(content, "path")?)?;
        let resp = self.client.create_dir(&self.cid, &path).await?;
        if !resp.ok {
            return Err(Error::Upstream(format!("create_dir failed: {}", resp.reason)));
        }

        let rev = self.store.bump_rev(&self.cid, &path).await?;
        self.broadcast(json!({
            "event": "file_changed",
            "path": path,
            "rev": rev,
            "meta": {"op": "create_dir"},
        }));
        Ok(json!({"event": "ok", "req_id": req_id}))
    }

    async fn move_path(&self, content: &Value, req_id: i64) -> Result<Value> {
        let src = check_path(&Self::str_field(content, "src")?)?;
        let dst = check_path(&Self::str_field(content, "dst")?)?;
        let cmd = format!("set -e; mv -f {} {}", sh_quote(&src), sh_quote(&dst));

        let resp = self.client.execute_sh(&self.cid, &cmd, 10).await?;
        if !resp.ok || resp.exit_status.unwrap_or(1) != 0 {
            return Err(Error::Upstream(format!("move failed: {}", resp.stderr)));
        }

        let rev = self.store.bump_rev(&self.cid, &dst).await?;
        self.broadcast(json!({
            "event": "path_moved",
            "src": src,
            "dst": dst,
            "rev": rev,
        }));
        Ok(json!({"event": "ok", "req_id": req_id, "rev": rev}))
    }

    async fn delete_path(&self, content: &Value, req_id: i64) -> Result<Value> {
        let path = check_path(&Self::str_field(content, "path")?)?;
        let cmd = format!("set -e; rm -rf {}", sh_quote(&path));

        let resp = self.client.execute_sh(&self.cid, &cmd, 10).await?;
        if !resp.ok || resp.exit_status.unwrap_or(1) != 0 {
            return Err(Error::Upstream(format!("delete failed: {}", resp.stderr)));
        }

        let rev = self.store.bump_rev(&self.cid, &path).await?;
        self.broadcast(json!({
            "event": "path_deleted",
            "path": path,
            "rev": rev,
        }));
        Ok(json!({"event": "ok", "req_id": req_id, "rev": rev}))
    }

    async fn search(&self, content: &Value, req_id: i64) -> Result<Value> {
        let root = check_path(&Self::str_field(content, "root")?)?;
        let pattern = Self::str_field(content, "pattern")?;
        let case_insensitive = match content.get("case") {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s == "true",
            _ => false,
        };
        let split_csv = |key: &str| -> Vec<String> {
            content
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(str::to_string)
                .collect()
        };

        let request = SearchRequest {
            pattern,
            root,
            case_insensitive,
            include_globs: split_csv("include_globs"),
            exclude_dirs: {
                let mut dirs = split_csv("exclude_dirs");
                if !dirs.iter().any(|d| d == ".git") {
                    dirs.push(".git".to_string());
                }
                dirs
            },
            max_results_total: Some(SEARCH_MAX_RESULTS),
            timeout_seconds: SEARCH_TIMEOUT_S,
        };
        let hits = self.client.search(&self.cid, &request).await?;
        Ok(json!({"event": "ok", "req_id": req_id, "data": hits}))
    }
}

/// Minimal POSIX quoting for paths interpolated into remote commands.
fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_norm_collapses_slashes_and_trailing() {
        assert_eq!(path_norm("/app//src///x/"), "/app/src/x");
        assert_eq!(path_norm("///"), "/");
        assert_eq!(path_norm(""), "/");
    }

    #[test]
    fn check_path_enforces_safe_root() {
        assert_eq!(check_path("/app").unwrap(), "/app");
        assert_eq!(check_path("/app//x/y/").unwrap(), "/app/x/y");
        assert!(check_path("/etc/passwd").is_err());
        assert!(check_path("/application").is_err());
        assert!(check_path("/").is_err());
    }

    #[test]
    fn traversal_resolving_outside_root_is_rejected() {
        // Traversal is rejected only when the resolved path leaves /app.
        assert_eq!(check_path("/app//x/../y").unwrap(), "/app/y");
        assert!(check_path("/app/../etc").is_err());
        assert!(check_path("/app/a/../../b").is_err());
    }

    #[test]
    fn quoting_wraps_and_escapes() {
        assert_eq!(sh_quote("/app/a b"), "'/app/a b'");
        assert_eq!(sh_quote("/app/o'brien"), r"'/app/o'\''brien'");
    }

    #[test]
    fn hub_hands_out_one_group_per_container() {
        let hub = EditorHub::new();
        let a1 = hub.group(1);
        let a2 = hub.group(1);
        let b = hub.group(2);

        let mut rx = a2.subscribe();
        a1.send("x".to_string()).unwrap();
        assert_eq!(rx.try_recv().unwrap(), "x");
        assert_eq!(b.receiver_count(), 0);
    }

    #[test]
    fn write_locks_are_shared_per_container() {
        let hub = EditorHub::new();
        let l1 = hub.write_lock(7);
        let l2 = hub.write_lock(7);
        assert!(Arc::ptr_eq(&l1, &l2));
        let other = hub.write_lock(8);
        assert!(!Arc::ptr_eq(&l1, &other));
    }

    use crate::db::Node;
    use skiff_common::types::ElementResponse;

    fn stub_client(base_url: &str) -> NodeClient {
        NodeClient::new(&Node {
            id: 1,
            name: "stub".into(),
            base_url: base_url.into(),
            auth_token: "t".into(),
            active: true,
            healthy: true,
            heartbeat_at: None,
            capacity_vcpus: 4,
            capacity_mem_mb: 4096,
        })
    }

    fn session(client: NodeClient) -> EditorSession {
        let hub = EditorHub::new();
        EditorSession {
            store: Store::open_memory("ed").unwrap(),
            client,
            cid: "vm-1".into(),
            write_lock: hub.write_lock(1),
            group: hub.group(1),
        }
    }

    #[tokio::test]
    async fn unknown_action_and_unsafe_path_reply_with_errors() {
        let session = session(stub_client("http://127.0.0.1:9"));

        let reply = session
            .handle(r#"{"req_id": 4, "action": "frobnicate"}"#)
            .await;
        assert_eq!(reply["event"], "error");
        assert_eq!(reply["req_id"], 4);
        assert!(reply["error"].as_str().unwrap().contains("unknown action"));

        let reply = session
            .handle(r#"{"req_id": 5, "action": "read_file", "path": "/etc/passwd"}"#)
            .await;
        assert_eq!(reply["event"], "error");
        assert!(reply["error"].as_str().unwrap().contains("/app"));
    }

    #[tokio::test]
    async fn stale_prev_rev_conflicts_before_touching_the_node() {
        // Client points at a dead port: a conflict must short-circuit the
        // upload entirely.
        let session = session(stub_client("http://127.0.0.1:9"));
        let reply = session
            .handle(r#"{"req_id": 1, "action": "write_file", "path": "/app/a.txt", "content": "x", "prev_rev": 5}"#)
            .await;
        assert_eq!(reply["event"], "error");
        assert_eq!(reply["error"], "conflict");
        assert_eq!(reply["rev"], 0);
    }

    async fn spawn_upload_stub() -> String {
        use axum::routing::post;
        use axum::{Json, Router};
        let app = Router::new().route(
            "/vms/:id/upload-files",
            post(|| async { Json(ElementResponse::ok()) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn second_write_with_prev_rev_zero_conflicts_after_first_bump() {
        let base_url = spawn_upload_stub().await;
        let session = session(stub_client(&base_url));

        // prev_rev=0 against a fresh path matches the current revision.
        let r1 = session
            .handle(r#"{"req_id": 1, "action": "write_file", "path": "/app/a.txt", "content": "hi", "prev_rev": 0}"#)
            .await;
        assert_eq!(r1["event"], "ok");
        assert_eq!(r1["rev"], 1);

        // The revision has advanced, so the same prev_rev=0 now loses.
        let r2 = session
            .handle(r#"{"req_id": 2, "action": "write_file", "path": "/app/a.txt", "content": "ho", "prev_rev": 0}"#)
            .await;
        assert_eq!(r2["event"], "error");
        assert_eq!(r2["error"], "conflict");
        assert_eq!(r2["rev"], 1);
    }

    #[tokio::test]
    async fn optimistic_writes_linearize_and_stale_writer_loses() {
        let base_url = spawn_upload_stub().await;
        let session = session(stub_client(&base_url));

        let r1 = session
            .handle(r#"{"req_id": 1, "action": "write_file", "path": "/app/a.txt", "content": "hi"}"#)
            .await;
        assert_eq!(r1["event"], "ok");
        assert_eq!(r1["rev"], 1);

        let r2 = session
            .handle(r#"{"req_id": 2, "action": "write_file", "path": "/app/a.txt", "content": "ho", "prev_rev": 1}"#)
            .await;
        assert_eq!(r2["event"], "ok");
        assert_eq!(r2["rev"], 2);

        // A second writer holding the old rev gets the conflict plus the
        // current rev to recover with.
        let r3 = session
            .handle(r#"{"req_id": 3, "action": "write_file", "path": "/app/a.txt", "content": "hm", "prev_rev": 1}"#)
            .await;
        assert_eq!(r3["event"], "error");
        assert_eq!(r3["error"], "conflict");
        assert_eq!(r3["rev"], 2);
    }
}
