//! Core types shared between the node agent and the control plane.
//!
//! Everything here crosses a process boundary (store JSON or the node HTTP
//! API), so the serde shapes are the wire contract.

use serde::{Deserialize, Serialize};

/// Node-local VM lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Provisioning,
    Running,
    Stopped,
    Error,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Provisioning => write!(f, "provisioning"),
            VmState::Running => write!(f, "running"),
            VmState::Stopped => write!(f, "stopped"),
            VmState::Error => write!(f, "error"),
        }
    }
}

/// Authoritative per-node VM record, persisted in the shared store as JSON
/// under `{ns}:vm:{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmRecord {
    pub id: String,
    pub state: VmState,
    pub workdir: String,
    pub vcpus: u32,
    pub mem_mib: u64,
    pub disk_gib: u64,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub error_reason: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default)]
    pub booted_at: Option<i64>,
}

impl VmRecord {
    pub fn new(id: String, workdir: String, vcpus: u32, mem_mib: u64, disk_gib: u64) -> Self {
        let now = crate::now_ts();
        Self {
            id,
            state: VmState::Provisioning,
            workdir,
            vcpus,
            mem_mib,
            disk_gib,
            ssh_port: None,
            ssh_user: None,
            error_reason: None,
            created_at: now,
            updated_at: now,
            booted_at: None,
        }
    }
}

/// `POST /vms` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmCreate {
    pub vcpus: u32,
    pub mem_mib: u64,
    pub disk_gib: u64,
}

/// The closed set of VM actions; unknown tags are rejected at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmActionKind {
    Start,
    Stop,
    Reboot,
}

/// `POST /vms/{id}/actions` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmActionRequest {
    pub action: VmActionKind,
    #[serde(default)]
    pub cleanup_disks: Option<bool>,
}

/// Public VM view returned by the node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmOut {
    pub id: String,
    pub state: VmState,
    pub node: String,
    pub ssh_host: String,
    pub ssh_port: Option<u16>,
    pub ssh_user: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub booted_at: Option<i64>,
    #[serde(default)]
    pub error_reason: Option<String>,
}

impl VmOut {
    pub fn from_record(vm: &VmRecord, node: &str) -> Self {
        Self {
            id: vm.id.clone(),
            state: vm.state,
            node: node.to_string(),
            ssh_host: "127.0.0.1".to_string(),
            ssh_port: vm.ssh_port,
            ssh_user: vm.ssh_user.clone(),
            created_at: vm.created_at,
            updated_at: vm.updated_at,
            booted_at: vm.booted_at,
            error_reason: vm.error_reason.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Guest file operations
// ---------------------------------------------------------------------------

/// One file in an upload batch. Either `text` (UTF-8) or `content_b64`
/// (binary) is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmFile {
    pub path: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub content_b64: Option<String>,
    #[serde(default = "default_file_mode")]
    pub mode: u32,
}

fn default_file_mode() -> u32 {
    0o644
}

/// `POST /vms/{id}/upload-files` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmUploadFiles {
    #[serde(default = "default_dest_path")]
    pub dest_path: String,
    #[serde(default)]
    pub clean: bool,
    pub files: Vec<VmFile>,
}

fn default_dest_path() -> String {
    "/app".to_string()
}

/// Per-file upload failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadFailure {
    pub path: String,
    pub reason: String,
}

/// Generic ok/reason envelope used by guest-side operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementResponse {
    pub ok: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<UploadFailure>,
}

impl ElementResponse {
    pub fn ok() -> Self {
        Self {
            ok: true,
            reason: String::new(),
            failed: Vec::new(),
        }
    }

    pub fn err(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            reason: reason.into(),
            failed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathType {
    Directory,
    File,
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListDirItem {
    pub path: String,
    pub name: String,
    pub path_type: PathType,
}

/// `POST /vms/{id}/list-dirs` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmPaths {
    pub paths: Vec<String>,
    #[serde(default = "default_depth")]
    pub depth: u32,
}

fn default_depth() -> u32 {
    1
}

/// Single-path request body (read-file, create-dir).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmPath {
    pub path: String,
}

/// File contents read from the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileContent {
    pub name: String,
    pub content: String,
    pub length: usize,
    pub found: bool,
}

impl FileContent {
    pub fn missing(path: &str) -> Self {
        Self {
            name: basename(path),
            content: String::new(),
            length: 0,
            found: false,
        }
    }
}

/// `POST /vms/{id}/execute-sh` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSh {
    pub command: String,
    #[serde(default = "default_sh_timeout")]
    pub timeout: u64,
}

fn default_sh_timeout() -> u64 {
    5
}

/// Output of a remote command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmShResponse {
    pub ok: bool,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_status: Option<u32>,
}

/// `POST /vms/{id}/search` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchRequest {
    pub pattern: String,
    #[serde(default = "default_dest_path")]
    pub root: String,
    #[serde(default)]
    pub case_insensitive: bool,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default = "default_exclude_dirs")]
    pub exclude_dirs: Vec<String>,
    #[serde(default)]
    pub max_results_total: Option<usize>,
    #[serde(default = "default_search_timeout")]
    pub timeout_seconds: u64,
}

fn default_exclude_dirs() -> Vec<String> {
    vec![".git".to_string()]
}

fn default_search_timeout() -> u64 {
    10
}

/// Matches in one file, grouped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    pub path: String,
    pub matches: Vec<String>,
}

/// Per-VM process metrics reported by the node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineMetrics {
    pub ts: i64,
    pub cpu_percent: f32,
    pub rss_bytes: u64,
    pub rss_mib: f64,
}

/// Final POSIX path component, or the path itself when there is none.
pub fn basename(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some((_, name)) if !name.is_empty() => name.to_string(),
        _ => path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vm_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&VmState::Provisioning).unwrap(),
            "\"provisioning\""
        );
        let s: VmState = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(s, VmState::Running);
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = serde_json::from_str::<VmActionRequest>(r#"{"action":"pause"}"#);
        assert!(err.is_err());
        let ok: VmActionRequest = serde_json::from_str(r#"{"action":"reboot"}"#).unwrap();
        assert_eq!(ok.action, VmActionKind::Reboot);
        assert_eq!(ok.cleanup_disks, None);
    }

    #[test]
    fn record_round_trips_through_json() {
        let rec = VmRecord::new("vm-1".into(), "/tmp/vms/vm-1".into(), 2, 2048, 10);
        let json = serde_json::to_string(&rec).unwrap();
        let back: VmRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "vm-1");
        assert_eq!(back.state, VmState::Provisioning);
        assert_eq!(back.ssh_port, None);
    }

    #[test]
    fn basename_handles_trailing_slash_and_root() {
        assert_eq!(basename("/app/src/main.rs"), "main.rs");
        assert_eq!(basename("/app/src/"), "src");
        assert_eq!(basename("/"), "/");
    }
}
