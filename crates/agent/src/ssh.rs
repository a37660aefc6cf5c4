//! SSH/SFTP session layer.
//!
//! One cache entry per VM: the authenticated client handle, an SFTP session,
//! and one long-lived interactive shell channel. Entries are validated with a
//! cheap `echo hello` probe before reuse and rebuilt end-to-end when the
//! probe fails. `regenerate` is the single place an entry is constructed and
//! inserted, so callers never observe a partially built entry.

use russh::client::{self, Handle, Handler};
use russh::keys::{PrivateKey, PrivateKeyWithHashAlg};
use russh::{Channel, ChannelMsg};
use russh_sftp::client::SftpSession;
use skiff_common::types::{VmRecord, VmState};
use skiff_common::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const SHELL_COLS: u32 = 120;
const SHELL_ROWS: u32 = 32;

/// Accepts any host key; guests are freshly provisioned and only reachable
/// through the loopback forward.
#[derive(Debug, Clone)]
pub struct AgentSshHandler;

impl Handler for AgentSshHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// One cached session: client handle + SFTP + the console shell channel.
pub struct SshEntry {
    pub handle: Handle<AgentSshHandler>,
    pub sftp: SftpSession,
    console: Mutex<Channel<client::Msg>>,
}

impl SshEntry {
    /// Write raw bytes into the cached interactive shell.
    pub async fn send_console(&self, data: &[u8]) -> Result<()> {
        let mut channel = self.console.lock().await;
        channel
            .data(data)
            .await
            .map_err(|e| Error::Ssh(format!("console write failed: {e}")))
    }
}

/// Output of a remote command run over an exec channel.
#[derive(Debug, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: Option<u32>,
}

impl ExecOutput {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Per-VM SSH/SFTP cache. Owned by the agent server and injected into
/// handlers; never a module global.
pub struct SshCache {
    entries: RwLock<HashMap<String, Arc<SshEntry>>>,
    privkey_path: PathBuf,
    config: Arc<client::Config>,
}

impl SshCache {
    pub fn new(privkey_path: PathBuf) -> Self {
        let config = client::Config {
            keepalive_interval: Some(KEEPALIVE_INTERVAL),
            ..Default::default()
        };
        Self {
            entries: RwLock::new(HashMap::new()),
            privkey_path,
            config: Arc::new(config),
        }
    }

    /// Resolve a live entry for the VM: cache hit is returned only after the
    /// liveness probe succeeds; anything else rebuilds the entry.
    pub async fn resolve(&self, vm: &VmRecord) -> Result<Arc<SshEntry>> {
        let (port, user) = connect_params(vm)?;

        let cached = { self.entries.read().await.get(&vm.id).cloned() };
        if let Some(entry) = cached {
            match exec_capture(&entry.handle, "echo hello", Some(PROBE_TIMEOUT)).await {
                Ok(_) => return Ok(entry),
                Err(e) => {
                    debug!(vm_id = %vm.id, error = %e, "Cached SSH session failed probe; rebuilding");
                }
            }
        }

        self.regenerate(&vm.id, port, &user).await
    }

    /// Build a complete entry and insert it. The single assignment site.
    pub async fn regenerate(&self, vm_id: &str, port: u16, user: &str) -> Result<Arc<SshEntry>> {
        info!(vm_id, port, "Establishing SSH session");
        let handle = connect(port, user, &self.privkey_path, self.config.clone()).await?;

        let sftp_channel = handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Ssh(format!("sftp channel open failed: {e}")))?;
        sftp_channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::Ssh(format!("sftp subsystem request failed: {e}")))?;
        let sftp = SftpSession::new(sftp_channel.into_stream())
            .await
            .map_err(|e| Error::Ssh(format!("sftp session init failed: {e}")))?;

        let console = open_shell(&handle).await?;

        let entry = Arc::new(SshEntry {
            handle,
            sftp,
            console: Mutex::new(console),
        });
        self.entries
            .write()
            .await
            .insert(vm_id.to_string(), entry.clone());
        Ok(entry)
    }

    /// Drop the cached entry for one VM.
    pub async fn clear(&self, vm_id: &str) {
        self.entries.write().await.remove(vm_id);
    }

    /// Best-effort cooperative shutdown through the cached shell, used by
    /// the runner before signalling the QEMU process group.
    pub async fn send_shutdown(&self, vm_id: &str) {
        let entry = self.entries.read().await.get(vm_id).cloned();
        if let Some(entry) = entry {
            if let Err(e) = entry.send_console(b"shutdown now\n").await {
                warn!(vm_id, error = %e, "Cooperative shutdown write failed");
            }
        }
    }
}

fn connect_params(vm: &VmRecord) -> Result<(u16, String)> {
    if vm.state != VmState::Running {
        return Err(Error::Validation("VM is not running".into()));
    }
    let port = vm
        .ssh_port
        .ok_or_else(|| Error::Validation("VM has no SSH port".into()))?;
    let user = vm
        .ssh_user
        .clone()
        .ok_or_else(|| Error::Validation("VM has no SSH user".into()))?;
    Ok((port, user))
}

/// Load the configured private key (OpenSSH format).
pub async fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let pem = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::InvalidConfig(format!("cannot read {}: {e}", path.display())))?;
    PrivateKey::from_openssh(&pem)
        .map_err(|e| Error::InvalidConfig(format!("cannot parse private key: {e}")))
}

/// TCP connect + SSH handshake + public key auth against the VM's loopback
/// forward. A single attempt; retry policy belongs to the callers
/// (readiness polling and cache revalidation only).
pub async fn connect(
    port: u16,
    user: &str,
    privkey_path: &Path,
    config: Arc<client::Config>,
) -> Result<Handle<AgentSshHandler>> {
    let key = load_private_key(privkey_path).await?;

    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port)))
        .await
        .map_err(|_| Error::Timeout {
            seconds: CONNECT_TIMEOUT.as_secs(),
        })?
        .map_err(Error::Io)?;

    let mut handle = client::connect_stream(config, stream, AgentSshHandler)
        .await
        .map_err(|e| Error::Ssh(format!("handshake failed: {e}")))?;

    let auth = handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), None))
        .await
        .map_err(|e| Error::Ssh(format!("auth failed: {e}")))?;
    if !auth.success() {
        return Err(Error::Ssh("public key authentication rejected".into()));
    }
    Ok(handle)
}

/// Open a fresh interactive PTY shell channel (120x32).
pub async fn open_shell(handle: &Handle<AgentSshHandler>) -> Result<Channel<client::Msg>> {
    let channel = handle
        .channel_open_session()
        .await
        .map_err(|e| Error::Ssh(format!("shell channel open failed: {e}")))?;
    channel
        .request_pty(true, "xterm-256color", SHELL_COLS, SHELL_ROWS, 0, 0, &[])
        .await
        .map_err(|e| Error::Ssh(format!("pty request failed: {e}")))?;
    channel
        .request_shell(true)
        .await
        .map_err(|e| Error::Ssh(format!("shell request failed: {e}")))?;
    Ok(channel)
}

/// Run a command over a fresh exec channel and collect stdout/stderr/exit.
/// With a timeout, a slow command yields `Error::Timeout`.
pub async fn exec_capture(
    handle: &Handle<AgentSshHandler>,
    command: &str,
    timeout: Option<Duration>,
) -> Result<ExecOutput> {
    let fut = exec_capture_inner(handle, command);
    match timeout {
        Some(t) => tokio::time::timeout(t, fut)
            .await
            .map_err(|_| Error::Timeout { seconds: t.as_secs() })?,
        None => fut.await,
    }
}

async fn exec_capture_inner(
    handle: &Handle<AgentSshHandler>,
    command: &str,
) -> Result<ExecOutput> {
    let mut channel = handle
        .channel_open_session()
        .await
        .map_err(|e| Error::Ssh(format!("exec channel open failed: {e}")))?;
    channel
        .exec(true, command)
        .await
        .map_err(|e| Error::Ssh(format!("exec `{command}` failed: {e}")))?;

    let mut out = ExecOutput::default();
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => out.stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                out.stderr.extend_from_slice(&data)
            }
            ChannelMsg::ExitStatus { exit_status } => out.exit_status = Some(exit_status),
            _ => {}
        }
    }
    Ok(out)
}

/// Run a command and require exit status 0, mapping failure to `Upstream`
/// with the remote stderr attached.
pub async fn exec_checked(
    handle: &Handle<AgentSshHandler>,
    command: &str,
    timeout: Option<Duration>,
) -> Result<ExecOutput> {
    let out = exec_capture(handle, command, timeout).await?;
    match out.exit_status {
        Some(0) => Ok(out),
        status => Err(Error::Upstream(format!(
            "command failed ({status:?}): {command}\nstderr: {}",
            out.stderr_lossy()
        ))),
    }
}
