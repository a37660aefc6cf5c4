//! VM lifecycle engine: owns the VmProc registry and drives VMRecord state
//! transitions through the shared store. `start` and `stop` return
//! immediately; the work runs on spawned tasks.

use crate::config::AgentConfig;
use crate::qemu::boot::{self, VmProc};
use crate::ssh::SshCache;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use parking_lot::RwLock;
use skiff_common::types::{VmRecord, VmState};
use skiff_common::{now_ts, Result, Store};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::{error, info, warn};

pub struct Runner {
    config: Arc<AgentConfig>,
    store: Store,
    ssh: Arc<SshCache>,
    /// vm id -> live process handle. Ephemeral to this process; the store
    /// record is authoritative.
    procs: Arc<RwLock<HashMap<String, VmProc>>>,
}

impl Runner {
    pub fn new(config: Arc<AgentConfig>, store: Store, ssh: Arc<SshCache>) -> Self {
        Self {
            config,
            store,
            ssh,
            procs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.config.node_name
    }

    /// Ensure `<base>/vms/<vm_id>` exists and return it.
    pub async fn workdir(&self, vm_id: &str) -> Result<PathBuf> {
        let wd = self.config.vms_root().join(vm_id);
        fs::create_dir_all(&wd).await?;
        Ok(wd)
    }

    /// Kick off an asynchronous boot. The record is persisted as
    /// provisioning before this returns; the worker flips it to running (with
    /// ssh_port/ssh_user populated) or error.
    pub async fn start(&self, mut vm: VmRecord) -> Result<VmRecord> {
        vm.booted_at = Some(now_ts());
        let vm = self.store.put(vm).await?;

        let config = self.config.clone();
        let store = self.store.clone();
        let ssh = self.ssh.clone();
        let procs_vm = vm.clone();
        let runner_procs = self.procs.clone();

        tokio::spawn(async move {
            let mut vm = procs_vm;
            let workdir = PathBuf::from(&vm.workdir);
            match boot::start_vm(&config, &workdir, vm.vcpus, vm.mem_mib, vm.disk_gib).await {
                Ok(proc) => {
                    vm.ssh_port = Some(proc.port_ssh);
                    vm.ssh_user = Some(config.ssh_user.clone());
                    runner_procs.write().insert(vm.id.clone(), proc);

                    match store.set_status(vm, VmState::Running, None).await {
                        Ok(vm) => {
                            // Warm the SSH cache so the first interactive
                            // request does not pay the handshake.
                            if let Err(e) = ssh.resolve(&vm).await {
                                warn!(vm_id = %vm.id, error = %e, "SSH cache warm-up failed");
                            }
                            info!(vm_id = %vm.id, "VM is running");
                        }
                        Err(e) => error!(error = %e, "Failed to persist running state"),
                    }
                }
                Err(e) => {
                    error!(vm_id = %vm.id, error = %e, "VM boot failed");
                    if let Err(pe) = store
                        .set_status(vm, VmState::Error, Some(e.to_string()))
                        .await
                    {
                        error!(error = %pe, "Failed to persist error state");
                    }
                }
            }
        });

        Ok(vm)
    }

    /// Kick off an asynchronous stop: cooperative shutdown through the
    /// cached shell, then SIGTERM the process group, then SIGKILL, then
    /// optional disk cleanup.
    pub async fn stop(&self, vm: VmRecord, cleanup_disks: bool) -> Result<VmRecord> {
        let store = self.store.clone();
        let ssh = self.ssh.clone();
        let proc = self.procs.write().remove(&vm.id);
        let workdir = self.config.vms_root().join(&vm.id);
        let task_vm = vm.clone();

        tokio::spawn(async move {
            let mut vm = task_vm;
            ssh.send_shutdown(&vm.id).await;
            ssh.clear(&vm.id).await;
            wait_for_port_drain(vm.ssh_port, Duration::from_secs(20)).await;

            let pidfile = proc
                .as_ref()
                .map(|p| p.pidfile.clone())
                .unwrap_or_else(|| workdir.join("qemu.pid"));
            let pid = read_pidfile(&pidfile).await.or(proc.as_ref().map(|p| p.pid));

            if let Some(pid) = pid {
                kill_process_group(pid).await;
            }

            if cleanup_disks {
                clean_up_artifacts(&artifact_paths(proc.as_ref(), &workdir)).await;
            }
            if pidfile.exists() {
                let _ = fs::remove_file(&pidfile).await;
            }

            vm.ssh_port = None;
            if let Err(e) = store.set_status(vm, VmState::Stopped, None).await {
                error!(error = %e, "Failed to persist stopped state");
            }
        });

        Ok(vm)
    }
}

/// Everything a VM leaves on disk. Prefer the live proc handle's paths;
/// fall back to the workdir layout for reattached VMs.
fn artifact_paths(proc: Option<&VmProc>, workdir: &std::path::Path) -> Vec<PathBuf> {
    match proc {
        Some(p) => vec![
            p.overlay.clone(),
            p.seed_iso.clone(),
            p.console_log.clone(),
            p.pidfile.clone(),
            p.workdir.join("user-data"),
            p.workdir.join("meta-data"),
            p.workdir.join("seed.iso.spec"),
        ],
        None => [
            "disk.qcow2",
            "seed.iso",
            "console.log",
            "qemu.pid",
            "user-data",
            "meta-data",
            "seed.iso.spec",
        ]
        .iter()
        .map(|name| workdir.join(name))
        .collect(),
    }
}

/// Give the cooperative shutdown a chance: poll the forwarded SSH port
/// until it stops accepting connections or the grace window runs out.
async fn wait_for_port_drain(port: Option<u16>, grace: Duration) {
    let Some(port) = port else {
        return;
    };
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        let probe = tokio::time::timeout(
            Duration::from_millis(1500),
            tokio::net::TcpStream::connect(("127.0.0.1", port)),
        )
        .await;
        match probe {
            Ok(Ok(_)) => tokio::time::sleep(Duration::from_millis(500)).await,
            _ => return,
        }
    }
}

async fn read_pidfile(pidfile: &std::path::Path) -> Option<u32> {
    let s = fs::read_to_string(pidfile).await.ok()?;
    s.trim().parse().ok()
}

/// SIGTERM the group, wait one second, SIGKILL.
async fn kill_process_group(pid: u32) {
    let pgid = Pid::from_raw(pid as i32);
    if let Err(e) = killpg(pgid, Signal::SIGTERM) {
        warn!(pid, error = %e, "SIGTERM to process group failed");
    }
    tokio::time::sleep(Duration::from_secs(1)).await;
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => info!(pid, "Process group killed"),
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "SIGKILL to process group failed"),
    }
}

/// Remove every per-VM artifact.
async fn clean_up_artifacts(paths: &[PathBuf]) {
    for path in paths {
        if path.exists() {
            if let Err(e) = fs::remove_file(path).await {
                warn!(path = %path.display(), error = %e, "Cleanup failed");
            }
        }
    }
}
