//! The boot sequence: workdir preparation, overlay + seed ISO, port pick,
//! QEMU spawn as a session leader, and SSH readiness polling.

use super::args::{build_args, VmLaunchSpec};
use super::ports::pick_free_port;
use super::seed::{make_overlay, make_seed_iso};
use crate::config::AgentConfig;
use crate::ssh;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use skiff_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// Handle to a booted QEMU VM. The process itself is reaped by a detached
/// task; signalling goes through the process group (the pid is the session
/// leader).
#[derive(Debug, Clone)]
pub struct VmProc {
    pub workdir: PathBuf,
    pub overlay: PathBuf,
    pub seed_iso: PathBuf,
    pub port_ssh: u16,
    pub pid: u32,
    pub console_log: PathBuf,
    pub pidfile: PathBuf,
}

pub fn pid_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Delete a pidfile whose PID is no longer alive. Never reuse a stale pid.
pub async fn clear_stale_pidfile(pidfile: &Path) {
    if !pidfile.exists() {
        return;
    }
    let pid = fs::read_to_string(pidfile)
        .await
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok());
    let alive = pid.map(pid_alive).unwrap_or(false);
    if !alive {
        if let Err(e) = fs::remove_file(pidfile).await {
            warn!(pidfile = %pidfile.display(), error = %e, "Failed to remove stale pidfile");
        } else {
            info!(pidfile = %pidfile.display(), "Removed stale pidfile");
        }
    }
}

/// Boot a VM in `workdir` and wait for SSH. Returns once an authenticated
/// SSH handshake has succeeded, or fails with the VM torn down to an error
/// state by the caller.
pub async fn start_vm(
    config: &AgentConfig,
    workdir: &Path,
    vcpus: u32,
    mem_mib: u64,
    disk_gib: u64,
) -> Result<VmProc> {
    fs::create_dir_all(workdir).await?;
    let overlay = workdir.join("disk.qcow2");
    let seed_iso = workdir.join("seed.iso");
    let console_log = workdir.join("console.log");
    let pidfile = workdir.join("qemu.pid");

    clear_stale_pidfile(&pidfile).await;

    make_overlay(&config.base_image, &overlay, disk_gib).await?;
    let instance_id = workdir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "vm".to_string());
    make_seed_iso(&seed_iso, &config.ssh_user, &config.ssh_pubkey(), &instance_id).await?;

    if let (Some(uid), Some(gid)) = (config.run_as_uid, config.run_as_gid) {
        align_workdir_ownership(workdir, uid, gid).await;
    }

    let port = pick_free_port()?;
    let spec = VmLaunchSpec {
        vcpus,
        mem_mib,
        console_log: console_log.display().to_string(),
        port,
        overlay: overlay.display().to_string(),
        seed_iso: seed_iso.display().to_string(),
        pidfile: Some(pidfile.display().to_string()),
    };
    let argv = build_args(config, &spec)?;
    debug!(vm = %instance_id, argv = ?argv, "QEMU command");

    let pid = spawn_qemu(&argv, config.run_as_uid, config.run_as_gid)?;
    info!(vm = %instance_id, pid, port, "QEMU started");

    let deadline = Duration::from_secs(config.timeout_boot_s);
    match wait_ssh(port, deadline, &config.ssh_user, &config.ssh_privkey, || {
        pid_alive(pid)
    })
    .await
    {
        Ok(waited) => {
            info!(vm = %instance_id, waited_s = waited.as_secs_f32(), "SSH ready");
        }
        Err(e) => {
            log_console_tail(&console_log, 120).await;
            return Err(e);
        }
    }

    Ok(VmProc {
        workdir: workdir.to_path_buf(),
        overlay,
        seed_iso,
        port_ssh: port,
        pid,
        console_log,
        pidfile,
    })
}

/// Spawn QEMU in its own session (own process group) so stop can signal the
/// whole group, dropping to the configured uid/gid first when set. The gid
/// set includes `/dev/kvm`'s group so the accelerator stays reachable.
fn spawn_qemu(argv: &[String], run_uid: Option<u32>, run_gid: Option<u32>) -> Result<u32> {
    let (program, rest) = argv
        .split_first()
        .ok_or_else(|| Error::Internal("empty argv".into()))?;

    let kvm_gid = {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata("/dev/kvm").ok().map(|m| m.gid())
    };

    let mut cmd = Command::new(program);
    cmd.args(rest)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
            libc::umask(0o002);
            if let Some(gid) = run_gid {
                let mut groups: Vec<libc::gid_t> = vec![gid];
                if let Some(kg) = kvm_gid {
                    if kg != gid {
                        groups.push(kg);
                    }
                }
                if libc::setgroups(groups.len(), groups.as_ptr()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setgid(gid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            if let Some(uid) = run_uid {
                if libc::setuid(uid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Qemu(format!("failed to spawn QEMU: {e}")))?;
    let pid = child
        .id()
        .ok_or_else(|| Error::Qemu("QEMU exited before returning a pid".into()))?;

    // Reap in the background so the child never lingers as a zombie.
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!(pid, %status, "QEMU process exited"),
            Err(e) => warn!(pid, error = %e, "Failed to reap QEMU process"),
        }
    });

    Ok(pid)
}

/// Poll until an authenticated SSH handshake succeeds on 127.0.0.1:port.
/// Aborts early when the QEMU child dies. Backs off from 150 ms to 500 ms
/// after the first five seconds.
pub async fn wait_ssh(
    port: u16,
    timeout: Duration,
    user: &str,
    privkey: &Path,
    is_vm_alive: impl Fn() -> bool,
) -> Result<Duration> {
    let config = Arc::new(russh::client::Config::default());
    let start = Instant::now();

    while start.elapsed() < timeout {
        match ssh::connect(port, user, privkey, config.clone()).await {
            Ok(handle) => {
                drop(handle);
                return Ok(start.elapsed());
            }
            Err(e) => {
                debug!(port, error = %e, "SSH not ready yet");
            }
        }

        if !is_vm_alive() {
            warn!(port, "QEMU process died while waiting for SSH");
            return Err(Error::Qemu("QEMU exited during boot".into()));
        }

        let pause = if start.elapsed() < Duration::from_secs(5) {
            Duration::from_millis(150)
        } else {
            Duration::from_millis(500)
        };
        tokio::time::sleep(pause).await;
    }

    Err(Error::Timeout {
        seconds: timeout.as_secs(),
    })
}

/// Align workdir ownership/permissions with the run user (umask 0002 world:
/// directories 0775, files 0664). chown failures are tolerated; the agent
/// may itself be unprivileged.
async fn align_workdir_ownership(workdir: &Path, uid: u32, gid: u32) {
    use std::os::unix::fs::PermissionsExt;

    let chown = |path: PathBuf, dir: bool| {
        let _ = nix::unistd::chown(
            &path,
            Some(nix::unistd::Uid::from_raw(uid)),
            Some(nix::unistd::Gid::from_raw(gid)),
        );
        let mode = if dir { 0o775 } else { 0o664 };
        if let Ok(meta) = std::fs::metadata(&path) {
            let mut perm = meta.permissions();
            perm.set_mode(mode);
            let _ = std::fs::set_permissions(&path, perm);
        }
    };

    chown(workdir.to_path_buf(), true);
    if let Ok(mut entries) = fs::read_dir(workdir).await {
        while let Ok(Some(entry)) = entries.next_entry().await {
            let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            chown(entry.path(), is_dir);
        }
    }
}

/// Log the tail of the serial console, the main boot diagnostic.
pub async fn log_console_tail(console_log: &Path, lines: usize) {
    match fs::read_to_string(console_log).await {
        Ok(content) => {
            let all: Vec<&str> = content.lines().collect();
            let start = all.len().saturating_sub(lines);
            error!(
                console = %console_log.display(),
                "Boot failed; console tail:\n{}",
                all[start..].join("\n")
            );
        }
        Err(e) => warn!(console = %console_log.display(), error = %e, "No console log to tail"),
    }
}

/// Read the last `lines` lines of the console log for the tail endpoint.
pub async fn read_console_tail(console_log: &Path, lines: usize) -> String {
    match fs::read_to_string(console_log).await {
        Ok(content) => {
            let all: Vec<&str> = content.lines().collect();
            let start = all.len().saturating_sub(lines);
            let mut out = all[start..].join("\n");
            if !out.is_empty() {
                out.push('\n');
            }
            out
        }
        Err(_) => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stale_pidfile_is_removed() {
        let dir = tempfile::TempDir::new().unwrap();
        let pidfile = dir.path().join("qemu.pid");
        // A pid that cannot be alive.
        fs::write(&pidfile, "999999999").await.unwrap();
        clear_stale_pidfile(&pidfile).await;
        assert!(!pidfile.exists());
    }

    #[tokio::test]
    async fn live_pidfile_is_kept() {
        let dir = tempfile::TempDir::new().unwrap();
        let pidfile = dir.path().join("qemu.pid");
        fs::write(&pidfile, std::process::id().to_string())
            .await
            .unwrap();
        clear_stale_pidfile(&pidfile).await;
        assert!(pidfile.exists());
    }

    #[tokio::test]
    async fn garbage_pidfile_counts_as_stale() {
        let dir = tempfile::TempDir::new().unwrap();
        let pidfile = dir.path().join("qemu.pid");
        fs::write(&pidfile, "not-a-pid").await.unwrap();
        clear_stale_pidfile(&pidfile).await;
        assert!(!pidfile.exists());
    }

    #[tokio::test]
    async fn wait_ssh_aborts_when_vm_dies() {
        let dir = tempfile::TempDir::new().unwrap();
        let key = dir.path().join("id");
        fs::write(&key, "not a key").await.unwrap();
        // Port with nothing listening; is_vm_alive reports dead immediately.
        let err = wait_ssh(
            1,
            Duration::from_secs(30),
            "root",
            &key,
            || false,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Qemu(_)));
    }

    #[tokio::test]
    async fn console_tail_returns_last_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let log = dir.path().join("console.log");
        let content: String = (1..=200).map(|i| format!("line {i}\n")).collect();
        fs::write(&log, content).await.unwrap();

        let tail = read_console_tail(&log, 3).await;
        assert_eq!(tail, "line 198\nline 199\nline 200\n");
        assert_eq!(read_console_tail(&dir.path().join("missing"), 3).await, "");
    }
}
