//! Agent configuration
//!
//! Every option is a flag with an environment fallback, so the agent can be
//! configured entirely from the environment in container deployments.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(name = "skiffd")]
#[command(about = "Skiff node agent - QEMU micro-VM lifecycle and session layer")]
#[command(version)]
pub struct AgentConfig {
    /// Listen address for the HTTP/WS API
    #[arg(long, default_value = "127.0.0.1:8080")]
    pub listen: String,

    /// Root directory for VM workdirs
    #[arg(long, env = "VM_BASE_DIR", default_value = "/var/lib/skiff")]
    pub base_dir: PathBuf,

    /// Guest user provisioned by cloud-init and used for SSH
    #[arg(long, env = "VM_SSH_USER", default_value = "root")]
    pub ssh_user: String,

    /// Private key used for guest SSH; the public key is expected beside it
    /// with a `.pub` suffix
    #[arg(long, env = "VM_SSH_PRIVKEY", default_value = "~/.ssh/id_skiff_vm")]
    pub ssh_privkey: PathBuf,

    /// QEMU binary override (x86_64 hosts)
    #[arg(long, env = "VM_QEMU_BIN")]
    pub qemu_bin: Option<String>,

    /// UEFI firmware override for aarch64 guests
    #[arg(long, env = "VM_UEFI_ARM64")]
    pub uefi_arm64: Option<PathBuf>,

    /// Backing qcow2 image for per-VM overlays
    #[arg(long, env = "VM_BASE_IMAGE")]
    pub base_image: PathBuf,

    /// Seconds to wait for SSH to come up after boot
    #[arg(long, env = "VM_TIMEOUT_BOOT_S", default_value_t = 600)]
    pub timeout_boot_s: u64,

    /// Drop QEMU to this uid after setsid
    #[arg(long, env = "VM_RUN_AS_UID")]
    pub run_as_uid: Option<u32>,

    /// Drop QEMU to this gid after setsid
    #[arg(long, env = "VM_RUN_AS_GID")]
    pub run_as_gid: Option<u32>,

    /// Shared store path (VM catalog)
    #[arg(long, env = "STORE_PATH", default_value = "/var/lib/skiff/store.db")]
    pub store_path: PathBuf,

    /// Shared store key namespace
    #[arg(long, env = "STORE_PREFIX", default_value = "skiff")]
    pub store_prefix: String,

    /// Bearer token required by every endpoint except /health
    #[arg(long, env = "AUTH_TOKEN", default_value = "")]
    pub auth_token: String,

    /// Node identity reported in VM views
    #[arg(long, env = "NODE_NAME", default_value = "local-node")]
    pub node_name: String,
}

impl AgentConfig {
    /// Root of all VM workdirs: `<base_dir>/vms`.
    pub fn vms_root(&self) -> PathBuf {
        self.base_dir.join("vms")
    }

    /// Public key path derived from the private key path.
    pub fn ssh_pubkey(&self) -> PathBuf {
        let mut s = self.ssh_privkey.as_os_str().to_os_string();
        s.push(".pub");
        PathBuf::from(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pubkey_path_appends_suffix() {
        let cfg = AgentConfig::parse_from([
            "skiffd",
            "--base-image",
            "/images/jammy.qcow2",
            "--ssh-privkey",
            "/keys/id_vm",
        ]);
        assert_eq!(cfg.ssh_pubkey(), PathBuf::from("/keys/id_vm.pub"));
        assert_eq!(cfg.vms_root(), PathBuf::from("/var/lib/skiff/vms"));
    }

    #[test]
    fn defaults_match_documented_surface() {
        let cfg = AgentConfig::parse_from(["skiffd", "--base-image", "/images/base.qcow2"]);
        assert_eq!(cfg.timeout_boot_s, 600);
        assert_eq!(cfg.node_name, "local-node");
        assert_eq!(cfg.store_prefix, "skiff");
    }
}
