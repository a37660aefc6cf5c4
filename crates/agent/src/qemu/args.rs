//! QEMU argv construction.
//!
//! The returned vector includes the program itself at index 0 (aarch64 with
//! KVM runs under `taskset`, so the program is not always the QEMU binary).

use super::firmware;
use crate::config::AgentConfig;
use skiff_common::Result;
use std::path::Path;

/// Everything the argv builders need for one VM.
#[derive(Debug, Clone)]
pub struct VmLaunchSpec {
    pub vcpus: u32,
    pub mem_mib: u64,
    pub console_log: String,
    pub port: u16,
    pub overlay: String,
    pub seed_iso: String,
    pub pidfile: Option<String>,
}

/// Host facts that select the accelerator branch. Probed once per boot;
/// injected in tests.
#[derive(Debug, Clone, Copy)]
pub struct HostFacts {
    pub arch: &'static str,
    pub os: &'static str,
    pub kvm: bool,
}

impl HostFacts {
    pub fn probe() -> Self {
        Self {
            arch: std::env::consts::ARCH,
            os: std::env::consts::OS,
            kvm: Path::new("/dev/kvm").exists(),
        }
    }
}

/// Build the full argv for the host we are running on.
pub fn build_args(config: &AgentConfig, spec: &VmLaunchSpec) -> Result<Vec<String>> {
    let host = HostFacts::probe();
    if host.arch == "aarch64" {
        let uefi = firmware::find_uefi_arm64(config.uefi_arm64.as_deref())?;
        let bin = firmware::resolve_qemu_bin_arm64(config.qemu_bin.as_deref());
        Ok(arm64_args(&bin, &uefi.display().to_string(), spec, host))
    } else {
        let bin = config
            .qemu_bin
            .clone()
            .unwrap_or_else(|| "/usr/bin/qemu-system-x86_64".to_string());
        Ok(x86_args(&bin, spec, host.kvm))
    }
}

/// x86_64 argv: KVM when `/dev/kvm` exists, multi-threaded TCG otherwise.
pub fn x86_args(qemu_bin: &str, spec: &VmLaunchSpec, kvm: bool) -> Vec<String> {
    let mut args: Vec<String> = vec![qemu_bin.to_string()];
    if kvm {
        args.extend(strs(["-enable-kvm", "-machine", "accel=kvm,type=q35", "-cpu", "host"]));
    } else {
        args.extend(strs(["-machine", "type=q35", "-accel", "tcg,thread=multi", "-cpu", "max"]));
    }

    args.extend([
        "-smp".into(),
        spec.vcpus.to_string(),
        "-m".into(),
        spec.mem_mib.to_string(),
        "-display".into(),
        "none".into(),
        "-serial".into(),
        format!("file:{}", spec.console_log),
        "-device".into(),
        "virtio-net-pci,netdev=n0".into(),
        "-netdev".into(),
        format!("user,id=n0,hostfwd=tcp:127.0.0.1:{}-:22", spec.port),
        "-device".into(),
        "virtio-rng-pci".into(),
        "-drive".into(),
        format!("if=virtio,format=qcow2,file={}", spec.overlay),
        "-drive".into(),
        format!("if=virtio,format=raw,readonly=on,file={}", spec.seed_iso),
    ]);

    if let Some(pidfile) = &spec.pidfile {
        args.extend(["-pidfile".into(), pidfile.clone()]);
    }
    args
}

/// aarch64 argv: KVM on ARM Linux hosts, HVF on Darwin, TCG fallback.
pub fn arm64_args(qemu_bin: &str, uefi: &str, spec: &VmLaunchSpec, host: HostFacts) -> Vec<String> {
    let use_kvm = host.kvm && host.arch == "aarch64";
    let use_hvf = host.os == "macos";

    if use_kvm {
        arm64_kvm_args(qemu_bin, uefi, spec)
    } else if use_hvf {
        arm64_accel_args(qemu_bin, uefi, spec, "hvf")
    } else {
        arm64_accel_args(qemu_bin, uefi, spec, "tcg,thread=multi")
    }
}

fn arm64_kvm_args(qemu_bin: &str, uefi: &str, spec: &VmLaunchSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "taskset".into(),
        "-c".into(),
        "0-3".into(),
        qemu_bin.to_string(),
    ];
    args.extend(strs(["-accel", "kvm", "-cpu", "host", "-M", "virt-7.1,gic-version=3,its=off"]));
    args.extend([
        "-smp".into(),
        spec.vcpus.to_string(),
        "-m".into(),
        spec.mem_mib.to_string(),
        "-nographic".into(),
        "-serial".into(),
        format!("file:{}", spec.console_log),
        "-bios".into(),
        uefi.to_string(),
        "-nodefaults".into(),
        "-no-user-config".into(),
        "-netdev".into(),
        format!("user,id=n0,hostfwd=tcp:127.0.0.1:{}-:22", spec.port),
        "-device".into(),
        "virtio-net-device,netdev=n0".into(),
        "-device".into(),
        "virtio-scsi-device,id=scsi0".into(),
        "-drive".into(),
        format!("if=none,format=qcow2,file={},id=vd0", spec.overlay),
        "-device".into(),
        "scsi-hd,drive=vd0,bus=scsi0.0".into(),
    ]);

    if let Some(pidfile) = &spec.pidfile {
        args.extend(["-pidfile".into(), pidfile.clone()]);
    }
    // The seed ISO rides the SCSI bus as a CD on this machine type.
    args.extend([
        "-drive".into(),
        format!("if=none,format=raw,readonly=on,file={},id=cidata", spec.seed_iso),
        "-device".into(),
        "scsi-cd,drive=cidata,bus=scsi0.0".into(),
    ]);
    args
}

fn arm64_accel_args(qemu_bin: &str, uefi: &str, spec: &VmLaunchSpec, accel: &str) -> Vec<String> {
    let cpu = "max";
    let mut args: Vec<String> = vec![qemu_bin.to_string()];
    args.extend([
        "-accel".into(),
        accel.to_string(),
        "-cpu".into(),
        cpu.into(),
        "-machine".into(),
        "virt".into(),
        "-smp".into(),
        spec.vcpus.to_string(),
        "-m".into(),
        spec.mem_mib.to_string(),
        "-bios".into(),
        uefi.to_string(),
        "-nographic".into(),
        "-serial".into(),
        format!("file:{}", spec.console_log),
        "-netdev".into(),
        format!("user,id=n0,hostfwd=tcp:127.0.0.1:{}-:22", spec.port),
        "-device".into(),
        "virtio-net-device,netdev=n0".into(),
        "-drive".into(),
        format!("if=none,format=qcow2,file={},id=vd0", spec.overlay),
        "-device".into(),
        "virtio-blk-device,drive=vd0".into(),
    ]);

    if let Some(pidfile) = &spec.pidfile {
        args.extend(["-pidfile".into(), pidfile.clone()]);
    }
    args.extend([
        "-drive".into(),
        format!("if=none,format=raw,readonly=on,file={},id=cidata", spec.seed_iso),
        "-device".into(),
        "virtio-blk-device,drive=cidata".into(),
    ]);
    args
}

fn strs<const N: usize>(items: [&str; N]) -> impl Iterator<Item = String> + '_ {
    items.into_iter().map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> VmLaunchSpec {
        VmLaunchSpec {
            vcpus: 2,
            mem_mib: 2048,
            console_log: "/w/console.log".into(),
            port: 50022,
            overlay: "/w/disk.qcow2".into(),
            seed_iso: "/w/seed.iso".into(),
            pidfile: Some("/w/qemu.pid".into()),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn x86_kvm_selects_host_cpu_and_q35() {
        let args = x86_args("/usr/bin/qemu-system-x86_64", &spec(), true);
        assert_eq!(args[0], "/usr/bin/qemu-system-x86_64");
        assert!(args.contains(&"-enable-kvm".to_string()));
        assert!(has_pair(&args, "-machine", "accel=kvm,type=q35"));
        assert!(has_pair(&args, "-cpu", "host"));
        assert!(has_pair(&args, "-smp", "2"));
        assert!(has_pair(&args, "-m", "2048"));
        assert!(has_pair(
            &args,
            "-netdev",
            "user,id=n0,hostfwd=tcp:127.0.0.1:50022-:22"
        ));
        assert!(has_pair(&args, "-serial", "file:/w/console.log"));
        assert!(has_pair(&args, "-pidfile", "/w/qemu.pid"));
    }

    #[test]
    fn x86_without_kvm_falls_back_to_tcg() {
        let args = x86_args("/usr/bin/qemu-system-x86_64", &spec(), false);
        assert!(!args.contains(&"-enable-kvm".to_string()));
        assert!(has_pair(&args, "-accel", "tcg,thread=multi"));
        assert!(has_pair(&args, "-cpu", "max"));
        assert!(has_pair(&args, "-machine", "type=q35"));
    }

    #[test]
    fn x86_attaches_overlay_and_readonly_seed() {
        let args = x86_args("q", &spec(), true);
        assert!(has_pair(&args, "-drive", "if=virtio,format=qcow2,file=/w/disk.qcow2"));
        assert!(has_pair(
            &args,
            "-drive",
            "if=virtio,format=raw,readonly=on,file=/w/seed.iso"
        ));
    }

    #[test]
    fn arm64_kvm_pins_cpus_and_uses_scsi_bus() {
        let host = HostFacts {
            arch: "aarch64",
            os: "linux",
            kvm: true,
        };
        let args = arm64_args("/usr/bin/qemu-system-aarch64", "/fw/QEMU_EFI.fd", &spec(), host);
        assert_eq!(&args[..3], &["taskset", "-c", "0-3"]);
        assert_eq!(args[3], "/usr/bin/qemu-system-aarch64");
        assert!(has_pair(&args, "-accel", "kvm"));
        assert!(has_pair(&args, "-M", "virt-7.1,gic-version=3,its=off"));
        assert!(args.contains(&"-nodefaults".to_string()));
        assert!(args.contains(&"-no-user-config".to_string()));
        assert!(has_pair(&args, "-device", "scsi-hd,drive=vd0,bus=scsi0.0"));
        assert!(has_pair(&args, "-device", "scsi-cd,drive=cidata,bus=scsi0.0"));
        assert!(has_pair(&args, "-bios", "/fw/QEMU_EFI.fd"));
    }

    #[test]
    fn arm64_hvf_on_darwin_uses_virtio_blk() {
        let host = HostFacts {
            arch: "aarch64",
            os: "macos",
            kvm: false,
        };
        let args = arm64_args("qemu-system-aarch64", "/fw/edk2.fd", &spec(), host);
        assert!(has_pair(&args, "-accel", "hvf"));
        assert!(has_pair(&args, "-cpu", "max"));
        assert!(has_pair(&args, "-machine", "virt"));
        assert!(has_pair(&args, "-device", "virtio-blk-device,drive=vd0"));
        assert!(has_pair(&args, "-device", "virtio-blk-device,drive=cidata"));
    }

    #[test]
    fn arm64_tcg_fallback_without_kvm_or_hvf() {
        let host = HostFacts {
            arch: "aarch64",
            os: "linux",
            kvm: false,
        };
        let args = arm64_args("qemu-system-aarch64", "/fw/edk2.fd", &spec(), host);
        assert!(has_pair(&args, "-accel", "tcg,thread=multi"));
        assert!(has_pair(&args, "-machine", "virt"));
        assert!(!args.contains(&"taskset".to_string()));
    }

    #[test]
    fn pidfile_is_optional() {
        let mut s = spec();
        s.pidfile = None;
        let args = x86_args("q", &s, true);
        assert!(!args.contains(&"-pidfile".to_string()));
    }
}
