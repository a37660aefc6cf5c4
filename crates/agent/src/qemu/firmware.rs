//! UEFI firmware and QEMU binary resolution for aarch64 guests.

use skiff_common::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Known distro locations, checked in order after an explicit override.
const UEFI_CANDIDATES: &[&str] = &[
    "/usr/share/qemu-efi-aarch64/QEMU_EFI.fd", // Ubuntu/Debian
    "/usr/share/edk2/aarch64/QEMU_EFI.fd",     // Fedora/RHEL
    "/usr/share/AAVMF/AAVMF_CODE.fd",          // AAVMF
    "/usr/share/qemu/edk2-aarch64-code.fd",    // Arch / generic
    "/opt/homebrew/share/qemu/edk2-aarch64-code.fd",
    "/usr/local/share/qemu/edk2-aarch64-code.fd",
    "/opt/local/share/qemu/edk2-aarch64-code.fd", // MacPorts
];

const QEMU_ARM64_CANDIDATES: &[&str] = &[
    "/opt/homebrew/opt/qemu/bin/qemu-system-aarch64",
    "/usr/local/opt/qemu/bin/qemu-system-aarch64",
    "/opt/homebrew/bin/qemu-system-aarch64",
    "/usr/local/bin/qemu-system-aarch64",
];

/// Locate UEFI firmware for aarch64: explicit override, then distro paths
/// (including versioned Homebrew Cellar installs), then QEMU's own datadir.
/// Missing firmware is a hard error.
pub fn find_uefi_arm64(override_path: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = override_path {
        if p.exists() {
            return Ok(p.to_path_buf());
        }
        warn!(path = %p.display(), "Configured UEFI override does not exist; falling back");
    }

    let mut candidates: Vec<PathBuf> = cellar_candidates();
    candidates.extend(UEFI_CANDIDATES.iter().map(PathBuf::from));

    if let Some(found) = candidates.into_iter().find(|p| p.exists()) {
        return Ok(found);
    }

    let qemu_bin = resolve_qemu_bin_arm64(None);
    if let Some(datadir) = qemu_datadir(&qemu_bin) {
        for name in ["edk2-aarch64-code.fd", "QEMU_EFI.fd"] {
            let cand = datadir.join(name);
            if cand.exists() {
                return Ok(cand);
            }
        }
    }

    Err(Error::Qemu(
        "UEFI firmware for aarch64 not found; install qemu-efi-aarch64 / edk2-aarch64 \
         or set VM_UEFI_ARM64"
            .to_string(),
    ))
}

/// Resolve the aarch64 QEMU binary: override, PATH, then known prefixes.
pub fn resolve_qemu_bin_arm64(override_bin: Option<&str>) -> String {
    if let Some(bin) = override_bin {
        return bin.to_string();
    }
    if let Some(found) = find_in_path("qemu-system-aarch64") {
        return found.display().to_string();
    }
    for p in QEMU_ARM64_CANDIDATES {
        if Path::new(p).exists() {
            return (*p).to_string();
        }
    }
    "qemu-system-aarch64".to_string()
}

/// Versioned Homebrew Cellar installs, newest first.
fn cellar_candidates() -> Vec<PathBuf> {
    let mut out = Vec::new();
    for cellar in ["/opt/homebrew/Cellar/qemu", "/usr/local/Cellar/qemu"] {
        let Ok(entries) = std::fs::read_dir(cellar) else {
            continue;
        };
        let mut versions: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path().join("share/qemu/edk2-aarch64-code.fd"))
            .collect();
        versions.sort();
        versions.reverse();
        out.extend(versions);
    }
    out
}

/// Infer QEMU's datadir (where firmware usually lives) by scanning `-help`
/// and `-version` output for paths containing `share/qemu`.
fn qemu_datadir(qemu_bin: &str) -> Option<PathBuf> {
    for flag in ["-help", "-version"] {
        let Ok(out) = Command::new(qemu_bin).arg(flag).output() else {
            continue;
        };
        let text = String::from_utf8_lossy(&out.stdout);
        for token in text.split_whitespace() {
            if !token.contains("/share/qemu") {
                continue;
            }
            let start = token.find('/').unwrap_or(0);
            let mut cand = PathBuf::from(&token[start..]);
            if cand.is_file() {
                cand = cand.parent()?.to_path_buf();
            }
            if cand.is_dir() {
                debug!(datadir = %cand.display(), "Inferred QEMU datadir");
                return Some(cand);
            }
        }
    }
    None
}

/// Minimal PATH search; avoids shelling out for `command -v` on the host.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(name))
        .find(|cand| cand.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_wins_when_it_exists() {
        let dir = tempfile::TempDir::new().unwrap();
        let fw = dir.path().join("CODE.fd");
        std::fs::write(&fw, b"fw").unwrap();
        let found = find_uefi_arm64(Some(&fw)).unwrap();
        assert_eq!(found, fw);
    }

    #[test]
    fn explicit_bin_override_is_used_verbatim() {
        assert_eq!(
            resolve_qemu_bin_arm64(Some("/custom/qemu-system-aarch64")),
            "/custom/qemu-system-aarch64"
        );
    }

    #[test]
    fn find_in_path_locates_a_real_binary() {
        // `sh` exists on any host the agent can run on.
        assert!(find_in_path("sh").is_some());
        assert!(find_in_path("definitely-not-a-real-binary-xyz").is_none());
    }
}
