//! Guest filesystem operations over SFTP and remote exec: batched uploads,
//! directory listing, reads, downloads, and grep search.

use crate::ssh::{exec_capture, exec_checked, SshEntry};
use base64::Engine;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use skiff_common::types::{
    basename, ElementResponse, FileContent, ListDirItem, PathType, SearchHit, SearchRequest,
    UploadFailure, VmUploadFiles,
};
use skiff_common::{Error, Result};
use std::collections::HashSet;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

/// POSIX single-quote escaping for remote shell commands.
pub fn shell_quote(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':'))
    {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Normalize a POSIX path: collapse `//` and `.` segments, resolve `..`
/// without escaping the root.
pub fn posix_normpath(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for seg in path.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() && !absolute {
                    parts.push("..");
                }
            }
            other => parts.push(other),
        }
    }
    let joined = parts.join("/");
    if absolute {
        format!("/{joined}")
    } else if joined.is_empty() {
        ".".to_string()
    } else {
        joined
    }
}

/// Join a client-supplied relative path under `dest` and reject anything
/// that resolves outside it.
pub fn norm_join(dest: &str, rel: &str) -> Result<String> {
    let rel = rel.trim_start_matches('/');
    let dest_norm = posix_normpath(dest);
    let full = posix_normpath(&format!("{}/{}", dest_norm.trim_end_matches('/'), rel));
    let prefix = format!("{}/", dest_norm.trim_end_matches('/'));
    if full != dest_norm && !full.starts_with(&prefix) {
        return Err(Error::Validation(format!("insecure path in batch: {rel:?}")));
    }
    Ok(full)
}

/// mkdir -p over SFTP.
async fn sftp_mkdirs(entry: &SshEntry, remote_dir: &str) -> Result<()> {
    let remote_dir = remote_dir.trim();
    if remote_dir.is_empty() || remote_dir == "." || remote_dir == "/" {
        return Ok(());
    }

    let mut accum = String::new();
    if remote_dir.starts_with('/') {
        accum.push('/');
    }
    for seg in remote_dir.split('/').filter(|s| !s.is_empty()) {
        if accum.is_empty() || accum == "/" {
            accum.push_str(seg);
        } else {
            accum.push('/');
            accum.push_str(seg);
        }
        if entry
            .sftp
            .try_exists(&accum)
            .await
            .map_err(|e| Error::Ssh(format!("sftp stat failed: {e}")))?
        {
            continue;
        }
        entry
            .sftp
            .create_dir(&accum)
            .await
            .map_err(|e| Error::Ssh(format!("sftp mkdir {accum} failed: {e}")))?;
    }
    Ok(())
}

/// Wipe the destination's children (dotfiles included) after ensuring it
/// exists.
async fn clean_dest(entry: &SshEntry, dest: &str) -> Result<()> {
    let q = shell_quote(dest);
    let cmd = format!("mkdir -p {q} && rm -rf {q}/* {q}/.[!.]* {q}/..?* || true");
    exec_checked(&entry.handle, &cmd, Some(Duration::from_secs(30))).await?;
    Ok(())
}

async fn write_one_file(
    entry: &SshEntry,
    full_path: &str,
    data: &[u8],
    mode: u32,
) -> Result<()> {
    if let Some((parent, _)) = full_path.rsplit_once('/') {
        if !parent.is_empty() {
            sftp_mkdirs(entry, parent).await?;
        }
    }

    let flags = OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE;
    let mut rf = entry
        .sftp
        .open_with_flags(full_path, flags)
        .await
        .map_err(|e| Error::Ssh(format!("sftp open {full_path} failed: {e}")))?;
    rf.write_all(data)
        .await
        .map_err(|e| Error::Ssh(format!("sftp write {full_path} failed: {e}")))?;
    rf.flush().await.ok();
    rf.shutdown().await.ok();

    let attrs = FileAttributes {
        permissions: Some(mode),
        ..Default::default()
    };
    if entry.sftp.set_metadata(full_path, attrs).await.is_err() {
        // Some sftp servers refuse setstat; fall back to chmod over exec.
        let cmd = format!("chmod {:o} {}", mode, shell_quote(full_path));
        exec_checked(&entry.handle, &cmd, Some(Duration::from_secs(10))).await?;
    }
    Ok(())
}

/// Upload a batch of files under `dest_path`. Per-file failures accumulate;
/// files whose normalized path escapes the destination are never written.
pub async fn upload_files(entry: &SshEntry, req: &VmUploadFiles) -> Result<ElementResponse> {
    let dest = if req.dest_path.is_empty() {
        "/app".to_string()
    } else {
        req.dest_path.clone()
    };
    let dest = match entry.sftp.canonicalize(&dest).await {
        Ok(p) => p,
        Err(_) => posix_normpath(&dest),
    };

    if req.clean {
        clean_dest(entry, &dest).await?;
    } else {
        let cmd = format!("mkdir -p {}", shell_quote(&dest));
        exec_checked(&entry.handle, &cmd, Some(Duration::from_secs(30))).await?;
    }

    let mut failed: Vec<UploadFailure> = Vec::new();
    for file in &req.files {
        let result: Result<()> = async {
            let full = norm_join(&dest, &file.path)?;
            let data: Vec<u8> = if let Some(text) = &file.text {
                text.clone().into_bytes()
            } else if let Some(b64) = &file.content_b64 {
                base64::engine::general_purpose::STANDARD
                    .decode(b64)
                    .map_err(|e| Error::Validation(format!("invalid base64: {e}")))?
            } else {
                Vec::new()
            };
            write_one_file(entry, &full, &data, file.mode).await
        }
        .await;

        if let Err(e) = result {
            warn!(path = %file.path, error = %e, "Upload entry failed");
            failed.push(UploadFailure {
                path: file.path.clone(),
                reason: e.to_string(),
            });
        }
    }

    if failed.is_empty() {
        Ok(ElementResponse::ok())
    } else {
        Ok(ElementResponse {
            ok: false,
            reason: format!("{} file(s) failed", failed.len()),
            failed,
        })
    }
}

/// Parse `find -printf '%p||%y\n'` output.
pub fn parse_find_output(output: &str) -> Vec<ListDirItem> {
    let mut items = Vec::new();
    for line in output.lines() {
        let Some((path, kind)) = line.split_once("||") else {
            continue;
        };
        items.push(ListDirItem {
            path: path.to_string(),
            name: basename(path),
            path_type: if kind == "d" {
                PathType::Directory
            } else {
                PathType::File
            },
        });
    }
    items
}

/// List one or more roots up to `depth`, deduplicated across roots.
pub async fn list_dirs(entry: &SshEntry, paths: &[String], depth: u32) -> Result<Vec<ListDirItem>> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut items = Vec::new();
    for root in paths {
        let cmd = format!(
            "find {} -maxdepth {} -printf '%p||%y\\n' 2>/dev/null || true",
            shell_quote(root),
            depth
        );
        let out = exec_capture(&entry.handle, &cmd, Some(Duration::from_secs(30))).await?;
        for item in parse_find_output(&out.stdout_lossy()) {
            if seen.insert(item.path.clone()) {
                items.push(item);
            }
        }
    }
    Ok(items)
}

/// Read a file as UTF-8 (lossy). Missing files return `found: false` rather
/// than an error.
pub async fn read_file(entry: &SshEntry, path: &str) -> FileContent {
    let Ok(mut rf) = entry.sftp.open_with_flags(path, OpenFlags::READ).await else {
        return FileContent::missing(path);
    };
    let mut data = Vec::new();
    if rf.read_to_end(&mut data).await.is_err() {
        return FileContent::missing(path);
    }
    let content = String::from_utf8_lossy(&data).into_owned();
    FileContent {
        name: basename(path),
        length: content.len(),
        content,
        found: true,
    }
}

/// mkdir -p through the remote shell.
pub async fn create_dir(entry: &SshEntry, path: &str) -> Result<ElementResponse> {
    let cmd = format!("mkdir -p {}", shell_quote(path));
    exec_checked(&entry.handle, &cmd, Some(Duration::from_secs(10))).await?;
    Ok(ElementResponse::ok())
}

/// Download one regular file; directories are rejected.
pub async fn download_file(entry: &SshEntry, path: &str) -> Result<(Vec<u8>, String, String)> {
    let attrs = entry
        .sftp
        .metadata(path)
        .await
        .map_err(|_| Error::not_found("file", path))?;
    if attrs.is_dir() {
        return Err(Error::Validation(
            "path is a directory; use /download-folder".into(),
        ));
    }

    let mut rf = entry
        .sftp
        .open_with_flags(path, OpenFlags::READ)
        .await
        .map_err(|e| Error::Upstream(format!("cannot open {path}: {e}")))?;
    let mut data = Vec::new();
    rf.read_to_end(&mut data)
        .await
        .map_err(|e| Error::Upstream(format!("cannot read {path}: {e}")))?;

    let name = basename(path);
    let media_type = mime_guess::from_path(&name)
        .first_or_octet_stream()
        .essence_str()
        .to_string();
    Ok((data, media_type, name))
}

async fn zip_available(entry: &SshEntry) -> bool {
    let cmd = "sh -lc 'command -v zip >/dev/null 2>&1 && echo OK || echo NO'";
    match exec_capture(&entry.handle, cmd, Some(Duration::from_secs(10))).await {
        Ok(out) => out.stdout_lossy().trim() == "OK",
        Err(_) => false,
    }
}

/// Build an archive of `root` inside the guest and return its bytes.
/// A nonzero exit of the archive command is an error regardless of stdout.
pub async fn download_folder(
    entry: &SshEntry,
    root: &str,
    prefer_fmt: &str,
) -> Result<(Vec<u8>, String, String)> {
    entry
        .sftp
        .metadata(root)
        .await
        .map_err(|_| Error::not_found("directory", root))?;

    let mut fmt = prefer_fmt.to_string();
    if fmt == "zip" && !zip_available(entry).await {
        fmt = "tar.gz".to_string();
    }

    let base = basename(root.trim_end_matches('/'));
    let base = if base == "/" || base.is_empty() {
        "archive".to_string()
    } else {
        base
    };
    let quoted = shell_quote(root);
    let (cmd, media_type, filename) = match fmt.as_str() {
        "zip" => (
            format!("sh -lc 'cd {quoted} && zip -qr - .'"),
            "application/zip",
            format!("{base}.zip"),
        ),
        "tar.gz" => (
            format!("sh -lc 'tar -C {quoted} -czf - .'"),
            "application/gzip",
            format!("{base}.tar.gz"),
        ),
        other => {
            return Err(Error::Validation(format!("invalid archive format: {other}")));
        }
    };

    let out = exec_capture(&entry.handle, &cmd, None).await?;
    match out.exit_status {
        Some(0) => {}
        status => {
            return Err(Error::Upstream(format!(
                "archive command failed ({status:?}): {}",
                out.stderr_lossy()
            )));
        }
    }
    if out.stdout.is_empty() {
        return Err(Error::Upstream("archive command produced no output".into()));
    }
    Ok((out.stdout, media_type.to_string(), filename))
}

/// Assemble the grep invocation for a search request.
pub fn build_search_command(req: &SearchRequest) -> String {
    let mut parts: Vec<String> = vec!["grep".into(), "-RInI".into()];
    if req.case_insensitive {
        parts.push("-i".into());
    }
    for d in &req.exclude_dirs {
        if !d.trim().is_empty() {
            parts.push(format!("--exclude-dir={d}"));
        }
    }
    for g in &req.include_globs {
        let g = g.trim();
        if g.is_empty() || g == "*" {
            continue;
        }
        parts.push(format!("--include={g}"));
    }
    parts.push("-e".into());
    parts.push(req.pattern.clone());
    parts.push(req.root.clone());
    parts.iter().map(|p| shell_quote(p)).collect::<Vec<_>>().join(" ")
}

/// Parse grep output (`file:line:content`) into hits grouped by file,
/// bounded by `max_results_total`.
pub fn parse_grep_output(output: &str, max_results_total: Option<usize>) -> Vec<SearchHit> {
    let mut order: Vec<String> = Vec::new();
    let mut groups: std::collections::HashMap<String, Vec<String>> =
        std::collections::HashMap::new();
    let mut total = 0usize;

    for line in output.lines() {
        let mut split = line.splitn(3, ':');
        let (Some(file), Some(lineno), Some(content)) = (split.next(), split.next(), split.next())
        else {
            continue;
        };
        if !groups.contains_key(file) {
            order.push(file.to_string());
        }
        groups
            .entry(file.to_string())
            .or_default()
            .push(format!("L{lineno}: {content}"));

        total += 1;
        if let Some(cap) = max_results_total {
            if total >= cap {
                break;
            }
        }
    }

    order
        .into_iter()
        .map(|path| SearchHit {
            matches: groups.remove(&path).unwrap_or_default(),
            path,
        })
        .collect()
}

/// Run a grep search inside the guest. grep exits 1 on no matches, which is
/// an empty result, not an error.
pub async fn search(entry: &SshEntry, req: &SearchRequest) -> Result<Vec<SearchHit>> {
    let cmd = build_search_command(req);
    debug!(command = %cmd, "Remote search");
    let out = exec_capture(
        &entry.handle,
        &cmd,
        Some(Duration::from_secs(req.timeout_seconds)),
    )
    .await?;
    Ok(parse_grep_output(&out.stdout_lossy(), req.max_results_total))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_passes_safe_strings_and_escapes_the_rest() {
        assert_eq!(shell_quote("/app/src"), "/app/src");
        assert_eq!(shell_quote("a b"), "'a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn normpath_collapses_and_resolves() {
        assert_eq!(posix_normpath("/app//x/./y"), "/app/x/y");
        assert_eq!(posix_normpath("/app/x/../y"), "/app/y");
        assert_eq!(posix_normpath("/app/../../etc"), "/etc");
        assert_eq!(posix_normpath("/"), "/");
    }

    #[test]
    fn norm_join_accepts_children_and_rejects_escapes() {
        assert_eq!(norm_join("/app", "src/main.rs").unwrap(), "/app/src/main.rs");
        assert_eq!(norm_join("/app", "/abs/led.rs").unwrap(), "/app/abs/led.rs");
        assert_eq!(norm_join("/app", "a/../b").unwrap(), "/app/b");
        assert!(norm_join("/app", "../etc/passwd").is_err());
        assert!(norm_join("/app", "a/../../etc").is_err());
    }

    #[test]
    fn find_output_parses_types_and_names() {
        let out = "/app||d\n/app/main.py||f\n/app/src||d\nnoise\n";
        let items = parse_find_output(out);
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].path, "/app");
        assert_eq!(items[0].path_type, PathType::Directory);
        assert_eq!(items[1].name, "main.py");
        assert_eq!(items[1].path_type, PathType::File);
        assert_eq!(items[2].name, "src");
    }

    #[test]
    fn search_command_includes_flags_in_order() {
        let req = SearchRequest {
            pattern: "fn main".into(),
            root: "/app".into(),
            case_insensitive: true,
            include_globs: vec!["*.rs".into(), "*".into(), "".into()],
            exclude_dirs: vec![".git".into(), "target".into()],
            max_results_total: None,
            timeout_seconds: 10,
        };
        let cmd = build_search_command(&req);
        assert!(cmd.starts_with("grep -RInI -i"));
        assert!(cmd.contains("--exclude-dir=.git"));
        assert!(cmd.contains("--exclude-dir=target"));
        assert!(cmd.contains("--include=*.rs"));
        // "*" and "" globs are dropped.
        assert!(!cmd.contains("'--include=*'"));
        assert!(cmd.contains("-e 'fn main' /app"));
    }

    #[test]
    fn grep_output_groups_by_file_and_caps_total() {
        let out = "\
/app/a.py:1:import os
/app/a.py:9:print(os)
/app/b.py:3:x = 1
garbage line
/app/c.py:7:y = 2
";
        let hits = parse_grep_output(out, None);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits[0].path, "/app/a.py");
        assert_eq!(hits[0].matches, vec!["L1: import os", "L9: print(os)"]);
        assert_eq!(hits[1].matches, vec!["L3: x = 1"]);

        let capped = parse_grep_output(out, Some(2));
        let total: usize = capped.iter().map(|h| h.matches.len()).sum();
        assert_eq!(total, 2);
    }

    #[test]
    fn grep_content_with_colons_survives() {
        let hits = parse_grep_output("/app/a.rs:4:let x: u32 = 1;\n", None);
        assert_eq!(hits[0].matches, vec!["L4: let x: u32 = 1;"]);
    }
}
