//! Helpers for produced files: naming rules, HTTP headers and the output
//! directory probes used by readiness.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use nix::sys::statvfs::statvfs;
use uuid::Uuid;

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Produced files are named `<uuid>.<ext>`. Anything else, including path
/// separators, never resolves inside the output directory.
pub fn is_valid_filename(filename: &str) -> bool {
    if filename.contains(['/', '\\']) || filename.starts_with('.') {
        return false;
    }
    let stem = filename.split_once('.').map_or(filename, |(stem, _)| stem);
    Uuid::parse_str(stem).is_ok()
}

pub fn content_type_for_filename(filename: &str) -> &'static str {
    let extension = Path::new(filename)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "aac" => "audio/aac",
        "wav" => "audio/wav",
        "ogg" | "opus" => "audio/ogg",
        "flac" => "audio/flac",
        "webm" => "audio/webm",
        _ => "application/octet-stream",
    }
}

pub fn build_content_disposition(filename: &str) -> String {
    let safe_ascii = sanitize_ascii_filename(filename);
    format!(
        "attachment; filename=\"{safe_ascii}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}

fn sanitize_ascii_filename(value: &str) -> String {
    let sanitized: String = value
        .chars()
        .map(|character| {
            if character.is_ascii_alphanumeric() || matches!(character, '.' | '-' | '_') {
                character
            } else {
                '_'
            }
        })
        .collect();

    if sanitized.is_empty() {
        "download.bin".to_string()
    } else {
        sanitized
    }
}

/// Free space available to unprivileged users on the filesystem holding
/// `dir`, in whole MiB.
pub async fn free_disk_mb(dir: &Path) -> std::io::Result<u64> {
    let dir = dir.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let stats = statvfs(&dir).map_err(std::io::Error::from)?;
        #[allow(clippy::unnecessary_cast)]
        let free_bytes = (stats.blocks_available() as u64).saturating_mul(stats.fragment_size() as u64);
        Ok(free_bytes / BYTES_PER_MB)
    })
    .await
    .map_err(|error| std::io::Error::other(error.to_string()))?
}

/// Writes and removes a hidden probe file in `dir`.
pub async fn probe_writable(dir: &Path) -> std::io::Result<()> {
    let probe: PathBuf = dir.join(format!("._rw_test_{}", Uuid::new_v4().simple()));
    tokio::fs::write(&probe, b"ok").await?;
    match tokio::fs::remove_file(&probe).await {
        Err(error) if error.kind() != ErrorKind::NotFound => Err(error),
        _ => Ok(()),
    }
}
