//! Saves received files into the output directory.

use crate::utils::atomic_write::atomic_write;
use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};
use tracing::info;

/// Sanitize a (possibly adversarial) name for use as a plain file name.
///
/// Separators and `.`/`..` components are dropped, so the result never
/// leaves the output directory. Falls back to `"file"` when nothing is left.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let parts: Vec<String> = normalized
        .split('/')
        .filter(|s| !s.is_empty() && !matches!(*s, "." | ".."))
        .map(|part| {
            part.chars()
                .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
                .collect::<String>()
        })
        .filter(|s| !s.is_empty() && !s.chars().all(|c| c == '.'))
        .collect();

    match parts.last() {
        Some(last) => last.trim().to_string(),
        None => "file".to_string(),
    }
}

/// First free path for `name` in `dir`: `name`, then `stem (1).ext`, ...
async fn free_path(dir: &Path, name: &str) -> Result<PathBuf> {
    let candidate = dir.join(name);
    if !tokio::fs::try_exists(&candidate).await? {
        return Ok(candidate);
    }
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("file");
    let ext = path.extension().and_then(|s| s.to_str());
    for n in 1u32.. {
        let next = match ext {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(next);
        if !tokio::fs::try_exists(&candidate).await? {
            return Ok(candidate);
        }
    }
    Err(anyhow!("no free file name for {name} in {}", dir.display()))
}

/// Write `bytes` under a sanitized, non-clobbering name in `out_dir`.
pub async fn save_received(out_dir: &Path, file_name: &str, bytes: &[u8]) -> Result<PathBuf> {
    tokio::fs::create_dir_all(out_dir).await?;
    let path = free_path(out_dir, &sanitize_file_name(file_name)).await?;
    atomic_write(&path, bytes).await?;
    info!(
        event = "file_saved",
        path = %path.display(),
        bytes = bytes.len(),
        "Saved received file"
    );
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_strips_traversal() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("..\\..\\boot.ini"), "boot.ini");
        assert_eq!(sanitize_file_name("photo 1.png"), "photo 1.png");
        assert_eq!(sanitize_file_name("rep<o>rt?.pdf"), "report.pdf");
    }

    #[test]
    fn test_sanitize_falls_back() {
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name("../.."), "file");
        assert_eq!(sanitize_file_name("***"), "file");
    }

    #[tokio::test]
    async fn test_save_never_clobbers() {
        let dir = std::env::temp_dir().join(format!("linkdrop_test_dl_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let first = save_received(&dir, "notes.txt", b"one").await.unwrap();
        let second = save_received(&dir, "notes.txt", b"two").await.unwrap();
        assert_eq!(first, dir.join("notes.txt"));
        assert_eq!(second, dir.join("notes (1).txt"));
        assert_eq!(std::fs::read(&first).unwrap(), b"one");
        assert_eq!(std::fs::read(&second).unwrap(), b"two");

        let _ = std::fs::remove_dir_all(&dir);
    }
}
