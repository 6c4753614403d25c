use std::path::Path;
use tracing::{info, warn};

/// Remove a scratch directory, logging instead of failing.
pub async fn remove_work_dir(path: &Path) {
    if !path.exists() {
        return;
    }
    if let Err(e) = tokio::fs::remove_dir_all(path).await {
        warn!("Failed to cleanup {}: {}", path.display(), e);
    }
}

/// Kill all processes in a process group (best-effort).
pub async fn kill_process_group(pgid: u32) {
    let _ = tokio::process::Command::new("kill")
        .args(["-9", &format!("-{}", pgid)])
        .output()
        .await;
}

/// Remove directories under `base` starting with `prefix` that are older
/// than `max_age_secs`, left behind by interrupted runs.
pub async fn reap_stale_work_dirs(base: &Path, prefix: &str, max_age_secs: u64) {
    let mut entries = match tokio::fs::read_dir(base).await {
        Ok(e) => e,
        Err(_) => return,
    };

    let now = std::time::SystemTime::now();
    let mut reaped = 0u32;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !path.is_dir() || !entry.file_name().to_string_lossy().starts_with(prefix) {
            continue;
        }
        let modified = match tokio::fs::metadata(&path).await.and_then(|m| m.modified()) {
            Ok(m) => m,
            Err(_) => continue,
        };
        let age = now.duration_since(modified).unwrap_or_default();
        if age.as_secs() >= max_age_secs {
            remove_work_dir(&path).await;
            reaped += 1;
        }
    }

    if reaped > 0 {
        info!("Reaped {} stale work directories in {}", reaped, base.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_remove_work_dir_nonexistent() {
        remove_work_dir(Path::new("/tmp/nonexistent_gen_eval_dir_xyz")).await;
    }

    #[tokio::test]
    async fn test_remove_work_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("code-eval-test");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("candidate.py"), "print(1)")
            .await
            .unwrap();
        assert!(dir.exists());
        remove_work_dir(&dir).await;
        assert!(!dir.exists());
    }

    #[tokio::test]
    async fn test_reap_only_matching_prefix() {
        let tmp = tempfile::tempdir().unwrap();
        let stale = tmp.path().join("code-eval-old");
        let other = tmp.path().join("keep-me");
        tokio::fs::create_dir_all(&stale).await.unwrap();
        tokio::fs::create_dir_all(&other).await.unwrap();

        reap_stale_work_dirs(tmp.path(), "code-eval-", 0).await;
        assert!(!stale.exists());
        assert!(other.exists());
    }
}
