use std::{io, path::{Path, PathBuf}, time::{Duration, SystemTime}};
use tokio::task::JoinHandle;

use crate::config::ReaperCfg;

/// Deletes regular files in `dir` last modified more than `max_age` ago.
/// Catches scratch files orphaned by a crash mid-request.
pub async fn reap_once(dir: &Path, max_age: Duration) -> io::Result<usize> {
    let mut rd = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };
    let now = SystemTime::now();
    let mut removed = 0;
    while let Some(ent) = rd.next_entry().await? {
        let meta = match ent.metadata().await {
            Ok(m) => m,
            Err(_) => continue,
        };
        if !meta.is_file() { continue; }
        let age = meta.modified().ok().and_then(|t| now.duration_since(t).ok()).unwrap_or_default();
        if age <= max_age { continue; }

        match tokio::fs::remove_file(ent.path()).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %ent.path().display(), error = %e, "failed to reap scratch file"),
        }
    }
    Ok(removed)
}

pub fn spawn(dir: PathBuf, cfg: ReaperCfg) -> JoinHandle<()> {
    let interval = Duration::from_secs(cfg.interval_secs.max(1));
    let max_age = Duration::from_secs(cfg.max_age_secs);
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(interval);
        loop {
            tick.tick().await;
            match reap_once(&dir, max_age).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(removed = n, dir = %dir.display(), "reaped orphaned scratch files"),
                Err(e) => tracing::error!(dir = %dir.display(), error = %e, "scratch reaper failed"),
            }
        }
    })
}
