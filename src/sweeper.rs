//! Periodic removal of aged output files.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tokio::{task::JoinHandle, time::interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub failed: usize,
}

/// Deletes regular files directly under `dir` whose modification age exceeds
/// `max_age`. A zero `max_age` removes every finished file. Hidden entries
/// (the staging area among them) and directories are left alone.
pub async fn sweep_once(dir: &Path, max_age: Duration) -> SweepReport {
    let mut report = SweepReport::default();

    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!(dir = ?dir, "Could not open output directory for cleanup: {error}");
            }
            return report;
        }
    };

    let now = SystemTime::now();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not iterate output directory for cleanup: {error}");
                break;
            }
        };

        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        // Vanished between listing and stat: somebody else already removed it.
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) if error.kind() == ErrorKind::NotFound => continue,
            Err(error) => {
                warn!(path = ?path, "Could not read metadata: {error}");
                report.failed += 1;
                continue;
            }
        };

        if !metadata.is_file() {
            continue;
        }

        let modified_at = match metadata.modified() {
            Ok(value) => value,
            Err(error) => {
                warn!(path = ?path, "Could not read modification time: {error}");
                report.failed += 1;
                continue;
            }
        };

        let age = now.duration_since(modified_at).unwrap_or(Duration::ZERO);
        if !max_age.is_zero() && age <= max_age {
            continue;
        }

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = ?path, age_secs = age.as_secs(), "Removed expired file");
                report.removed += 1;
            }
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => {
                warn!(path = ?path, "Cleanup failed: {error}");
                report.failed += 1;
            }
        }
    }

    report
}

/// Runs [`sweep_once`] immediately and then every `every` until `cancel`
/// fires.
pub fn spawn(
    dir: PathBuf,
    max_age: Duration,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut ticker = interval(every);

    tokio::spawn(async move {
        info!(
            dir = ?dir,
            max_age_secs = max_age.as_secs(),
            interval_secs = every.as_secs(),
            "Retention sweeper started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = sweep_once(&dir, max_age).await;
                    if report.removed > 0 || report.failed > 0 {
                        info!(
                            removed = report.removed,
                            failed = report.failed,
                            "Cleanup removed expired files"
                        );
                    }
                }
            }
        }
        info!("Retention sweeper stopped");
    })
}
