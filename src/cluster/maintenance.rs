use std::path::PathBuf;
use std::sync::Weak;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::registry::ClusterRegistry;

/// Periodic maintenance loop: corruption sweep and sync of every table, then
/// an incremental backup when a backup directory is configured.
pub(crate) async fn run(
    registry: Weak<ClusterRegistry>,
    period: Duration,
    backup_dir: Option<PathBuf>,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately; startup already synced on connect.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(registry) = registry.upgrade() else { break };

        let report = registry.check_and_fix_all().await;
        tracing::info!(
            "Maintenance pass: checked={} repaired={} from_peer={} unrecoverable={} synced={} tombstones_removed={}",
            report.checked,
            report.repaired_locally,
            report.repaired_from_peer,
            report.unrecoverable,
            report.synced,
            report.tombstones_removed
        );

        if let Some(dir) = &backup_dir {
            match registry.backup_all(dir).await {
                Ok(backup) => tracing::info!(
                    "Backup {} written: {} entries, {} files",
                    backup.increment,
                    backup.entries_copied,
                    backup.files_copied
                ),
                Err(e) => tracing::error!("Backup to {} failed: {}", dir.display(), e),
            }
        }
    }
    tracing::info!("Maintenance loop stopped");
}
