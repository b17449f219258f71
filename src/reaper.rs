use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::Ms;

fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Background task that periodically prunes bookings past the retention
/// horizon. A booking that ended more than `retention_ms` ago can no longer
/// move any cap a client could hit, so dropping it bounds memory and WAL
/// growth.
pub async fn run_pruner(engine: Arc<Engine>, retention_ms: Ms) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let cutoff = now_ms().saturating_sub(retention_ms);
        let expired = engine.collect_expired_bookings(cutoff);
        for (booking_id, _subject_id) in expired {
            match engine.cancel_booking(booking_id).await {
                Ok(_) => info!("pruned booking {booking_id} past retention"),
                Err(e) => {
                    // May already have been cancelled — that's fine
                    tracing::debug!("pruner skip {booking_id}: {e}");
                }
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate
/// since the last compaction.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if engine.wal_appends_since_compact().await >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("WAL compacted"),
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}
