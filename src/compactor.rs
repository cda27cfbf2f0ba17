use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::ledger::Ledger;

/// Compact the WAL once `threshold` appends have accumulated. Returns whether it ran.
pub async fn compact_if_due(ledger: &Ledger, threshold: u64) -> bool {
    let pending = ledger.wal_appends_since_compact().await;
    if pending < threshold {
        debug!(pending, threshold, "compaction not due");
        return false;
    }
    match ledger.compact().await {
        Ok(()) => {
            info!(pending, "compacted WAL");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Background task that keeps the WAL from growing without bound.
pub async fn run_compactor(ledger: Arc<Ledger>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        compact_if_due(&ledger, threshold).await;
    }
}
