use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::{Engine, EngineError};

/// Compact the journal if at least `threshold` events were appended since
/// the last compaction. Returns whether it ran.
pub async fn maybe_compact(engine: &Engine, threshold: u64) -> Result<bool, EngineError> {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        return Ok(false);
    }
    engine.compact_wal().await?;
    info!("journal compacted after {appends} appends");
    Ok(true)
}

/// Background task that keeps the journal from growing without bound.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        if let Err(e) = maybe_compact(&engine, threshold).await {
            tracing::error!("journal compaction failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveTime};
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("bayslot_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let engine = Engine::new(test_wal_path("threshold.wal")).unwrap();
        let slot = Ulid::new();
        let start = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let end = NaiveTime::from_hms_opt(9, 30, 0).unwrap();
        engine.create_slot(slot, start, end, 2, None).await.unwrap();

        assert!(!maybe_compact(&engine, 3).await.unwrap());

        engine.toggle_slot(slot).await.unwrap();
        engine.toggle_slot(slot).await.unwrap();
        assert!(maybe_compact(&engine, 3).await.unwrap());
        assert_eq!(engine.wal_appends_since_compact().await, 0);

        // state untouched by compaction
        let day = NaiveDate::from_ymd_opt(2026, 11, 18).unwrap();
        let rows = engine.slots_for_date(day).await;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].is_available);
    }
}
