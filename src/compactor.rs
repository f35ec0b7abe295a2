use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::engine::LedgerStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Compact the reservation log whenever `threshold` appends have piled up
/// since the last rewrite.
pub async fn run_compactor(store: Arc<LedgerStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// One check of the loop above. Returns whether a compaction ran.
pub async fn compact_if_due(store: &LedgerStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        debug!(appends, threshold, "compaction not due");
        return false;
    }
    match store.compact().await {
        Ok(()) => true,
        Err(e) => {
            warn!(appends, "compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::NaiveDate;
    use tokio::time::Instant;
    use ulid::Ulid;

    use super::*;
    use crate::engine::{EngineError, ReservationStore};
    use crate::model::*;
    use crate::wal::Wal;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("stationd_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn reservation(key: SlotKey, unit_number: u32) -> Reservation {
        let start = TimeOfDay::from_hm(10, 0).unwrap();
        let end = TimeOfDay::from_hm(11, 0).unwrap();
        Reservation {
            id: Ulid::new(),
            requester_id: "player-1".into(),
            pool_id: key.pool_id,
            unit: key.unit,
            unit_number,
            date: key.date,
            start,
            end,
            span: Span::new(start.minutes(), end.minutes()),
            duration_hours: 1.0,
            unit_rate: 100.0,
            total_amount: 100.0,
            status: ReservationStatus::Confirmed,
            payment_status: PaymentStatus::Unpaid,
            notes: None,
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = LedgerStore::open(&path).unwrap();
        let key = SlotKey::new(
            Ulid::new(),
            UnitKind::Generic,
            NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
        );
        let deadline = Instant::now() + Duration::from_secs(5);

        let created = store
            .insert_checked(key, deadline, &mut |_: &[Reservation]| {
                Ok::<_, EngineError>(reservation(key, 1))
            })
            .await
            .unwrap();
        store
            .update_checked(created.id, deadline, &mut |current: &Reservation| {
                Ok::<_, EngineError>(Some(Reservation {
                    status: ReservationStatus::Cancelled,
                    ..current.clone()
                }))
            })
            .await
            .unwrap();

        assert!(!compact_if_due(&store, 3).await);
        assert!(compact_if_due(&store, 2).await);
        assert_eq!(store.appends_since_compact().await, 0);

        // One record per reservation, carrying its latest state.
        let events = Wal::replay(&path).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].reservation().status, ReservationStatus::Cancelled);
    }

    #[tokio::test]
    async fn in_memory_store_never_compacts() {
        let store = LedgerStore::in_memory();
        assert!(!compact_if_due(&store, 1).await);
    }
}
