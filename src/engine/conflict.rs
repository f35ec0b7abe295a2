use std::sync::Arc;

use crate::limits::{MAX_NOTES_LEN, MAX_REQUESTER_LEN};
use crate::model::*;
use crate::pool::Pool;

use super::{Caller, EngineError, SlotQuery};

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// A slot query that passed validation against its pool.
pub(crate) struct CheckedSlot {
    pub pool: Arc<Pool>,
    pub key: SlotKey,
    pub span: Span,
    pub capacity: u32,
}

/// Shared by the advisory reads and the writer: the pool is open that day
/// and the interval resolves inside its hours.
pub(crate) fn check_slot(pool: Arc<Pool>, query: &SlotQuery) -> Result<CheckedSlot, EngineError> {
    let hours = pool.operating_hours(query.date).ok_or_else(|| {
        EngineError::validation(format!("pool is closed on {}", query.date))
    })?;
    let span = hours
        .resolve(query.start, query.end)
        .map_err(|e| EngineError::validation(e.to_string()))?;
    let capacity = pool.capacity(query.unit);
    Ok(CheckedSlot {
        key: SlotKey::new(pool.id, query.unit, query.date),
        span,
        capacity,
        pool,
    })
}

/// Writer-only preconditions on top of `check_slot`.
pub(crate) fn check_reservable(
    slot: &CheckedSlot,
    unit_number: u32,
    notes: Option<&str>,
) -> Result<(), EngineError> {
    if !slot.pool.is_active {
        return Err(EngineError::validation("pool is not accepting reservations"));
    }
    if unit_number == 0 || unit_number > slot.capacity {
        return Err(EngineError::validation(format!(
            "unit {unit_number} outside 1..={} for {}",
            slot.capacity, slot.key.unit
        )));
    }
    if notes.is_some_and(|n| n.len() > MAX_NOTES_LEN) {
        return Err(EngineError::validation("notes too long"));
    }
    Ok(())
}

pub(crate) fn check_caller(caller: &Caller) -> Result<(), EngineError> {
    if caller.id.trim().is_empty() {
        return Err(EngineError::validation("missing requester identity"));
    }
    if caller.id.len() > MAX_REQUESTER_LEN {
        return Err(EngineError::validation("requester identity too long"));
    }
    Ok(())
}
