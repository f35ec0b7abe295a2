use ulid::Ulid;

use crate::model::ReservationStatus;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Malformed request, rejected before any store access.
    Validation(String),
    NotFound(Ulid),
    Forbidden(Ulid),
    /// The requested unit was taken at commit time. Carries the units that
    /// were still free in the same transaction.
    Conflict {
        unit_number: u32,
        available_units: Vec<u32>,
    },
    InvalidState {
        id: Ulid,
        status: ReservationStatus,
    },
    /// Contention or deadline expiry. Safe to retry with backoff.
    Unavailable(String),
    Storage(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    /// Only store-side faults are worth retrying; everything else is
    /// deterministic for the same input.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Unavailable(_) | EngineError::Storage(_))
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Forbidden(id) => write!(f, "not permitted on {id}"),
            EngineError::Conflict {
                unit_number,
                available_units,
            } => {
                write!(f, "unit {unit_number} is no longer available; available units: ")?;
                write_unit_list(f, available_units)
            }
            EngineError::InvalidState { id, status } => {
                write!(f, "reservation {id} is {}, no further transitions allowed", status.as_str())
            }
            EngineError::Unavailable(msg) => write!(f, "temporarily unavailable: {msg}"),
            EngineError::Storage(e) => write!(f, "storage error: {e}"),
        }
    }
}

/// PostgreSQL array-literal form, `{2,3}`.
pub fn write_unit_list(f: &mut impl std::fmt::Write, units: &[u32]) -> std::fmt::Result {
    f.write_char('{')?;
    for (i, unit) in units.iter().enumerate() {
        if i > 0 {
            f.write_char(',')?;
        }
        write!(f, "{unit}")?;
    }
    f.write_char('}')
}

impl std::error::Error for EngineError {}
