mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod pricing;
mod queries;
mod store;

pub use availability::available_units;
pub use error::{write_unit_list, EngineError};
pub use pricing::{quote, resolve_rate, Quote};
pub use store::{InsertBody, LedgerStore, ReservationStore, UpdateBody, DEFAULT_MAX_ATTEMPTS};

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use tokio::time::Instant;
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::pool::{Pool, PoolDirectory};

pub const DEFAULT_TXN_DEADLINE: Duration = Duration::from_secs(2);

/// The verified identity a call is made under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub id: String,
}

impl Caller {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

/// A candidate interval on one pool, as callers phrase it.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotQuery {
    pub pool_id: Ulid,
    pub unit: UnitKind,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub end: TimeOfDay,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReservationRequest {
    pub slot: SlotQuery,
    pub unit_number: u32,
    pub notes: Option<String>,
}

/// Advisory answer for one interval.
#[derive(Debug, Clone, PartialEq)]
pub struct AvailabilityCheck {
    pub available: bool,
    pub duration_hours: f64,
    pub unit_rate: f64,
    pub estimated_cost: f64,
    pub capacity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitAvailability {
    pub available_units: Vec<u32>,
    pub capacity: u32,
    pub first_available: Option<u32>,
}

/// A reservation plus its pool's display name, when the pool still exists.
#[derive(Debug, Clone, PartialEq)]
pub struct ReservationSummary {
    pub reservation: Reservation,
    pub pool_name: Option<String>,
}

/// Availability, reservation writes and lifecycle over an injected store and
/// pool directory. Holds no reservation state of its own.
pub struct Engine {
    store: Arc<dyn ReservationStore>,
    pools: Arc<dyn PoolDirectory>,
    pub notify: Arc<NotifyHub>,
    txn_deadline: Duration,
}

impl Engine {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        pools: Arc<dyn PoolDirectory>,
        notify: Arc<NotifyHub>,
    ) -> Self {
        Self {
            store,
            pools,
            notify,
            txn_deadline: DEFAULT_TXN_DEADLINE,
        }
    }

    pub fn with_txn_deadline(mut self, deadline: Duration) -> Self {
        self.txn_deadline = deadline;
        self
    }

    pub(super) async fn pool(&self, id: Ulid) -> Result<Arc<Pool>, EngineError> {
        self.pools.get_pool(id).await.ok_or(EngineError::NotFound(id))
    }

    pub(super) fn deadline(&self) -> Instant {
        Instant::now() + self.txn_deadline
    }

    /// Load a reservation the caller is allowed to see: its requester or the
    /// pool's manager. Also returns the pool when it still exists. The
    /// caller's identity is validated before the store is read.
    pub(super) async fn owned_or_managed(
        &self,
        caller: &Caller,
        id: Ulid,
    ) -> Result<(Reservation, Option<Arc<Pool>>), EngineError> {
        conflict::check_caller(caller)?;
        let reservation = self.store.get(id).await?.ok_or(EngineError::NotFound(id))?;
        let pool = self.pools.get_pool(reservation.pool_id).await;
        let manages = pool.as_ref().is_some_and(|p| p.is_managed_by(&caller.id));
        if reservation.requester_id != caller.id && !manages {
            return Err(EngineError::Forbidden(id));
        }
        Ok((reservation, pool))
    }

    /// Like `owned_or_managed`, but only the manager passes.
    pub(super) async fn managed(
        &self,
        caller: &Caller,
        id: Ulid,
    ) -> Result<Reservation, EngineError> {
        conflict::check_caller(caller)?;
        let reservation = self.store.get(id).await?.ok_or(EngineError::NotFound(id))?;
        let manages = self
            .pools
            .get_pool(reservation.pool_id)
            .await
            .is_some_and(|p| p.is_managed_by(&caller.id));
        if !manages {
            return Err(EngineError::Forbidden(id));
        }
        Ok(reservation)
    }

    pub(super) fn publish(&self, event: Event) {
        let pool_id = event.reservation().pool_id;
        self.notify.send(pool_id, &event);
    }
}
