use std::collections::HashMap;

use chrono::NaiveDate;
use futures::future::join_all;
use tracing::debug;
use ulid::Ulid;

use crate::model::*;

use super::availability::available_units;
use super::conflict::{check_caller, check_slot, CheckedSlot};
use super::pricing::quote;
use super::{
    AvailabilityCheck, Caller, Engine, EngineError, ReservationSummary, SlotQuery,
    UnitAvailability,
};

impl Engine {
    /// Free units for a checked slot. Pools with no units of the kind, and
    /// pools not taking reservations, answer without reading the store.
    async fn free_units(&self, slot: &CheckedSlot) -> Result<Vec<u32>, EngineError> {
        if slot.capacity == 0 || !slot.pool.is_active {
            return Ok(Vec::new());
        }
        let active = self.store.active_on(slot.key).await?;
        Ok(available_units(&active, &slot.span, slot.capacity))
    }

    /// Advisory: is any unit free, and what would it cost. May be stale by
    /// the time a write is attempted.
    pub async fn check_availability(&self, query: &SlotQuery) -> Result<AvailabilityCheck, EngineError> {
        let pool = self.pool(query.pool_id).await?;
        let slot = check_slot(pool, query)?;
        let free = self.free_units(&slot).await?;
        let price = quote(&slot.span, &slot.pool.rates, slot.key.unit);
        debug!(pool = %slot.key.pool_id, unit = %slot.key.unit, free = free.len(), "availability checked");
        Ok(AvailabilityCheck {
            available: !free.is_empty(),
            duration_hours: price.duration_hours,
            unit_rate: price.unit_rate,
            estimated_cost: price.total_amount,
            capacity: slot.capacity,
        })
    }

    /// Advisory: which unit numbers are free, lowest first.
    pub async fn list_available_units(&self, query: &SlotQuery) -> Result<UnitAvailability, EngineError> {
        let pool = self.pool(query.pool_id).await?;
        let slot = check_slot(pool, query)?;
        let available_units = self.free_units(&slot).await?;
        Ok(UnitAvailability {
            first_available: available_units.first().copied(),
            available_units,
            capacity: slot.capacity,
        })
    }

    pub async fn get_reservation(&self, caller: &Caller, id: Ulid) -> Result<Reservation, EngineError> {
        self.owned_or_managed(caller, id)
            .await
            .map(|(reservation, _)| reservation)
    }

    /// The caller's own reservations, each labelled with its pool's name.
    pub async fn list_my_reservations(
        &self,
        caller: &Caller,
    ) -> Result<Vec<ReservationSummary>, EngineError> {
        check_caller(caller)?;
        let reservations = self.store.list_for_requester(&caller.id).await?;

        let mut pool_ids: Vec<Ulid> = reservations.iter().map(|r| r.pool_id).collect();
        pool_ids.sort_unstable();
        pool_ids.dedup();
        let lookups = pool_ids.iter().map(|id| self.pools.get_pool(*id));
        let names: HashMap<Ulid, String> = pool_ids
            .iter()
            .copied()
            .zip(join_all(lookups).await)
            .filter_map(|(id, pool)| pool.map(|p| (id, p.name.clone())))
            .collect();

        Ok(reservations
            .into_iter()
            .map(|reservation| ReservationSummary {
                pool_name: names.get(&reservation.pool_id).cloned(),
                reservation,
            })
            .collect())
    }

    /// Manager view of one pool's day, every status included.
    pub async fn list_pool_reservations(
        &self,
        caller: &Caller,
        pool_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, EngineError> {
        check_caller(caller)?;
        let pool = self.pool(pool_id).await?;
        if !pool.is_managed_by(&caller.id) {
            return Err(EngineError::Forbidden(pool_id));
        }
        self.store.list_for_pool(pool_id, date).await
    }
}
