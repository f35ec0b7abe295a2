use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{RESERVATIONS_CREATED_TOTAL, RESERVATION_CONFLICTS_TOTAL};

use super::availability::available_units;
use super::conflict::{check_caller, check_reservable, check_slot, now_ms};
use super::pricing::quote;
use super::{Caller, Engine, EngineError, ReservationRequest};

impl Engine {
    /// The authoritative write. Validation runs first and never touches the
    /// store; the availability scan is then re-run inside the store
    /// transaction, so of two racing requests for one unit at most one
    /// commits and the other sees `Conflict`.
    pub async fn create_reservation(
        &self,
        caller: &Caller,
        request: ReservationRequest,
    ) -> Result<Reservation, EngineError> {
        check_caller(caller)?;
        let pool = self.pool(request.slot.pool_id).await?;
        let slot = check_slot(pool, &request.slot)?;
        let unit_number = request.unit_number;
        check_reservable(&slot, unit_number, request.notes.as_deref())?;

        // Priced once, from the catalog as it is now.
        let price = quote(&slot.span, &slot.pool.rates, slot.key.unit);
        let ReservationRequest { slot: query, notes, .. } = request;

        let mut body = |active: &[Reservation]| {
            let free = available_units(active, &slot.span, slot.capacity);
            if !free.contains(&unit_number) {
                return Err(EngineError::Conflict {
                    unit_number,
                    available_units: free,
                });
            }
            let now = now_ms();
            Ok(Reservation {
                id: Ulid::new(),
                requester_id: caller.id.clone(),
                pool_id: slot.key.pool_id,
                unit: slot.key.unit,
                unit_number,
                date: slot.key.date,
                start: query.start,
                end: query.end,
                span: slot.span,
                duration_hours: price.duration_hours,
                unit_rate: price.unit_rate,
                total_amount: price.total_amount,
                status: ReservationStatus::Confirmed,
                payment_status: PaymentStatus::Unpaid,
                notes: notes.clone(),
                created_at: now,
                updated_at: now,
            })
        };

        match self
            .store
            .insert_checked(slot.key, self.deadline(), &mut body)
            .await
        {
            Ok(reservation) => {
                metrics::counter!(RESERVATIONS_CREATED_TOTAL).increment(1);
                info!(
                    id = %reservation.id,
                    pool = %reservation.pool_id,
                    unit = %reservation.unit,
                    unit_number,
                    date = %reservation.date,
                    start = %reservation.start,
                    end = %reservation.end,
                    "reservation confirmed"
                );
                self.publish(Event::ReservationCreated {
                    reservation: reservation.clone(),
                });
                Ok(reservation)
            }
            Err(e @ EngineError::Conflict { .. }) => {
                metrics::counter!(RESERVATION_CONFLICTS_TOTAL).increment(1);
                debug!(pool = %slot.key.pool_id, unit_number, "{e}");
                Err(e)
            }
            Err(e) => {
                if e.is_transient() {
                    warn!(pool = %slot.key.pool_id, unit_number, "reservation not committed: {e}");
                }
                Err(e)
            }
        }
    }
}
