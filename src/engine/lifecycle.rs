use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::observability::LIFECYCLE_TRANSITIONS_TOTAL;

use super::conflict::now_ms;
use super::{Caller, Engine, EngineError};

/// Cancelled and completed are final; the rest is an administrative choice.
fn ensure_not_final(current: &Reservation) -> Result<(), EngineError> {
    if current.status.is_terminal() {
        return Err(EngineError::InvalidState {
            id: current.id,
            status: current.status,
        });
    }
    Ok(())
}

fn with_status(current: &Reservation, status: ReservationStatus) -> Reservation {
    Reservation {
        status,
        updated_at: now_ms(),
        ..current.clone()
    }
}

impl Engine {
    /// Soft cancel by the requester or the pool's manager. The record stays;
    /// it just stops counting in overlap checks.
    pub async fn cancel_reservation(
        &self,
        caller: &Caller,
        id: Ulid,
    ) -> Result<Reservation, EngineError> {
        self.owned_or_managed(caller, id).await?;
        let updated = self
            .store
            .update_checked(id, self.deadline(), &mut |current: &Reservation| -> Result<_, EngineError> {
                ensure_not_final(current)?;
                Ok(Some(with_status(current, ReservationStatus::Cancelled)))
            })
            .await?;
        self.transitioned(caller, &updated);
        Ok(updated)
    }

    /// Manager-only. Any move between states is allowed unless the record is
    /// already final; asking for the current status changes nothing.
    pub async fn set_reservation_status(
        &self,
        caller: &Caller,
        id: Ulid,
        status: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        self.managed(caller, id).await?;
        let mut changed = false;
        let updated = self
            .store
            .update_checked(id, self.deadline(), &mut |current: &Reservation| -> Result<_, EngineError> {
                ensure_not_final(current)?;
                changed = current.status != status;
                Ok(changed.then(|| with_status(current, status)))
            })
            .await?;
        if changed {
            self.transitioned(caller, &updated);
        }
        Ok(updated)
    }

    /// The payment collaborator's write path. Touches only the payment
    /// status; a cancelled reservation can still be refunded, nothing else.
    pub async fn set_payment_status(
        &self,
        caller: &Caller,
        id: Ulid,
        payment_status: PaymentStatus,
    ) -> Result<Reservation, EngineError> {
        self.managed(caller, id).await?;
        let mut changed = false;
        let updated = self
            .store
            .update_checked(id, self.deadline(), &mut |current: &Reservation| -> Result<_, EngineError> {
                if current.status == ReservationStatus::Cancelled
                    && payment_status != PaymentStatus::Refunded
                {
                    return Err(EngineError::InvalidState {
                        id: current.id,
                        status: current.status,
                    });
                }
                changed = current.payment_status != payment_status;
                Ok(changed.then(|| Reservation {
                    payment_status,
                    updated_at: now_ms(),
                    ..current.clone()
                }))
            })
            .await?;
        if changed {
            info!(%id, payment_status = payment_status.as_str(), by = %caller.id, "payment status updated");
            self.publish(Event::ReservationUpdated {
                reservation: updated.clone(),
            });
        }
        Ok(updated)
    }

    fn transitioned(&self, caller: &Caller, updated: &Reservation) {
        let to = updated.status.as_str();
        metrics::counter!(LIFECYCLE_TRANSITIONS_TOTAL, "to" => to).increment(1);
        info!(id = %updated.id, to, by = %caller.id, "reservation status changed");
        self.publish(Event::ReservationUpdated {
            reservation: updated.clone(),
        });
    }
}
