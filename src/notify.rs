use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Per-pool fan-out of committed reservation events, for receipt and push
/// collaborators running in-process. Slow subscribers lag and lose the
/// oldest events; the log stays authoritative.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a pool's events. Creates the channel if needed.
    pub fn subscribe(&self, pool_id: Ulid) -> broadcast::Receiver<Event> {
        self.channels
            .entry(pool_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// No-op if nobody ever subscribed. A channel whose subscribers have all
    /// gone is dropped.
    pub fn send(&self, pool_id: Ulid, event: &Event) {
        let orphaned = match self.channels.get(&pool_id) {
            Some(sender) => sender.send(event.clone()).is_err(),
            None => return,
        };
        if orphaned {
            self.channels
                .remove_if(&pool_id, |_, sender| sender.receiver_count() == 0);
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;
    use crate::model::*;

    fn event(pool_id: Ulid) -> Event {
        Event::ReservationCreated {
            reservation: Reservation {
                id: Ulid::new(),
                requester_id: "p".into(),
                pool_id,
                unit: UnitKind::Generic,
                unit_number: 1,
                date: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
                start: "10:00".parse().unwrap(),
                end: "11:00".parse().unwrap(),
                span: Span::new(600, 660),
                duration_hours: 1.0,
                unit_rate: 50.0,
                total_amount: 50.0,
                status: ReservationStatus::Confirmed,
                payment_status: PaymentStatus::Unpaid,
                notes: None,
                created_at: 0,
                updated_at: 0,
            },
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let pool = Ulid::new();
        let mut rx = hub.subscribe(pool);

        let e = event(pool);
        hub.send(pool, &e);
        assert_eq!(rx.recv().await.unwrap(), e);
    }

    #[tokio::test]
    async fn other_pools_are_not_delivered() {
        let hub = NotifyHub::new();
        let mine = Ulid::new();
        let theirs = Ulid::new();
        let mut rx = hub.subscribe(mine);

        hub.send(theirs, &event(theirs));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let pool = Ulid::new();
        hub.send(pool, &event(pool));
        assert_eq!(hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_channel_is_dropped() {
        let hub = NotifyHub::new();
        let pool = Ulid::new();
        drop(hub.subscribe(pool));
        assert_eq!(hub.channel_count(), 1);
        hub.send(pool, &event(pool));
        assert_eq!(hub.channel_count(), 0);
    }
}
