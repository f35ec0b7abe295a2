use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::time::{timeout_at, Instant};
use ulid::Ulid;

use crate::model::*;
use crate::observability::{
    TXN_DEADLINE_EXCEEDED_TOTAL, TXN_RETRIES_TOTAL, WAL_FLUSH_BATCH_SIZE,
    WAL_FLUSH_DURATION_SECONDS,
};
use crate::wal::Wal;

use super::EngineError;

pub type SharedLedger = Arc<RwLock<SlotLedger>>;

/// Transaction body for a new reservation. Receives the active reservations
/// on the slot key and returns the record to commit, or aborts.
pub type InsertBody<'a> =
    dyn FnMut(&[Reservation]) -> Result<Reservation, EngineError> + Send + 'a;

/// Transaction body for an existing reservation. `Ok(None)` leaves the record
/// untouched.
pub type UpdateBody<'a> =
    dyn FnMut(&Reservation) -> Result<Option<Reservation>, EngineError> + Send + 'a;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// The backing store the engine is handed. Implementations must make each
/// `*_checked` call atomic: the body's decision and the write it produces
/// either both hold at commit time or the write does not happen.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, EngineError>;

    /// Pending and confirmed reservations on one slot key.
    async fn active_on(&self, key: SlotKey) -> Result<Vec<Reservation>, EngineError>;

    async fn list_for_requester(&self, requester_id: &str) -> Result<Vec<Reservation>, EngineError>;

    /// Every reservation of a pool on a date, any kind, any status.
    async fn list_for_pool(
        &self,
        pool_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, EngineError>;

    async fn insert_checked(
        &self,
        key: SlotKey,
        deadline: Instant,
        body: &mut InsertBody<'_>,
    ) -> Result<Reservation, EngineError>;

    async fn update_checked(
        &self,
        id: Ulid,
        deadline: Instant,
        body: &mut UpdateBody<'_>,
    ) -> Result<Reservation, EngineError>;
}

// ── Group-commit WAL channel ─────────────────────────────

pub(crate) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL and batches appends: block for the first append, drain
/// whatever else is queued, then fsync once for the whole batch.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };

        let mut batch = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        flush_and_respond(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so stray bytes are not carried into
    // the next batch.
    let flushed = wal.flush_sync();
    let result = result.and(flushed);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(flush_start.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => flush_and_respond(wal, vec![(event, response)]),
    }
}

async fn wal_append(tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), EngineError> {
    let (response, rx) = oneshot::channel();
    tx.send(WalCommand::Append {
        event: event.clone(),
        response,
    })
    .await
    .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
        .map_err(|e| EngineError::Storage(e.to_string()))
}

// ── Ledger store ─────────────────────────────────────────

#[derive(Default)]
struct Indexes {
    by_id: DashMap<Ulid, SlotKey>,
    by_requester: DashMap<String, Vec<Ulid>>,
}

/// Apply a committed event. The caller holds the ledger exclusively.
fn apply_event(ledger: &mut SlotLedger, indexes: &Indexes, event: Event) {
    ledger.bump_unit(event.reservation().unit_number);
    match event {
        Event::ReservationCreated { reservation } => {
            indexes.by_id.insert(reservation.id, ledger.key);
            indexes
                .by_requester
                .entry(reservation.requester_id.clone())
                .or_default()
                .push(reservation.id);
            ledger.insert_reservation(reservation);
        }
        Event::ReservationUpdated { reservation } => {
            let id = reservation.id;
            if !ledger.replace_reservation(reservation) {
                tracing::warn!(%id, "update for unknown reservation skipped");
            }
        }
    }
}

/// In-memory reservation ledgers, one per slot key, optionally backed by a
/// write-ahead log.
pub struct LedgerStore {
    ledgers: DashMap<SlotKey, SharedLedger>,
    indexes: Arc<Indexes>,
    wal_tx: Option<mpsc::Sender<WalCommand>>,
    /// Commits hold this shared; compaction holds it exclusively so its
    /// snapshot covers every acknowledged write. Always taken before a
    /// ledger write lock.
    commit_gate: Arc<RwLock<()>>,
    max_attempts: u32,
}

impl LedgerStore {
    pub fn in_memory() -> Self {
        Self {
            ledgers: DashMap::new(),
            indexes: Arc::new(Indexes::default()),
            wal_tx: None,
            commit_gate: Arc::new(RwLock::new(())),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Replay the log at `path` and start its group-commit writer. Must be
    /// called from inside a tokio runtime.
    pub fn open(path: &Path) -> io::Result<Self> {
        let events = Wal::replay(path)?;
        let wal = Wal::open(path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let replayed = events.len();
        let indexes = Indexes::default();
        let mut ledgers: HashMap<SlotKey, SlotLedger> = HashMap::new();
        for event in events {
            let key = event.reservation().slot_key();
            let ledger = ledgers.entry(key).or_insert_with(|| SlotLedger::new(key));
            apply_event(ledger, &indexes, event);
        }
        tracing::info!(events = replayed, records = indexes.by_id.len(), path = %path.display(), "replayed reservation log");

        Ok(Self {
            ledgers: ledgers
                .into_iter()
                .map(|(key, ledger)| (key, Arc::new(RwLock::new(ledger))))
                .collect(),
            indexes: Arc::new(indexes),
            wal_tx: Some(wal_tx),
            commit_gate: Arc::new(RwLock::new(())),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn reservation_count(&self) -> usize {
        self.indexes.by_id.len()
    }

    fn ledger(&self, key: SlotKey) -> SharedLedger {
        self.ledgers
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(SlotLedger::new(key))))
            .clone()
    }

    fn existing_ledger(&self, key: &SlotKey) -> Option<SharedLedger> {
        self.ledgers.get(key).map(|e| e.value().clone())
    }

    async fn snapshot<T>(
        ledger: &SharedLedger,
        deadline: Instant,
        read: impl FnOnce(&SlotLedger) -> T,
    ) -> Result<T, EngineError> {
        if Instant::now() >= deadline {
            return Err(deadline_exceeded());
        }
        let guard = timeout_at(deadline, ledger.read())
            .await
            .map_err(|_| deadline_exceeded())?;
        Ok(read(&guard))
    }

    async fn lock_for_commit(
        &self,
        ledger: &SharedLedger,
        deadline: Instant,
    ) -> Result<(OwnedRwLockReadGuard<()>, OwnedRwLockWriteGuard<SlotLedger>), EngineError> {
        if Instant::now() >= deadline {
            return Err(deadline_exceeded());
        }
        let gate = timeout_at(deadline, self.commit_gate.clone().read_owned())
            .await
            .map_err(|_| deadline_exceeded())?;
        let guard = timeout_at(deadline, ledger.clone().write_owned())
            .await
            .map_err(|_| deadline_exceeded())?;
        Ok((gate, guard))
    }

    /// Past the unit version check. Runs on its own task so a caller that goes
    /// away mid-commit cannot leave the log and the ledger disagreeing.
    async fn commit(
        &self,
        gate: OwnedRwLockReadGuard<()>,
        mut guard: OwnedRwLockWriteGuard<SlotLedger>,
        event: Event,
    ) -> Result<Reservation, EngineError> {
        let wal_tx = self.wal_tx.clone();
        let indexes = self.indexes.clone();
        tokio::spawn(async move {
            let _gate = gate;
            if let Some(tx) = &wal_tx {
                wal_append(tx, &event).await?;
            }
            let reservation = event.reservation().clone();
            apply_event(&mut guard, &indexes, event);
            Ok::<_, EngineError>(reservation)
        })
        .await
        .map_err(|e| EngineError::Storage(format!("commit task failed: {e}")))?
    }

    /// Rewrite the log as one record per reservation.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let Some(tx) = &self.wal_tx else {
            return Ok(());
        };
        let _gate = self.commit_gate.write().await;

        let ledgers: Vec<SharedLedger> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::with_capacity(self.indexes.by_id.len());
        for ledger in ledgers {
            let guard = ledger.read().await;
            events.extend(
                guard
                    .reservations
                    .iter()
                    .cloned()
                    .map(|reservation| Event::ReservationCreated { reservation }),
            );
        }
        let records = events.len();

        let (response, rx) = oneshot::channel();
        tx.send(WalCommand::Compact { events, response })
            .await
            .map_err(|_| EngineError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        tracing::info!(records, "compacted reservation log");
        Ok(())
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let Some(tx) = &self.wal_tx else {
            return 0;
        };
        let (response, rx) = oneshot::channel();
        if tx
            .send(WalCommand::AppendsSinceCompact { response })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    async fn read_record(&self, id: Ulid) -> Option<Reservation> {
        let key = self.indexes.by_id.get(&id).map(|e| *e.value())?;
        let ledger = self.existing_ledger(&key)?;
        let guard = ledger.read().await;
        guard.get(id).cloned()
    }
}

fn deadline_exceeded() -> EngineError {
    metrics::counter!(TXN_DEADLINE_EXCEEDED_TOTAL).increment(1);
    tracing::warn!("transaction deadline passed before commit");
    EngineError::Unavailable("transaction deadline exceeded".into())
}

fn retried(attempt: u32, key: &SlotKey, unit_number: u32) {
    metrics::counter!(TXN_RETRIES_TOTAL).increment(1);
    tracing::debug!(
        attempt,
        pool = %key.pool_id,
        unit = %key.unit,
        unit_number,
        date = %key.date,
        "unit changed during check, retrying"
    );
}

fn sort_for_listing(records: &mut [Reservation]) {
    records.sort_by(|a, b| {
        (a.date, a.span.start, a.unit_number).cmp(&(b.date, b.span.start, b.unit_number))
    });
}

#[async_trait]
impl ReservationStore for LedgerStore {
    async fn get(&self, id: Ulid) -> Result<Option<Reservation>, EngineError> {
        Ok(self.read_record(id).await)
    }

    async fn active_on(&self, key: SlotKey) -> Result<Vec<Reservation>, EngineError> {
        let Some(ledger) = self.existing_ledger(&key) else {
            return Ok(Vec::new());
        };
        let guard = ledger.read().await;
        Ok(guard.active().cloned().collect())
    }

    async fn list_for_requester(&self, requester_id: &str) -> Result<Vec<Reservation>, EngineError> {
        let ids: Vec<Ulid> = self
            .indexes
            .by_requester
            .get(requester_id)
            .map(|e| e.value().clone())
            .unwrap_or_default();
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(r) = self.read_record(id).await {
                records.push(r);
            }
        }
        sort_for_listing(&mut records);
        Ok(records)
    }

    async fn list_for_pool(
        &self,
        pool_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, EngineError> {
        let mut records = Vec::new();
        for unit in UnitKind::all() {
            if let Some(ledger) = self.existing_ledger(&SlotKey::new(pool_id, unit, date)) {
                records.extend(ledger.read().await.reservations.iter().cloned());
            }
        }
        sort_for_listing(&mut records);
        Ok(records)
    }

    async fn insert_checked(
        &self,
        key: SlotKey,
        deadline: Instant,
        body: &mut InsertBody<'_>,
    ) -> Result<Reservation, EngineError> {
        let ledger = self.ledger(key);
        for attempt in 1..=self.max_attempts {
            let (versions, active) = Self::snapshot(&ledger, deadline, |l| {
                (l.unit_versions(), l.active().cloned().collect::<Vec<_>>())
            })
            .await?;
            let record = body(&active)?;
            if record.slot_key() != key {
                return Err(EngineError::Storage(
                    "new reservation does not belong to the checked slot".into(),
                ));
            }
            // Whether a unit is free depends only on that unit's records, so
            // commits on other units never invalidate the check.
            let seen = versions.get(&record.unit_number).copied().unwrap_or(0);

            let (gate, guard) = self.lock_for_commit(&ledger, deadline).await?;
            if guard.unit_version(record.unit_number) != seen {
                drop(guard);
                drop(gate);
                retried(attempt, &key, record.unit_number);
                continue;
            }
            return self
                .commit(gate, guard, Event::ReservationCreated { reservation: record })
                .await;
        }
        Err(EngineError::Unavailable(
            "unit too contended, retry later".into(),
        ))
    }

    async fn update_checked(
        &self,
        id: Ulid,
        deadline: Instant,
        body: &mut UpdateBody<'_>,
    ) -> Result<Reservation, EngineError> {
        let key = self
            .indexes
            .by_id
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))?;
        let ledger = self.existing_ledger(&key).ok_or(EngineError::NotFound(id))?;

        for attempt in 1..=self.max_attempts {
            let (seen, current) = Self::snapshot(&ledger, deadline, |l| {
                let current = l.get(id).cloned();
                let unit = current.as_ref().map_or(0, |r| r.unit_number);
                (l.unit_version(unit), current)
            })
            .await?;
            let current = current.ok_or(EngineError::NotFound(id))?;
            let Some(next) = body(&current)? else {
                return Ok(current);
            };
            let moved = next.id != id
                || next.span != current.span
                || next.unit_number != current.unit_number
                || next.slot_key() != key;
            if moved {
                return Err(EngineError::Storage(
                    "an update may not move a reservation".into(),
                ));
            }

            let (gate, guard) = self.lock_for_commit(&ledger, deadline).await?;
            if guard.unit_version(current.unit_number) != seen {
                drop(guard);
                drop(gate);
                retried(attempt, &key, current.unit_number);
                continue;
            }
            return self
                .commit(gate, guard, Event::ReservationUpdated { reservation: next })
                .await;
        }
        Err(EngineError::Unavailable(
            "reservation too contended, retry later".into(),
        ))
    }
}
