use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds, used for record timestamps.
pub type Ms = i64;

/// Minutes on an operating day's scale. Values at or past 1440 belong to the
/// post-midnight segment of a venue that closes after midnight.
pub type Minutes = u32;

pub const MINUTES_PER_DAY: Minutes = 1440;

// ── Time of day ──────────────────────────────────────────────────

/// Wall-clock time of day as minutes since local midnight (`0..1440`).
/// Serialized as `HH:MM` so catalogs and logs stay readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeOfDay(u16);

impl TimeOfDay {
    pub fn from_hm(hour: u32, minute: u32) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self((hour * 60 + minute) as u16))
        } else {
            None
        }
    }

    pub fn minutes(self) -> Minutes {
        Minutes::from(self.0)
    }
}

impl FromStr for TimeOfDay {
    type Err = ValueError;

    /// Accepts `HH:MM` and `HH:MM:SS`; seconds are dropped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let t = NaiveTime::parse_from_str(s, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
            .map_err(|_| ValueError::new("time", s))?;
        Self::from_hm(t.hour(), t.minute()).ok_or_else(|| ValueError::new("time", s))
    }
}

impl TryFrom<String> for TimeOfDay {
    type Error = ValueError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TimeOfDay> for String {
    fn from(t: TimeOfDay) -> Self {
        t.to_string()
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

// ── Spans ────────────────────────────────────────────────────────

/// Half-open interval `[start, end)` in operating-day minutes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Minutes,
    pub end: Minutes,
}

impl Span {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// `None` for zero- or negative-length intervals.
    pub fn try_new(start: Minutes, end: Minutes) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration_minutes(&self) -> Minutes {
        self.end - self.start
    }

    pub fn duration_hours(&self) -> f64 {
        f64::from(self.duration_minutes()) / 60.0
    }

    /// The one overlap predicate. Touching boundaries do not overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Why a requested interval could not be placed on an operating day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntervalError {
    Empty,
    OutsideHours { requested: Span, window: Span },
}

impl fmt::Display for IntervalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntervalError::Empty => write!(f, "end must be after start"),
            IntervalError::OutsideHours { requested, window } => write!(
                f,
                "interval [{}, {}) falls outside operating hours [{}, {})",
                requested.start, requested.end, window.start, window.end
            ),
        }
    }
}

/// Opening hours for one operating day. A close at or before the open time
/// means the venue closes after midnight; `open == close` is a 24-hour day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatingHours {
    pub open: TimeOfDay,
    pub close: TimeOfDay,
}

impl OperatingHours {
    pub fn new(open: TimeOfDay, close: TimeOfDay) -> Self {
        Self { open, close }
    }

    pub fn crosses_midnight(&self) -> bool {
        self.close <= self.open
    }

    /// The operating day as a span, close shifted past 1440 when it wraps.
    pub fn window(&self) -> Span {
        let close = if self.crosses_midnight() {
            self.close.minutes() + MINUTES_PER_DAY
        } else {
            self.close.minutes()
        };
        Span::new(self.open.minutes(), close)
    }

    /// Place a start time on this day's scale: times before `open` on a
    /// wrapping day belong to the post-midnight segment.
    pub fn place_start(&self, t: TimeOfDay) -> Minutes {
        if self.crosses_midnight() && t < self.open {
            t.minutes() + MINUTES_PER_DAY
        } else {
            t.minutes()
        }
    }

    /// Like `place_start`, but an end equal to `open` on a wrapping day is the
    /// end of the full cycle.
    pub fn place_end(&self, t: TimeOfDay) -> Minutes {
        if self.crosses_midnight() && t <= self.open {
            t.minutes() + MINUTES_PER_DAY
        } else {
            t.minutes()
        }
    }

    /// Normalize a wall-clock request into a span inside this operating day.
    pub fn resolve(&self, start: TimeOfDay, end: TimeOfDay) -> Result<Span, IntervalError> {
        let window = self.window();
        // Straddling `open` on a wrapping day: placing the start after
        // midnight would misreport this as an empty interval.
        if self.crosses_midnight() && start < self.open && end > self.open {
            return Err(IntervalError::OutsideHours {
                requested: Span::new(start.minutes(), end.minutes()),
                window,
            });
        }
        let requested = Span::try_new(self.place_start(start), self.place_end(end))
            .ok_or(IntervalError::Empty)?;
        if !window.contains_span(&requested) {
            return Err(IntervalError::OutsideHours { requested, window });
        }
        Ok(requested)
    }
}

// ── Unit kinds ───────────────────────────────────────────────────

/// The closed set of console subtypes a pool can stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleFamily {
    Ps5,
    Ps4,
    XboxSeries,
    Switch,
}

impl ConsoleFamily {
    pub const ALL: [ConsoleFamily; 4] = [
        ConsoleFamily::Ps5,
        ConsoleFamily::Ps4,
        ConsoleFamily::XboxSeries,
        ConsoleFamily::Switch,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConsoleFamily::Ps5 => "ps5",
            ConsoleFamily::Ps4 => "ps4",
            ConsoleFamily::XboxSeries => "xbox_series",
            ConsoleFamily::Switch => "switch",
        }
    }
}

impl FromStr for ConsoleFamily {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ps5" => Ok(ConsoleFamily::Ps5),
            "ps4" => Ok(ConsoleFamily::Ps4),
            "xbox_series" => Ok(ConsoleFamily::XboxSeries),
            "switch" => Ok(ConsoleFamily::Switch),
            _ => Err(ValueError::new("console subtype", s)),
        }
    }
}

/// What kind of numbered unit a reservation holds. Console units always carry
/// their family, so an untyped console or a typed generic unit cannot exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UnitKind {
    Generic,
    Console(ConsoleFamily),
}

impl UnitKind {
    /// Build from the loosely-typed `(kind, subtype)` pair callers send.
    pub fn from_parts(kind: &str, subtype: Option<&str>) -> Result<Self, UnitKindError> {
        let subtype = subtype.map(str::trim).filter(|s| !s.is_empty());
        match (kind.trim().to_ascii_lowercase().as_str(), subtype) {
            ("generic", None) => Ok(UnitKind::Generic),
            ("generic", Some(s)) => Err(UnitKindError::UnexpectedSubtype(s.to_string())),
            ("console", Some(s)) => s
                .parse()
                .map(UnitKind::Console)
                .map_err(|_| UnitKindError::UnknownSubtype(s.to_string())),
            ("console", None) => Err(UnitKindError::MissingSubtype),
            (other, _) => Err(UnitKindError::UnknownKind(other.to_string())),
        }
    }

    /// Every kind a pool can stock.
    pub fn all() -> impl Iterator<Item = UnitKind> {
        std::iter::once(UnitKind::Generic).chain(ConsoleFamily::ALL.into_iter().map(UnitKind::Console))
    }

    pub fn kind_str(&self) -> &'static str {
        match self {
            UnitKind::Generic => "generic",
            UnitKind::Console(_) => "console",
        }
    }

    pub fn subtype(&self) -> Option<ConsoleFamily> {
        match self {
            UnitKind::Generic => None,
            UnitKind::Console(family) => Some(*family),
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKind::Generic => write!(f, "generic"),
            UnitKind::Console(family) => write!(f, "console/{}", family.as_str()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitKindError {
    UnknownKind(String),
    MissingSubtype,
    UnexpectedSubtype(String),
    UnknownSubtype(String),
}

impl fmt::Display for UnitKindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnitKindError::UnknownKind(k) => write!(f, "unknown unit kind: {k}"),
            UnitKindError::MissingSubtype => write!(f, "console units require a subtype"),
            UnitKindError::UnexpectedSubtype(s) => {
                write!(f, "generic units take no subtype (got {s})")
            }
            UnitKindError::UnknownSubtype(s) => write!(f, "unsupported console subtype: {s}"),
        }
    }
}

impl std::error::Error for UnitKindError {}

// ── Statuses ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl ReservationStatus {
    /// Only active reservations take part in overlap checks.
    pub fn is_active(self) -> bool {
        matches!(self, ReservationStatus::Pending | ReservationStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ReservationStatus::Cancelled | ReservationStatus::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Cancelled => "cancelled",
            ReservationStatus::Completed => "completed",
        }
    }
}

impl FromStr for ReservationStatus {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ReservationStatus::Pending),
            "confirmed" => Ok(ReservationStatus::Confirmed),
            "cancelled" | "canceled" => Ok(ReservationStatus::Cancelled),
            "completed" => Ok(ReservationStatus::Completed),
            _ => Err(ValueError::new("status", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Unpaid => "unpaid",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Refunded => "refunded",
        }
    }
}

impl FromStr for PaymentStatus {
    type Err = ValueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unpaid" => Ok(PaymentStatus::Unpaid),
            "paid" => Ok(PaymentStatus::Paid),
            "refunded" => Ok(PaymentStatus::Refunded),
            _ => Err(ValueError::new("payment status", s)),
        }
    }
}

/// A string that did not name a value of the expected field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueError {
    pub field: &'static str,
    pub value: String,
}

impl ValueError {
    pub fn new(field: &'static str, value: &str) -> Self {
        Self {
            field,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for ValueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.field, self.value)
    }
}

impl std::error::Error for ValueError {}

// ── Reservations ─────────────────────────────────────────────────

/// The overlap-scan key: every reservation competing for the same units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotKey {
    pub pool_id: Ulid,
    pub unit: UnitKind,
    pub date: NaiveDate,
}

impl SlotKey {
    pub fn new(pool_id: Ulid, unit: UnitKind, date: NaiveDate) -> Self {
        Self {
            pool_id,
            unit,
            date,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub requester_id: String,
    pub pool_id: Ulid,
    pub unit: UnitKind,
    pub unit_number: u32,
    pub date: NaiveDate,
    /// Wall-clock bounds as requested.
    pub start: TimeOfDay,
    pub end: TimeOfDay,
    /// The same bounds on the operating day's scale.
    pub span: Span,
    pub duration_hours: f64,
    pub unit_rate: f64,
    pub total_amount: f64,
    pub status: ReservationStatus,
    pub payment_status: PaymentStatus,
    pub notes: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Reservation {
    pub fn slot_key(&self) -> SlotKey {
        SlotKey::new(self.pool_id, self.unit, self.date)
    }
}

/// Every reservation on one slot key, in any status.
#[derive(Debug, Clone)]
pub struct SlotLedger {
    pub key: SlotKey,
    /// Per unit number, bumped on every committed write to that unit.
    /// Optimistic transactions compare only the unit they write.
    versions: HashMap<u32, u64>,
    /// Sorted by `span.start`.
    pub reservations: Vec<Reservation>,
}

impl SlotLedger {
    pub fn new(key: SlotKey) -> Self {
        Self {
            key,
            versions: HashMap::new(),
            reservations: Vec::new(),
        }
    }

    pub fn unit_version(&self, unit_number: u32) -> u64 {
        self.versions.get(&unit_number).copied().unwrap_or(0)
    }

    pub fn unit_versions(&self) -> HashMap<u32, u64> {
        self.versions.clone()
    }

    pub fn bump_unit(&mut self, unit_number: u32) {
        *self.versions.entry(unit_number).or_insert(0) += 1;
    }

    /// Insert maintaining sort order by span.start.
    pub fn insert_reservation(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .binary_search_by_key(&reservation.span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, reservation);
    }

    /// Swap in a new version of an existing record. Spans never change, so the
    /// sort order holds.
    pub fn replace_reservation(&mut self, reservation: Reservation) -> bool {
        match self.reservations.iter_mut().find(|r| r.id == reservation.id) {
            Some(slot) => {
                *slot = reservation;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn active(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.status.is_active())
    }

    /// Active reservations whose span overlaps the query window.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.status.is_active() && r.span.overlaps(query))
    }
}

/// The durable record format. Records are written whole so replay never has
/// to merge partial updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated { reservation: Reservation },
    ReservationUpdated { reservation: Reservation },
}

impl Event {
    pub fn reservation(&self) -> &Reservation {
        match self {
            Event::ReservationCreated { reservation } | Event::ReservationUpdated { reservation } => {
                reservation
            }
        }
    }
}
