use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, Weekday};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::{MAX_POOLS, MAX_POOL_NAME_LEN, MAX_UNITS_PER_KIND};
use crate::model::{ConsoleFamily, OperatingHours, UnitKind};

/// How many numbered units of each kind a pool stocks.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitCounts {
    #[serde(default)]
    pub generic: u32,
    #[serde(default)]
    pub consoles: HashMap<ConsoleFamily, u32>,
}

/// Hourly rates. `default_rate` is the pool-wide fallback; the kind-level
/// rates are optional and the per-family console rates count only when
/// greater than zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RateCard {
    pub default_rate: f64,
    #[serde(default)]
    pub generic_rate: Option<f64>,
    #[serde(default)]
    pub console_rate: Option<f64>,
    #[serde(default)]
    pub console_rates: HashMap<ConsoleFamily, f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Hours for any weekday without its own entry. `None` means closed.
    #[serde(default)]
    pub default: Option<OperatingHours>,
    #[serde(default)]
    pub weekdays: HashMap<Weekday, OperatingHours>,
    #[serde(default)]
    pub closed_dates: HashSet<NaiveDate>,
}

impl Schedule {
    pub fn hours_on(&self, date: NaiveDate) -> Option<OperatingHours> {
        if self.closed_dates.contains(&date) {
            return None;
        }
        self.weekdays.get(&date.weekday()).copied().or(self.default)
    }
}

/// A venue as the directory hands it out. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub id: Ulid,
    pub name: String,
    /// Identity of the managing party, compared against the caller id.
    pub manager_id: String,
    #[serde(default = "default_active")]
    pub is_active: bool,
    pub schedule: Schedule,
    #[serde(default)]
    pub units: UnitCounts,
    pub rates: RateCard,
}

fn default_active() -> bool {
    true
}

impl Pool {
    pub fn capacity(&self, unit: UnitKind) -> u32 {
        match unit {
            UnitKind::Generic => self.units.generic,
            UnitKind::Console(family) => self.units.consoles.get(&family).copied().unwrap_or(0),
        }
    }

    pub fn operating_hours(&self, date: NaiveDate) -> Option<OperatingHours> {
        self.schedule.hours_on(date)
    }

    pub fn is_managed_by(&self, caller_id: &str) -> bool {
        self.manager_id == caller_id
    }
}

/// The venue catalog the engine reads from.
#[async_trait]
pub trait PoolDirectory: Send + Sync {
    async fn get_pool(&self, id: Ulid) -> Option<Arc<Pool>>;
}

#[derive(Debug)]
pub enum CatalogError {
    Io(io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CatalogError::Io(e) => write!(f, "reading pool catalog: {e}"),
            CatalogError::Parse(e) => write!(f, "parsing pool catalog: {e}"),
            CatalogError::Invalid(msg) => write!(f, "invalid pool catalog: {msg}"),
        }
    }
}

impl std::error::Error for CatalogError {}

/// Directory backed by a catalog loaded once at startup.
pub struct StaticDirectory {
    pools: DashMap<Ulid, Arc<Pool>>,
}

impl Default for StaticDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Add or replace a pool.
    pub fn insert(&self, pool: Pool) {
        self.pools.insert(pool.id, Arc::new(pool));
    }

    pub fn from_pools(pools: Vec<Pool>) -> Result<Self, CatalogError> {
        if pools.len() > MAX_POOLS {
            return Err(CatalogError::Invalid(format!(
                "{} pools exceeds the limit of {MAX_POOLS}",
                pools.len()
            )));
        }
        let dir = Self::new();
        for pool in pools {
            validate_pool(&pool)?;
            if dir.pools.contains_key(&pool.id) {
                return Err(CatalogError::Invalid(format!("duplicate pool id {}", pool.id)));
            }
            dir.insert(pool);
        }
        Ok(dir)
    }

    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let pools: Vec<Pool> = serde_json::from_str(json).map_err(CatalogError::Parse)?;
        Self::from_pools(pools)
    }

    pub fn load(path: &Path) -> Result<Self, CatalogError> {
        let json = std::fs::read_to_string(path).map_err(CatalogError::Io)?;
        Self::from_json(&json)
    }
}

fn validate_pool(pool: &Pool) -> Result<(), CatalogError> {
    let invalid = |msg: String| Err(CatalogError::Invalid(format!("pool {}: {msg}", pool.id)));
    if pool.name.len() > MAX_POOL_NAME_LEN {
        return invalid("name too long".into());
    }
    let counts = std::iter::once(pool.units.generic).chain(pool.units.consoles.values().copied());
    if counts.into_iter().any(|n| n > MAX_UNITS_PER_KIND) {
        return invalid(format!("more than {MAX_UNITS_PER_KIND} units of one kind"));
    }
    let rates = [pool.rates.default_rate]
        .into_iter()
        .chain(pool.rates.generic_rate)
        .chain(pool.rates.console_rate)
        .chain(pool.rates.console_rates.values().copied());
    for rate in rates {
        if !rate.is_finite() || rate < 0.0 {
            return invalid(format!("rate {rate} is not a non-negative amount"));
        }
    }
    Ok(())
}

#[async_trait]
impl PoolDirectory for StaticDirectory {
    async fn get_pool(&self, id: Ulid) -> Option<Arc<Pool>> {
        self.pools.get(&id).map(|e| e.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"[{
        "id": "01JAAAAAAAAAAAAAAAAAAAAAAA",
        "name": "Arena Downtown",
        "manager_id": "venue-admin-7",
        "schedule": {
            "default": {"open": "10:00", "close": "02:00"},
            "weekdays": {"Sat": {"open": "09:00", "close": "03:00"}},
            "closed_dates": ["2025-12-25"]
        },
        "units": {"generic": 12, "consoles": {"ps5": 4, "xbox_series": 2}},
        "rates": {"default_rate": 80.0, "generic_rate": 100.0, "console_rate": 120.0,
                  "console_rates": {"ps5": 150.0}}
    }]"#;

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn loads_catalog() {
        let dir = StaticDirectory::from_json(CATALOG).unwrap();
        assert_eq!(dir.len(), 1);
        let id: Ulid = "01JAAAAAAAAAAAAAAAAAAAAAAA".parse().unwrap();
        let pool = dir.get_pool(id).await.unwrap();
        assert!(pool.is_active);
        assert_eq!(pool.capacity(UnitKind::Generic), 12);
        assert_eq!(pool.capacity(UnitKind::Console(ConsoleFamily::Ps5)), 4);
        assert_eq!(pool.capacity(UnitKind::Console(ConsoleFamily::Switch)), 0);
        assert_eq!(pool.rates.console_rates.get(&ConsoleFamily::Ps5), Some(&150.0));
        assert!(pool.is_managed_by("venue-admin-7"));
        assert!(dir.get_pool(Ulid::new()).await.is_none());
    }

    #[test]
    fn schedule_resolution() {
        let dir = StaticDirectory::from_json(CATALOG).unwrap();
        let pool = dir.pools.iter().next().unwrap().value().clone();

        // 2025-01-10 is a Friday, 2025-01-11 a Saturday.
        let fri = pool.operating_hours(date("2025-01-10")).unwrap();
        assert_eq!(fri.open.to_string(), "10:00");
        assert_eq!(fri.close.to_string(), "02:00");
        let sat = pool.operating_hours(date("2025-01-11")).unwrap();
        assert_eq!(sat.open.to_string(), "09:00");
        assert!(pool.operating_hours(date("2025-12-25")).is_none());
    }

    #[test]
    fn no_default_means_closed_on_unlisted_days() {
        let schedule = Schedule {
            default: None,
            weekdays: HashMap::from([(
                Weekday::Mon,
                OperatingHours::new("12:00".parse().unwrap(), "20:00".parse().unwrap()),
            )]),
            closed_dates: HashSet::new(),
        };
        assert!(schedule.hours_on(date("2025-01-13")).is_some()); // Monday
        assert!(schedule.hours_on(date("2025-01-14")).is_none());
    }

    #[test]
    fn rejects_bad_catalogs() {
        let dup = format!("[{0},{0}]", &CATALOG[1..CATALOG.len() - 1]);
        assert!(matches!(
            StaticDirectory::from_json(&dup),
            Err(CatalogError::Invalid(_))
        ));

        let negative = CATALOG.replace("\"default_rate\": 80.0", "\"default_rate\": -1.0");
        assert!(matches!(
            StaticDirectory::from_json(&negative),
            Err(CatalogError::Invalid(_))
        ));

        let huge = CATALOG.replace("\"generic\": 12", "\"generic\": 100000");
        assert!(matches!(
            StaticDirectory::from_json(&huge),
            Err(CatalogError::Invalid(_))
        ));

        let unknown_family = CATALOG.replace("\"xbox_series\": 2", "\"dreamcast\": 2");
        assert!(matches!(
            StaticDirectory::from_json(&unknown_family),
            Err(CatalogError::Parse(_))
        ));
    }
}
