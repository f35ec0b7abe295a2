use crate::model::{Span, UnitKind};
use crate::pool::RateCard;

/// Duration and cost for one interval, fixed at creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub duration_hours: f64,
    pub unit_rate: f64,
    pub total_amount: f64,
}

/// Hourly rate for a unit kind. A family rate counts only when positive; a
/// kind-level rate counts whenever it is set; the pool default is the floor.
pub fn resolve_rate(rates: &RateCard, unit: UnitKind) -> f64 {
    let (family_rate, kind_rate) = match unit {
        UnitKind::Generic => (None, rates.generic_rate),
        UnitKind::Console(family) => (
            rates.console_rates.get(&family).copied(),
            rates.console_rate,
        ),
    };
    family_rate
        .filter(|r| *r > 0.0)
        .or(kind_rate)
        .unwrap_or(rates.default_rate)
}

/// Amounts are left unrounded.
pub fn quote(span: &Span, rates: &RateCard, unit: UnitKind) -> Quote {
    let duration_hours = span.duration_hours();
    let unit_rate = resolve_rate(rates, unit);
    Quote {
        duration_hours,
        unit_rate,
        total_amount: duration_hours * unit_rate,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::model::ConsoleFamily;

    fn card() -> RateCard {
        RateCard {
            default_rate: 80.0,
            generic_rate: Some(100.0),
            console_rate: Some(120.0),
            console_rates: HashMap::from([(ConsoleFamily::Ps5, 150.0), (ConsoleFamily::Ps4, 0.0)]),
        }
    }

    #[test]
    fn fallback_order() {
        let rates = card();
        assert_eq!(resolve_rate(&rates, UnitKind::Console(ConsoleFamily::Ps5)), 150.0);
        // zero family rate is unset
        assert_eq!(resolve_rate(&rates, UnitKind::Console(ConsoleFamily::Ps4)), 120.0);
        assert_eq!(resolve_rate(&rates, UnitKind::Console(ConsoleFamily::Switch)), 120.0);
        assert_eq!(resolve_rate(&rates, UnitKind::Generic), 100.0);

        let bare = RateCard {
            default_rate: 80.0,
            ..RateCard::default()
        };
        assert_eq!(resolve_rate(&bare, UnitKind::Generic), 80.0);
        assert_eq!(resolve_rate(&bare, UnitKind::Console(ConsoleFamily::Ps5)), 80.0);
    }

    #[test]
    fn explicit_zero_kind_rate_is_free() {
        let rates = RateCard {
            default_rate: 80.0,
            generic_rate: Some(0.0),
            ..RateCard::default()
        };
        assert_eq!(resolve_rate(&rates, UnitKind::Generic), 0.0);
    }

    #[test]
    fn ninety_minutes_at_one_hundred() {
        let rates = RateCard {
            default_rate: 100.0,
            ..RateCard::default()
        };
        let q = quote(&Span::new(600, 690), &rates, UnitKind::Generic);
        assert_eq!(q.duration_hours, 1.5);
        assert_eq!(q.unit_rate, 100.0);
        assert_eq!(q.total_amount, 150.0);
    }

    #[test]
    fn fractional_amounts_are_not_rounded() {
        let rates = RateCard {
            default_rate: 10.0,
            ..RateCard::default()
        };
        let q = quote(&Span::new(600, 620), &rates, UnitKind::Generic);
        assert_eq!(q.duration_hours, 20.0 / 60.0);
        assert_eq!(q.total_amount, (20.0 / 60.0) * 10.0);
    }

    #[test]
    fn midnight_crossing_duration_is_positive() {
        let q = quote(&Span::new(1380, 1500), &card(), UnitKind::Generic);
        assert_eq!(q.duration_hours, 2.0);
        assert_eq!(q.total_amount, 200.0);
    }
}
