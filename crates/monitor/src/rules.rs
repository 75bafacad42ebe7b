use chrono::Duration;
use serde::{Deserialize, Serialize};

use common::config::{ExitConfig, MAX_CONFIRMATION_TIMEOUT_SECS, MAX_TIMEOUT_MINUTES};
use common::{CloseReason, Position, PriceBar};

/// Slack for float comparisons at the exact threshold (100 → 98 is a 2% loss).
const EPSILON: f64 = 1e-12;

/// Exit rules for the monitored positions of one instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitRules {
    /// Maximum adverse move before closing, as a fraction (0.02 = 2%).
    pub stop_loss_pct: Option<f64>,
    /// Favourable move that locks in the gain, as a fraction.
    pub take_profit_pct: Option<f64>,
    /// Maximum holding time, measured in bar time from the open fill.
    pub timeout: Option<Duration>,
    /// How long `Pending`/`Closing` may wait before it is escalated.
    pub confirmation_timeout: Duration,
}

impl Default for ExitRules {
    fn default() -> Self {
        Self::from(&ExitConfig::default())
    }
}

/// Per-instrument overrides are not applied here; see
/// [`ExitConfig::for_instrument`]. Durations are clamped to the validated
/// range.
impl From<&ExitConfig> for ExitRules {
    fn from(cfg: &ExitConfig) -> Self {
        Self {
            stop_loss_pct: cfg.stop_loss_pct,
            take_profit_pct: cfg.take_profit_pct,
            timeout: cfg
                .timeout_minutes
                .map(|m| Duration::minutes(m.clamp(0, MAX_TIMEOUT_MINUTES))),
            confirmation_timeout: Duration::seconds(
                cfg.confirmation_timeout_secs
                    .clamp(0, MAX_CONFIRMATION_TIMEOUT_SECS),
            ),
        }
    }
}

impl ExitRules {
    /// The highest-priority rule that trips for `position` on `bar`:
    /// stoploss, then timeout, then take-profit, then signal reversal.
    /// `None` for positions without an open fill.
    pub fn check(&self, position: &Position, bar: &PriceBar, reversal: bool) -> Option<CloseReason> {
        let opened_at = position.opened_at?;
        let ret = position.return_at(bar.close)?;

        if let Some(stop) = self.stop_loss_pct {
            if -ret + EPSILON >= stop {
                return Some(CloseReason::StopLoss);
            }
        }
        if let Some(timeout) = self.timeout {
            if bar.timestamp - opened_at >= timeout {
                return Some(CloseReason::Timeout);
            }
        }
        if let Some(target) = self.take_profit_pct {
            if ret + EPSILON >= target {
                return Some(CloseReason::TakeProfit);
            }
        }
        if reversal {
            return Some(CloseReason::SignalReversal);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use common::{Direction, OrderIntent, PositionState};

    fn t(minute: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 9, 30, 0).unwrap() + Duration::minutes(minute)
    }

    fn monitoring(direction: Direction, open_price: f64) -> Position {
        let intent = OrderIntent::open("X", direction, t(0), open_price);
        let mut p = Position::pending(&intent);
        p.state = PositionState::Monitoring;
        p.opened_at = Some(t(0));
        p.open_price = Some(open_price);
        p
    }

    fn bar(minute: i64, close: f64) -> PriceBar {
        PriceBar {
            instrument: "X".into(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 0.0,
            timestamp: t(minute),
        }
    }

    fn rules() -> ExitRules {
        ExitRules {
            stop_loss_pct: Some(0.02),
            take_profit_pct: Some(0.05),
            timeout: Some(Duration::minutes(30)),
            confirmation_timeout: Duration::minutes(2),
        }
    }

    #[test]
    fn stop_loss_trips_at_exact_threshold() {
        let p = monitoring(Direction::Long, 100.0);
        assert_eq!(rules().check(&p, &bar(1, 98.5), false), None);
        assert_eq!(rules().check(&p, &bar(1, 98.0), false), Some(CloseReason::StopLoss));
    }

    #[test]
    fn short_stop_loss_trips_on_rise() {
        let p = monitoring(Direction::Short, 100.0);
        assert_eq!(rules().check(&p, &bar(1, 97.0), false), None);
        assert_eq!(rules().check(&p, &bar(1, 102.0), false), Some(CloseReason::StopLoss));
    }

    #[test]
    fn stop_loss_beats_timeout_and_reversal() {
        let p = monitoring(Direction::Long, 100.0);
        assert_eq!(rules().check(&p, &bar(45, 90.0), true), Some(CloseReason::StopLoss));
    }

    #[test]
    fn timeout_beats_take_profit_and_reversal() {
        let p = monitoring(Direction::Long, 100.0);
        assert_eq!(rules().check(&p, &bar(30, 110.0), true), Some(CloseReason::Timeout));
        assert_eq!(rules().check(&p, &bar(29, 110.0), true), Some(CloseReason::TakeProfit));
        assert_eq!(rules().check(&p, &bar(29, 101.0), true), Some(CloseReason::SignalReversal));
        assert_eq!(rules().check(&p, &bar(29, 101.0), false), None);
    }

    #[test]
    fn pending_position_never_trips() {
        let intent = OrderIntent::open("X", Direction::Long, t(0), 100.0);
        let p = Position::pending(&intent);
        assert_eq!(rules().check(&p, &bar(60, 1.0), true), None);
    }

    #[test]
    fn out_of_range_durations_are_clamped() {
        let cfg = ExitConfig {
            timeout_minutes: Some(i64::MAX),
            confirmation_timeout_secs: i64::MIN,
            ..ExitConfig::default()
        };
        let r = ExitRules::from(&cfg);
        assert_eq!(r.timeout, Some(Duration::minutes(MAX_TIMEOUT_MINUTES)));
        assert_eq!(r.confirmation_timeout, Duration::zero());
    }

    #[test]
    fn defaults_match_config_defaults() {
        let r = ExitRules::default();
        assert_eq!(r.stop_loss_pct, None);
        assert_eq!(r.timeout, Some(Duration::minutes(30)));
        assert_eq!(r.confirmation_timeout, Duration::seconds(120));
    }
}
