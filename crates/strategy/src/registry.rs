use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use common::config::StrategyConfig;
use common::{Direction, InstrumentGroup, PriceBar, StrategyVote};

use crate::indicators::{MaCrossIndicator, MacdIndicator, MacdSignal, RsiIndicator};
use crate::{Strategy, StrategyError};

/// Holds every strategy instance of one worker and feeds them bars.
///
/// Each instrument gets its own freshly built strategy set and its own
/// bounded bar history, so nothing is shared between instruments.
pub struct StrategyRegistry {
    books: HashMap<String, InstrumentBook>,
}

struct InstrumentBook {
    strategies: Vec<Box<dyn Strategy>>,
    /// Rolling history sized to the largest window of `strategies`.
    history: VecDeque<PriceBar>,
    capacity: usize,
}

impl InstrumentBook {
    fn new(strategies: Vec<Box<dyn Strategy>>) -> Self {
        let capacity = strategies.iter().map(|s| s.window()).max().unwrap_or(1).max(1);
        Self {
            strategies,
            history: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, bar: PriceBar) {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(bar);
    }
}

impl StrategyRegistry {
    /// Build one strategy set per instrument of `group`.
    pub fn from_config(
        configs: &[StrategyConfig],
        group: &InstrumentGroup,
    ) -> Result<Self, StrategyError> {
        // Reject bad entries even when no instrument of this group uses them.
        for cfg in configs {
            build_strategy(cfg)?;
        }

        let mut books = HashMap::new();
        for instrument in &group.instruments {
            let strategies = configs
                .iter()
                .filter(|cfg| applies_to(cfg, instrument))
                .map(build_strategy)
                .collect::<Result<Vec<_>, _>>()?;
            if strategies.is_empty() {
                warn!(instrument = %instrument, "No strategy applies to instrument");
            }
            for s in &strategies {
                info!(name = %s.name(), instrument = %instrument, window = s.window(), "Registered strategy");
            }
            books.insert(instrument.clone(), InstrumentBook::new(strategies));
        }

        Ok(Self { books })
    }

    /// Build from ready-made strategy sets, one entry per instrument.
    pub fn from_strategies(sets: Vec<(String, Vec<Box<dyn Strategy>>)>) -> Self {
        let books = sets
            .into_iter()
            .map(|(instrument, strategies)| (instrument, InstrumentBook::new(strategies)))
            .collect();
        Self { books }
    }

    pub fn strategy_count(&self, instrument: &str) -> usize {
        self.books.get(instrument).map_or(0, |b| b.strategies.len())
    }

    /// Append `bar` to its instrument's history and collect one vote from
    /// every strategy registered for that instrument.
    ///
    /// A strategy that errors or panics is logged and replaced by a flat,
    /// zero-confidence vote for this bar; the others still run.
    pub fn evaluate(&mut self, bar: &PriceBar) -> Vec<StrategyVote> {
        let Some(book) = self.books.get_mut(&bar.instrument) else {
            warn!(instrument = %bar.instrument, "Bar for instrument without strategies");
            return Vec::new();
        };
        book.push(bar.clone());

        let InstrumentBook {
            strategies,
            history,
            ..
        } = book;
        let bars: &[PriceBar] = history.make_contiguous();

        strategies
            .iter_mut()
            .map(|s| {
                let window = s.window().clamp(1, bars.len());
                let slice = &bars[bars.len() - window..];
                run_guarded(s.as_mut(), &bar.instrument, slice, bar.timestamp)
            })
            .collect()
    }
}

fn run_guarded(
    strategy: &mut dyn Strategy,
    instrument: &str,
    bars: &[PriceBar],
    timestamp: DateTime<Utc>,
) -> StrategyVote {
    let name = strategy.name().to_string();
    match panic::catch_unwind(AssertUnwindSafe(|| strategy.evaluate(instrument, bars))) {
        Ok(Ok(vote)) => {
            debug!(
                strategy = %name,
                instrument,
                direction = %vote.direction,
                confidence = vote.confidence,
                "Vote"
            );
            vote
        }
        Ok(Err(e)) => {
            error!(strategy = %name, instrument, error = %e, "Strategy fault, voting flat");
            StrategyVote::flat(name, instrument, timestamp)
        }
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(strategy = %name, instrument, reason = %reason, "Strategy panicked, voting flat");
            StrategyVote::flat(name, instrument, timestamp)
        }
    }
}

fn applies_to(cfg: &StrategyConfig, instrument: &str) -> bool {
    cfg.instruments
        .as_ref()
        .map_or(true, |list| list.iter().any(|i| i == instrument))
}

// ─── Strategy builders ────────────────────────────────────────────────────────

fn build_strategy(cfg: &StrategyConfig) -> Result<Box<dyn Strategy>, StrategyError> {
    let params = Params { cfg };
    match cfg.strategy_type.as_str() {
        "rsi" => {
            let period = params.usize("period", 14)?;
            let overbought = params.f64("overbought", 70.0)?;
            let oversold = params.f64("oversold", 30.0)?;
            if period < 2 {
                return Err(params.invalid("period", "must be at least 2"));
            }
            if !(0.0 < oversold && oversold < overbought && overbought < 100.0) {
                return Err(params.invalid(
                    "oversold",
                    "need 0 < oversold < overbought < 100",
                ));
            }
            let window = params.window(period * 5, period + 1)?;
            Ok(Box::new(RsiStrategy {
                name: cfg.name.clone(),
                window,
                indicator: RsiIndicator::new(period, overbought, oversold),
            }))
        }
        "macd" => {
            let fast = params.usize("fast", 12)?;
            let slow = params.usize("slow", 26)?;
            let signal = params.usize("signal", 9)?;
            if fast >= slow {
                return Err(params.invalid("fast", "must be less than slow"));
            }
            let confidence = params.confidence(0.7)?;
            let window = params.window((slow + signal) * 3, slow + signal)?;
            Ok(Box::new(MacdStrategy {
                name: cfg.name.clone(),
                window,
                confidence,
                indicator: MacdIndicator::new(fast, slow, signal),
            }))
        }
        "ma_cross" => {
            let small = params.usize("small", 5)?;
            let large = params.usize("large", 20)?;
            if small >= large {
                return Err(params.invalid("small", "must be less than large"));
            }
            let confidence = params.confidence(0.6)?;
            let window = params.window(large, large)?;
            Ok(Box::new(MaCrossStrategy {
                name: cfg.name.clone(),
                window,
                confidence,
                indicator: MaCrossIndicator::new(small, large),
                previous_ratio: None,
            }))
        }
        other => Err(StrategyError::UnknownType(other.to_string())),
    }
}

struct Params<'a> {
    cfg: &'a StrategyConfig,
}

impl Params<'_> {
    fn f64(&self, key: &str, default: f64) -> Result<f64, StrategyError> {
        match self.cfg.params.get(key) {
            None => Ok(default),
            Some(v) => v
                .as_float()
                .or_else(|| v.as_integer().map(|i| i as f64))
                .filter(|x| x.is_finite())
                .ok_or_else(|| self.invalid(key, "expected a number")),
        }
    }

    fn usize(&self, key: &str, default: usize) -> Result<usize, StrategyError> {
        match self.cfg.params.get(key) {
            None => Ok(default),
            Some(v) => v
                .as_integer()
                .filter(|i| *i > 0)
                .map(|i| i as usize)
                .ok_or_else(|| self.invalid(key, "expected a positive integer")),
        }
    }

    fn confidence(&self, default: f64) -> Result<f64, StrategyError> {
        let c = self.f64("confidence", default)?;
        if !(0.0..=1.0).contains(&c) {
            return Err(self.invalid("confidence", "must be within [0, 1]"));
        }
        Ok(c)
    }

    fn window(&self, default: usize, min: usize) -> Result<usize, StrategyError> {
        let window = self.cfg.window.unwrap_or(default);
        if window < min {
            return Err(self.invalid("window", format!("must be at least {min}")));
        }
        Ok(window)
    }

    fn invalid(&self, param: &str, reason: impl Into<String>) -> StrategyError {
        StrategyError::InvalidParam {
            strategy: self.cfg.name.clone(),
            param: param.to_string(),
            reason: reason.into(),
        }
    }
}

fn latest(name: &str, instrument: &str, bars: &[PriceBar]) -> Result<DateTime<Utc>, StrategyError> {
    bars.last()
        .map(|b| b.timestamp)
        .ok_or_else(|| StrategyError::Evaluation {
            strategy: name.to_string(),
            instrument: instrument.to_string(),
            reason: "empty bar window".to_string(),
        })
}

// ─── Concrete strategy types ──────────────────────────────────────────────────

struct RsiStrategy {
    name: String,
    window: usize,
    indicator: RsiIndicator,
}

impl Strategy for RsiStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn window(&self) -> usize {
        self.window
    }

    fn evaluate(
        &mut self,
        instrument: &str,
        bars: &[PriceBar],
    ) -> Result<StrategyVote, StrategyError> {
        let timestamp = latest(&self.name, instrument, bars)?;
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let (direction, confidence) = match self.indicator.compute(&closes) {
            Some(rsi) => self.indicator.classify(rsi),
            None => (Direction::Flat, 0.0),
        };
        Ok(StrategyVote::new(&self.name, instrument, timestamp, direction, confidence))
    }
}

struct MacdStrategy {
    name: String,
    window: usize,
    confidence: f64,
    indicator: MacdIndicator,
}

impl Strategy for MacdStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn window(&self) -> usize {
        self.window
    }

    fn evaluate(
        &mut self,
        instrument: &str,
        bars: &[PriceBar],
    ) -> Result<StrategyVote, StrategyError> {
        let timestamp = latest(&self.name, instrument, bars)?;
        let closes: Vec<f64> = bars.iter().map(|b| b.close).collect();
        let vote = match self.indicator.compute(&closes) {
            Some(MacdSignal::Bullish) => (Direction::Long, self.confidence),
            Some(MacdSignal::Bearish) => (Direction::Short, self.confidence),
            Some(MacdSignal::Neutral) | None => (Direction::Flat, 0.0),
        };
        Ok(StrategyVote::new(&self.name, instrument, timestamp, vote.0, vote.1))
    }
}

/// Votes once per crossing of the small/large average ratio through 1.
struct MaCrossStrategy {
    name: String,
    window: usize,
    confidence: f64,
    indicator: MaCrossIndicator,
    previous_ratio: Option<f64>,
}

impl Strategy for MaCrossStrategy {
    fn name(&self) -> &str {
        &self.name
    }

    fn window(&self) -> usize {
        self.window
    }

    fn evaluate(
        &mut self,
        instrument: &str,
        bars: &[PriceBar],
    ) -> Result<StrategyVote, StrategyError> {
        let timestamp = latest(&self.name, instrument, bars)?;
        let mids: Vec<f64> = bars.iter().map(PriceBar::mid).collect();
        let ratio = self.indicator.ratio(&mids);

        let direction = match (self.previous_ratio, ratio) {
            (Some(prev), Some(curr)) if prev <= 1.0 && curr > 1.0 => Direction::Long,
            (Some(prev), Some(curr)) if prev >= 1.0 && curr < 1.0 => Direction::Short,
            _ => Direction::Flat,
        };
        if ratio.is_some() {
            self.previous_ratio = ratio;
        }

        let confidence = if direction.is_flat() { 0.0 } else { self.confidence };
        Ok(StrategyVote::new(&self.name, instrument, timestamp, direction, confidence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap as Map;

    fn bar(instrument: &str, minute: i64, close: f64) -> PriceBar {
        PriceBar {
            instrument: instrument.into(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
            timestamp: Utc.with_ymd_and_hms(2024, 1, 2, 9, 30, 0).unwrap()
                + Duration::minutes(minute),
        }
    }

    fn cfg(kind: &str, name: &str, params: &[(&str, toml::Value)]) -> StrategyConfig {
        StrategyConfig {
            strategy_type: kind.into(),
            name: name.into(),
            window: None,
            instruments: None,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect::<Map<_, _>>(),
        }
    }

    fn group(instruments: &[&str]) -> InstrumentGroup {
        InstrumentGroup::new(1, instruments.iter().map(|s| s.to_string()).collect())
    }

    /// Records how many bars it was shown; optionally fails or panics.
    struct Probe {
        window: usize,
        seen: std::sync::Arc<std::sync::Mutex<Vec<usize>>>,
        mode: ProbeMode,
    }

    #[derive(Clone, Copy)]
    enum ProbeMode {
        Long,
        Fail,
        Panic,
    }

    impl Strategy for Probe {
        fn name(&self) -> &str {
            match self.mode {
                ProbeMode::Long => "probe",
                ProbeMode::Fail => "failing",
                ProbeMode::Panic => "panicking",
            }
        }

        fn window(&self) -> usize {
            self.window
        }

        fn evaluate(
            &mut self,
            instrument: &str,
            bars: &[PriceBar],
        ) -> Result<StrategyVote, StrategyError> {
            self.seen.lock().unwrap().push(bars.len());
            let ts = bars.last().unwrap().timestamp;
            match self.mode {
                ProbeMode::Long => Ok(StrategyVote::new("probe", instrument, ts, Direction::Long, 0.9)),
                ProbeMode::Fail => Err(StrategyError::Evaluation {
                    strategy: "failing".into(),
                    instrument: instrument.into(),
                    reason: "boom".into(),
                }),
                ProbeMode::Panic => panic!("indicator blew up"),
            }
        }
    }

    fn probe(window: usize, mode: ProbeMode) -> (Box<dyn Strategy>, std::sync::Arc<std::sync::Mutex<Vec<usize>>>) {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        (
            Box::new(Probe {
                window,
                seen: seen.clone(),
                mode,
            }),
            seen,
        )
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = StrategyRegistry::from_config(&[cfg("magic", "m", &[])], &group(&["A"]))
            .err()
            .unwrap();
        assert!(matches!(err, StrategyError::UnknownType(t) if t == "magic"));
    }

    #[test]
    fn invalid_params_are_rejected() {
        let bad = cfg(
            "macd",
            "m",
            &[("fast", toml::Value::Integer(30)), ("slow", toml::Value::Integer(26))],
        );
        assert!(matches!(
            StrategyRegistry::from_config(&[bad], &group(&["A"])),
            Err(StrategyError::InvalidParam { .. })
        ));

        let mut small_window = cfg("rsi", "r", &[]);
        small_window.window = Some(5);
        assert!(matches!(
            StrategyRegistry::from_config(&[small_window], &group(&["A"])),
            Err(StrategyError::InvalidParam { param, .. }) if param == "window"
        ));
    }

    #[test]
    fn instrument_filter_limits_strategies() {
        let mut only_a = cfg("rsi", "rsi-a", &[]);
        only_a.instruments = Some(vec!["A".into()]);
        let everywhere = cfg("ma_cross", "ma", &[]);
        let reg = StrategyRegistry::from_config(&[only_a, everywhere], &group(&["A", "B"])).unwrap();
        assert_eq!(reg.strategy_count("A"), 2);
        assert_eq!(reg.strategy_count("B"), 1);
    }

    #[test]
    fn window_bounds_history_passed_to_strategy() {
        let (s, seen) = probe(3, ProbeMode::Long);
        let mut reg = StrategyRegistry::from_strategies(vec![("A".into(), vec![s])]);
        for m in 0..6 {
            reg.evaluate(&bar("A", m, 100.0));
        }
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 3, 3, 3]);
    }

    #[test]
    fn faulting_strategies_degrade_to_flat_without_stopping_others() {
        let (good, good_seen) = probe(2, ProbeMode::Long);
        let (failing, _) = probe(2, ProbeMode::Fail);
        let (panicking, _) = probe(2, ProbeMode::Panic);
        let mut reg =
            StrategyRegistry::from_strategies(vec![("A".into(), vec![failing, panicking, good])]);

        let votes = reg.evaluate(&bar("A", 1, 100.0));
        assert_eq!(votes.len(), 3);
        assert_eq!(votes[0].direction, Direction::Flat);
        assert_eq!(votes[0].confidence, 0.0);
        assert_eq!(votes[0].strategy, "failing");
        assert_eq!(votes[1].direction, Direction::Flat);
        assert_eq!(votes[1].strategy, "panicking");
        assert_eq!(votes[2].direction, Direction::Long);
        assert_eq!(good_seen.lock().unwrap().len(), 1);

        // Still running on the next bar.
        let votes = reg.evaluate(&bar("A", 2, 101.0));
        assert_eq!(votes[2].direction, Direction::Long);
    }

    #[test]
    fn instruments_do_not_share_state() {
        let (a, a_seen) = probe(10, ProbeMode::Long);
        let (b, b_seen) = probe(10, ProbeMode::Long);
        let mut reg = StrategyRegistry::from_strategies(vec![("A".into(), vec![a]), ("B".into(), vec![b])]);
        for m in 0..4 {
            reg.evaluate(&bar("A", m, 100.0));
        }
        reg.evaluate(&bar("B", 0, 50.0));
        assert_eq!(a_seen.lock().unwrap().last(), Some(&4));
        assert_eq!(*b_seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn unknown_instrument_yields_no_votes() {
        let mut reg = StrategyRegistry::from_config(&[cfg("rsi", "r", &[])], &group(&["A"])).unwrap();
        assert!(reg.evaluate(&bar("ZZZ", 0, 1.0)).is_empty());
    }

    #[test]
    fn ma_cross_votes_on_crossing_only() {
        let ma = cfg(
            "ma_cross",
            "ma",
            &[("small", toml::Value::Integer(2)), ("large", toml::Value::Integer(4))],
        );
        let mut reg = StrategyRegistry::from_config(&[ma], &group(&["A"])).unwrap();
        // Falling, then rising sharply.
        let closes = [10.0, 9.0, 8.0, 7.0, 6.0, 9.0, 12.0, 15.0];
        let dirs: Vec<Direction> = closes
            .iter()
            .enumerate()
            .map(|(i, c)| reg.evaluate(&bar("A", i as i64, *c))[0].direction)
            .collect();
        let longs = dirs.iter().filter(|d| **d == Direction::Long).count();
        assert_eq!(longs, 1, "{dirs:?}");
        assert!(!dirs.contains(&Direction::Short));
    }

    #[test]
    fn rsi_votes_long_after_a_selloff() {
        let rsi = cfg("rsi", "rsi", &[("period", toml::Value::Integer(3))]);
        let mut reg = StrategyRegistry::from_config(&[rsi], &group(&["A"])).unwrap();
        let mut last = None;
        for (i, c) in [20.0, 19.0, 18.0, 17.0, 16.0].iter().enumerate() {
            last = Some(reg.evaluate(&bar("A", i as i64, *c)).remove(0));
        }
        let vote = last.unwrap();
        assert_eq!(vote.direction, Direction::Long);
        assert!((vote.confidence - 1.0).abs() < 1e-9);
    }
}
