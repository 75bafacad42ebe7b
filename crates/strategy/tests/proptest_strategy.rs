use std::collections::HashMap;

use chrono::{Duration, TimeZone, Utc};
use common::config::{CombinerConfig, StrategyConfig, VoteCounting};
use common::{Direction, InstrumentGroup, PriceBar, StrategyVote};
use proptest::prelude::*;
use strategy::{StrategyCombiner, StrategyRegistry};

fn configs() -> Vec<StrategyConfig> {
    let entry = |kind: &str, name: &str, params: &[(&str, i64)]| StrategyConfig {
        strategy_type: kind.into(),
        name: name.into(),
        window: None,
        instruments: None,
        params: params
            .iter()
            .map(|(k, v)| (k.to_string(), toml::Value::Integer(*v)))
            .collect::<HashMap<_, _>>(),
    };
    vec![
        entry("rsi", "rsi", &[("period", 5)]),
        entry("macd", "macd", &[("fast", 3), ("slow", 6), ("signal", 3)]),
        entry("ma_cross", "ma", &[("small", 3), ("large", 8)]),
    ]
}

fn bars(closes: &[f64]) -> Vec<PriceBar> {
    let start = Utc.with_ymd_and_hms(2024, 1, 2, 9, 30, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &c)| PriceBar {
            instrument: "X".into(),
            open: c,
            high: c * 1.01,
            low: c * 0.99,
            close: c,
            volume: 100.0,
            timestamp: start + Duration::minutes(i as i64),
        })
        .collect()
}

fn run(closes: &[f64]) -> Vec<StrategyVote> {
    let group = InstrumentGroup::new(1, vec!["X".into()]);
    let mut registry = StrategyRegistry::from_config(&configs(), &group).unwrap();
    bars(closes)
        .iter()
        .flat_map(|bar| registry.evaluate(bar))
        .collect()
}

fn direction() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Long), Just(Direction::Short), Just(Direction::Flat)]
}

proptest! {
    /// Replaying the same bars through fresh strategy instances yields the
    /// same votes.
    #[test]
    fn strategies_are_deterministic(closes in prop::collection::vec(1.0f64..500.0, 1..80)) {
        prop_assert_eq!(run(&closes), run(&closes));
    }

    /// Fewer supporting votes than required never resolves to a side.
    #[test]
    fn below_min_votes_is_flat(
        dirs in prop::collection::vec(direction(), 0..6),
        confidence in 0.0f64..=1.0,
    ) {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 9, 31, 0).unwrap();
        let votes: Vec<StrategyVote> = dirs
            .iter()
            .enumerate()
            .map(|(i, d)| StrategyVote::new(format!("s{i}"), "X", ts, *d, confidence))
            .collect();
        let combiner = StrategyCombiner::new(CombinerConfig {
            min_votes: dirs.len() + 1,
            min_confidence: 0.0,
            counting: VoteCounting::Support,
        });
        prop_assert_eq!(combiner.combine("X", ts, &votes).direction, Direction::Flat);
    }

    /// Equal long and short support always resolves flat, whatever the
    /// confidences and thresholds.
    #[test]
    fn ties_are_flat(
        n in 1usize..5,
        flats in 0usize..3,
        long_conf in 0.0f64..=1.0,
        short_conf in 0.0f64..=1.0,
        min_votes in 1usize..4,
    ) {
        let ts = Utc.with_ymd_and_hms(2024, 1, 2, 9, 31, 0).unwrap();
        let mut votes = Vec::new();
        for i in 0..n {
            votes.push(StrategyVote::new(format!("l{i}"), "X", ts, Direction::Long, long_conf));
            votes.push(StrategyVote::new(format!("s{i}"), "X", ts, Direction::Short, short_conf));
        }
        for i in 0..flats {
            votes.push(StrategyVote::flat(format!("f{i}"), "X", ts));
        }
        for counting in [VoteCounting::Support, VoteCounting::Net] {
            let combiner = StrategyCombiner::new(CombinerConfig {
                min_votes,
                min_confidence: 0.0,
                counting,
            });
            prop_assert_eq!(combiner.combine("X", ts, &votes).direction, Direction::Flat);
        }
    }
}
