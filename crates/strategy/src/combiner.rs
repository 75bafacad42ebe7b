use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use tracing::debug;

use common::config::{CombinerConfig, VoteCounting};
use common::{CombinedSignal, Direction, StrategyVote};

/// Folds the votes of every strategy on one (instrument, bar) into a single
/// decision. A side wins only with enough supporting votes and enough mean
/// confidence; anything else, including a long/short tie, is flat.
#[derive(Debug, Clone)]
pub struct StrategyCombiner {
    config: CombinerConfig,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    count: usize,
    confidence_sum: f64,
}

impl Tally {
    fn add(&mut self, confidence: f64) {
        self.count += 1;
        self.confidence_sum += confidence;
    }

    fn mean_confidence(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.confidence_sum / self.count as f64
        }
    }
}

impl StrategyCombiner {
    pub fn new(config: CombinerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CombinerConfig {
        &self.config
    }

    pub fn combine(
        &self,
        instrument: &str,
        timestamp: DateTime<Utc>,
        votes: &[StrategyVote],
    ) -> CombinedSignal {
        let mut long = Tally::default();
        let mut short = Tally::default();

        for vote in votes {
            if vote.instrument != instrument || vote.timestamp != timestamp {
                debug!(
                    strategy = %vote.strategy,
                    instrument = %vote.instrument,
                    expected = %instrument,
                    "Ignoring vote for another bar"
                );
                continue;
            }
            match vote.direction {
                Direction::Long => long.add(vote.confidence),
                Direction::Short => short.add(vote.confidence),
                Direction::Flat => {}
            }
        }

        let (direction, side, other) = match long.count.cmp(&short.count) {
            Ordering::Greater => (Direction::Long, long, short),
            Ordering::Less => (Direction::Short, short, long),
            Ordering::Equal => return CombinedSignal::flat(instrument, timestamp),
        };

        let support = match self.config.counting {
            VoteCounting::Support => side.count,
            VoteCounting::Net => side.count - other.count,
        };
        let confidence = side.mean_confidence();

        if support < self.config.min_votes || confidence < self.config.min_confidence {
            debug!(
                instrument,
                leaning = %direction,
                support,
                confidence,
                "Combined signal below thresholds"
            );
            return CombinedSignal::flat(instrument, timestamp);
        }

        CombinedSignal {
            instrument: instrument.to_string(),
            timestamp,
            direction,
            supporting_votes: support,
            confidence,
        }
    }
}
