use common::Direction;

/// RSI (Relative Strength Index) with Wilder smoothing.
///
/// Oversold readings vote long, overbought readings vote short. The further
/// past the threshold, the higher the confidence.
#[derive(Debug, Clone)]
pub struct RsiIndicator {
    pub period: usize,
    pub overbought: f64,
    pub oversold: f64,
}

impl RsiIndicator {
    /// Callers validate `period >= 2` and `0 < oversold < overbought < 100`.
    pub fn new(period: usize, overbought: f64, oversold: f64) -> Self {
        debug_assert!(period >= 2, "RSI period must be >= 2");
        Self {
            period,
            overbought,
            oversold,
        }
    }

    /// RSI of `closes` (oldest first), or `None` with fewer than
    /// `period + 1` values.
    pub fn compute(&self, closes: &[f64]) -> Option<f64> {
        if closes.len() < self.period + 1 {
            return None;
        }
        let n = self.period as f64;
        let mut changes = closes.windows(2).map(|w| w[1] - w[0]);

        // Seed with the simple average of the first `period` changes.
        let (mut avg_gain, mut avg_loss) = changes
            .by_ref()
            .take(self.period)
            .fold((0.0, 0.0), |(g, l), c| (g + c.max(0.0), l + (-c).max(0.0)));
        avg_gain /= n;
        avg_loss /= n;

        for change in changes {
            avg_gain = (avg_gain * (n - 1.0) + change.max(0.0)) / n;
            avg_loss = (avg_loss * (n - 1.0) + (-change).max(0.0)) / n;
        }

        if avg_loss == 0.0 {
            return Some(100.0);
        }
        Some(100.0 - 100.0 / (1.0 + avg_gain / avg_loss))
    }

    /// Direction and confidence for an RSI reading. Confidence is 0.5 at the
    /// threshold and 1.0 at the extreme (0 or 100).
    pub fn classify(&self, rsi: f64) -> (Direction, f64) {
        if rsi <= self.oversold {
            let depth = (self.oversold - rsi) / self.oversold;
            (Direction::Long, 0.5 + 0.5 * depth)
        } else if rsi >= self.overbought {
            let depth = (rsi - self.overbought) / (100.0 - self.overbought);
            (Direction::Short, 0.5 + 0.5 * depth)
        } else {
            (Direction::Flat, 0.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rsi14() -> RsiIndicator {
        RsiIndicator::new(14, 70.0, 30.0)
    }

    #[test]
    fn needs_period_plus_one_closes() {
        assert!(rsi14().compute(&[100.0; 14]).is_none());
        let prices: Vec<f64> = (0..15).map(|i| 100.0 + i as f64).collect();
        assert!(rsi14().compute(&prices).is_some());
    }

    #[test]
    fn monotonic_series_hit_the_extremes() {
        let rsi = RsiIndicator::new(3, 70.0, 30.0);
        let up = rsi.compute(&[10.0, 11.0, 12.0, 13.0, 14.0]).unwrap();
        let down = rsi.compute(&[14.0, 13.0, 12.0, 11.0, 10.0]).unwrap();
        assert!((up - 100.0).abs() < 1e-9, "got {up}");
        assert!(down.abs() < 1e-9, "got {down}");
    }

    #[test]
    fn mixed_series_stays_in_range() {
        let prices = [
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.15, 43.61, 44.33, 44.83, 45.10,
            45.15, 44.34, 44.09,
        ];
        let v = rsi14().compute(&prices).unwrap();
        assert!((0.0..=100.0).contains(&v), "RSI out of range: {v}");
    }

    #[test]
    fn classify_maps_zones_to_votes() {
        let rsi = rsi14();
        assert_eq!(rsi.classify(50.0), (Direction::Flat, 0.0));

        let (dir, conf) = rsi.classify(30.0);
        assert_eq!(dir, Direction::Long);
        assert!((conf - 0.5).abs() < 1e-12);

        let (dir, conf) = rsi.classify(0.0);
        assert_eq!(dir, Direction::Long);
        assert!((conf - 1.0).abs() < 1e-12);

        let (dir, conf) = rsi.classify(85.0);
        assert_eq!(dir, Direction::Short);
        assert!((conf - 0.75).abs() < 1e-12);
    }
}
