/// Small-over-large moving average ratio on bar mid prices.
///
/// A ratio crossing above 1 means the short-term average has overtaken the
/// long-term one (trend turning up); crossing below 1 is the reverse.
#[derive(Debug, Clone)]
pub struct MaCrossIndicator {
    pub small: usize,
    pub large: usize,
}

impl MaCrossIndicator {
    /// Callers validate `0 < small < large`.
    pub fn new(small: usize, large: usize) -> Self {
        debug_assert!(small > 0 && small < large);
        Self { small, large }
    }

    /// small-SMA / large-SMA over the tail of `prices`, or `None` with fewer
    /// than `large` values.
    pub fn ratio(&self, prices: &[f64]) -> Option<f64> {
        if prices.len() < self.large {
            return None;
        }
        let large = mean(&prices[prices.len() - self.large..]);
        let small = mean(&prices[prices.len() - self.small..]);
        if large == 0.0 {
            return None;
        }
        Some(small / large)
    }
}

fn mean(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratio_needs_large_window() {
        let ma = MaCrossIndicator::new(2, 4);
        assert!(ma.ratio(&[1.0, 2.0, 3.0]).is_none());
        assert!(ma.ratio(&[1.0, 2.0, 3.0, 4.0]).is_some());
    }

    #[test]
    fn rising_prices_put_small_above_large() {
        let ma = MaCrossIndicator::new(2, 4);
        // small = 3.5, large = 2.5
        let r = ma.ratio(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!((r - 1.4).abs() < 1e-12);
    }

    #[test]
    fn only_the_tail_counts() {
        let ma = MaCrossIndicator::new(1, 2);
        let r = ma.ratio(&[1000.0, 10.0, 10.0]).unwrap();
        assert!((r - 1.0).abs() < 1e-12);
    }
}
