/// MACD (Moving Average Convergence/Divergence) crossover detector.
///
/// MACD line = EMA(fast) − EMA(slow); signal line = EMA(MACD, signal).
/// Only the latest bar's crossover is reported.
#[derive(Debug, Clone)]
pub struct MacdIndicator {
    pub fast: usize,
    pub slow: usize,
    pub signal: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacdSignal {
    /// MACD crossed above the signal line on the latest bar.
    Bullish,
    /// MACD crossed below the signal line on the latest bar.
    Bearish,
    Neutral,
}

impl MacdIndicator {
    /// Callers validate `0 < fast < slow` and `signal > 0`.
    pub fn new(fast: usize, slow: usize, signal: usize) -> Self {
        debug_assert!(fast > 0 && fast < slow && signal > 0);
        Self { fast, slow, signal }
    }

    /// Fewest closes for which `compute` returns a value.
    pub fn min_len(&self) -> usize {
        self.slow + self.signal
    }

    /// Crossover state of `closes` (oldest first), or `None` with fewer than
    /// `min_len()` values.
    pub fn compute(&self, closes: &[f64]) -> Option<MacdSignal> {
        if closes.len() < self.min_len() {
            return None;
        }

        let fast = ema_series(closes, self.fast);
        let slow = ema_series(closes, self.slow);
        // Both series are aligned to `closes`; the slow EMA is defined from
        // index `slow - 1` on.
        let macd: Vec<f64> = (self.slow - 1..closes.len())
            .map(|i| fast[i] - slow[i])
            .collect();
        let signal = ema_series(&macd, self.signal);

        let n = macd.len();
        if n < self.signal + 1 {
            return None;
        }
        let (prev_macd, curr_macd) = (macd[n - 2], macd[n - 1]);
        let (prev_sig, curr_sig) = (signal[n - 2], signal[n - 1]);

        Some(if prev_macd <= prev_sig && curr_macd > curr_sig {
            MacdSignal::Bullish
        } else if prev_macd >= prev_sig && curr_macd < curr_sig {
            MacdSignal::Bearish
        } else {
            MacdSignal::Neutral
        })
    }
}

/// EMA of `data` aligned index-for-index with it. Values before
/// `period - 1` are the running SMA seed and should not be relied on.
fn ema_series(data: &[f64], period: usize) -> Vec<f64> {
    let mut out = Vec::with_capacity(data.len());
    if data.is_empty() || period == 0 {
        return out;
    }
    let k = 2.0 / (period as f64 + 1.0);
    let mut sum = 0.0;
    let mut prev = 0.0;
    for (i, &x) in data.iter().enumerate() {
        let value = if i < period {
            sum += x;
            sum / (i + 1) as f64
        } else {
            x * k + prev * (1.0 - k)
        };
        out.push(value);
        prev = value;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_with_insufficient_data() {
        let macd = MacdIndicator::new(12, 26, 9);
        assert!(macd.compute(&[100.0; 34]).is_none());
        assert!(macd.compute(&[100.0; 35]).is_some());
    }

    #[test]
    fn flat_prices_are_neutral() {
        let macd = MacdIndicator::new(3, 6, 3);
        assert_eq!(macd.compute(&[50.0; 30]), Some(MacdSignal::Neutral));
    }

    #[test]
    fn reversal_from_decline_turns_bullish() {
        let macd = MacdIndicator::new(3, 6, 3);
        let mut prices: Vec<f64> = (0..20).map(|i| 100.0 - 0.05 * (i * i) as f64).collect();
        // Accelerating decline keeps MACD strictly under its signal line.
        let mut saw_bullish = false;
        for i in 0..10 {
            prices.push(82.0 + i as f64 * 3.0);
            if macd.compute(&prices) == Some(MacdSignal::Bullish) {
                saw_bullish = true;
                break;
            }
        }
        assert!(saw_bullish);
    }

    #[test]
    fn rally_then_drop_turns_bearish() {
        let macd = MacdIndicator::new(3, 6, 3);
        let mut prices: Vec<f64> = (0..20).map(|i| 100.0 + 0.05 * (i * i) as f64).collect();
        let mut saw_bearish = false;
        for i in 0..10 {
            prices.push(118.0 - i as f64 * 3.0);
            if macd.compute(&prices) == Some(MacdSignal::Bearish) {
                saw_bearish = true;
                break;
            }
        }
        assert!(saw_bearish);
    }

    #[test]
    fn ema_series_seeds_with_running_mean() {
        let s = ema_series(&[2.0, 4.0, 6.0, 8.0], 3);
        assert_eq!(s.len(), 4);
        assert!((s[1] - 3.0).abs() < 1e-12);
        assert!((s[2] - 4.0).abs() < 1e-12);
        // k = 0.5: 8 * 0.5 + 4 * 0.5
        assert!((s[3] - 6.0).abs() < 1e-12);
    }
}
