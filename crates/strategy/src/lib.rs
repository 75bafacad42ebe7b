pub mod combiner;
pub mod indicators;
pub mod registry;

pub use combiner::StrategyCombiner;
pub use registry::StrategyRegistry;

use common::{PriceBar, StrategyVote};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("unknown strategy type '{0}'")]
    UnknownType(String),

    #[error("strategy '{strategy}': invalid parameter '{param}': {reason}")]
    InvalidParam {
        strategy: String,
        param: String,
        reason: String,
    },

    #[error("strategy '{strategy}' failed on {instrument}: {reason}")]
    Evaluation {
        strategy: String,
        instrument: String,
        reason: String,
    },
}

/// All strategy implementations must satisfy this trait.
///
/// One instance serves exactly one instrument, so any incremental state an
/// implementation keeps is per-instrument by construction.
pub trait Strategy: Send {
    /// Human-readable name of this strategy instance.
    fn name(&self) -> &str;

    /// Number of most recent bars this strategy wants to see.
    fn window(&self) -> usize;

    /// Vote on the newest bar.
    ///
    /// `bars` is oldest first, ends with the bar being evaluated and holds at
    /// most `window()` bars. The same sequence of calls on a fresh instance
    /// must produce the same votes.
    fn evaluate(&mut self, instrument: &str, bars: &[PriceBar])
        -> Result<StrategyVote, StrategyError>;
}
