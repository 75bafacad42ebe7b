pub mod macd;
pub mod rsi;
pub mod sma;

pub use macd::{MacdIndicator, MacdSignal};
pub use rsi::RsiIndicator;
pub use sma::MaCrossIndicator;
