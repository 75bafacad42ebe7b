pub mod config;
pub mod error;
pub mod execution;
pub mod feed;
pub mod types;

pub use config::Settings;
pub use error::{Error, Result};
pub use execution::{ExecutionClient, ExecutionEvents};
pub use feed::{FeedMessage, FeedSource, RawBar, RawTimestamp};
pub use types::*;
