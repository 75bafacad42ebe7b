//! Worker-side evaluation: bar normalization, feed adapters, the signaller,
//! report sinks and the per-group loop that ties them together.

pub mod feed;
pub mod normalizer;
pub mod report;
pub mod signaller;
pub mod worker;

pub use feed::{open_feed, ChannelFeed, LineFeed, TcpFeed};
pub use normalizer::{BarNormalizer, Discard};
pub use report::{report_path, JsonLinesReport, NullReport, ReportSink};
pub use signaller::Signaller;
pub use worker::{SessionEnd, Worker, WorkerOutcome};
