use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::Result;

/// One message on the bar feed, encoded as a single JSON line tagged by
/// `type`. A live adapter and the backtest price server speak the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedMessage {
    /// One bar for one instrument.
    Bar(RawBar),
    /// Every bar of the current period has been delivered.
    BatchEnd,
    /// The server is done; no more bars will follow.
    Exit,
}

/// A bar as it arrives on the wire, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawBar {
    pub instrument: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: f64,
    pub timestamp: RawTimestamp,
}

/// Bar close time: epoch milliseconds, or a date-time string in one of the
/// formats the normalizer understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Millis(i64),
    Text(String),
}

/// Subscription request sent to a networked feed before reading.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename = "subscribe")]
pub struct Subscribe<'a> {
    pub instruments: &'a [String],
}

/// Source of feed messages for one worker.
///
/// `None` means the feed ended cleanly. `Some(Err(Error::Json(_)))` is a
/// single malformed line and reading may continue; any other error is a
/// transport failure.
#[async_trait]
pub trait FeedSource: Send {
    async fn next(&mut self) -> Option<Result<FeedMessage>>;
}

#[async_trait]
impl<T: FeedSource + ?Sized> FeedSource for Box<T> {
    async fn next(&mut self) -> Option<Result<FeedMessage>> {
        (**self).next().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bar_with_millis() {
        let line = r#"{"type":"bar","instrument":"TKR","open":1,"high":2,"low":0.5,"close":1.5,"volume":10,"timestamp":1700000000000}"#;
        let msg: FeedMessage = serde_json::from_str(line).unwrap();
        match msg {
            FeedMessage::Bar(bar) => {
                assert_eq!(bar.instrument, "TKR");
                assert_eq!(bar.timestamp, RawTimestamp::Millis(1_700_000_000_000));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn parses_bar_with_text_time_and_no_volume() {
        let line = r#"{"type":"bar","instrument":"TKR","open":1,"high":2,"low":0.5,"close":1.5,"timestamp":"20240102 09:31:00"}"#;
        let msg: FeedMessage = serde_json::from_str(line).unwrap();
        let FeedMessage::Bar(bar) = msg else {
            panic!("expected bar");
        };
        assert_eq!(bar.volume, 0.0);
        assert_eq!(bar.timestamp, RawTimestamp::Text("20240102 09:31:00".into()));
    }

    #[test]
    fn parses_control_messages() {
        let end: FeedMessage = serde_json::from_str(r#"{"type":"batch_end"}"#).unwrap();
        assert_eq!(end, FeedMessage::BatchEnd);
        let exit: FeedMessage = serde_json::from_str(r#"{"type":"exit"}"#).unwrap();
        assert_eq!(exit, FeedMessage::Exit);
    }

    #[test]
    fn subscribe_shape() {
        let instruments = vec!["A".to_string(), "B".to_string()];
        let json = serde_json::to_string(&Subscribe { instruments: &instruments }).unwrap();
        assert_eq!(json, r#"{"type":"subscribe","instruments":["A","B"]}"#);
    }
}
