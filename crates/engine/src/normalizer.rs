use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, TimeZone, Utc};
use thiserror::Error;
use tracing::warn;

use common::config::MAX_TIME_OFFSET_MINUTES;
use common::{InstrumentGroup, PriceBar, RawBar, RawTimestamp};

/// Zone-less layouts accepted for text bar times, tried in order.
const TEXT_FORMATS: &[&str] = &[
    "%Y%m%d %H:%M:%S",
    "%Y%m%d  %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
];

/// Why a raw bar never reached the strategies.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Discard {
    #[error("instrument {0} is not assigned to this group")]
    ForeignInstrument(String),
    #[error("{instrument} bar at {timestamp} is not after the last accepted bar at {last}")]
    OutOfOrder {
        instrument: String,
        timestamp: DateTime<Utc>,
        last: DateTime<Utc>,
    },
    #[error("malformed bar: {0}")]
    Malformed(String),
}

/// Turns raw feed bars into validated [`PriceBar`]s for one group.
///
/// Enforces group membership, sane prices and strictly increasing timestamps
/// per instrument. Rejected bars are counted and logged, never propagated.
pub struct BarNormalizer {
    group_id: usize,
    instruments: HashSet<String>,
    time_offset: Duration,
    last_seen: HashMap<String, DateTime<Utc>>,
    accepted: u64,
    discarded: u64,
}

impl BarNormalizer {
    /// `time_offset_minutes` is clamped to a day either way.
    pub fn new(group: &InstrumentGroup, time_offset_minutes: i64) -> Self {
        let offset = time_offset_minutes.clamp(-MAX_TIME_OFFSET_MINUTES, MAX_TIME_OFFSET_MINUTES);
        Self {
            group_id: group.id,
            instruments: group.instruments.iter().cloned().collect(),
            time_offset: Duration::minutes(offset),
            last_seen: HashMap::new(),
            accepted: 0,
            discarded: 0,
        }
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Count a feed line that could not even be parsed.
    pub fn note_malformed_line(&mut self) {
        self.discarded += 1;
    }

    pub fn normalize(&mut self, raw: RawBar) -> Result<PriceBar, Discard> {
        match self.check(raw) {
            Ok(bar) => {
                self.last_seen.insert(bar.instrument.clone(), bar.timestamp);
                self.accepted += 1;
                Ok(bar)
            }
            Err(discard) => {
                self.discarded += 1;
                warn!(group = self.group_id, reason = %discard, "Bar discarded");
                Err(discard)
            }
        }
    }

    fn check(&self, raw: RawBar) -> Result<PriceBar, Discard> {
        if !self.instruments.contains(&raw.instrument) {
            return Err(Discard::ForeignInstrument(raw.instrument));
        }

        for (field, value) in [
            ("open", raw.open),
            ("high", raw.high),
            ("low", raw.low),
            ("close", raw.close),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return Err(Discard::Malformed(format!(
                    "{} {field} = {value}",
                    raw.instrument
                )));
            }
        }
        if raw.high < raw.low {
            return Err(Discard::Malformed(format!(
                "{} high {} below low {}",
                raw.instrument, raw.high, raw.low
            )));
        }
        if !(raw.volume.is_finite() && raw.volume >= 0.0) {
            return Err(Discard::Malformed(format!(
                "{} volume = {}",
                raw.instrument, raw.volume
            )));
        }

        let timestamp = self.parse_time(&raw.timestamp).ok_or_else(|| {
            Discard::Malformed(format!("{} timestamp {:?}", raw.instrument, raw.timestamp))
        })?;

        if let Some(&last) = self.last_seen.get(&raw.instrument) {
            if timestamp <= last {
                return Err(Discard::OutOfOrder {
                    instrument: raw.instrument,
                    timestamp,
                    last,
                });
            }
        }

        Ok(PriceBar {
            instrument: raw.instrument,
            open: raw.open,
            high: raw.high,
            low: raw.low,
            close: raw.close,
            volume: raw.volume,
            timestamp,
        })
    }

    /// Millisecond-precision UTC time. The configured offset only applies to
    /// text without a zone.
    fn parse_time(&self, raw: &RawTimestamp) -> Option<DateTime<Utc>> {
        let parsed = match raw {
            RawTimestamp::Millis(ms) => Utc.timestamp_millis_opt(*ms).single()?,
            RawTimestamp::Text(text) => {
                let text = text.trim();
                match DateTime::parse_from_rfc3339(text) {
                    Ok(dt) => dt.with_timezone(&Utc),
                    Err(_) => {
                        let naive = TEXT_FORMATS
                            .iter()
                            .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())?;
                        naive.and_utc().checked_add_signed(self.time_offset)?
                    }
                }
            }
        };
        Some(parsed.trunc_subsecs(3))
    }
}
