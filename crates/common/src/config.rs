use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

pub const DEFAULT_CONFIG_PATH: &str = "config/quorum.toml";

/// Upper bounds for the duration settings: one year of holding time, one day
/// of confirmation wait, and a day of clock offset either way.
pub const MAX_TIMEOUT_MINUTES: i64 = 366 * 24 * 60;
pub const MAX_CONFIRMATION_TIMEOUT_SECS: i64 = 24 * 60 * 60;
pub const MAX_TIME_OFFSET_MINUTES: i64 = 24 * 60;

/// Everything a run needs, loaded from one TOML file shared by the
/// orchestrator and every worker it spawns.
///
/// Example `config/quorum.toml`:
/// ```toml
/// name = "example"
///
/// [universe]
/// instruments = ["AAA", "BBB", "CCC"]
///
/// [partition]
/// processes = 2
///
/// [[strategy]]
/// type = "rsi"
/// name = "rsi-14"
///
/// [strategy.params]
/// period = 14
///
/// [combiner]
/// min_votes = 2
/// min_confidence = 0.5
///
/// [exits]
/// stop_loss_pct = 0.02
/// timeout_minutes = 30
///
/// [feed]
/// kind = "file"
/// path = "data/bars.jsonl"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    /// Run name, used in log and report file names.
    #[serde(default = "default_name")]
    pub name: String,
    pub universe: UniverseConfig,
    #[serde(default)]
    pub partition: PartitionRule,
    #[serde(default, rename = "strategy")]
    pub strategies: Vec<StrategyConfig>,
    #[serde(default)]
    pub combiner: CombinerConfig,
    #[serde(default)]
    pub exits: ExitConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub feed: FeedConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct UniverseConfig {
    pub instruments: Vec<String>,
    /// Whitelist. When present only these instruments trade, and `exclude`
    /// is ignored.
    #[serde(default)]
    pub include: Option<Vec<String>>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// How the universe is split into worker groups.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionRule {
    /// Round-robin over the sorted universe into this many groups.
    Processes(usize),
    /// Consecutive chunks of at most this many instruments.
    GroupSize(usize),
    /// Explicit lists; must cover the universe without overlap.
    Explicit(Vec<Vec<String>>),
}

impl Default for PartitionRule {
    fn default() -> Self {
        PartitionRule::Processes(1)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StrategyConfig {
    /// Strategy type identifier: "rsi", "macd" or "ma_cross".
    #[serde(rename = "type")]
    pub strategy_type: String,
    /// Human-readable name shown in logs and votes.
    pub name: String,
    /// Rolling window handed to the strategy. Defaults to what the
    /// indicator needs.
    #[serde(default)]
    pub window: Option<usize>,
    /// Restrict the strategy to these instruments. All when absent.
    #[serde(default)]
    pub instruments: Option<Vec<String>>,
    /// Indicator-specific parameters.
    #[serde(default)]
    pub params: HashMap<String, toml::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteCounting {
    /// Support for a side is the number of votes for it.
    #[default]
    Support,
    /// Support for a side is its votes minus the opposing side's votes.
    Net,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CombinerConfig {
    #[serde(default = "default_min_votes")]
    pub min_votes: usize,
    #[serde(default)]
    pub min_confidence: f64,
    #[serde(default)]
    pub counting: VoteCounting,
}

impl Default for CombinerConfig {
    fn default() -> Self {
        Self {
            min_votes: default_min_votes(),
            min_confidence: 0.0,
            counting: VoteCounting::Support,
        }
    }
}

/// Per-position exit rules. Percentages are fractions (0.02 = 2%).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExitConfig {
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: Option<i64>,
    /// How long a position may wait in `Pending`/`Closing` before an alert.
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: i64,
    /// Close every monitored position when the feed exits.
    #[serde(default)]
    pub close_on_session_end: bool,
    /// Per-instrument values layered over the ones above:
    /// `[exits.overrides.AAPL] stop_loss_pct = 0.01`.
    #[serde(default)]
    pub overrides: BTreeMap<String, ExitOverride>,
}

/// Exit values for one instrument. Unset fields inherit from `[exits]`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ExitOverride {
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    #[serde(default)]
    pub timeout_minutes: Option<i64>,
    #[serde(default)]
    pub confirmation_timeout_secs: Option<i64>,
}

impl ExitConfig {
    /// The effective exit settings for `instrument`, with no overrides left.
    pub fn for_instrument(&self, instrument: &str) -> ExitConfig {
        let mut merged = ExitConfig {
            overrides: BTreeMap::new(),
            ..self.clone()
        };
        if let Some(o) = self.overrides.get(instrument) {
            merged.stop_loss_pct = o.stop_loss_pct.or(self.stop_loss_pct);
            merged.take_profit_pct = o.take_profit_pct.or(self.take_profit_pct);
            merged.timeout_minutes = o.timeout_minutes.or(self.timeout_minutes);
            merged.confirmation_timeout_secs = o
                .confirmation_timeout_secs
                .unwrap_or(self.confirmation_timeout_secs);
        }
        merged
    }

    fn validate(&self, scope: &str) -> Result<()> {
        for (key, value) in [
            ("stop_loss_pct", self.stop_loss_pct),
            ("take_profit_pct", self.take_profit_pct),
        ] {
            if let Some(v) = value {
                if !(v.is_finite() && v > 0.0) {
                    return Err(Error::Config(format!("{scope}.{key} must be positive, got {v}")));
                }
            }
        }
        if let Some(m) = self.timeout_minutes {
            if !(1..=MAX_TIMEOUT_MINUTES).contains(&m) {
                return Err(Error::Config(format!(
                    "{scope}.timeout_minutes must be within 1..={MAX_TIMEOUT_MINUTES}, got {m}"
                )));
            }
        }
        let secs = self.confirmation_timeout_secs;
        if !(1..=MAX_CONFIRMATION_TIMEOUT_SECS).contains(&secs) {
            return Err(Error::Config(format!(
                "{scope}.confirmation_timeout_secs must be within \
                 1..={MAX_CONFIRMATION_TIMEOUT_SECS}, got {secs}"
            )));
        }
        Ok(())
    }
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            stop_loss_pct: None,
            take_profit_pct: None,
            timeout_minutes: default_timeout_minutes(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            close_on_session_end: false,
            overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_restarts: default_max_restarts(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            heartbeat_secs: default_heartbeat_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    /// `EnvFilter` directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            filter: default_log_filter(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    /// Replay a JSON-lines file.
    File,
    /// Connect to a line-oriented price server.
    Tcp,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FeedConfig {
    pub kind: FeedKind,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub address: Option<String>,
    /// Added to zone-less text timestamps.
    #[serde(default)]
    pub time_offset_minutes: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Slippage applied to simulated fills, in basis points.
    #[serde(default)]
    pub slippage_bps: f64,
    /// Reject intents for instruments that have never been priced.
    #[serde(default = "default_true")]
    pub reject_unpriced: bool,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            slippage_bps: 0.0,
            reject_unpriced: true,
        }
    }
}

impl Settings {
    /// Load and validate settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read config at '{}': {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut settings: Settings = toml::from_str(content)?;
        if let Some(dir) = optional_env("QUORUM_LOG_DIR") {
            settings.logging.dir = PathBuf::from(dir);
        }
        settings.validate()?;
        Ok(settings)
    }

    /// Config file location: `QUORUM_CONFIG` (from the environment or a
    /// `.env` file) or [`DEFAULT_CONFIG_PATH`].
    pub fn path_from_env() -> PathBuf {
        let _ = dotenvy::dotenv(); // ignore error if .env not present
        optional_env("QUORUM_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::Config("name must not be empty".into()));
        }
        if self.combiner.min_votes == 0 {
            return Err(Error::Config("combiner.min_votes must be at least 1".into()));
        }
        if !(0.0..=1.0).contains(&self.combiner.min_confidence) {
            return Err(Error::Config(format!(
                "combiner.min_confidence must be within [0, 1], got {}",
                self.combiner.min_confidence
            )));
        }
        self.exits.validate("exits")?;
        for instrument in self.exits.overrides.keys() {
            self.exits
                .for_instrument(instrument)
                .validate(&format!("exits.overrides.{instrument}"))?;
        }
        if !(-MAX_TIME_OFFSET_MINUTES..=MAX_TIME_OFFSET_MINUTES).contains(&self.feed.time_offset_minutes) {
            return Err(Error::Config(format!(
                "feed.time_offset_minutes must be within ±{MAX_TIME_OFFSET_MINUTES}, got {}",
                self.feed.time_offset_minutes
            )));
        }
        match self.feed.kind {
            FeedKind::File if self.feed.path.is_none() => {
                return Err(Error::Config("feed.kind = \"file\" requires feed.path".into()));
            }
            FeedKind::Tcp if self.feed.address.is_none() => {
                return Err(Error::Config("feed.kind = \"tcp\" requires feed.address".into()));
            }
            _ => {}
        }
        if self.supervisor.backoff_initial_ms == 0
            || self.supervisor.backoff_max_ms < self.supervisor.backoff_initial_ms
        {
            return Err(Error::Config(
                "supervisor backoff must satisfy 0 < backoff_initial_ms <= backoff_max_ms".into(),
            ));
        }
        let mut names = std::collections::HashSet::new();
        for s in &self.strategies {
            if !names.insert(s.name.as_str()) {
                return Err(Error::Config(format!("duplicate strategy name '{}'", s.name)));
            }
        }
        Ok(())
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn default_name() -> String {
    "quorum".to_string()
}

fn default_min_votes() -> usize {
    1
}

fn default_timeout_minutes() -> Option<i64> {
    Some(30)
}

fn default_confirmation_timeout_secs() -> i64 {
    120
}

fn default_max_restarts() -> u32 {
    3
}

fn default_backoff_initial_ms() -> u64 {
    1_000
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}
