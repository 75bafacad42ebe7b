use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The instruments owned by one worker process. Fixed for the lifetime of
/// the process; groups never overlap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentGroup {
    pub id: usize,
    pub instruments: Vec<String>,
}

impl InstrumentGroup {
    pub fn new(id: usize, instruments: Vec<String>) -> Self {
        Self { id, instruments }
    }

    pub fn contains(&self, instrument: &str) -> bool {
        self.instruments.iter().any(|i| i == instrument)
    }

    pub fn len(&self) -> usize {
        self.instruments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instruments.is_empty()
    }
}

impl std::fmt::Display for InstrumentGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "group-{} [{}]", self.id, self.instruments.join(","))
    }
}

/// A finalized price bar for one instrument. Immutable once emitted by the
/// normalizer; `timestamp` is the bar close, truncated to milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub instrument: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub timestamp: DateTime<Utc>,
}

impl PriceBar {
    /// Average of the four OHLC prices.
    pub fn mid(&self) -> f64 {
        (self.open + self.high + self.low + self.close) / 4.0
    }
}

/// Direction of a vote, a combined signal, or a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Long,
    Short,
    #[default]
    Flat,
}

impl Direction {
    /// +1 for long, -1 for short, 0 for flat.
    pub fn sign(self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
            Direction::Flat => 0.0,
        }
    }

    pub fn opposite(self) -> Direction {
        match self {
            Direction::Long => Direction::Short,
            Direction::Short => Direction::Long,
            Direction::Flat => Direction::Flat,
        }
    }

    pub fn is_flat(self) -> bool {
        self == Direction::Flat
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Long => write!(f, "long"),
            Direction::Short => write!(f, "short"),
            Direction::Flat => write!(f, "flat"),
        }
    }
}

/// Side of an order sent across the execution boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// One strategy's opinion about one instrument at one bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyVote {
    pub strategy: String,
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    /// In `[0, 1]`.
    pub confidence: f64,
}

impl StrategyVote {
    pub fn new(
        strategy: impl Into<String>,
        instrument: impl Into<String>,
        timestamp: DateTime<Utc>,
        direction: Direction,
        confidence: f64,
    ) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            strategy: strategy.into(),
            instrument: instrument.into(),
            timestamp,
            direction,
            confidence,
        }
    }

    /// A no-opinion vote. Also what a faulting strategy degrades to.
    pub fn flat(
        strategy: impl Into<String>,
        instrument: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self::new(strategy, instrument, timestamp, Direction::Flat, 0.0)
    }
}

/// The combiner's verdict for one (instrument, timestamp).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedSignal {
    pub instrument: String,
    pub timestamp: DateTime<Utc>,
    pub direction: Direction,
    pub supporting_votes: usize,
    pub confidence: f64,
}

impl CombinedSignal {
    pub fn flat(instrument: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            instrument: instrument.into(),
            timestamp,
            direction: Direction::Flat,
            supporting_votes: 0,
            confidence: 0.0,
        }
    }
}

/// Why a position was closed. Declaration order is the tie-break priority:
/// when several rules trip on the same bar the earliest variant wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    StopLoss,
    Timeout,
    TakeProfit,
    SignalReversal,
    SessionEnd,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::StopLoss => write!(f, "stoploss"),
            CloseReason::Timeout => write!(f, "timeout"),
            CloseReason::TakeProfit => write!(f, "take-profit"),
            CloseReason::SignalReversal => write!(f, "signal reversal"),
            CloseReason::SessionEnd => write!(f, "session end"),
        }
    }
}

/// What the signaller wants done for an instrument after a combined signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalIntent {
    Open { direction: Direction },
    Close { reason: CloseReason },
    NoAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentAction {
    Open,
    Close,
}

/// An instruction handed to the execution boundary. `direction` is always the
/// direction of the position being opened or closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderIntent {
    pub id: Uuid,
    pub instrument: String,
    pub action: IntentAction,
    pub direction: Direction,
    pub reason: Option<CloseReason>,
    pub timestamp: DateTime<Utc>,
    /// Last known price when the intent was created.
    pub reference_price: f64,
}

impl OrderIntent {
    pub fn open(
        instrument: impl Into<String>,
        direction: Direction,
        timestamp: DateTime<Utc>,
        reference_price: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            instrument: instrument.into(),
            action: IntentAction::Open,
            direction,
            reason: None,
            timestamp,
            reference_price,
        }
    }

    pub fn close(
        instrument: impl Into<String>,
        direction: Direction,
        reason: CloseReason,
        timestamp: DateTime<Utc>,
        reference_price: f64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            instrument: instrument.into(),
            action: IntentAction::Close,
            direction,
            reason: Some(reason),
            timestamp,
            reference_price,
        }
    }

    /// Opening a long or closing a short buys; the reverse sells.
    pub fn side(&self) -> OrderSide {
        match (self.action, self.direction) {
            (IntentAction::Open, Direction::Short) | (IntentAction::Close, Direction::Long) => {
                OrderSide::Sell
            }
            _ => OrderSide::Buy,
        }
    }
}

/// Asynchronous answer from the execution boundary, keyed by intent id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
    Filled {
        intent_id: Uuid,
        instrument: String,
        price: f64,
        timestamp: DateTime<Utc>,
    },
    Rejected {
        intent_id: Uuid,
        instrument: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl ExecutionEvent {
    pub fn intent_id(&self) -> Uuid {
        match self {
            ExecutionEvent::Filled { intent_id, .. } | ExecutionEvent::Rejected { intent_id, .. } => {
                *intent_id
            }
        }
    }

    pub fn instrument(&self) -> &str {
        match self {
            ExecutionEvent::Filled { instrument, .. }
            | ExecutionEvent::Rejected { instrument, .. } => instrument,
        }
    }
}

/// Lifecycle of a position.
///
/// `Pending → Open → Monitoring → Closing → Closed`, with `Pending → Rejected`
/// as the failure branch. `Closed` and `Rejected` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionState {
    Pending,
    Open,
    Monitoring,
    Closing,
    Closed,
    Rejected,
}

impl PositionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PositionState::Closed | PositionState::Rejected)
    }

    /// Waiting on the execution boundary.
    pub fn is_awaiting_confirmation(self) -> bool {
        matches!(self, PositionState::Pending | PositionState::Closing)
    }

    /// A close may only be requested from these states.
    pub fn is_closable(self) -> bool {
        matches!(self, PositionState::Open | PositionState::Monitoring)
    }
}

impl std::fmt::Display for PositionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionState::Pending => write!(f, "pending"),
            PositionState::Open => write!(f, "open"),
            PositionState::Monitoring => write!(f, "monitoring"),
            PositionState::Closing => write!(f, "closing"),
            PositionState::Closed => write!(f, "closed"),
            PositionState::Rejected => write!(f, "rejected"),
        }
    }
}

/// A position owned by the monitor of the worker that holds its instrument.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub instrument: String,
    pub direction: Direction,
    pub state: PositionState,
    pub requested_at: DateTime<Utc>,
    pub open_intent: Uuid,
    pub opened_at: Option<DateTime<Utc>>,
    pub open_price: Option<f64>,
    pub close_intent: Option<Uuid>,
    pub close_requested_at: Option<DateTime<Utc>>,
    pub close_reason: Option<CloseReason>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_price: Option<f64>,
    pub rejection: Option<String>,
    /// Set once a stuck confirmation has been alerted on.
    pub escalated: bool,
}

impl Position {
    /// A fresh `Pending` position for an open intent.
    pub fn pending(intent: &OrderIntent) -> Self {
        Self {
            id: Uuid::new_v4(),
            instrument: intent.instrument.clone(),
            direction: intent.direction,
            state: PositionState::Pending,
            requested_at: intent.timestamp,
            open_intent: intent.id,
            opened_at: None,
            open_price: None,
            close_intent: None,
            close_requested_at: None,
            close_reason: None,
            closed_at: None,
            close_price: None,
            rejection: None,
            escalated: false,
        }
    }

    /// When the position entered its current awaiting state, if any.
    pub fn awaiting_since(&self) -> Option<DateTime<Utc>> {
        match self.state {
            PositionState::Pending => Some(self.requested_at),
            PositionState::Closing => self.close_requested_at,
            _ => None,
        }
    }

    /// Signed return from open to `price`, as a fraction.
    pub fn return_at(&self, price: f64) -> Option<f64> {
        let open = self.open_price?;
        if open <= 0.0 {
            return None;
        }
        Some((price / open - 1.0) * self.direction.sign())
    }

    /// Realized return once closed.
    pub fn return_pct(&self) -> Option<f64> {
        self.return_at(self.close_price?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

/// Records emitted across the reporting boundary, one JSON object per line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReportRecord {
    Position(ClosedPositionRecord),
    Alert(AlertRecord),
    Summary(SessionSummary),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPositionRecord {
    pub group: usize,
    pub instrument: String,
    pub direction: Direction,
    pub opened_at: DateTime<Utc>,
    pub open_price: f64,
    pub closed_at: DateTime<Utc>,
    pub close_price: f64,
    pub close_reason: CloseReason,
    pub return_pct: f64,
}

impl ClosedPositionRecord {
    /// `None` unless the position is `Closed` with both fills recorded.
    pub fn from_position(group: usize, position: &Position) -> Option<Self> {
        if position.state != PositionState::Closed {
            return None;
        }
        Some(Self {
            group,
            instrument: position.instrument.clone(),
            direction: position.direction,
            opened_at: position.opened_at?,
            open_price: position.open_price?,
            closed_at: position.closed_at?,
            close_price: position.close_price?,
            close_reason: position.close_reason?,
            return_pct: position.return_pct()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRecord {
    pub group: usize,
    pub severity: Severity,
    /// Component that raised the alert.
    pub source: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub group: usize,
    pub bars_processed: u64,
    pub bars_discarded: u64,
    pub positions_closed: usize,
    pub positions_rejected: usize,
    pub positions_handed_off: usize,
    /// Sum of realized returns of closed positions.
    pub total_return_pct: f64,
    pub timestamp: DateTime<Utc>,
}
