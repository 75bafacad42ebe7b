use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

use common::config::ExitConfig;
use common::{
    AlertRecord, CloseReason, ClosedPositionRecord, Error, ExecutionEvent, IntentAction,
    OrderIntent, Position, PositionState, PriceBar, Result, Severity,
};

use crate::rules::ExitRules;

const SOURCE: &str = "monitor";

/// What an execution event did to a position.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Opened { instrument: String, price: f64 },
    OpenRejected { instrument: String, reason: String },
    Closed(ClosedPositionRecord),
    /// The close was refused; the position stays `Closing`.
    CloseRejected(AlertRecord),
}

/// Owns every position of one instrument group.
///
/// At most one non-terminal position exists per instrument. Terminal positions
/// (`Closed`, `Rejected`) move to [`PositionMonitor::history`]. Instruments
/// without their own rules use the group-wide ones.
pub struct PositionMonitor {
    group: usize,
    rules: ExitRules,
    instrument_rules: HashMap<String, ExitRules>,
    active: HashMap<String, Position>,
    history: Vec<Position>,
    /// Latest close per instrument, used to price session-end closes.
    last_prices: HashMap<String, f64>,
}

impl PositionMonitor {
    pub fn new(rules: ExitRules, group: usize) -> Self {
        Self {
            group,
            rules,
            instrument_rules: HashMap::new(),
            active: HashMap::new(),
            history: Vec::new(),
            last_prices: HashMap::new(),
        }
    }

    /// `[exits]` with each of its per-instrument overrides resolved.
    pub fn from_config(cfg: &ExitConfig, group: usize) -> Self {
        let monitor = Self::new(ExitRules::from(cfg), group);
        cfg.overrides.keys().fold(monitor, |m, instrument| {
            let rules = ExitRules::from(&cfg.for_instrument(instrument));
            m.with_instrument_rules(instrument.clone(), rules)
        })
    }

    pub fn with_instrument_rules(mut self, instrument: impl Into<String>, rules: ExitRules) -> Self {
        self.instrument_rules.insert(instrument.into(), rules);
        self
    }

    /// Group-wide rules.
    pub fn rules(&self) -> &ExitRules {
        &self.rules
    }

    pub fn rules_for(&self, instrument: &str) -> &ExitRules {
        self.instrument_rules.get(instrument).unwrap_or(&self.rules)
    }

    /// The non-terminal position for `instrument`, if any.
    pub fn position(&self, instrument: &str) -> Option<&Position> {
        self.active.get(instrument)
    }

    pub fn active(&self) -> impl Iterator<Item = &Position> {
        self.active.values()
    }

    pub fn history(&self) -> &[Position] {
        &self.history
    }

    /// Positions still waiting on the execution boundary.
    pub fn awaiting_confirmation(&self) -> Vec<&Position> {
        let mut waiting: Vec<&Position> = self
            .active
            .values()
            .filter(|p| p.state.is_awaiting_confirmation())
            .collect();
        waiting.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        waiting
    }

    pub fn closed_count(&self) -> usize {
        self.history
            .iter()
            .filter(|p| p.state == PositionState::Closed)
            .count()
    }

    pub fn rejected_count(&self) -> usize {
        self.history
            .iter()
            .filter(|p| p.state == PositionState::Rejected)
            .count()
    }

    /// Sum of realized returns over closed positions.
    pub fn realized_return(&self) -> f64 {
        self.history.iter().filter_map(Position::return_pct).sum()
    }

    /// Record a `Pending` position for an open intent about to be submitted.
    pub fn register_open(&mut self, intent: &OrderIntent) -> Result<()> {
        if intent.action != IntentAction::Open || intent.direction.is_flat() {
            return Err(Error::Invariant(format!(
                "register_open called with a non-opening intent for {}",
                intent.instrument
            )));
        }
        if let Some(existing) = self.active.get(&intent.instrument) {
            return Err(Error::Invariant(format!(
                "{} already has a {} position",
                intent.instrument, existing.state
            )));
        }

        let position = Position::pending(intent);
        info!(
            instrument = %position.instrument,
            direction = %position.direction,
            position = %position.id,
            "Position pending"
        );
        self.active.insert(position.instrument.clone(), position);
        Ok(())
    }

    /// Move a closable position to `Closing` and build the close intent.
    pub fn request_close(
        &mut self,
        instrument: &str,
        reason: CloseReason,
        timestamp: DateTime<Utc>,
        price: f64,
    ) -> Result<OrderIntent> {
        let position = match self.active.get_mut(instrument) {
            Some(p) if p.state.is_closable() => p,
            Some(p) => {
                return Err(Error::Invariant(format!(
                    "cannot close {instrument} from state {}",
                    p.state
                )))
            }
            None => {
                return Err(Error::Invariant(format!(
                    "cannot close {instrument}: no open position"
                )))
            }
        };

        let intent = OrderIntent::close(instrument, position.direction, reason, timestamp, price);
        position.state = PositionState::Closing;
        position.close_intent = Some(intent.id);
        position.close_requested_at = Some(timestamp);
        position.close_reason = Some(reason);
        position.escalated = false;

        info!(
            instrument,
            reason = %reason,
            price,
            return_pct = position.return_at(price).unwrap_or_default(),
            "Position closing"
        );
        Ok(intent)
    }

    /// Check the exit rules for the position on `bar.instrument`.
    ///
    /// `reversal` reports that the combined signal now points the other way.
    /// Returns the close intent when a rule trips; the position is then
    /// `Closing` and will not produce a second intent.
    pub fn evaluate(&mut self, bar: &PriceBar, reversal: bool) -> Option<OrderIntent> {
        self.last_prices.insert(bar.instrument.clone(), bar.close);

        let position = self.active.get(&bar.instrument)?;
        if position.state != PositionState::Monitoring {
            return None;
        }
        let reason = self.rules_for(&bar.instrument).check(position, bar, reversal)?;

        // Monitoring is closable, so this cannot fail.
        self.request_close(&bar.instrument, reason, bar.timestamp, bar.close)
            .ok()
    }

    /// Apply a confirmation from the execution boundary.
    pub fn on_execution(&mut self, event: &ExecutionEvent, now: DateTime<Utc>) -> Option<Transition> {
        let intent_id = event.intent_id();
        let Some(position) = self.active.get_mut(event.instrument()) else {
            warn!(instrument = %event.instrument(), intent = %intent_id, "Execution event for unknown position");
            return None;
        };

        let is_open = position.state == PositionState::Pending && position.open_intent == intent_id;
        let is_close =
            position.state == PositionState::Closing && position.close_intent == Some(intent_id);

        match event {
            ExecutionEvent::Filled { price, timestamp, .. } if is_open => {
                position.state = PositionState::Open;
                position.opened_at = Some(*timestamp);
                position.open_price = Some(*price);
                info!(
                    instrument = %position.instrument,
                    direction = %position.direction,
                    price,
                    "Position opened"
                );
                position.state = PositionState::Monitoring;
                info!(instrument = %position.instrument, "Position monitoring");
                Some(Transition::Opened {
                    instrument: position.instrument.clone(),
                    price: *price,
                })
            }
            ExecutionEvent::Rejected { reason, .. } if is_open => {
                error!(
                    instrument = %position.instrument,
                    reason = %reason,
                    "Open rejected, position abandoned"
                );
                let instrument = position.instrument.clone();
                self.retire(&instrument, |p| {
                    p.state = PositionState::Rejected;
                    p.rejection = Some(reason.clone());
                });
                Some(Transition::OpenRejected {
                    instrument,
                    reason: reason.clone(),
                })
            }
            ExecutionEvent::Filled { price, timestamp, .. } if is_close => {
                let instrument = position.instrument.clone();
                let group = self.group;
                let closed = self.retire(&instrument, |p| {
                    p.state = PositionState::Closed;
                    p.closed_at = Some(*timestamp);
                    p.close_price = Some(*price);
                })?;
                let record = ClosedPositionRecord::from_position(group, closed)?;
                info!(
                    instrument = %record.instrument,
                    reason = %record.close_reason,
                    price,
                    return_pct = record.return_pct,
                    "Position closed"
                );
                Some(Transition::Closed(record))
            }
            ExecutionEvent::Rejected { reason, .. } if is_close => {
                let message = format!(
                    "close of {} rejected ({reason}); position stays closing",
                    position.instrument
                );
                error!(instrument = %position.instrument, reason = %reason, "Close rejected");
                Some(Transition::CloseRejected(self.alert(Severity::Critical, message, now)))
            }
            _ => {
                warn!(
                    instrument = %position.instrument,
                    state = %position.state,
                    intent = %intent_id,
                    "Execution event does not match the position, ignored"
                );
                None
            }
        }
    }

    /// Escalate positions stuck in `Pending`/`Closing` for longer than the
    /// confirmation timeout. Each position is escalated once per wait; nothing
    /// is cancelled.
    pub fn check_confirmation_timeouts(&mut self, now: DateTime<Utc>) -> Vec<AlertRecord> {
        let mut stuck = Vec::new();
        for position in self.active.values_mut() {
            let Some(since) = position.awaiting_since() else {
                continue;
            };
            let limit = self
                .instrument_rules
                .get(&position.instrument)
                .unwrap_or(&self.rules)
                .confirmation_timeout;
            if position.escalated || now - since <= limit {
                continue;
            }
            position.escalated = true;
            error!(
                instrument = %position.instrument,
                state = %position.state,
                waiting_secs = (now - since).num_seconds(),
                "Confirmation overdue"
            );
            stuck.push(format!(
                "{} {} for {}s without confirmation",
                position.instrument,
                position.state,
                (now - since).num_seconds()
            ));
        }
        stuck.sort();
        stuck
            .into_iter()
            .map(|message| self.alert(Severity::Critical, message, now))
            .collect()
    }

    /// Request a close for every closable position, priced at the last close
    /// seen for its instrument.
    pub fn close_all(&mut self, reason: CloseReason, timestamp: DateTime<Utc>) -> Vec<OrderIntent> {
        let mut instruments: Vec<String> = self
            .active
            .values()
            .filter(|p| p.state.is_closable())
            .map(|p| p.instrument.clone())
            .collect();
        instruments.sort();

        let mut intents = Vec::with_capacity(instruments.len());
        for instrument in instruments {
            let price = self
                .last_prices
                .get(&instrument)
                .copied()
                .or_else(|| self.active.get(&instrument).and_then(|p| p.open_price))
                .unwrap_or_default();
            match self.request_close(&instrument, reason, timestamp, price) {
                Ok(intent) => intents.push(intent),
                Err(e) => warn!(instrument = %instrument, error = %e, "Skipping close"),
            }
        }
        intents
    }

    fn retire(&mut self, instrument: &str, update: impl FnOnce(&mut Position)) -> Option<&Position> {
        let mut position = self.active.remove(instrument)?;
        update(&mut position);
        self.history.push(position);
        self.history.last()
    }

    fn alert(&self, severity: Severity, message: String, timestamp: DateTime<Utc>) -> AlertRecord {
        AlertRecord {
            group: self.group,
            severity,
            source: SOURCE.to_string(),
            message,
            timestamp,
        }
    }
}
