use std::sync::Arc;

use tracing::{info, warn};

use common::{
    CloseReason, CombinedSignal, Error, ExecutionClient, ExecutionEvent, OrderIntent, Position,
    PriceBar, Result, SignalIntent,
};
use monitor::{PositionMonitor, Transition};

/// Turns combined signals into order intents.
///
/// This is the only component that submits to the execution client.
pub struct Signaller {
    client: Arc<dyn ExecutionClient>,
}

impl Signaller {
    pub fn new(client: Arc<dyn ExecutionClient>) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Arc<dyn ExecutionClient> {
        &self.client
    }

    /// Open on a directional signal when the instrument is free, close on a
    /// signal against an open position, otherwise do nothing.
    pub fn decide(signal: &CombinedSignal, position: Option<&Position>) -> SignalIntent {
        if signal.direction.is_flat() {
            return SignalIntent::NoAction;
        }
        match position {
            None => SignalIntent::Open {
                direction: signal.direction,
            },
            Some(p) if p.state.is_closable() && signal.direction == p.direction.opposite() => {
                SignalIntent::Close {
                    reason: CloseReason::SignalReversal,
                }
            }
            Some(_) => SignalIntent::NoAction,
        }
    }

    pub fn validate(intent: &SignalIntent, position: Option<&Position>) -> Result<()> {
        match (intent, position) {
            (SignalIntent::Open { .. }, Some(p)) if !p.state.is_terminal() => {
                Err(Error::Invariant(format!(
                    "open requested for {} while a {} position exists",
                    p.instrument, p.state
                )))
            }
            (SignalIntent::Open { direction }, _) if direction.is_flat() => {
                Err(Error::Invariant("open requested without a direction".into()))
            }
            (SignalIntent::Close { .. }, None) => {
                Err(Error::Invariant("close requested without a position".into()))
            }
            (SignalIntent::Close { .. }, Some(p)) if !p.state.is_closable() => {
                Err(Error::Invariant(format!(
                    "close requested for {} from state {}",
                    p.instrument, p.state
                )))
            }
            _ => Ok(()),
        }
    }

    /// Validate and carry out `intent` for `bar.instrument`.
    ///
    /// A close goes through the monitor's exit rules so that a stoploss or
    /// timeout tripping on the same bar takes precedence over the reversal.
    pub async fn dispatch(
        &self,
        intent: SignalIntent,
        signal: &CombinedSignal,
        bar: &PriceBar,
        monitor: &mut PositionMonitor,
    ) -> Result<Option<Transition>> {
        Self::validate(&intent, monitor.position(&bar.instrument))?;

        match intent {
            SignalIntent::NoAction => Ok(None),
            SignalIntent::Open { direction } => {
                let order = OrderIntent::open(&bar.instrument, direction, signal.timestamp, bar.close);
                monitor.register_open(&order)?;
                info!(
                    instrument = %order.instrument,
                    direction = %direction,
                    votes = signal.supporting_votes,
                    confidence = signal.confidence,
                    "Opening position"
                );
                self.submit(order, monitor).await
            }
            SignalIntent::Close { .. } => match monitor.evaluate(bar, true) {
                Some(close) => self.submit(close, monitor).await,
                None => Err(Error::Invariant(format!(
                    "reversal on {} did not produce a close",
                    bar.instrument
                ))),
            },
        }
    }

    /// Hand an intent already registered with the monitor to the execution
    /// client. A synchronous refusal is applied as a rejection.
    pub async fn submit(
        &self,
        intent: OrderIntent,
        monitor: &mut PositionMonitor,
    ) -> Result<Option<Transition>> {
        match self.client.submit(&intent).await {
            Ok(()) => Ok(None),
            Err(e) if matches!(e, Error::Invariant(_)) => Err(e),
            Err(e) => {
                warn!(instrument = %intent.instrument, error = %e, "Execution client refused intent");
                let rejected = ExecutionEvent::Rejected {
                    intent_id: intent.id,
                    instrument: intent.instrument.clone(),
                    reason: e.to_string(),
                    timestamp: intent.timestamp,
                };
                Ok(monitor.on_execution(&rejected, intent.timestamp))
            }
        }
    }
}
