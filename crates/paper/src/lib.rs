use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use common::config::ExecutionConfig;
use common::{
    Error, ExecutionClient, ExecutionEvent, ExecutionEvents, OrderIntent, OrderSide, PriceBar,
    Result,
};

/// Simulated execution client.
///
/// Submitted intents are queued and filled at the open of the next bar for
/// their instrument, with configurable slippage. Nothing leaves the process.
pub struct PaperClient {
    slippage_bps: f64,
    reject_unpriced: bool,
    /// Latest close per instrument, updated from `on_bar`.
    prices: RwLock<HashMap<String, f64>>,
    queue: Mutex<Vec<OrderIntent>>,
    events: mpsc::UnboundedSender<ExecutionEvent>,
}

impl PaperClient {
    pub fn new(config: ExecutionConfig) -> (Self, ExecutionEvents) {
        let (events, rx) = mpsc::unbounded_channel();
        info!(
            slippage_bps = config.slippage_bps,
            reject_unpriced = config.reject_unpriced,
            "PaperClient initialized"
        );
        let client = Self {
            slippage_bps: config.slippage_bps,
            reject_unpriced: config.reject_unpriced,
            prices: RwLock::new(HashMap::new()),
            queue: Mutex::new(Vec::new()),
            events,
        };
        (client, rx)
    }

    /// Intents waiting for their fill bar.
    pub async fn queued(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Buys pay more, sells receive less.
    fn fill_price(&self, side: OrderSide, price: f64) -> f64 {
        match side {
            OrderSide::Buy => price * (1.0 + self.slippage_bps / 10_000.0),
            OrderSide::Sell => price * (1.0 - self.slippage_bps / 10_000.0),
        }
    }

    fn send(&self, event: ExecutionEvent) -> Result<()> {
        self.events
            .send(event)
            .map_err(|_| Error::Execution("confirmation channel closed".into()))
    }
}

#[async_trait]
impl ExecutionClient for PaperClient {
    async fn submit(&self, intent: &OrderIntent) -> Result<()> {
        let priced = self.prices.read().await.contains_key(&intent.instrument);
        if !priced && self.reject_unpriced {
            warn!(instrument = %intent.instrument, "No price seen, rejecting intent");
            return self.send(ExecutionEvent::Rejected {
                intent_id: intent.id,
                instrument: intent.instrument.clone(),
                reason: format!("no price for {}", intent.instrument),
                timestamp: intent.timestamp,
            });
        }

        debug!(
            instrument = %intent.instrument,
            action = ?intent.action,
            side = ?intent.side(),
            "Paper intent queued"
        );
        self.queue.lock().await.push(intent.clone());
        Ok(())
    }

    async fn on_bar(&self, bar: &PriceBar) -> Result<()> {
        self.prices
            .write()
            .await
            .insert(bar.instrument.clone(), bar.close);

        let due: Vec<OrderIntent> = {
            let mut queue = self.queue.lock().await;
            let (due, rest): (Vec<OrderIntent>, Vec<OrderIntent>) = queue
                .drain(..)
                .partition(|i| i.instrument == bar.instrument);
            *queue = rest;
            due
        };

        for intent in due {
            let price = self.fill_price(intent.side(), bar.open);
            debug!(
                instrument = %intent.instrument,
                side = ?intent.side(),
                open = bar.open,
                fill = price,
                "Paper fill simulated"
            );
            self.send(ExecutionEvent::Filled {
                intent_id: intent.id,
                instrument: intent.instrument,
                price,
                timestamp: bar.timestamp,
            })?;
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let pending: Vec<OrderIntent> = self.queue.lock().await.drain(..).collect();
        if !pending.is_empty() {
            info!(count = pending.len(), "Settling queued paper intents");
        }
        for intent in pending {
            let price = self.fill_price(intent.side(), intent.reference_price);
            self.send(ExecutionEvent::Filled {
                intent_id: intent.id,
                instrument: intent.instrument,
                price,
                timestamp: intent.timestamp,
            })?;
        }
        Ok(())
    }
}
