use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{ExecutionEvent, OrderIntent, PriceBar, Result};

/// Receiving half of the confirmation channel handed out by an execution
/// client at construction. Unbounded: clients may emit confirmations while
/// the worker is itself waiting on them (see `flush`).
pub type ExecutionEvents = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Abstraction over whatever acts on order intents.
///
/// `submit` only hands the intent off; the fill or rejection arrives later on
/// the client's `ExecutionEvents` channel, keyed by the intent id. An `Err`
/// from `submit` means the intent was refused outright.
///
/// Only the signaller and the worker loop hold a `dyn ExecutionClient`.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    async fn submit(&self, intent: &OrderIntent) -> Result<()>;

    /// Market data hook, called with every accepted bar before strategies
    /// see it. Simulated clients fill against it.
    async fn on_bar(&self, _bar: &PriceBar) -> Result<()> {
        Ok(())
    }

    /// End of session: settle whatever is still queued at its reference
    /// price. Clients with a live counterparty leave this as a no-op.
    async fn flush(&self) -> Result<()> {
        Ok(())
    }
}
