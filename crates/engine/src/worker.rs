use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use common::config::FeedKind;
use common::{
    AlertRecord, CloseReason, Error, ExecutionClient, ExecutionEvent, ExecutionEvents,
    FeedMessage, FeedSource, InstrumentGroup, RawBar, ReportRecord, Result,
    SessionSummary, Settings,
};
use monitor::{PositionMonitor, Transition};
use strategy::{StrategyCombiner, StrategyRegistry};

use crate::normalizer::BarNormalizer;
use crate::report::ReportSink;
use crate::signaller::Signaller;

/// Wall-clock period of the overdue-confirmation check on live feeds.
pub const IDLE_CHECK_PERIOD: Duration = Duration::from_secs(1);

/// How the evaluation loop ended. Every variant is a clean exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The feed sent `exit`.
    ServerExit,
    /// The feed ran out.
    FeedEnded,
    /// Shutdown was requested.
    Shutdown,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerOutcome {
    pub end: SessionEnd,
    pub summary: SessionSummary,
}

/// The per-group evaluation loop.
///
/// Owns everything for its group: normalizer, strategies, combiner, monitor
/// and the execution client's confirmation channel. Nothing is shared with
/// other workers.
pub struct Worker {
    group: InstrumentGroup,
    normalizer: BarNormalizer,
    registry: StrategyRegistry,
    combiner: StrategyCombiner,
    signaller: Signaller,
    monitor: PositionMonitor,
    executions: ExecutionEvents,
    report: Box<dyn ReportSink>,
    close_on_session_end: bool,
    batches: u64,
    clock: Option<DateTime<Utc>>,
    idle_check: Option<Duration>,
    /// When the last accepted bar arrived, in wall time.
    last_bar_at: Option<Instant>,
}

impl Worker {
    pub fn new(
        settings: &Settings,
        group: InstrumentGroup,
        client: Arc<dyn ExecutionClient>,
        executions: ExecutionEvents,
        report: Box<dyn ReportSink>,
    ) -> Result<Self> {
        let registry = StrategyRegistry::from_config(&settings.strategies, &group)
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            normalizer: BarNormalizer::new(&group, settings.feed.time_offset_minutes),
            registry,
            combiner: StrategyCombiner::new(settings.combiner.clone()),
            signaller: Signaller::new(client),
            monitor: PositionMonitor::from_config(&settings.exits, group.id),
            executions,
            report,
            close_on_session_end: settings.exits.close_on_session_end,
            batches: 0,
            clock: None,
            idle_check: (settings.feed.kind == FeedKind::Tcp).then_some(IDLE_CHECK_PERIOD),
            last_bar_at: None,
            group,
        })
    }

    /// Check for overdue confirmations every `period` of wall time even when
    /// no bars arrive. Enabled by default for TCP feeds only; a replay has no
    /// meaningful wall time between bars.
    pub fn with_idle_check(mut self, period: Option<Duration>) -> Self {
        self.idle_check = period;
        self
    }

    pub fn monitor(&self) -> &PositionMonitor {
        &self.monitor
    }

    /// Drive the loop until the feed ends, the server exits or `shutdown`
    /// resolves. Shutdown is only observed between bars, so an in-flight bar
    /// is always finished. Returns `Err` only for fatal errors.
    pub async fn run<F, S>(mut self, mut feed: F, shutdown: S) -> Result<WorkerOutcome>
    where
        F: FeedSource,
        S: Future<Output = ()>,
    {
        info!(
            group = self.group.id,
            instruments = ?self.group.instruments,
            "Worker started"
        );
        tokio::pin!(shutdown);
        let mut idle = self.idle_check.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        let end = loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("Shutdown requested");
                    break SessionEnd::Shutdown;
                }

                Some(event) = self.executions.recv() => {
                    self.apply_execution(event)?;
                }

                _ = idle_tick(&mut idle) => self.on_idle_tick(),

                message = feed.next() => match message {
                    Some(Ok(FeedMessage::Bar(raw))) => self.on_bar(raw).await?,
                    Some(Ok(FeedMessage::BatchEnd)) => self.on_batch_end(),
                    Some(Ok(FeedMessage::Exit)) => {
                        info!("Price server exit");
                        break SessionEnd::ServerExit;
                    }
                    Some(Err(e)) if !e.is_fatal() => {
                        warn!(error = %e, "Skipping malformed feed line");
                        self.normalizer.note_malformed_line();
                    }
                    Some(Err(e)) => {
                        error!(error = %e, "Feed failed");
                        return Err(e);
                    }
                    None => {
                        info!("Feed ended");
                        break SessionEnd::FeedEnded;
                    }
                },
            }
        };

        self.finish(end).await
    }

    async fn on_bar(&mut self, raw: RawBar) -> Result<()> {
        let Ok(bar) = self.normalizer.normalize(raw) else {
            return Ok(());
        };
        self.clock = Some(self.clock.map_or(bar.timestamp, |c| c.max(bar.timestamp)));
        self.last_bar_at = Some(Instant::now());

        self.signaller.client().on_bar(&bar).await?;
        self.drain_executions()?;

        let votes = self.registry.evaluate(&bar);
        let signal = self.combiner.combine(&bar.instrument, bar.timestamp, &votes);
        debug!(
            instrument = %bar.instrument,
            close = bar.close,
            direction = %signal.direction,
            votes = votes.len(),
            "Bar evaluated"
        );

        let intent = Signaller::decide(&signal, self.monitor.position(&bar.instrument));
        if let Some(transition) = self
            .signaller
            .dispatch(intent, &signal, &bar, &mut self.monitor)
            .await?
        {
            self.on_transition(transition);
        }

        if let Some(close) = self.monitor.evaluate(&bar, false) {
            if let Some(transition) = self.signaller.submit(close, &mut self.monitor).await? {
                self.on_transition(transition);
            }
        }

        self.escalate_overdue(bar.timestamp);
        Ok(())
    }

    fn on_batch_end(&mut self) {
        self.batches += 1;
        debug!(batch = self.batches, "Batch complete");
        if let Some(now) = self.clock {
            self.escalate_overdue(now);
        }
    }

    /// Check confirmations at the bar clock plus the wall time since the last
    /// bar. The bar clock itself is left alone.
    fn on_idle_tick(&mut self) {
        let (Some(clock), Some(at)) = (self.clock, self.last_bar_at) else {
            return;
        };
        let Some(now) = chrono::Duration::from_std(at.elapsed())
            .ok()
            .and_then(|quiet| clock.checked_add_signed(quiet))
        else {
            return;
        };
        self.escalate_overdue(now);
    }

    fn escalate_overdue(&mut self, now: DateTime<Utc>) {
        for alert in self.monitor.check_confirmation_timeouts(now) {
            self.emit(ReportRecord::Alert(alert));
        }
    }

    fn drain_executions(&mut self) -> Result<()> {
        loop {
            match self.executions.try_recv() {
                Ok(event) => self.apply_execution(event)?,
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
            }
        }
    }

    fn apply_execution(&mut self, event: ExecutionEvent) -> Result<()> {
        let at = match &event {
            ExecutionEvent::Filled { timestamp, .. } | ExecutionEvent::Rejected { timestamp, .. } => {
                *timestamp
            }
        };
        let now = self.clock.map_or(at, |c| c.max(at));
        if let Some(transition) = self.monitor.on_execution(&event, now) {
            self.on_transition(transition);
        }
        Ok(())
    }

    fn on_transition(&mut self, transition: Transition) {
        match transition {
            Transition::Closed(record) => self.emit(ReportRecord::Position(record)),
            Transition::CloseRejected(alert) => self.emit(ReportRecord::Alert(alert)),
            Transition::Opened { .. } | Transition::OpenRejected { .. } => {}
        }
    }

    fn emit(&mut self, record: ReportRecord) {
        if let Err(e) = self.report.record(&record) {
            error!(error = %e, "Failed to write report record");
        }
    }

    async fn finish(mut self, end: SessionEnd) -> Result<WorkerOutcome> {
        let now = self.clock.unwrap_or_else(Utc::now);

        if self.close_on_session_end {
            // queued opens must be filled before they can be flattened
            self.signaller.client().flush().await?;
            self.drain_executions()?;
            for close in self.monitor.close_all(CloseReason::SessionEnd, now) {
                if let Some(transition) = self.signaller.submit(close, &mut self.monitor).await? {
                    self.on_transition(transition);
                }
            }
            self.signaller.client().flush().await?;
        }
        self.drain_executions()?;

        let handed_off = self.monitor.awaiting_confirmation();
        for position in &handed_off {
            warn!(
                instrument = %position.instrument,
                state = %position.state,
                "Position handed off unconfirmed"
            );
        }
        if !handed_off.is_empty() {
            let message = format!(
                "{} position(s) left awaiting confirmation at session end",
                handed_off.len()
            );
            let alert = AlertRecord {
                group: self.group.id,
                severity: common::Severity::Warning,
                source: "worker".into(),
                message,
                timestamp: now,
            };
            self.emit(ReportRecord::Alert(alert));
        }

        let summary = SessionSummary {
            group: self.group.id,
            bars_processed: self.normalizer.accepted(),
            bars_discarded: self.normalizer.discarded(),
            positions_closed: self.monitor.closed_count(),
            positions_rejected: self.monitor.rejected_count(),
            positions_handed_off: self.monitor.awaiting_confirmation().len(),
            total_return_pct: self.monitor.realized_return(),
            timestamp: now,
        };
        self.emit(ReportRecord::Summary(summary.clone()));
        if let Err(e) = self.report.flush() {
            error!(error = %e, "Failed to flush report");
        }

        info!(
            end = ?end,
            bars = summary.bars_processed,
            discarded = summary.bars_discarded,
            closed = summary.positions_closed,
            rejected = summary.positions_rejected,
            handed_off = summary.positions_handed_off,
            total_return_pct = summary.total_return_pct,
            "Worker finished"
        );
        Ok(WorkerOutcome { end, summary })
    }
}

async fn idle_tick(idle: &mut Option<Interval>) {
    match idle {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
