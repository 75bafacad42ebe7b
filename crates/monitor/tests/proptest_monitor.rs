use chrono::{DateTime, Duration, TimeZone, Utc};
use common::{CloseReason, Direction, ExecutionEvent, OrderIntent, PositionState, PriceBar};
use monitor::{ExitRules, PositionMonitor, Transition};
use proptest::prelude::*;

fn t(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 2, 9, 30, 0).unwrap() + Duration::minutes(minute)
}

fn bar(minute: i64, close: f64) -> PriceBar {
    PriceBar {
        instrument: "X".into(),
        open: close,
        high: close,
        low: close,
        close,
        volume: 1.0,
        timestamp: t(minute),
    }
}

fn rules() -> ExitRules {
    ExitRules {
        stop_loss_pct: Some(0.02),
        take_profit_pct: Some(0.04),
        timeout: Some(Duration::minutes(30)),
        confirmation_timeout: Duration::minutes(2),
    }
}

fn fill(intent: &OrderIntent, price: f64, minute: i64) -> ExecutionEvent {
    ExecutionEvent::Filled {
        intent_id: intent.id,
        instrument: intent.instrument.clone(),
        price,
        timestamp: t(minute),
    }
}

proptest! {
    /// Random price paths with immediate fills: every closed position went
    /// through `Closing`, carries a reason, and the monitor never holds two
    /// live positions for the instrument.
    #[test]
    fn closed_positions_always_pass_through_closing(
        open_price in 0.01f64..100_000.0,
        moves in prop::collection::vec(-0.05f64..0.05, 1..120),
        long in any::<bool>(),
    ) {
        let mut m = PositionMonitor::new(rules(), 1);
        let direction = if long { Direction::Long } else { Direction::Short };
        let mut price = open_price;

        for (i, step) in moves.iter().enumerate() {
            let minute = i as i64;
            price = (price * (1.0 + step)).max(0.0001);

            if m.position("X").is_none() {
                let intent = OrderIntent::open("X", direction, t(minute), price);
                m.register_open(&intent).unwrap();
                m.on_execution(&fill(&intent, price, minute), t(minute));
                continue;
            }

            if let Some(close) = m.evaluate(&bar(minute, price), false) {
                prop_assert_eq!(m.position("X").map(|p| p.state), Some(PositionState::Closing));
                let tr = m.on_execution(&fill(&close, price, minute), t(minute));
                prop_assert!(matches!(tr, Some(Transition::Closed(_))));
            }
        }

        for p in m.history() {
            prop_assert_eq!(p.state, PositionState::Closed);
            prop_assert!(p.close_intent.is_some());
            prop_assert!(p.close_requested_at.is_some());
            prop_assert!(p.close_reason.is_some());
        }
        prop_assert!(m.active().count() <= 1);
    }

    /// When a bar breaches the stoploss after the timeout has also elapsed,
    /// the recorded reason is always the stoploss.
    #[test]
    fn stop_loss_beats_timeout(
        open_price in 1.0f64..10_000.0,
        loss in 0.02f64..0.5,
        minutes in 30i64..600,
        reversal in any::<bool>(),
    ) {
        let mut m = PositionMonitor::new(rules(), 1);
        let intent = OrderIntent::open("X", Direction::Long, t(0), open_price);
        m.register_open(&intent).unwrap();
        m.on_execution(&fill(&intent, open_price, 0), t(0));

        let close = m
            .evaluate(&bar(minutes, open_price * (1.0 - loss)), reversal)
            .unwrap();
        prop_assert_eq!(close.reason, Some(CloseReason::StopLoss));
    }
}
