//! Exit-condition evaluation for one position at one price
//!
//! Precedence is fixed: stop-loss, take-profit, trailing stop, timeout. Exactly one reason
//! is produced even when several conditions hold at once.

use chrono::{DateTime, Duration, Utc};

use crate::domain::entities::position::{CloseReason, Position, TrailingStop};

#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    Exit { reason: CloseReason, exit_price: f64 },
    /// No exit; the trailing stop moved and should be persisted
    AdvanceTrailing(TrailingStop),
    Hold,
    /// Position is not open or closing; nothing to do
    Inactive,
}

pub fn evaluate(
    position: &Position,
    price: f64,
    now: DateTime<Utc>,
    max_holding: Option<Duration>,
) -> Evaluation {
    if !position.is_active() {
        return Evaluation::Inactive;
    }

    if position.should_stop_loss(price) {
        return Evaluation::Exit {
            reason: CloseReason::StopLoss,
            exit_price: price,
        };
    }

    if position.should_take_profit(price) {
        return Evaluation::Exit {
            reason: CloseReason::TakeProfit,
            exit_price: price,
        };
    }

    let advanced = position
        .trailing
        .map(|trailing| (trailing, trailing.advance(position.side, price)));

    if let Some((_, next)) = advanced {
        if next.is_triggered(position.side, price) {
            return Evaluation::Exit {
                reason: CloseReason::TrailingStop,
                exit_price: next.threshold,
            };
        }
    }

    if let Some(limit) = max_holding {
        if position.age(now) > limit {
            return Evaluation::Exit {
                reason: CloseReason::Timeout,
                exit_price: price,
            };
        }
    }

    match advanced {
        Some((current, next)) if next != current => Evaluation::AdvanceTrailing(next),
        _ => Evaluation::Hold,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::entities::position::{PositionSide, PositionStatus};

    fn open(side: PositionSide, stop: f64, target: f64) -> Position {
        let mut position = Position::opening(
            "pos_1".to_string(),
            "u1".to_string(),
            "BTCUSDT".to_string(),
            side,
            100.0,
            1.0,
            1.0,
            stop,
            target,
            Utc::now(),
        );
        position.status = PositionStatus::Open;
        position
    }

    #[test]
    fn test_stop_loss_wins_when_both_stop_and_target_hold() {
        // Degenerate levels: stop above target, so 100 satisfies both
        let position = open(PositionSide::Long, 105.0, 95.0);
        assert_eq!(
            evaluate(&position, 100.0, Utc::now(), None),
            Evaluation::Exit {
                reason: CloseReason::StopLoss,
                exit_price: 100.0
            }
        );
    }

    #[test]
    fn test_take_profit_beats_timeout() {
        let position = open(PositionSide::Short, 102.0, 94.0);
        let later = position.opened_at + Duration::hours(100);
        assert_eq!(
            evaluate(&position, 93.0, later, Some(Duration::hours(24))),
            Evaluation::Exit {
                reason: CloseReason::TakeProfit,
                exit_price: 93.0
            }
        );
    }

    #[test]
    fn test_timeout_closes_regardless_of_price() {
        let position = open(PositionSide::Long, 98.0, 106.0);
        let later = position.opened_at + Duration::hours(25);
        assert_eq!(
            evaluate(&position, 101.0, later, Some(Duration::hours(24))),
            Evaluation::Exit {
                reason: CloseReason::Timeout,
                exit_price: 101.0
            }
        );
        assert_eq!(evaluate(&position, 101.0, later, None), Evaluation::Hold);
    }

    #[test]
    fn test_trailing_exit_uses_threshold_price() {
        let mut position = open(PositionSide::Long, 90.0, 130.0).with_trailing_stop(0.01);
        let now = Utc::now();

        let peak = match evaluate(&position, 110.0, now, None) {
            Evaluation::AdvanceTrailing(next) => next,
            other => panic!("expected trailing advance, got {:?}", other),
        };
        position.trailing = Some(peak);

        match evaluate(&position, 108.8, now, None) {
            Evaluation::Exit { reason, exit_price } => {
                assert_eq!(reason, CloseReason::TrailingStop);
                assert!((exit_price - 108.9).abs() < 1e-9);
            }
            other => panic!("expected trailing exit, got {:?}", other),
        }
    }

    #[test]
    fn test_stop_loss_beats_trailing() {
        let position = open(PositionSide::Long, 98.0, 106.0).with_trailing_stop(0.01);
        assert_eq!(
            evaluate(&position, 97.0, Utc::now(), None),
            Evaluation::Exit {
                reason: CloseReason::StopLoss,
                exit_price: 97.0
            }
        );
    }

    #[test]
    fn test_closed_position_is_inactive() {
        let mut position = open(PositionSide::Long, 98.0, 106.0);
        position.close(99.0, CloseReason::Manual, Utc::now());
        assert_eq!(evaluate(&position, 50.0, Utc::now(), None), Evaluation::Inactive);
    }

    #[test]
    fn test_unchanged_trailing_holds() {
        let position = open(PositionSide::Long, 90.0, 130.0).with_trailing_stop(0.01);
        assert_eq!(evaluate(&position, 100.0, Utc::now(), None), Evaluation::Hold);
    }
}
