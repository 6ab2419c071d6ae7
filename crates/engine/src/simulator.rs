//! Bar-by-bar backtest simulator
//!
//! Replays a candle sequence against the selected analyzer(s) through a
//! single-position state machine: flat until a buy signal, then open until
//! stop-loss, take-profit, or signal disappearance closes the position at
//! that bar's close. One equity point is appended per evaluated bar and a
//! monthly-return entry per calendar month.

use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::analyzers::{FlowAnalyzer, VolatilityAnalyzer};
use crate::error::{EngineError, EngineResult};
use crate::performance::compute_stats;
use crate::types::{
    AlgorithmChoice, BacktestParams, BacktestResult, Candle, EquityPoint, ExitReason, Instrument,
    MarketSnapshot, MonthlyReturn, SignalDirection, Trade, TradeSide,
};

/// Bars consumed before the first signal check
pub const WARMUP_BARS: usize = 50;
/// Trailing analyzer window, including the current bar
pub const SIGNAL_WINDOW: usize = 100;

struct OpenPosition {
    entry_time: i64,
    entry_price: Decimal,
    quantity: Decimal,
    signal_strength: f64,
}

/// Backtesting engine that simulates bar-by-bar execution
pub struct BacktestEngine;

impl BacktestEngine {
    /// Run a backtest over the given candles. Hard error when fewer than
    /// [`WARMUP_BARS`] candles are supplied or the batch fails validation.
    pub fn run(params: &BacktestParams, candles: &[Candle]) -> EngineResult<BacktestResult> {
        params.validate()?;

        if candles.len() < WARMUP_BARS {
            return Err(EngineError::InsufficientData {
                required: WARMUP_BARS,
                actual: candles.len(),
            });
        }
        crate::analyzers::validate_candles(candles)?;

        info!(
            symbol = %params.symbol,
            algorithm = %params.algorithm,
            bars = candles.len(),
            capital = %params.initial_capital,
            "Starting backtest"
        );

        let instrument = Instrument::from_symbol(&params.symbol);
        let mut signal_fn = |window: &[Candle]| -> EngineResult<Option<f64>> {
            evaluate_entry(&instrument, params, window)
        };

        Self::run_inner(params, candles, &mut signal_fn)
    }

    /// Drive the position state machine with an arbitrary per-window signal
    /// source; `signal_fn` yields the buy strength when a signal is present.
    fn run_inner(
        params: &BacktestParams,
        candles: &[Candle],
        signal_fn: &mut dyn FnMut(&[Candle]) -> EngineResult<Option<f64>>,
    ) -> EngineResult<BacktestResult> {
        let hundred = Decimal::from(100);
        let stop_loss = params.stop_loss_pct / hundred;
        let take_profit = params.take_profit_pct / hundred;

        let mut capital = params.initial_capital;
        let mut position: Option<OpenPosition> = None;
        let mut trades: Vec<Trade> = Vec::new();
        let mut equity_curve: Vec<EquityPoint> = Vec::new();
        let mut monthly_returns: Vec<MonthlyReturn> = Vec::new();

        let mut current_month: Option<String> = None;
        let mut month_start_equity = params.initial_capital;
        let mut last_equity = params.initial_capital;

        for i in (WARMUP_BARS - 1)..candles.len() {
            let bar = &candles[i];
            let window = &candles[i + 1 - SIGNAL_WINDOW.min(i + 1)..=i];

            // Calendar-month rollover before this bar is applied
            let bar_month = month_of(bar.open_time);
            match &current_month {
                Some(m) if *m != bar_month => {
                    monthly_returns.push(MonthlyReturn {
                        month: m.clone(),
                        ret: fraction(last_equity, month_start_equity),
                    });
                    month_start_equity = last_equity;
                    current_month = Some(bar_month);
                }
                None => current_month = Some(bar_month),
                _ => {}
            }

            let exit_reason = match &position {
                // Exit checks in order: stop-loss, take-profit, then signal
                Some(pos) if bar.close <= pos.entry_price * (Decimal::ONE - stop_loss) => {
                    Some(ExitReason::StopLoss)
                }
                Some(pos) if bar.close >= pos.entry_price * (Decimal::ONE + take_profit) => {
                    Some(ExitReason::TakeProfit)
                }
                Some(_) if signal_fn(window)?.is_none() => Some(ExitReason::Signal),
                _ => None,
            };

            if let Some(reason) = exit_reason {
                if let Some(pos) = position.take() {
                    let pnl = (bar.close - pos.entry_price) * pos.quantity;
                    let pnl_pct = fraction(bar.close, pos.entry_price) * 100.0;
                    capital += pnl;

                    debug!(
                        entry = %pos.entry_price,
                        exit = %bar.close,
                        pnl = %pnl,
                        reason = ?reason,
                        "Closed position"
                    );

                    trades.push(Trade {
                        entry_time: pos.entry_time,
                        entry_price: pos.entry_price,
                        quantity: pos.quantity,
                        side: TradeSide::Long,
                        signal_strength: pos.signal_strength,
                        exit_time: Some(bar.open_time),
                        exit_price: Some(bar.close),
                        pnl: Some(pnl),
                        pnl_pct: Some(pnl_pct),
                        exit_reason: Some(reason),
                    });
                }
            } else if position.is_none() {
                if let Some(strength) = signal_fn(window)? {
                    let position_value = capital * params.position_size_pct / hundred;
                    let quantity = position_value / bar.close;

                    debug!(
                        price = %bar.close,
                        quantity = %quantity,
                        strength,
                        time = bar.open_time,
                        "Opened long position"
                    );

                    position = Some(OpenPosition {
                        entry_time: bar.open_time,
                        entry_price: bar.close,
                        quantity,
                        signal_strength: strength,
                    });
                }
            }

            // Mark-to-market equity, one point per evaluated bar
            let position_value = position
                .as_ref()
                .map(|p| p.quantity * bar.close)
                .unwrap_or(Decimal::ZERO);
            let open_cost = position
                .as_ref()
                .map(|p| p.quantity * p.entry_price)
                .unwrap_or(Decimal::ZERO);
            last_equity = capital + position_value - open_cost;

            equity_curve.push(EquityPoint {
                date: bar.open_time,
                value: last_equity,
            });
        }

        // Flush the tail partial month
        if let Some(m) = current_month {
            monthly_returns.push(MonthlyReturn {
                month: m,
                ret: fraction(last_equity, month_start_equity),
            });
        }

        // A position still open at the end stays unclosed in the trade list
        // and out of the completed-trade statistics; equity already carries
        // its mark-to-market value.
        if let Some(pos) = position.take() {
            trades.push(Trade {
                entry_time: pos.entry_time,
                entry_price: pos.entry_price,
                quantity: pos.quantity,
                side: TradeSide::Long,
                signal_strength: pos.signal_strength,
                exit_time: None,
                exit_price: None,
                pnl: None,
                pnl_pct: None,
                exit_reason: None,
            });
        }

        let final_capital = last_equity;
        let stats = compute_stats(
            &trades,
            &equity_curve,
            &monthly_returns,
            params.initial_capital,
            final_capital,
        );

        info!(
            total_trades = stats.total_trades,
            win_rate = %stats.win_rate,
            total_return = %stats.total_return,
            max_drawdown = %stats.max_drawdown,
            "Backtest complete"
        );

        Ok(BacktestResult {
            id: None,
            symbol: params.symbol.clone(),
            interval: params.interval.clone(),
            algorithm: params.algorithm,
            params: params.clone(),
            start_time: candles.first().map(|c| c.open_time).unwrap_or(0),
            end_time: candles.last().map(|c| c.close_time).unwrap_or(0),
            initial_capital: params.initial_capital,
            final_capital,
            total_return: stats.total_return,
            total_trades: stats.total_trades,
            winning_trades: stats.winning_trades,
            losing_trades: stats.losing_trades,
            win_rate: stats.win_rate,
            avg_win: stats.avg_win,
            avg_loss: stats.avg_loss,
            profit_factor: stats.profit_factor,
            largest_win: stats.largest_win,
            largest_loss: stats.largest_loss,
            max_drawdown: stats.max_drawdown,
            sharpe_ratio: stats.sharpe_ratio,
            trades,
            equity_curve,
            monthly_returns,
        })
    }
}

/// Run a backtest, fetching candle history from `source` when none is
/// supplied. The fetch covers `[start_time, end_time]` from the params.
pub async fn run_backtest(
    params: &BacktestParams,
    candles: Option<Vec<Candle>>,
    source: &dyn crate::sources::CandleSource,
) -> EngineResult<BacktestResult> {
    let candles = match candles {
        Some(candles) => candles,
        None => {
            source
                .get_candles(
                    &params.symbol,
                    &params.interval,
                    params.start_time,
                    params.end_time,
                    None,
                )
                .await?
        }
    };
    BacktestEngine::run(params, &candles)
}

/// Buy strength for the latest bar of `window`, per the configured
/// algorithm. `Combined` requires both analyzers to fire and averages their
/// strengths; a single hit produces nothing.
fn evaluate_entry(
    instrument: &Instrument,
    params: &BacktestParams,
    window: &[Candle],
) -> EngineResult<Option<f64>> {
    match params.algorithm {
        AlgorithmChoice::Flow => Ok(flow_strength(instrument, params, window)),
        AlgorithmChoice::VolatilityExtreme => volatility_strength(instrument, params, window),
        AlgorithmChoice::Combined => {
            let flow = flow_strength(instrument, params, window);
            let vol = volatility_strength(instrument, params, window)?;
            Ok(match (flow, vol) {
                (Some(f), Some(v)) => Some((f + v) / 2.0),
                _ => None,
            })
        }
    }
}

fn flow_strength(
    instrument: &Instrument,
    params: &BacktestParams,
    window: &[Candle],
) -> Option<f64> {
    let snapshot = window_snapshot(&instrument.symbol, window)?;
    let avg_volume = mean_volume(window);
    FlowAnalyzer
        .analyze(
            instrument,
            &snapshot,
            avg_volume,
            &params.flow,
            window.last().map(|c| c.open_time).unwrap_or(0),
        )
        .filter(|s| s.direction == SignalDirection::Buy)
        .map(|s| s.strength)
}

fn volatility_strength(
    instrument: &Instrument,
    params: &BacktestParams,
    window: &[Candle],
) -> EngineResult<Option<f64>> {
    let signal = VolatilityAnalyzer.analyze(
        instrument,
        window,
        &params.volatility,
        window.last().map(|c| c.open_time).unwrap_or(0),
    )?;
    Ok(signal
        .filter(|s| s.direction == SignalDirection::Buy)
        .map(|s| s.strength))
}

/// Derive a pseudo 24h snapshot from the trailing window so the flow
/// analyzer can score historical bars
fn window_snapshot(symbol: &str, window: &[Candle]) -> Option<MarketSnapshot> {
    let first = window.first()?;
    let last = window.last()?;

    let high = window.iter().map(|c| c.high).max()?;
    let low = window.iter().map(|c| c.low).min()?;

    let change_pct = if first.open > Decimal::ZERO {
        fraction(last.close, first.open)
    } else {
        0.0
    };

    Some(MarketSnapshot {
        symbol: symbol.to_string(),
        price: last.close,
        volume_24h: last.volume,
        high_24h: high,
        low_24h: low,
        open_24h: first.open,
        change_pct_24h: change_pct,
    })
}

fn mean_volume(window: &[Candle]) -> Decimal {
    if window.is_empty() {
        return Decimal::ZERO;
    }
    window.iter().map(|c| c.volume).sum::<Decimal>() / Decimal::from(window.len())
}

/// (value - base) / base as f64; zero when base is non-positive
fn fraction(value: Decimal, base: Decimal) -> f64 {
    if base <= Decimal::ZERO {
        return 0.0;
    }
    ((value - base) / base).to_string().parse().unwrap_or(0.0)
}

fn month_of(epoch_ms: i64) -> String {
    match Utc.timestamp_millis_opt(epoch_ms) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m").to_string(),
        _ => "1970-01".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const HOUR_MS: i64 = 3_600_000;
    const DAY_MS: i64 = 86_400_000;

    fn make_candles(closes: &[f64], spacing_ms: i64) -> Vec<Candle> {
        let d = |v: f64| Decimal::from_str_exact(&format!("{:.4}", v)).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, &p)| Candle {
                open_time: (i as i64) * spacing_ms,
                open: d(p),
                high: d(p + 1.0),
                low: d(p - 1.0),
                close: d(p),
                volume: dec!(100),
                close_time: ((i + 1) as i64) * spacing_ms - 1,
            })
            .collect()
    }

    fn params() -> BacktestParams {
        BacktestParams {
            stop_loss_pct: dec!(2),
            take_profit_pct: dec!(5),
            position_size_pct: dec!(10),
            initial_capital: dec!(10000),
            ..Default::default()
        }
    }

    /// Scripted signal source: present at every bar index in `fire_at`
    /// (indexed by call order over evaluated bars)
    fn scripted(
        fire: Vec<bool>,
    ) -> impl FnMut(&[Candle]) -> EngineResult<Option<f64>> {
        let mut calls = 0usize;
        move |_window: &[Candle]| {
            let present = fire.get(calls).copied().unwrap_or(false);
            calls += 1;
            Ok(if present { Some(0.8) } else { None })
        }
    }

    #[test]
    fn test_fewer_than_warmup_candles_is_an_error() {
        let candles = make_candles(&vec![100.0; 49], HOUR_MS);
        let err = BacktestEngine::run(&params(), &candles).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InsufficientData {
                required: 50,
                actual: 49
            }
        ));
    }

    #[test]
    fn test_exactly_warmup_candles_yields_one_equity_point() {
        let candles = make_candles(&vec![100.0; 50], HOUR_MS);
        let result = BacktestEngine::run(&params(), &candles).unwrap();
        assert!(result.trades.is_empty());
        assert_eq!(result.equity_curve.len(), 1);
        assert_eq!(result.final_capital, dec!(10000));
        assert_eq!(result.total_return, Decimal::ZERO);
    }

    #[test]
    fn test_stop_loss_closes_at_threshold_bar() {
        // Entry at 100 on the first evaluated bar, then 99 (-1%), 97.9 (-2.1%)
        let mut closes = vec![100.0; 50];
        closes.push(99.0);
        closes.push(97.9);
        let candles = make_candles(&closes, HOUR_MS);

        // Signal present throughout so only the stop can close
        let mut signals = scripted(vec![true; 10]);
        let result = BacktestEngine::run_inner(&params(), &candles, &mut signals).unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, Some(ExitReason::StopLoss));
        assert_eq!(trade.exit_price, Some(dec!(97.9)));
        assert_eq!(trade.exit_time, Some(candles[51].open_time));
        let pnl_pct = trade.pnl_pct.unwrap();
        assert!((pnl_pct + 2.1).abs() < 1e-9, "pnl_pct was {}", pnl_pct);
    }

    #[test]
    fn test_take_profit_closes_position() {
        let mut closes = vec![100.0; 50];
        closes.extend([102.0, 106.0]);
        let candles = make_candles(&closes, HOUR_MS);

        let mut signals = scripted(vec![true; 10]);
        let result = BacktestEngine::run_inner(&params(), &candles, &mut signals).unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, Some(ExitReason::TakeProfit));
        assert_eq!(trade.exit_price, Some(dec!(106.0)));
        assert!(trade.pnl.unwrap() > Decimal::ZERO);
    }

    #[test]
    fn test_signal_disappearance_closes_position() {
        let mut closes = vec![100.0; 50];
        closes.extend([100.5, 100.8]);
        let candles = make_candles(&closes, HOUR_MS);

        // Fires on entry bar, gone two bars later
        let mut signals = scripted(vec![true, true, false]);
        let result = BacktestEngine::run_inner(&params(), &candles, &mut signals).unwrap();

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].exit_reason, Some(ExitReason::Signal));
    }

    #[test]
    fn test_open_position_left_unclosed_at_end() {
        let mut closes = vec![100.0; 50];
        closes.push(100.5);
        let candles = make_candles(&closes, HOUR_MS);

        let mut signals = scripted(vec![true, true]);
        let result = BacktestEngine::run_inner(&params(), &candles, &mut signals).unwrap();

        assert_eq!(result.trades.len(), 1);
        let trade = &result.trades[0];
        assert!(!trade.is_completed());
        assert_eq!(trade.exit_reason, None);
        // Open exposure is excluded from completed-trade statistics
        assert_eq!(result.total_trades, 0);
        assert_eq!(result.win_rate, Decimal::ZERO);
        // But the equity curve marks it to market
        assert!(result.final_capital > dec!(10000));
    }

    #[test]
    fn test_single_position_invariant() {
        // Signal present on every bar: position must re-open only after a close
        let mut closes = vec![100.0; 50];
        for i in 0..30 {
            closes.push(100.0 + ((i % 7) as f64) - 3.0);
        }
        let candles = make_candles(&closes, HOUR_MS);

        let mut signals = scripted(vec![true; 100]);
        let result = BacktestEngine::run_inner(&params(), &candles, &mut signals).unwrap();

        let completed: Vec<&Trade> = result.trades.iter().filter(|t| t.is_completed()).collect();
        for pair in completed.windows(2) {
            assert!(
                pair[0].exit_time.unwrap() <= pair[1].entry_time,
                "overlapping trades"
            );
        }
    }

    #[test]
    fn test_equity_point_per_evaluated_bar() {
        let candles = make_candles(&vec![100.0; 80], HOUR_MS);
        let mut signals = scripted(vec![false; 100]);
        let result = BacktestEngine::run_inner(&params(), &candles, &mut signals).unwrap();
        assert_eq!(result.equity_curve.len(), 80 - WARMUP_BARS + 1);
        assert!(result
            .equity_curve
            .iter()
            .all(|p| p.value == dec!(10000)));
    }

    #[test]
    fn test_monthly_rollover_and_tail_flush() {
        // Daily bars spanning ~3 calendar months, flat prices
        let candles = make_candles(&vec![100.0; 110], DAY_MS);
        let mut signals = scripted(vec![false; 200]);
        let result = BacktestEngine::run_inner(&params(), &candles, &mut signals).unwrap();

        assert!(result.monthly_returns.len() >= 2);
        for m in &result.monthly_returns {
            assert_eq!(m.ret, 0.0);
        }
        // Months are distinct and ordered
        for pair in result.monthly_returns.windows(2) {
            assert!(pair[0].month < pair[1].month);
        }
    }

    #[test]
    fn test_combined_mode_requires_both_analyzers() {
        // Window where the last bar collapses with a mid-range close: the
        // volatility analyzer fires, the flow heuristic does not.
        let d = |v: f64| Decimal::from_str_exact(&format!("{:.4}", v)).unwrap();
        let mut window: Vec<Candle> = (0..59)
            .map(|i| Candle {
                open_time: (i as i64) * HOUR_MS,
                open: d(100.0),
                high: d(100.5),
                low: d(99.5),
                close: d(100.0),
                volume: dec!(100),
                close_time: ((i + 1) as i64) * HOUR_MS - 1,
            })
            .collect();
        window.push(Candle {
            open_time: 59 * HOUR_MS,
            open: d(100.0),
            high: d(100.0),
            low: d(10.0),
            close: d(55.0),
            volume: dec!(100),
            close_time: 60 * HOUR_MS - 1,
        });

        let instrument = Instrument::from_symbol("BTCUSDT");
        let mut p = params();

        p.algorithm = AlgorithmChoice::VolatilityExtreme;
        assert!(evaluate_entry(&instrument, &p, &window).unwrap().is_some());

        p.algorithm = AlgorithmChoice::Flow;
        assert!(evaluate_entry(&instrument, &p, &window).unwrap().is_none());

        // AND semantics: one analyzer alone is not enough
        p.algorithm = AlgorithmChoice::Combined;
        assert!(evaluate_entry(&instrument, &p, &window).unwrap().is_none());
    }
}
