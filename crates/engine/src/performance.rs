//! Performance statistics over a completed backtest
//!
//! Pure functions of the trade list, equity curve, and monthly returns.
//! Only trades with a populated exit enter the trade statistics; a position
//! still open at the end of a run is ignored here.

use rust_decimal::Decimal;

use crate::types::{EquityPoint, MonthlyReturn, Trade};

/// Annual risk-free rate used in the Sharpe ratio
const RISK_FREE_RATE: f64 = 0.03;

/// Derived summary statistics for one run
#[derive(Debug, Clone, PartialEq)]
pub struct PerformanceStats {
    pub total_return: Decimal,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    pub win_rate: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub profit_factor: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub max_drawdown: Decimal,
    pub sharpe_ratio: Decimal,
}

/// Compute every summary statistic for a finished run
pub fn compute_stats(
    trades: &[Trade],
    equity_curve: &[EquityPoint],
    monthly_returns: &[MonthlyReturn],
    initial_capital: Decimal,
    final_capital: Decimal,
) -> PerformanceStats {
    let total_return = if initial_capital > Decimal::ZERO {
        (final_capital - initial_capital) / initial_capital
    } else {
        Decimal::ZERO
    };

    let completed: Vec<&Trade> = trades.iter().filter(|t| t.is_completed()).collect();
    let pnls: Vec<Decimal> = completed.iter().filter_map(|t| t.pnl).collect();

    let total_trades = pnls.len() as u32;
    let wins: Vec<Decimal> = pnls.iter().copied().filter(|p| *p > Decimal::ZERO).collect();
    let losses: Vec<Decimal> = pnls.iter().copied().filter(|p| *p <= Decimal::ZERO).collect();
    let winning_trades = wins.len() as u32;
    let losing_trades = losses.len() as u32;

    let win_rate = if total_trades > 0 {
        Decimal::from(winning_trades) / Decimal::from(total_trades)
    } else {
        Decimal::ZERO
    };

    let avg_win = mean(&wins);
    let avg_loss = mean(&losses);

    let profit_factor = if avg_loss != Decimal::ZERO {
        (avg_win / avg_loss).abs()
    } else {
        Decimal::ZERO
    };

    let largest_win = wins.iter().copied().max().unwrap_or(Decimal::ZERO);
    let largest_loss = losses.iter().copied().min().unwrap_or(Decimal::ZERO);

    PerformanceStats {
        total_return,
        total_trades,
        winning_trades,
        losing_trades,
        win_rate,
        avg_win,
        avg_loss,
        profit_factor,
        largest_win,
        largest_loss,
        max_drawdown: max_drawdown(equity_curve),
        sharpe_ratio: sharpe_ratio(monthly_returns),
    }
}

fn mean(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    values.iter().copied().sum::<Decimal>() / Decimal::from(values.len())
}

/// Largest peak-to-trough decline as a fraction of the peak.
/// Zero for an empty or non-decreasing curve.
pub fn max_drawdown(equity_curve: &[EquityPoint]) -> Decimal {
    let mut peak = Decimal::ZERO;
    let mut max_dd = Decimal::ZERO;

    for point in equity_curve {
        if point.value > peak {
            peak = point.value;
        }
        if peak > Decimal::ZERO {
            let dd = (peak - point.value) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
    }
    max_dd
}

/// Annualized Sharpe ratio from monthly return samples: mean x12 less the
/// 3% risk-free rate, over sample standard deviation x sqrt(12). Zero when
/// fewer than two months exist or the deviation vanishes.
pub fn sharpe_ratio(monthly_returns: &[MonthlyReturn]) -> Decimal {
    if monthly_returns.len() < 2 {
        return Decimal::ZERO;
    }

    let returns: Vec<f64> = monthly_returns.iter().map(|m| m.ret).collect();
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();

    let annualized_std = std_dev * 12f64.sqrt();
    if annualized_std < 1e-10 {
        return Decimal::ZERO;
    }

    let annualized_mean = mean * 12.0;
    let sharpe = (annualized_mean - RISK_FREE_RATE) / annualized_std;
    Decimal::from_str_exact(&format!("{:.4}", sharpe)).unwrap_or(Decimal::ZERO)
}
