//! Parameter sweep driver
//!
//! Expands min/max/step ranges into a full cartesian grid across algorithm
//! choice, position sizing, stop/take levels, and per-algorithm parameters,
//! then runs the simulator once per combination. Combinations run
//! sequentially with a short pause every few runs; a failing combination is
//! logged and excluded, never fatal to the sweep.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{
    atomic::{AtomicBool, AtomicU32, Ordering},
    Arc, RwLock,
};
use std::time::Duration;
use tracing::{info, warn};

use crate::simulator::BacktestEngine;
use crate::types::{AlgorithmChoice, BacktestParams, BacktestResult, Candle};

/// Combinations per pause, bounding burst load on shared stores
const RUNS_PER_PAUSE: usize = 5;
const PAUSE_MS: u64 = 100;

// ============================================================================
// Range expansion
// ============================================================================

/// Inclusive numeric range with a step; a degenerate range is one value
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ParamRange {
    pub fn single(value: f64) -> Self {
        Self {
            min: value,
            max: value,
            step: 0.0,
        }
    }

    /// Discrete values from min to max inclusive
    pub fn expand(&self) -> Vec<f64> {
        if self.step <= 0.0 || self.max <= self.min {
            return vec![self.min];
        }
        let mut values = Vec::new();
        let mut v = self.min;
        // Half-step tolerance keeps the endpoint despite float drift
        while v <= self.max + self.step * 0.5 {
            values.push(v);
            v += self.step;
        }
        values
    }
}

/// One named axis of the sweep grid
#[derive(Debug, Clone)]
pub struct NamedRange {
    pub name: String,
    pub values: Vec<f64>,
}

impl NamedRange {
    pub fn new(name: &str, values: Vec<f64>) -> Self {
        Self {
            name: name.to_string(),
            values,
        }
    }
}

/// Lazy cartesian product over named ranges, yielding one (name, value)
/// tuple per combination. Decoupled from any specific parameter shape.
pub struct CartesianProduct {
    ranges: Vec<NamedRange>,
    indices: Vec<usize>,
    exhausted: bool,
}

pub fn cartesian(ranges: Vec<NamedRange>) -> CartesianProduct {
    let exhausted = ranges.iter().any(|r| r.values.is_empty());
    let indices = vec![0; ranges.len()];
    CartesianProduct {
        ranges,
        indices,
        exhausted,
    }
}

impl Iterator for CartesianProduct {
    type Item = Vec<(String, f64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let tuple: Vec<(String, f64)> = self
            .ranges
            .iter()
            .zip(&self.indices)
            .map(|(r, &i)| (r.name.clone(), r.values[i]))
            .collect();

        // Odometer increment, least-significant axis last
        let mut pos = self.ranges.len();
        loop {
            if pos == 0 {
                self.exhausted = true;
                break;
            }
            pos -= 1;
            self.indices[pos] += 1;
            if self.indices[pos] < self.ranges[pos].values.len() {
                break;
            }
            self.indices[pos] = 0;
        }

        Some(tuple)
    }
}

// ============================================================================
// Sweep request
// ============================================================================

/// Grid specification. Any range left `None` collapses to the base
/// parameters' single nominal value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepRequest {
    /// Nominal parameters used for every axis without an explicit range
    pub base: BacktestParams,
    /// Algorithm choices to cross with the numeric grid
    pub algorithms: Vec<AlgorithmChoice>,
    pub position_size_pct: Option<ParamRange>,
    pub stop_loss_pct: Option<ParamRange>,
    pub take_profit_pct: Option<ParamRange>,
    pub min_volume_ratio: Option<ParamRange>,
    pub vol_period: Option<ParamRange>,
    pub vol_band_deviation: Option<ParamRange>,
    pub vol_threshold_low: Option<ParamRange>,
    pub vol_threshold_high: Option<ParamRange>,
}

impl SweepRequest {
    fn axes(&self) -> Vec<NamedRange> {
        let dec_f64 = |d: Decimal| d.to_string().parse::<f64>().unwrap_or(0.0);
        let axis = |name: &str, range: &Option<ParamRange>, nominal: f64| {
            NamedRange::new(
                name,
                range.unwrap_or_else(|| ParamRange::single(nominal)).expand(),
            )
        };

        vec![
            axis(
                "position_size_pct",
                &self.position_size_pct,
                dec_f64(self.base.position_size_pct),
            ),
            axis(
                "stop_loss_pct",
                &self.stop_loss_pct,
                dec_f64(self.base.stop_loss_pct),
            ),
            axis(
                "take_profit_pct",
                &self.take_profit_pct,
                dec_f64(self.base.take_profit_pct),
            ),
            axis(
                "min_volume_ratio",
                &self.min_volume_ratio,
                self.base.flow.min_volume_ratio,
            ),
            axis("vol_period", &self.vol_period, self.base.volatility.period as f64),
            axis(
                "vol_band_deviation",
                &self.vol_band_deviation,
                self.base.volatility.band_deviation,
            ),
            axis(
                "vol_threshold_low",
                &self.vol_threshold_low,
                self.base.volatility.threshold_low,
            ),
            axis(
                "vol_threshold_high",
                &self.vol_threshold_high,
                self.base.volatility.threshold_high,
            ),
        ]
    }

    /// Expand the full grid: algorithm choice x every numeric axis
    pub fn combinations(&self) -> Vec<BacktestParams> {
        let mut out = Vec::new();
        for &algorithm in &self.algorithms {
            for tuple in cartesian(self.axes()) {
                let mut params = self.base.clone();
                params.algorithm = algorithm;
                for (name, value) in &tuple {
                    apply_axis(&mut params, name, *value);
                }
                out.push(params);
            }
        }
        out
    }
}

fn apply_axis(params: &mut BacktestParams, name: &str, value: f64) {
    let dec = |v: f64| Decimal::from_str_exact(&format!("{:.6}", v)).unwrap_or(Decimal::ZERO);
    match name {
        "position_size_pct" => params.position_size_pct = dec(value),
        "stop_loss_pct" => params.stop_loss_pct = dec(value),
        "take_profit_pct" => params.take_profit_pct = dec(value),
        "min_volume_ratio" => params.flow.min_volume_ratio = value,
        "vol_period" => params.volatility.period = value.round().max(2.0) as usize,
        "vol_band_deviation" => params.volatility.band_deviation = value,
        "vol_threshold_low" => params.volatility.threshold_low = value,
        "vol_threshold_high" => params.volatility.threshold_high = value,
        _ => {}
    }
}

// ============================================================================
// Progress tracking
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    Idle,
    Running,
    Complete,
    Error,
}

/// Compact per-combination summary for progress polling
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredRun {
    pub rank: usize,
    pub params: serde_json::Value,
    pub total_return: Decimal,
    pub win_rate: Decimal,
    pub sharpe_ratio: Decimal,
    pub max_drawdown: Decimal,
    pub profit_factor: Decimal,
    pub total_trades: u32,
}

/// Shared progress between the API handler and the background sweep task
pub struct SweepProgress {
    pub status: RwLock<SweepStatus>,
    pub total_combinations: AtomicU32,
    pub completed: AtomicU32,
    pub cancelled: AtomicBool,
    pub results: RwLock<Vec<ScoredRun>>,
    pub error_message: RwLock<Option<String>>,
}

impl SweepProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(SweepStatus::Idle),
            total_combinations: AtomicU32::new(0),
            completed: AtomicU32::new(0),
            cancelled: AtomicBool::new(false),
            results: RwLock::new(Vec::new()),
            error_message: RwLock::new(None),
        }
    }

    pub fn reset(&self) {
        *self.status.write().unwrap() = SweepStatus::Running;
        self.total_combinations.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.cancelled.store(false, Ordering::Relaxed);
        *self.results.write().unwrap() = Vec::new();
        *self.error_message.write().unwrap() = None;
    }

    pub fn progress_pct(&self) -> f32 {
        let total = self.total_combinations.load(Ordering::Relaxed);
        let done = self.completed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.status.read().unwrap(), SweepStatus::Running)
    }
}

impl Default for SweepProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Sweep runner
// ============================================================================

/// Index of the best result by highest total return. Strictly-greater
/// reduction: on a tie the earlier combination wins.
pub fn best_index(results: &[BacktestResult]) -> Option<usize> {
    let mut best: Option<usize> = None;
    for (i, result) in results.iter().enumerate() {
        match best {
            Some(b) if results[b].total_return >= result.total_return => {}
            _ => best = Some(i),
        }
    }
    best
}

/// Run every combination of the request against the shared candle history.
/// Returns the successful results in grid order.
pub async fn run_sweep(
    request: SweepRequest,
    candles: Vec<Candle>,
    progress: Arc<SweepProgress>,
) -> Vec<BacktestResult> {
    let combinations = request.combinations();
    let total = combinations.len() as u32;
    progress.total_combinations.store(total, Ordering::Relaxed);

    info!(
        symbol = %request.base.symbol,
        combinations = total,
        bars = candles.len(),
        "Starting parameter sweep"
    );

    let mut results: Vec<BacktestResult> = Vec::with_capacity(combinations.len());

    for (i, params) in combinations.into_iter().enumerate() {
        if progress.cancelled.load(Ordering::Relaxed) {
            warn!("Sweep cancelled");
            break;
        }

        match BacktestEngine::run(&params, &candles) {
            Ok(result) => results.push(result),
            Err(e) => {
                warn!(
                    combination = i,
                    algorithm = %params.algorithm,
                    error = %e,
                    "Combination failed, excluding from results"
                );
            }
        }

        progress.completed.store((i + 1) as u32, Ordering::Relaxed);

        if (i + 1) % RUNS_PER_PAUSE == 0 {
            tokio::time::sleep(Duration::from_millis(PAUSE_MS)).await;
        }
    }

    finalize(&results, &progress);
    results
}

fn finalize(results: &[BacktestResult], progress: &Arc<SweepProgress>) {
    let mut scored: Vec<ScoredRun> = results
        .iter()
        .map(|r| ScoredRun {
            rank: 0,
            params: serde_json::to_value(&r.params).unwrap_or_default(),
            total_return: r.total_return,
            win_rate: r.win_rate,
            sharpe_ratio: r.sharpe_ratio,
            max_drawdown: r.max_drawdown,
            profit_factor: r.profit_factor,
            total_trades: r.total_trades,
        })
        .collect();

    // Stable sort keeps insertion order among equal returns
    scored.sort_by(|a, b| b.total_return.cmp(&a.total_return));
    for (i, s) in scored.iter_mut().enumerate() {
        s.rank = i + 1;
    }

    if let Some(best) = scored.first() {
        info!(
            rank = 1,
            total_return = %best.total_return,
            trades = best.total_trades,
            "Best combination found"
        );
    }

    *progress.results.write().unwrap() = scored;
    *progress.status.write().unwrap() = SweepStatus::Complete;

    info!(results = results.len(), "Sweep complete");
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn flat_candles(count: usize) -> Vec<Candle> {
        (0..count)
            .map(|i| Candle {
                open_time: (i as i64) * 3_600_000,
                open: dec!(100),
                high: dec!(101),
                low: dec!(99),
                close: dec!(100),
                volume: dec!(100),
                close_time: ((i + 1) as i64) * 3_600_000 - 1,
            })
            .collect()
    }

    #[test]
    fn test_param_range_expansion() {
        let r = ParamRange {
            min: 0.01,
            max: 0.03,
            step: 0.01,
        };
        let values = r.expand();
        assert_eq!(values.len(), 3);
        assert!((values[0] - 0.01).abs() < 1e-12);
        assert!((values[2] - 0.03).abs() < 1e-9);

        assert_eq!(ParamRange::single(5.0).expand(), vec![5.0]);
        let degenerate = ParamRange {
            min: 2.0,
            max: 1.0,
            step: 0.5,
        };
        assert_eq!(degenerate.expand(), vec![2.0]);
    }

    #[test]
    fn test_cartesian_is_lazy_and_complete() {
        let mut product = cartesian(vec![
            NamedRange::new("a", vec![1.0, 2.0]),
            NamedRange::new("b", vec![10.0, 20.0, 30.0]),
        ]);

        let first = product.next().unwrap();
        assert_eq!(first, vec![("a".to_string(), 1.0), ("b".to_string(), 10.0)]);

        let rest: Vec<_> = product.collect();
        assert_eq!(rest.len(), 5);
        assert_eq!(
            rest.last().unwrap(),
            &vec![("a".to_string(), 2.0), ("b".to_string(), 30.0)]
        );
    }

    #[test]
    fn test_cartesian_with_empty_axis_yields_nothing() {
        let mut product = cartesian(vec![
            NamedRange::new("a", vec![1.0]),
            NamedRange::new("b", vec![]),
        ]);
        assert!(product.next().is_none());
    }

    #[test]
    fn test_combinations_default_to_nominal_values() {
        let request = SweepRequest {
            base: BacktestParams::default(),
            algorithms: vec![AlgorithmChoice::Flow, AlgorithmChoice::VolatilityExtreme],
            position_size_pct: None,
            stop_loss_pct: Some(ParamRange {
                min: 1.0,
                max: 3.0,
                step: 1.0,
            }),
            take_profit_pct: None,
            min_volume_ratio: None,
            vol_period: None,
            vol_band_deviation: None,
            vol_threshold_low: None,
            vol_threshold_high: None,
        };

        let combos = request.combinations();
        // 2 algorithms x 3 stop-loss values, every other axis pinned
        assert_eq!(combos.len(), 6);
        assert!(combos
            .iter()
            .all(|p| p.position_size_pct == dec!(10) && p.take_profit_pct == dec!(5)));
        assert_eq!(combos[0].algorithm, AlgorithmChoice::Flow);
        assert_eq!(combos[5].algorithm, AlgorithmChoice::VolatilityExtreme);
    }

    #[test]
    fn test_best_index_prefers_first_on_ties() {
        let candles = flat_candles(50);
        let params = BacktestParams::default();
        let base = BacktestEngine::run(&params, &candles).unwrap();

        let mut second = base.clone();
        second.total_return = base.total_return; // identical return
        let mut third = base.clone();
        third.total_return = base.total_return - dec!(0.1);

        let results = vec![base, second, third];
        assert_eq!(best_index(&results), Some(0));

        assert_eq!(best_index(&[]), None);
    }

    #[tokio::test]
    async fn test_sweep_runs_all_combinations() {
        let request = SweepRequest {
            base: BacktestParams::default(),
            algorithms: vec![AlgorithmChoice::VolatilityExtreme],
            position_size_pct: None,
            stop_loss_pct: Some(ParamRange {
                min: 1.0,
                max: 2.0,
                step: 1.0,
            }),
            take_profit_pct: None,
            min_volume_ratio: None,
            vol_period: None,
            vol_band_deviation: None,
            vol_threshold_low: None,
            vol_threshold_high: None,
        };

        let progress = Arc::new(SweepProgress::new());
        progress.reset();
        let results = run_sweep(request, flat_candles(60), progress.clone()).await;

        assert_eq!(results.len(), 2);
        assert_eq!(progress.completed.load(Ordering::Relaxed), 2);
        assert!(matches!(
            *progress.status.read().unwrap(),
            SweepStatus::Complete
        ));
        assert_eq!(progress.results.read().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_combination_is_skipped() {
        // threshold_high of 70 crosses threshold_low (60): validation fails
        let request = SweepRequest {
            base: BacktestParams::default(),
            algorithms: vec![AlgorithmChoice::VolatilityExtreme],
            position_size_pct: None,
            stop_loss_pct: None,
            take_profit_pct: None,
            min_volume_ratio: None,
            vol_period: None,
            vol_band_deviation: None,
            vol_threshold_low: None,
            vol_threshold_high: Some(ParamRange {
                min: 20.0,
                max: 70.0,
                step: 50.0,
            }),
        };

        let progress = Arc::new(SweepProgress::new());
        progress.reset();
        let results = run_sweep(request, flat_candles(60), progress.clone()).await;

        assert_eq!(results.len(), 1);
        assert_eq!(progress.completed.load(Ordering::Relaxed), 2);
    }
}
