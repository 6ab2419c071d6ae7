//! Core data model: instruments, market data, signals, trades, backtest results

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Fixed signal lifetime: every signal expires exactly 24 hours after creation
pub const SIGNAL_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// A tradeable symbol. Reference data only; never mutated by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instrument {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub active: bool,
}

impl Instrument {
    /// Build an instrument from a concatenated symbol like "BTCUSDT"
    pub fn from_symbol(symbol: &str) -> Self {
        let (base, quote) = symbol
            .strip_suffix("USDT")
            .map(|b| (b, "USDT"))
            .or_else(|| symbol.strip_suffix("USDC").map(|b| (b, "USDC")))
            .or_else(|| symbol.strip_suffix("BTC").map(|b| (b, "BTC")))
            .unwrap_or((symbol, ""));
        Self {
            symbol: symbol.to_string(),
            base_asset: base.to_string(),
            quote_asset: quote.to_string(),
            active: true,
        }
    }
}

/// Point-in-time 24h market observation for one instrument.
/// `change_pct_24h` is a fraction: -0.05 means a 5% drop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub price: Decimal,
    pub volume_24h: Decimal,
    pub high_24h: Decimal,
    pub low_24h: Decimal,
    pub open_24h: Decimal,
    pub change_pct_24h: f64,
}

/// A single candlestick (OHLCV), times in epoch milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

/// Which analyzer produced a signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmKind {
    Flow,
    VolatilityExtreme,
}

impl AlgorithmKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmKind::Flow => "flow",
            AlgorithmKind::VolatilityExtreme => "volatility_extreme",
        }
    }
}

impl std::fmt::Display for AlgorithmKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalDirection {
    Buy,
    Sell,
    Hold,
}

impl SignalDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalDirection::Buy => "buy",
            SignalDirection::Sell => "sell",
            SignalDirection::Hold => "hold",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStatus {
    Active,
    Expired,
    Invalid,
}

impl SignalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalStatus::Active => "active",
            SignalStatus::Expired => "expired",
            SignalStatus::Invalid => "invalid",
        }
    }
}

/// One emitted trading signal. Created by an analyzer, expired by the
/// background sweep, never otherwise mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub id: Option<i64>,
    pub symbol: String,
    pub algorithm: AlgorithmKind,
    pub direction: SignalDirection,
    pub strength: f64,
    pub confidence: f64,
    pub price: Decimal,
    /// Algorithm-specific diagnostic values
    pub metadata: serde_json::Value,
    pub status: SignalStatus,
    pub created_at: i64,
    pub expires_at: i64,
}

impl Signal {
    /// Assemble a signal, clamping strength to [0,1] and deriving confidence
    /// as min(0.95, strength * 0.9). Expiry is always created_at + 24h.
    pub fn new(
        symbol: &str,
        algorithm: AlgorithmKind,
        direction: SignalDirection,
        strength: f64,
        price: Decimal,
        metadata: serde_json::Value,
        created_at: i64,
    ) -> Self {
        let strength = strength.clamp(0.0, 1.0);
        let confidence = (strength * 0.9).min(0.95);
        Self {
            id: None,
            symbol: symbol.to_string(),
            algorithm,
            direction,
            strength,
            confidence,
            price,
            metadata,
            status: SignalStatus::Active,
            created_at,
            expires_at: created_at + SIGNAL_TTL_MS,
        }
    }
}

/// Side of a simulated trade; the simulator only opens long positions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeSide {
    Long,
}

/// Why a simulated position was closed.
/// `EndOfPeriod` is kept for compatibility with results saved by earlier
/// versions; the simulator leaves the final position open instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    Signal,
    EndOfPeriod,
}

/// A trade produced during a backtest. Exit fields are populated exactly
/// once, when the position closes; a trade still open at the end of the
/// candle sequence keeps them `None`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trade {
    pub entry_time: i64,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub side: TradeSide,
    /// Strength of the signal that triggered entry
    pub signal_strength: f64,
    pub exit_time: Option<i64>,
    pub exit_price: Option<Decimal>,
    pub pnl: Option<Decimal>,
    pub pnl_pct: Option<f64>,
    pub exit_reason: Option<ExitReason>,
}

impl Trade {
    pub fn is_completed(&self) -> bool {
        self.exit_time.is_some()
    }
}

/// One mark-to-market point on the equity curve
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: i64,
    pub value: Decimal,
}

/// Return for one calendar month, as a fraction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyReturn {
    /// "YYYY-MM"
    pub month: String,
    #[serde(rename = "return")]
    pub ret: f64,
}

/// Which analyzer(s) drive a backtest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlgorithmChoice {
    Flow,
    VolatilityExtreme,
    /// Both analyzers must fire on the same bar; strength is averaged
    Combined,
}

impl std::fmt::Display for AlgorithmChoice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlgorithmChoice::Flow => write!(f, "flow"),
            AlgorithmChoice::VolatilityExtreme => write!(f, "volatility_extreme"),
            AlgorithmChoice::Combined => write!(f, "combined"),
        }
    }
}

/// Flow analyzer parameters.
/// `price_change_threshold` and ratios use fractions, not percent points.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowParams {
    /// Absolute 24h volume above which the strength boost applies
    pub volume_threshold: f64,
    /// Maximum (most positive) acceptable 24h change; e.g. -0.02 requires
    /// at least a 2% drop before the analyzer considers the instrument
    pub price_change_threshold: f64,
    /// Window, in hours, for the historical average-volume lookup
    pub lookback_hours: u32,
    /// Minimum current/average volume ratio for the volume component
    pub min_volume_ratio: f64,
    /// Confirmation bars carried into signal metadata for downstream gating
    pub confirmation_periods: u32,
}

impl Default for FlowParams {
    fn default() -> Self {
        Self {
            volume_threshold: 1_000_000.0,
            price_change_threshold: -0.02,
            lookback_hours: 24,
            min_volume_ratio: 1.5,
            confirmation_periods: 2,
        }
    }
}

impl FlowParams {
    pub fn validate(&self) -> EngineResult<()> {
        if !self.volume_threshold.is_finite() || self.volume_threshold < 0.0 {
            return Err(EngineError::InvalidParams(
                "volume_threshold must be a non-negative number".into(),
            ));
        }
        if !self.price_change_threshold.is_finite() || self.price_change_threshold > 0.0 {
            return Err(EngineError::InvalidParams(
                "price_change_threshold must be zero or negative".into(),
            ));
        }
        if self.lookback_hours == 0 {
            return Err(EngineError::InvalidParams(
                "lookback_hours must be at least 1".into(),
            ));
        }
        if !self.min_volume_ratio.is_finite() || self.min_volume_ratio < 1.0 {
            return Err(EngineError::InvalidParams(
                "min_volume_ratio must be at least 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// Volatility-extreme analyzer parameters. Thresholds are on the 0-100
/// range scale: oversold when the value rises past `threshold_low`,
/// overbought when it falls under `threshold_high`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolatilityParams {
    /// Trailing bars for the highest-high window
    pub period: usize,
    /// Trailing bars for the rolling band
    pub band_period: usize,
    /// Standard-deviation multiplier for the band width
    pub band_deviation: f64,
    pub threshold_low: f64,
    pub threshold_high: f64,
    /// SMA smoothing applied to the raw series; 1 disables smoothing
    pub smoothing_period: usize,
}

impl Default for VolatilityParams {
    fn default() -> Self {
        Self {
            period: 22,
            band_period: 20,
            band_deviation: 2.0,
            threshold_low: 60.0,
            threshold_high: 20.0,
            smoothing_period: 1,
        }
    }
}

impl VolatilityParams {
    pub fn validate(&self) -> EngineResult<()> {
        if self.period < 2 || self.band_period < 2 {
            return Err(EngineError::InvalidParams(
                "period and band_period must be at least 2".into(),
            ));
        }
        if !self.band_deviation.is_finite() || self.band_deviation <= 0.0 {
            return Err(EngineError::InvalidParams(
                "band_deviation must be positive".into(),
            ));
        }
        if !(0.0..=100.0).contains(&self.threshold_low)
            || !(0.0..=100.0).contains(&self.threshold_high)
        {
            return Err(EngineError::InvalidParams(
                "thresholds must lie in [0, 100]".into(),
            ));
        }
        if self.threshold_high >= self.threshold_low {
            return Err(EngineError::InvalidParams(
                "threshold_high must be below threshold_low".into(),
            ));
        }
        if self.smoothing_period == 0 {
            return Err(EngineError::InvalidParams(
                "smoothing_period must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Minimum candles required before the analyzer can evaluate a bar
    pub fn min_candles(&self) -> usize {
        self.period + self.band_period
    }
}

/// A named parameter bundle; one scan pass runs per bundle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlgorithmParams {
    pub name: String,
    pub flow: FlowParams,
    pub volatility: VolatilityParams,
}

impl Default for AlgorithmParams {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            flow: FlowParams::default(),
            volatility: VolatilityParams::default(),
        }
    }
}

impl AlgorithmParams {
    pub fn validate(&self) -> EngineResult<()> {
        self.flow.validate()?;
        self.volatility.validate()
    }
}

/// Configuration for a single backtest run.
/// Percent fields are percent points (2.0 = 2%), matching the stored schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BacktestParams {
    pub symbol: String,
    pub interval: String,
    pub algorithm: AlgorithmChoice,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub initial_capital: Decimal,
    /// Position size as percent of capital (10.0 = 10%)
    pub position_size_pct: Decimal,
    /// Stop-loss distance as percent of entry (2.0 = 2%)
    pub stop_loss_pct: Decimal,
    /// Take-profit distance as percent of entry (5.0 = 5%)
    pub take_profit_pct: Decimal,
    pub flow: FlowParams,
    pub volatility: VolatilityParams,
}

impl Default for BacktestParams {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            interval: "1h".to_string(),
            algorithm: AlgorithmChoice::VolatilityExtreme,
            start_time: None,
            end_time: None,
            initial_capital: Decimal::from(10000),
            position_size_pct: Decimal::from(10),
            stop_loss_pct: Decimal::from(2),
            take_profit_pct: Decimal::from(5),
            flow: FlowParams::default(),
            volatility: VolatilityParams::default(),
        }
    }
}

impl BacktestParams {
    pub fn validate(&self) -> EngineResult<()> {
        if self.initial_capital <= Decimal::ZERO {
            return Err(EngineError::InvalidParams(
                "initial_capital must be positive".into(),
            ));
        }
        if self.position_size_pct <= Decimal::ZERO || self.position_size_pct > Decimal::from(100) {
            return Err(EngineError::InvalidParams(
                "position_size_pct must lie in (0, 100]".into(),
            ));
        }
        if self.stop_loss_pct <= Decimal::ZERO || self.take_profit_pct <= Decimal::ZERO {
            return Err(EngineError::InvalidParams(
                "stop_loss_pct and take_profit_pct must be positive".into(),
            ));
        }
        self.flow.validate()?;
        self.volatility.validate()
    }
}

/// Result of one backtest run. Field names match the persisted schema
/// (`total_trades`, `win_rate`, `max_drawdown`, `sharpe_ratio`,
/// `profit_factor`, `equity_curve`, `monthly_returns`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub id: Option<i64>,
    pub symbol: String,
    pub interval: String,
    pub algorithm: AlgorithmChoice,
    pub params: BacktestParams,
    pub start_time: i64,
    pub end_time: i64,
    pub initial_capital: Decimal,
    pub final_capital: Decimal,
    /// (final - initial) / initial, as a fraction
    pub total_return: Decimal,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub losing_trades: u32,
    /// Fraction of completed trades with positive P&L
    pub win_rate: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub profit_factor: Decimal,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    /// Peak-to-trough fraction, always >= 0
    pub max_drawdown: Decimal,
    pub sharpe_ratio: Decimal,
    pub trades: Vec<Trade>,
    pub equity_curve: Vec<EquityPoint>,
    pub monthly_returns: Vec<MonthlyReturn>,
}
