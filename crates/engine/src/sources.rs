//! Abstract collaborator interfaces consumed by the engine
//!
//! The scan engine and simulator are written against these traits; the
//! SQLite-backed implementations live in `stores`, the Binance-backed
//! market data implementations in `api::binance`.

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::error::EngineResult;
use crate::types::{
    AlgorithmKind, BacktestResult, Candle, Instrument, MarketSnapshot, Signal, SignalDirection,
};

/// Instrument reference data, ranked by 24h volume descending
#[async_trait]
pub trait InstrumentRepository: Send + Sync {
    async fn list_active(&self, limit: usize) -> EngineResult<Vec<Instrument>>;
}

/// Supplies the per-cycle market snapshot and the historical average volume
/// the flow analyzer scores against
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn snapshot(&self, symbol: &str) -> EngineResult<MarketSnapshot>;

    /// Average volume per 24h over the trailing `window_hours`
    async fn average_volume(&self, symbol: &str, window_hours: u32) -> EngineResult<Decimal>;
}

/// Historical candles, ascending by open time, deduplicated by open time
#[async_trait]
pub trait CandleSource: Send + Sync {
    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: Option<u32>,
    ) -> EngineResult<Vec<Candle>>;
}

/// Signal persistence and the 24h dedup lookup
#[async_trait]
pub trait SignalStore: Send + Sync {
    async fn insert(&self, signals: &[Signal]) -> EngineResult<()>;

    /// True when an active signal for the same (symbol, algorithm,
    /// direction) was created at or after `since_ms`
    async fn has_recent(
        &self,
        symbol: &str,
        algorithm: AlgorithmKind,
        direction: SignalDirection,
        since_ms: i64,
    ) -> EngineResult<bool>;

    /// Mark active signals created before `older_than_ms` as expired,
    /// returning the number transitioned
    async fn mark_expired(&self, older_than_ms: i64) -> EngineResult<u64>;
}

/// Fan-out for freshly persisted signals. Fire-and-forget: a failing sink
/// must never abort the scan that produced the signals.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn publish(&self, signals: &[Signal]) -> EngineResult<()>;
}

/// Filter for listing stored backtest results
#[derive(Debug, Clone, Default)]
pub struct ResultFilter {
    pub symbol: Option<String>,
    pub algorithm: Option<String>,
}

/// Storage for completed backtest results
#[async_trait]
pub trait BacktestResultStore: Send + Sync {
    async fn save(&self, result: &BacktestResult) -> EngineResult<i64>;

    async fn list(
        &self,
        filter: &ResultFilter,
        limit: i64,
        offset: i64,
    ) -> EngineResult<(Vec<BacktestResult>, i64)>;

    async fn get(&self, id: i64) -> EngineResult<Option<BacktestResult>>;

    async fn delete(&self, id: i64) -> EngineResult<bool>;
}
