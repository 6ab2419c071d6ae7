//! SQLite-backed implementations of the collaborator interfaces
//!
//! Thin adapters over the persistence repositories, converting between the
//! engine's domain types and the stored record shapes, plus the in-memory
//! alert ring used as the default notification sink.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use std::str::FromStr;
use std::sync::RwLock;

use persistence::repository::{
    BacktestRepository, BacktestResultRecord, InstrumentRecord, SignalRecord, SignalRepository,
};
use persistence::SqlitePool;

use crate::error::{EngineError, EngineResult};
use crate::sources::{
    BacktestResultStore, InstrumentRepository, NotificationSink, ResultFilter, SignalStore,
};
use crate::types::{
    AlgorithmChoice, AlgorithmKind, BacktestParams, BacktestResult, Instrument, Signal,
    SignalDirection, SignalStatus,
};

const MAX_ALERTS: usize = 50;

fn db_err(e: impl std::fmt::Display) -> EngineError {
    EngineError::Persistence(e.to_string())
}

// ============================================================================
// Conversions
// ============================================================================

fn signal_to_record(signal: &Signal) -> SignalRecord {
    SignalRecord {
        id: signal.id,
        symbol: signal.symbol.clone(),
        algorithm: signal.algorithm.as_str().to_string(),
        direction: signal.direction.as_str().to_string(),
        strength: signal.strength,
        confidence: signal.confidence,
        price: signal.price.to_string(),
        metadata: signal.metadata.to_string(),
        status: signal.status.as_str().to_string(),
        created_at: signal.created_at,
        expires_at: signal.expires_at,
    }
}

fn record_to_signal(record: SignalRecord) -> EngineResult<Signal> {
    Ok(Signal {
        id: record.id,
        symbol: record.symbol,
        algorithm: parse_algorithm(&record.algorithm)?,
        direction: parse_direction(&record.direction)?,
        strength: record.strength,
        confidence: record.confidence,
        price: Decimal::from_str(&record.price).map_err(db_err)?,
        metadata: serde_json::from_str(&record.metadata).unwrap_or(serde_json::Value::Null),
        status: parse_status(&record.status)?,
        created_at: record.created_at,
        expires_at: record.expires_at,
    })
}

fn parse_algorithm(s: &str) -> EngineResult<AlgorithmKind> {
    match s {
        "flow" => Ok(AlgorithmKind::Flow),
        "volatility_extreme" => Ok(AlgorithmKind::VolatilityExtreme),
        other => Err(db_err(format!("unknown algorithm '{other}'"))),
    }
}

fn parse_direction(s: &str) -> EngineResult<SignalDirection> {
    match s {
        "buy" => Ok(SignalDirection::Buy),
        "sell" => Ok(SignalDirection::Sell),
        "hold" => Ok(SignalDirection::Hold),
        other => Err(db_err(format!("unknown direction '{other}'"))),
    }
}

fn parse_status(s: &str) -> EngineResult<SignalStatus> {
    match s {
        "active" => Ok(SignalStatus::Active),
        "expired" => Ok(SignalStatus::Expired),
        "invalid" => Ok(SignalStatus::Invalid),
        other => Err(db_err(format!("unknown status '{other}'"))),
    }
}

fn parse_choice(s: &str) -> EngineResult<AlgorithmChoice> {
    match s {
        "flow" => Ok(AlgorithmChoice::Flow),
        "volatility_extreme" => Ok(AlgorithmChoice::VolatilityExtreme),
        "combined" => Ok(AlgorithmChoice::Combined),
        other => Err(db_err(format!("unknown algorithm choice '{other}'"))),
    }
}

/// Deterministic hash identifying a (params, data window) pair
fn compute_params_hash(result: &BacktestResult) -> String {
    let params_json = serde_json::to_string(&result.params).unwrap_or_default();
    let input = format!(
        "{}|{}|{}|{}|{}|{}",
        result.symbol,
        result.interval,
        result.algorithm,
        params_json,
        result.start_time,
        result.end_time
    );
    let hash = Sha256::digest(input.as_bytes());
    hash.iter().map(|b| format!("{:02x}", b)).collect()
}

fn result_to_record(result: &BacktestResult) -> BacktestResultRecord {
    BacktestResultRecord {
        id: result.id,
        params_hash: compute_params_hash(result),
        symbol: result.symbol.clone(),
        interval: result.interval.clone(),
        algorithm: result.algorithm.to_string(),
        params: serde_json::to_string(&result.params).unwrap_or_default(),
        start_time: result.start_time,
        end_time: result.end_time,
        initial_capital: result.initial_capital.to_string(),
        final_capital: result.final_capital.to_string(),
        total_return: result.total_return.to_string(),
        total_trades: result.total_trades as i64,
        winning_trades: result.winning_trades as i64,
        losing_trades: result.losing_trades as i64,
        win_rate: result.win_rate.to_string(),
        avg_win: result.avg_win.to_string(),
        avg_loss: result.avg_loss.to_string(),
        profit_factor: result.profit_factor.to_string(),
        largest_win: result.largest_win.to_string(),
        largest_loss: result.largest_loss.to_string(),
        max_drawdown: result.max_drawdown.to_string(),
        sharpe_ratio: result.sharpe_ratio.to_string(),
        trades: serde_json::to_string(&result.trades).unwrap_or_else(|_| "[]".to_string()),
        equity_curve: serde_json::to_string(&result.equity_curve)
            .unwrap_or_else(|_| "[]".to_string()),
        monthly_returns: serde_json::to_string(&result.monthly_returns)
            .unwrap_or_else(|_| "[]".to_string()),
        created_at: None,
    }
}

fn record_to_result(record: BacktestResultRecord) -> EngineResult<BacktestResult> {
    let dec = |s: &str| Decimal::from_str(s).map_err(db_err);
    let params: BacktestParams = serde_json::from_str(&record.params).map_err(db_err)?;

    Ok(BacktestResult {
        id: record.id,
        symbol: record.symbol,
        interval: record.interval,
        algorithm: parse_choice(&record.algorithm)?,
        params,
        start_time: record.start_time,
        end_time: record.end_time,
        initial_capital: dec(&record.initial_capital)?,
        final_capital: dec(&record.final_capital)?,
        total_return: dec(&record.total_return)?,
        total_trades: record.total_trades as u32,
        winning_trades: record.winning_trades as u32,
        losing_trades: record.losing_trades as u32,
        win_rate: dec(&record.win_rate)?,
        avg_win: dec(&record.avg_win)?,
        avg_loss: dec(&record.avg_loss)?,
        profit_factor: dec(&record.profit_factor)?,
        largest_win: dec(&record.largest_win)?,
        largest_loss: dec(&record.largest_loss)?,
        max_drawdown: dec(&record.max_drawdown)?,
        sharpe_ratio: dec(&record.sharpe_ratio)?,
        trades: serde_json::from_str(&record.trades).map_err(db_err)?,
        equity_curve: serde_json::from_str(&record.equity_curve).map_err(db_err)?,
        monthly_returns: serde_json::from_str(&record.monthly_returns).map_err(db_err)?,
    })
}

// ============================================================================
// SQLite adapters
// ============================================================================

/// Instrument reference data backed by the instruments table
pub struct SqliteInstrumentRepository {
    pool: SqlitePool,
}

impl SqliteInstrumentRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Seed or refresh one instrument row
    pub async fn upsert(&self, instrument: &Instrument, volume_24h: Decimal) -> EngineResult<()> {
        let repo = persistence::repository::instruments::InstrumentRepository::new(&self.pool);
        repo.upsert(&InstrumentRecord {
            symbol: instrument.symbol.clone(),
            base_asset: instrument.base_asset.clone(),
            quote_asset: instrument.quote_asset.clone(),
            active: instrument.active as i64,
            volume_24h: volume_24h.to_string(),
            updated_at: None,
        })
        .await
        .map_err(db_err)
    }
}

#[async_trait]
impl InstrumentRepository for SqliteInstrumentRepository {
    async fn list_active(&self, limit: usize) -> EngineResult<Vec<Instrument>> {
        let repo = persistence::repository::instruments::InstrumentRepository::new(&self.pool);
        let records = repo.list_active(limit as i64).await.map_err(db_err)?;
        Ok(records
            .into_iter()
            .map(|r| Instrument {
                symbol: r.symbol,
                base_asset: r.base_asset,
                quote_asset: r.quote_asset,
                active: r.active != 0,
            })
            .collect())
    }
}

/// Signal persistence backed by the signals table
pub struct SqliteSignalStore {
    pool: SqlitePool,
}

impl SqliteSignalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Recent signals for the API, newest first
    pub async fn list_recent(
        &self,
        limit: i64,
        offset: i64,
        status: Option<&str>,
    ) -> EngineResult<Vec<Signal>> {
        let repo = SignalRepository::new(&self.pool);
        let records = repo
            .list_recent(limit, offset, status)
            .await
            .map_err(db_err)?;
        records.into_iter().map(record_to_signal).collect()
    }
}

#[async_trait]
impl SignalStore for SqliteSignalStore {
    async fn insert(&self, signals: &[Signal]) -> EngineResult<()> {
        let records: Vec<SignalRecord> = signals.iter().map(signal_to_record).collect();
        let repo = SignalRepository::new(&self.pool);
        repo.insert_batch(&records).await.map_err(db_err)?;
        Ok(())
    }

    async fn has_recent(
        &self,
        symbol: &str,
        algorithm: AlgorithmKind,
        direction: SignalDirection,
        since_ms: i64,
    ) -> EngineResult<bool> {
        let repo = SignalRepository::new(&self.pool);
        repo.exists_recent(symbol, algorithm.as_str(), direction.as_str(), since_ms)
            .await
            .map_err(db_err)
    }

    async fn mark_expired(&self, older_than_ms: i64) -> EngineResult<u64> {
        let repo = SignalRepository::new(&self.pool);
        repo.mark_expired(older_than_ms).await.map_err(db_err)
    }
}

/// Backtest result persistence backed by the backtest_results table
pub struct SqliteBacktestResultStore {
    pool: SqlitePool,
}

impl SqliteBacktestResultStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BacktestResultStore for SqliteBacktestResultStore {
    async fn save(&self, result: &BacktestResult) -> EngineResult<i64> {
        let repo = BacktestRepository::new(&self.pool);
        repo.save(&result_to_record(result)).await.map_err(db_err)
    }

    async fn list(
        &self,
        filter: &ResultFilter,
        limit: i64,
        offset: i64,
    ) -> EngineResult<(Vec<BacktestResult>, i64)> {
        let repo = BacktestRepository::new(&self.pool);
        let (records, total) = repo
            .list(
                limit,
                offset,
                filter.symbol.as_deref(),
                filter.algorithm.as_deref(),
            )
            .await
            .map_err(db_err)?;
        let results: EngineResult<Vec<BacktestResult>> =
            records.into_iter().map(record_to_result).collect();
        Ok((results?, total))
    }

    async fn get(&self, id: i64) -> EngineResult<Option<BacktestResult>> {
        let repo = BacktestRepository::new(&self.pool);
        match repo.get(id).await.map_err(db_err)? {
            Some(record) => Ok(Some(record_to_result(record)?)),
            None => Ok(None),
        }
    }

    async fn delete(&self, id: i64) -> EngineResult<bool> {
        let repo = BacktestRepository::new(&self.pool);
        repo.delete(id).await.map_err(db_err)
    }
}

// ============================================================================
// Alert ring
// ============================================================================

/// In-memory notification sink holding the most recent signals, newest
/// first, capped at 50. The server exposes this buffer for polling.
#[derive(Default)]
pub struct AlertBuffer {
    alerts: RwLock<Vec<Signal>>,
}

impl AlertBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recent(&self) -> Vec<Signal> {
        self.alerts
            .read()
            .unwrap()
            .clone()
    }
}

#[async_trait]
impl NotificationSink for AlertBuffer {
    async fn publish(&self, signals: &[Signal]) -> EngineResult<()> {
        let mut alerts = self.alerts.write().unwrap();
        for signal in signals {
            alerts.insert(0, signal.clone());
        }
        alerts.truncate(MAX_ALERTS);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EquityPoint, MonthlyReturn};
    use persistence::Database;
    use rust_decimal_macros::dec;

    fn signal(symbol: &str, created_at: i64) -> Signal {
        Signal::new(
            symbol,
            AlgorithmKind::Flow,
            SignalDirection::Buy,
            0.8,
            dec!(95.5),
            serde_json::json!({"score": 65.0}),
            created_at,
        )
    }

    #[tokio::test]
    async fn test_signal_store_roundtrip_and_dedup_lookup() {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteSignalStore::new(db.pool_clone());

        store
            .insert(&[signal("BTCUSDT", 1_000), signal("ETHUSDT", 2_000)])
            .await
            .unwrap();

        assert!(store
            .has_recent(
                "BTCUSDT",
                AlgorithmKind::Flow,
                SignalDirection::Buy,
                500
            )
            .await
            .unwrap());
        assert!(!store
            .has_recent(
                "BTCUSDT",
                AlgorithmKind::VolatilityExtreme,
                SignalDirection::Buy,
                500
            )
            .await
            .unwrap());

        let listed = store.list_recent(10, 0, None).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].symbol, "ETHUSDT");
        assert_eq!(listed[0].price, dec!(95.5));
        assert_eq!(listed[0].metadata["score"], 65.0);

        let expired = store.mark_expired(1_500).await.unwrap();
        assert_eq!(expired, 1);
        assert!(!store
            .has_recent("BTCUSDT", AlgorithmKind::Flow, SignalDirection::Buy, 0)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_result_store_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        let store = SqliteBacktestResultStore::new(db.pool_clone());

        let mut result = BacktestResult {
            id: None,
            symbol: "BTCUSDT".to_string(),
            interval: "1h".to_string(),
            algorithm: AlgorithmChoice::Combined,
            params: BacktestParams::default(),
            start_time: 0,
            end_time: 1_000,
            initial_capital: dec!(10000),
            final_capital: dec!(10500),
            total_return: dec!(0.05),
            total_trades: 2,
            winning_trades: 1,
            losing_trades: 1,
            win_rate: dec!(0.5),
            avg_win: dec!(600),
            avg_loss: dec!(-100),
            profit_factor: dec!(6),
            largest_win: dec!(600),
            largest_loss: dec!(-100),
            max_drawdown: dec!(0.01),
            sharpe_ratio: dec!(1.5),
            trades: vec![],
            equity_curve: vec![EquityPoint {
                date: 0,
                value: dec!(10000),
            }],
            monthly_returns: vec![MonthlyReturn {
                month: "2024-01".to_string(),
                ret: 0.05,
            }],
        };

        let id = store.save(&result).await.unwrap();
        // Identical configuration over the same window dedups to the same row
        assert_eq!(store.save(&result).await.unwrap(), id);

        let loaded = store.get(id).await.unwrap().expect("row should exist");
        assert_eq!(loaded.algorithm, AlgorithmChoice::Combined);
        assert_eq!(loaded.total_return, dec!(0.05));
        assert_eq!(loaded.equity_curve.len(), 1);
        assert_eq!(loaded.monthly_returns[0].month, "2024-01");

        // A different window is a new row
        result.end_time = 2_000;
        let other = store.save(&result).await.unwrap();
        assert_ne!(other, id);

        let filter = ResultFilter {
            symbol: Some("BTCUSDT".to_string()),
            algorithm: None,
        };
        let (rows, total) = store.list(&filter, 10, 0).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows.len(), 2);

        assert!(store.delete(id).await.unwrap());
        assert!(store.get(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_instrument_repository_ranking() {
        let db = Database::in_memory().await.unwrap();
        let repo = SqliteInstrumentRepository::new(db.pool_clone());

        repo.upsert(&Instrument::from_symbol("BTCUSDT"), dec!(500))
            .await
            .unwrap();
        repo.upsert(&Instrument::from_symbol("ETHUSDT"), dec!(900))
            .await
            .unwrap();

        let listed = repo.list_active(10).await.unwrap();
        assert_eq!(listed[0].symbol, "ETHUSDT");
        assert_eq!(listed.len(), 2);

        let capped = repo.list_active(1).await.unwrap();
        assert_eq!(capped.len(), 1);
    }

    #[tokio::test]
    async fn test_alert_buffer_caps_and_orders() {
        let buffer = AlertBuffer::new();
        for i in 0..60 {
            buffer.publish(&[signal("BTCUSDT", i)]).await.unwrap();
        }
        let recent = buffer.recent();
        assert_eq!(recent.len(), MAX_ALERTS);
        assert_eq!(recent[0].created_at, 59);
    }
}
