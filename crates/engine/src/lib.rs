//! Sigscan Engine — signal generation and strategy backtesting
//!
//! Provides:
//! - Flow and volatility-extreme signal analyzers
//! - Periodic multi-symbol scan engine with dedup, persistence, and alerts
//! - Bar-by-bar backtest simulator with performance statistics
//! - Parameter sweep driver (cartesian grid search)
//! - Binance public API client for market data

pub mod analyzers;
pub mod api;
pub mod clock;
pub mod error;
pub mod performance;
pub mod scanner;
pub mod simulator;
pub mod sources;
pub mod stores;
pub mod sweep;
pub mod types;

// Re-exports for convenience
pub use analyzers::{FlowAnalyzer, VolatilityAnalyzer, MIN_SIGNAL_STRENGTH};
pub use api::BinanceClient;
pub use clock::{Clock, FixedClock, IdGenerator, RandomIdGenerator, SystemClock};
pub use error::{EngineError, EngineResult};
pub use performance::{compute_stats, max_drawdown, sharpe_ratio, PerformanceStats};
pub use scanner::{ScanConfig, ScanEngine, ScanStats};
pub use simulator::{run_backtest, BacktestEngine, SIGNAL_WINDOW, WARMUP_BARS};
pub use sources::{
    BacktestResultStore, CandleSource, InstrumentRepository, NotificationSink, ResultFilter,
    SignalStore, SnapshotSource,
};
pub use stores::{
    AlertBuffer, SqliteBacktestResultStore, SqliteInstrumentRepository, SqliteSignalStore,
};
pub use sweep::{
    best_index, cartesian, run_sweep, NamedRange, ParamRange, ScoredRun, SweepProgress,
    SweepRequest, SweepStatus,
};
pub use types::*;
