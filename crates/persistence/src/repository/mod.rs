//! Typed repositories over the SQLite pool

pub mod backtests;
pub mod instruments;
pub mod signals;

pub use backtests::{BacktestRepository, BacktestResultRecord};
pub use instruments::{InstrumentRecord, InstrumentRepository};
pub use signals::{SignalRecord, SignalRepository};
