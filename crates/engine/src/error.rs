//! Engine error taxonomy
//!
//! Per-instrument and per-combination failures are isolated by the callers
//! (scan and sweep loops log and continue); a single backtest run is
//! all-or-nothing.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// Fewer candles than the warm-up or indicator window requires.
    /// Fatal to the single call, not to the surrounding batch or sweep.
    #[error("insufficient data: need {required} candles, got {actual}")]
    InsufficientData { required: usize, actual: usize },

    /// Non-positive price fields or high < low; rejects the whole batch
    /// of candles handed to the analyzer, not just the offending bar.
    #[error("invalid candle data: {0}")]
    InvalidCandle(String),

    /// Parameter validation failure at the boundary
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Market data fetch failed after bounded retries
    #[error("upstream fetch failed: {0}")]
    UpstreamFetch(String),

    /// Signal or result save failure. For signals the in-memory result is
    /// still returned to the caller; the scan is not aborted.
    #[error("persistence error: {0}")]
    Persistence(String),
}

pub type EngineResult<T> = Result<T, EngineError>;
