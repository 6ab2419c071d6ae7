//! Signal analyzers
//!
//! Two independent scoring functions: the flow analyzer (volume surge +
//! price position in the 24h range + negative momentum, fed by a market
//! snapshot) and the volatility-extreme analyzer (normalized high-low range
//! against a rolling band, fed by a candle sequence). Each emits at most one
//! signal per call; both are pure functions of their inputs.

use rust_decimal::Decimal;
use serde_json::json;
use ta::indicators::{SimpleMovingAverage, StandardDeviation};
use ta::Next;

use crate::error::{EngineError, EngineResult};
use crate::types::{
    AlgorithmKind, Candle, FlowParams, Instrument, MarketSnapshot, Signal, SignalDirection,
    VolatilityParams,
};

/// Signals below this strength are suppressed
pub const MIN_SIGNAL_STRENGTH: f64 = 0.5;

// ============================================================================
// Helpers
// ============================================================================

fn dec_f64(d: Decimal) -> f64 {
    d.to_string().parse::<f64>().unwrap_or(0.0)
}

/// Reject the whole batch on any non-positive OHLC field or high < low
pub fn validate_candles(candles: &[Candle]) -> EngineResult<()> {
    for c in candles {
        if c.open <= Decimal::ZERO
            || c.high <= Decimal::ZERO
            || c.low <= Decimal::ZERO
            || c.close <= Decimal::ZERO
        {
            return Err(EngineError::InvalidCandle(format!(
                "non-positive price at open_time {}",
                c.open_time
            )));
        }
        if c.high < c.low {
            return Err(EngineError::InvalidCandle(format!(
                "high below low at open_time {}",
                c.open_time
            )));
        }
    }
    Ok(())
}

// ============================================================================
// Flow analyzer
// ============================================================================

/// Volume/price-position heuristic over a 24h market snapshot.
///
/// Only instruments that have already fallen past the configured threshold
/// are considered; the score rewards a volume surge relative to the
/// historical average, a price near the bottom of the 24h range, and
/// negative momentum.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlowAnalyzer;

impl FlowAnalyzer {
    /// Score one snapshot. `average_volume` is the injected historical
    /// lookup over `params.lookback_hours`. Returns `None` when the
    /// preconditions fail or the strength stays under the emission floor.
    pub fn analyze(
        &self,
        instrument: &Instrument,
        snapshot: &MarketSnapshot,
        average_volume: Decimal,
        params: &FlowParams,
        now_ms: i64,
    ) -> Option<Signal> {
        // Early rejection: not fallen enough, or degenerate inputs
        if snapshot.change_pct_24h > params.price_change_threshold {
            return None;
        }
        if snapshot.volume_24h <= Decimal::ZERO || snapshot.price <= Decimal::ZERO {
            return None;
        }

        let volume = dec_f64(snapshot.volume_24h);
        let price = dec_f64(snapshot.price);
        let high = dec_f64(snapshot.high_24h);
        let low = dec_f64(snapshot.low_24h);
        let avg_volume = dec_f64(average_volume);

        // Volume-ratio component (0-40)
        let volume_ratio = if avg_volume > 0.0 {
            volume / avg_volume
        } else {
            0.0
        };
        let volume_score = if volume_ratio >= params.min_volume_ratio {
            ((volume_ratio - params.min_volume_ratio) * 20.0).min(40.0)
        } else {
            0.0
        };

        // Price-position component (0-30); degenerate range counts as top
        let price_position = if high > low {
            (price - low) / (high - low)
        } else {
            1.0
        };
        let position_score = if price_position <= 0.3 {
            (1.0 - price_position / 0.3) * 30.0
        } else {
            0.0
        };

        // Momentum component (0-30) from the 24h change fraction
        let momentum_score = if snapshot.change_pct_24h < 0.0 {
            (snapshot.change_pct_24h.abs() * 100.0).min(30.0)
        } else {
            0.0
        };

        let score = volume_score + position_score + momentum_score;

        let mut strength = score / 100.0;
        if volume >= params.volume_threshold {
            strength += 0.2;
        }
        if price_position <= 0.2 {
            strength += 0.15;
        }
        let strength = strength.clamp(0.0, 1.0);

        if strength < MIN_SIGNAL_STRENGTH {
            return None;
        }

        let metadata = json!({
            "score": score,
            "volume_score": volume_score,
            "position_score": position_score,
            "momentum_score": momentum_score,
            "volume_ratio": volume_ratio,
            "price_position": price_position,
            "change_pct_24h": snapshot.change_pct_24h,
            "confirmation_periods": params.confirmation_periods,
        });

        Some(Signal::new(
            &instrument.symbol,
            AlgorithmKind::Flow,
            SignalDirection::Buy,
            strength,
            snapshot.price,
            metadata,
            now_ms,
        ))
    }
}

// ============================================================================
// Volatility-extreme analyzer
// ============================================================================

/// Rolling band over the volatility-extreme series at the latest bar
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VolatilityBand {
    pub value: f64,
    pub middle: f64,
    pub upper: f64,
    pub lower: f64,
}

/// Normalized high-low-range heuristic over a candle sequence.
///
/// Per bar: value = (highest high over `period` - current low) / highest
/// high * 100; a rolling SMA +/- deviation band over the value series marks
/// how stretched the latest reading is.
#[derive(Debug, Default, Clone, Copy)]
pub struct VolatilityAnalyzer;

impl VolatilityAnalyzer {
    /// Evaluate the latest bar of `candles`. Errors on short or corrupt
    /// input; returns `None` while the band is degenerate or the strength
    /// stays under the emission floor.
    pub fn analyze(
        &self,
        instrument: &Instrument,
        candles: &[Candle],
        params: &VolatilityParams,
        now_ms: i64,
    ) -> EngineResult<Option<Signal>> {
        let required = params.min_candles();
        if candles.len() < required {
            return Err(EngineError::InsufficientData {
                required,
                actual: candles.len(),
            });
        }
        validate_candles(candles)?;

        let band = match Self::compute_band(candles, params) {
            Some(b) => b,
            None => return Ok(None),
        };

        // Signals are suppressed until the band has positive width: a flat
        // series (zero variance) carries no oversold/overbought distinction.
        let band_range = band.upper - band.lower;
        if band_range <= f64::EPSILON {
            return Ok(None);
        }

        let oversold = band.value >= params.threshold_low;
        let overbought = band.value <= params.threshold_high;

        let (direction, overshoot) = if oversold {
            let span = 100.0 - params.threshold_low;
            let overshoot = if span > 0.0 {
                (band.value - params.threshold_low) / span
            } else {
                1.0
            };
            (SignalDirection::Buy, overshoot)
        } else if overbought {
            let overshoot = if params.threshold_high > 0.0 {
                (params.threshold_high - band.value) / params.threshold_high
            } else {
                1.0
            };
            (SignalDirection::Sell, overshoot)
        } else {
            return Ok(None);
        };

        let mut strength = (overshoot * 1.5).min(1.0);

        // Extreme readings on the 0-100 scale
        match direction {
            SignalDirection::Buy if band.value > 80.0 => strength += 0.2,
            SignalDirection::Sell if band.value < 20.0 => strength += 0.2,
            _ => {}
        }

        // Outer 20% of the band range on the signal's side
        match direction {
            SignalDirection::Buy if band.value >= band.lower + 0.8 * band_range => {
                strength += 0.1;
            }
            SignalDirection::Sell if band.value <= band.lower + 0.2 * band_range => {
                strength += 0.1;
            }
            _ => {}
        }

        let strength = strength.clamp(0.0, 1.0);
        if strength < MIN_SIGNAL_STRENGTH {
            return Ok(None);
        }

        let last_close = candles.last().map(|c| c.close).unwrap_or(Decimal::ZERO);
        let metadata = json!({
            "value": band.value,
            "band_middle": band.middle,
            "band_upper": band.upper,
            "band_lower": band.lower,
            "overshoot": overshoot,
        });

        Ok(Some(Signal::new(
            &instrument.symbol,
            AlgorithmKind::VolatilityExtreme,
            direction,
            strength,
            last_close,
            metadata,
            now_ms,
        )))
    }

    /// Build the volatility-extreme series and its rolling band, returning
    /// the state at the latest bar. `None` until enough series values exist
    /// for a full band window.
    fn compute_band(candles: &[Candle], params: &VolatilityParams) -> Option<VolatilityBand> {
        if candles.len() < params.period {
            return None;
        }

        let mut smoother = SimpleMovingAverage::new(params.smoothing_period).ok()?;
        let mut band_sma = SimpleMovingAverage::new(params.band_period).ok()?;
        let mut band_sd = StandardDeviation::new(params.band_period).ok()?;

        let mut series_len = 0usize;
        let mut last = VolatilityBand {
            value: 0.0,
            middle: 0.0,
            upper: 0.0,
            lower: 0.0,
        };

        for i in (params.period - 1)..candles.len() {
            let window = &candles[i + 1 - params.period..=i];
            let highest_high = window
                .iter()
                .map(|c| dec_f64(c.high))
                .fold(f64::MIN, f64::max);
            if highest_high <= 0.0 {
                return None;
            }

            let low = dec_f64(candles[i].low);
            let raw = (highest_high - low) / highest_high * 100.0;
            let value = smoother.next(raw);

            let middle = band_sma.next(value);
            let sd = band_sd.next(value);
            series_len += 1;

            last = VolatilityBand {
                value,
                middle,
                upper: middle + params.band_deviation * sd,
                lower: middle - params.band_deviation * sd,
            };
        }

        if series_len < params.band_period {
            return None;
        }
        Some(last)
    }
}
