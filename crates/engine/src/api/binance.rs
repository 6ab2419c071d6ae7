//! Binance public API client for market data (no authentication required)
//!
//! Implements the engine's `SnapshotSource` and `CandleSource` interfaces.
//! Requests carry a timeout; the scan engine wraps calls in its own bounded
//! retry, so failures surface here as plain errors.

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::sources::{CandleSource, SnapshotSource};
use crate::types::{Candle, MarketSnapshot};

const DEFAULT_BASE_URL: &str = "https://api.binance.com";
const MAX_KLINES_PER_REQUEST: u32 = 1000;

/// Binance public market data client
#[derive(Clone)]
pub struct BinanceClient {
    client: Client,
    base_url: String,
}

/// Raw kline data from Binance API (array of arrays)
#[derive(Debug, Deserialize)]
#[allow(dead_code)]
struct RawKline(
    i64,    // 0: Open time
    String, // 1: Open
    String, // 2: High
    String, // 3: Low
    String, // 4: Close
    String, // 5: Volume
    i64,    // 6: Close time
    String, // 7: Quote asset volume
    u64,    // 8: Number of trades
    String, // 9: Taker buy base
    String, // 10: Taker buy quote
    String, // 11: Ignore
);

/// Binance 24h ticker statistics
#[derive(Debug, Clone, Deserialize)]
pub struct TickerStats {
    pub symbol: String,
    #[serde(rename = "priceChangePercent")]
    pub price_change_percent: String,
    #[serde(rename = "highPrice")]
    pub high_price: String,
    #[serde(rename = "lowPrice")]
    pub low_price: String,
    #[serde(rename = "openPrice")]
    pub open_price: String,
    #[serde(rename = "volume")]
    pub volume: String,
    #[serde(rename = "lastPrice")]
    pub last_price: String,
}

impl Default for BinanceClient {
    fn default() -> Self {
        Self::new()
    }
}

impl BinanceClient {
    /// Create a new Binance client with default base URL
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_BASE_URL)
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.to_string(),
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> EngineResult<T> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| EngineError::UpstreamFetch(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::UpstreamFetch(format!(
                "Binance API error {status}: {body}"
            )));
        }

        response
            .json::<T>()
            .await
            .map_err(|e| EngineError::UpstreamFetch(e.to_string()))
    }

    /// Fetch klines (candlestick data) for a symbol
    pub async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: Option<u32>,
    ) -> EngineResult<Vec<Candle>> {
        let mut url = format!(
            "{}/api/v3/klines?symbol={}&interval={}",
            self.base_url, symbol, interval
        );

        if let Some(start) = start_time {
            url.push_str(&format!("&startTime={}", start));
        }
        if let Some(end) = end_time {
            url.push_str(&format!("&endTime={}", end));
        }

        let limit = limit.unwrap_or(500).min(MAX_KLINES_PER_REQUEST);
        url.push_str(&format!("&limit={}", limit));

        debug!(symbol, interval, "Fetching klines from Binance");

        let raw_klines: Vec<RawKline> = self.get_json(&url).await?;

        let mut candles: Vec<Candle> = raw_klines
            .into_iter()
            .filter_map(|raw| {
                Some(Candle {
                    open_time: raw.0,
                    open: Decimal::from_str(&raw.1).ok()?,
                    high: Decimal::from_str(&raw.2).ok()?,
                    low: Decimal::from_str(&raw.3).ok()?,
                    close: Decimal::from_str(&raw.4).ok()?,
                    volume: Decimal::from_str(&raw.5).ok()?,
                    close_time: raw.6,
                })
            })
            .collect();

        // Contract: ascending by open time, deduplicated by open time
        candles.sort_by_key(|c| c.open_time);
        candles.dedup_by_key(|c| c.open_time);

        debug!(count = candles.len(), "Fetched klines");
        Ok(candles)
    }

    /// Fetch klines with automatic pagination for ranges > 1000 bars
    pub async fn get_klines_paginated(
        &self,
        symbol: &str,
        interval: &str,
        start_time: i64,
        end_time: i64,
    ) -> EngineResult<Vec<Candle>> {
        let mut all_candles = Vec::new();
        let mut current_start = start_time;

        info!(symbol, interval, "Fetching paginated klines from Binance");

        loop {
            if current_start >= end_time {
                break;
            }

            let candles = self
                .get_klines(
                    symbol,
                    interval,
                    Some(current_start),
                    Some(end_time),
                    Some(MAX_KLINES_PER_REQUEST),
                )
                .await?;

            if candles.is_empty() {
                break;
            }

            let last_close_time = candles.last().map(|c| c.close_time).unwrap_or(end_time);
            all_candles.extend(candles);

            // Move start to after the last candle
            current_start = last_close_time + 1;

            // Small delay to respect rate limits
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }

        all_candles.dedup_by_key(|c| c.open_time);

        info!(total = all_candles.len(), "Paginated kline fetch complete");
        Ok(all_candles)
    }

    /// Get 24h ticker statistics
    pub async fn get_24h_stats(&self, symbol: &str) -> EngineResult<TickerStats> {
        let url = format!("{}/api/v3/ticker/24hr?symbol={}", self.base_url, symbol);
        self.get_json(&url).await
    }
}

fn parse_decimal(field: &str, value: &str) -> EngineResult<Decimal> {
    Decimal::from_str(value)
        .map_err(|e| EngineError::UpstreamFetch(format!("bad {field} '{value}': {e}")))
}

#[async_trait]
impl SnapshotSource for BinanceClient {
    async fn snapshot(&self, symbol: &str) -> EngineResult<MarketSnapshot> {
        let stats = self.get_24h_stats(symbol).await?;

        // Binance reports percent points; the engine works in fractions
        let change_pct = stats
            .price_change_percent
            .parse::<f64>()
            .map(|p| p / 100.0)
            .unwrap_or(0.0);

        Ok(MarketSnapshot {
            symbol: stats.symbol.clone(),
            price: parse_decimal("lastPrice", &stats.last_price)?,
            volume_24h: parse_decimal("volume", &stats.volume)?,
            high_24h: parse_decimal("highPrice", &stats.high_price)?,
            low_24h: parse_decimal("lowPrice", &stats.low_price)?,
            open_24h: parse_decimal("openPrice", &stats.open_price)?,
            change_pct_24h: change_pct,
        })
    }

    /// Average 24h volume over the trailing window: mean hourly volume
    /// from 1h candles, scaled to a day
    async fn average_volume(&self, symbol: &str, window_hours: u32) -> EngineResult<Decimal> {
        let candles = self
            .get_klines(symbol, "1h", None, None, Some(window_hours.max(1)))
            .await?;
        if candles.is_empty() {
            return Ok(Decimal::ZERO);
        }
        let total: Decimal = candles.iter().map(|c| c.volume).sum();
        let hourly_avg = total / Decimal::from(candles.len());
        Ok(hourly_avg * Decimal::from(24))
    }
}

#[async_trait]
impl CandleSource for BinanceClient {
    async fn get_candles(
        &self,
        symbol: &str,
        interval: &str,
        start_time: Option<i64>,
        end_time: Option<i64>,
        limit: Option<u32>,
    ) -> EngineResult<Vec<Candle>> {
        match (start_time, end_time) {
            (Some(start), Some(end)) if end.saturating_sub(start) > 0 && limit.is_none() => {
                self.get_klines_paginated(symbol, interval, start, end).await
            }
            _ => {
                self.get_klines(symbol, interval, start_time, end_time, limit)
                    .await
            }
        }
    }
}
