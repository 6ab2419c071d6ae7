//! Periodic multi-symbol scan engine
//!
//! Fetches the tracked instruments, runs both analyzers per batch (once per
//! configured parameter set), deduplicates against the recent-signal window,
//! persists survivors, and fans them out to the notification sink. A
//! background sweep independently expires signals past their 24h horizon.
//!
//! The engine is an explicit instance owning its scheduler handles; there is
//! no module-level state. An overlapping scheduler tick is skipped, never
//! run re-entrantly.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::{SharedClock, SharedIdGenerator};
use crate::error::{EngineError, EngineResult};
use crate::sources::{
    CandleSource, InstrumentRepository, NotificationSink, SignalStore, SnapshotSource,
};
use crate::types::{AlgorithmParams, Instrument, Signal, SIGNAL_TTL_MS};

/// Scan engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub scan_interval_secs: u64,
    pub batch_size: usize,
    /// Delay between batches, bounding the external request rate
    pub batch_delay_ms: u64,
    /// Cap on volume-ranked instruments per sweep
    pub max_instruments: usize,
    pub dedup_window_hours: i64,
    pub expiry_sweep_secs: u64,
    /// Candle interval fed to the volatility analyzer
    pub interval: String,
    pub candle_limit: u32,
    /// User parameter bundles; empty runs the default bundle once
    pub param_sets: Vec<AlgorithmParams>,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            scan_interval_secs: 300,
            batch_size: 10,
            batch_delay_ms: 1000,
            max_instruments: 100,
            dedup_window_hours: 24,
            expiry_sweep_secs: 600,
            interval: "1h".to_string(),
            candle_limit: 100,
            param_sets: Vec::new(),
            retry_attempts: 3,
            retry_base_delay_ms: 250,
        }
    }
}

impl ScanConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.batch_size == 0 || self.max_instruments == 0 {
            return Err(EngineError::InvalidParams(
                "batch_size and max_instruments must be at least 1".into(),
            ));
        }
        if self.scan_interval_secs == 0 || self.expiry_sweep_secs == 0 {
            return Err(EngineError::InvalidParams(
                "scan and sweep intervals must be at least 1 second".into(),
            ));
        }
        if self.candle_limit == 0 {
            return Err(EngineError::InvalidParams(
                "candle_limit must be at least 1".into(),
            ));
        }
        for params in &self.param_sets {
            params.validate()?;
        }
        Ok(())
    }
}

/// Counters exposed while the engine runs
#[derive(Debug, Default)]
pub struct ScanStats {
    pub scans_completed: AtomicU32,
    pub signals_emitted: AtomicU32,
    pub last_scan_ms: AtomicI64,
}

/// Long-lived scan service. Construct once, `start`/`stop` as needed;
/// `scan_once` triggers a sweep outside the schedule.
pub struct ScanEngine {
    config: ScanConfig,
    instruments: Arc<dyn InstrumentRepository>,
    snapshots: Arc<dyn SnapshotSource>,
    candles: Arc<dyn CandleSource>,
    store: Arc<dyn SignalStore>,
    sink: Arc<dyn NotificationSink>,
    clock: SharedClock,
    ids: SharedIdGenerator,
    pub stats: ScanStats,
    running: AtomicBool,
    /// Tick guard: a scheduled scan that would overlap the previous one is skipped
    scanning: AtomicBool,
    cancelled: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ScanEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ScanConfig,
        instruments: Arc<dyn InstrumentRepository>,
        snapshots: Arc<dyn SnapshotSource>,
        candles: Arc<dyn CandleSource>,
        store: Arc<dyn SignalStore>,
        sink: Arc<dyn NotificationSink>,
        clock: SharedClock,
        ids: SharedIdGenerator,
    ) -> EngineResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            instruments,
            snapshots,
            candles,
            store,
            sink,
            clock,
            ids,
            stats: ScanStats::default(),
            running: AtomicBool::new(false),
            scanning: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Start the periodic scan loop and the expiry sweep. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            debug!("Scan engine already running");
            return;
        }
        self.cancelled.store(false, Ordering::SeqCst);
        info!(
            interval_secs = self.config.scan_interval_secs,
            batch_size = self.config.batch_size,
            "Scan engine starting"
        );

        let engine = Arc::clone(self);
        let scan_loop = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(engine.config.scan_interval_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if engine.cancelled.load(Ordering::Relaxed) {
                    break;
                }
                if engine.scanning.swap(true, Ordering::SeqCst) {
                    debug!("Previous scan still in flight, skipping tick");
                    continue;
                }
                if let Err(e) = engine.scan_once(None).await {
                    warn!(error = %e, "Scheduled scan failed");
                }
                engine.scanning.store(false, Ordering::SeqCst);
            }
        });

        let engine = Arc::clone(self);
        let expiry_loop = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(engine.config.expiry_sweep_secs));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if engine.cancelled.load(Ordering::Relaxed) {
                    break;
                }
                let cutoff = engine.clock.now_ms() - SIGNAL_TTL_MS;
                match engine.store.mark_expired(cutoff).await {
                    Ok(0) => {}
                    Ok(n) => info!(expired = n, "Expired stale signals"),
                    Err(e) => warn!(error = %e, "Expiry sweep failed"),
                }
            }
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.push(scan_loop);
        tasks.push(expiry_loop);
    }

    /// Stop the scheduler. Idempotent; a scan in flight finishes its batch
    /// checks and exits between batches.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        let mut tasks = self.tasks.lock().unwrap();
        for task in tasks.drain(..) {
            task.abort();
        }
        info!("Scan engine stopped");
    }

    /// Run one full sweep immediately, outside the schedule. Returns the
    /// signals that survived deduplication; they are persisted and published
    /// before returning (persistence failure is logged, not fatal).
    pub async fn scan_once(&self, instruments: Option<Vec<Instrument>>) -> EngineResult<Vec<Signal>> {
        let scan_id = self.ids.next_id();
        let started = self.clock.now_ms();

        let instruments = match instruments {
            Some(list) => list,
            None => {
                self.instruments
                    .list_active(self.config.max_instruments)
                    .await?
            }
        };

        info!(
            scan_id = %scan_id,
            instruments = instruments.len(),
            "Scan sweep starting"
        );

        let mut emitted: Vec<Signal> = Vec::new();
        let batches: Vec<&[Instrument]> = instruments.chunks(self.config.batch_size).collect();
        let batch_count = batches.len();

        for (batch_idx, batch) in batches.into_iter().enumerate() {
            if self.cancelled.load(Ordering::Relaxed) {
                info!(scan_id = %scan_id, "Scan cancelled between batches");
                break;
            }

            for instrument in batch {
                match self.analyze_instrument(instrument).await {
                    Ok(signals) => emitted.extend(signals),
                    Err(e) => {
                        warn!(
                            symbol = %instrument.symbol,
                            error = %e,
                            "Instrument analysis failed, skipping"
                        );
                    }
                }
            }

            if batch_idx + 1 < batch_count {
                tokio::time::sleep(Duration::from_millis(self.config.batch_delay_ms)).await;
            }
        }

        let survivors = self.dedup(emitted).await;

        if !survivors.is_empty() {
            if let Err(e) = self.store.insert(&survivors).await {
                warn!(error = %e, "Failed to persist signals, returning them anyway");
            }
            if let Err(e) = self.sink.publish(&survivors).await {
                warn!(error = %e, "Notification fan-out failed");
            }
        }

        self.stats.scans_completed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .signals_emitted
            .fetch_add(survivors.len() as u32, Ordering::Relaxed);
        self.stats.last_scan_ms.store(started, Ordering::Relaxed);

        info!(
            scan_id = %scan_id,
            signals = survivors.len(),
            elapsed_ms = self.clock.now_ms() - started,
            "Scan sweep complete"
        );
        Ok(survivors)
    }

    /// Run both analyzers for one instrument, once per parameter bundle
    async fn analyze_instrument(&self, instrument: &Instrument) -> EngineResult<Vec<Signal>> {
        let default_sets = [AlgorithmParams::default()];
        let param_sets: &[AlgorithmParams] = if self.config.param_sets.is_empty() {
            &default_sets
        } else {
            &self.config.param_sets
        };

        let now = self.clock.now_ms();
        let mut signals = Vec::new();

        let snapshot = self
            .with_retry(|| self.snapshots.snapshot(&instrument.symbol))
            .await?;

        let candles = self
            .with_retry(|| {
                self.candles.get_candles(
                    &instrument.symbol,
                    &self.config.interval,
                    None,
                    None,
                    Some(self.config.candle_limit),
                )
            })
            .await?;

        for params in param_sets {
            let avg_volume = self
                .with_retry(|| {
                    self.snapshots
                        .average_volume(&instrument.symbol, params.flow.lookback_hours)
                })
                .await?;

            if let Some(sig) =
                crate::analyzers::FlowAnalyzer.analyze(instrument, &snapshot, avg_volume, &params.flow, now)
            {
                signals.push(sig);
            }

            match crate::analyzers::VolatilityAnalyzer.analyze(
                instrument,
                &candles,
                &params.volatility,
                now,
            ) {
                Ok(Some(sig)) => signals.push(sig),
                Ok(None) => {}
                Err(e @ EngineError::InsufficientData { .. }) => {
                    debug!(symbol = %instrument.symbol, error = %e, "Not enough history yet");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(signals)
    }

    /// Drop signals matching an active signal for the same (instrument,
    /// algorithm, direction) within the dedup window, including duplicates
    /// emitted earlier in this same sweep
    async fn dedup(&self, emitted: Vec<Signal>) -> Vec<Signal> {
        let since = self.clock.now_ms() - self.config.dedup_window_hours * 3_600_000;
        let mut seen: std::collections::HashSet<(String, &'static str, &'static str)> =
            std::collections::HashSet::new();
        let mut survivors = Vec::new();

        for signal in emitted {
            let key = (
                signal.symbol.clone(),
                signal.algorithm.as_str(),
                signal.direction.as_str(),
            );
            if seen.contains(&key) {
                continue;
            }

            match self
                .store
                .has_recent(&signal.symbol, signal.algorithm, signal.direction, since)
                .await
            {
                Ok(true) => {
                    debug!(
                        symbol = %signal.symbol,
                        algorithm = %signal.algorithm,
                        "Duplicate of a recent signal, dropping"
                    );
                }
                Ok(false) => {
                    seen.insert(key);
                    survivors.push(signal);
                }
                Err(e) => {
                    // Prefer a duplicate over a lost signal
                    warn!(error = %e, "Dedup lookup failed, keeping signal");
                    seen.insert(key);
                    survivors.push(signal);
                }
            }
        }
        survivors
    }

    /// Bounded exponential-backoff retry for upstream fetches
    async fn with_retry<T, F, Fut>(&self, mut op: F) -> EngineResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = EngineResult<T>>,
    {
        let mut attempt = 0u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt + 1 < self.config.retry_attempts => {
                    let delay = self.config.retry_base_delay_ms * (1 << attempt);
                    debug!(error = %e, attempt, delay_ms = delay, "Fetch failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(EngineError::UpstreamFetch(e.to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, FixedClock, SequentialIdGenerator};
    use crate::types::{
        AlgorithmKind, Candle, MarketSnapshot, SignalDirection, SignalStatus,
    };
    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    struct StaticInstruments(Vec<Instrument>);

    #[async_trait]
    impl InstrumentRepository for StaticInstruments {
        async fn list_active(&self, limit: usize) -> EngineResult<Vec<Instrument>> {
            Ok(self.0.iter().take(limit).cloned().collect())
        }
    }

    /// Snapshot + candle source with a configurable failing symbol
    struct MockMarket {
        fail_symbol: Option<String>,
    }

    fn surge_snapshot(symbol: &str) -> MarketSnapshot {
        MarketSnapshot {
            symbol: symbol.to_string(),
            price: dec!(95),
            volume_24h: dec!(3000000),
            high_24h: dec!(110),
            low_24h: dec!(95),
            open_24h: dec!(100),
            change_pct_24h: -0.05,
        }
    }

    #[async_trait]
    impl SnapshotSource for MockMarket {
        async fn snapshot(&self, symbol: &str) -> EngineResult<MarketSnapshot> {
            if self.fail_symbol.as_deref() == Some(symbol) {
                return Err(EngineError::UpstreamFetch("boom".into()));
            }
            Ok(surge_snapshot(symbol))
        }

        async fn average_volume(&self, _symbol: &str, _hours: u32) -> EngineResult<Decimal> {
            Ok(dec!(1000000))
        }
    }

    #[async_trait]
    impl CandleSource for MockMarket {
        async fn get_candles(
            &self,
            _symbol: &str,
            _interval: &str,
            _start: Option<i64>,
            _end: Option<i64>,
            limit: Option<u32>,
        ) -> EngineResult<Vec<Candle>> {
            // Flat series: the volatility analyzer stays silent
            let count = limit.unwrap_or(100) as usize;
            Ok((0..count)
                .map(|i| Candle {
                    open_time: (i as i64) * 3_600_000,
                    open: dec!(100),
                    high: dec!(100),
                    low: dec!(100),
                    close: dec!(100),
                    volume: dec!(100),
                    close_time: ((i + 1) as i64) * 3_600_000 - 1,
                })
                .collect())
        }
    }

    #[derive(Default)]
    struct MemorySignalStore {
        signals: Mutex<Vec<Signal>>,
    }

    #[async_trait]
    impl SignalStore for MemorySignalStore {
        async fn insert(&self, signals: &[Signal]) -> EngineResult<()> {
            self.signals
                .lock()
                .unwrap()
                .extend_from_slice(signals);
            Ok(())
        }

        async fn has_recent(
            &self,
            symbol: &str,
            algorithm: AlgorithmKind,
            direction: SignalDirection,
            since_ms: i64,
        ) -> EngineResult<bool> {
            Ok(self
                .signals
                .lock()
                .unwrap()
                .iter()
                .any(|s| {
                    s.symbol == symbol
                        && s.algorithm == algorithm
                        && s.direction == direction
                        && s.status == SignalStatus::Active
                        && s.created_at >= since_ms
                }))
        }

        async fn mark_expired(&self, older_than_ms: i64) -> EngineResult<u64> {
            let mut signals = self.signals.lock().unwrap();
            let mut n = 0;
            for s in signals.iter_mut() {
                if s.status == SignalStatus::Active && s.created_at < older_than_ms {
                    s.status = SignalStatus::Expired;
                    n += 1;
                }
            }
            Ok(n)
        }
    }

    #[derive(Default)]
    struct MemorySink {
        published: Mutex<Vec<Signal>>,
    }

    #[async_trait]
    impl NotificationSink for MemorySink {
        async fn publish(&self, signals: &[Signal]) -> EngineResult<()> {
            self.published
                .lock()
                .unwrap()
                .extend_from_slice(signals);
            Ok(())
        }
    }

    struct Harness {
        engine: Arc<ScanEngine>,
        store: Arc<MemorySignalStore>,
        sink: Arc<MemorySink>,
        clock: Arc<FixedClock>,
    }

    fn harness(symbols: &[&str], fail_symbol: Option<&str>) -> Harness {
        let instruments = Arc::new(StaticInstruments(
            symbols.iter().map(|s| Instrument::from_symbol(s)).collect(),
        ));
        let market = Arc::new(MockMarket {
            fail_symbol: fail_symbol.map(String::from),
        });
        let store = Arc::new(MemorySignalStore::default());
        let sink = Arc::new(MemorySink::default());
        let clock = Arc::new(FixedClock::new(1_700_000_000_000));

        let config = ScanConfig {
            batch_size: 2,
            batch_delay_ms: 0,
            retry_base_delay_ms: 1,
            ..Default::default()
        };

        let engine = Arc::new(
            ScanEngine::new(
                config,
                instruments,
                market.clone(),
                market,
                store.clone(),
                sink.clone(),
                clock.clone(),
                Arc::new(SequentialIdGenerator::default()),
            )
            .unwrap(),
        );

        Harness {
            engine,
            store,
            sink,
            clock,
        }
    }

    #[tokio::test]
    async fn test_scan_emits_persists_and_publishes() {
        let h = harness(&["BTCUSDT", "ETHUSDT", "SOLUSDT"], None);
        let signals = h.engine.scan_once(None).await.unwrap();

        // Flow fires on the surge snapshot; the flat candles stay silent
        assert_eq!(signals.len(), 3);
        assert!(signals.iter().all(|s| s.algorithm == AlgorithmKind::Flow));
        assert!(signals.iter().all(|s| s.direction == SignalDirection::Buy));

        assert_eq!(h.store.signals.lock().unwrap().len(), 3);
        assert_eq!(h.sink.published.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_second_scan_within_window_is_deduplicated() {
        let h = harness(&["BTCUSDT", "ETHUSDT"], None);
        let first = h.engine.scan_once(None).await.unwrap();
        assert_eq!(first.len(), 2);

        // One hour later, same market data: everything deduplicates
        h.clock.advance(3_600_000);
        let second = h.engine.scan_once(None).await.unwrap();
        assert!(second.is_empty());
        assert_eq!(h.store.signals.lock().unwrap().len(), 2);

        // Past the 24h window the signal may fire again
        h.clock.advance(24 * 3_600_000);
        let third = h.engine.scan_once(None).await.unwrap();
        assert_eq!(third.len(), 2);
    }

    #[tokio::test]
    async fn test_failing_instrument_is_skipped_not_fatal() {
        let h = harness(&["BTCUSDT", "ETHUSDT", "SOLUSDT"], Some("ETHUSDT"));
        let signals = h.engine.scan_once(None).await.unwrap();

        assert_eq!(signals.len(), 2);
        assert!(signals.iter().all(|s| s.symbol != "ETHUSDT"));
    }

    #[tokio::test]
    async fn test_expiry_sweep_marks_old_signals() {
        let h = harness(&["BTCUSDT"], None);
        h.engine.scan_once(None).await.unwrap();

        let cutoff = h.clock.now_ms() + 1;
        let expired = h.store.mark_expired(cutoff).await.unwrap();
        assert_eq!(expired, 1);
        assert!(h
            .store
            .signals
            .lock()
            .unwrap()
            .iter()
            .all(|s| s.status == SignalStatus::Expired));
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let h = harness(&["BTCUSDT"], None);
        assert!(!h.engine.is_running());

        h.engine.start();
        h.engine.start();
        assert!(h.engine.is_running());

        h.engine.stop();
        h.engine.stop();
        assert!(!h.engine.is_running());
    }

    #[tokio::test]
    async fn test_signal_expiry_stamp() {
        let h = harness(&["BTCUSDT"], None);
        let signals = h.engine.scan_once(None).await.unwrap();
        let sig = &signals[0];
        assert_eq!(sig.created_at, h.clock.now_ms());
        assert_eq!(sig.expires_at, sig.created_at + SIGNAL_TTL_MS);
    }
}
