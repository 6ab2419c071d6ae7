//! Sigscan — market signal scanner and backtesting server
//!
//! Usage:
//!   sigscan serve --port 3001           — Launch the API server
//!   sigscan scan --symbols BTCUSDT      — Run one scan sweep from the CLI
//!   sigscan backtest --symbol BTCUSDT   — Run a backtest from the CLI

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use engine::{
    run_backtest, run_sweep, AlertBuffer, AlgorithmChoice, BacktestParams, BacktestResultStore,
    BinanceClient, Instrument, RandomIdGenerator, ResultFilter, ScanConfig, ScanEngine, Signal,
    SqliteBacktestResultStore, SqliteInstrumentRepository, SqliteSignalStore, SweepProgress,
    SweepRequest, SystemClock,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

const DEFAULT_SYMBOLS: &[&str] = &["BTCUSDT", "ETHUSDT", "SOLUSDT", "XRPUSDT"];

#[derive(Parser)]
#[command(name = "sigscan")]
#[command(about = "Market signal scanner and backtesting engine", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Launch the API server with the periodic scanner
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(short, long, default_value_t = 3001)]
        port: u16,
        /// Start the periodic scan loop immediately
        #[arg(long, default_value_t = true)]
        autostart: bool,
    },
    /// Run one scan sweep from the CLI (no web server)
    Scan {
        /// Symbols to scan (comma-separated); defaults to the seeded set
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,
    },
    /// Run a backtest from the CLI
    Backtest {
        /// Symbol to test
        #[arg(long, default_value = "BTCUSDT")]
        symbol: String,
        /// Candle interval
        #[arg(long, default_value = "1h")]
        interval: String,
        /// Days of history to fetch
        #[arg(long, default_value_t = 90)]
        days: u32,
        /// Algorithm: flow, volatility_extreme, or combined
        #[arg(long, default_value = "volatility_extreme")]
        algorithm: String,
    },
}

#[derive(Clone)]
struct AppState {
    scan_engine: Arc<ScanEngine>,
    signal_store: Arc<SqliteSignalStore>,
    result_store: Arc<SqliteBacktestResultStore>,
    alerts: Arc<AlertBuffer>,
    binance: Arc<BinanceClient>,
    sweep_progress: Arc<SweepProgress>,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,sigscan=debug")
    } else {
        EnvFilter::new("info,engine=info,sigscan=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

fn parse_algorithm(s: &str) -> AlgorithmChoice {
    match s.to_lowercase().as_str() {
        "flow" => AlgorithmChoice::Flow,
        "combined" => AlgorithmChoice::Combined,
        _ => AlgorithmChoice::VolatilityExtreme,
    }
}

fn configured_symbols() -> Vec<String> {
    std::env::var("SIGSCAN_SYMBOLS")
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_else(|_| DEFAULT_SYMBOLS.iter().map(|s| s.to_string()).collect())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Serve {
            host,
            port,
            autostart,
        } => {
            cmd_serve(&host, port, autostart).await?;
        }
        Commands::Scan { symbols } => {
            cmd_scan(symbols).await?;
        }
        Commands::Backtest {
            symbol,
            interval,
            days,
            algorithm,
        } => {
            cmd_backtest(symbol, interval, days, algorithm).await?;
        }
    }

    Ok(())
}

// ============================================================================
// Shared wiring
// ============================================================================

async fn build_state() -> anyhow::Result<AppState> {
    let db_path =
        std::env::var("SIGSCAN_DB_PATH").unwrap_or_else(|_| "data/sigscan.db".to_string());
    let db = persistence::Database::new(&db_path).await.map_err(|e| {
        error!("Failed to initialize database: {}", e);
        anyhow::anyhow!("Database initialization failed: {}", e)
    })?;
    info!("Database initialized: {}", db_path);

    let binance = Arc::new(BinanceClient::new());
    let instruments = Arc::new(SqliteInstrumentRepository::new(db.pool_clone()));
    let signal_store = Arc::new(SqliteSignalStore::new(db.pool_clone()));
    let result_store = Arc::new(SqliteBacktestResultStore::new(db.pool_clone()));
    let alerts = Arc::new(AlertBuffer::new());

    seed_instruments(&instruments, &binance, &configured_symbols()).await;

    let scan_engine = Arc::new(ScanEngine::new(
        ScanConfig::default(),
        instruments,
        binance.clone(),
        binance.clone(),
        signal_store.clone(),
        alerts.clone(),
        Arc::new(SystemClock),
        Arc::new(RandomIdGenerator),
    )?);

    Ok(AppState {
        scan_engine,
        signal_store,
        result_store,
        alerts,
        binance,
        sweep_progress: Arc::new(SweepProgress::new()),
    })
}

/// Upsert the configured symbols, ranking by live 24h volume when available
async fn seed_instruments(
    instruments: &SqliteInstrumentRepository,
    binance: &BinanceClient,
    symbols: &[String],
) {
    use engine::SnapshotSource;

    for symbol in symbols {
        let volume = match binance.snapshot(symbol).await {
            Ok(snap) => snap.volume_24h,
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "Could not fetch 24h volume, seeding at 0");
                Decimal::ZERO
            }
        };
        if let Err(e) = instruments
            .upsert(&Instrument::from_symbol(symbol), volume)
            .await
        {
            warn!(symbol = %symbol, error = %e, "Failed to seed instrument");
        }
    }
    info!(count = symbols.len(), "Instruments seeded");
}

// ============================================================================
// Serve command — Axum web server
// ============================================================================

async fn cmd_serve(host: &str, port: u16, autostart: bool) -> anyhow::Result<()> {
    info!("Sigscan v{} starting...", APP_VERSION);

    let state = build_state().await?;

    if autostart {
        state.scan_engine.start();
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let api_routes = Router::new()
        .route("/health", get(api_health))
        .route("/scan", post(api_scan_once))
        .route("/scan/start", post(api_scan_start))
        .route("/scan/stop", post(api_scan_stop))
        .route("/scan/status", get(api_scan_status))
        .route("/signals", get(api_signals))
        .route("/alerts", get(api_alerts))
        .route("/backtest", post(api_backtest))
        .route("/backtest/results", get(api_list_results))
        .route(
            "/backtest/results/:id",
            get(api_get_result).delete(api_delete_result),
        )
        .route("/sweep", post(api_start_sweep))
        .route("/sweep/status", get(api_sweep_status))
        .route("/sweep/cancel", post(api_cancel_sweep))
        .with_state(state);

    let app = Router::new().nest("/api", api_routes).layer(cors);

    let addr: std::net::SocketAddr = format!("{}:{}", host, port).parse()?;
    println!("\n=== Sigscan v{} ===", APP_VERSION);
    println!("Signal Scanner & Backtest Server");
    println!("Listening on http://{}", addr);
    println!("\nEndpoints:");
    println!("  GET    /api/health                - Health check");
    println!("  POST   /api/scan                  - Run one scan sweep now");
    println!("  POST   /api/scan/start            - Start the periodic scanner");
    println!("  POST   /api/scan/stop             - Stop the periodic scanner");
    println!("  GET    /api/scan/status           - Scanner status and counters");
    println!("  GET    /api/signals               - Stored signals (paginated)");
    println!("  GET    /api/alerts                - Recent signal alerts");
    println!("  POST   /api/backtest              - Run and store a backtest");
    println!("  GET    /api/backtest/results      - Stored results (paginated)");
    println!("  GET    /api/backtest/results/:id  - One stored result");
    println!("  DELETE /api/backtest/results/:id  - Delete a stored result");
    println!("  POST   /api/sweep                 - Start a parameter sweep");
    println!("  GET    /api/sweep/status          - Poll sweep progress");
    println!("  POST   /api/sweep/cancel          - Cancel the running sweep");
    println!("\nPress Ctrl+C to stop\n");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

// ============================================================================
// CLI commands
// ============================================================================

async fn cmd_scan(symbols: Vec<String>) -> anyhow::Result<()> {
    println!("\n=== Sigscan v{} ===", APP_VERSION);
    let state = build_state().await?;

    let instruments = if symbols.is_empty() {
        None
    } else {
        Some(symbols.iter().map(|s| Instrument::from_symbol(s)).collect())
    };

    let signals = state
        .scan_engine
        .scan_once(instruments)
        .await
        .map_err(|e| anyhow::anyhow!("Scan failed: {}", e))?;

    print_signals(&signals);
    Ok(())
}

async fn cmd_backtest(
    symbol: String,
    interval: String,
    days: u32,
    algorithm: String,
) -> anyhow::Result<()> {
    println!("\n=== Sigscan v{} ===", APP_VERSION);
    let state = build_state().await?;

    let now = chrono::Utc::now().timestamp_millis();
    let params = BacktestParams {
        symbol: symbol.clone(),
        interval,
        algorithm: parse_algorithm(&algorithm),
        start_time: Some(now - (days as i64) * 86_400_000),
        end_time: Some(now),
        ..Default::default()
    };

    println!(
        "Backtesting {} on {} ({} days, {} algorithm)...\n",
        symbol, params.interval, days, params.algorithm
    );

    let result = run_backtest(&params, None, state.binance.as_ref())
        .await
        .map_err(|e| anyhow::anyhow!("Backtest failed: {}", e))?;

    let id = state
        .result_store
        .save(&result)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to store result: {}", e))?;

    println!("Result #{id}:");
    println!("  Initial capital:  {}", result.initial_capital);
    println!("  Final capital:    {:.2}", result.final_capital);
    println!("  Total return:     {:.4}", result.total_return);
    println!("  Completed trades: {}", result.total_trades);
    println!("  Win rate:         {:.4}", result.win_rate);
    println!("  Profit factor:    {:.4}", result.profit_factor);
    println!("  Max drawdown:     {:.4}", result.max_drawdown);
    println!("  Sharpe ratio:     {}", result.sharpe_ratio);
    Ok(())
}

fn print_signals(signals: &[Signal]) {
    if signals.is_empty() {
        println!("\nNo new signals.");
        return;
    }
    println!("\n{} new signal(s):", signals.len());
    println!(
        "  {:<12} {:<20} {:<6} {:>9} {:>11} {:>14}",
        "Symbol", "Algorithm", "Dir", "Strength", "Confidence", "Price"
    );
    println!("  {}", "-".repeat(76));
    for s in signals {
        println!(
            "  {:<12} {:<20} {:<6} {:>9.2} {:>11.2} {:>14}",
            s.symbol,
            s.algorithm.to_string(),
            s.direction.as_str(),
            s.strength,
            s.confidence,
            s.price,
        );
    }
}

// ============================================================================
// API Handlers — Scanner
// ============================================================================

/// GET /api/health
async fn api_health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "sigscan",
        "version": APP_VERSION,
    }))
}

/// POST /api/scan — run one sweep immediately
async fn api_scan_once(State(state): State<AppState>) -> Json<serde_json::Value> {
    match state.scan_engine.scan_once(None).await {
        Ok(signals) => Json(serde_json::json!({
            "success": true,
            "count": signals.len(),
            "signals": signals,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": e.to_string(),
        })),
    }
}

/// POST /api/scan/start
async fn api_scan_start(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.scan_engine.start();
    Json(serde_json::json!({ "success": true, "running": true }))
}

/// POST /api/scan/stop
async fn api_scan_stop(State(state): State<AppState>) -> Json<serde_json::Value> {
    state.scan_engine.stop();
    Json(serde_json::json!({ "success": true, "running": false }))
}

/// GET /api/scan/status
async fn api_scan_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    use std::sync::atomic::Ordering;
    let stats = &state.scan_engine.stats;
    Json(serde_json::json!({
        "running": state.scan_engine.is_running(),
        "scans_completed": stats.scans_completed.load(Ordering::Relaxed),
        "signals_emitted": stats.signals_emitted.load(Ordering::Relaxed),
        "last_scan_ms": stats.last_scan_ms.load(Ordering::Relaxed),
    }))
}

#[derive(Deserialize)]
struct SignalsQuery {
    limit: Option<i64>,
    offset: Option<i64>,
    status: Option<String>,
}

/// GET /api/signals
async fn api_signals(
    State(state): State<AppState>,
    Query(query): Query<SignalsQuery>,
) -> Json<serde_json::Value> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let offset = query.offset.unwrap_or(0).max(0);

    match state
        .signal_store
        .list_recent(limit, offset, query.status.as_deref())
        .await
    {
        Ok(signals) => Json(serde_json::json!({
            "success": true,
            "signals": signals,
            "limit": limit,
            "offset": offset,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": e.to_string(),
        })),
    }
}

/// GET /api/alerts — recent in-memory alert ring
async fn api_alerts(State(state): State<AppState>) -> Json<serde_json::Value> {
    let alerts = state.alerts.recent();
    Json(serde_json::json!({
        "success": true,
        "count": alerts.len(),
        "alerts": alerts,
    }))
}

// ============================================================================
// API Handlers — Backtesting
// ============================================================================

/// POST /api/backtest — run one backtest and store the result
async fn api_backtest(
    State(state): State<AppState>,
    Json(params): Json<BacktestParams>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    info!(
        symbol = %params.symbol,
        algorithm = %params.algorithm,
        "Backtest requested"
    );

    match run_backtest(&params, None, state.binance.as_ref()).await {
        Ok(result) => {
            let id = match state.result_store.save(&result).await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(error = %e, "Failed to store backtest result");
                    None
                }
            };
            Ok(Json(serde_json::json!({
                "success": true,
                "id": id,
                "result": result,
            })))
        }
        Err(e) => Ok(Json(serde_json::json!({
            "success": false,
            "error": e.to_string(),
        }))),
    }
}

#[derive(Deserialize)]
struct ResultsQuery {
    symbol: Option<String>,
    algorithm: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

/// GET /api/backtest/results
async fn api_list_results(
    State(state): State<AppState>,
    Query(query): Query<ResultsQuery>,
) -> Json<serde_json::Value> {
    let filter = ResultFilter {
        symbol: query.symbol,
        algorithm: query.algorithm,
    };
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    let offset = query.offset.unwrap_or(0).max(0);

    match state.result_store.list(&filter, limit, offset).await {
        Ok((results, total)) => Json(serde_json::json!({
            "success": true,
            "results": results,
            "total": total,
            "limit": limit,
            "offset": offset,
        })),
        Err(e) => Json(serde_json::json!({
            "success": false,
            "error": e.to_string(),
        })),
    }
}

/// GET /api/backtest/results/:id
async fn api_get_result(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.result_store.get(id).await {
        Ok(Some(result)) => Ok(Json(serde_json::json!({
            "success": true,
            "result": result,
        }))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(error = %e, "Failed to load backtest result");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// DELETE /api/backtest/results/:id
async fn api_delete_result(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.result_store.delete(id).await {
        Ok(true) => Ok(Json(serde_json::json!({ "success": true }))),
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            error!(error = %e, "Failed to delete backtest result");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

// ============================================================================
// API Handlers — Parameter sweep
// ============================================================================

/// POST /api/sweep — start a parameter sweep in the background
async fn api_start_sweep(
    State(state): State<AppState>,
    Json(request): Json<SweepRequest>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if state.sweep_progress.is_running() {
        let pct = state.sweep_progress.progress_pct();
        return Ok(Json(serde_json::json!({
            "success": false,
            "message": format!("Sweep already running ({:.0}% complete)", pct),
        })));
    }

    info!(
        symbol = %request.base.symbol,
        algorithms = request.algorithms.len(),
        "Starting parameter sweep"
    );

    // Fetch the shared candle history up front; every combination replays it
    use engine::CandleSource;
    let candles = match state
        .binance
        .get_candles(
            &request.base.symbol,
            &request.base.interval,
            request.base.start_time,
            request.base.end_time,
            None,
        )
        .await
    {
        Ok(candles) => candles,
        Err(e) => {
            return Ok(Json(serde_json::json!({
                "success": false,
                "error": format!("Candle fetch failed: {}", e),
            })));
        }
    };

    state.sweep_progress.reset();
    let progress = state.sweep_progress.clone();
    tokio::spawn(async move {
        run_sweep(request, candles, progress).await;
    });

    Ok(Json(serde_json::json!({
        "success": true,
        "message": "Sweep started",
    })))
}

/// GET /api/sweep/status
async fn api_sweep_status(State(state): State<AppState>) -> Json<serde_json::Value> {
    use std::sync::atomic::Ordering;
    let progress = &state.sweep_progress;
    let results = progress.results.read().unwrap().clone();
    let error = progress.error_message.read().unwrap().clone();
    let status = progress.status.read().unwrap().clone();

    Json(serde_json::json!({
        "status": status,
        "total_combinations": progress.total_combinations.load(Ordering::Relaxed),
        "completed": progress.completed.load(Ordering::Relaxed),
        "progress_pct": progress.progress_pct(),
        "results": results,
        "error": error,
    }))
}

/// POST /api/sweep/cancel
async fn api_cancel_sweep(State(state): State<AppState>) -> Json<serde_json::Value> {
    state
        .sweep_progress
        .cancelled
        .store(true, std::sync::atomic::Ordering::Relaxed);
    Json(serde_json::json!({ "success": true, "message": "Cancel requested" }))
}
