//! Database schema definitions

/// SQL to create all tables
/// NOTE: All prices/amounts stored as TEXT to preserve rust_decimal::Decimal precision
pub const CREATE_TABLES: &str = r#"
-- Tracked instruments, ranked by 24h volume when listed
CREATE TABLE IF NOT EXISTS instruments (
    symbol TEXT PRIMARY KEY,
    base_asset TEXT NOT NULL,
    quote_asset TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    volume_24h TEXT NOT NULL DEFAULT '0',
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Emitted trading signals
CREATE TABLE IF NOT EXISTS signals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    algorithm TEXT NOT NULL,
    direction TEXT NOT NULL,
    strength REAL NOT NULL,
    confidence REAL NOT NULL,
    price TEXT NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL DEFAULT 'active',
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

-- Completed backtest runs
CREATE TABLE IF NOT EXISTS backtest_results (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    params_hash TEXT NOT NULL UNIQUE,
    symbol TEXT NOT NULL,
    interval TEXT NOT NULL,
    algorithm TEXT NOT NULL,
    params TEXT NOT NULL,
    start_time INTEGER NOT NULL,
    end_time INTEGER NOT NULL,
    initial_capital TEXT NOT NULL DEFAULT '0',
    final_capital TEXT NOT NULL DEFAULT '0',
    total_return TEXT NOT NULL DEFAULT '0',
    total_trades INTEGER NOT NULL DEFAULT 0,
    winning_trades INTEGER NOT NULL DEFAULT 0,
    losing_trades INTEGER NOT NULL DEFAULT 0,
    win_rate TEXT NOT NULL DEFAULT '0',
    avg_win TEXT NOT NULL DEFAULT '0',
    avg_loss TEXT NOT NULL DEFAULT '0',
    profit_factor TEXT NOT NULL DEFAULT '0',
    largest_win TEXT NOT NULL DEFAULT '0',
    largest_loss TEXT NOT NULL DEFAULT '0',
    max_drawdown TEXT NOT NULL DEFAULT '0',
    sharpe_ratio TEXT NOT NULL DEFAULT '0',
    trades TEXT NOT NULL DEFAULT '[]',
    equity_curve TEXT NOT NULL DEFAULT '[]',
    monthly_returns TEXT NOT NULL DEFAULT '[]',
    created_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

-- Signal lookup indexes (dedup window and expiry sweep)
CREATE INDEX IF NOT EXISTS idx_signals_dedup ON signals(symbol, algorithm, direction, created_at);
CREATE INDEX IF NOT EXISTS idx_signals_status ON signals(status, created_at);

-- Backtest result indexes
CREATE INDEX IF NOT EXISTS idx_backtests_hash ON backtest_results(params_hash);
CREATE INDEX IF NOT EXISTS idx_backtests_symbol ON backtest_results(symbol, algorithm);
CREATE INDEX IF NOT EXISTS idx_backtests_created ON backtest_results(created_at DESC)
"#;

/// ALTER TABLE migrations applied after table creation
pub const MIGRATIONS: &[&str] = &[];
