//! Backtest results repository
//!
//! Saves are idempotent per params_hash: re-running an identical
//! configuration over the same window returns the existing row id.

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// One stored backtest run. Decimal columns are TEXT; trades, equity_curve,
/// and monthly_returns are serialized JSON arrays.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BacktestResultRecord {
    pub id: Option<i64>,
    pub params_hash: String,
    pub symbol: String,
    pub interval: String,
    pub algorithm: String,
    pub params: String,
    pub start_time: i64,
    pub end_time: i64,
    pub initial_capital: String,
    pub final_capital: String,
    pub total_return: String,
    pub total_trades: i64,
    pub winning_trades: i64,
    pub losing_trades: i64,
    pub win_rate: String,
    pub avg_win: String,
    pub avg_loss: String,
    pub profit_factor: String,
    pub largest_win: String,
    pub largest_loss: String,
    pub max_drawdown: String,
    pub sharpe_ratio: String,
    pub trades: String,
    pub equity_curve: String,
    pub monthly_returns: String,
    pub created_at: Option<i64>,
}

const ALL_COLUMNS: &str = r#"
    id, params_hash, symbol, interval, algorithm, params,
    start_time, end_time, initial_capital, final_capital, total_return,
    total_trades, winning_trades, losing_trades, win_rate,
    avg_win, avg_loss, profit_factor, largest_win, largest_loss,
    max_drawdown, sharpe_ratio, trades, equity_curve, monthly_returns,
    created_at
"#;

pub struct BacktestRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BacktestRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Save a result (INSERT OR IGNORE on params_hash); returns the row id,
    /// existing or new
    pub async fn save(&self, record: &BacktestResultRecord) -> DbResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO backtest_results (
                params_hash, symbol, interval, algorithm, params,
                start_time, end_time, initial_capital, final_capital, total_return,
                total_trades, winning_trades, losing_trades, win_rate,
                avg_win, avg_loss, profit_factor, largest_win, largest_loss,
                max_drawdown, sharpe_ratio, trades, equity_curve, monthly_returns
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.params_hash)
        .bind(&record.symbol)
        .bind(&record.interval)
        .bind(&record.algorithm)
        .bind(&record.params)
        .bind(record.start_time)
        .bind(record.end_time)
        .bind(&record.initial_capital)
        .bind(&record.final_capital)
        .bind(&record.total_return)
        .bind(record.total_trades)
        .bind(record.winning_trades)
        .bind(record.losing_trades)
        .bind(&record.win_rate)
        .bind(&record.avg_win)
        .bind(&record.avg_loss)
        .bind(&record.profit_factor)
        .bind(&record.largest_win)
        .bind(&record.largest_loss)
        .bind(&record.max_drawdown)
        .bind(&record.sharpe_ratio)
        .bind(&record.trades)
        .bind(&record.equity_curve)
        .bind(&record.monthly_returns)
        .execute(self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(result.last_insert_rowid());
        }

        // Duplicate hash: hand back the existing row
        let row: (i64,) =
            sqlx::query_as("SELECT id FROM backtest_results WHERE params_hash = ?")
                .bind(&record.params_hash)
                .fetch_one(self.pool)
                .await?;
        Ok(row.0)
    }

    pub async fn get(&self, id: i64) -> DbResult<Option<BacktestResultRecord>> {
        let sql = format!("SELECT {ALL_COLUMNS} FROM backtest_results WHERE id = ?");
        let record = sqlx::query_as::<_, BacktestResultRecord>(&sql)
            .bind(id)
            .fetch_optional(self.pool)
            .await?;
        Ok(record)
    }

    /// Paginated listing, newest first, with optional symbol and algorithm
    /// filters; returns (rows, total matching)
    pub async fn list(
        &self,
        limit: i64,
        offset: i64,
        symbol: Option<&str>,
        algorithm: Option<&str>,
    ) -> DbResult<(Vec<BacktestResultRecord>, i64)> {
        let mut where_clauses = vec!["1=1".to_string()];
        let mut binds: Vec<String> = Vec::new();

        if let Some(sym) = symbol {
            where_clauses.push("symbol = ?".to_string());
            binds.push(sym.to_string());
        }
        if let Some(alg) = algorithm {
            where_clauses.push("algorithm = ?".to_string());
            binds.push(alg.to_string());
        }

        let where_sql = where_clauses.join(" AND ");

        let count_sql = format!("SELECT COUNT(*) FROM backtest_results WHERE {where_sql}");
        let mut count_query = sqlx::query_as::<_, (i64,)>(&count_sql);
        for b in &binds {
            count_query = count_query.bind(b);
        }
        let (total,) = count_query.fetch_one(self.pool).await?;

        let data_sql = format!(
            r#"
            SELECT {ALL_COLUMNS}
            FROM backtest_results
            WHERE {where_sql}
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#
        );
        let mut data_query = sqlx::query_as::<_, BacktestResultRecord>(&data_sql);
        for b in &binds {
            data_query = data_query.bind(b);
        }
        data_query = data_query.bind(limit).bind(offset);

        let records = data_query.fetch_all(self.pool).await?;
        Ok((records, total))
    }

    pub async fn delete(&self, id: i64) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM backtest_results WHERE id = ?")
            .bind(id)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn record(hash: &str, symbol: &str, algorithm: &str) -> BacktestResultRecord {
        BacktestResultRecord {
            id: None,
            params_hash: hash.to_string(),
            symbol: symbol.to_string(),
            interval: "1h".to_string(),
            algorithm: algorithm.to_string(),
            params: "{}".to_string(),
            start_time: 0,
            end_time: 1_000,
            initial_capital: "10000".to_string(),
            final_capital: "10500".to_string(),
            total_return: "0.05".to_string(),
            total_trades: 4,
            winning_trades: 3,
            losing_trades: 1,
            win_rate: "0.75".to_string(),
            avg_win: "200".to_string(),
            avg_loss: "-100".to_string(),
            profit_factor: "2".to_string(),
            largest_win: "300".to_string(),
            largest_loss: "-100".to_string(),
            max_drawdown: "0.02".to_string(),
            sharpe_ratio: "1.2".to_string(),
            trades: "[]".to_string(),
            equity_curve: "[]".to_string(),
            monthly_returns: "[]".to_string(),
            created_at: None,
        }
    }

    #[tokio::test]
    async fn test_save_get_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());

        let id = repo.save(&record("h1", "BTCUSDT", "flow")).await.unwrap();
        let loaded = repo.get(id).await.unwrap().expect("row should exist");
        assert_eq!(loaded.symbol, "BTCUSDT");
        assert_eq!(loaded.total_trades, 4);
        assert_eq!(loaded.win_rate, "0.75");
        assert_eq!(loaded.sharpe_ratio, "1.2");

        assert!(repo.get(id + 99).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_hash_returns_existing_id() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());

        let first = repo.save(&record("same", "BTCUSDT", "flow")).await.unwrap();
        let second = repo.save(&record("same", "BTCUSDT", "flow")).await.unwrap();
        assert_eq!(first, second);

        let (_, total) = repo.list(10, 0, None, None).await.unwrap();
        assert_eq!(total, 1);
    }

    #[tokio::test]
    async fn test_list_filters_and_pagination() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());

        repo.save(&record("h1", "BTCUSDT", "flow")).await.unwrap();
        repo.save(&record("h2", "BTCUSDT", "volatility_extreme"))
            .await
            .unwrap();
        repo.save(&record("h3", "ETHUSDT", "flow")).await.unwrap();

        let (rows, total) = repo.list(10, 0, Some("BTCUSDT"), None).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(rows.len(), 2);

        let (rows, total) = repo.list(10, 0, None, Some("flow")).await.unwrap();
        assert_eq!(total, 2);
        assert!(rows.iter().all(|r| r.algorithm == "flow"));

        let (rows, total) = repo.list(2, 2, None, None).await.unwrap();
        assert_eq!(total, 3);
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let db = Database::in_memory().await.unwrap();
        let repo = BacktestRepository::new(db.pool());

        let id = repo.save(&record("h1", "BTCUSDT", "flow")).await.unwrap();
        assert!(repo.delete(id).await.unwrap());
        assert!(!repo.delete(id).await.unwrap());
        assert!(repo.get(id).await.unwrap().is_none());
    }
}
