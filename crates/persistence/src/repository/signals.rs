//! Signal repository — inserts, the dedup-window lookup, and the expiry sweep

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// One stored signal row. Price is TEXT to preserve Decimal precision;
/// metadata is serialized JSON.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SignalRecord {
    pub id: Option<i64>,
    pub symbol: String,
    pub algorithm: String,
    pub direction: String,
    pub strength: f64,
    pub confidence: f64,
    pub price: String,
    pub metadata: String,
    pub status: String,
    pub created_at: i64,
    pub expires_at: i64,
}

pub struct SignalRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> SignalRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a batch of signals, returning the number inserted
    pub async fn insert_batch(&self, records: &[SignalRecord]) -> DbResult<u64> {
        let mut inserted = 0u64;
        for record in records {
            let result = sqlx::query(
                r#"
                INSERT INTO signals (
                    symbol, algorithm, direction, strength, confidence,
                    price, metadata, status, created_at, expires_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&record.symbol)
            .bind(&record.algorithm)
            .bind(&record.direction)
            .bind(record.strength)
            .bind(record.confidence)
            .bind(&record.price)
            .bind(&record.metadata)
            .bind(&record.status)
            .bind(record.created_at)
            .bind(record.expires_at)
            .execute(self.pool)
            .await?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    /// True when an active signal for (symbol, algorithm, direction) was
    /// created at or after `since_ms`
    pub async fn exists_recent(
        &self,
        symbol: &str,
        algorithm: &str,
        direction: &str,
        since_ms: i64,
    ) -> DbResult<bool> {
        let row: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM signals
            WHERE symbol = ? AND algorithm = ? AND direction = ?
              AND status = 'active' AND created_at >= ?
            "#,
        )
        .bind(symbol)
        .bind(algorithm)
        .bind(direction)
        .bind(since_ms)
        .fetch_one(self.pool)
        .await?;
        Ok(row.0 > 0)
    }

    /// Transition active signals created before `older_than_ms` to expired
    pub async fn mark_expired(&self, older_than_ms: i64) -> DbResult<u64> {
        let result = sqlx::query(
            "UPDATE signals SET status = 'expired' WHERE status = 'active' AND created_at < ?",
        )
        .bind(older_than_ms)
        .execute(self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Most recent signals first, optionally filtered by status
    pub async fn list_recent(
        &self,
        limit: i64,
        offset: i64,
        status: Option<&str>,
    ) -> DbResult<Vec<SignalRecord>> {
        let records = match status {
            Some(status) => {
                sqlx::query_as::<_, SignalRecord>(
                    r#"
                    SELECT id, symbol, algorithm, direction, strength, confidence,
                           price, metadata, status, created_at, expires_at
                    FROM signals
                    WHERE status = ?
                    ORDER BY created_at DESC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool)
                .await?
            }
            None => {
                sqlx::query_as::<_, SignalRecord>(
                    r#"
                    SELECT id, symbol, algorithm, direction, strength, confidence,
                           price, metadata, status, created_at, expires_at
                    FROM signals
                    ORDER BY created_at DESC
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(self.pool)
                .await?
            }
        };
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn record(symbol: &str, created_at: i64) -> SignalRecord {
        SignalRecord {
            id: None,
            symbol: symbol.to_string(),
            algorithm: "flow".to_string(),
            direction: "buy".to_string(),
            strength: 0.8,
            confidence: 0.72,
            price: "95.5".to_string(),
            metadata: "{}".to_string(),
            status: "active".to_string(),
            created_at,
            expires_at: created_at + 86_400_000,
        }
    }

    #[tokio::test]
    async fn test_insert_and_recent_lookup() {
        let db = Database::in_memory().await.unwrap();
        let repo = SignalRepository::new(db.pool());

        let inserted = repo
            .insert_batch(&[record("BTCUSDT", 1_000), record("ETHUSDT", 2_000)])
            .await
            .unwrap();
        assert_eq!(inserted, 2);

        assert!(repo
            .exists_recent("BTCUSDT", "flow", "buy", 500)
            .await
            .unwrap());
        assert!(!repo
            .exists_recent("BTCUSDT", "flow", "buy", 1_500)
            .await
            .unwrap());
        assert!(!repo
            .exists_recent("BTCUSDT", "flow", "sell", 0)
            .await
            .unwrap());
        assert!(!repo
            .exists_recent("BTCUSDT", "volatility_extreme", "buy", 0)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_mark_expired_transitions_only_old_active() {
        let db = Database::in_memory().await.unwrap();
        let repo = SignalRepository::new(db.pool());

        repo.insert_batch(&[record("BTCUSDT", 1_000), record("ETHUSDT", 5_000)])
            .await
            .unwrap();

        let expired = repo.mark_expired(3_000).await.unwrap();
        assert_eq!(expired, 1);

        // Expired signals no longer satisfy the dedup lookup
        assert!(!repo
            .exists_recent("BTCUSDT", "flow", "buy", 0)
            .await
            .unwrap());
        assert!(repo
            .exists_recent("ETHUSDT", "flow", "buy", 0)
            .await
            .unwrap());

        // Second sweep is a no-op
        assert_eq!(repo.mark_expired(3_000).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_list_recent_orders_and_filters() {
        let db = Database::in_memory().await.unwrap();
        let repo = SignalRepository::new(db.pool());

        repo.insert_batch(&[
            record("BTCUSDT", 1_000),
            record("ETHUSDT", 3_000),
            record("SOLUSDT", 2_000),
        ])
        .await
        .unwrap();
        repo.mark_expired(1_500).await.unwrap();

        let all = repo.list_recent(10, 0, None).await.unwrap();
        let symbols: Vec<&str> = all.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["ETHUSDT", "SOLUSDT", "BTCUSDT"]);

        let active = repo.list_recent(10, 0, Some("active")).await.unwrap();
        assert_eq!(active.len(), 2);

        let expired = repo.list_recent(10, 0, Some("expired")).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].symbol, "BTCUSDT");
    }
}
