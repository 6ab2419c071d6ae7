//! Instrument reference data repository

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// One tracked instrument row
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct InstrumentRecord {
    pub symbol: String,
    pub base_asset: String,
    pub quote_asset: String,
    pub active: i64,
    /// Stored as TEXT to preserve Decimal precision
    pub volume_24h: String,
    pub updated_at: Option<i64>,
}

pub struct InstrumentRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> InstrumentRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or refresh an instrument (volume and active flag updated)
    pub async fn upsert(&self, record: &InstrumentRecord) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO instruments (symbol, base_asset, quote_asset, active, volume_24h, updated_at)
            VALUES (?, ?, ?, ?, ?, strftime('%s', 'now'))
            ON CONFLICT(symbol) DO UPDATE SET
                active = excluded.active,
                volume_24h = excluded.volume_24h,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.symbol)
        .bind(&record.base_asset)
        .bind(&record.quote_asset)
        .bind(record.active)
        .bind(&record.volume_24h)
        .execute(self.pool)
        .await?;
        Ok(())
    }

    /// Active instruments ranked by 24h volume descending
    pub async fn list_active(&self, limit: i64) -> DbResult<Vec<InstrumentRecord>> {
        let records = sqlx::query_as::<_, InstrumentRecord>(
            r#"
            SELECT symbol, base_asset, quote_asset, active, volume_24h, updated_at
            FROM instruments
            WHERE active = 1
            ORDER BY CAST(volume_24h AS REAL) DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(self.pool)
        .await?;
        Ok(records)
    }

    pub async fn set_active(&self, symbol: &str, active: bool) -> DbResult<bool> {
        let result = sqlx::query("UPDATE instruments SET active = ? WHERE symbol = ?")
            .bind(active as i64)
            .bind(symbol)
            .execute(self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn record(symbol: &str, volume: &str) -> InstrumentRecord {
        InstrumentRecord {
            symbol: symbol.to_string(),
            base_asset: symbol.trim_end_matches("USDT").to_string(),
            quote_asset: "USDT".to_string(),
            active: 1,
            volume_24h: volume.to_string(),
            updated_at: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_volume_ranking() {
        let db = Database::in_memory().await.unwrap();
        let repo = InstrumentRepository::new(db.pool());

        repo.upsert(&record("BTCUSDT", "900")).await.unwrap();
        repo.upsert(&record("ETHUSDT", "1500")).await.unwrap();
        repo.upsert(&record("SOLUSDT", "300")).await.unwrap();

        let listed = repo.list_active(10).await.unwrap();
        let symbols: Vec<&str> = listed.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["ETHUSDT", "BTCUSDT", "SOLUSDT"]);

        // Upsert refreshes volume in place
        repo.upsert(&record("SOLUSDT", "2000")).await.unwrap();
        let listed = repo.list_active(10).await.unwrap();
        assert_eq!(listed[0].symbol, "SOLUSDT");
        assert_eq!(listed.len(), 3);
    }

    #[tokio::test]
    async fn test_inactive_instruments_are_hidden() {
        let db = Database::in_memory().await.unwrap();
        let repo = InstrumentRepository::new(db.pool());

        repo.upsert(&record("BTCUSDT", "900")).await.unwrap();
        repo.upsert(&record("ETHUSDT", "800")).await.unwrap();

        assert!(repo.set_active("ETHUSDT", false).await.unwrap());
        let listed = repo.list_active(10).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].symbol, "BTCUSDT");

        assert!(!repo.set_active("UNKNOWN", false).await.unwrap());
    }
}
