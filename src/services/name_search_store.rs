// Name-search store: search records with a 24 hour TTL

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};

use crate::domain::{NameSearchData, NameSearchStatus};
use crate::utils::date::now_rfc3339;

const TTL_HOURS: i64 = 24;

pub struct NameSearchStore {
    pool: SqlitePool,
}

impl NameSearchStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_data(row: &SqliteRow) -> NameSearchData {
        let kind: String = row.get("status");
        let message: Option<String> = row.get("message");
        let cases: String = row.get("cases");

        NameSearchData {
            search_id: row.get("search_id"),
            original_name: row.get("original_name"),
            normalized_name: row.get("normalized_name"),
            date_of_birth: row.get("date_of_birth"),
            sounds_like: row.get::<i64, _>("sounds_like") != 0,
            criminal_only: row.get::<i64, _>("criminal_only") != 0,
            cases: serde_json::from_str(&cases).unwrap_or_default(),
            status: NameSearchStatus::from_columns(&kind, message),
        }
    }

    #[instrument(skip(self, data))]
    pub async fn create(&self, user_id: &str, data: &NameSearchData) -> Result<()> {
        let now = now_rfc3339();
        let expires_at = (Utc::now() + Duration::hours(TTL_HOURS)).to_rfc3339();
        let cases = serde_json::to_string(&data.cases).context("Failed to serialize cases")?;

        sqlx::query(
            r#"
            INSERT INTO name_searches
                (search_id, user_id, original_name, normalized_name, date_of_birth,
                 sounds_like, criminal_only, status, message, cases,
                 created_at, updated_at, expires_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&data.search_id)
        .bind(user_id)
        .bind(&data.original_name)
        .bind(&data.normalized_name)
        .bind(&data.date_of_birth)
        .bind(i64::from(data.sounds_like))
        .bind(i64::from(data.criminal_only))
        .bind(data.status.kind())
        .bind(data.status.message())
        .bind(&cases)
        .bind(&now)
        .bind(&now)
        .bind(&expires_at)
        .execute(&self.pool)
        .await
        .context("Failed to create name search")?;

        debug!("Created name search {}", data.search_id);
        Ok(())
    }

    /// Read a search record; expired rows read as absent.
    #[instrument(skip(self))]
    pub async fn get(&self, search_id: &str) -> Result<Option<NameSearchData>> {
        let row = sqlx::query(
            r#"
            SELECT search_id, original_name, normalized_name, date_of_birth,
                   sounds_like, criminal_only, status, message, cases
            FROM name_searches
            WHERE search_id = ? AND expires_at > ?
            "#,
        )
        .bind(search_id)
        .bind(now_rfc3339())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read name search")?;

        Ok(row.as_ref().map(Self::row_to_data))
    }

    #[instrument(skip(self, status))]
    pub async fn set_status(&self, search_id: &str, status: &NameSearchStatus) -> Result<()> {
        sqlx::query(
            "UPDATE name_searches SET status = ?, message = ?, updated_at = ? WHERE search_id = ?",
        )
        .bind(status.kind())
        .bind(status.message())
        .bind(now_rfc3339())
        .bind(search_id)
        .execute(&self.pool)
        .await
        .context("Failed to update name search status")?;
        Ok(())
    }

    /// Record the deduplicated case numbers parsed from the portal and mark
    /// the search complete.
    #[instrument(skip(self, cases))]
    pub async fn set_results(&self, search_id: &str, cases: &[String]) -> Result<()> {
        let body = serde_json::to_string(cases).context("Failed to serialize cases")?;
        sqlx::query(
            r#"
            UPDATE name_searches SET cases = ?, status = 'complete', message = NULL, updated_at = ?
            WHERE search_id = ?
            "#,
        )
        .bind(&body)
        .bind(now_rfc3339())
        .bind(search_id)
        .execute(&self.pool)
        .await
        .context("Failed to record name search results")?;
        Ok(())
    }

    /// Drop rows past their TTL.
    #[instrument(skip(self))]
    pub async fn purge_expired(&self) -> Result<usize> {
        let result = sqlx::query("DELETE FROM name_searches WHERE expires_at <= ?")
            .bind(now_rfc3339())
            .execute(&self.pool)
            .await
            .context("Failed to purge expired name searches")?;

        let purged = result.rows_affected() as usize;
        if purged > 0 {
            info!("Purged {} expired name searches", purged);
        }
        Ok(purged)
    }
}
