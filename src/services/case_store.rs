// Case store: ZipCase identity rows and their separately keyed summaries

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument, warn};

use crate::domain::{reason, CaseSummary, FetchStatus, ZipCase};
use crate::utils::date::{now_rfc3339, parse_rfc3339};

pub struct CaseStore {
    pool: SqlitePool,
}

impl CaseStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_case(row: &SqliteRow) -> ZipCase {
        let kind: String = row.get("status");
        let message: Option<String> = row.get("status_message");
        let try_count: i64 = row.get("try_count");

        ZipCase {
            case_number: row.get("case_number"),
            fetch_status: FetchStatus::from_columns(&kind, message, try_count as u32),
            last_updated: row
                .get::<Option<String>, _>("last_updated")
                .as_deref()
                .and_then(parse_rfc3339),
            case_id: row.get("case_id"),
        }
    }

    #[instrument(skip(self))]
    pub async fn get(&self, case_number: &str) -> Result<Option<ZipCase>> {
        let row = sqlx::query(
            "SELECT case_number, status, status_message, try_count, case_id, last_updated FROM cases WHERE case_number = ?",
        )
        .bind(case_number)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read case")?;

        Ok(row.as_ref().map(Self::row_to_case))
    }

    /// Seed a fresh `queued` row unless the case already exists. Returns the
    /// row and whether this call created it.
    #[instrument(skip(self))]
    pub async fn seed_if_absent(&self, case_number: &str) -> Result<(ZipCase, bool)> {
        let result = sqlx::query(
            r#"
            INSERT INTO cases (case_number, status, try_count, last_updated)
            VALUES (?, 'queued', 0, ?)
            ON CONFLICT(case_number) DO NOTHING
            "#,
        )
        .bind(case_number)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to seed case")?;
        let created = result.rows_affected() == 1;

        let case = self
            .get(case_number)
            .await?
            .context("Seeded case disappeared")?;
        Ok((case, created))
    }

    /// Unconditional status write; last writer wins.
    #[instrument(skip(self, status))]
    pub async fn set_status(&self, case_number: &str, status: &FetchStatus) -> Result<()> {
        sqlx::query(
            "UPDATE cases SET status = ?, status_message = ?, last_updated = ? WHERE case_number = ?",
        )
        .bind(status.kind())
        .bind(status.message())
        .bind(now_rfc3339())
        .bind(case_number)
        .execute(&self.pool)
        .await
        .context("Failed to set case status")?;
        Ok(())
    }

    /// Conditional transition used as a lease: succeeds only when the current
    /// status is one of `allowed_from`. Losers perform no portal work.
    #[instrument(skip(self, status))]
    pub async fn try_transition(
        &self,
        case_number: &str,
        allowed_from: &[&str],
        status: &FetchStatus,
    ) -> Result<bool> {
        let placeholders = vec!["?"; allowed_from.len()].join(", ");
        let sql = format!(
            "UPDATE cases SET status = ?, status_message = ?, last_updated = ? WHERE case_number = ? AND status IN ({})",
            placeholders
        );

        let mut query = sqlx::query(&sql)
            .bind(status.kind())
            .bind(status.message())
            .bind(now_rfc3339())
            .bind(case_number);
        for from in allowed_from {
            query = query.bind(*from);
        }

        let result = query
            .execute(&self.pool)
            .await
            .context("Failed to transition case status")?;

        let won = result.rows_affected() == 1;
        if !won {
            debug!("Lost status lease for {}", case_number);
        }
        Ok(won)
    }

    /// Record the resolved portal id. Conditional on the resolve lease so a
    /// racing writer cannot regress a terminal status.
    #[instrument(skip(self))]
    pub async fn set_found(&self, case_number: &str, case_id: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE cases SET case_id = ?, status = 'found', status_message = NULL, last_updated = ?
            WHERE case_number = ? AND status = 'processing'
            "#,
        )
        .bind(case_id)
        .bind(now_rfc3339())
        .bind(case_number)
        .execute(&self.pool)
        .await
        .context("Failed to record resolved case id")?;
        Ok(result.rows_affected() == 1)
    }

    /// Reclaim a row stuck in `processing` since before `stale_before`.
    #[instrument(skip(self))]
    pub async fn reclaim_stale_processing(
        &self,
        case_number: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE cases SET status = 'queued', status_message = NULL, last_updated = ?
            WHERE case_number = ? AND status = 'processing' AND last_updated < ?
            "#,
        )
        .bind(now_rfc3339())
        .bind(case_number)
        .bind(stale_before.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to reclaim stale case")?;

        let reclaimed = result.rows_affected() == 1;
        if reclaimed {
            warn!("Reclaimed stale processing case {}", case_number);
        }
        Ok(reclaimed)
    }

    /// Reprocess attempts consumed so far. Persisted outside the status value
    /// so the bound survives the pipeline's own transitions.
    pub async fn try_count(&self, case_number: &str) -> Result<u32> {
        let row = sqlx::query("SELECT try_count FROM cases WHERE case_number = ?")
            .bind(case_number)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read try count")?;
        Ok(row.map(|r| r.get::<i64, _>("try_count") as u32).unwrap_or(0))
    }

    /// First corruption detection: consume the single reprocess attempt.
    /// Returns the new try count, or None when another reader already did.
    #[instrument(skip(self))]
    pub async fn start_reprocessing(&self, case_number: &str) -> Result<Option<u32>> {
        let result = sqlx::query(
            r#"
            UPDATE cases SET status = 'reprocessing', status_message = NULL,
                             try_count = try_count + 1, last_updated = ?
            WHERE case_number = ? AND try_count = 0
            "#,
        )
        .bind(now_rfc3339())
        .bind(case_number)
        .execute(&self.pool)
        .await
        .context("Failed to start reprocessing")?;

        Ok((result.rows_affected() == 1).then_some(1))
    }

    /// Second corruption detection: the retry budget is spent. Conditional so
    /// the accompanying alert fires exactly once.
    #[instrument(skip(self))]
    pub async fn mark_persistent_corruption(&self, case_number: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE cases SET status = 'failed', status_message = ?, last_updated = ?
            WHERE case_number = ? AND try_count >= 1 AND NOT (status = 'failed' AND status_message = ?)
            "#,
        )
        .bind(reason::PERSISTENT_CORRUPTION)
        .bind(now_rfc3339())
        .bind(case_number)
        .bind(reason::PERSISTENT_CORRUPTION)
        .execute(&self.pool)
        .await
        .context("Failed to mark persistent corruption")?;
        Ok(result.rows_affected() == 1)
    }

    // Summary rows live under their own key so identity survives corruption.

    #[instrument(skip(self, summary))]
    pub async fn write_summary(&self, case_number: &str, summary: &CaseSummary) -> Result<()> {
        let body = serde_json::to_string(summary).context("Failed to serialize summary")?;
        sqlx::query(
            r#"
            INSERT INTO case_summaries (case_number, summary, written_at)
            VALUES (?, ?, ?)
            ON CONFLICT(case_number) DO UPDATE SET summary = excluded.summary, written_at = excluded.written_at
            "#,
        )
        .bind(case_number)
        .bind(&body)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to write summary")?;
        Ok(())
    }

    pub async fn read_summary_raw(&self, case_number: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT summary FROM case_summaries WHERE case_number = ?")
            .bind(case_number)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read summary")?;
        Ok(row.map(|r| r.get("summary")))
    }

    pub async fn delete_summary(&self, case_number: &str) -> Result<()> {
        sqlx::query("DELETE FROM case_summaries WHERE case_number = ?")
            .bind(case_number)
            .execute(&self.pool)
            .await
            .context("Failed to delete summary")?;
        Ok(())
    }
}
