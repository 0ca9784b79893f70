// Durable work queues backed by the store
// At-least-once delivery with visibility timeouts and bounded attempts

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::utils::date::now_rfc3339;

/// Work item payloads. Resolve and name-search jobs travel on the search
/// queue; summary fetches travel on the case-data queue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobPayload {
    Resolve {
        case_number: String,
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_agent: Option<String>,
    },
    NameSearch {
        search_id: String,
        user_id: String,
        normalized_name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        date_of_birth: Option<String>,
        sounds_like: bool,
        criminal_only: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_agent: Option<String>,
    },
    FetchSummary {
        case_number: String,
        case_id: String,
        user_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_agent: Option<String>,
    },
}

/// A message claimed from a queue. `exhausted` marks a delivery past the
/// attempt bound: the consumer records a terminal failure and acks.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: String,
    pub payload: JobPayload,
    pub attempts: u32,
    pub exhausted: bool,
}

pub struct JobQueue {
    pool: SqlitePool,
    visibility_timeout_seconds: i64,
    max_attempts: u32,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, visibility_timeout_seconds: i64, max_attempts: u32) -> Self {
        Self {
            pool,
            visibility_timeout_seconds,
            max_attempts,
        }
    }

    #[instrument(skip(self, payload))]
    pub async fn enqueue(&self, queue: &str, payload: &JobPayload) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let body = serde_json::to_string(payload).context("Failed to serialize job payload")?;
        let now = now_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO queue_jobs (id, queue, payload, attempts, visible_at, created_at)
            VALUES (?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(queue)
        .bind(&body)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .context("Failed to enqueue job")?;

        debug!("Enqueued job {} on {}", id, queue);
        Ok(id)
    }

    /// Claim up to `batch` visible messages. Claiming conditions on the
    /// message still being visible, so concurrent consumers never share a
    /// message within one visibility window.
    #[instrument(skip(self))]
    pub async fn receive(&self, queue: &str, batch: i64) -> Result<Vec<ClaimedJob>> {
        let now = now_rfc3339();
        let rows = sqlx::query(
            r#"
            SELECT id, payload, attempts, visible_at FROM queue_jobs
            WHERE queue = ? AND visible_at <= ?
            ORDER BY created_at ASC
            LIMIT ?
            "#,
        )
        .bind(queue)
        .bind(&now)
        .bind(batch)
        .fetch_all(&self.pool)
        .await
        .context("Failed to poll queue")?;

        let mut claimed = Vec::new();
        for row in rows {
            let id: String = row.get("id");
            let prior_visible_at: String = row.get("visible_at");
            let next_visible =
                (Utc::now() + Duration::seconds(self.visibility_timeout_seconds)).to_rfc3339();

            let updated = sqlx::query(
                r#"
                UPDATE queue_jobs SET attempts = attempts + 1, visible_at = ?
                WHERE id = ? AND visible_at = ?
                "#,
            )
            .bind(&next_visible)
            .bind(&id)
            .bind(&prior_visible_at)
            .execute(&self.pool)
            .await
            .context("Failed to claim job")?;

            if updated.rows_affected() == 0 {
                // Another consumer won the claim.
                continue;
            }

            let attempts = row.get::<i64, _>("attempts") as u32 + 1;
            let raw: String = row.get("payload");
            let payload: JobPayload = match serde_json::from_str(&raw) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Dropping undecodable job {}: {}", id, e);
                    self.ack(&id).await?;
                    continue;
                }
            };

            claimed.push(ClaimedJob {
                id,
                payload,
                attempts,
                exhausted: attempts > self.max_attempts,
            });
        }

        Ok(claimed)
    }

    /// Delete a processed message. Unacked messages reappear after the
    /// visibility timeout (partial-batch failure).
    pub async fn ack(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM queue_jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to ack job")?;
        Ok(())
    }

    /// Make a claimed message immediately visible again.
    pub async fn release(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE queue_jobs SET visible_at = ? WHERE id = ?")
            .bind(now_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to release job")?;
        Ok(())
    }

    pub async fn depth(&self, queue: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS depth FROM queue_jobs WHERE queue = ?")
            .bind(queue)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count queue depth")?;
        Ok(row.get("depth"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::database::Database;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    async fn test_queue(visibility_seconds: i64, max_attempts: u32) -> (TempDir, JobQueue) {
        let temp_dir = TempDir::new().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            temp_dir.path().join("queue.db").display()
        );
        let db = Database::connect(&url, StdDuration::from_secs(10))
            .await
            .unwrap();
        let queue = JobQueue::new(db.pool().clone(), visibility_seconds, max_attempts);
        (temp_dir, queue)
    }

    fn resolve_job(case_number: &str) -> JobPayload {
        JobPayload::Resolve {
            case_number: case_number.to_string(),
            user_id: "user-1".to_string(),
            user_agent: None,
        }
    }

    #[tokio::test]
    async fn enqueue_receive_ack() {
        let (_guard, queue) = test_queue(60, 5).await;

        queue.enqueue("search", &resolve_job("25CR123456-789")).await.unwrap();
        assert_eq!(queue.depth("search").await.unwrap(), 1);

        let jobs = queue.receive("search", 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].attempts, 1);
        assert!(!jobs[0].exhausted);
        assert_eq!(jobs[0].payload, resolve_job("25CR123456-789"));

        // Claimed messages are invisible until the timeout elapses.
        assert!(queue.receive("search", 10).await.unwrap().is_empty());

        queue.ack(&jobs[0].id).await.unwrap();
        assert_eq!(queue.depth("search").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let (_guard, queue) = test_queue(60, 5).await;

        queue.enqueue("search", &resolve_job("25CR111111-100")).await.unwrap();
        assert!(queue.receive("case-data", 10).await.unwrap().is_empty());
        assert_eq!(queue.receive("search", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unacked_messages_are_redelivered() {
        let (_guard, queue) = test_queue(0, 5).await;

        queue.enqueue("search", &resolve_job("25CR111111-100")).await.unwrap();

        let first = queue.receive("search", 10).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].attempts, 1);

        // Zero visibility timeout: the unacked message comes right back.
        let second = queue.receive("search", 10).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].attempts, 2);
        assert_eq!(second[0].id, first[0].id);
    }

    #[tokio::test]
    async fn release_makes_message_visible() {
        let (_guard, queue) = test_queue(3600, 5).await;

        queue.enqueue("search", &resolve_job("25CR111111-100")).await.unwrap();
        let jobs = queue.receive("search", 10).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(queue.receive("search", 10).await.unwrap().is_empty());

        queue.release(&jobs[0].id).await.unwrap();
        assert_eq!(queue.receive("search", 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn deliveries_past_the_bound_are_flagged_exhausted() {
        let (_guard, queue) = test_queue(0, 2).await;

        queue.enqueue("search", &resolve_job("25CR111111-100")).await.unwrap();

        for expected_attempt in 1..=2u32 {
            let jobs = queue.receive("search", 10).await.unwrap();
            assert_eq!(jobs[0].attempts, expected_attempt);
            assert!(!jobs[0].exhausted);
        }

        let jobs = queue.receive("search", 10).await.unwrap();
        assert_eq!(jobs[0].attempts, 3);
        assert!(jobs[0].exhausted);
    }

    #[tokio::test]
    async fn payload_round_trip_all_variants() {
        let (_guard, queue) = test_queue(60, 5).await;

        let payloads = [
            resolve_job("25CR123456-789"),
            JobPayload::NameSearch {
                search_id: "search-1".to_string(),
                user_id: "user-1".to_string(),
                normalized_name: "Doe, Jane".to_string(),
                date_of_birth: Some("1980-01-01".to_string()),
                sounds_like: true,
                criminal_only: false,
                user_agent: None,
            },
            JobPayload::FetchSummary {
                case_number: "25CR123456-789".to_string(),
                case_id: "ABC123".to_string(),
                user_id: "user-1".to_string(),
                user_agent: Some("agent".to_string()),
            },
        ];

        for payload in &payloads {
            queue.enqueue("search", payload).await.unwrap();
        }

        let jobs = queue.receive("search", 10).await.unwrap();
        assert_eq!(jobs.len(), 3);
        for payload in &payloads {
            assert!(jobs.iter().any(|job| job.payload == *payload));
        }
    }
}
