// Case Search Processor
// Request-time orchestration: extract, seed, enqueue, return current view

use anyhow::Result;
use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::domain::case_number::extract_case_numbers;
use crate::domain::{FetchStatus, SearchResult};
use crate::services::case_store::CaseStore;
use crate::services::queue::{JobPayload, JobQueue};
use crate::services::status::StatusService;

pub struct CaseSearchService {
    cases: Arc<CaseStore>,
    queue: Arc<JobQueue>,
    status: Arc<StatusService>,
    search_queue: String,
    refresh_window_seconds: i64,
    processing_stale_seconds: i64,
}

impl CaseSearchService {
    pub fn new(
        cases: Arc<CaseStore>,
        queue: Arc<JobQueue>,
        status: Arc<StatusService>,
        search_queue: String,
        refresh_window_seconds: i64,
        processing_stale_seconds: i64,
    ) -> Self {
        Self {
            cases,
            queue,
            status,
            search_queue,
            refresh_window_seconds,
            processing_stale_seconds,
        }
    }

    /// Handle a free-text search: extract case numbers, seed store rows,
    /// queue resolve work where needed, and return the current view.
    #[instrument(skip(self, input))]
    pub async fn submit(
        &self,
        input: &str,
        user_id: &str,
        user_agent: Option<&str>,
    ) -> Result<BTreeMap<String, SearchResult>> {
        let case_numbers = extract_case_numbers(input);
        if case_numbers.is_empty() {
            debug!("No case numbers extracted from input");
            return Ok(BTreeMap::new());
        }

        for case_number in &case_numbers {
            self.seed_and_enqueue(case_number, user_id, user_agent)
                .await?;
        }

        self.status.get_status(&case_numbers, user_id).await
    }

    /// Seed the case if new and queue a resolve when its state calls for one.
    /// Recent non-terminal rows are left alone so at most one resolve is
    /// outstanding per case.
    pub async fn seed_and_enqueue(
        &self,
        case_number: &str,
        user_id: &str,
        user_agent: Option<&str>,
    ) -> Result<()> {
        let (case, created) = self.cases.seed_if_absent(case_number).await?;

        let age_seconds = case
            .last_updated
            .map(|at| (Utc::now() - at).num_seconds())
            .unwrap_or(i64::MAX);

        let should_enqueue = match case.fetch_status {
            // Freshly seeded rows go straight to the queue; a queued row
            // nobody claimed within the refresh window re-queues in case its
            // message was lost.
            FetchStatus::Queued => created || age_seconds > self.refresh_window_seconds,
            FetchStatus::Failed { .. } => age_seconds > self.refresh_window_seconds,
            FetchStatus::Processing => {
                // A worker that died mid-flight leaves processing behind;
                // reclaim after the staleness bound and retry.
                let stale_before = Utc::now() - Duration::seconds(self.processing_stale_seconds);
                self.cases
                    .reclaim_stale_processing(case_number, stale_before)
                    .await?
            }
            _ => false,
        };

        if should_enqueue {
            self.queue
                .enqueue(
                    &self.search_queue,
                    &JobPayload::Resolve {
                        case_number: case_number.to_string(),
                        user_id: user_id.to_string(),
                        user_agent: user_agent.map(String::from),
                    },
                )
                .await?;
            debug!("Queued resolve for {}", case_number);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::alerts::Alerter;
    use crate::services::database::Database;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    const CASE: &str = "25CR123456-789";

    struct Harness {
        _temp_dir: TempDir,
        db: Database,
        service: CaseSearchService,
        cases: Arc<CaseStore>,
        queue: Arc<JobQueue>,
    }

    async fn test_harness() -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            temp_dir.path().join("search.db").display()
        );
        let db = Database::connect(&url, StdDuration::from_secs(10))
            .await
            .unwrap();
        let cases = Arc::new(CaseStore::new(db.pool().clone()));
        let queue = Arc::new(JobQueue::new(db.pool().clone(), 60, 5));
        let status = Arc::new(StatusService::new(
            cases.clone(),
            queue.clone(),
            Arc::new(Alerter::new(None)),
            "search".to_string(),
        ));
        let service = CaseSearchService::new(
            cases.clone(),
            queue.clone(),
            status,
            "search".to_string(),
            900,
            600,
        );
        Harness {
            _temp_dir: temp_dir,
            db,
            service,
            cases,
            queue,
        }
    }

    #[tokio::test]
    async fn empty_input_returns_empty_results() {
        let harness = test_harness().await;
        let results = harness
            .service
            .submit("no case numbers here", "user-1", None)
            .await
            .unwrap();
        assert!(results.is_empty());
        assert_eq!(harness.queue.depth("search").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn new_case_is_seeded_queued_and_enqueued() {
        let harness = test_harness().await;
        let results = harness
            .service
            .submit(CASE, "user-1", None)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[CASE].zip_case.fetch_status, FetchStatus::Queued);
        assert_eq!(harness.queue.depth("search").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn lexis_nexis_input_flows_under_the_canonical_key() {
        let harness = test_harness().await;
        let results = harness
            .service
            .submit("7892025CR 123456", "user-1", None)
            .await
            .unwrap();

        assert!(results.contains_key(CASE));
        assert!(harness.cases.get(CASE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn repeat_searches_coalesce_to_one_outstanding_resolve() {
        let harness = test_harness().await;

        harness.service.submit(CASE, "user-1", None).await.unwrap();
        // Re-seeded row is recent and queued: no duplicate job.
        harness.service.submit(CASE, "user-1", None).await.unwrap();
        harness.service.submit(CASE, "user-2", None).await.unwrap();

        assert_eq!(harness.queue.depth("search").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn terminal_recent_states_are_not_requeued() {
        let harness = test_harness().await;
        harness.cases.seed_if_absent(CASE).await.unwrap();

        for status in [
            FetchStatus::Complete,
            FetchStatus::NotFound,
            FetchStatus::failed("portal_busy"),
        ] {
            harness.cases.set_status(CASE, &status).await.unwrap();
            harness.service.submit(CASE, "user-1", None).await.unwrap();
        }

        assert_eq!(harness.queue.depth("search").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_case_older_than_refresh_window_is_requeued() {
        let harness = test_harness().await;
        harness.cases.seed_if_absent(CASE).await.unwrap();
        harness
            .cases
            .set_status(CASE, &FetchStatus::failed("portal_unavailable"))
            .await
            .unwrap();

        // Age the row past the refresh window.
        sqlx::query("UPDATE cases SET last_updated = ? WHERE case_number = ?")
            .bind((Utc::now() - Duration::hours(1)).to_rfc3339())
            .bind(CASE)
            .execute(harness.db.pool())
            .await
            .unwrap();

        harness.service.submit(CASE, "user-1", None).await.unwrap();
        assert_eq!(harness.queue.depth("search").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn stale_processing_is_reclaimed_and_requeued() {
        let harness = test_harness().await;
        harness.cases.seed_if_absent(CASE).await.unwrap();
        harness
            .cases
            .set_status(CASE, &FetchStatus::Processing)
            .await
            .unwrap();

        // Recent processing row: left alone.
        harness.service.submit(CASE, "user-1", None).await.unwrap();
        assert_eq!(harness.queue.depth("search").await.unwrap(), 0);

        // Age it beyond the staleness bound (10x visibility timeout).
        sqlx::query("UPDATE cases SET last_updated = ? WHERE case_number = ?")
            .bind((Utc::now() - Duration::seconds(700)).to_rfc3339())
            .bind(CASE)
            .execute(harness.db.pool())
            .await
            .unwrap();

        harness.service.submit(CASE, "user-1", None).await.unwrap();
        assert_eq!(harness.queue.depth("search").await.unwrap(), 1);
        assert_eq!(
            harness.cases.get(CASE).await.unwrap().unwrap().fetch_status,
            FetchStatus::Queued
        );
    }
}
