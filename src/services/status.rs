// Status aggregation over the case store
// Validates stored summaries on read and drives bounded reprocessing

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{instrument, warn};

use crate::domain::{CaseSummary, SearchResult, ZipCase};
use crate::services::alerts::{AlertCategory, AlertContext, AlertSeverity, Alerter};
use crate::services::case_store::CaseStore;
use crate::services::queue::{JobPayload, JobQueue};

pub struct StatusService {
    cases: Arc<CaseStore>,
    queue: Arc<JobQueue>,
    alerter: Arc<Alerter>,
    search_queue: String,
}

impl StatusService {
    pub fn new(
        cases: Arc<CaseStore>,
        queue: Arc<JobQueue>,
        alerter: Arc<Alerter>,
        search_queue: String,
    ) -> Self {
        Self {
            cases,
            queue,
            alerter,
            search_queue,
        }
    }

    /// Batch view for polling clients. Only seeded cases appear in the map;
    /// the ordered map keeps responses byte-identical for an unchanged store.
    #[instrument(skip(self, case_numbers))]
    pub async fn get_status(
        &self,
        case_numbers: &[String],
        user_id: &str,
    ) -> Result<BTreeMap<String, SearchResult>> {
        let mut results = BTreeMap::new();

        for case_number in case_numbers {
            let Some(case) = self.cases.get(case_number).await? else {
                continue;
            };
            let result = self.load_result(case, user_id).await?;
            results.insert(case_number.clone(), result);
        }

        Ok(results)
    }

    pub async fn get_case(
        &self,
        case_number: &str,
        user_id: &str,
    ) -> Result<Option<SearchResult>> {
        let Some(case) = self.cases.get(case_number).await? else {
            return Ok(None);
        };
        Ok(Some(self.load_result(case, user_id).await?))
    }

    async fn load_result(&self, case: ZipCase, user_id: &str) -> Result<SearchResult> {
        let Some(raw) = self.cases.read_summary_raw(&case.case_number).await? else {
            return Ok(SearchResult {
                zip_case: case,
                case_summary: None,
            });
        };

        if let Some(summary) = CaseSummary::parse_well_formed(&raw) {
            return Ok(SearchResult {
                zip_case: case,
                case_summary: Some(summary),
            });
        }

        // Malformed summary: the status write happens synchronously so the
        // reprocessing flag is visible before this response returns.
        self.handle_corruption(&case, user_id).await?;
        let zip_case = self
            .cases
            .get(&case.case_number)
            .await?
            .unwrap_or(case);

        Ok(SearchResult {
            zip_case,
            case_summary: None,
        })
    }

    /// One reprocess attempt is allowed. The first detection deletes the
    /// summary and rewinds the pipeline; a detection after that attempt is
    /// persistent corruption.
    async fn handle_corruption(&self, case: &ZipCase, user_id: &str) -> Result<()> {
        let case_number = &case.case_number;
        warn!("Malformed stored summary for {}", case_number);

        let try_count = self.cases.try_count(case_number).await?;
        if try_count >= 1 {
            if self.cases.mark_persistent_corruption(case_number).await? {
                self.alerter
                    .alert(
                        AlertSeverity::Error,
                        AlertCategory::Database,
                        "case summary corrupted after reprocessing; giving up",
                        AlertContext::for_case(user_id, case_number),
                    )
                    .await;
            }
            return Ok(());
        }

        if self.cases.start_reprocessing(case_number).await?.is_some() {
            self.cases.delete_summary(case_number).await?;
            self.alerter
                .alert(
                    AlertSeverity::Warning,
                    AlertCategory::Database,
                    "corrupted case summary deleted; reprocessing",
                    AlertContext::for_case(user_id, case_number),
                )
                .await;
            self.queue
                .enqueue(
                    &self.search_queue,
                    &JobPayload::Resolve {
                        case_number: case_number.clone(),
                        user_id: user_id.to_string(),
                        user_agent: None,
                    },
                )
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{reason, FetchStatus};
    use crate::services::database::Database;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    const CASE: &str = "25CR123456-789";

    struct Harness {
        _temp_dir: TempDir,
        db: Database,
        service: StatusService,
        cases: Arc<CaseStore>,
        queue: Arc<JobQueue>,
    }

    async fn test_harness() -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            temp_dir.path().join("status.db").display()
        );
        let db = Database::connect(&url, StdDuration::from_secs(10))
            .await
            .unwrap();
        let cases = Arc::new(CaseStore::new(db.pool().clone()));
        let queue = Arc::new(JobQueue::new(db.pool().clone(), 60, 5));
        let alerter = Arc::new(Alerter::new(None));
        let service = StatusService::new(
            cases.clone(),
            queue.clone(),
            alerter,
            "search".to_string(),
        );
        Harness {
            _temp_dir: temp_dir,
            db,
            service,
            cases,
            queue,
        }
    }

    impl Harness {
        /// Inject a raw (possibly corrupt) summary body directly.
        async fn write_raw_summary(&self, raw: &str) {
            sqlx::query(
                r#"
                INSERT INTO case_summaries (case_number, summary, written_at)
                VALUES (?, ?, datetime('now'))
                ON CONFLICT(case_number) DO UPDATE SET summary = excluded.summary
                "#,
            )
            .bind(CASE)
            .bind(raw)
            .execute(self.db.pool())
            .await
            .unwrap();
        }
    }

    #[tokio::test]
    async fn unknown_cases_are_absent_from_results() {
        let harness = test_harness().await;
        harness.cases.seed_if_absent(CASE).await.unwrap();

        let results = harness
            .service
            .get_status(
                &[CASE.to_string(), "99XX000000-000".to_string()],
                "user-1",
            )
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert!(results.contains_key(CASE));
    }

    #[tokio::test]
    async fn complete_case_returns_its_summary() {
        let harness = test_harness().await;
        harness.cases.seed_if_absent(CASE).await.unwrap();
        harness
            .cases
            .set_status(CASE, &FetchStatus::Complete)
            .await
            .unwrap();
        harness
            .cases
            .write_summary(
                CASE,
                &CaseSummary {
                    case_name: "State vs. Doe".to_string(),
                    court: "District Court".to_string(),
                    charges: vec![],
                },
            )
            .await
            .unwrap();

        let result = harness
            .service
            .get_case(CASE, "user-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.zip_case.fetch_status, FetchStatus::Complete);
        assert_eq!(
            result.case_summary.unwrap().case_name,
            "State vs. Doe"
        );
    }

    #[tokio::test]
    async fn byte_identical_json_for_unchanged_store() {
        let harness = test_harness().await;
        for case_number in ["25CR222222-200", CASE, "24CV000123-456"] {
            harness.cases.seed_if_absent(case_number).await.unwrap();
        }

        let numbers: Vec<String> = ["25CR222222-200", CASE, "24CV000123-456"]
            .iter()
            .map(|s| s.to_string())
            .collect();

        let first = serde_json::to_string(
            &harness.service.get_status(&numbers, "user-1").await.unwrap(),
        )
        .unwrap();
        let second = serde_json::to_string(
            &harness.service.get_status(&numbers, "user-1").await.unwrap(),
        )
        .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn corrupted_summary_starts_reprocessing_once() {
        let harness = test_harness().await;
        harness.cases.seed_if_absent(CASE).await.unwrap();
        harness
            .cases
            .set_status(CASE, &FetchStatus::Complete)
            .await
            .unwrap();
        harness
            .write_raw_summary(r#"{"caseName":"State vs. Doe","court":"District Court"}"#)
            .await;

        let result = harness
            .service
            .get_case(CASE, "user-1")
            .await
            .unwrap()
            .unwrap();

        // Returned without a summary, with the reprocessing flag already set.
        assert!(result.case_summary.is_none());
        assert_eq!(
            result.zip_case.fetch_status,
            FetchStatus::Reprocessing { try_count: 1 }
        );

        // The corrupt summary is gone and a resolve job was queued.
        assert!(harness
            .cases
            .read_summary_raw(CASE)
            .await
            .unwrap()
            .is_none());
        assert_eq!(harness.queue.depth("search").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn second_corruption_is_persistent() {
        let harness = test_harness().await;
        harness.cases.seed_if_absent(CASE).await.unwrap();
        harness
            .cases
            .set_status(CASE, &FetchStatus::Complete)
            .await
            .unwrap();

        // First detection consumes the reprocess attempt.
        harness.write_raw_summary("{}").await;
        harness.service.get_case(CASE, "user-1").await.unwrap();

        // The pipeline "regenerated" a summary that is still malformed.
        harness
            .cases
            .set_status(CASE, &FetchStatus::Complete)
            .await
            .unwrap();
        harness.write_raw_summary("{}").await;

        let result = harness
            .service
            .get_case(CASE, "user-1")
            .await
            .unwrap()
            .unwrap();

        assert!(result.case_summary.is_none());
        assert_eq!(
            result.zip_case.fetch_status,
            FetchStatus::failed(reason::PERSISTENT_CORRUPTION)
        );

        // No further reprocessing: queue depth unchanged from the first pass.
        assert_eq!(harness.queue.depth("search").await.unwrap(), 1);

        // Status is sticky on later reads.
        let again = harness
            .service
            .get_case(CASE, "user-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            again.zip_case.fetch_status,
            FetchStatus::failed(reason::PERSISTENT_CORRUPTION)
        );
    }

    #[tokio::test]
    async fn corruption_recovery_path_round_trip() {
        let harness = test_harness().await;
        harness.cases.seed_if_absent(CASE).await.unwrap();
        harness
            .cases
            .set_status(CASE, &FetchStatus::Complete)
            .await
            .unwrap();
        harness.write_raw_summary("{}").await;

        // First read flips to reprocessing.
        harness.service.get_case(CASE, "user-1").await.unwrap();

        // Pipeline regenerates a well-formed summary and completes.
        harness
            .cases
            .write_summary(
                CASE,
                &CaseSummary {
                    case_name: "State vs. Doe".to_string(),
                    court: "District Court".to_string(),
                    charges: vec![],
                },
            )
            .await
            .unwrap();
        harness
            .cases
            .set_status(CASE, &FetchStatus::Complete)
            .await
            .unwrap();

        let result = harness
            .service
            .get_case(CASE, "user-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.zip_case.fetch_status, FetchStatus::Complete);
        assert!(result.case_summary.is_some());
    }
}
