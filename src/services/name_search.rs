// Name Search Processor
// Request-time orchestration for party-name queries

use anyhow::Result;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::domain::name::{normalize_name, parse_date_of_birth};
use crate::domain::{NameSearchData, NameSearchStatus, SearchResult};
use crate::services::name_search_store::NameSearchStore;
use crate::services::queue::{JobPayload, JobQueue};
use crate::services::session::SessionManager;
use crate::services::status::StatusService;

/// Submission outcome: accepted searches poll by id, rejections fail fast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameSearchSubmit {
    Accepted { search_id: String },
    Rejected { error: String },
}

/// A name-search record merged with the current state of its cases.
#[derive(Debug, Clone)]
pub struct NameSearchView {
    pub data: NameSearchData,
    pub results: BTreeMap<String, SearchResult>,
}

pub struct NameSearchRequest {
    pub name: String,
    pub date_of_birth: Option<String>,
    pub sounds_like: bool,
    pub criminal_only: bool,
}

pub struct NameSearchService {
    searches: Arc<NameSearchStore>,
    sessions: Arc<SessionManager>,
    queue: Arc<JobQueue>,
    status: Arc<StatusService>,
    search_queue: String,
}

impl NameSearchService {
    pub fn new(
        searches: Arc<NameSearchStore>,
        sessions: Arc<SessionManager>,
        queue: Arc<JobQueue>,
        status: Arc<StatusService>,
        search_queue: String,
    ) -> Self {
        Self {
            searches,
            sessions,
            queue,
            status,
            search_queue,
        }
    }

    /// Seed a search record and queue the portal work. A session failure is
    /// recorded on the search record instead of queueing anything, so the
    /// client sees the failure on its first poll.
    #[instrument(skip(self, request))]
    pub async fn submit(
        &self,
        request: NameSearchRequest,
        user_id: &str,
        user_agent: Option<&str>,
    ) -> Result<NameSearchSubmit> {
        let normalized_name = normalize_name(&request.name);
        if normalized_name.is_empty() {
            debug!("Rejected unparseable name");
            return Ok(NameSearchSubmit::Rejected {
                error: "unparseable name".to_string(),
            });
        }

        // A future or malformed date of birth is dropped rather than sent to
        // the portal.
        let date_of_birth = request
            .date_of_birth
            .as_deref()
            .and_then(parse_date_of_birth)
            .map(|date| date.format("%Y-%m-%d").to_string());

        let search_id = Uuid::new_v4().to_string();
        let mut data = NameSearchData {
            search_id: search_id.clone(),
            original_name: request.name.clone(),
            normalized_name: normalized_name.clone(),
            date_of_birth: date_of_birth.clone(),
            sounds_like: request.sounds_like,
            criminal_only: request.criminal_only,
            cases: vec![],
            status: NameSearchStatus::Queued,
        };

        if let Err(auth_error) = self.sessions.get_or_create(user_id, user_agent).await {
            info!("Name search rejected at session acquisition: {}", auth_error);
            data.status = NameSearchStatus::Failed {
                message: auth_error.reason().to_string(),
            };
            self.searches.create(user_id, &data).await?;
            return Ok(NameSearchSubmit::Accepted { search_id });
        }

        self.searches.create(user_id, &data).await?;
        self.queue
            .enqueue(
                &self.search_queue,
                &JobPayload::NameSearch {
                    search_id: search_id.clone(),
                    user_id: user_id.to_string(),
                    normalized_name,
                    date_of_birth,
                    sounds_like: request.sounds_like,
                    criminal_only: request.criminal_only,
                    user_agent: user_agent.map(String::from),
                },
            )
            .await?;

        info!("Accepted name search {}", search_id);
        Ok(NameSearchSubmit::Accepted { search_id })
    }

    /// Load a search and the merged view of every case it discovered.
    #[instrument(skip(self))]
    pub async fn get(&self, search_id: &str, user_id: &str) -> Result<Option<NameSearchView>> {
        let Some(data) = self.searches.get(search_id).await? else {
            return Ok(None);
        };

        let results = self.status.get_status(&data.cases, user_id).await?;
        Ok(Some(NameSearchView { data, results }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PortalConfig;
    use crate::providers::portal::{LoginSession, PortalClient, SessionCookie};
    use crate::services::alerts::Alerter;
    use crate::services::case_store::CaseStore;
    use crate::services::credential_store::CredentialStore;
    use crate::services::database::Database;
    use crate::utils::crypto::SecretBox;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use chrono::{Duration, Utc};
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    struct Harness {
        _temp_dir: TempDir,
        service: NameSearchService,
        searches: Arc<NameSearchStore>,
        credentials: Arc<CredentialStore>,
        queue: Arc<JobQueue>,
    }

    async fn test_harness() -> Harness {
        let temp_dir = TempDir::new().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            temp_dir.path().join("names.db").display()
        );
        let db = Database::connect(&url, StdDuration::from_secs(10))
            .await
            .unwrap();

        let secrets = SecretBox::from_base64_key(&BASE64.encode([3u8; 32])).unwrap();
        let credentials = Arc::new(CredentialStore::new(db.pool().clone(), secrets));
        let portal = Arc::new(
            PortalClient::new(&PortalConfig {
                // Unroutable: these tests never reach the portal.
                base_url: "http://127.0.0.1:9".to_string(),
                case_path: "Portal/Case/CaseDetail".to_string(),
                timeout_seconds: 1,
                requests_per_minute: 600,
                burst_limit: 10,
            })
            .unwrap(),
        );
        let sessions = Arc::new(SessionManager::new(credentials.clone(), portal));

        let cases = Arc::new(CaseStore::new(db.pool().clone()));
        let queue = Arc::new(JobQueue::new(db.pool().clone(), 60, 5));
        let status = Arc::new(StatusService::new(
            cases,
            queue.clone(),
            Arc::new(Alerter::new(None)),
            "search".to_string(),
        ));
        let searches = Arc::new(NameSearchStore::new(db.pool().clone()));

        let service = NameSearchService::new(
            searches.clone(),
            sessions,
            queue.clone(),
            status,
            "search".to_string(),
        );

        Harness {
            _temp_dir: temp_dir,
            service,
            searches,
            credentials,
            queue,
        }
    }

    fn request(name: &str) -> NameSearchRequest {
        NameSearchRequest {
            name: name.to_string(),
            date_of_birth: None,
            sounds_like: false,
            criminal_only: false,
        }
    }

    async fn store_fresh_session(credentials: &CredentialStore, user_id: &str) {
        credentials
            .save_session(
                user_id,
                &LoginSession {
                    cookies: vec![SessionCookie {
                        name: "session".to_string(),
                        value: "abc".to_string(),
                    }],
                    expires_at: Utc::now() + Duration::hours(12),
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unparseable_name_is_rejected_fast() {
        let harness = test_harness().await;
        let outcome = harness
            .service
            .submit(request("   "), "user-1", None)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            NameSearchSubmit::Rejected {
                error: "unparseable name".to_string()
            }
        );
        assert_eq!(harness.queue.depth("search").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_credentials_fail_onto_the_search_record() {
        let harness = test_harness().await;
        let outcome = harness
            .service
            .submit(request("Doe, Jane"), "user-1", None)
            .await
            .unwrap();

        let NameSearchSubmit::Accepted { search_id } = outcome else {
            panic!("expected accepted submission");
        };

        // Failure recorded on the record, no queue work.
        let data = harness.searches.get(&search_id).await.unwrap().unwrap();
        assert_eq!(data.status.message(), Some("no_credentials"));
        assert_eq!(harness.queue.depth("search").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn fresh_session_accepts_and_queues_the_search() {
        let harness = test_harness().await;
        store_fresh_session(&harness.credentials, "user-1").await;

        let outcome = harness
            .service
            .submit(
                NameSearchRequest {
                    name: "Jane Marie Doe".to_string(),
                    date_of_birth: Some("1980-01-01".to_string()),
                    sounds_like: true,
                    criminal_only: true,
                },
                "user-1",
                None,
            )
            .await
            .unwrap();

        let NameSearchSubmit::Accepted { search_id } = outcome else {
            panic!("expected accepted submission");
        };

        let data = harness.searches.get(&search_id).await.unwrap().unwrap();
        assert_eq!(data.status, NameSearchStatus::Queued);
        assert_eq!(data.normalized_name, "Doe, Jane Marie");
        assert_eq!(data.date_of_birth.as_deref(), Some("1980-01-01"));
        assert!(data.cases.is_empty());

        assert_eq!(harness.queue.depth("search").await.unwrap(), 1);
        let jobs = harness.queue.receive("search", 10).await.unwrap();
        assert!(matches!(
            &jobs[0].payload,
            JobPayload::NameSearch { normalized_name, sounds_like: true, criminal_only: true, .. }
                if normalized_name == "Doe, Jane Marie"
        ));
    }

    #[tokio::test]
    async fn future_dob_is_dropped_before_queueing() {
        let harness = test_harness().await;
        store_fresh_session(&harness.credentials, "user-1").await;

        let outcome = harness
            .service
            .submit(
                NameSearchRequest {
                    name: "Doe, Jane".to_string(),
                    date_of_birth: Some("2099-01-01".to_string()),
                    sounds_like: false,
                    criminal_only: false,
                },
                "user-1",
                None,
            )
            .await
            .unwrap();

        let NameSearchSubmit::Accepted { search_id } = outcome else {
            panic!("expected accepted submission");
        };
        let data = harness.searches.get(&search_id).await.unwrap().unwrap();
        assert_eq!(data.date_of_birth, None);
    }

    #[tokio::test]
    async fn unknown_search_view_is_none() {
        let harness = test_harness().await;
        assert!(harness
            .service
            .get("missing", "user-1")
            .await
            .unwrap()
            .is_none());
    }
}
