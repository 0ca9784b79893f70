// Queue consumers
// Parallel workers over the search and case-data queues

pub mod case_data;
pub mod name_search;
pub mod resolve;

use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::QueueConfig;
use crate::domain::{reason, FetchStatus, NameSearchStatus};
use crate::providers::portal::PortalClient;
use crate::providers::PortalError;
use crate::services::alerts::{AlertCategory, AlertContext, AlertSeverity, Alerter};
use crate::services::case_search::CaseSearchService;
use crate::services::case_store::CaseStore;
use crate::services::name_search_store::NameSearchStore;
use crate::services::queue::{ClaimedJob, JobPayload, JobQueue};
use crate::services::session::{AuthError, SessionManager};

/// What a handler decided about its message. `Retry` leaves the message
/// unacked so the visibility timeout redelivers it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Ack,
    Retry,
}

/// Statuses a worker may overwrite with a terminal failure. Terminal rows
/// are never clobbered by a late failure.
pub(crate) const NON_TERMINAL: [&str; 4] = ["queued", "processing", "found", "reprocessing"];

/// Everything the workers share.
pub struct WorkerContext {
    pub cases: Arc<CaseStore>,
    pub searches: Arc<NameSearchStore>,
    pub queue: Arc<JobQueue>,
    pub sessions: Arc<SessionManager>,
    pub portal: Arc<PortalClient>,
    pub alerter: Arc<Alerter>,
    pub case_search: Arc<CaseSearchService>,
    pub search_queue: String,
    pub case_data_queue: String,
}

/// A session/portal failure observed while handling one message.
pub(crate) enum FetchFailure {
    Auth(AuthError),
    Portal(PortalError),
}

impl FetchFailure {
    pub(crate) fn is_transient(&self) -> bool {
        match self {
            FetchFailure::Auth(e) => e.is_transient(),
            // An expired session that survived one refresh gets another
            // delivery with a fresh login rather than a terminal status.
            FetchFailure::Portal(PortalError::SessionExpired) => true,
            FetchFailure::Portal(e) => e.is_transient(),
        }
    }

    pub(crate) fn reason(&self) -> &'static str {
        match self {
            FetchFailure::Auth(e) => e.reason(),
            FetchFailure::Portal(PortalError::Busy) => reason::PORTAL_BUSY,
            FetchFailure::Portal(PortalError::Network(_))
            | FetchFailure::Portal(PortalError::ServiceUnavailable(_)) => {
                reason::PORTAL_UNAVAILABLE
            }
            FetchFailure::Portal(_) => reason::INTERNAL,
        }
    }

    pub(crate) fn category(&self) -> AlertCategory {
        match self {
            FetchFailure::Auth(_) => AlertCategory::Auth,
            FetchFailure::Portal(PortalError::Network(_)) => AlertCategory::Network,
            FetchFailure::Portal(_) => AlertCategory::Portal,
        }
    }

    pub(crate) fn severity(&self) -> AlertSeverity {
        match self {
            // User-recoverable: bad or missing credentials.
            FetchFailure::Auth(AuthError::NoCredentials)
            | FetchFailure::Auth(AuthError::BadCredentials) => AlertSeverity::Warning,
            FetchFailure::Portal(PortalError::Busy) => AlertSeverity::Warning,
            _ => AlertSeverity::Error,
        }
    }
}

/// Spawn the consumer loops for both queues. Each loop claims batches and
/// fans handling out across a bounded set of concurrent tasks.
pub fn spawn_workers(
    ctx: Arc<WorkerContext>,
    config: &QueueConfig,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    vec![
        spawn_consumer(
            ctx.clone(),
            ctx.search_queue.clone(),
            config.clone(),
            shutdown.clone(),
        ),
        spawn_consumer(
            ctx.clone(),
            ctx.case_data_queue.clone(),
            config.clone(),
            shutdown,
        ),
    ]
}

fn spawn_consumer(
    ctx: Arc<WorkerContext>,
    queue_name: String,
    config: QueueConfig,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Worker consumer online for queue {}", queue_name);
        let semaphore = Arc::new(Semaphore::new(config.worker_concurrency));
        let poll_interval = std::time::Duration::from_millis(config.poll_interval_ms);

        loop {
            if *shutdown.borrow() {
                break;
            }

            let jobs = match ctx.queue.receive(&queue_name, config.batch_size).await {
                Ok(jobs) => jobs,
                Err(e) => {
                    error!("Queue poll failed for {}: {}", queue_name, e);
                    ctx.alerter
                        .alert(
                            AlertSeverity::Error,
                            AlertCategory::Database,
                            "queue poll failed",
                            AlertContext::default(),
                        )
                        .await;
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
            };

            if jobs.is_empty() {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
                continue;
            }

            for job in jobs {
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    dispatch(&ctx, job).await;
                });
            }
        }

        info!("Worker consumer offline for queue {}", queue_name);
    })
}

async fn dispatch(ctx: &WorkerContext, job: ClaimedJob) {
    if job.exhausted {
        handle_exhausted(ctx, &job).await;
        return;
    }

    let outcome = match &job.payload {
        JobPayload::Resolve {
            case_number,
            user_id,
            user_agent,
        } => resolve::handle(ctx, case_number, user_id, user_agent.as_deref()).await,
        JobPayload::NameSearch {
            search_id,
            user_id,
            normalized_name,
            date_of_birth,
            sounds_like,
            criminal_only,
            user_agent,
        } => {
            name_search::handle(
                ctx,
                name_search::NameSearchJob {
                    search_id,
                    user_id,
                    normalized_name,
                    date_of_birth: date_of_birth.as_deref(),
                    sounds_like: *sounds_like,
                    criminal_only: *criminal_only,
                    user_agent: user_agent.as_deref(),
                },
            )
            .await
        }
        JobPayload::FetchSummary {
            case_number,
            case_id,
            user_id,
            user_agent,
        } => {
            case_data::handle(ctx, case_number, case_id, user_id, user_agent.as_deref()).await
        }
    };

    match outcome {
        Outcome::Ack => {
            if let Err(e) = ctx.queue.ack(&job.id).await {
                error!("Failed to ack job {}: {}", job.id, e);
            }
        }
        Outcome::Retry => {
            debug!(
                "Job {} returned to queue (attempt {})",
                job.id, job.attempts
            );
        }
    }
}

/// A message delivered past the attempt bound: record a terminal failure on
/// the owning entity and drop the message.
async fn handle_exhausted(ctx: &WorkerContext, job: &ClaimedJob) {
    warn!("Job {} exhausted its delivery attempts", job.id);

    let context = match &job.payload {
        JobPayload::Resolve {
            case_number,
            user_id,
            ..
        }
        | JobPayload::FetchSummary {
            case_number,
            user_id,
            ..
        } => {
            let failed = FetchStatus::failed(reason::MAX_ATTEMPTS);
            if let Err(e) = ctx
                .cases
                .try_transition(case_number, &NON_TERMINAL, &failed)
                .await
            {
                error!("Failed to record exhaustion for {}: {}", case_number, e);
            }
            AlertContext::for_case(user_id, case_number)
        }
        JobPayload::NameSearch {
            search_id, user_id, ..
        } => {
            let failed = NameSearchStatus::Failed {
                message: reason::MAX_ATTEMPTS.to_string(),
            };
            if let Err(e) = ctx.searches.set_status(search_id, &failed).await {
                error!("Failed to record exhaustion for {}: {}", search_id, e);
            }
            AlertContext::for_search(user_id, search_id)
        }
    };

    ctx.alerter
        .alert(
            AlertSeverity::Error,
            AlertCategory::System,
            "job exhausted its delivery attempts",
            context,
        )
        .await;

    if let Err(e) = ctx.queue.ack(&job.id).await {
        error!("Failed to ack exhausted job {}: {}", job.id, e);
    }
}
