// Name-search worker
// Runs the party-name Smart Search and fans discovered cases out to resolve

use chrono::NaiveDate;
use tracing::{debug, info, instrument, warn};

use crate::domain::NameSearchStatus;
use crate::providers::parser;
use crate::providers::portal::PartySearch;
use crate::services::alerts::AlertContext;
use crate::services::session::SessionHandle;
use crate::services::workers::{FetchFailure, Outcome, WorkerContext};

pub struct NameSearchJob<'a> {
    pub search_id: &'a str,
    pub user_id: &'a str,
    pub normalized_name: &'a str,
    pub date_of_birth: Option<&'a str>,
    pub sounds_like: bool,
    pub criminal_only: bool,
    pub user_agent: Option<&'a str>,
}

#[instrument(skip(ctx, job), fields(search_id = job.search_id))]
pub async fn handle(ctx: &WorkerContext, job: NameSearchJob<'_>) -> Outcome {
    match run(ctx, &job).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("Name search {} hit a store error: {}", job.search_id, e);
            Outcome::Retry
        }
    }
}

async fn run(ctx: &WorkerContext, job: &NameSearchJob<'_>) -> anyhow::Result<Outcome> {
    ctx.searches
        .set_status(job.search_id, &NameSearchStatus::Processing)
        .await?;

    // Any session failure is terminal for a name search; the client retries
    // by submitting a new search.
    let session = match ctx.sessions.get_or_create(job.user_id, job.user_agent).await {
        Ok(session) => session,
        Err(auth_error) => {
            return fail_terminal(ctx, job, FetchFailure::Auth(auth_error)).await;
        }
    };

    let party = PartySearch {
        name: job.normalized_name.to_string(),
        date_of_birth: job
            .date_of_birth
            .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()),
        sounds_like: job.sounds_like,
        criminal_only: job.criminal_only,
    };

    let html = match search_with_refresh(ctx, &session, job.user_id, &party).await {
        Ok(html) => html,
        Err(failure) if failure.is_transient() => {
            debug!("Transient portal failure for {}; retrying", job.search_id);
            return Ok(Outcome::Retry);
        }
        Err(failure) => {
            return fail_terminal(ctx, job, failure).await;
        }
    };

    // Unlike resolve, a name search keeps every link on the page.
    let links = parser::parse_case_links(&html);
    let case_numbers: Vec<String> = links
        .iter()
        .map(|link| link.case_number.to_uppercase())
        .collect();

    ctx.searches
        .set_results(job.search_id, &case_numbers)
        .await?;
    info!(
        "Name search {} found {} cases",
        job.search_id,
        case_numbers.len()
    );

    // Each discovered case flows through the normal resolve pipeline.
    for case_number in &case_numbers {
        ctx.case_search
            .seed_and_enqueue(case_number, job.user_id, job.user_agent)
            .await?;
    }

    Ok(Outcome::Ack)
}

async fn search_with_refresh(
    ctx: &WorkerContext,
    session: &SessionHandle,
    user_id: &str,
    party: &PartySearch,
) -> Result<String, FetchFailure> {
    use crate::providers::PortalError;

    match ctx
        .portal
        .search_by_party(&session.cookies, &session.user_agent, party)
        .await
    {
        Err(PortalError::SessionExpired) => {
            debug!("Stale session for {}; refreshing once", user_id);
            let refreshed = ctx
                .sessions
                .refresh(user_id, Some(&session.user_agent))
                .await
                .map_err(FetchFailure::Auth)?;
            ctx.portal
                .search_by_party(&refreshed.cookies, &refreshed.user_agent, party)
                .await
                .map_err(FetchFailure::Portal)
        }
        other => other.map_err(FetchFailure::Portal),
    }
}

async fn fail_terminal(
    ctx: &WorkerContext,
    job: &NameSearchJob<'_>,
    failure: FetchFailure,
) -> anyhow::Result<Outcome> {
    let reason = failure.reason();
    warn!("Name search {} failed: {}", job.search_id, reason);

    ctx.searches
        .set_status(
            job.search_id,
            &NameSearchStatus::Failed {
                message: reason.to_string(),
            },
        )
        .await?;
    ctx.alerter
        .alert(
            failure.severity(),
            failure.category(),
            &format!("name search failed: {}", reason),
            AlertContext::for_search(job.user_id, job.search_id),
        )
        .await;
    Ok(Outcome::Ack)
}
