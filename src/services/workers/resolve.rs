// Resolve worker
// Turns a case number into a portal case id via Smart Search

use tracing::{debug, info, instrument, warn};

use crate::domain::FetchStatus;
use crate::providers::parser;
use crate::services::alerts::AlertContext;
use crate::services::queue::JobPayload;
use crate::services::session::SessionHandle;
use crate::services::workers::{FetchFailure, Outcome, WorkerContext, NON_TERMINAL};

#[instrument(skip(ctx, user_agent))]
pub async fn handle(
    ctx: &WorkerContext,
    case_number: &str,
    user_id: &str,
    user_agent: Option<&str>,
) -> Outcome {
    match run(ctx, case_number, user_id, user_agent).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("Resolve for {} hit a store error: {}", case_number, e);
            Outcome::Retry
        }
    }
}

async fn run(
    ctx: &WorkerContext,
    case_number: &str,
    user_id: &str,
    user_agent: Option<&str>,
) -> anyhow::Result<Outcome> {
    // Session first: a user whose credentials are unusable fails fast
    // without consuming the lease.
    let session = match ctx.sessions.get_or_create(user_id, user_agent).await {
        Ok(session) => session,
        Err(auth_error) => {
            return fail_terminal(ctx, case_number, user_id, FetchFailure::Auth(auth_error)).await;
        }
    };

    // The status is the lease: one resolve per case at a time. Losers drop
    // the message without touching the portal.
    let claimed = ctx
        .cases
        .try_transition(
            case_number,
            &["queued", "failed", "reprocessing"],
            &FetchStatus::Processing,
        )
        .await?;
    if !claimed {
        debug!("Resolve lease for {} already taken", case_number);
        return Ok(Outcome::Ack);
    }

    let html = match search_with_refresh(ctx, &session, user_id, case_number).await {
        Ok(html) => html,
        Err(failure) if failure.is_transient() => {
            // Give the lease back so the redelivered message can claim it.
            ctx.cases
                .try_transition(case_number, &["processing"], &FetchStatus::Queued)
                .await?;
            return Ok(Outcome::Retry);
        }
        Err(failure) => {
            return fail_terminal(ctx, case_number, user_id, failure).await;
        }
    };

    // Resolve takes only the first case link.
    let Some(link) = parser::parse_first_case_link(&html) else {
        info!("No portal match for {}", case_number);
        ctx.cases
            .try_transition(case_number, &["processing"], &FetchStatus::NotFound)
            .await?;
        return Ok(Outcome::Ack);
    };

    if !ctx.cases.set_found(case_number, &link.case_id).await? {
        debug!("Lost the resolve lease for {} before recording", case_number);
        return Ok(Outcome::Ack);
    }

    ctx.queue
        .enqueue(
            &ctx.case_data_queue,
            &JobPayload::FetchSummary {
                case_number: case_number.to_string(),
                case_id: link.case_id.clone(),
                user_id: user_id.to_string(),
                user_agent: user_agent.map(String::from),
            },
        )
        .await?;

    info!("Resolved {} to portal case {}", case_number, link.case_id);
    Ok(Outcome::Ack)
}

/// One search attempt, with a single session refresh when the portal kicks
/// us back to the login page with a bundle the store thought was fresh.
async fn search_with_refresh(
    ctx: &WorkerContext,
    session: &SessionHandle,
    user_id: &str,
    case_number: &str,
) -> Result<String, FetchFailure> {
    use crate::providers::PortalError;

    match ctx
        .portal
        .search_by_case_number(&session.cookies, &session.user_agent, case_number)
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
                .search_by_case_number(&refreshed.cookies, &refreshed.user_agent, case_number)
                .await
                .map_err(FetchFailure::Portal)
        }
        other => other.map_err(FetchFailure::Portal),
    }
}

async fn fail_terminal(
    ctx: &WorkerContext,
    case_number: &str,
    user_id: &str,
    failure: FetchFailure,
) -> anyhow::Result<Outcome> {
    let reason = failure.reason();
    warn!("Resolve for {} failed: {}", case_number, reason);

    ctx.cases
        .try_transition(case_number, &NON_TERMINAL, &FetchStatus::failed(reason))
        .await?;
    ctx.alerter
        .alert(
            failure.severity(),
            failure.category(),
            &format!("case resolve failed: {}", reason),
            AlertContext::for_case(user_id, case_number),
        )
        .await;
    Ok(Outcome::Ack)
}
