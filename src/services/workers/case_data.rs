// Case-data worker
// Turns a resolved portal case id into a parsed, stored summary

use tracing::{debug, info, instrument, warn};

use crate::domain::FetchStatus;
use crate::providers::parser;
use crate::services::alerts::AlertContext;
use crate::services::session::SessionHandle;
use crate::services::workers::{FetchFailure, Outcome, WorkerContext, NON_TERMINAL};

#[instrument(skip(ctx, user_agent))]
pub async fn handle(
    ctx: &WorkerContext,
    case_number: &str,
    case_id: &str,
    user_id: &str,
    user_agent: Option<&str>,
) -> Outcome {
    match run(ctx, case_number, case_id, user_id, user_agent).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("Summary fetch for {} hit a store error: {}", case_number, e);
            Outcome::Retry
        }
    }
}

async fn run(
    ctx: &WorkerContext,
    case_number: &str,
    case_id: &str,
    user_id: &str,
    user_agent: Option<&str>,
) -> anyhow::Result<Outcome> {
    let session = match ctx.sessions.get_or_create(user_id, user_agent).await {
        Ok(session) => session,
        Err(auth_error) if auth_error.is_transient() => {
            debug!("Transient session failure for {}; retrying", case_number);
            return Ok(Outcome::Retry);
        }
        Err(auth_error) => {
            return fail_terminal(ctx, case_number, user_id, FetchFailure::Auth(auth_error)).await;
        }
    };

    // Lease: only one summary fetch per resolved case at a time.
    let claimed = ctx
        .cases
        .try_transition(case_number, &["found"], &FetchStatus::Processing)
        .await?;
    if !claimed {
        debug!("Summary lease for {} already taken", case_number);
        return Ok(Outcome::Ack);
    }

    let html = match fetch_with_refresh(ctx, &session, user_id, case_id).await {
        Ok(html) => html,
        Err(failure) if failure.is_transient() => {
            ctx.cases
                .try_transition(case_number, &["processing"], &FetchStatus::Found)
                .await?;
            return Ok(Outcome::Retry);
        }
        Err(failure) => {
            return fail_terminal(ctx, case_number, user_id, failure).await;
        }
    };

    let summary = match parser::parse_case_detail(&html) {
        Ok(summary) => summary,
        Err(e) => {
            return fail_terminal(ctx, case_number, user_id, FetchFailure::Portal(e)).await;
        }
    };

    // Summary first, then the status flip: `complete` always implies a
    // well-formed summary at the same key.
    ctx.cases.write_summary(case_number, &summary).await?;
    ctx.cases
        .try_transition(case_number, &["processing"], &FetchStatus::Complete)
        .await?;

    info!(
        "Stored summary for {} ({} charges)",
        case_number,
        summary.charges.len()
    );
    Ok(Outcome::Ack)
}

async fn fetch_with_refresh(
    ctx: &WorkerContext,
    session: &SessionHandle,
    user_id: &str,
    case_id: &str,
) -> Result<String, FetchFailure> {
    use crate::providers::PortalError;

    match ctx
        .portal
        .fetch_case_detail(&session.cookies, &session.user_agent, case_id)
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
                .fetch_case_detail(&refreshed.cookies, &refreshed.user_agent, case_id)
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
    warn!("Summary fetch for {} failed: {}", case_number, reason);

    ctx.cases
        .try_transition(case_number, &NON_TERMINAL, &FetchStatus::failed(reason))
        .await?;
    ctx.alerter
        .alert(
            failure.severity(),
            failure.category(),
            &format!("case summary fetch failed: {}", reason),
            AlertContext::for_case(user_id, case_number),
        )
        .await;
    Ok(Outcome::Ack)
}
