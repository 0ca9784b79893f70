// Portal Authenticator
// Session reuse, per-user login coalescing, bad-credential handling

use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::domain::reason;
use crate::providers::portal::{CookieBundle, PortalClient};
use crate::providers::PortalError;
use crate::services::credential_store::CredentialStore;

/// A session is treated as expired when less than this much lifetime remains.
const EXPIRY_MARGIN_HOURS: i64 = 1;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no portal credentials on file")]
    NoCredentials,

    #[error("portal rejected the stored credentials")]
    BadCredentials,

    #[error("portal unavailable: {0}")]
    PortalUnavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// The client-facing reason string recorded in `failed{message}`.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthError::NoCredentials => reason::NO_CREDENTIALS,
            AuthError::BadCredentials => reason::BAD_CREDENTIALS,
            AuthError::PortalUnavailable(_) => reason::PORTAL_UNAVAILABLE,
            AuthError::Internal(_) => reason::INTERNAL,
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, AuthError::PortalUnavailable(_))
    }
}

/// A usable portal session handed to workers: the cookie bundle plus the
/// user-agent the bundle was established under.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    pub cookies: CookieBundle,
    pub user_agent: String,
}

pub struct SessionManager {
    credentials: Arc<CredentialStore>,
    portal: Arc<PortalClient>,
    login_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionManager {
    pub fn new(credentials: Arc<CredentialStore>, portal: Arc<PortalClient>) -> Self {
        Self {
            credentials,
            portal,
            login_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Reuse the stored session when it has more than an hour of life left;
    /// otherwise log in. Concurrent callers for one user coalesce on a single
    /// login attempt and share its result.
    #[instrument(skip(self))]
    pub async fn get_or_create(
        &self,
        user_id: &str,
        user_agent: Option<&str>,
    ) -> Result<SessionHandle, AuthError> {
        let user_agent = self.resolve_user_agent(user_id, user_agent).await?;

        if let Some(session) = self.fresh_session(user_id).await? {
            debug!("Reusing stored portal session for {}", user_id);
            return Ok(SessionHandle {
                cookies: session,
                user_agent,
            });
        }

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        // A coalesced waiter finds the session the in-flight login stored.
        if let Some(session) = self.fresh_session(user_id).await? {
            debug!("Coalesced onto a concurrent login for {}", user_id);
            return Ok(SessionHandle {
                cookies: session,
                user_agent,
            });
        }

        self.login(user_id, &user_agent).await
    }

    /// Force a new login, used when a worker hits a login redirect with a
    /// bundle that the store still considers fresh.
    #[instrument(skip(self))]
    pub async fn refresh(
        &self,
        user_id: &str,
        user_agent: Option<&str>,
    ) -> Result<SessionHandle, AuthError> {
        let user_agent = self.resolve_user_agent(user_id, user_agent).await?;

        let lock = self.user_lock(user_id).await;
        let _guard = lock.lock().await;

        self.login(user_id, &user_agent).await
    }

    async fn login(&self, user_id: &str, user_agent: &str) -> Result<SessionHandle, AuthError> {
        let credentials = self
            .credentials
            .get_credentials(user_id)
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?
            .ok_or(AuthError::NoCredentials)?;

        if credentials.is_bad {
            debug!("Skipping login for {}: credentials flagged bad", user_id);
            return Err(AuthError::BadCredentials);
        }

        let session = match self
            .portal
            .login(&credentials.username, &credentials.password, user_agent)
            .await
        {
            Ok(session) => session,
            Err(PortalError::AuthenticationFailed(_)) => {
                warn!("Marking credentials bad for {}", user_id);
                self.credentials
                    .mark_credentials_bad(user_id, true)
                    .await
                    .map_err(|e| AuthError::Internal(e.to_string()))?;
                return Err(AuthError::BadCredentials);
            }
            Err(e) if matches!(e, PortalError::Network(_) | PortalError::ServiceUnavailable(_)) => {
                return Err(AuthError::PortalUnavailable(e.to_string()));
            }
            Err(e) => return Err(AuthError::Internal(e.to_string())),
        };

        self.credentials
            .save_session(user_id, &session)
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?;
        self.credentials
            .mark_credentials_bad(user_id, false)
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?;

        info!("Established portal session for {}", user_id);
        Ok(SessionHandle {
            cookies: session.cookies,
            user_agent: user_agent.to_string(),
        })
    }

    async fn fresh_session(&self, user_id: &str) -> Result<Option<CookieBundle>, AuthError> {
        let stored = self
            .credentials
            .get_session(user_id)
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))?;

        Ok(stored
            .filter(|session| Utc::now() + Duration::hours(EXPIRY_MARGIN_HOURS) < session.expires_at)
            .map(|session| session.cookies))
    }

    async fn resolve_user_agent(
        &self,
        user_id: &str,
        provided: Option<&str>,
    ) -> Result<String, AuthError> {
        if let Some(agent) = provided.filter(|agent| !agent.is_empty()) {
            return Ok(agent.to_string());
        }
        self.credentials
            .user_agent(user_id)
            .await
            .map_err(|e| AuthError::Internal(e.to_string()))
    }

    async fn user_lock(&self, user_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.login_locks.lock().await;
        locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_error_reasons_match_the_taxonomy() {
        assert_eq!(AuthError::NoCredentials.reason(), "no_credentials");
        assert_eq!(AuthError::BadCredentials.reason(), "bad_credentials");
        assert_eq!(
            AuthError::PortalUnavailable("503".to_string()).reason(),
            "portal_unavailable"
        );
        assert_eq!(AuthError::Internal("x".to_string()).reason(), "internal");
    }

    #[test]
    fn only_portal_unavailable_is_transient() {
        assert!(AuthError::PortalUnavailable("timeout".to_string()).is_transient());
        assert!(!AuthError::NoCredentials.is_transient());
        assert!(!AuthError::BadCredentials.is_transient());
        assert!(!AuthError::Internal("x".to_string()).is_transient());
    }
}
