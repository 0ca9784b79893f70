// Credential & session store
// Portal credentials encrypted at rest, session cookie bundles, user agents

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use tracing::{debug, info, instrument};

use crate::providers::portal::{CookieBundle, LoginSession};
use crate::providers::USER_AGENT_COLLECTION;
use crate::utils::crypto::{sha256_hex, SecretBox};
use crate::utils::date::{now_rfc3339, parse_rfc3339};

/// Decrypted portal credentials.
#[derive(Debug, Clone)]
pub struct PortalCredentials {
    pub username: String,
    pub password: String,
    pub is_bad: bool,
}

/// A persisted portal session.
#[derive(Debug, Clone)]
pub struct StoredSession {
    pub cookies: CookieBundle,
    pub expires_at: DateTime<Utc>,
}

pub struct CredentialStore {
    pool: SqlitePool,
    secrets: SecretBox,
}

impl CredentialStore {
    pub fn new(pool: SqlitePool, secrets: SecretBox) -> Self {
        Self { pool, secrets }
    }

    /// Save (or replace) a user's portal credentials. Re-saving clears the
    /// bad-credentials marker so the next search logs in again.
    #[instrument(skip(self, username, password))]
    pub async fn save_credentials(
        &self,
        user_id: &str,
        username: &str,
        password: &str,
    ) -> Result<()> {
        let username_enc = self.secrets.encrypt(username)?;
        let password_enc = self.secrets.encrypt(password)?;

        sqlx::query(
            r#"
            INSERT INTO portal_credentials (user_id, username_enc, password_enc, is_bad, updated_at)
            VALUES (?, ?, ?, 0, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                username_enc = excluded.username_enc,
                password_enc = excluded.password_enc,
                is_bad = 0,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(&username_enc)
        .bind(&password_enc)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to save credentials")?;

        info!("Stored portal credentials for user {}", user_id);
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_credentials(&self, user_id: &str) -> Result<Option<PortalCredentials>> {
        let row = sqlx::query(
            "SELECT username_enc, password_enc, is_bad FROM portal_credentials WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read credentials")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let username_enc: String = row.get("username_enc");
        let password_enc: String = row.get("password_enc");

        Ok(Some(PortalCredentials {
            username: self.secrets.decrypt(&username_enc)?,
            password: self.secrets.decrypt(&password_enc)?,
            is_bad: row.get::<i64, _>("is_bad") != 0,
        }))
    }

    /// Flag credentials the portal rejected so workers stop retrying the
    /// login and locking the upstream account.
    #[instrument(skip(self))]
    pub async fn mark_credentials_bad(&self, user_id: &str, is_bad: bool) -> Result<()> {
        sqlx::query("UPDATE portal_credentials SET is_bad = ?, updated_at = ? WHERE user_id = ?")
            .bind(i64::from(is_bad))
            .bind(now_rfc3339())
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("Failed to update credential flag")?;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get_session(&self, user_id: &str) -> Result<Option<StoredSession>> {
        let row = sqlx::query(
            "SELECT cookie_bundle, expires_at FROM portal_sessions WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to read session")?;

        let Some(row) = row else {
            return Ok(None);
        };

        let bundle: String = row.get("cookie_bundle");
        let expires_at: String = row.get("expires_at");
        let Some(expires_at) = parse_rfc3339(&expires_at) else {
            return Ok(None);
        };

        Ok(Some(StoredSession {
            cookies: serde_json::from_str(&bundle).unwrap_or_default(),
            expires_at,
        }))
    }

    #[instrument(skip(self, session))]
    pub async fn save_session(&self, user_id: &str, session: &LoginSession) -> Result<()> {
        let bundle =
            serde_json::to_string(&session.cookies).context("Failed to serialize cookies")?;

        sqlx::query(
            r#"
            INSERT INTO portal_sessions (user_id, cookie_bundle, expires_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                cookie_bundle = excluded.cookie_bundle,
                expires_at = excluded.expires_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(user_id)
        .bind(&bundle)
        .bind(session.expires_at.to_rfc3339())
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to save session")?;

        debug!("Stored portal session for user {}", user_id);
        Ok(())
    }

    /// The user's assigned browser identity. First use draws one from the
    /// process-wide collection (keyed by a stable hash of the user id) and
    /// persists it so the portal sees a consistent agent per account.
    #[instrument(skip(self))]
    pub async fn user_agent(&self, user_id: &str) -> Result<String> {
        let row = sqlx::query("SELECT user_agent FROM user_agents WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to read user agent")?;

        if let Some(row) = row {
            return Ok(row.get("user_agent"));
        }

        let digest = sha256_hex(user_id);
        let index = usize::from_str_radix(&digest[..8], 16).unwrap_or(0) % USER_AGENT_COLLECTION.len();
        let assigned = USER_AGENT_COLLECTION[index].to_string();

        sqlx::query(
            r#"
            INSERT INTO user_agents (user_id, user_agent, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(&assigned)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to persist user agent")?;

        Ok(assigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::portal::SessionCookie;
    use crate::services::database::Database;
    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use chrono::Duration;
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    async fn test_store() -> (TempDir, CredentialStore) {
        let temp_dir = TempDir::new().unwrap();
        let url = format!(
            "sqlite://{}?mode=rwc",
            temp_dir.path().join("creds.db").display()
        );
        let db = Database::connect(&url, StdDuration::from_secs(10))
            .await
            .unwrap();
        let secrets = SecretBox::from_base64_key(&BASE64.encode([9u8; 32])).unwrap();
        (temp_dir, CredentialStore::new(db.pool().clone(), secrets))
    }

    #[tokio::test]
    async fn credentials_round_trip_encrypted() {
        let (_guard, store) = test_store().await;

        store
            .save_credentials("user-1", "jane@example.com", "hunter2")
            .await
            .unwrap();

        let creds = store.get_credentials("user-1").await.unwrap().unwrap();
        assert_eq!(creds.username, "jane@example.com");
        assert_eq!(creds.password, "hunter2");
        assert!(!creds.is_bad);

        // The stored columns never contain the plaintext.
        let row = sqlx::query("SELECT username_enc, password_enc FROM portal_credentials")
            .fetch_one(&store.pool)
            .await
            .unwrap();
        let username_enc: String = row.get("username_enc");
        let password_enc: String = row.get("password_enc");
        assert!(!username_enc.contains("jane@example.com"));
        assert!(!password_enc.contains("hunter2"));
    }

    #[tokio::test]
    async fn missing_credentials_read_as_none() {
        let (_guard, store) = test_store().await;
        assert!(store.get_credentials("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bad_flag_set_and_cleared_by_resave() {
        let (_guard, store) = test_store().await;
        store
            .save_credentials("user-1", "jane@example.com", "hunter2")
            .await
            .unwrap();

        store.mark_credentials_bad("user-1", true).await.unwrap();
        assert!(store.get_credentials("user-1").await.unwrap().unwrap().is_bad);

        // Re-saving credentials clears the flag.
        store
            .save_credentials("user-1", "jane@example.com", "new-password")
            .await
            .unwrap();
        assert!(!store.get_credentials("user-1").await.unwrap().unwrap().is_bad);
    }

    #[tokio::test]
    async fn session_round_trip() {
        let (_guard, store) = test_store().await;
        let expires_at = Utc::now() + Duration::hours(12);

        store
            .save_session(
                "user-1",
                &LoginSession {
                    cookies: vec![SessionCookie {
                        name: "ASP.NET_SessionId".to_string(),
                        value: "abc".to_string(),
                    }],
                    expires_at,
                },
            )
            .await
            .unwrap();

        let session = store.get_session("user-1").await.unwrap().unwrap();
        assert_eq!(session.cookies.len(), 1);
        assert_eq!(session.cookies[0].name, "ASP.NET_SessionId");
        assert_eq!(session.expires_at.timestamp(), expires_at.timestamp());
    }

    #[tokio::test]
    async fn user_agent_assignment_is_stable() {
        let (_guard, store) = test_store().await;

        let first = store.user_agent("user-1").await.unwrap();
        let second = store.user_agent("user-1").await.unwrap();
        assert_eq!(first, second);
        assert!(USER_AGENT_COLLECTION.contains(&first.as_str()));
    }
}
