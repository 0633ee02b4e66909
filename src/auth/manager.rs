//! Subscription session lifecycle.
//!
//! A [`SessionManager`] owns the tokens for one provider id. Requests run
//! through [`SessionManager::execute`], which refreshes proactively near
//! expiry and reactively after an authentication failure, at most once per
//! request. Concurrent callers that hit the same stale token share a single
//! refresh: the refresh lock is double-checked against the token the caller
//! actually used.
//!
//! State machine: `Valid → Refreshing → Valid | Invalid`. A refresh rejected
//! by the identity provider (or a session without a refresh token) moves the
//! session to `Invalid`, clears it from memory and deletes the stored copy.
//! Transient refresh failures keep the existing tokens.

// Author: kelexine (https://github.com/kelexine)

use super::ProviderSession;
use crate::credentials::CredentialStore;
use crate::error::{BridgeError, ErrorKind, Result};
use crate::providers::http::classify_status;
use crate::utils::logging::excerpt;
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

/// ChatGPT (Codex CLI) OAuth client.
pub const CHATGPT_TOKEN_URL: &str = "https://auth.openai.com/oauth/token";
pub const CHATGPT_CLIENT_ID: &str = "app_EMoamEEZ73f0CkXaXp7hrann";

/// Claude (Claude Code) OAuth client.
pub const CLAUDE_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
pub const CLAUDE_CLIENT_ID: &str = "9d1c250a-e61b-44d9-88ed-5944d1962f5e";

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Valid,
    Refreshing,
    Invalid,
}

/// Exchanges a refresh token for new tokens.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, session: &ProviderSession) -> Result<ProviderSession>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenEncoding {
    /// `application/x-www-form-urlencoded`
    Form,
    Json,
}

/// Standard OAuth2 `refresh_token` grant.
pub struct OAuthRefresher {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    encoding: TokenEncoding,
}

impl OAuthRefresher {
    pub fn new(
        client: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        encoding: TokenEncoding,
    ) -> Self {
        Self {
            client,
            token_url: token_url.into(),
            client_id: client_id.into(),
            encoding,
        }
    }

    pub fn chatgpt(client: reqwest::Client) -> Self {
        Self::new(client, CHATGPT_TOKEN_URL, CHATGPT_CLIENT_ID, TokenEncoding::Form)
    }

    pub fn claude(client: reqwest::Client) -> Self {
        Self::new(client, CLAUDE_TOKEN_URL, CLAUDE_CLIENT_ID, TokenEncoding::Json)
    }
}

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, session: &ProviderSession) -> Result<ProviderSession> {
        let refresh_token = session
            .refresh_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| BridgeError::AuthenticationFailed("session has no refresh token".into()))?;

        let request = self.client.post(&self.token_url);
        let request = match self.encoding {
            TokenEncoding::Form => request.form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", self.client_id.as_str()),
            ]),
            TokenEncoding::Json => request.json(&serde_json::json!({
                "grant_type": "refresh_token",
                "refresh_token": refresh_token,
                "client_id": self.client_id,
            })),
        };

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let body = response.text().await.unwrap_or_default();
            // The identity provider answers a dead refresh token with 400/401/403
            return Err(match status.as_u16() {
                400 | 401 | 403 => BridgeError::AuthenticationFailed(format!(
                    "refresh rejected (HTTP {}): {}",
                    status.as_u16(),
                    excerpt(&body, 200)
                )),
                _ => classify_status(status, &headers, &body),
            });
        }

        let token_data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| BridgeError::InvalidResponse(format!("Malformed token response: {}", e)))?;

        let access_token = token_data
            .get("access_token")
            .and_then(|v| v.as_str())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                BridgeError::InvalidResponse("Missing access_token in token response".to_string())
            })?;

        let expires_in = token_data
            .get("expires_in")
            .and_then(|v| v.as_i64())
            .unwrap_or(DEFAULT_EXPIRES_IN_SECS);

        let mut fresh = ProviderSession::new(access_token)
            .with_expiry_ms(chrono::Utc::now().timestamp_millis() + expires_in * 1000);
        // Rotation is optional; keep the old refresh token when none is returned
        fresh.refresh_token = token_data
            .get("refresh_token")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| session.refresh_token.clone());
        let claimed = fresh.resolve_account_id();
        fresh.account_id = session.account_id.clone().or(claimed);

        debug!("Refreshed token expires in {} seconds", expires_in);
        Ok(fresh)
    }
}

/// Public view of a session; never includes tokens.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub provider_id: String,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_in_seconds: Option<i64>,
    pub can_refresh: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

pub struct SessionManager {
    provider_id: String,
    session: RwLock<Option<ProviderSession>>,
    state: parking_lot::Mutex<SessionState>,
    /// Serializes refresh attempts.
    refresh_lock: Mutex<()>,
    refresher: Arc<dyn TokenRefresher>,
    store: Option<CredentialStore>,
    skew: Duration,
}

impl SessionManager {
    pub fn new(
        provider_id: impl Into<String>,
        session: Option<ProviderSession>,
        refresher: Arc<dyn TokenRefresher>,
        store: Option<CredentialStore>,
        skew: Duration,
    ) -> Self {
        let state = if session.is_some() {
            SessionState::Valid
        } else {
            SessionState::Invalid
        };

        Self {
            provider_id: provider_id.into(),
            session: RwLock::new(session),
            state: parking_lot::Mutex::new(state),
            refresh_lock: Mutex::new(()),
            refresher,
            store,
            skew,
        }
    }

    /// Build a manager from whatever the credential store holds for `provider_id`.
    pub fn load(
        provider_id: &str,
        refresher: Arc<dyn TokenRefresher>,
        store: Option<CredentialStore>,
        skew: Duration,
    ) -> Result<Self> {
        let session = match &store {
            Some(store) => store.load(provider_id)?,
            None => None,
        };

        match &session {
            Some(s) => debug!(
                "Loaded session for {} (expires in {:?}s)",
                provider_id,
                s.expires_in_seconds()
            ),
            None => warn!(
                "No stored session for {}; import one with `cuebridge session import`",
                provider_id
            ),
        }

        Ok(Self::new(provider_id, session, refresher, store, skew))
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Current tokens, or `AuthenticationFailed` when there are none.
    pub async fn current(&self) -> Result<ProviderSession> {
        self.session.read().await.clone().ok_or_else(|| {
            BridgeError::AuthenticationFailed(format!(
                "no valid session for provider '{}'; re-import one",
                self.provider_id
            ))
        })
    }

    /// Explicit re-authentication: replace the session, persist it and mark it valid.
    pub async fn reauthenticate(&self, session: ProviderSession) -> Result<()> {
        let _guard = self.refresh_lock.lock().await;
        if let Some(store) = &self.store {
            store.save(&self.provider_id, &session)?;
        }
        *self.session.write().await = Some(session);
        *self.state.lock() = SessionState::Valid;
        info!("Installed new session for {}", self.provider_id);
        Ok(())
    }

    /// Run `operation` with valid tokens.
    ///
    /// Refreshes before the call when the token is inside the skew window,
    /// and after an `AuthenticationFailed` result otherwise. At most one
    /// refresh and one retry happen per call; a second authentication
    /// failure is returned as-is.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn(ProviderSession) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut session = self.current().await?;
        let mut refreshed = false;

        if session.is_expiring(self.skew) && session.can_refresh() {
            debug!("Session for {} is near expiry; refreshing first", self.provider_id);
            let stale = session.access_token.clone();
            session = self.refresh_after_rejection(&stale).await?;
            refreshed = true;
        }

        let used_token = session.access_token.clone();
        match operation(session).await {
            Err(BridgeError::AuthenticationFailed(message)) if !refreshed => {
                warn!(
                    "Provider {} rejected the session ({}); refreshing",
                    self.provider_id,
                    excerpt(&message, 120)
                );
                let fresh = self.refresh_after_rejection(&used_token).await?;
                operation(fresh).await
            }
            outcome => outcome,
        }
    }

    /// Refresh unless another caller already replaced `stale_token`.
    pub async fn refresh_after_rejection(&self, stale_token: &str) -> Result<ProviderSession> {
        let _guard = self.refresh_lock.lock().await;

        let current = {
            let guard = self.session.read().await;
            match guard.as_ref() {
                None => {
                    return Err(BridgeError::AuthenticationFailed(format!(
                        "session for '{}' was invalidated; re-import one",
                        self.provider_id
                    )))
                }
                Some(s) if s.access_token != stale_token => {
                    debug!("Session already refreshed by another concurrent request.");
                    return Ok(s.clone());
                }
                Some(s) => s.clone(),
            }
        };

        if !current.can_refresh() {
            self.invalidate_locked().await;
            return Err(BridgeError::AuthenticationFailed(format!(
                "session for '{}' expired and cannot be refreshed; re-import one",
                self.provider_id
            )));
        }

        *self.state.lock() = SessionState::Refreshing;
        match self.refresher.refresh(&current).await {
            Ok(fresh) => {
                if let Some(store) = &self.store {
                    if let Err(e) = store.save(&self.provider_id, &fresh) {
                        error!("Persistence error while saving refreshed session: {}", e);
                    }
                }
                *self.session.write().await = Some(fresh.clone());
                *self.state.lock() = SessionState::Valid;
                crate::metrics::record_session_refresh(&self.provider_id, true);
                info!("Refreshed session for {}", self.provider_id);
                Ok(fresh)
            }
            Err(e) => {
                crate::metrics::record_session_refresh(&self.provider_id, false);
                match e.kind() {
                    ErrorKind::AuthenticationFailed | ErrorKind::InvalidResponse => {
                        warn!("Refresh for {} was rejected: {}", self.provider_id, e);
                        self.invalidate_locked().await;
                        Err(BridgeError::AuthenticationFailed(format!(
                            "session refresh rejected: {}",
                            e
                        )))
                    }
                    _ => {
                        // Transient; keep the tokens for the next attempt
                        *self.state.lock() = SessionState::Valid;
                        Err(e)
                    }
                }
            }
        }
    }

    /// Drop the session from memory and from the credential store.
    pub async fn invalidate(&self) {
        let _guard = self.refresh_lock.lock().await;
        self.invalidate_locked().await;
    }

    async fn invalidate_locked(&self) {
        *self.session.write().await = None;
        *self.state.lock() = SessionState::Invalid;
        if let Some(store) = &self.store {
            if let Err(e) = store.delete(&self.provider_id) {
                error!("Failed to delete stored session for {}: {}", self.provider_id, e);
            }
        }
    }

    pub async fn token_info(&self) -> SessionInfo {
        let session = self.session.read().await;
        SessionInfo {
            provider_id: self.provider_id.clone(),
            state: self.state(),
            expires_in_seconds: session.as_ref().and_then(|s| s.expires_in_seconds()),
            can_refresh: session.as_ref().is_some_and(|s| s.can_refresh()),
            account_id: session.as_ref().and_then(|s| s.resolve_account_id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::AesGcmCipher;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeRefresher {
        calls: AtomicUsize,
        outcome: fn() -> Result<ProviderSession>,
        delay: Duration,
    }

    impl FakeRefresher {
        fn new(outcome: fn() -> Result<ProviderSession>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                outcome,
                delay: Duration::from_millis(20),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenRefresher for FakeRefresher {
        async fn refresh(&self, _session: &ProviderSession) -> Result<ProviderSession> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            (self.outcome)()
        }
    }

    fn fresh() -> Result<ProviderSession> {
        Ok(ProviderSession::new("new-token").with_refresh_token("rt-2"))
    }

    fn rejected() -> Result<ProviderSession> {
        Err(BridgeError::AuthenticationFailed("invalid_grant".into()))
    }

    fn flaky() -> Result<ProviderSession> {
        Err(BridgeError::ServiceUnavailable("503".into()))
    }

    fn old_session() -> ProviderSession {
        ProviderSession::new("old-token").with_refresh_token("rt-1")
    }

    fn store() -> (tempfile::TempDir, CredentialStore) {
        let dir = tempfile::tempdir().unwrap();
        let cipher = AesGcmCipher::from_key_bytes(&[7u8; 32]).unwrap();
        let store = CredentialStore::new(dir.path(), Arc::new(cipher));
        (dir, store)
    }

    #[tokio::test]
    async fn test_two_rejections_refresh_once() {
        let refresher = FakeRefresher::new(fresh);
        let manager = SessionManager::new(
            "chatgpt",
            Some(old_session()),
            refresher.clone(),
            None,
            Duration::from_secs(300),
        );
        let attempts = AtomicUsize::new(0);

        let result: Result<()> = manager
            .execute(|_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(BridgeError::AuthenticationFailed("401".into())) }
            })
            .await;

        assert!(matches!(result, Err(BridgeError::AuthenticationFailed(_))));
        assert_eq!(refresher.calls(), 1);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        // Fresh tokens survive a second rejection
        assert_eq!(manager.current().await.unwrap().access_token, "new-token");
        assert_eq!(manager.state(), SessionState::Valid);
    }

    #[tokio::test]
    async fn test_concurrent_rejections_share_one_refresh() {
        let refresher = FakeRefresher::new(fresh);
        let manager = SessionManager::new(
            "chatgpt",
            Some(old_session()),
            refresher.clone(),
            None,
            Duration::from_secs(300),
        );

        let call = || {
            manager.execute(|session: ProviderSession| async move {
                if session.access_token == "old-token" {
                    Err(BridgeError::AuthenticationFailed("401".into()))
                } else {
                    Ok(session.access_token.clone())
                }
            })
        };

        let (a, b) = tokio::join!(call(), call());
        assert_eq!(a.unwrap(), "new-token");
        assert_eq!(b.unwrap(), "new-token");
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_rejected_refresh_invalidates_and_deletes() {
        let (_dir, store) = store();
        store.save("claude", &old_session()).unwrap();

        let refresher = FakeRefresher::new(rejected);
        let manager = SessionManager::load("claude", refresher, Some(store.clone()), Duration::from_secs(300))
            .unwrap();

        let result: Result<()> = manager
            .execute(|_| async { Err(BridgeError::AuthenticationFailed("401".into())) })
            .await;

        assert!(matches!(result, Err(BridgeError::AuthenticationFailed(_))));
        assert_eq!(manager.state(), SessionState::Invalid);
        assert!(manager.current().await.is_err());
        assert!(store.load("claude").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_missing_refresh_token_invalidates() {
        let refresher = FakeRefresher::new(fresh);
        let manager = SessionManager::new(
            "claude",
            Some(ProviderSession::new("only-access")),
            refresher.clone(),
            None,
            Duration::from_secs(300),
        );

        let result: Result<()> = manager
            .execute(|_| async { Err(BridgeError::AuthenticationFailed("401".into())) })
            .await;

        assert!(result.is_err());
        assert_eq!(refresher.calls(), 0);
        assert_eq!(manager.state(), SessionState::Invalid);
    }

    #[tokio::test]
    async fn test_transient_refresh_failure_keeps_tokens() {
        let refresher = FakeRefresher::new(flaky);
        let manager = SessionManager::new(
            "chatgpt",
            Some(old_session()),
            refresher,
            None,
            Duration::from_secs(300),
        );

        let result: Result<()> = manager
            .execute(|_| async { Err(BridgeError::AuthenticationFailed("401".into())) })
            .await;

        assert_eq!(result.unwrap_err().kind(), ErrorKind::ServiceUnavailable);
        assert_eq!(manager.state(), SessionState::Valid);
        assert_eq!(manager.current().await.unwrap().access_token, "old-token");
    }

    #[tokio::test]
    async fn test_proactive_refresh_near_expiry() {
        let refresher = FakeRefresher::new(fresh);
        let expiring = old_session().with_expiry_ms(chrono::Utc::now().timestamp_millis() + 10_000);
        let manager = SessionManager::new(
            "chatgpt",
            Some(expiring),
            refresher.clone(),
            None,
            Duration::from_secs(300),
        );

        let token = manager
            .execute(|s: ProviderSession| async move { Ok(s.access_token.clone()) })
            .await
            .unwrap();

        assert_eq!(token, "new-token");
        assert_eq!(refresher.calls(), 1);
    }

    #[tokio::test]
    async fn test_oauth_refresher_form_encoding() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/oauth/token")
            .match_header("content-type", "application/x-www-form-urlencoded")
            .match_body(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("grant_type".into(), "refresh_token".into()),
                mockito::Matcher::UrlEncoded("refresh_token".into(), "rt-1".into()),
                mockito::Matcher::UrlEncoded("client_id".into(), CHATGPT_CLIENT_ID.into()),
            ]))
            .with_status(200)
            .with_body(r#"{"access_token":"at-2","expires_in":600}"#)
            .create_async()
            .await;

        let refresher = OAuthRefresher::new(
            reqwest::Client::new(),
            format!("{}/oauth/token", server.url()),
            CHATGPT_CLIENT_ID,
            TokenEncoding::Form,
        );
        let fresh = refresher
            .refresh(&old_session().with_account_id("acct"))
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(fresh.access_token, "at-2");
        assert_eq!(fresh.refresh_token.as_deref(), Some("rt-1"));
        assert_eq!(fresh.account_id.as_deref(), Some("acct"));
        assert!(fresh.expires_in_seconds().unwrap() > 500);
    }

    #[tokio::test]
    async fn test_oauth_refresher_json_rejection() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/v1/oauth/token")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "grant_type": "refresh_token",
                "client_id": CLAUDE_CLIENT_ID,
            })))
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant"}"#)
            .create_async()
            .await;

        let refresher = OAuthRefresher::new(
            reqwest::Client::new(),
            format!("{}/v1/oauth/token", server.url()),
            CLAUDE_CLIENT_ID,
            TokenEncoding::Json,
        );
        let err = refresher.refresh(&old_session()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthenticationFailed);
    }
}
