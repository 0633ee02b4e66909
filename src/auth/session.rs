// OAuth/subscription session tokens
// Author: kelexine (https://github.com/kelexine)

use crate::error::{BridgeError, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use zeroize::Zeroize;

/// Tokens for one subscription-backed provider.
///
/// Owned by a single `SessionManager`; the encrypted copy in the credential
/// store is the source of truth across restarts.
#[derive(Clone, PartialEq, Eq, Deserialize, Serialize, Zeroize)]
#[zeroize(drop)]
pub struct ProviderSession {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at_ms: Option<i64>,
    /// ChatGPT workspace id sent as `ChatGPT-Account-Id`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

// Custom Debug impl that never logs tokens
impl std::fmt::Debug for ProviderSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSession")
            .field("access_token", &"[REDACTED]")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at_ms", &self.expires_at_ms)
            .field("account_id", &self.account_id)
            .finish()
    }
}

impl ProviderSession {
    pub fn new(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at_ms: None,
            account_id: None,
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_expiry_ms(mut self, expires_at_ms: i64) -> Self {
        self.expires_at_ms = Some(expires_at_ms);
        self
    }

    pub fn with_account_id(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// True once `now >= expiresAt - skew`. Sessions without an expiry never
    /// expire proactively; they are refreshed only after an auth failure.
    pub fn is_expiring(&self, skew: Duration) -> bool {
        match self.expires_at_ms {
            Some(expires_at) => {
                let now = Utc::now().timestamp_millis();
                now >= expires_at - skew.as_millis() as i64
            }
            None => false,
        }
    }

    /// Seconds until expiry; `None` for sessions without an expiry.
    pub fn expires_in_seconds(&self) -> Option<i64> {
        self.expires_at_ms
            .map(|expires_at| (expires_at - Utc::now().timestamp_millis()) / 1000)
    }

    pub fn can_refresh(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Account id from the session, or from the access token's
    /// `https://api.openai.com/auth` claim.
    pub fn resolve_account_id(&self) -> Option<String> {
        self.account_id.clone().or_else(|| {
            jwt_claims(&self.access_token).ok().and_then(|claims| {
                claims
                    .get("https://api.openai.com/auth")
                    .and_then(|auth| auth.get("chatgpt_account_id"))
                    .or_else(|| claims.get("chatgpt_account_id"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
            })
        })
    }
}

/// Decode a JWT payload without verifying it.
pub fn jwt_claims(token: &str) -> Result<serde_json::Value> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| BridgeError::InvalidResponse("token is not a JWT".to_string()))?;

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|e| BridgeError::InvalidResponse(format!("bad JWT payload: {}", e)))?;

    Ok(serde_json::from_slice(&bytes)?)
}

/// Session file written by the interactive login helper:
/// `{provider, timestamp, credentials: {accessToken, refreshToken?, expiresAt?, accountId?}, expiresAt}`.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionExport {
    #[serde(default)]
    pub provider: Option<String>,
    pub credentials: ExportedCredentials,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedCredentials {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub account_id: Option<String>,
}

impl SessionExport {
    pub fn into_session(self) -> ProviderSession {
        let ExportedCredentials {
            access_token,
            refresh_token,
            expires_at,
            account_id,
        } = self.credentials;

        ProviderSession {
            access_token,
            refresh_token,
            expires_at_ms: expires_at.or(self.expires_at).map(|t| t.timestamp_millis()),
            account_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::URL_SAFE_NO_PAD;

    #[test]
    fn test_debug_impl_masks_tokens() {
        let session = ProviderSession::new("eyJsecret").with_refresh_token("rt-secret");
        let debug_str = format!("{:?}", session);
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("eyJsecret"));
        assert!(!debug_str.contains("rt-secret"));
    }

    #[test]
    fn test_expiry_detection() {
        let future = Utc::now().timestamp_millis() + 3_600_000;
        let session = ProviderSession::new("t").with_expiry_ms(future);

        assert!(!session.is_expiring(Duration::ZERO));
        assert!(session.is_expiring(Duration::from_secs(3700)));
        assert!(session.expires_in_seconds().unwrap() > 3500);
        assert!(!ProviderSession::new("t").is_expiring(Duration::from_secs(1_000_000)));
    }

    #[test]
    fn test_account_id_from_jwt_claim() {
        let claims = serde_json::json!({
            "https://api.openai.com/auth": {"chatgpt_account_id": "acct-123"}
        });
        let token = format!(
            "e30.{}.sig",
            URL_SAFE_NO_PAD.encode(claims.to_string().as_bytes())
        );

        assert_eq!(
            ProviderSession::new(token).resolve_account_id().as_deref(),
            Some("acct-123")
        );
        assert_eq!(
            ProviderSession::new("opaque")
                .with_account_id("explicit")
                .resolve_account_id()
                .as_deref(),
            Some("explicit")
        );
        assert!(ProviderSession::new("opaque").resolve_account_id().is_none());
    }

    #[test]
    fn test_session_export_shape() {
        let json = r#"{
            "provider": "chatgpt",
            "timestamp": "2026-01-01T00:00:00+00:00",
            "credentials": {
                "accessToken": "at",
                "refreshToken": "rt",
                "expiresAt": "2026-01-01T01:00:00+00:00",
                "accountId": "acct"
            },
            "expiresAt": "2026-01-08T00:00:00+00:00"
        }"#;

        let session = serde_json::from_str::<SessionExport>(json)
            .unwrap()
            .into_session();
        assert_eq!(session.access_token, "at");
        assert_eq!(session.refresh_token.as_deref(), Some("rt"));
        assert_eq!(session.account_id.as_deref(), Some("acct"));
        assert_eq!(session.expires_at_ms, Some(1_767_229_200_000));
    }
}
