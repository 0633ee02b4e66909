//! Subscription authentication: session tokens and their refresh lifecycle.
//!
//! Author: kelexine (<https://github.com/kelexine>)

mod manager;
mod session;

pub use manager::{
    OAuthRefresher, SessionInfo, SessionManager, SessionState, TokenEncoding, TokenRefresher,
    CHATGPT_CLIENT_ID, CHATGPT_TOKEN_URL, CLAUDE_CLIENT_ID, CLAUDE_TOKEN_URL,
};
pub use session::{jwt_claims, ExportedCredentials, ProviderSession, SessionExport};
