//! OAuth2 token holder with on-demand refresh
//!
//! A [`TokenSource`] hands out copies of the current token and refreshes it
//! when it is expired or empty. The refresh runs under the write lock, so at
//! most one refresh per source is in flight and concurrent callers wait for
//! its result instead of starting their own.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{IngestorError, Result};

/// Access/refresh token pair with its expiry
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSnapshot {
    pub access_token: String,
    pub refresh_token: String,
    pub expiry: DateTime<Utc>,
}

impl TokenSnapshot {
    pub fn new(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expiry: DateTime<Utc>,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expiry,
        }
    }

    /// Whether the snapshot must be refreshed before use at `now`
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        self.access_token.is_empty() || now >= self.expiry
    }

    /// `Bearer <access token>`
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }
}

impl fmt::Debug for TokenSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSnapshot")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &"<redacted>")
            .field("expiry", &self.expiry)
            .finish()
    }
}

/// Exchanges a refresh token for a new snapshot
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSnapshot>;
}

/// Thread-safe token holder
pub struct TokenSource {
    state: RwLock<TokenSnapshot>,
    refresher: Arc<dyn TokenRefresher>,
}

impl TokenSource {
    pub fn new(initial: TokenSnapshot, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            state: RwLock::new(initial),
            refresher,
        }
    }

    /// Source that only knows a refresh token; the first call refreshes
    pub fn from_refresh_token(
        refresh_token: impl Into<String>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        Self::new(
            TokenSnapshot::new(String::new(), refresh_token, DateTime::<Utc>::MIN_UTC),
            refresher,
        )
    }

    /// Current token, refreshed first if expired or empty
    ///
    /// Refresh errors are returned as-is; the stale token is never handed out.
    pub async fn token(&self) -> Result<TokenSnapshot> {
        {
            let current = self.state.read().await;
            if !current.needs_refresh(Utc::now()) {
                return Ok(current.clone());
            }
        }

        let mut current = self.state.write().await;
        // Another caller may have refreshed while we waited for the lock
        if current.needs_refresh(Utc::now()) {
            debug!("refreshing access token");
            let fresh = self.refresher.refresh(&current.refresh_token).await?;
            *current = fresh;
        }
        Ok(current.clone())
    }
}

impl fmt::Debug for TokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenSource").finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Standard OAuth2 `refresh_token` grant against a token endpoint
#[derive(Debug, Clone)]
pub struct OAuthRefresher {
    http: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: Option<String>,
}

impl OAuthRefresher {
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            client_id: client_id.into(),
            client_secret,
        }
    }
}

/// Lifetime assumed when the token endpoint does not send `expires_in`
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);

#[async_trait]
impl TokenRefresher for OAuthRefresher {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenSnapshot> {
        if refresh_token.is_empty() {
            return Err(IngestorError::Auth("no refresh token available".into()));
        }

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.client_id.as_str()),
        ];
        if let Some(secret) = &self.client_secret {
            form.push(("client_secret", secret.as_str()));
        }

        let response = self
            .http
            .post(&self.token_url)
            .form(&form)
            .send()
            .await
            .map_err(|e| IngestorError::Auth(format!("token refresh request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestorError::Auth(format!(
                "token refresh rejected with HTTP {}: {}",
                status.as_u16(),
                body
            )));
        }

        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| IngestorError::Auth(format!("invalid token response: {}", e)))?;

        Ok(snapshot_from_response(body, refresh_token, Utc::now()))
    }
}

fn snapshot_from_response(
    body: TokenResponse,
    previous_refresh: &str,
    now: DateTime<Utc>,
) -> TokenSnapshot {
    let lifetime = body
        .expires_in
        .map(chrono::Duration::seconds)
        .unwrap_or_else(|| {
            chrono::Duration::from_std(DEFAULT_TOKEN_LIFETIME).unwrap_or(chrono::Duration::zero())
        });
    TokenSnapshot {
        access_token: body.access_token,
        // Servers without refresh-token rotation keep the old one valid
        refresh_token: body
            .refresh_token
            .unwrap_or_else(|| previous_refresh.to_string()),
        expiry: now + lifetime,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRefresher {
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail: bool,
    }

    impl CountingRefresher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, refresh_token: &str) -> Result<TokenSnapshot> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                return Err(IngestorError::Auth("refresh denied".into()));
            }
            Ok(TokenSnapshot::new(
                format!("access-{}", n),
                format!("{}-next", refresh_token),
                Utc::now() + chrono::Duration::hours(1),
            ))
        }
    }

    #[tokio::test]
    async fn test_valid_token_is_not_refreshed() {
        let refresher = CountingRefresher::new(false);
        let source = TokenSource::new(
            TokenSnapshot::new("a", "r", Utc::now() + chrono::Duration::hours(1)),
            refresher.clone(),
        );

        let token = source.token().await.unwrap();
        assert_eq!(token.access_token, "a");
        assert_eq!(token.bearer(), "Bearer a");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expired_token_refreshes_once_for_concurrent_callers() {
        let refresher = CountingRefresher::new(false);
        let source = Arc::new(TokenSource::new(
            TokenSnapshot::new("old", "r0", Utc::now() - chrono::Duration::seconds(1)),
            refresher.clone(),
        ));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let source = source.clone();
            handles.push(tokio::spawn(async move { source.token().await }));
        }
        for handle in handles {
            let token = handle.await.unwrap().unwrap();
            assert_eq!(token.access_token, "access-1");
            assert_eq!(token.refresh_token, "r0-next");
        }

        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(refresher.max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_access_token_triggers_refresh() {
        let refresher = CountingRefresher::new(false);
        let source = TokenSource::from_refresh_token("seed", refresher.clone());
        let token = source.token().await.unwrap();
        assert_eq!(token.access_token, "access-1");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_error_propagates_without_stale_fallback() {
        let refresher = CountingRefresher::new(true);
        let source = TokenSource::new(
            TokenSnapshot::new("stale", "r", Utc::now() - chrono::Duration::seconds(1)),
            refresher.clone(),
        );

        let err = source.token().await.unwrap_err();
        assert!(matches!(err, IngestorError::Auth(_)));
        // next call tries again
        assert!(source.token().await.is_err());
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_snapshot_from_response_keeps_refresh_token() {
        let now = Utc::now();
        let body = TokenResponse {
            access_token: "new".into(),
            refresh_token: None,
            expires_in: Some(60),
        };
        let snap = snapshot_from_response(body, "keep-me", now);
        assert_eq!(snap.refresh_token, "keep-me");
        assert_eq!(snap.expiry, now + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let snap = TokenSnapshot::new("secret-access", "secret-refresh", Utc::now());
        let printed = format!("{:?}", snap);
        assert!(!printed.contains("secret"));
    }
}
