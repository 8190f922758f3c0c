//! Catalog authentication and the shared token cache.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use reqwest::StatusCode;
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use flurry_core::emit;

use super::TableCatalog;
use crate::error::CatalogError;
use crate::metrics::events::TokenRefreshed;

/// Tokens expiring within this window are refreshed before use.
///
/// Short-lived tokens use half their lifetime instead, see
/// [`AccessToken::refresh_margin`].
pub const REFRESH_MARGIN: Duration = Duration::from_secs(30);

fn default_realm_header() -> String {
    "Polaris-Realm".to_string()
}

/// OAuth2 client-credentials settings for the catalog.
#[derive(Clone, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct OAuth2Config {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default)]
    pub scope: Option<String>,
    /// Sent in `realm_header` when set.
    #[serde(default)]
    pub realm: Option<String>,
    #[serde(default = "default_realm_header")]
    pub realm_header: String,
}

impl fmt::Debug for OAuth2Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OAuth2Config")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("scope", &self.scope)
            .field("realm", &self.realm)
            .finish()
    }
}

/// How to obtain catalog access tokens.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    /// No token endpoint; the catalog issues a non-expiring local token.
    #[default]
    None,
    ClientCredentials(OAuth2Config),
}

/// A bearer token and its expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    value: String,
    issued_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

impl AccessToken {
    pub fn new(value: impl Into<String>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            value: value.into(),
            issued_at: Utc::now(),
            expires_at,
        }
    }

    /// A token that never expires.
    pub fn non_expiring(value: impl Into<String>) -> Self {
        Self::new(value, None)
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// How long before expiry the token should be replaced.
    ///
    /// [`REFRESH_MARGIN`], capped at half the token's lifetime so a token
    /// issued for less than twice the margin is still reused.
    pub fn refresh_margin(&self) -> Duration {
        let lifetime = self
            .expires_at
            .and_then(|expires_at| (expires_at - self.issued_at).to_std().ok());
        match lifetime {
            Some(lifetime) => REFRESH_MARGIN.min(lifetime / 2),
            None => REFRESH_MARGIN,
        }
    }

    /// Whether the token expires within `window` from now.
    pub fn expires_within(&self, window: Duration) -> bool {
        let window = TimeDelta::from_std(window).unwrap_or(TimeDelta::MAX);
        self.expires_at.is_some_and(|expires_at| {
            Utc::now()
                .checked_add_signed(window)
                .is_none_or(|deadline| expires_at <= deadline)
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Client for an OAuth2 token endpoint using the client-credentials grant.
#[derive(Debug, Clone)]
pub struct OAuth2Client {
    http: reqwest::Client,
}

impl OAuth2Client {
    pub fn new(timeout: Duration) -> Result<Self, CatalogError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CatalogError::Permanent {
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http })
    }

    /// Request a token from the endpoint.
    pub async fn fetch_token(&self, config: &OAuth2Config) -> Result<AccessToken, CatalogError> {
        let mut form = vec![("grant_type", "client_credentials")];
        if let Some(scope) = &config.scope {
            form.push(("scope", scope.as_str()));
        }

        let mut request = self
            .http
            .post(&config.token_url)
            .basic_auth(&config.client_id, Some(&config.client_secret))
            .form(&form);
        if let Some(realm) = &config.realm {
            request = request.header(config.realm_header.as_str(), realm);
        }

        let response = request.send().await.map_err(|e| CatalogError::Transient {
            message: format!("token request failed: {e}"),
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("token endpoint returned {status}: {body}");
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    CatalogError::Unauthorized { message }
                }
                StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
                    CatalogError::Transient { message }
                }
                s if s.is_server_error() => CatalogError::Transient { message },
                _ => CatalogError::Permanent { message },
            });
        }

        let body: TokenResponse = response.json().await.map_err(|e| CatalogError::Permanent {
            message: format!("invalid token response: {e}"),
        })?;

        let expires_at = body
            .expires_in
            .and_then(TimeDelta::try_seconds)
            .and_then(|lifetime| Utc::now().checked_add_signed(lifetime));
        debug!(token_url = %config.token_url, ?expires_at, "Fetched access token");

        Ok(AccessToken::new(body.access_token, expires_at))
    }
}

/// Access token shared by all workers of a run.
///
/// Reads take a read lock. A refresh is single-flight: the first caller to
/// find the token stale takes the refresh lock and re-checks before calling
/// the catalog, so concurrent callers reuse its result.
pub struct TokenCache {
    catalog: Arc<dyn TableCatalog>,
    credentials: Credentials,
    target: String,
    current: RwLock<Option<AccessToken>>,
    refresh: Mutex<()>,
}

impl fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenCache")
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

impl TokenCache {
    pub fn new(catalog: Arc<dyn TableCatalog>, credentials: Credentials, target: String) -> Self {
        Self {
            catalog,
            credentials,
            target,
            current: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    fn usable(token: Option<&AccessToken>) -> Option<AccessToken> {
        token
            .filter(|token| !token.expires_within(token.refresh_margin()))
            .cloned()
    }

    /// A token valid for at least its [refresh margin](AccessToken::refresh_margin).
    pub async fn token(&self) -> Result<AccessToken, CatalogError> {
        if let Some(token) = Self::usable(self.current.read().await.as_ref()) {
            return Ok(token);
        }

        let _refreshing = self.refresh.lock().await;
        if let Some(token) = Self::usable(self.current.read().await.as_ref()) {
            return Ok(token);
        }

        let token = self.catalog.authenticate(&self.credentials).await?;
        info!(target = %self.target, expires_at = ?token.expires_at(), "Authenticated with catalog");
        emit!(TokenRefreshed {
            target: self.target.clone(),
        });

        *self.current.write().await = Some(token.clone());
        Ok(token)
    }

    /// Drop `stale` so the next [`token`](Self::token) call re-authenticates.
    ///
    /// A token that was already replaced by another worker is kept.
    pub async fn invalidate(&self, stale: &AccessToken) {
        let mut current = self.current.write().await;
        if current.as_ref() == Some(stale) {
            debug!(target = %self.target, "Invalidated access token");
            *current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemoryCatalog;
    use wiremock::matchers::{body_string_contains, header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn oauth_config(server: &MockServer) -> OAuth2Config {
        OAuth2Config {
            token_url: format!("{}/v1/oauth/tokens", server.uri()),
            client_id: "flurry".to_string(),
            client_secret: "s3cret".to_string(),
            scope: Some("PRINCIPAL_ROLE:ALL".to_string()),
            realm: Some("default-realm".to_string()),
            realm_header: default_realm_header(),
        }
    }

    #[test]
    fn test_expires_within() {
        let soon = AccessToken::new("t", Some(Utc::now() + TimeDelta::seconds(10)));
        let later = AccessToken::new("t", Some(Utc::now() + TimeDelta::seconds(3600)));

        assert!(soon.expires_within(REFRESH_MARGIN));
        assert!(!later.expires_within(REFRESH_MARGIN));
        assert!(!AccessToken::non_expiring("t").expires_within(REFRESH_MARGIN));
    }

    #[test]
    fn test_refresh_margin_is_capped_by_lifetime() {
        let short = AccessToken::new("t", Some(Utc::now() + TimeDelta::seconds(20)));
        let long = AccessToken::new("t", Some(Utc::now() + TimeDelta::seconds(3600)));

        assert!(short.refresh_margin() <= Duration::from_secs(10));
        assert!(short.refresh_margin() >= Duration::from_secs(9));
        assert!(!short.expires_within(short.refresh_margin()));
        assert_eq!(long.refresh_margin(), REFRESH_MARGIN);
        assert_eq!(AccessToken::non_expiring("t").refresh_margin(), REFRESH_MARGIN);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let config = OAuth2Config {
            token_url: "http://localhost/token".to_string(),
            client_id: "id".to_string(),
            client_secret: "hunter2".to_string(),
            scope: None,
            realm: None,
            realm_header: default_realm_header(),
        };
        assert!(!format!("{config:?}").contains("hunter2"));
        assert!(!format!("{:?}", AccessToken::non_expiring("hunter2")).contains("hunter2"));
    }

    #[tokio::test]
    async fn test_fetch_token_sends_client_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/oauth/tokens"))
            .and(header_exists("authorization"))
            .and(header("Polaris-Realm", "default-realm"))
            .and(body_string_contains("grant_type=client_credentials"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "abc123",
                "token_type": "bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = OAuth2Client::new(Duration::from_secs(5)).unwrap();
        let token = client.fetch_token(&oauth_config(&server)).await.unwrap();

        assert_eq!(token.value(), "abc123");
        assert!(!token.expires_within(REFRESH_MARGIN));
    }

    #[tokio::test]
    async fn test_fetch_token_classifies_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = OAuth2Client::new(Duration::from_secs(5)).unwrap();
        let config = oauth_config(&server);

        let err = client.fetch_token(&config).await.unwrap_err();
        assert!(matches!(err, CatalogError::Unauthorized { .. }));

        let err = client.fetch_token(&config).await.unwrap_err();
        assert!(matches!(err, CatalogError::Transient { .. }));
    }

    #[tokio::test]
    async fn test_cache_refreshes_once_for_concurrent_callers() {
        let catalog = Arc::new(MemoryCatalog::new());
        let cache = Arc::new(TokenCache::new(
            catalog.clone(),
            Credentials::None,
            "trips".to_string(),
        ));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.token().await.unwrap() }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(catalog.auth_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_reauthentication() {
        let catalog = Arc::new(MemoryCatalog::new());
        let cache = TokenCache::new(catalog.clone(), Credentials::None, "trips".to_string());

        let first = cache.token().await.unwrap();
        cache.invalidate(&first).await;
        let second = cache.token().await.unwrap();
        // A stale handle does not evict the fresh token.
        cache.invalidate(&first).await;
        let third = cache.token().await.unwrap();

        assert_ne!(first, second);
        assert_eq!(second, third);
        assert_eq!(catalog.auth_calls(), 2);
    }
}
