pub mod redirect;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use crate::error::SyncError;
use crate::settings::Provider;
use crate::vault::CredentialVault;

const REFRESH_ATTEMPTS: u32 = 3;
const BACKOFF_BASE_MS: u64 = 500;

/// Authorization-code connector lifecycle. `RefreshPending` only ever exists
/// while the state mutex is held, which is what makes the refresh
/// single-flight: a second caller blocks on the lock and finds the refreshed
/// token already in place.
#[derive(Debug)]
enum ConnectorState {
    Unauthenticated,
    AuthorizationRequested,
    Authenticated(TokenSet),
    RefreshPending,
    Revoked,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: i64,
}

#[derive(Debug, Deserialize)]
struct TokenErrorBody {
    error: String,
    #[serde(default)]
    error_description: Option<String>,
}

/// Generic authorization-code + refresh-token client, instantiated once per
/// provider. Tokens live in the credential vault under `account`; the in-flight
/// copy is instance state guarded by a mutex.
pub struct OAuthConnector {
    http: reqwest::Client,
    provider: Provider,
    vault: Arc<dyn CredentialVault>,
    account: String,
    skew: chrono::Duration,
    state: Mutex<ConnectorState>,
}

impl OAuthConnector {
    pub fn new(
        provider: Provider,
        vault: Arc<dyn CredentialVault>,
        account: &str,
        skew_secs: i64,
        request_timeout: Duration,
    ) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("construct http client");

        OAuthConnector {
            http,
            provider,
            vault,
            account: account.to_string(),
            skew: chrono::Duration::seconds(skew_secs),
            state: Mutex::new(ConnectorState::Unauthenticated),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Builds the consent URL. `access_type=offline` and `prompt=consent`
    /// guarantee the provider issues a refresh token on first consent.
    pub async fn authorization_url(&self, state: &str) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.provider.auth_url)?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.provider.client_id)
            .append_pair("redirect_uri", &self.provider.redirect_uri)
            .append_pair("scope", &self.provider.scopes.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", state);

        *self.state.lock().await = ConnectorState::AuthorizationRequested;

        Ok(url)
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenSet, SyncError> {
        let mut state = self.state.lock().await;

        let resp = self
            .http
            .post(&self.provider.token_url)
            .form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("client_id", &self.provider.client_id),
                ("client_secret", &self.provider.secret),
                ("redirect_uri", &self.provider.redirect_uri),
            ])
            .send()
            .await?;

        let tokens = parse_token_response(resp, None).await?;
        self.persist(&tokens)?;
        *state = ConnectorState::Authenticated(tokens.clone());

        Ok(tokens)
    }

    /// Returns an access token that is valid for at least the configured skew
    /// window, refreshing first when necessary. Never returns an expired
    /// token. Concurrent callers during a refresh await the lock and share
    /// the single refresh result.
    pub async fn access_token(&self) -> Result<String, SyncError> {
        let mut state = self.state.lock().await;
        let tokens = self.loaded_tokens(&mut state)?;

        if tokens.expires_at - self.skew > Utc::now() {
            return Ok(tokens.access_token);
        }

        debug!(account = %self.account, "access token near expiry, refreshing");
        self.refresh_locked(&mut state, tokens).await
    }

    /// Reactive refresh after an upstream 401/403, regardless of the local
    /// expiry clock.
    pub async fn force_refresh(&self) -> Result<String, SyncError> {
        let mut state = self.state.lock().await;
        let tokens = self.loaded_tokens(&mut state)?;

        self.refresh_locked(&mut state, tokens).await
    }

    pub async fn revoked(&self) -> bool {
        matches!(*self.state.lock().await, ConnectorState::Revoked)
    }

    /// Drops tokens from the vault and resets to `Unauthenticated`.
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        self.vault.delete(&self.account)?;
        *self.state.lock().await = ConnectorState::Unauthenticated;
        Ok(())
    }

    fn loaded_tokens(&self, state: &mut ConnectorState) -> Result<TokenSet, SyncError> {
        if matches!(state, ConnectorState::Revoked) {
            return Err(SyncError::AuthExpired);
        }

        if let ConnectorState::Authenticated(tokens) = state {
            return Ok(tokens.clone());
        }

        let stored = self.vault.get(&self.account)?.ok_or(SyncError::AuthExpired)?;
        let tokens: TokenSet = serde_json::from_str(&stored)
            .map_err(|e| SyncError::TemporaryAuth(format!("stored credential is unreadable: {}", e)))?;
        *state = ConnectorState::Authenticated(tokens.clone());

        Ok(tokens)
    }

    async fn refresh_locked(
        &self,
        state: &mut ConnectorState,
        current: TokenSet,
    ) -> Result<String, SyncError> {
        *state = ConnectorState::RefreshPending;

        match self.refresh(&current).await {
            Ok(tokens) => {
                self.persist(&tokens)?;
                *state = ConnectorState::Authenticated(tokens.clone());
                Ok(tokens.access_token)
            }
            Err(SyncError::AuthExpired) => {
                *state = ConnectorState::Revoked;
                Err(SyncError::AuthExpired)
            }
            Err(e) => {
                // Transient failure after the retry budget. Keep the stale
                // token set so a later call can retry the refresh.
                *state = ConnectorState::Authenticated(current);
                Err(e)
            }
        }
    }

    async fn refresh(&self, current: &TokenSet) -> Result<TokenSet, SyncError> {
        let mut last_err: Option<SyncError> = None;

        for attempt in 0..REFRESH_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }

            let resp = self
                .http
                .post(&self.provider.token_url)
                .form(&[
                    ("grant_type", "refresh_token"),
                    ("refresh_token", &current.refresh_token),
                    ("client_id", &self.provider.client_id),
                    ("client_secret", &self.provider.secret),
                ])
                .send()
                .await;

            match resp {
                Ok(resp) => match parse_token_response(resp, Some(&current.refresh_token)).await {
                    Ok(tokens) => return Ok(tokens),
                    // invalid_grant is permanent, surface immediately.
                    Err(SyncError::AuthExpired) => return Err(SyncError::AuthExpired),
                    Err(e) => {
                        warn!(account = %self.account, attempt, error = %e, "token refresh failed");
                        last_err = Some(e);
                    }
                },
                Err(e) => {
                    warn!(account = %self.account, attempt, error = %e, "token endpoint unreachable");
                    last_err = Some(e.into());
                }
            }
        }

        Err(SyncError::TemporaryAuth(format!(
            "token refresh failed after {} attempts: {}",
            REFRESH_ATTEMPTS,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    fn persist(&self, tokens: &TokenSet) -> Result<(), SyncError> {
        let secret = serde_json::to_string(tokens)
            .map_err(|e| SyncError::TemporaryAuth(format!("encode credential: {}", e)))?;
        self.vault.save(&self.account, &secret)?;
        Ok(())
    }
}

async fn parse_token_response(
    resp: reqwest::Response,
    previous_refresh_token: Option<&str>,
) -> Result<TokenSet, SyncError> {
    let status = resp.status();

    if status.is_success() {
        let body: TokenResponse = resp.json().await?;
        let refresh_token = match body.refresh_token {
            Some(t) => t,
            // Refresh responses commonly omit the refresh token; keep the one
            // already on file. Missing on first exchange is a provider bug.
            None => previous_refresh_token
                .ok_or_else(|| {
                    SyncError::TemporaryAuth("token response missing refresh_token".to_string())
                })?
                .to_string(),
        };

        return Ok(TokenSet {
            access_token: body.access_token,
            refresh_token,
            expires_at: Utc::now() + chrono::Duration::seconds(body.expires_in),
        });
    }

    let text = resp.text().await.unwrap_or_default();
    if let Ok(err) = serde_json::from_str::<TokenErrorBody>(&text) {
        if err.error == "invalid_grant" {
            return Err(SyncError::AuthExpired);
        }
        return Err(SyncError::TemporaryAuth(format!(
            "{}: {}",
            err.error,
            err.error_description.unwrap_or_default()
        )));
    }

    Err(SyncError::Upstream {
        status: status.as_u16(),
        body: text,
    })
}

pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(BACKOFF_BASE_MS * 2u64.saturating_pow(attempt))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};

    use crate::vault::MemoryVault;

    use super::*;

    #[derive(Clone)]
    struct StubToken {
        hits: Arc<AtomicUsize>,
        status: StatusCode,
        body: serde_json::Value,
    }

    async fn token_handler(State(stub): State<StubToken>) -> (StatusCode, Json<serde_json::Value>) {
        stub.hits.fetch_add(1, Ordering::SeqCst);
        (stub.status, Json(stub.body.clone()))
    }

    async fn stub_token_server(status: StatusCode, body: serde_json::Value) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route("/token", post(token_handler)).with_state(StubToken {
            hits: hits.clone(),
            status,
            body,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}/token", addr), hits)
    }

    fn provider(token_url: &str) -> Provider {
        Provider {
            client_id: "client-1234".to_string(),
            secret: "shhh".to_string(),
            auth_url: "https://auth.test/authorize".to_string(),
            token_url: token_url.to_string(),
            api_url: "https://api.test".to_string(),
            redirect_uri: "http://127.0.0.1:4545/callback".to_string(),
            scopes: vec!["transactions".to_string()],
        }
    }

    fn connector(provider: Provider, vault: Arc<dyn CredentialVault>) -> OAuthConnector {
        OAuthConnector::new(provider, vault, "bank", 300, Duration::from_secs(5))
    }

    fn expired_tokens() -> TokenSet {
        TokenSet {
            access_token: "stale".to_string(),
            refresh_token: "refresh-1".to_string(),
            expires_at: Utc::now() - chrono::Duration::minutes(10),
        }
    }

    fn seed_vault(vault: &MemoryVault, tokens: &TokenSet) {
        vault
            .save("bank", &serde_json::to_string(tokens).unwrap())
            .unwrap();
    }

    #[tokio::test]
    async fn authorization_url_is_deterministic() {
        let conn = connector(provider("https://auth.test/token"), Arc::new(MemoryVault::new()));

        let url = conn.authorization_url("opaque-state").await.unwrap();

        assert_eq!(
            url.as_str(),
            "https://auth.test/authorize?response_type=code&client_id=client-1234\
             &redirect_uri=http%3A%2F%2F127.0.0.1%3A4545%2Fcallback&scope=transactions\
             &access_type=offline&prompt=consent&state=opaque-state"
        );
    }

    #[tokio::test]
    async fn exchange_persists_tokens_to_vault() {
        let (token_url, _) = stub_token_server(
            StatusCode::OK,
            serde_json::json!({
                "access_token": "fresh",
                "refresh_token": "refresh-1",
                "expires_in": 3600,
            }),
        )
        .await;
        let vault = Arc::new(MemoryVault::new());
        let conn = connector(provider(&token_url), vault.clone());

        let tokens = conn.exchange_code("auth-code").await.unwrap();

        assert_eq!(tokens.access_token, "fresh");
        let stored: TokenSet =
            serde_json::from_str(&vault.get("bank").unwrap().unwrap()).unwrap();
        assert_eq!(stored.refresh_token, "refresh-1");
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_before_use() {
        let (token_url, hits) = stub_token_server(
            StatusCode::OK,
            serde_json::json!({
                "access_token": "renewed",
                "expires_in": 3600,
            }),
        )
        .await;
        let vault = Arc::new(MemoryVault::new());
        seed_vault(&vault, &expired_tokens());
        let conn = connector(provider(&token_url), vault.clone());

        let token = conn.access_token().await.unwrap();

        assert_eq!(token, "renewed");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        // Refresh response omitted refresh_token; the stored one survives.
        let stored: TokenSet =
            serde_json::from_str(&vault.get("bank").unwrap().unwrap()).unwrap();
        assert_eq!(stored.refresh_token, "refresh-1");
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let (token_url, hits) = stub_token_server(
            StatusCode::OK,
            serde_json::json!({
                "access_token": "renewed",
                "expires_in": 3600,
            }),
        )
        .await;
        let vault = Arc::new(MemoryVault::new());
        seed_vault(&vault, &expired_tokens());
        let conn = Arc::new(connector(provider(&token_url), vault));

        let mut handles = vec![];
        for _ in 0..8 {
            let conn = conn.clone();
            handles.push(tokio::spawn(async move { conn.access_token().await }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "renewed");
        }

        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalid_grant_revokes_the_connector() {
        let (token_url, hits) = stub_token_server(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "invalid_grant" }),
        )
        .await;
        let vault = Arc::new(MemoryVault::new());
        seed_vault(&vault, &expired_tokens());
        let conn = connector(provider(&token_url), vault);

        let err = conn.access_token().await.unwrap_err();

        assert!(matches!(err, SyncError::AuthExpired));
        assert!(conn.revoked().await);
        // Permanent failure is never retried.
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // Subsequent calls fail fast without touching the network.
        let err = conn.access_token().await.unwrap_err();
        assert!(matches!(err, SyncError::AuthExpired));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_drops_vault_tokens() {
        let vault = Arc::new(MemoryVault::new());
        seed_vault(&vault, &expired_tokens());
        let conn = connector(provider("https://auth.test/token"), vault.clone());

        conn.disconnect().await.unwrap();

        assert!(vault.get("bank").unwrap().is_none());
        // With nothing on file the next call demands re-consent.
        assert!(matches!(
            conn.access_token().await.unwrap_err(),
            SyncError::AuthExpired
        ));
    }

    #[tokio::test]
    async fn missing_credential_requires_reconsent() {
        let conn = connector(provider("https://auth.test/token"), Arc::new(MemoryVault::new()));

        assert!(matches!(
            conn.access_token().await.unwrap_err(),
            SyncError::AuthExpired
        ));
    }
}
