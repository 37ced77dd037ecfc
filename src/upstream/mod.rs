pub mod aggregator;
pub mod mailbox;

use std::sync::Arc;
use std::time::Duration;

use axum::async_trait;
use tracing::warn;

use crate::core::{RawBankTransaction, RawEmail};
use crate::error::SyncError;
use crate::oauth::{backoff_delay, OAuthConnector};

const MAX_REQUEST_ATTEMPTS: u32 = 3;

// Upper bound on a server-requested wait; anything longer would hold a sync
// worker past the session deadline.
const MAX_RETRY_AFTER_SECS: u64 = 30;

/// One page of upstream transactions. `next_cursor` is `None` once the feed
/// is exhausted.
#[derive(Debug, Clone)]
pub struct TransactionPage {
    pub transactions: Vec<RawBankTransaction>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MailPage {
    pub emails: Vec<RawEmail>,
    pub next_cursor: Option<String>,
}

#[async_trait]
pub trait TransactionSource {
    async fn page(
        &self,
        connection_external_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<TransactionPage, SyncError>;
}

#[async_trait]
pub trait MailSource {
    async fn page(&self, cursor: Option<&str>, limit: u32) -> Result<MailPage, SyncError>;
}

/// Bearer-authorized REST client shared by the aggregator and mailbox
/// sources. Retries transient failures with bounded backoff: 429 honors
/// `Retry-After` when present, a 401/403 triggers exactly one token refresh
/// before the request is retried, and 5xx responses back off exponentially.
pub struct ApiClient {
    http: reqwest::Client,
    auth: Arc<OAuthConnector>,
    base: String,
}

impl ApiClient {
    pub fn new(auth: Arc<OAuthConnector>, base: &str, request_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .expect("construct http client");

        ApiClient {
            http,
            auth,
            base: base.trim_end_matches('/').to_string(),
        }
    }

    pub async fn get_json(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<serde_json::Value, SyncError> {
        let resp = self
            .execute(reqwest::Method::GET, path, Some(query), None)
            .await?;
        Ok(resp.json().await?)
    }

    pub async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, SyncError> {
        let resp = self
            .execute(reqwest::Method::POST, path, None, Some(body))
            .await?;
        Ok(resp.json().await?)
    }

    pub async fn delete(&self, path: &str) -> Result<(), SyncError> {
        self.execute(reqwest::Method::DELETE, path, None, None)
            .await?;
        Ok(())
    }

    async fn execute(
        &self,
        method: reqwest::Method,
        path: &str,
        query: Option<&[(&str, String)]>,
        body: Option<&serde_json::Value>,
    ) -> Result<reqwest::Response, SyncError> {
        let url = format!("{}{}", self.base, path);
        let mut refreshed = false;
        let mut attempt = 0u32;

        loop {
            let token = self.auth.access_token().await?;
            let mut req = self.http.request(method.clone(), &url).bearer_auth(token);
            if let Some(q) = query {
                req = req.query(q);
            }
            if let Some(b) = body {
                req = req.json(b);
            }

            let resp = match req.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    attempt += 1;
                    if attempt >= MAX_REQUEST_ATTEMPTS {
                        return Err(e.into());
                    }
                    warn!(%url, attempt, error = %e, "request failed, retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                    continue;
                }
            };

            let status = resp.status();
            if status.is_success() {
                return Ok(resp);
            }

            match status.as_u16() {
                401 | 403 if !refreshed => {
                    warn!(%url, "unauthorized, refreshing access token once");
                    self.auth.force_refresh().await?;
                    refreshed = true;
                }
                401 | 403 => {
                    return Err(SyncError::TemporaryAuth(
                        "still unauthorized after token refresh".to_string(),
                    ));
                }
                429 => {
                    let retry_after = retry_after(&resp);
                    attempt += 1;
                    if attempt >= MAX_REQUEST_ATTEMPTS {
                        return Err(SyncError::RateLimited { retry_after });
                    }
                    let delay = retry_after.unwrap_or_else(|| backoff_delay(attempt));
                    warn!(%url, attempt, ?delay, "rate limited, backing off");
                    tokio::time::sleep(delay).await;
                }
                500..=599 => {
                    attempt += 1;
                    if attempt >= MAX_REQUEST_ATTEMPTS {
                        return Err(SyncError::Upstream {
                            status: status.as_u16(),
                            body: resp.text().await.unwrap_or_default(),
                        });
                    }
                    warn!(%url, attempt, %status, "upstream error, retrying");
                    tokio::time::sleep(backoff_delay(attempt)).await;
                }
                _ => {
                    return Err(SyncError::Upstream {
                        status: status.as_u16(),
                        body: resp.text().await.unwrap_or_default(),
                    });
                }
            }
        }
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(bounded_retry_after)
}

fn bounded_retry_after(secs: u64) -> Duration {
    Duration::from_secs(secs.min(MAX_RETRY_AFTER_SECS))
}
