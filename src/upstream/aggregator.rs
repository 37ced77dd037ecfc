use std::sync::Arc;
use std::time::Duration;

use axum::async_trait;
use serde::Deserialize;

use crate::catalog::Institution;
use crate::error::SyncError;
use crate::oauth::OAuthConnector;
use crate::core::RawBankTransaction;

use super::{ApiClient, TransactionPage, TransactionSource};

/// Client for the bank aggregator REST surface: institutions, connections,
/// and the paginated transaction feed.
pub struct AggregatorClient {
    api: ApiClient,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: Vec<serde_json::Value>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiInstitution {
    id: String,
    name: String,
    country: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiConnection {
    pub id: String,
    pub status: String,
}

#[derive(Debug, Deserialize)]
struct ApiTransaction {
    id: String,
    #[serde(rename = "postDate")]
    post_date: String,
    amount: String,
    currency: Option<String>,
    description: String,
}

impl AggregatorClient {
    pub fn new(auth: Arc<OAuthConnector>, api_url: &str, request_timeout: Duration) -> Self {
        AggregatorClient {
            api: ApiClient::new(auth, api_url, request_timeout),
        }
    }

    pub async fn institutions(&self) -> Result<Vec<Institution>, SyncError> {
        let body = self.api.get_json("/institutions", &[]).await?;
        let list: ListResponse = decode(body)?;

        let mut institutions = Vec::with_capacity(list.data.len());
        for item in list.data {
            let ins: ApiInstitution = decode(item)?;
            institutions.push(Institution {
                id: ins.id,
                name: ins.name,
                country: ins.country,
            });
        }

        Ok(institutions)
    }

    /// Creates a connection upstream. The aggregator verifies the login
    /// asynchronously; the returned status is almost always "pending".
    pub async fn create_connection(
        &self,
        institution_id: &str,
        login_id: &str,
        password: &str,
    ) -> Result<ApiConnection, SyncError> {
        let body = serde_json::json!({
            "institutionId": institution_id,
            "loginId": login_id,
            "password": password,
        });
        decode(self.api.post_json("/connections", &body).await?)
    }

    pub async fn connection_status(&self, external_id: &str) -> Result<ApiConnection, SyncError> {
        decode(
            self.api
                .get_json(&format!("/connections/{}", external_id), &[])
                .await?,
        )
    }

    pub async fn delete_connection(&self, external_id: &str) -> Result<(), SyncError> {
        self.api
            .delete(&format!("/connections/{}", external_id))
            .await
    }
}

#[async_trait]
impl TransactionSource for AggregatorClient {
    async fn page(
        &self,
        connection_external_id: &str,
        cursor: Option<&str>,
        limit: u32,
    ) -> Result<TransactionPage, SyncError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let body = self
            .api
            .get_json(
                &format!("/connections/{}/transactions", connection_external_id),
                &query,
            )
            .await?;
        let list: ListResponse = decode(body)?;

        let mut transactions = Vec::with_capacity(list.data.len());
        for item in list.data {
            let raw_payload = item.clone();
            let tx: ApiTransaction = decode(item)?;
            transactions.push(RawBankTransaction {
                external_id: tx.id,
                connection_id: connection_external_id.to_string(),
                posted_at: tx.post_date,
                amount: tx.amount,
                currency: tx.currency,
                description: tx.description,
                raw_payload,
            });
        }

        Ok(TransactionPage {
            transactions,
            next_cursor: list.next,
        })
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> Result<T, SyncError> {
    serde_json::from_value(value).map_err(|e| SyncError::Upstream {
        status: 200,
        body: format!("unexpected response shape: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::{Path, Query, State};
    use axum::http::{header, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::{get, post};
    use axum::{Json, Router};

    use crate::settings::Provider;
    use crate::vault::{CredentialVault, MemoryVault};

    use super::*;

    #[derive(Clone)]
    struct Stub {
        transaction_hits: Arc<AtomicUsize>,
        token_hits: Arc<AtomicUsize>,
        // Number of leading requests answered 401 before success.
        unauthorized_first: usize,
        // Number of leading requests answered 429 before success.
        throttled_first: usize,
        // When set, throttled responses carry a Retry-After header.
        retry_after_secs: Option<u64>,
    }

    async fn transactions(
        State(stub): State<Stub>,
        Path(connection): Path<String>,
        Query(params): Query<std::collections::HashMap<String, String>>,
    ) -> Response {
        let hit = stub.transaction_hits.fetch_add(1, Ordering::SeqCst);

        if hit < stub.unauthorized_first {
            return (StatusCode::UNAUTHORIZED, Json(serde_json::json!({}))).into_response();
        }
        if hit < stub.unauthorized_first + stub.throttled_first {
            if let Some(secs) = stub.retry_after_secs {
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    [(header::RETRY_AFTER, secs.to_string())],
                    Json(serde_json::json!({})),
                )
                    .into_response();
            }
            return (StatusCode::TOO_MANY_REQUESTS, Json(serde_json::json!({}))).into_response();
        }

        let page = match params.get("cursor").map(String::as_str) {
            None => serde_json::json!({
                "data": [{
                    "id": format!("{}-tx-1", connection),
                    "postDate": "2025-01-03",
                    "amount": "-42.00",
                    "currency": "AUD",
                    "description": "BUNNINGS HARDWARE",
                }],
                "next": "page-2",
            }),
            Some("page-2") => serde_json::json!({
                "data": [{
                    "id": format!("{}-tx-2", connection),
                    "postDate": "2025-01-04",
                    "amount": "-12.80",
                    "currency": "AUD",
                    "description": "COLES GROCERIES",
                }],
                "next": null,
            }),
            Some(other) => panic!("unexpected cursor {}", other),
        };

        (StatusCode::OK, Json(page)).into_response()
    }

    async fn token(State(stub): State<Stub>) -> Json<serde_json::Value> {
        stub.token_hits.fetch_add(1, Ordering::SeqCst);
        Json(serde_json::json!({
            "access_token": "renewed",
            "refresh_token": "refresh-2",
            "expires_in": 3600,
        }))
    }

    async fn stub_aggregator(stub: Stub) -> SocketAddr {
        let app = Router::new()
            .route("/connections/:id/transactions", get(transactions))
            .route("/token", post(token))
            .with_state(stub);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        addr
    }

    fn client_against(addr: SocketAddr, vault: Arc<MemoryVault>) -> AggregatorClient {
        let provider = Provider {
            client_id: "client".to_string(),
            secret: "secret".to_string(),
            auth_url: format!("http://{}/authorize", addr),
            token_url: format!("http://{}/token", addr),
            api_url: format!("http://{}", addr),
            redirect_uri: "http://127.0.0.1:4545/callback".to_string(),
            scopes: vec![],
        };
        let auth = Arc::new(OAuthConnector::new(
            provider.clone(),
            vault,
            "bank",
            300,
            Duration::from_secs(5),
        ));

        AggregatorClient::new(auth, &provider.api_url, Duration::from_secs(5))
    }

    fn vault_with_valid_token() -> Arc<MemoryVault> {
        let vault = Arc::new(MemoryVault::new());
        let tokens = crate::oauth::TokenSet {
            access_token: "valid".to_string(),
            refresh_token: "refresh-1".to_string(),
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        };
        vault
            .save("bank", &serde_json::to_string(&tokens).unwrap())
            .unwrap();

        vault
    }

    fn stub(unauthorized_first: usize, throttled_first: usize) -> Stub {
        Stub {
            transaction_hits: Arc::new(AtomicUsize::new(0)),
            token_hits: Arc::new(AtomicUsize::new(0)),
            unauthorized_first,
            throttled_first,
            retry_after_secs: None,
        }
    }

    #[tokio::test]
    async fn follows_pagination_cursor_to_exhaustion() {
        let addr = stub_aggregator(stub(0, 0)).await;
        let client = client_against(addr, vault_with_valid_token());

        let first = client.page("c1", None, 500).await.unwrap();
        assert_eq!(first.transactions.len(), 1);
        assert_eq!(first.transactions[0].external_id, "c1-tx-1");
        assert_eq!(first.next_cursor.as_deref(), Some("page-2"));

        let second = client
            .page("c1", first.next_cursor.as_deref(), 500)
            .await
            .unwrap();
        assert_eq!(second.transactions[0].external_id, "c1-tx-2");
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn unauthorized_page_refreshes_once_and_retries() {
        let s = stub(1, 0);
        let token_hits = s.token_hits.clone();
        let addr = stub_aggregator(s).await;
        let client = client_against(addr, vault_with_valid_token());

        let page = client.page("c1", None, 500).await.unwrap();

        assert_eq!(page.transactions[0].external_id, "c1-tx-1");
        assert_eq!(token_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limited_page_backs_off_and_retries() {
        let addr = stub_aggregator(stub(0, 1)).await;
        let client = client_against(addr, vault_with_valid_token());

        let page = client.page("c1", None, 500).await.unwrap();

        assert_eq!(page.transactions.len(), 1);
    }

    #[tokio::test]
    async fn rate_limited_page_waits_for_the_retry_after_header() {
        let mut s = stub(0, 1);
        // Two seconds distinguishes the header path from the one second
        // exponential fallback.
        s.retry_after_secs = Some(2);
        let addr = stub_aggregator(s).await;
        let client = client_against(addr, vault_with_valid_token());

        let started = std::time::Instant::now();
        let page = client.page("c1", None, 500).await.unwrap();

        assert_eq!(page.transactions.len(), 1);
        assert!(started.elapsed() >= Duration::from_millis(1900));
    }

    #[tokio::test]
    async fn raw_payload_is_preserved_for_audit() {
        let addr = stub_aggregator(stub(0, 0)).await;
        let client = client_against(addr, vault_with_valid_token());

        let page = client.page("c1", None, 500).await.unwrap();

        assert_eq!(
            page.transactions[0].raw_payload["description"],
            "BUNNINGS HARDWARE"
        );
    }
}
