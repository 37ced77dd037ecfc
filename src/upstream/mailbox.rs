use std::sync::Arc;
use std::time::Duration;

use axum::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::warn;

use crate::core::RawEmail;
use crate::error::SyncError;
use crate::oauth::OAuthConnector;

use super::{ApiClient, MailPage, MailSource};

/// Paginated message listing from the mail provider, bodies already decoded
/// to plain text server-side.
pub struct MailboxClient {
    api: ApiClient,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<ApiMessage>,
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    id: String,
    subject: String,
    from: String,
    #[serde(rename = "receivedAt")]
    received_at: String,
    body: String,
}

impl MailboxClient {
    pub fn new(auth: Arc<OAuthConnector>, api_url: &str, request_timeout: Duration) -> Self {
        MailboxClient {
            api: ApiClient::new(auth, api_url, request_timeout),
        }
    }
}

#[async_trait]
impl MailSource for MailboxClient {
    async fn page(&self, cursor: Option<&str>, limit: u32) -> Result<MailPage, SyncError> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }

        let body = self.api.get_json("/messages", &query).await?;
        let list: MessageList = serde_json::from_value(body).map_err(|e| SyncError::Upstream {
            status: 200,
            body: format!("unexpected message list shape: {}", e),
        })?;

        let emails = list
            .data
            .into_iter()
            .map(|m| {
                let received_at = DateTime::parse_from_rfc3339(&m.received_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| {
                        warn!(message = %m.id, "unparseable receivedAt, using now");
                        Utc::now()
                    });

                RawEmail {
                    id: m.id,
                    subject: m.subject,
                    from: m.from,
                    received_at,
                    body: m.body,
                }
            })
            .collect();

        Ok(MailPage {
            emails,
            next_cursor: list.next,
        })
    }
}
