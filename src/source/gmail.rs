//! Gmail source adapter
//!
//! REST adapter over the Gmail v1 API using a long-lived pooled
//! reqwest::Client. Listing applies the configured finance search query
//! on top of an `after:` clause derived from the cursor watermark;
//! message content is flattened from the multipart payload.

use super::{FetchedMessage, MailSource, MessagePage, MessageSummary, SourceError};
use crate::models::SyncCursor;
use crate::vault::Credential;
use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_BASE_URL: &str = "https://gmail.googleapis.com/gmail/v1";

pub struct GmailSource {
    client: Client,
    base_url: String,
    query: String,
}

impl GmailSource {
    pub fn new(query: String, request_timeout: Duration) -> Self {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(request_timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: DEFAULT_BASE_URL.to_string(),
            query,
        }
    }

    /// Point the adapter at a different endpoint (tests, proxies).
    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url.trim_end_matches('/').to_string();
        self
    }

    fn map_status(status: StatusCode, retry_after: Option<Duration>) -> Option<SourceError> {
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Some(SourceError::AuthExpired);
        }
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Some(SourceError::RateLimited { retry_after });
        }
        if status.is_server_error() {
            return Some(SourceError::Transient(format!("gmail returned {}", status)));
        }
        None
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        credential: &Credential,
        url: &str,
        query: &[(&str, String)],
    ) -> std::result::Result<T, SourceError> {
        let response = self
            .client
            .get(url)
            .bearer_auth(&credential.access_token)
            .query(query)
            .send()
            .await
            .map_err(|e| SourceError::Transient(format!("gmail request failed: {}", e)))?;

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);

        if let Some(err) = Self::map_status(response.status(), retry_after) {
            warn!(status = %response.status(), "Gmail API error response");
            return Err(err);
        }

        response
            .json::<T>()
            .await
            .map_err(|e| SourceError::Transient(format!("gmail parse error: {}", e)))
    }

    async fn fetch_internal_date(
        &self,
        credential: &Credential,
        id: &str,
    ) -> std::result::Result<i64, SourceError> {
        let url = format!("{}/users/me/messages/{}", self.base_url, id);
        let msg: GmailMessage = self
            .get_json(credential, &url, &[("format", "minimal".to_string())])
            .await?;
        Ok(msg.internal_date_ms())
    }
}

#[async_trait]
impl MailSource for GmailSource {
    async fn list_messages_since(
        &self,
        credential: &Credential,
        cursor: SyncCursor,
        page_token: Option<String>,
        page_size: usize,
    ) -> std::result::Result<MessagePage, SourceError> {
        // Gmail's `after:` operator has second granularity; the exact
        // watermark cut happens below after internal dates are known.
        let after_secs = cursor.watermark_ms / 1000;
        let q = if after_secs > 0 {
            format!("{} after:{}", self.query, after_secs)
        } else {
            self.query.clone()
        };

        let url = format!("{}/users/me/messages", self.base_url);
        let mut params: Vec<(&str, String)> = vec![
            ("q", q),
            ("maxResults", page_size.to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token));
        }

        let listing: GmailListResponse = self.get_json(credential, &url, &params).await?;
        debug!(
            listed = listing.messages.as_ref().map(|m| m.len()).unwrap_or(0),
            "Gmail listing page fetched"
        );

        let mut summaries = Vec::new();
        for entry in listing.messages.unwrap_or_default() {
            let internal_date_ms = self.fetch_internal_date(credential, &entry.id).await?;
            if internal_date_ms > cursor.watermark_ms {
                summaries.push(MessageSummary {
                    provider_message_id: entry.id,
                    internal_date_ms,
                });
            }
        }
        // Gmail lists newest-first; the pipeline wants oldest-first past
        // the cursor so the watermark only ever moves forward.
        summaries.sort_by_key(|s| s.internal_date_ms);

        Ok(MessagePage {
            messages: summaries,
            next_page_token: listing.next_page_token,
        })
    }

    async fn fetch_message(
        &self,
        credential: &Credential,
        provider_message_id: &str,
    ) -> std::result::Result<FetchedMessage, SourceError> {
        let url = format!("{}/users/me/messages/{}", self.base_url, provider_message_id);
        let msg: GmailMessage = self
            .get_json(credential, &url, &[("format", "full".to_string())])
            .await?;

        let headers = msg.headers();
        let body_text = msg
            .payload
            .as_ref()
            .map(|p| p.plain_text_parts())
            .unwrap_or_default();

        Ok(FetchedMessage {
            provider_message_id: msg.id.clone(),
            internal_date_ms: msg.internal_date_ms(),
            from_header: headers.get("from").cloned().unwrap_or_default(),
            subject: headers.get("subject").cloned().unwrap_or_default(),
            snippet: msg.snippet.unwrap_or_default(),
            body_text,
            list_unsubscribe: headers.get("list-unsubscribe").cloned(),
            fetched_at: Utc::now(),
        })
    }
}

//
// ================= Wire types =================
//

#[derive(Debug, Deserialize)]
struct GmailListResponse {
    messages: Option<Vec<GmailMessageRef>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GmailMessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GmailMessage {
    id: String,
    snippet: Option<String>,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    payload: Option<GmailPayload>,
}

impl GmailMessage {
    fn internal_date_ms(&self) -> i64 {
        self.internal_date
            .as_deref()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    fn headers(&self) -> std::collections::HashMap<String, String> {
        let mut out = std::collections::HashMap::new();
        if let Some(payload) = &self.payload {
            for h in payload.headers.iter().flatten() {
                out.insert(h.name.to_lowercase(), h.value.clone());
            }
        }
        out
    }
}

#[derive(Debug, Deserialize)]
struct GmailPayload {
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPayload>>,
}

impl GmailPayload {
    /// Walk the part tree collecting decoded text/plain bodies.
    fn plain_text_parts(&self) -> String {
        let mut texts = Vec::new();
        self.walk(&mut texts);
        texts.join("\n")
    }

    fn walk(&self, texts: &mut Vec<String>) {
        if self.mime_type.as_deref() == Some("text/plain") {
            if let Some(data) = self.body.as_ref().and_then(|b| b.data.as_deref()) {
                if let Ok(bytes) = URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')) {
                    texts.push(String::from_utf8_lossy(&bytes).into_owned());
                }
            }
        }
        for part in self.parts.iter().flatten() {
            part.walk(texts);
        }
    }
}

#[derive(Debug, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct GmailBody {
    data: Option<String>,
}
