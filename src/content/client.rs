//! Upstream content API client
//!
//! Exchanges the API key for a bearer token, caches it, and fetches content
//! windows one league at a time.
//!
//! # Endpoints
//!
//! - `POST {base_url}/token` with `{"api_key": ...}`
//! - `GET {base_url}/content[/{league_id}]?since=<ISO-8601 UTC>`

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::ContentApiConfig;
use crate::error::{FetchError, HttpError};
use crate::http::{HttpResponse, ResilientClient, RetryableRequest};
use crate::models::{
    expiry_after, ContentWindow, ContentWindowQuery, EntityId, ImageDescriptor, LeagueId,
    RawContentItem, RejectedItem,
};

/// Source of content windows
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContentSource: Send + Sync {
    /// Fetch the items of one window, in upstream order
    ///
    /// Elements that fail to decode are returned as rejects rather than
    /// failing the window.
    async fn fetch(&self, query: &ContentWindowQuery) -> Result<ContentWindow, FetchError>;
}

#[derive(Debug, Clone)]
struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(alias = "access_token")]
    token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireId {
    Number(u64),
    Text(String),
}

impl WireId {
    fn into_string(self) -> String {
        match self {
            WireId::Number(n) => n.to_string(),
            WireId::Text(s) => s,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireRef {
    id: u64,
}

#[derive(Debug, Deserialize)]
struct WireImage {
    url: String,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireItem {
    id: WireId,
    #[serde(default)]
    headline: String,
    #[serde(default)]
    body: String,
    #[serde(default)]
    byline: Option<String>,
    #[serde(default)]
    story_type: Option<String>,
    #[serde(default)]
    league: Option<WireRef>,
    #[serde(default)]
    home_team: Option<WireRef>,
    #[serde(default)]
    away_team: Option<WireRef>,
    #[serde(default)]
    images: Vec<WireImage>,
    #[serde(default)]
    last_modified: Option<DateTime<Utc>>,
}

impl WireItem {
    /// Decode one window element, keeping its id for the reject when possible
    fn decode(value: serde_json::Value) -> Result<Self, RejectedItem> {
        let external_id = match value.get("id") {
            Some(serde_json::Value::String(s)) => Some(s.clone()),
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        serde_json::from_value(value).map_err(|e| RejectedItem {
            external_id,
            reason: e.to_string(),
        })
    }

    fn into_item(self, received_at: DateTime<Utc>) -> RawContentItem {
        let team = |t: Option<WireRef>| -> Option<EntityId> { t.map(|r| r.id) };
        RawContentItem {
            external_id: self.id.into_string(),
            headline: self.headline,
            body: self.body,
            byline: self.byline.filter(|b| !b.is_empty()),
            home_entity_id: team(self.home_team),
            away_entity_id: team(self.away_team),
            league_id: self.league.map(|l| l.id),
            content_type: self.story_type.unwrap_or_else(|| "story".to_string()),
            updated_at: self.last_modified.unwrap_or(received_at),
            image: self.images.into_iter().next().map(|i| ImageDescriptor {
                url: i.url,
                caption: i.caption,
                width: i.width,
                height: i.height,
            }),
        }
    }
}

/// HTTP client for the content API
pub struct ContentApiClient {
    config: ContentApiConfig,
    client: ResilientClient,
    token: RwLock<Option<CachedToken>>,
    acquire: Mutex<()>,
}

impl ContentApiClient {
    pub fn new(config: ContentApiConfig, client: ResilientClient) -> Self {
        Self {
            config,
            client,
            token: RwLock::new(None),
            acquire: Mutex::new(()),
        }
    }

    fn base_url(&self) -> &str {
        self.config.base_url.trim_end_matches('/')
    }

    fn renewal_buffer(&self) -> Duration {
        Duration::seconds(self.config.token_renewal_buffer_secs as i64)
    }

    fn content_url(&self, league: Option<LeagueId>) -> String {
        match league {
            Some(id) => format!("{}/content/{}", self.base_url(), id),
            None => format!("{}/content", self.base_url()),
        }
    }

    async fn cached_token(&self) -> Option<String> {
        let guard = self.token.read().await;
        guard
            .as_ref()
            .filter(|t| t.expires_at - Utc::now() > self.renewal_buffer())
            .map(|t| t.token.clone())
    }

    /// Bearer token, acquiring a new one when the cache is empty or near expiry
    async fn bearer_token(&self) -> Result<String, HttpError> {
        if let Some(token) = self.cached_token().await {
            return Ok(token);
        }

        let _guard = self.acquire.lock().await;
        if let Some(token) = self.cached_token().await {
            return Ok(token);
        }

        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                HttpError::InvalidRequest("content API key not configured".to_string())
            })?;

        let request = RetryableRequest::post(format!("{}/token", self.base_url()))
            .json(serde_json::json!({ "api_key": api_key }));
        let response = self.client.send(&request).await?;
        let body: TokenBody = response.json()?;
        if body.token.is_empty() {
            return Err(HttpError::Decode {
                url: response.url,
                message: "empty token".to_string(),
            });
        }

        let ttl = body
            .expires_in
            .filter(|secs| *secs > 0)
            .unwrap_or(self.config.token_ttl_secs as i64);
        let expires_at = expiry_after(Utc::now(), ttl);
        info!(expires_at = %expires_at, "Content API token acquired");

        *self.token.write().await = Some(CachedToken {
            token: body.token.clone(),
            expires_at,
        });
        Ok(body.token)
    }

    async fn invalidate_token(&self) {
        *self.token.write().await = None;
    }

    async fn get_content(
        &self,
        query: &ContentWindowQuery,
        token: &str,
    ) -> Result<HttpResponse, HttpError> {
        let mut request = RetryableRequest::get(self.content_url(query.league)).bearer_auth(token);
        if let Some(since) = query.since_param() {
            request = request.query("since", since);
        }
        self.client.send(&request).await
    }
}

fn is_unauthorized(err: &HttpError) -> bool {
    err.status() == Some(401)
}

#[async_trait]
impl ContentSource for ContentApiClient {
    async fn fetch(&self, query: &ContentWindowQuery) -> Result<ContentWindow, FetchError> {
        let token = self.bearer_token().await.map_err(FetchError::AuthFailed)?;

        let response = match self.get_content(query, &token).await {
            Ok(response) => response,
            Err(err) if is_unauthorized(&err) => {
                warn!(league = ?query.league, "Content API rejected cached token, re-acquiring");
                self.invalidate_token().await;
                let token = self.bearer_token().await.map_err(FetchError::AuthFailed)?;
                match self.get_content(query, &token).await {
                    Ok(response) => response,
                    Err(err) if is_unauthorized(&err) => return Err(FetchError::AuthFailed(err)),
                    Err(err) => return Err(FetchError::UpstreamError(err)),
                }
            }
            Err(err) => return Err(FetchError::UpstreamError(err)),
        };

        let elements: Vec<serde_json::Value> = response.json().map_err(|e| match e {
            HttpError::Decode { message, .. } => FetchError::InvalidData(message),
            other => FetchError::InvalidData(other.to_string()),
        })?;

        let received_at = Utc::now();
        let mut window = ContentWindow::default();
        for element in elements {
            match WireItem::decode(element) {
                Ok(wire) => window.items.push(wire.into_item(received_at)),
                Err(rejected) => {
                    warn!(
                        league = ?query.league,
                        external_id = ?rejected.external_id,
                        reason = %rejected.reason,
                        "Skipping undecodable content item"
                    );
                    window.rejected.push(rejected);
                }
            }
        }

        debug!(
            league = ?query.league,
            since = ?query.since_param(),
            items = window.items.len(),
            rejected = window.rejected.len(),
            "Fetched content window"
        );
        Ok(window)
    }
}
