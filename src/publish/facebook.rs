//! Facebook page publisher
//!
//! Posts with the page access token stored in the Facebook credential's
//! payload, not with the user token.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{article_url, SocialPublisher};
use crate::error::PublishError;
use crate::http::{ResilientClient, RetryableRequest};
use crate::models::{ContentRecord, Provider, RecordId};
use crate::oauth::OAuthManager;

const DEFAULT_GRAPH_URL: &str = "https://graph.facebook.com/v19.0";

/// Posts a headline and link to a managed page's feed
pub struct FacebookPublisher {
    oauth: Arc<OAuthManager>,
    client: ResilientClient,
    graph_url: String,
    page_id: Option<String>,
    url_template: Option<String>,
}

impl FacebookPublisher {
    pub fn new(
        oauth: Arc<OAuthManager>,
        client: ResilientClient,
        graph_url: Option<String>,
        page_id: Option<String>,
        url_template: Option<String>,
    ) -> Self {
        Self {
            oauth,
            client,
            graph_url: graph_url.unwrap_or_else(|| DEFAULT_GRAPH_URL.to_string()),
            page_id,
            url_template,
        }
    }

    async fn page_token(&self, page_id: &str) -> Result<String, PublishError> {
        // Refreshes the user token first when it is close to expiry
        self.oauth.get_valid_token(Provider::Facebook).await?;
        let credential = self.oauth.credential(Provider::Facebook).await?;

        credential
            .payload
            .facebook_pages()
            .iter()
            .find(|p| p.id == page_id)
            .and_then(|p| p.access_token.clone())
            .ok_or_else(|| {
                PublishError::NotConfigured(format!(
                    "page {} is not managed by the connected account",
                    page_id
                ))
            })
    }
}

#[async_trait]
impl SocialPublisher for FacebookPublisher {
    fn name(&self) -> &'static str {
        "facebook"
    }

    async fn publish(&self, record: &ContentRecord, id: RecordId) -> Result<(), PublishError> {
        let page_id = self
            .page_id
            .as_deref()
            .ok_or_else(|| PublishError::NotConfigured("facebook page_id".to_string()))?;
        let page_token = self.page_token(page_id).await?;

        let mut body = serde_json::json!({ "message": record.headline });
        if let Some(link) = article_url(self.url_template.as_deref(), record) {
            body["link"] = serde_json::Value::String(link);
        }

        let url = format!("{}/{}/feed", self.graph_url.trim_end_matches('/'), page_id);
        let request = RetryableRequest::post(url).bearer_auth(page_token).json(body);
        self.client.send(&request).await?;

        info!(record_id = id, page_id = page_id, "Published to Facebook page");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpClientConfig, OAuthConfig, RetryConfig};
    use crate::database::SqliteDatabase;
    use crate::models::{EntityKey, FacebookPage, ProviderPayload};
    use chrono::Utc;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn record() -> ContentRecord {
        ContentRecord {
            external_id: "ext-1".to_string(),
            entity_key: EntityKey::from("reds"),
            league_id: None,
            headline: "Reds win".to_string(),
            body: String::new(),
            byline: None,
            content_type: "story".to_string(),
            image: None,
            source_updated_at: Utc::now(),
            imported_at: Utc::now(),
            import_source: "sportswire".to_string(),
        }
    }

    async fn oauth() -> Arc<OAuthManager> {
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let client = ResilientClient::new(HttpClientConfig::default(), RetryConfig::default()).unwrap();
        Arc::new(OAuthManager::new(db.clone(), db, client, OAuthConfig::default()))
    }

    fn client() -> ResilientClient {
        ResilientClient::new(
            HttpClientConfig::default(),
            RetryConfig {
                max_retries: 0,
                ..RetryConfig::default()
            },
        )
        .unwrap()
    }

    // Test 1: Posts to the page feed with the page token
    #[tokio::test]
    async fn test_publish_uses_page_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/4242/feed"))
            .and(header("authorization", "Bearer page-token"))
            .and(body_partial_json(serde_json::json!({
                "message": "Reds win",
                "link": "https://n.example.com/ext-1"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"id": "4242_1"})))
            .expect(1)
            .mount(&server)
            .await;

        let oauth = oauth().await;
        oauth
            .complete_handshake(
                Provider::Facebook,
                "user-token".to_string(),
                None,
                60 * 24 * 3600,
                ProviderPayload::Facebook {
                    pages: vec![FacebookPage {
                        id: "4242".to_string(),
                        name: "Reds News".to_string(),
                        access_token: Some("page-token".to_string()),
                    }],
                },
            )
            .await
            .unwrap();

        let publisher = FacebookPublisher::new(
            oauth,
            client(),
            Some(server.uri()),
            Some("4242".to_string()),
            Some("https://n.example.com/{external_id}".to_string()),
        );
        publisher.publish(&record(), 1).await.unwrap();
    }

    // Test 2: Unmanaged page disables the publisher
    #[tokio::test]
    async fn test_unmanaged_page() {
        let oauth = oauth().await;
        oauth
            .complete_handshake(
                Provider::Facebook,
                "user-token".to_string(),
                None,
                60 * 24 * 3600,
                ProviderPayload::Facebook { pages: vec![] },
            )
            .await
            .unwrap();

        let publisher = FacebookPublisher::new(oauth, client(), None, Some("1".to_string()), None);
        let err = publisher.publish(&record(), 1).await.unwrap_err();
        assert!(matches!(err, PublishError::NotConfigured(_)));
        assert!(err.disables_publisher());
    }

    // Test 3: Not connected disables the publisher
    #[tokio::test]
    async fn test_not_connected() {
        let publisher =
            FacebookPublisher::new(oauth().await, client(), None, Some("1".to_string()), None);
        let err = publisher.publish(&record(), 1).await.unwrap_err();
        assert!(matches!(err, PublishError::Credential(_)));
        assert!(err.disables_publisher());
    }
}
