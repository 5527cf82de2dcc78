//! Twitter publisher

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::{article_url, SocialPublisher};
use crate::error::PublishError;
use crate::http::{ResilientClient, RetryableRequest};
use crate::models::{ContentRecord, Provider, RecordId};
use crate::oauth::OAuthManager;

const DEFAULT_API_URL: &str = "https://api.twitter.com/2";

/// Post length limit in characters
const MAX_TWEET_CHARS: usize = 280;

/// Posts a headline and link as a tweet
pub struct TwitterPublisher {
    oauth: Arc<OAuthManager>,
    client: ResilientClient,
    api_url: String,
    url_template: Option<String>,
}

impl TwitterPublisher {
    pub fn new(
        oauth: Arc<OAuthManager>,
        client: ResilientClient,
        api_url: Option<String>,
        url_template: Option<String>,
    ) -> Self {
        Self {
            oauth,
            client,
            api_url: api_url.unwrap_or_else(|| DEFAULT_API_URL.to_string()),
            url_template,
        }
    }
}

/// Headline followed by the link, headline shortened to fit the limit
fn compose_text(headline: &str, link: Option<&str>) -> String {
    let reserved = link.map_or(0, |l| l.chars().count() + 1);
    let budget = MAX_TWEET_CHARS.saturating_sub(reserved);

    let mut text: String = if headline.chars().count() > budget {
        let mut cut: String = headline.chars().take(budget.saturating_sub(1)).collect();
        cut.push('…');
        cut
    } else {
        headline.to_string()
    };

    if let Some(link) = link {
        text.push(' ');
        text.push_str(link);
    }
    text
}

#[async_trait]
impl SocialPublisher for TwitterPublisher {
    fn name(&self) -> &'static str {
        "twitter"
    }

    async fn publish(&self, record: &ContentRecord, id: RecordId) -> Result<(), PublishError> {
        let token = self.oauth.get_valid_token(Provider::Twitter).await?;
        let link = article_url(self.url_template.as_deref(), record);
        let text = compose_text(&record.headline, link.as_deref());

        let request = RetryableRequest::post(format!("{}/tweets", self.api_url.trim_end_matches('/')))
            .bearer_auth(token)
            .json(serde_json::json!({ "text": text }));
        self.client.send(&request).await?;

        info!(record_id = id, external_id = %record.external_id, "Published to Twitter");
        Ok(())
    }
}
