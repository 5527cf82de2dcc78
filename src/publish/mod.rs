//! Social publishing of newly created records
//!
//! Publishers are invoked by the sync engine after each successful create.
//! A failed publish never changes the run's item counts.

pub mod facebook;
pub mod twitter;

pub use facebook::FacebookPublisher;
pub use twitter::TwitterPublisher;

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::PublishConfig;
use crate::error::PublishError;
use crate::http::ResilientClient;
use crate::models::{ContentRecord, RecordId};
use crate::oauth::OAuthManager;

/// Announces a newly imported record on a social channel
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SocialPublisher: Send + Sync {
    /// Short name used in logs, e.g. `twitter`
    fn name(&self) -> &'static str;

    async fn publish(&self, record: &ContentRecord, id: RecordId) -> Result<(), PublishError>;
}

/// Link to the published article, if a template is configured
pub fn article_url(template: Option<&str>, record: &ContentRecord) -> Option<String> {
    template.map(|t| {
        t.replace("{external_id}", &record.external_id)
            .replace("{entity}", record.entity_key.as_str())
    })
}

/// Publishers enabled in the configuration
pub fn build_publishers(
    config: &PublishConfig,
    oauth: Arc<OAuthManager>,
    client: ResilientClient,
) -> Vec<Arc<dyn SocialPublisher>> {
    let mut publishers: Vec<Arc<dyn SocialPublisher>> = Vec::new();

    if config.twitter.enabled {
        publishers.push(Arc::new(TwitterPublisher::new(
            oauth.clone(),
            client.clone(),
            config.twitter.api_url.clone(),
            config.article_url_template.clone(),
        )));
    }

    if config.facebook.enabled {
        publishers.push(Arc::new(FacebookPublisher::new(
            oauth,
            client,
            config.facebook.api_url.clone(),
            config.facebook.page_id.clone(),
            config.article_url_template.clone(),
        )));
    }

    publishers
}
