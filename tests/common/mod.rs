//! Common test utilities and helpers for integration tests

#![allow(dead_code)]

use std::sync::Arc;

use sportswire_sync::config::{Config, HttpClientConfig, OAuthProviderConfig, RetryConfig};
use sportswire_sync::content::ContentApiClient;
use sportswire_sync::database::SqliteDatabase;
use sportswire_sync::http::ResilientClient;
use sportswire_sync::models::TrackedEntity;
use sportswire_sync::oauth::OAuthManager;
use sportswire_sync::sync::SyncEngine;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Create an in-memory database for testing
pub async fn create_test_database() -> Arc<SqliteDatabase> {
    Arc::new(
        SqliteDatabase::in_memory()
            .await
            .expect("Failed to create test database"),
    )
}

/// Client that retries quickly so failure paths stay fast
pub fn create_test_client() -> ResilientClient {
    let retry = RetryConfig {
        max_retries: 1,
        base_delay_ms: 1,
        max_delay_ms: 5,
        ..RetryConfig::default()
    };
    ResilientClient::new(HttpClientConfig::default(), retry).expect("Failed to build client")
}

/// Config pointing the content API at a mock server
///
/// Tracks `reds` (id 501, enabled) and `blues` (id 502, disabled).
pub fn create_test_config(content_base_url: &str) -> Config {
    let mut config = Config::default();
    config.content_api.base_url = content_base_url.to_string();
    config.content_api.api_key = Some("test-key".to_string());
    config.sync.inter_league_pause_ms = 0;
    config.entities = vec![
        TrackedEntity::new("reds", "Reds")
            .with_league(10)
            .with_identifiers(vec![501]),
        TrackedEntity::new("blues", "Blues")
            .with_league(10)
            .with_identifiers(vec![502])
            .disabled(),
    ];
    config
}

/// OAuth provider registration whose endpoints live on a mock server
pub fn create_provider_config(server_uri: &str) -> OAuthProviderConfig {
    OAuthProviderConfig {
        client_id: "client-id".to_string(),
        client_secret: "client-secret".to_string(),
        redirect_uri: "https://cms.example.com/oauth/callback".to_string(),
        authorize_url: Some(format!("{}/authorize", server_uri)),
        token_url: Some(format!("{}/token", server_uri)),
        api_url: Some(server_uri.to_string()),
        scopes: Vec::new(),
        refresh_buffer_secs: None,
    }
}

/// Engine backed by the real content client and an in-memory database
pub fn create_test_engine(config: &Config, db: Arc<SqliteDatabase>) -> SyncEngine {
    let source = ContentApiClient::new(config.content_api.clone(), create_test_client());
    SyncEngine::new(config, Arc::new(source), db.clone(), db.clone(), db)
}

/// OAuth manager over the given database
pub fn create_test_oauth(config: &Config, db: Arc<SqliteDatabase>) -> Arc<OAuthManager> {
    Arc::new(OAuthManager::new(
        db.clone(),
        db,
        create_test_client(),
        config.oauth.clone(),
    ))
}

/// Mount the content API token endpoint
pub async fn mount_content_token(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "token": "content-token",
            "expires_in": 604800
        })))
        .mount(server)
        .await;
}

/// Wire-format content item
pub fn wire_item(id: &str, headline: &str, home: u64, last_modified: &str) -> serde_json::Value {
    serde_json::json!({
        "id": id,
        "headline": headline,
        "body": "<p>body</p>",
        "storyType": "story",
        "league": {"id": 10},
        "homeTeam": {"id": home},
        "lastModified": last_modified
    })
}
