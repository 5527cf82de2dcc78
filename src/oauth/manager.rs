//! OAuth session manager
//!
//! This module provides the credential lifecycle for outbound integrations:
//! the authorization-code handshake, on-demand refresh with at most one
//! in-flight refresh per provider, status reporting, and disconnect.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::providers::{
    authorization_url, code_exchange_request, long_lived_exchange_request, parse_payload,
    parse_token_response, payload_request, refresh_request, requires_reauth,
    ProviderRegistration,
};
use super::state::{generate_code_verifier, generate_state};
use crate::config::OAuthConfig;
use crate::database::{CredentialStore, ErrorLog};
use crate::error::{CredentialError, HttpError};
use crate::http::ResilientClient;
use crate::models::{
    expiry_after, Credential, CredentialStatus, ErrorLogEntry, Provider, ProviderPayload,
    TokenResponse,
};
use crate::telemetry::SyncMetrics;

/// Pending authorizations older than this are discarded
const PENDING_TTL_MINUTES: i64 = 10;

/// Query parameters delivered to the redirect URI
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

#[derive(Debug, Clone)]
struct PendingAuthorization {
    provider: Provider,
    code_verifier: Option<String>,
    created_at: DateTime<Utc>,
}

/// OAuth session manager
///
/// Hands out valid access tokens, refreshing them transparently. Callers
/// only ever receive copies of the access token.
pub struct OAuthManager {
    store: Arc<dyn CredentialStore>,
    errors: Arc<dyn ErrorLog>,
    client: ResilientClient,
    config: OAuthConfig,
    refresh_locks: HashMap<Provider, Mutex<()>>,
    pending: StdMutex<HashMap<String, PendingAuthorization>>,
    metrics: Option<Arc<SyncMetrics>>,
}

impl OAuthManager {
    /// Create a new OAuth session manager
    pub fn new(
        store: Arc<dyn CredentialStore>,
        errors: Arc<dyn ErrorLog>,
        client: ResilientClient,
        config: OAuthConfig,
    ) -> Self {
        let refresh_locks = Provider::ALL.iter().map(|p| (*p, Mutex::new(()))).collect();
        Self {
            store,
            errors,
            client,
            config,
            refresh_locks,
            pending: StdMutex::new(HashMap::new()),
            metrics: None,
        }
    }

    /// Count refreshes in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn registration(&self, provider: Provider) -> Result<ProviderRegistration, CredentialError> {
        self.config
            .provider(provider)
            .map(|c| ProviderRegistration::resolve(provider, c))
            .ok_or(CredentialError::NotConfigured(provider))
    }

    fn refresh_buffer(&self, provider: Provider) -> Duration {
        let secs = self
            .config
            .provider(provider)
            .and_then(|c| c.refresh_buffer_secs)
            .unwrap_or_else(|| provider.default_refresh_buffer_secs());
        Duration::seconds(secs as i64)
    }

    /// Return an access token that is valid for at least the refresh buffer
    ///
    /// Refreshes first when the stored token expires within the buffer.
    pub async fn get_valid_token(&self, provider: Provider) -> Result<String, CredentialError> {
        let credential = self
            .store
            .get_credential(provider)
            .await?
            .ok_or(CredentialError::NotConnected(provider))?;

        if !credential.needs_refresh(Utc::now(), self.refresh_buffer(provider)) {
            return Ok(credential.access_token);
        }

        debug!(provider = %provider, "Token inside refresh buffer");
        let lock = &self.refresh_locks[&provider];
        let _guard = lock.lock().await;

        // Another caller may have refreshed while we waited
        let current = self
            .store
            .get_credential(provider)
            .await?
            .ok_or(CredentialError::NotConnected(provider))?;
        if !current.needs_refresh(Utc::now(), self.refresh_buffer(provider)) {
            debug!(provider = %provider, "Token already refreshed by concurrent caller");
            return Ok(current.access_token);
        }

        let refreshed = self.refresh_locked(provider, current).await?;
        Ok(refreshed.access_token)
    }

    /// Refresh a provider's token now, regardless of its expiry
    pub async fn refresh(&self, provider: Provider) -> Result<Credential, CredentialError> {
        let lock = &self.refresh_locks[&provider];
        let _guard = lock.lock().await;

        let current = self
            .store
            .get_credential(provider)
            .await?
            .ok_or(CredentialError::NotConnected(provider))?;
        self.refresh_locked(provider, current).await
    }

    /// Perform the refresh; the caller holds the provider's refresh lock
    async fn refresh_locked(
        &self,
        provider: Provider,
        current: Credential,
    ) -> Result<Credential, CredentialError> {
        let registration = match self.registration(provider) {
            Ok(registration) => registration,
            Err(err) => {
                self.log_failure(provider, "refresh", &err, None).await;
                return Err(err);
            }
        };

        let request = match refresh_request(&registration, &current) {
            Ok(request) => request,
            Err(err) => {
                self.log_failure(provider, "refresh", &err, None).await;
                return Err(err);
            }
        };

        let result = match self.client.send(&request).await {
            Ok(response) => parse_token_response(provider, &response),
            Err(err) => Err(err),
        };

        match result {
            Ok(token) => {
                let updated = apply_refresh(current, token, Utc::now());
                self.store.put_credential(&updated).await?;
                if let Some(metrics) = &self.metrics {
                    metrics.record_token_refresh(provider);
                }
                info!(
                    provider = %provider,
                    expires_at = %updated.expires_at,
                    "Token refreshed"
                );
                Ok(updated)
            }
            Err(err) if requires_reauth(provider, &err) => {
                let reauth = CredentialError::ReauthRequired(provider);
                warn!(provider = %provider, error = %err, "Provider rejected refresh, re-authorization required");
                self.log_failure(provider, "refresh", &reauth, Some(&err)).await;
                Err(reauth)
            }
            Err(err) => {
                let failure = CredentialError::Http(err.clone());
                self.log_failure(provider, "refresh", &failure, Some(&err)).await;
                Err(failure)
            }
        }
    }

    /// Clear a provider's credential
    ///
    /// Returns whether a credential existed.
    pub async fn disconnect(&self, provider: Provider) -> Result<bool, CredentialError> {
        let removed = self.store.clear_credential(provider).await?;
        if let Ok(mut pending) = self.pending.lock() {
            pending.retain(|_, p| p.provider != provider);
        }
        info!(provider = %provider, removed = removed, "Provider disconnected");
        Ok(removed)
    }

    /// Store a credential obtained from a completed consent flow
    ///
    /// Overwrites any previous credential for the provider.
    pub async fn complete_handshake(
        &self,
        provider: Provider,
        access_token: String,
        refresh_token: Option<String>,
        expires_in: i64,
        payload: ProviderPayload,
    ) -> Result<Credential, CredentialError> {
        if payload.provider() != provider {
            return Err(CredentialError::Authorization(format!(
                "{} payload supplied for {}",
                payload.provider(),
                provider
            )));
        }

        let now = Utc::now();
        let mut credential = Credential::new(provider, access_token, expiry_after(now, expires_in))
            .with_payload(payload);
        credential.refresh_token = refresh_token;
        credential.updated_at = now;

        self.store.put_credential(&credential).await?;
        info!(
            provider = %provider,
            expires_at = %credential.expires_at,
            has_refresh_token = credential.refresh_token.is_some(),
            "Provider connected"
        );
        Ok(credential)
    }

    /// Start the consent flow; returns the URL to redirect the operator to
    pub async fn connect(&self, provider: Provider) -> Result<String, CredentialError> {
        let registration = self.registration(provider)?;
        let state = generate_state();
        let code_verifier = (provider == Provider::Twitter).then(generate_code_verifier);

        let url = authorization_url(&registration, &state, code_verifier.as_deref())?;

        let now = Utc::now();
        let mut pending = self
            .pending
            .lock()
            .map_err(|_| CredentialError::Authorization("pending state unavailable".to_string()))?;
        pending.retain(|_, p| now - p.created_at < Duration::minutes(PENDING_TTL_MINUTES));
        pending.insert(
            state,
            PendingAuthorization {
                provider,
                code_verifier,
                created_at: now,
            },
        );

        debug!(provider = %provider, "Authorization started");
        Ok(url)
    }

    /// Finish the consent flow from the redirect callback
    pub async fn complete(
        &self,
        provider: Provider,
        callback: CallbackParams,
    ) -> Result<Credential, CredentialError> {
        if let Some(error) = callback.error {
            let description = callback.error_description.unwrap_or_default();
            let message = format!("{} {}", error, description);
            let err = CredentialError::Authorization(message.trim().to_string());
            self.log_failure(provider, "authorize", &err, None).await;
            return Err(err);
        }

        let pending = self.take_pending(provider, callback.state.as_deref());
        let pending = match pending {
            Some(pending) => pending,
            None => {
                let err = CredentialError::Authorization("state mismatch".to_string());
                self.log_failure(provider, "authorize", &err, None).await;
                return Err(err);
            }
        };

        let code = callback
            .code
            .ok_or_else(|| {
                CredentialError::Authorization("missing authorization code".to_string())
            })?;
        let registration = self.registration(provider)?;

        let token = match self
            .exchange_code(&registration, &code, pending.code_verifier.as_deref())
            .await
        {
            Ok(token) => token,
            Err(err) => {
                let failure = CredentialError::Http(err.clone());
                self.log_failure(provider, "exchange", &failure, Some(&err)).await;
                return Err(failure);
            }
        };

        let payload = self.fetch_payload(&registration, &token.access_token).await;
        let expires_in = token.expires_in.unwrap_or(3600);
        let mut credential = self
            .complete_handshake(
                provider,
                token.access_token,
                token.refresh_token,
                expires_in,
                payload,
            )
            .await?;

        if let Some(scope) = token.scope {
            credential.scope = Some(scope);
            self.store.put_credential(&credential).await?;
        }
        Ok(credential)
    }

    async fn exchange_code(
        &self,
        registration: &ProviderRegistration,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<TokenResponse, HttpError> {
        let provider = registration.provider;
        let request = code_exchange_request(registration, code, code_verifier);
        let response = self.client.send(&request).await?;
        let token = parse_token_response(provider, &response)?;

        if provider != Provider::Facebook {
            return Ok(token);
        }

        // Code exchange yields a short-lived token; trade it for a long-lived one
        let request = long_lived_exchange_request(registration, &token.access_token);
        let response = self.client.send(&request).await?;
        parse_token_response(provider, &response)
    }

    async fn fetch_payload(
        &self,
        registration: &ProviderRegistration,
        access_token: &str,
    ) -> ProviderPayload {
        let provider = registration.provider;
        let request = match payload_request(registration, access_token) {
            Some(request) => request,
            None => return ProviderPayload::empty_for(provider),
        };

        let result = match self.client.send(&request).await {
            Ok(response) => parse_payload(provider, &response),
            Err(err) => Err(err),
        };

        result.unwrap_or_else(|err| {
            warn!(provider = %provider, error = %err, "Failed to fetch provider profile");
            ProviderPayload::empty_for(provider)
        })
    }

    fn take_pending(
        &self,
        provider: Provider,
        state: Option<&str>,
    ) -> Option<PendingAuthorization> {
        let state = state?;
        let mut pending = self.pending.lock().ok()?;
        let entry = pending.remove(state)?;
        let fresh = Utc::now() - entry.created_at < Duration::minutes(PENDING_TTL_MINUTES);
        (entry.provider == provider && fresh).then_some(entry)
    }

    /// Connection state of a provider
    pub async fn status(&self, provider: Provider) -> Result<CredentialStatus, CredentialError> {
        let credential = match self.store.get_credential(provider).await? {
            Some(credential) => credential,
            None => return Ok(CredentialStatus::disconnected(provider)),
        };

        let now = Utc::now();
        Ok(CredentialStatus {
            provider,
            connected: true,
            expires_in: Some(credential.expires_in(now)),
            needs_refresh: credential.needs_refresh(now, self.refresh_buffer(provider)),
        })
    }

    /// Stored credential, for provider payload lookups
    pub async fn credential(&self, provider: Provider) -> Result<Credential, CredentialError> {
        self.store
            .get_credential(provider)
            .await?
            .ok_or(CredentialError::NotConnected(provider))
    }

    async fn log_failure(
        &self,
        provider: Provider,
        operation: &str,
        err: &CredentialError,
        cause: Option<&HttpError>,
    ) {
        error!(provider = %provider, operation = operation, error = %err, "Credential operation failed");

        let entry = ErrorLogEntry::error(format!("oauth.{}", provider), err.to_string()).with_data(
            serde_json::json!({
                "provider": provider.as_str(),
                "operation": operation,
                "status": cause.and_then(|c| c.status()),
                "detail": cause.map(|c| c.to_string()),
            }),
        );
        if let Err(e) = self.errors.record_error(&entry).await {
            warn!(error = %e, "Failed to write error log entry");
        }
    }
}

/// Replace token fields after a successful refresh
///
/// The refresh token and scope are only replaced when reissued.
fn apply_refresh(
    mut credential: Credential,
    token: TokenResponse,
    now: DateTime<Utc>,
) -> Credential {
    credential.access_token = token.access_token;
    credential.expires_at = expiry_after(now, token.expires_in.unwrap_or(3600));
    if let Some(refresh_token) = token.refresh_token {
        credential.refresh_token = Some(refresh_token);
    }
    if let Some(scope) = token.scope {
        credential.scope = Some(scope);
    }
    credential.updated_at = now;
    credential
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HttpClientConfig, OAuthProviderConfig, RetryConfig};
    use crate::database::{MockCredentialStore, MockErrorLog, SqliteDatabase};
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider_config(token_url: String) -> OAuthProviderConfig {
        OAuthProviderConfig {
            client_id: "client".to_string(),
            client_secret: "secret".to_string(),
            redirect_uri: "https://cms.example.com/callback".to_string(),
            authorize_url: None,
            token_url: Some(token_url),
            api_url: None,
            scopes: Vec::new(),
            refresh_buffer_secs: None,
        }
    }

    fn test_client() -> ResilientClient {
        ResilientClient::new(
            HttpClientConfig::default(),
            RetryConfig {
                max_retries: 1,
                base_delay_ms: 1,
                max_delay_ms: 5,
                jitter_fraction: 0.0,
                retry_after_buffer_ms: 0,
            },
        )
        .unwrap()
    }

    fn quiet_error_log() -> Arc<dyn ErrorLog> {
        let mut log = MockErrorLog::new();
        log.expect_record_error().returning(|_| Ok(()));
        Arc::new(log)
    }

    async fn manager_with_db(config: OAuthConfig) -> (OAuthManager, Arc<SqliteDatabase>) {
        let db = Arc::new(SqliteDatabase::in_memory().await.unwrap());
        let manager = OAuthManager::new(db.clone(), db.clone(), test_client(), config);
        (manager, db)
    }

    // Test 1: Missing credential is NotConnected
    #[tokio::test]
    async fn test_get_valid_token_not_connected() {
        let mut store = MockCredentialStore::new();
        store.expect_get_credential().returning(|_| Ok(None));

        let manager = OAuthManager::new(
            Arc::new(store),
            quiet_error_log(),
            test_client(),
            OAuthConfig::default(),
        );

        let result = manager.get_valid_token(Provider::Twitter).await;
        assert!(matches!(
            result,
            Err(CredentialError::NotConnected(Provider::Twitter))
        ));
    }

    // Test 2: Token outside the buffer is returned without refreshing
    #[tokio::test]
    async fn test_get_valid_token_no_refresh_needed() {
        let mut store = MockCredentialStore::new();
        store.expect_get_credential().times(1).returning(|provider| {
            Ok(Some(Credential::new(
                provider,
                "fresh",
                Utc::now() + Duration::hours(2),
            )))
        });
        store.expect_put_credential().never();

        let manager = OAuthManager::new(
            Arc::new(store),
            quiet_error_log(),
            test_client(),
            OAuthConfig::default(),
        );

        assert_eq!(
            manager.get_valid_token(Provider::Analytics).await.unwrap(),
            "fresh"
        );
    }

    // Test 3: Token inside the buffer is refreshed and stored
    #[tokio::test]
    async fn test_get_valid_token_refreshes() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=r-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "renewed",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = OAuthConfig {
            analytics: Some(provider_config(format!("{}/token", mock_server.uri()))),
            ..OAuthConfig::default()
        };
        let (manager, db) = manager_with_db(config).await;
        manager
            .complete_handshake(
                Provider::Analytics,
                "old".to_string(),
                Some("r-1".to_string()),
                60,
                ProviderPayload::empty_for(Provider::Analytics),
            )
            .await
            .unwrap();

        let token = manager.get_valid_token(Provider::Analytics).await.unwrap();
        assert_eq!(token, "renewed");

        let stored = db.get_credential(Provider::Analytics).await.unwrap().unwrap();
        assert_eq!(stored.access_token, "renewed");
        // Not reissued, so kept
        assert_eq!(stored.refresh_token, Some("r-1".to_string()));
        assert!(stored.expires_at > Utc::now() + Duration::minutes(50));
    }

    // Test 4: Concurrent callers share one refresh
    #[tokio::test]
    async fn test_refresh_single_flight() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({
                        "access_token": "renewed",
                        "refresh_token": "r-2",
                        "expires_in": 7200
                    }))
                    .set_delay(std::time::Duration::from_millis(100)),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = OAuthConfig {
            twitter: Some(provider_config(format!("{}/token", mock_server.uri()))),
            ..OAuthConfig::default()
        };
        let (manager, db) = manager_with_db(config).await;
        manager
            .complete_handshake(
                Provider::Twitter,
                "old".to_string(),
                Some("r-1".to_string()),
                10,
                ProviderPayload::empty_for(Provider::Twitter),
            )
            .await
            .unwrap();

        let (a, b) = tokio::join!(
            manager.get_valid_token(Provider::Twitter),
            manager.get_valid_token(Provider::Twitter)
        );
        assert_eq!(a.unwrap(), "renewed");
        assert_eq!(b.unwrap(), "renewed");

        let stored = db.get_credential(Provider::Twitter).await.unwrap().unwrap();
        assert_eq!(stored.refresh_token, Some("r-2".to_string()));
    }

    // Test 5: 401 on refresh is ReauthRequired and leaves the credential untouched
    #[tokio::test]
    async fn test_refresh_unauthorized_requires_reauth() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(401).set_body_string("revoked"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = OAuthConfig {
            search_console: Some(provider_config(format!("{}/token", mock_server.uri()))),
            ..OAuthConfig::default()
        };
        let (manager, db) = manager_with_db(config).await;
        let original = manager
            .complete_handshake(
                Provider::SearchConsole,
                "old".to_string(),
                Some("r-1".to_string()),
                30,
                ProviderPayload::empty_for(Provider::SearchConsole),
            )
            .await
            .unwrap();

        let result = manager.get_valid_token(Provider::SearchConsole).await;
        assert!(matches!(
            result,
            Err(CredentialError::ReauthRequired(Provider::SearchConsole))
        ));

        let stored = db
            .get_credential(Provider::SearchConsole)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored, original);

        let errors = db.recent_errors(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].context, "oauth.search_console");
        assert_eq!(errors[0].data["status"], 401);
    }

    // Test 6: invalid_grant is a reauthorize signal
    #[tokio::test]
    async fn test_refresh_invalid_grant() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(400).set_body_string(r#"{"error":"invalid_grant"}"#),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = OAuthConfig {
            analytics: Some(provider_config(format!("{}/token", mock_server.uri()))),
            ..OAuthConfig::default()
        };
        let (manager, _db) = manager_with_db(config).await;
        manager
            .complete_handshake(
                Provider::Analytics,
                "old".to_string(),
                Some("r-1".to_string()),
                30,
                ProviderPayload::empty_for(Provider::Analytics),
            )
            .await
            .unwrap();

        let result = manager.refresh(Provider::Analytics).await;
        assert!(matches!(result, Err(CredentialError::ReauthRequired(_))));
    }

    // Test 7: Facebook refresh exchanges the long-lived token
    #[tokio::test]
    async fn test_facebook_refresh_exchange() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/oauth/access_token"))
            .and(query_param("grant_type", "fb_exchange_token"))
            .and(query_param("fb_exchange_token", "long-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "long-2",
                "token_type": "bearer",
                "expires_in": 5184000
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = OAuthConfig {
            facebook: Some(provider_config(format!(
                "{}/oauth/access_token",
                mock_server.uri()
            ))),
            ..OAuthConfig::default()
        };
        let (manager, _db) = manager_with_db(config).await;
        // Expires within the 1-day Facebook buffer
        manager
            .complete_handshake(
                Provider::Facebook,
                "long-1".to_string(),
                None,
                3600,
                ProviderPayload::empty_for(Provider::Facebook),
            )
            .await
            .unwrap();

        assert_eq!(
            manager.get_valid_token(Provider::Facebook).await.unwrap(),
            "long-2"
        );
    }

    // Test 8: Facebook error code 190 requires reauthorization
    #[tokio::test]
    async fn test_facebook_code_190() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": {"message": "Session has expired", "type": "OAuthException", "code": 190}
            })))
            .mount(&mock_server)
            .await;

        let config = OAuthConfig {
            facebook: Some(provider_config(mock_server.uri())),
            ..OAuthConfig::default()
        };
        let (manager, _db) = manager_with_db(config).await;
        manager
            .complete_handshake(
                Provider::Facebook,
                "long-1".to_string(),
                None,
                60,
                ProviderPayload::empty_for(Provider::Facebook),
            )
            .await
            .unwrap();

        let result = manager.get_valid_token(Provider::Facebook).await;
        assert!(matches!(
            result,
            Err(CredentialError::ReauthRequired(Provider::Facebook))
        ));
    }

    // Test 9: Handshake rejects a payload for another provider
    #[tokio::test]
    async fn test_complete_handshake_payload_mismatch() {
        let (manager, _db) = manager_with_db(OAuthConfig::default()).await;

        let result = manager
            .complete_handshake(
                Provider::Twitter,
                "tok".to_string(),
                None,
                3600,
                ProviderPayload::empty_for(Provider::Facebook),
            )
            .await;
        assert!(matches!(result, Err(CredentialError::Authorization(_))));
    }

    // Test 10: Disconnect clears the credential and status reflects it
    #[tokio::test]
    async fn test_disconnect_and_status() {
        let (manager, _db) = manager_with_db(OAuthConfig::default()).await;
        manager
            .complete_handshake(
                Provider::Twitter,
                "tok".to_string(),
                Some("r".to_string()),
                7200,
                ProviderPayload::empty_for(Provider::Twitter),
            )
            .await
            .unwrap();

        let status = manager.status(Provider::Twitter).await.unwrap();
        assert!(status.connected);
        assert!(!status.needs_refresh);
        assert!(status.expires_in.unwrap() > 7000);

        assert!(manager.disconnect(Provider::Twitter).await.unwrap());
        let status = manager.status(Provider::Twitter).await.unwrap();
        assert_eq!(status, CredentialStatus::disconnected(Provider::Twitter));

        assert!(matches!(
            manager.get_valid_token(Provider::Twitter).await,
            Err(CredentialError::NotConnected(_))
        ));
    }

    // Test 11: Connect requires a registration
    #[tokio::test]
    async fn test_connect_not_configured() {
        let (manager, _db) = manager_with_db(OAuthConfig::default()).await;
        assert!(matches!(
            manager.connect(Provider::Analytics).await,
            Err(CredentialError::NotConfigured(Provider::Analytics))
        ));
    }

    // Test 12: Full Twitter consent flow with PKCE and profile payload
    #[tokio::test]
    async fn test_connect_and_complete_twitter() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=authorization_code"))
            .and(body_string_contains("code=auth-code"))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "tw-access",
                "refresh_token": "tw-refresh",
                "expires_in": 7200,
                "scope": "tweet.read tweet.write"
            })))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/users/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"id": "777", "username": "clubnews"}
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut registration = provider_config(format!("{}/token", mock_server.uri()));
        registration.api_url = Some(mock_server.uri());
        let config = OAuthConfig {
            twitter: Some(registration),
            ..OAuthConfig::default()
        };
        let (manager, _db) = manager_with_db(config).await;

        let redirect = manager.connect(Provider::Twitter).await.unwrap();
        let parsed = url::Url::parse(&redirect).unwrap();
        let state = parsed
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert!(redirect.contains("code_challenge_method=plain"));

        let credential = manager
            .complete(
                Provider::Twitter,
                CallbackParams {
                    code: Some("auth-code".to_string()),
                    state: Some(state.clone()),
                    ..CallbackParams::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(credential.access_token, "tw-access");
        assert_eq!(credential.refresh_token, Some("tw-refresh".to_string()));
        assert_eq!(credential.scope, Some("tweet.read tweet.write".to_string()));
        assert_eq!(
            credential.payload,
            ProviderPayload::Twitter {
                user_id: Some("777".to_string()),
                username: Some("clubnews".to_string())
            }
        );

        // State is single use
        let replay = manager
            .complete(
                Provider::Twitter,
                CallbackParams {
                    code: Some("auth-code".to_string()),
                    state: Some(state),
                    ..CallbackParams::default()
                },
            )
            .await;
        assert!(matches!(replay, Err(CredentialError::Authorization(_))));
    }

    // Test 13: Provider error on callback is surfaced and logged
    #[tokio::test]
    async fn test_complete_provider_error() {
        let (manager, db) = manager_with_db(OAuthConfig::default()).await;

        let result = manager
            .complete(
                Provider::Facebook,
                CallbackParams {
                    error: Some("access_denied".to_string()),
                    error_description: Some("User denied".to_string()),
                    ..CallbackParams::default()
                },
            )
            .await;

        match result {
            Err(CredentialError::Authorization(msg)) => assert!(msg.contains("access_denied")),
            other => panic!("expected authorization error, got {:?}", other),
        }
        assert_eq!(db.recent_errors(5).await.unwrap().len(), 1);
    }

    // Test 14: apply_refresh keeps refresh token unless reissued
    #[test]
    fn test_apply_refresh() {
        let now = Utc::now();
        let cred = Credential::new(Provider::Twitter, "old", now).with_refresh_token("r-1");

        let updated = apply_refresh(
            cred.clone(),
            TokenResponse {
                access_token: "new".to_string(),
                refresh_token: None,
                expires_in: Some(100),
                scope: None,
                token_type: None,
            },
            now,
        );
        assert_eq!(updated.access_token, "new");
        assert_eq!(updated.refresh_token, Some("r-1".to_string()));
        assert_eq!(updated.expires_at, now + Duration::seconds(100));

        let updated = apply_refresh(
            cred,
            TokenResponse {
                access_token: "new".to_string(),
                refresh_token: Some("r-2".to_string()),
                expires_in: Some(100),
                scope: Some("s".to_string()),
                token_type: None,
            },
            now,
        );
        assert_eq!(updated.refresh_token, Some("r-2".to_string()));
        assert_eq!(updated.scope, Some("s".to_string()));
    }

    // Test 15: Huge expires_in from the token endpoint is clamped, not a panic
    #[tokio::test]
    async fn test_refresh_with_huge_expires_in() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "n",
                "expires_in": i64::MAX
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = OAuthConfig {
            analytics: Some(provider_config(format!("{}/token", mock_server.uri()))),
            ..OAuthConfig::default()
        };
        let (manager, _db) = manager_with_db(config).await;
        manager
            .complete_handshake(
                Provider::Analytics,
                "old".to_string(),
                Some("r-1".to_string()),
                i64::MAX,
                ProviderPayload::empty_for(Provider::Analytics),
            )
            .await
            .unwrap();

        // The handshake clamped the lifetime, so force the refresh
        let refreshed = manager.refresh(Provider::Analytics).await.unwrap();
        assert_eq!(refreshed.access_token, "n");
        assert!(
            refreshed.expires_at
                <= Utc::now() + Duration::seconds(crate::models::MAX_TOKEN_LIFETIME_SECS)
        );

        assert_eq!(
            manager.get_valid_token(Provider::Analytics).await.unwrap(),
            "n"
        );
    }
}
