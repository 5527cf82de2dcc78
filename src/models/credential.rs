//! Credential-related domain models
//!
//! This module defines the OAuth provider set, stored credentials with their
//! per-provider payloads, and normalized token endpoint responses.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Outbound integrations that authenticate with OAuth
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Analytics,
    SearchConsole,
    Twitter,
    Facebook,
}

impl Provider {
    /// Every provider, in display order
    pub const ALL: [Provider; 4] = [
        Provider::Analytics,
        Provider::SearchConsole,
        Provider::Twitter,
        Provider::Facebook,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Analytics => "analytics",
            Provider::SearchConsole => "search_console",
            Provider::Twitter => "twitter",
            Provider::Facebook => "facebook",
        }
    }

    /// Refresh lead time used when the registration does not set one
    ///
    /// Facebook long-lived tokens can only be exchanged while still valid, so
    /// they are renewed a day ahead.
    pub fn default_refresh_buffer_secs(&self) -> u64 {
        match self {
            Provider::Facebook => 86_400,
            _ => 300,
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "analytics" => Ok(Provider::Analytics),
            "search_console" => Ok(Provider::SearchConsole),
            "twitter" => Ok(Provider::Twitter),
            "facebook" => Ok(Provider::Facebook),
            other => Err(format!("unknown provider: {}", other)),
        }
    }
}

/// A Facebook page the connected account manages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacebookPage {
    pub id: String,
    pub name: String,

    /// Page access token, used for posting as the page
    #[serde(default)]
    pub access_token: Option<String>,
}

/// Provider-specific data stored alongside the tokens
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProviderPayload {
    Analytics {
        property_id: Option<String>,
    },
    SearchConsole {
        site_url: Option<String>,
    },
    Twitter {
        user_id: Option<String>,
        username: Option<String>,
    },
    Facebook {
        #[serde(default)]
        pages: Vec<FacebookPage>,
    },
}

impl ProviderPayload {
    /// Payload with nothing filled in yet
    pub fn empty_for(provider: Provider) -> Self {
        match provider {
            Provider::Analytics => ProviderPayload::Analytics { property_id: None },
            Provider::SearchConsole => ProviderPayload::SearchConsole { site_url: None },
            Provider::Twitter => ProviderPayload::Twitter {
                user_id: None,
                username: None,
            },
            Provider::Facebook => ProviderPayload::Facebook { pages: Vec::new() },
        }
    }

    pub fn provider(&self) -> Provider {
        match self {
            ProviderPayload::Analytics { .. } => Provider::Analytics,
            ProviderPayload::SearchConsole { .. } => Provider::SearchConsole,
            ProviderPayload::Twitter { .. } => Provider::Twitter,
            ProviderPayload::Facebook { .. } => Provider::Facebook,
        }
    }

    /// Managed pages, for Facebook payloads
    pub fn facebook_pages(&self) -> &[FacebookPage] {
        match self {
            ProviderPayload::Facebook { pages } => pages,
            _ => &[],
        }
    }
}

/// Stored OAuth credential for one provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub provider: Provider,

    /// Opaque access token
    pub access_token: String,

    /// Refresh token, for providers that issue one
    pub refresh_token: Option<String>,

    /// Absolute expiry of the access token
    pub expires_at: DateTime<Utc>,

    /// Granted scopes as reported by the provider
    pub scope: Option<String>,

    pub payload: ProviderPayload,

    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Create a credential with an empty payload
    pub fn new(
        provider: Provider,
        access_token: impl Into<String>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            provider,
            access_token: access_token.into(),
            refresh_token: None,
            expires_at,
            scope: None,
            payload: ProviderPayload::empty_for(provider),
            updated_at: Utc::now(),
        }
    }

    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(refresh_token.into());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_payload(mut self, payload: ProviderPayload) -> Self {
        self.payload = payload;
        self
    }

    /// A token that exists but has already expired
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        !self.access_token.is_empty() && self.expires_at <= now
    }

    /// Whether the token expires within `buffer`
    pub fn needs_refresh(&self, now: DateTime<Utc>, buffer: Duration) -> bool {
        self.expires_at - now < buffer
    }

    /// Seconds until expiry, negative once expired
    pub fn expires_in(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds()
    }
}

/// Longest token lifetime accepted from a remote endpoint
pub const MAX_TOKEN_LIFETIME_SECS: i64 = 400 * 24 * 60 * 60;

/// Absolute expiry for a remote `expires_in`, clamped to `[0, MAX_TOKEN_LIFETIME_SECS]`
pub fn expiry_after(now: DateTime<Utc>, expires_in: i64) -> DateTime<Utc> {
    now + Duration::seconds(expires_in.clamp(0, MAX_TOKEN_LIFETIME_SECS))
}

/// Token endpoint response, normalized across providers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,

    #[serde(default)]
    pub refresh_token: Option<String>,

    /// Lifetime in seconds
    #[serde(default)]
    pub expires_in: Option<i64>,

    #[serde(default)]
    pub scope: Option<String>,

    #[serde(default)]
    pub token_type: Option<String>,
}

/// Connection state reported to operators
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialStatus {
    pub provider: Provider,
    pub connected: bool,

    /// Seconds until expiry; absent when not connected
    pub expires_in: Option<i64>,

    pub needs_refresh: bool,
}

impl CredentialStatus {
    pub fn disconnected(provider: Provider) -> Self {
        Self {
            provider,
            connected: false,
            expires_in: None,
            needs_refresh: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Test 1: Provider string forms
    #[test]
    fn test_provider_parse_and_display() {
        for provider in Provider::ALL {
            assert_eq!(provider.as_str().parse::<Provider>().unwrap(), provider);
            assert_eq!(provider.to_string(), provider.as_str());
        }
        assert!("myspace".parse::<Provider>().is_err());
        assert_eq!(
            serde_json::to_string(&Provider::SearchConsole).unwrap(),
            "\"search_console\""
        );
    }

    // Test 2: Default refresh buffers
    #[test]
    fn test_default_refresh_buffer() {
        assert_eq!(Provider::Analytics.default_refresh_buffer_secs(), 300);
        assert_eq!(Provider::Twitter.default_refresh_buffer_secs(), 300);
        assert_eq!(Provider::Facebook.default_refresh_buffer_secs(), 86_400);
    }

    // Test 3: Payload is a tagged union
    #[test]
    fn test_payload_serialization() {
        let payload = ProviderPayload::Facebook {
            pages: vec![FacebookPage {
                id: "1".to_string(),
                name: "Team Page".to_string(),
                access_token: Some("page-token".to_string()),
            }],
        };

        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "facebook");
        assert_eq!(json["pages"][0]["name"], "Team Page");

        let parsed: ProviderPayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed.provider(), Provider::Facebook);
        assert_eq!(parsed.facebook_pages().len(), 1);
        assert!(ProviderPayload::empty_for(Provider::Twitter)
            .facebook_pages()
            .is_empty());
    }

    // Test 4: Stale and refresh checks
    #[test]
    fn test_credential_expiry_checks() {
        let now = Utc::now();

        let valid = Credential::new(Provider::Twitter, "tok", now + Duration::hours(1));
        assert!(!valid.is_stale(now));
        assert!(!valid.needs_refresh(now, Duration::seconds(300)));
        assert!(valid.needs_refresh(now, Duration::hours(2)));

        let expired = Credential::new(Provider::Twitter, "tok", now - Duration::seconds(1));
        assert!(expired.is_stale(now));
        assert!(expired.expires_in(now) < 0);

        let empty = Credential::new(Provider::Twitter, "", now - Duration::seconds(1));
        assert!(!empty.is_stale(now));
    }

    // Test 5: New credential carries the provider's empty payload
    #[test]
    fn test_credential_default_payload() {
        let cred = Credential::new(Provider::Analytics, "tok", Utc::now())
            .with_refresh_token("refresh")
            .with_scope("analytics.readonly");
        assert_eq!(cred.payload.provider(), Provider::Analytics);
        assert_eq!(cred.refresh_token, Some("refresh".to_string()));
        assert_eq!(cred.scope, Some("analytics.readonly".to_string()));
    }

    // Test 6: Token response tolerates missing optional fields
    #[test]
    fn test_token_response_minimal() {
        let resp: TokenResponse =
            serde_json::from_str(r#"{"access_token":"abc"}"#).unwrap();
        assert_eq!(resp.access_token, "abc");
        assert_eq!(resp.refresh_token, None);
        assert_eq!(resp.expires_in, None);
    }

    // Test 7: Remote lifetimes are clamped
    #[test]
    fn test_expiry_after_clamps() {
        let now = Utc::now();
        assert_eq!(expiry_after(now, 3600), now + Duration::hours(1));
        assert_eq!(expiry_after(now, -5), now);
        assert_eq!(
            expiry_after(now, i64::MAX),
            now + Duration::seconds(MAX_TOKEN_LIFETIME_SECS)
        );
    }
}
