//! Provider-specific OAuth details
//!
//! Endpoint defaults, request shapes for the code exchange and refresh, token
//! response normalization, and detection of "re-authorize" signals.

use chrono::Duration;
use serde::Deserialize;
use url::Url;

use crate::config::OAuthProviderConfig;
use crate::error::{CredentialError, HttpError};
use crate::http::{HttpResponse, RetryableRequest};
use crate::models::{
    Credential, FacebookPage, Provider, ProviderPayload, TokenResponse, MAX_TOKEN_LIFETIME_SECS,
};

const GOOGLE_AUTHORIZE_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const TWITTER_AUTHORIZE_URL: &str = "https://twitter.com/i/oauth2/authorize";
const TWITTER_TOKEN_URL: &str = "https://api.twitter.com/2/oauth2/token";
const TWITTER_API_URL: &str = "https://api.twitter.com/2";
const FACEBOOK_AUTHORIZE_URL: &str = "https://www.facebook.com/v19.0/dialog/oauth";
const FACEBOOK_TOKEN_URL: &str = "https://graph.facebook.com/v19.0/oauth/access_token";
const FACEBOOK_API_URL: &str = "https://graph.facebook.com/v19.0";

/// Graph API error code for an invalid or expired session
const FACEBOOK_INVALID_TOKEN_CODE: i64 = 190;

/// Lifetime assumed when a token response carries no `expires_in`
fn default_lifetime(provider: Provider) -> Duration {
    match provider {
        // Long-lived user tokens
        Provider::Facebook => Duration::days(60),
        _ => Duration::hours(1),
    }
}

fn default_scopes(provider: Provider) -> &'static [&'static str] {
    match provider {
        Provider::Analytics => &["https://www.googleapis.com/auth/analytics.readonly"],
        Provider::SearchConsole => &["https://www.googleapis.com/auth/webmasters.readonly"],
        Provider::Twitter => &["tweet.read", "tweet.write", "users.read", "offline.access"],
        Provider::Facebook => &["pages_show_list", "pages_manage_posts", "pages_read_engagement"],
    }
}

/// A provider registration with defaults filled in
#[derive(Debug, Clone)]
pub struct ProviderRegistration {
    pub provider: Provider,
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
    pub authorize_url: String,
    pub token_url: String,
    pub api_url: Option<String>,
    pub scopes: Vec<String>,
    pub refresh_buffer: Duration,
}

impl ProviderRegistration {
    /// Merge a configured registration with the provider's defaults
    pub fn resolve(provider: Provider, config: &OAuthProviderConfig) -> Self {
        let (authorize_url, token_url, api_url) = match provider {
            Provider::Analytics | Provider::SearchConsole => {
                (GOOGLE_AUTHORIZE_URL, GOOGLE_TOKEN_URL, None)
            }
            Provider::Twitter => (TWITTER_AUTHORIZE_URL, TWITTER_TOKEN_URL, Some(TWITTER_API_URL)),
            Provider::Facebook => (
                FACEBOOK_AUTHORIZE_URL,
                FACEBOOK_TOKEN_URL,
                Some(FACEBOOK_API_URL),
            ),
        };

        let scopes = if config.scopes.is_empty() {
            default_scopes(provider).iter().map(|s| s.to_string()).collect()
        } else {
            config.scopes.clone()
        };

        let buffer_secs = config
            .refresh_buffer_secs
            .unwrap_or_else(|| provider.default_refresh_buffer_secs());

        Self {
            provider,
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
            redirect_uri: config.redirect_uri.clone(),
            authorize_url: config
                .authorize_url
                .clone()
                .unwrap_or_else(|| authorize_url.to_string()),
            token_url: config.token_url.clone().unwrap_or_else(|| token_url.to_string()),
            api_url: config.api_url.clone().or(api_url.map(String::from)),
            scopes,
            refresh_buffer: Duration::seconds(buffer_secs as i64),
        }
    }

    fn is_google(&self) -> bool {
        matches!(self.provider, Provider::Analytics | Provider::SearchConsole)
    }
}

/// Build the authorization redirect URL
///
/// Twitter requires PKCE; the verifier is sent as the challenge using the
/// `plain` method.
pub fn authorization_url(
    registration: &ProviderRegistration,
    state: &str,
    code_verifier: Option<&str>,
) -> Result<String, CredentialError> {
    let separator = if registration.provider == Provider::Facebook {
        ","
    } else {
        " "
    };
    let scope = registration.scopes.join(separator);

    let mut params: Vec<(&str, &str)> = vec![
        ("response_type", "code"),
        ("client_id", registration.client_id.as_str()),
        ("redirect_uri", registration.redirect_uri.as_str()),
        ("scope", scope.as_str()),
        ("state", state),
    ];

    if registration.is_google() {
        // Offline access is what makes Google issue a refresh token
        params.push(("access_type", "offline"));
        params.push(("prompt", "consent"));
    }

    if let Some(verifier) = code_verifier {
        params.push(("code_challenge", verifier));
        params.push(("code_challenge_method", "plain"));
    }

    let url = Url::parse_with_params(&registration.authorize_url, &params).map_err(|e| {
        CredentialError::Authorization(format!(
            "invalid authorize URL for {}: {}",
            registration.provider, e
        ))
    })?;
    Ok(url.into())
}

/// Exchange an authorization code for tokens
pub fn code_exchange_request(
    registration: &ProviderRegistration,
    code: &str,
    code_verifier: Option<&str>,
) -> RetryableRequest {
    match registration.provider {
        Provider::Analytics | Provider::SearchConsole => {
            RetryableRequest::post(&registration.token_url).form(form(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", registration.redirect_uri.as_str()),
                ("client_id", registration.client_id.as_str()),
                ("client_secret", registration.client_secret.as_str()),
            ]))
        }
        Provider::Twitter => {
            let mut pairs = vec![
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", registration.redirect_uri.as_str()),
                ("client_id", registration.client_id.as_str()),
            ];
            if let Some(verifier) = code_verifier {
                pairs.push(("code_verifier", verifier));
            }
            RetryableRequest::post(&registration.token_url)
                .basic_auth(&registration.client_id, &registration.client_secret)
                .form(form(&pairs))
        }
        Provider::Facebook => RetryableRequest::get(&registration.token_url)
            .query("client_id", &registration.client_id)
            .query("client_secret", &registration.client_secret)
            .query("redirect_uri", &registration.redirect_uri)
            .query("code", code),
    }
}

/// Renew a stored credential
///
/// Facebook issues no refresh token; its still-valid long-lived token is
/// exchanged for a new one instead.
pub fn refresh_request(
    registration: &ProviderRegistration,
    credential: &Credential,
) -> Result<RetryableRequest, CredentialError> {
    if registration.provider == Provider::Facebook {
        return Ok(long_lived_exchange_request(
            registration,
            &credential.access_token,
        ));
    }

    let refresh_token = credential
        .refresh_token
        .as_deref()
        .ok_or(CredentialError::ReauthRequired(registration.provider))?;

    let request = RetryableRequest::post(&registration.token_url);
    let request = if registration.provider == Provider::Twitter {
        request
            .basic_auth(&registration.client_id, &registration.client_secret)
            .form(form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", registration.client_id.as_str()),
            ]))
    } else {
        request.form(form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", registration.client_id.as_str()),
            ("client_secret", registration.client_secret.as_str()),
        ]))
    };
    Ok(request)
}

/// Facebook `fb_exchange_token` grant
pub fn long_lived_exchange_request(
    registration: &ProviderRegistration,
    access_token: &str,
) -> RetryableRequest {
    RetryableRequest::get(&registration.token_url)
        .query("grant_type", "fb_exchange_token")
        .query("client_id", &registration.client_id)
        .query("client_secret", &registration.client_secret)
        .query("fb_exchange_token", access_token)
}

/// Decode and normalize a token endpoint response
pub fn parse_token_response(
    provider: Provider,
    response: &HttpResponse,
) -> Result<TokenResponse, HttpError> {
    let mut token: TokenResponse = response.json()?;
    if token.access_token.is_empty() {
        return Err(HttpError::Decode {
            url: response.url.clone(),
            message: "empty access_token".to_string(),
        });
    }
    token.expires_in = match token.expires_in {
        Some(secs) if secs > 0 => Some(secs.min(MAX_TOKEN_LIFETIME_SECS)),
        _ => Some(default_lifetime(provider).num_seconds()),
    };
    Ok(token)
}

#[derive(Debug, Deserialize)]
struct GraphErrorBody {
    error: GraphError,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    code: i64,
}

/// Whether a failed token call means the grant itself is no longer valid
pub fn requires_reauth(provider: Provider, err: &HttpError) -> bool {
    let (status, body) = match err {
        HttpError::ClientError { status, body, .. } => (*status, body.as_str()),
        _ => return false,
    };

    if status == 401 {
        return true;
    }

    if provider == Provider::Facebook {
        let code = serde_json::from_str::<GraphErrorBody>(body)
            .ok()
            .map(|parsed| parsed.error.code);
        // The body is an excerpt; a long one no longer parses as JSON
        if code == Some(FACEBOOK_INVALID_TOKEN_CODE)
            || mentions_error_code(body, FACEBOOK_INVALID_TOKEN_CODE)
        {
            return true;
        }
    }

    status == 400 && body.contains("invalid_grant")
}

/// Whether `"code": <code>` appears in a possibly truncated JSON body
fn mentions_error_code(body: &str, code: i64) -> bool {
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    let needle = format!("\"code\":{}", code);
    compact.match_indices(&needle).any(|(at, _)| {
        !compact[at + needle.len()..].starts_with(|c: char| c.is_ascii_digit())
    })
}

/// Request for the data stored alongside the tokens, if the provider has any
pub fn payload_request(
    registration: &ProviderRegistration,
    access_token: &str,
) -> Option<RetryableRequest> {
    let api_url = registration.api_url.as_deref()?.trim_end_matches('/');
    match registration.provider {
        Provider::Twitter => {
            Some(RetryableRequest::get(format!("{}/users/me", api_url)).bearer_auth(access_token))
        }
        Provider::Facebook => Some(
            RetryableRequest::get(format!("{}/me/accounts", api_url))
                .query("fields", "id,name,access_token")
                .bearer_auth(access_token),
        ),
        Provider::Analytics | Provider::SearchConsole => None,
    }
}

#[derive(Debug, Deserialize)]
struct TwitterUserEnvelope {
    data: TwitterUser,
}

#[derive(Debug, Deserialize)]
struct TwitterUser {
    id: String,
    username: String,
}

#[derive(Debug, Deserialize)]
struct FacebookPagesEnvelope {
    #[serde(default)]
    data: Vec<FacebookPage>,
}

/// Decode a payload response into the provider's payload variant
pub fn parse_payload(
    provider: Provider,
    response: &HttpResponse,
) -> Result<ProviderPayload, HttpError> {
    match provider {
        Provider::Twitter => {
            let envelope: TwitterUserEnvelope = response.json()?;
            Ok(ProviderPayload::Twitter {
                user_id: Some(envelope.data.id),
                username: Some(envelope.data.username),
            })
        }
        Provider::Facebook => {
            let envelope: FacebookPagesEnvelope = response.json()?;
            Ok(ProviderPayload::Facebook {
                pages: envelope.data,
            })
        }
        other => Ok(ProviderPayload::empty_for(other)),
    }
}

fn form(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
