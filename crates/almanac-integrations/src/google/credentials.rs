use std::fmt;
use std::sync::Arc;

use almanac_core::error::{AlmanacError, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::CredentialStorage;

pub const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_REVOKE_URI: &str = "https://oauth2.googleapis.com/revoke";

/// Treat tokens as expired this long before their actual expiry.
const EXPIRY_SKEW_SECS: i64 = 60;

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: i64 = 3600;

/// Failure talking to the OAuth2 token endpoint.
#[derive(Debug, Error)]
pub enum TokenEndpointError {
    #[error("no refresh token available")]
    MissingRefreshToken,

    #[error("token endpoint request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("token endpoint rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid token response: {0}")]
    InvalidResponse(String),

    #[error("credentials were removed from storage")]
    Cleared,

    #[error("credential storage error: {0}")]
    Storage(#[from] AlmanacError),
}

/// OAuth2 access/refresh tokens plus the client information needed to
/// refresh them. Serializes to the same JSON layout oauth2client uses, so
/// blobs written by either side can be read by the other.
#[derive(Clone, Serialize, Deserialize)]
pub struct OAuth2Credentials {
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, with = "expiry_format")]
    pub token_expiry: Option<DateTime<Utc>>,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub revoke_uri: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub token_response: Option<Value>,
    #[serde(default)]
    pub id_token: Option<Value>,
    #[serde(default)]
    pub invalid: bool,
    #[serde(skip)]
    store: Option<Arc<dyn CredentialStorage>>,
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URI.to_string()
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    id_token: Option<String>,
}

impl OAuth2Credentials {
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            access_token: None,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            refresh_token: None,
            token_expiry: None,
            token_uri: default_token_uri(),
            user_agent: None,
            revoke_uri: Some(GOOGLE_REVOKE_URI.to_string()),
            scopes: Vec::new(),
            token_response: None,
            id_token: None,
            invalid: false,
            store: None,
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Attach the storage these credentials were loaded from. [`refresh`](Self::refresh)
    /// persists through it.
    pub fn set_store(&mut self, store: Arc<dyn CredentialStorage>) {
        self.store = Some(store);
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub fn access_token_expired(&self) -> bool {
        self.access_token_expired_at(Utc::now())
    }

    pub fn access_token_expired_at(&self, now: DateTime<Utc>) -> bool {
        if self.invalid || self.access_token.is_none() {
            return true;
        }
        match self.token_expiry {
            Some(expiry) => match expiry.checked_sub_signed(Duration::seconds(EXPIRY_SKEW_SECS)) {
                Some(deadline) => now >= deadline,
                None => true,
            },
            None => false,
        }
    }

    /// Usable as-is: not marked invalid and not expired.
    pub fn is_valid(&self) -> bool {
        !self.invalid && !self.access_token_expired()
    }

    /// Return a usable access token, refreshing first if necessary.
    pub async fn access_token(&mut self, http: &reqwest::Client) -> std::result::Result<String, TokenEndpointError> {
        if !self.is_valid() {
            self.refresh(http).await?;
        }
        self.access_token
            .clone()
            .ok_or_else(|| TokenEndpointError::InvalidResponse("missing access_token".to_string()))
    }

    /// Refresh the access token.
    ///
    /// With a store attached this holds the store lock for the whole
    /// exchange: if another holder already saved a newer valid token it is
    /// adopted without calling the endpoint, otherwise the refreshed (or
    /// invalidated) credentials are written back.
    pub async fn refresh(&mut self, http: &reqwest::Client) -> std::result::Result<(), TokenEndpointError> {
        let Some(store) = self.store.clone() else {
            return self.refresh_request(http).await;
        };

        let _guard = store.lock().lock().await;
        let Some(stored) = store.locked_get().await? else {
            return Err(TokenEndpointError::Cleared);
        };
        if stored.is_valid() && stored.access_token != self.access_token {
            self.update_from(stored);
            return Ok(());
        }

        let result = self.refresh_request(http).await;
        if result.is_ok() || self.invalid {
            store.locked_put(self).await?;
        }
        result
    }

    /// Exchange the refresh token for a new access token. Makes exactly one
    /// request and never touches storage.
    pub async fn refresh_request(&mut self, http: &reqwest::Client) -> std::result::Result<(), TokenEndpointError> {
        let refresh_token = self
            .refresh_token
            .clone()
            .ok_or(TokenEndpointError::MissingRefreshToken)?;

        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("refresh_token", refresh_token.as_str()),
        ];

        let mut request = http.post(&self.token_uri).form(&params);
        if let Some(agent) = &self.user_agent {
            request = request.header(reqwest::header::USER_AGENT, agent);
        }

        let resp = request.send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;

        if status != 200 {
            let (message, is_oauth_error) = endpoint_error_message(&text);
            if is_oauth_error {
                self.invalid = true;
            }
            return Err(TokenEndpointError::Rejected { status, message });
        }

        self.apply_token_response(&text, Utc::now())
    }

    /// Update tokens and expiry from a successful token endpoint body.
    pub(crate) fn apply_token_response(
        &mut self,
        body: &str,
        now: DateTime<Utc>,
    ) -> std::result::Result<(), TokenEndpointError> {
        let raw: Value = serde_json::from_str(body)
            .map_err(|e| TokenEndpointError::InvalidResponse(e.to_string()))?;
        let response: TokenResponse = serde_json::from_value(raw.clone())
            .map_err(|e| TokenEndpointError::InvalidResponse(e.to_string()))?;

        let expires_in = response.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECS);
        let expiry = Duration::try_seconds(expires_in)
            .and_then(|lifetime| now.checked_add_signed(lifetime))
            .ok_or_else(|| {
                TokenEndpointError::InvalidResponse(format!("expires_in out of range: {expires_in}"))
            })?;

        self.access_token = Some(response.access_token);
        self.token_expiry = Some(expiry);
        if let Some(refresh) = response.refresh_token {
            self.refresh_token = Some(refresh);
        }
        if let Some(id_token) = response.id_token {
            self.id_token = Some(Value::String(id_token));
        }
        self.token_response = Some(raw);
        self.invalid = false;
        Ok(())
    }

    fn update_from(&mut self, other: OAuth2Credentials) {
        let store = self.store.take();
        *self = OAuth2Credentials { store, ..other };
    }
}

/// Error text from a token endpoint body, and whether it was an OAuth error
/// object (`{"error": ...}`).
fn endpoint_error_message(body: &str) -> (String, bool) {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return (format!("invalid response {body}"), false);
    };
    let Some(error) = json["error"].as_str() else {
        return (format!("invalid response {body}"), false);
    };
    match json["error_description"].as_str() {
        Some(description) => (format!("{error}: {description}"), true),
        None => (error.to_string(), true),
    }
}

impl fmt::Debug for OAuth2Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "[REDACTED]");
        f.debug_struct("OAuth2Credentials")
            .field("access_token", &redact(&self.access_token))
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("refresh_token", &redact(&self.refresh_token))
            .field("token_expiry", &self.token_expiry)
            .field("token_uri", &self.token_uri)
            .field("scopes", &self.scopes)
            .field("invalid", &self.invalid)
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

mod expiry_format {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

    pub fn serialize<S: Serializer>(
        value: &Option<DateTime<Utc>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(expiry) => serializer.serialize_str(&expiry.format(FORMAT).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<DateTime<Utc>>, D::Error> {
        let Some(raw) = Option::<String>::deserialize(deserializer)? else {
            return Ok(None);
        };
        if let Ok(naive) = NaiveDateTime::parse_from_str(&raw, FORMAT) {
            return Ok(Some(naive.and_utc()));
        }
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| Some(dt.with_timezone(&Utc)))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const OAUTH2CLIENT_BLOB: &str = r#"{
        "access_token": "ya29.old",
        "client_id": "client.apps.googleusercontent.com",
        "client_secret": "shh",
        "refresh_token": "1//refresh",
        "token_expiry": "2020-01-01T12:00:00Z",
        "token_uri": "https://oauth2.googleapis.com/token",
        "user_agent": null,
        "revoke_uri": "https://oauth2.googleapis.com/revoke",
        "id_token": null,
        "id_token_jwt": null,
        "token_response": {"access_token": "ya29.old", "expires_in": 3600},
        "scopes": ["https://www.googleapis.com/auth/calendar.readonly"],
        "token_info_uri": "https://oauth2.googleapis.com/tokeninfo",
        "invalid": false,
        "_class": "OAuth2Credentials",
        "_module": "oauth2client.client"
    }"#;

    fn expiring_credentials(token_uri: String) -> OAuth2Credentials {
        let mut creds = OAuth2Credentials::new("client-id", "client-secret");
        creds.access_token = Some("old-token".to_string());
        creds.refresh_token = Some("refresh-token".to_string());
        creds.token_expiry = Some(Utc::now() - Duration::minutes(5));
        creds.token_uri = token_uri;
        creds
    }

    #[test]
    fn test_parse_oauth2client_blob() {
        let creds = OAuth2Credentials::from_json(OAUTH2CLIENT_BLOB).unwrap();
        assert_eq!(creds.access_token.as_deref(), Some("ya29.old"));
        assert_eq!(creds.refresh_token.as_deref(), Some("1//refresh"));
        assert_eq!(
            creds.token_expiry,
            Some(Utc.with_ymd_and_hms(2020, 1, 1, 12, 0, 0).unwrap())
        );
        assert_eq!(creds.scopes.len(), 1);
        assert!(!creds.invalid);
        assert!(creds.access_token_expired());
        assert!(!creds.has_store());
    }

    #[test]
    fn test_expiry_written_in_oauth2client_format() {
        let mut creds = OAuth2Credentials::new("id", "secret");
        creds.token_expiry = Some(Utc.with_ymd_and_hms(2031, 6, 1, 8, 30, 0).unwrap());
        let json: Value = serde_json::from_str(&creds.to_json().unwrap()).unwrap();
        assert_eq!(json["token_expiry"], "2031-06-01T08:30:00Z");
    }

    #[test]
    fn test_expiry_rules() {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let mut creds = OAuth2Credentials::new("id", "secret");
        creds.access_token = Some("token".to_string());

        assert!(!creds.access_token_expired_at(now));

        creds.token_expiry = Some(now + Duration::minutes(10));
        assert!(!creds.access_token_expired_at(now));

        creds.token_expiry = Some(now + Duration::seconds(30));
        assert!(creds.access_token_expired_at(now));

        creds.token_expiry = Some(now + Duration::minutes(10));
        creds.invalid = true;
        assert!(creds.access_token_expired_at(now));
    }

    #[test]
    fn test_garbage_is_serialization_error() {
        assert!(matches!(
            OAuth2Credentials::from_json("not json"),
            Err(AlmanacError::Serialization(_))
        ));
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = OAuth2Credentials::from_json(OAUTH2CLIENT_BLOB).unwrap();
        let debug = format!("{creds:?}");
        assert!(!debug.contains("ya29.old"));
        assert!(!debug.contains("1//refresh"));
        assert!(!debug.contains("shh"));
    }

    #[tokio::test]
    async fn test_refresh_request_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-token",
                "expires_in": 1800,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut creds = expiring_credentials(format!("{}/token", server.uri()));
        creds.refresh_request(&reqwest::Client::new()).await.unwrap();

        assert_eq!(creds.access_token.as_deref(), Some("new-token"));
        assert_eq!(creds.refresh_token.as_deref(), Some("refresh-token"));
        assert!(creds.is_valid());
        assert!(creds.token_expiry.unwrap() > Utc::now() + Duration::minutes(29));
    }

    #[tokio::test]
    async fn test_refresh_request_invalid_grant_marks_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })))
            .mount(&server)
            .await;

        let mut creds = expiring_credentials(format!("{}/token", server.uri()));
        let err = creds.refresh_request(&reqwest::Client::new()).await.unwrap_err();

        match err {
            TokenEndpointError::Rejected { status, message } => {
                assert_eq!(status, 400);
                assert_eq!(message, "invalid_grant: Token has been expired or revoked.");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(creds.invalid);
        assert_eq!(creds.access_token.as_deref(), Some("old-token"));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token() {
        let mut creds = OAuth2Credentials::new("id", "secret");
        let err = creds.refresh_request(&reqwest::Client::new()).await.unwrap_err();
        assert!(matches!(err, TokenEndpointError::MissingRefreshToken));
    }

    #[test]
    fn test_apply_token_response_rotates_refresh_token() {
        let now = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let mut creds = OAuth2Credentials::new("id", "secret");
        creds.refresh_token = Some("first".to_string());
        creds.invalid = true;

        creds
            .apply_token_response(r#"{"access_token": "a", "refresh_token": "second"}"#, now)
            .unwrap();

        assert_eq!(creds.refresh_token.as_deref(), Some("second"));
        assert_eq!(creds.token_expiry, Some(now + Duration::seconds(3600)));
        assert!(!creds.invalid);
        assert!(creds.token_response.is_some());
    }

    #[test]
    fn test_apply_token_response_requires_access_token() {
        let mut creds = OAuth2Credentials::new("id", "secret");
        let err = creds.apply_token_response(r#"{"expires_in": 10}"#, Utc::now()).unwrap_err();
        assert!(matches!(err, TokenEndpointError::InvalidResponse(_)));
    }

    #[test]
    fn test_apply_token_response_rejects_out_of_range_expiry() {
        let mut creds = OAuth2Credentials::new("id", "secret");
        creds.access_token = Some("kept".to_string());
        let body = format!(r#"{{"access_token": "a", "expires_in": {}}}"#, i64::MAX);

        let err = creds.apply_token_response(&body, Utc::now()).unwrap_err();
        assert!(matches!(err, TokenEndpointError::InvalidResponse(_)));
        assert_eq!(creds.access_token.as_deref(), Some("kept"));
    }

    #[test]
    fn test_expiry_near_minimum_counts_as_expired() {
        let mut creds = OAuth2Credentials::new("id", "secret");
        creds.access_token = Some("a".to_string());
        creds.token_expiry = Some(DateTime::<Utc>::MIN_UTC);
        assert!(creds.access_token_expired_at(Utc::now()));
    }

    #[tokio::test]
    async fn test_access_token_valid_skips_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&server)
            .await;

        let mut creds = expiring_credentials(format!("{}/token", server.uri()));
        creds.token_expiry = Some(Utc::now() + Duration::minutes(30));

        let token = creds.access_token(&reqwest::Client::new()).await.unwrap();
        assert_eq!(token, "old-token");
    }

    #[tokio::test]
    async fn test_access_token_refreshes_when_expired() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(r#"{"access_token": "fresh-token", "expires_in": 3600}"#),
            )
            .expect(1)
            .mount(&server)
            .await;

        let mut creds = expiring_credentials(format!("{}/token", server.uri()));
        let http = reqwest::Client::new();

        assert_eq!(creds.access_token(&http).await.unwrap(), "fresh-token");
        // Now valid, so the second call does not hit the endpoint again.
        assert_eq!(creds.access_token(&http).await.unwrap(), "fresh-token");
    }
}
