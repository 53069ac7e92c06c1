use almanac_core::error::{AlmanacError, Result};
use almanac_core::types::Document;
use chrono::Utc;
use tracing::warn;

use super::credentials::{OAuth2Credentials, TokenEndpointError, GOOGLE_TOKEN_URI};

const AUTH_URI: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Read-only calendar access is all the display needs.
pub const CALENDAR_SCOPE: &str = "https://www.googleapis.com/auth/calendar.readonly";

/// Authorization-code flow for connecting a user's Google Calendar.
#[derive(Debug, Clone)]
pub struct GoogleCalendarFlow {
    client_id: String,
    client_secret: String,
    auth_uri: String,
    token_uri: String,
    scopes: Vec<String>,
}

impl GoogleCalendarFlow {
    /// Build the flow from a stored client-secrets document. Accepts the
    /// `web` and `installed` layouts Google hands out, or a flat document.
    pub fn from_client_secrets(secrets: &Document) -> Result<Self> {
        let section = ["web", "installed"]
            .iter()
            .find_map(|name| secrets.get(*name).and_then(|v| v.as_object()))
            .unwrap_or(secrets);

        let field = |name: &str| section.get(name).and_then(|v| v.as_str()).map(str::to_string);
        let missing = |name: &str| AlmanacError::MissingData(format!("client secrets missing {name}"));

        Ok(Self {
            client_id: field("client_id").ok_or_else(|| missing("client_id"))?,
            client_secret: field("client_secret").ok_or_else(|| missing("client_secret"))?,
            auth_uri: field("auth_uri").unwrap_or_else(|| AUTH_URI.to_string()),
            token_uri: field("token_uri").unwrap_or_else(|| GOOGLE_TOKEN_URI.to_string()),
            scopes: vec![CALENDAR_SCOPE.to_string()],
        })
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    /// The consent page URL. Requests offline access so a refresh token is issued.
    pub fn authorization_url(&self, redirect_uri: &str, state: &str) -> Result<String> {
        let scope = self.scopes.join(" ");
        let url = reqwest::Url::parse_with_params(
            &self.auth_uri,
            &[
                ("client_id", self.client_id.as_str()),
                ("redirect_uri", redirect_uri),
                ("response_type", "code"),
                ("scope", scope.as_str()),
                ("access_type", "offline"),
                ("prompt", "consent"),
                ("state", state),
            ],
        )
        .map_err(|e| AlmanacError::Config(format!("invalid auth_uri: {e}")))?;
        Ok(url.into())
    }

    /// Exchange an authorization code for credentials ready to be stored.
    pub async fn exchange_code(
        &self,
        http: &reqwest::Client,
        code: &str,
        redirect_uri: &str,
    ) -> std::result::Result<OAuth2Credentials, TokenEndpointError> {
        let params = [
            ("code", code),
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
        ];

        let resp = http.post(&self.token_uri).form(&params).send().await?;
        let status = resp.status().as_u16();
        let text = resp.text().await?;

        if status != 200 {
            return Err(TokenEndpointError::Rejected {
                status,
                message: text,
            });
        }

        let mut credentials = OAuth2Credentials::new(&self.client_id, &self.client_secret);
        credentials.token_uri = self.token_uri.clone();
        credentials.scopes = self.scopes.clone();
        credentials.apply_token_response(&text, Utc::now())?;

        if credentials.refresh_token.is_none() {
            warn!("token exchange returned no refresh token");
        }
        Ok(credentials)
    }
}
