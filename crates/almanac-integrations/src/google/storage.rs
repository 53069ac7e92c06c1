use std::sync::{Arc, Weak};

use almanac_core::error::{AlmanacError, Result};
use almanac_store::Datastore;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::credentials::OAuth2Credentials;
use crate::CredentialStorage;

/// Google Calendar credentials of one user, kept in the user's record.
pub struct GoogleCalendarStorage {
    datastore: Datastore,
    key: String,
    http: reqwest::Client,
    lock: Mutex<()>,
    this: Weak<GoogleCalendarStorage>,
}

impl GoogleCalendarStorage {
    pub fn new(datastore: Datastore, key: impl Into<String>) -> Arc<Self> {
        Self::with_http_client(datastore, key, reqwest::Client::new())
    }

    /// Use `http` for token refreshes.
    pub fn with_http_client(
        datastore: Datastore,
        key: impl Into<String>,
        http: reqwest::Client,
    ) -> Arc<Self> {
        let key = key.into();
        Arc::new_cyclic(|this| Self {
            datastore,
            key,
            http,
            lock: Mutex::new(()),
            this: this.clone(),
        })
    }

    /// Attach this storage so later refreshes persist through it.
    fn attach(&self, mut credentials: OAuth2Credentials) -> OAuth2Credentials {
        if let Some(this) = self.this.upgrade() {
            credentials.set_store(this);
        }
        credentials
    }

    async fn discard(&self) -> Result<Option<OAuth2Credentials>> {
        warn!("deleting Google Calendar credentials");
        self.locked_delete().await?;
        Ok(None)
    }
}

#[async_trait]
impl CredentialStorage for GoogleCalendarStorage {
    fn lock(&self) -> &Mutex<()> {
        &self.lock
    }

    /// Load the user's credentials, refreshing them once if they expired.
    /// Anything unusable is deleted so the next load sees nothing.
    async fn locked_get(&self) -> Result<Option<OAuth2Credentials>> {
        let blob = match self.datastore.google_calendar_credentials_blob(&self.key).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return Ok(None),
            Err(AlmanacError::Serialization(e)) => {
                error!(error = %e, "unreadable Google Calendar credentials");
                return self.discard().await;
            }
            Err(e) => return Err(e),
        };

        let mut credentials = match OAuth2Credentials::from_json(&blob) {
            Ok(credentials) => credentials,
            Err(e) => {
                error!(error = %e, "unparseable Google Calendar credentials");
                return self.discard().await;
            }
        };

        if credentials.is_valid() {
            return Ok(Some(self.attach(credentials)));
        }

        info!("refreshing Google Calendar credentials");
        match credentials.refresh_request(&self.http).await {
            Ok(()) => {
                self.locked_put(&credentials).await?;
                Ok(Some(self.attach(credentials)))
            }
            Err(e) => {
                warn!(error = %e, "Google Calendar refresh failed");
                self.discard().await
            }
        }
    }

    async fn locked_put(&self, credentials: &OAuth2Credentials) -> Result<()> {
        self.datastore
            .update_google_calendar_credentials(&self.key, credentials.to_json()?)
            .await
    }

    async fn locked_delete(&self) -> Result<()> {
        self.datastore
            .delete_google_calendar_credentials(&self.key)
            .await
    }
}
