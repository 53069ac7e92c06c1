use std::sync::Arc;

use almanac_core::config::Config;
use almanac_core::error::{AlmanacError, Result};
use almanac_core::types::{Document, DocumentSnapshot, FieldUpdates, FieldValue};
use futures::stream::BoxStream;
use tokio::sync::OnceCell;
use tracing::{error, info, warn};

use crate::document::DocumentStore;
use crate::libsql_store::LibsqlDocumentStore;

pub const API_KEYS: &str = "api_keys";
pub const OAUTH_CLIENTS: &str = "oauth_clients";
pub const USERS: &str = "users";

/// User field holding the serialized Google Calendar credentials.
pub const GOOGLE_CALENDAR_CREDENTIALS: &str = "google_calendar_credentials";

/// The database client is opened at most once per process.
static CLIENT: OnceCell<Arc<LibsqlDocumentStore>> = OnceCell::const_new();

/// Typed access to API keys, OAuth client secrets and user records.
///
/// Every call goes to the backing store; nothing is cached here.
#[derive(Clone)]
pub struct Datastore {
    store: Arc<dyn DocumentStore>,
}

impl Datastore {
    /// Connect to the process-wide database client, opening it on first use.
    /// Later calls reuse that client and ignore `config`.
    pub async fn connect(config: &Config) -> Result<Self> {
        let client = CLIENT
            .get_or_try_init(|| async move {
                info!(project = %config.project, remote = config.database.is_remote(), "opening datastore");
                LibsqlDocumentStore::open(config).await.map(Arc::new)
            })
            .await?;
        Ok(Self::with_store(client.clone()))
    }

    /// Wrap an already opened document store.
    pub fn with_store(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Retrieve the API key for `service`.
    pub async fn api_key(&self, service: &str) -> Result<String> {
        let missing = || AlmanacError::MissingData(format!("missing API key for: {service}"));

        let snapshot = self.store.get(API_KEYS, service).await?.ok_or_else(missing)?;
        snapshot
            .get_str("api_key")
            .map(str::to_string)
            .ok_or_else(missing)
    }

    pub async fn google_maps_api_key(&self) -> Result<String> {
        self.api_key("google_maps").await
    }

    pub async fn open_weather_api_key(&self) -> Result<String> {
        self.api_key("open_weather").await
    }

    /// Load the OAuth client secrets registered for `provider`.
    pub async fn oauth_client_secrets(&self, provider: &str) -> Result<Document> {
        self.store
            .get(OAUTH_CLIENTS, provider)
            .await?
            .map(|snapshot| snapshot.data)
            .ok_or_else(|| AlmanacError::MissingData(format!("missing OAuth client secrets for: {provider}")))
    }

    pub async fn google_calendar_secrets(&self) -> Result<Document> {
        self.oauth_client_secrets("google_calendar").await
    }

    /// Retrieve the user matching `key`, or `None` if there is no such user.
    pub async fn get_user(&self, key: &str) -> Result<Option<DocumentSnapshot>> {
        let user = self.store.get(USERS, key).await?;
        if user.is_none() {
            warn!(collection = USERS, "user not found");
        }
        Ok(user)
    }

    /// Stream all users. Order is whatever the store returns.
    pub fn list_users(&self) -> BoxStream<'_, Result<DocumentSnapshot>> {
        self.store.stream(USERS)
    }

    /// Merge `data` into the user record, creating it if needed.
    pub async fn set_user(&self, key: &str, data: Document) -> Result<()> {
        self.store.set_merge(USERS, key, data).await
    }

    /// Update fields of an existing user. A missing user is logged and
    /// otherwise ignored; callers that care must check existence themselves.
    pub async fn update_user(&self, key: &str, fields: FieldUpdates) -> Result<()> {
        if !self.store.update(USERS, key, fields).await? {
            error!(collection = USERS, "user not found for update");
        }
        Ok(())
    }

    /// The raw credential blob stored for the user, if any.
    pub async fn google_calendar_credentials_blob(&self, key: &str) -> Result<Option<String>> {
        let Some(user) = self.get_user(key).await? else {
            return Ok(None);
        };

        match user.get(GOOGLE_CALENDAR_CREDENTIALS) {
            Some(serde_json::Value::String(blob)) => Ok(Some(blob.clone())),
            Some(_) => Err(AlmanacError::Serialization(format!(
                "{GOOGLE_CALENDAR_CREDENTIALS} is not a string"
            ))),
            None => {
                warn!("no Google Calendar credentials stored");
                Ok(None)
            }
        }
    }

    pub async fn update_google_calendar_credentials(&self, key: &str, blob: String) -> Result<()> {
        let mut fields = FieldUpdates::new();
        fields.insert(GOOGLE_CALENDAR_CREDENTIALS.to_string(), blob.into());
        self.update_user(key, fields).await
    }

    pub async fn delete_google_calendar_credentials(&self, key: &str) -> Result<()> {
        let mut fields = FieldUpdates::new();
        fields.insert(GOOGLE_CALENDAR_CREDENTIALS.to_string(), FieldValue::Delete);
        self.update_user(key, fields).await
    }
}
