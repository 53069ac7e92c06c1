pub mod google;

use almanac_core::error::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::google::OAuth2Credentials;

/// Load/save/delete contract for OAuth2 credentials.
///
/// The `locked_*` methods assume the caller already holds [`lock`](Self::lock);
/// [`get`](Self::get), [`put`](Self::put) and [`delete`](Self::delete) take it
/// for you. One lock per storage instance means only one
/// load/refresh/save sequence runs at a time for that instance.
#[async_trait]
pub trait CredentialStorage: Send + Sync {
    fn lock(&self) -> &Mutex<()>;

    async fn locked_get(&self) -> Result<Option<OAuth2Credentials>>;
    async fn locked_put(&self, credentials: &OAuth2Credentials) -> Result<()>;
    async fn locked_delete(&self) -> Result<()>;

    async fn get(&self) -> Result<Option<OAuth2Credentials>> {
        let _guard = self.lock().lock().await;
        self.locked_get().await
    }

    async fn put(&self, credentials: &OAuth2Credentials) -> Result<()> {
        let _guard = self.lock().lock().await;
        self.locked_put(credentials).await
    }

    async fn delete(&self) -> Result<()> {
        let _guard = self.lock().lock().await;
        self.locked_delete().await
    }
}
