mod credentials;
mod oauth;
mod storage;

pub use credentials::{OAuth2Credentials, TokenEndpointError, GOOGLE_REVOKE_URI, GOOGLE_TOKEN_URI};
pub use oauth::{GoogleCalendarFlow, CALENDAR_SCOPE};
pub use storage::GoogleCalendarStorage;
