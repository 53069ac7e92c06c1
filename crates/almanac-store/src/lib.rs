//! Document storage for almanac.
//!
//! [`DocumentStore`] is the narrow contract the rest of the workspace needs
//! from a document database; [`LibsqlDocumentStore`] implements it on top of
//! libsql, and [`Datastore`] is the typed facade over the `api_keys`,
//! `oauth_clients` and `users` collections.

pub mod datastore;
pub mod document;
pub mod libsql_store;

pub use datastore::Datastore;
pub use document::DocumentStore;
pub use libsql_store::LibsqlDocumentStore;
