use almanac_core::config::Config;
use almanac_core::error::{AlmanacError, Result};
use almanac_integrations::google::GoogleCalendarStorage;
use almanac_integrations::CredentialStorage;
use almanac_store::datastore::GOOGLE_CALENDAR_CREDENTIALS;
use almanac_store::Datastore;
use futures::TryStreamExt;
use std::path::Path;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "almanac=info".into()),
        )
        .init();

    let config_path =
        std::env::var("ALMANAC_CONFIG").unwrap_or_else(|_| "almanac.toml".to_string());

    let config = Config::load(Path::new(&config_path)).unwrap_or_else(|e| {
        error!("failed to load config: {e}");
        std::process::exit(1);
    });

    let datastore = Datastore::connect(&config).await.unwrap_or_else(|e| {
        error!("failed to open datastore: {e}");
        std::process::exit(1);
    });

    check_prerequisites(&datastore).await;

    if let Err(e) = refresh_calendar_credentials(&datastore).await {
        error!("credential refresh failed: {e}");
        std::process::exit(1);
    }
}

/// Report configuration documents the rest of the system cannot run without.
async fn check_prerequisites(datastore: &Datastore) {
    for (name, result) in [
        ("google_maps", datastore.google_maps_api_key().await.map(|_| ())),
        ("open_weather", datastore.open_weather_api_key().await.map(|_| ())),
        ("google_calendar", datastore.google_calendar_secrets().await.map(|_| ())),
    ] {
        match result {
            Ok(()) => info!(service = name, "configured"),
            Err(e @ AlmanacError::MissingData(_)) => error!(service = name, "{e}"),
            Err(e) => warn!(service = name, "could not check: {e}"),
        }
    }
}

/// Load every user's calendar credentials once, which refreshes expired
/// tokens and clears ones that can no longer be refreshed.
async fn refresh_calendar_credentials(datastore: &Datastore) -> Result<()> {
    let http = reqwest::Client::new();
    let (mut usable, mut cleared) = (0usize, 0usize);

    let mut users = datastore.list_users();
    while let Some(user) = users.try_next().await? {
        if user.get(GOOGLE_CALENDAR_CREDENTIALS).is_none() {
            continue;
        }
        let storage = GoogleCalendarStorage::with_http_client(datastore.clone(), user.id, http.clone());
        match storage.get().await? {
            Some(_) => usable += 1,
            None => cleared += 1,
        }
    }

    info!(usable, cleared, "calendar credentials checked");
    Ok(())
}
