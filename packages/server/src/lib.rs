#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Actix-Web API server for the compliance map cache.
//!
//! Serves point lookups, bulk region reads, and status for every enabled
//! source, plus the alert evaluation endpoint. No endpoint waits on a
//! build: cold and stale sources answer with what is resident and start a
//! background build.

mod handlers;

use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{App, HttpServer, middleware, web};
use compliance_map_alerts::RuleSet;
use compliance_map_cache::{CacheRegistry, PersistenceBackend};
use compliance_map_source::fetcher::ConfiguredFetcher;
use compliance_map_source::registry::enabled_sources;
use compliance_map_source::{SourceError, http_client};

/// Shared application state.
pub struct AppState {
    /// One cache per enabled source.
    pub caches: CacheRegistry,
    /// Threshold rules for alert evaluation.
    pub rules: RuleSet,
}

impl AppState {
    /// Builds caches for the sources selected by `COMPLIANCE_MAP_SOURCES`
    /// with the persistence tiers selected by the environment.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Http`] if the HTTP client cannot be built.
    pub fn from_env() -> Result<Self, SourceError> {
        let client = http_client()?;
        let backend = PersistenceBackend::from_env();
        let caches = CacheRegistry::from_definitions(enabled_sources(None), &backend, |def| {
            Arc::new(ConfiguredFetcher::new(def, client.clone()))
        });

        Ok(Self {
            caches,
            rules: RuleSet::builtin(),
        })
    }

    /// Warms every source from its persistence tiers, then starts builds
    /// for any that are cold or stale.
    pub async fn prewarm(&self) {
        self.caches.warm_all().await;
        for cache in self.caches.iter() {
            if cache.get().await.is_none() {
                log::info!("{}: cold after warm-up, building", cache.id());
            }
        }
    }
}

/// Registers the `/api` routes.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api")
            .route("/health", web::get().to(handlers::health))
            .route("/sources", web::get().to(handlers::sources))
            .route("/sources/{id}/status", web::get().to(handlers::status))
            .route("/sources/{id}/lookup", web::get().to(handlers::lookup))
            .route(
                "/sources/{id}/regions/{code}",
                web::get().to(handlers::region),
            )
            .route(
                "/sources/{id}/entities/{entity_id}",
                web::get().to(handlers::entity),
            )
            .route("/sources/{id}/build", web::post().to(handlers::build))
            .route("/alerts/evaluate", web::post().to(handlers::evaluate)),
    );
}

/// Starts the compliance map API server.
///
/// Loads the enabled source definitions, selects persistence backends from
/// the environment, warms the caches in the background, and starts the
/// Actix-Web HTTP server. The caller provides the async runtime (e.g. via
/// `#[actix_web::main]`).
///
/// # Errors
///
/// Returns an `std::io::Result` error if the HTTP client cannot be built,
/// or if the HTTP server fails to bind or encounters a runtime error.
pub async fn run_server() -> std::io::Result<()> {
    pretty_env_logger::init_custom_env("RUST_LOG");

    log::info!("Loading sources...");
    let state = AppState::from_env().map_err(std::io::Error::other)?;
    log::info!(
        "Loaded {} sources: {}",
        state.caches.len(),
        state
            .caches
            .iter()
            .map(|c| c.id())
            .collect::<Vec<_>>()
            .join(", ")
    );
    let state = web::Data::new(state);

    let warming = state.clone();
    tokio::spawn(async move { warming.prewarm().await });

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);

    log::info!("Starting server on {bind_addr}:{port}");

    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .app_data(state.clone())
            .configure(configure)
    })
    .bind((bind_addr, port))?
    .run()
    .await
}
