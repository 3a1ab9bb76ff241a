//! Service wiring shared by the HTTP server and the CLI.

use anyhow::Result;
use std::sync::Arc;

use pagewise_core::store::{SecretStore, Store};

use crate::ask::Asker;
use crate::db;
use crate::embed_worker::PageEvents;
use crate::embedding::{self, Embedder};
use crate::keys::KeyResolver;
use crate::migrate;
use crate::providers::{HttpProviderFactory, ProviderFactory};
use crate::retriever::Retriever;
use crate::settings::SettingsSource;
use crate::sqlite_store::SqliteStore;
use crate::throttle::Throttle;

/// Every long-lived component, built once per process.
#[derive(Clone)]
pub struct Services {
    pub settings: Arc<dyn SettingsSource>,
    pub store: Arc<dyn Store>,
    pub secrets: Arc<dyn SecretStore>,
    pub embedder: Arc<dyn Embedder>,
    pub throttle: Arc<Throttle>,
    pub keys: Arc<KeyResolver>,
    pub asker: Arc<Asker>,
    /// Present when an embed worker is running.
    pub events: Option<PageEvents>,
}

impl Services {
    /// Assemble the pipeline from its storage and provider seams.
    pub fn new(
        settings: Arc<dyn SettingsSource>,
        store: Arc<dyn Store>,
        secrets: Arc<dyn SecretStore>,
        factory: Arc<dyn ProviderFactory>,
        embedder: Arc<dyn Embedder>,
    ) -> Self {
        let throttle = Arc::new(Throttle::new(settings.clone()));
        let keys = Arc::new(KeyResolver::new(secrets.clone(), factory, settings.clone()));
        let retriever = Arc::new(Retriever::new(
            store.clone(),
            settings.clone(),
            embedder.clone(),
        ));
        let asker = Arc::new(Asker::new(
            store.clone(),
            throttle.clone(),
            keys.clone(),
            retriever,
            settings.clone(),
        ));
        Self {
            settings,
            store,
            secrets,
            embedder,
            throttle,
            keys,
            asker,
            events: None,
        }
    }

    pub fn with_events(mut self, events: PageEvents) -> Self {
        self.events = Some(events);
        self
    }

    /// Production services: SQLite store, HTTP providers, configured embedder.
    /// Runs migrations first.
    pub async fn open(settings: Arc<dyn SettingsSource>) -> Result<Self> {
        let config = settings.current();
        let pool = db::connect(&config).await?;
        migrate::migrate_pool(&pool).await?;
        let sqlite = Arc::new(SqliteStore::new(pool));

        let factory = Arc::new(HttpProviderFactory::new(&config.providers)?);
        let embedder = embedding::create_embedder(&config.embedding, &config.providers)?;

        Ok(Self::new(settings, sqlite.clone(), sqlite, factory, embedder))
    }
}
