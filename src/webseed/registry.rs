//! Per-torrent web-seed contexts
//!
//! A torrent gets its engine at registration and loses it at
//! unregistration. Lookups hold the registry lock only long enough to clone
//! the engine handle.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::WebSeedConfig;
use crate::error::TorrentError;
use crate::storage::TorrentStorage;
use crate::webseed::engine::WebSeedEngine;
use crate::webseed::planner::{FileStats, MirrorStats};
use crate::webseed::transport::MirrorTransport;

/// Web-seed engines keyed by torrent id
pub struct WebSeedRegistry {
    transport: Arc<dyn MirrorTransport>,
    config: WebSeedConfig,
    torrents: Mutex<HashMap<String, Arc<WebSeedEngine>>>,
}

impl WebSeedRegistry {
    pub fn new(transport: Arc<dyn MirrorTransport>, config: WebSeedConfig) -> Self {
        Self {
            transport,
            config,
            torrents: Mutex::new(HashMap::new()),
        }
    }

    /// Create the engine for `id`, mirroring from the metainfo web seeds
    /// plus `extra_mirrors`. The engine is not started.
    ///
    /// Completion is re-checked first, so a torrent with nothing to fetch
    /// signals completion here.
    pub async fn register(
        &self,
        id: &str,
        storage: Arc<TorrentStorage>,
        extra_mirrors: &[String],
    ) -> Result<Arc<WebSeedEngine>> {
        let mut torrents = self.torrents.lock().await;
        if torrents.contains_key(id) {
            return Err(
                TorrentError::validation_error_with_field(format!("Torrent {} already registered", id), "id").into(),
            );
        }

        storage.check_completion().await?;
        let info = storage.info().clone();
        let mut mirrors = info.web_seeds();
        mirrors.extend(extra_mirrors.iter().cloned());
        let engine = Arc::new(WebSeedEngine::new(
            info,
            storage,
            self.transport.clone(),
            self.config.clone(),
            &mirrors,
        ));
        torrents.insert(id.to_string(), engine.clone());
        info!("Registered {} for web seeding", id);
        Ok(engine)
    }

    /// Stop and drop the engine for `id`. Returns `false` if none was registered.
    pub async fn unregister(&self, id: &str) -> bool {
        let engine = self.torrents.lock().await.remove(id);
        match engine {
            Some(engine) => {
                engine.stop().await;
                info!("Unregistered {}", id);
                true
            }
            None => {
                debug!("Unregister of unknown torrent {}", id);
                false
            }
        }
    }

    pub async fn engine(&self, id: &str) -> Option<Arc<WebSeedEngine>> {
        self.torrents.lock().await.get(id).cloned()
    }

    async fn require(&self, id: &str) -> Result<Arc<WebSeedEngine>> {
        self.engine(id).await.ok_or_else(|| {
            TorrentError::validation_error_with_field(format!("Unknown torrent: {}", id), "id").into()
        })
    }

    /// Idempotent
    pub async fn start_web_seeding(&self, id: &str) -> Result<()> {
        self.require(id).await?.start().await;
        Ok(())
    }

    /// Idempotent
    pub async fn stop_web_seeding(&self, id: &str) -> Result<()> {
        self.require(id).await?.stop().await;
        Ok(())
    }

    /// Tell the engine that selection or completion changed
    pub async fn rescan(&self, id: &str) -> Result<()> {
        self.require(id).await?.rescan();
        Ok(())
    }

    pub async fn mirror_stats(&self, id: &str) -> Result<Vec<MirrorStats>> {
        Ok(self.require(id).await?.mirror_stats().await)
    }

    pub async fn file_stats(&self, id: &str) -> Result<Vec<FileStats>> {
        Ok(self.require(id).await?.file_stats().await)
    }

    /// Stop every engine, keeping the registrations
    pub async fn shutdown(&self) {
        let engines: Vec<Arc<WebSeedEngine>> = self.torrents.lock().await.values().cloned().collect();
        for engine in engines {
            engine.stop().await;
        }
    }
}
