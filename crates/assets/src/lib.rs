#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! The asset manager: fetches the remote files referenced by enrichments,
//! installs them content-addressed under a local directory, and swaps the
//! enrichment registry behind a pause/drain barrier whenever an asset
//! changes.

use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use enrich::{AssetMap, Enrichment, Registry, SchemaClient, SharedRegistry};
use signal::PauseGate;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// All the errors that can occur with the asset manager.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The HTTP client could not be constructed.
    #[error("asset client error (reason: {error})")]
    Client {
        /// The error message.
        error: String,
    },

    /// One asset could not be fetched.
    #[error("asset fetch error (uri: {uri}, reason: {error})")]
    Fetch {
        /// The asset URI.
        uri: String,
        /// The error message.
        error: String,
    },

    /// One asset file could not be written or removed.
    #[error("asset io error (path: {path}, reason: {error})")]
    Io {
        /// The local file path.
        path: String,
        /// The error message.
        error: String,
    },

    /// The replacement registry could not be built.
    #[error("registry build error: {0}")]
    Registry(#[from] enrich::Error),
}

/// Retrieval of one remote asset. The production implementation wraps an
/// HTTP client; object-storage deployments plug their own in.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Fetches the full content of one asset.
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, Error>;
}

/// HTTP asset fetcher with a per-file timeout.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    /// Creates a fetcher whose requests time out after `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| Error::Client { error: err.to_string() })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, uri: &str) -> Result<Vec<u8>, Error> {
        let fetch_error = |err: reqwest::Error| Error::Fetch {
            uri: uri.to_string(),
            error: err.to_string(),
        };

        let response = self.client.get(uri).send().await.map_err(fetch_error)?;
        let response = response.error_for_status().map_err(fetch_error)?;
        Ok(response.bytes().await.map_err(fetch_error)?.to_vec())
    }
}

/// `(enrichment-name, asset-URI)`.
type AssetKey = (String, String);

#[derive(Debug, Clone)]
struct InstalledAsset {
    path: PathBuf,
    hash: String,
}

struct StagedAsset {
    key: AssetKey,
    bytes: Vec<u8>,
    hash: String,
}

/// Owns the asset state and the registry reference.
///
/// The refresh cycle re-fetches every asset, and when any content hash
/// changed performs the coherent swap: assert the pause signal, wait for
/// in-flight enrichment calls to drain, build a registry wired to the new
/// file paths, replace the reference atomically, delete obsolete files, and
/// de-assert the pause. The pause is held by a guard, so it is released on
/// every exit path.
pub struct AssetManager {
    directory: PathBuf,
    fetcher: Arc<dyn AssetFetcher>,
    enrichments: Vec<Arc<dyn Enrichment>>,
    schema_client: Arc<dyn SchemaClient>,
    registry: SharedRegistry,
    gate: Arc<PauseGate>,
    installed: HashMap<AssetKey, InstalledAsset>,
}

impl AssetManager {
    /// Creates an asset manager over the shared registry reference.
    pub fn new(
        directory: PathBuf,
        fetcher: Arc<dyn AssetFetcher>,
        enrichments: Vec<Arc<dyn Enrichment>>,
        schema_client: Arc<dyn SchemaClient>,
        registry: SharedRegistry,
        gate: Arc<PauseGate>,
    ) -> Self {
        Self {
            directory,
            fetcher,
            enrichments,
            schema_client,
            registry,
            gate,
            installed: HashMap::new(),
        }
    }

    /// Fetches every configured asset once and publishes the first real
    /// registry. A failure here is fatal and aborts startup.
    pub async fn initial_load(&mut self) -> Result<(), Error> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|err| Error::Io {
                path: self.directory.display().to_string(),
                error: err.to_string(),
            })?;

        let staged = self.fetch_all().await?;
        let mut installed = HashMap::new();
        for asset in staged {
            let path = self.install(&asset).await?;
            let _ = installed.insert(
                asset.key,
                InstalledAsset {
                    path,
                    hash: asset.hash,
                },
            );
        }
        self.installed = installed;

        let registry = self.build_registry()?;
        self.registry.store(Arc::new(registry));

        info!(asset_count = %self.installed.len(), "assets installed, registry published");
        Ok(())
    }

    /// One refresh cycle. Returns true when the registry was swapped.
    ///
    /// Any fetch failure abandons the whole cycle before the pause is
    /// asserted; the previous registry and files stay in use.
    pub async fn refresh(&mut self) -> Result<bool, Error> {
        let staged = self.fetch_all().await?;

        let changed = staged
            .iter()
            .any(|asset| self.installed.get(&asset.key).map(|i| i.hash.as_str()) != Some(asset.hash.as_str()));
        if !changed {
            debug!("assets unchanged");
            return Ok(false);
        }

        // Coherent swap: the guard asserts the pause and waits for every
        // in-flight enrichment call to drain.
        let paused = self.gate.pause().await;

        let mut new_installed = HashMap::new();
        let mut fresh_paths = Vec::new();
        let mut obsolete = Vec::new();
        for asset in staged {
            match self.installed.get(&asset.key) {
                Some(current) if current.hash == asset.hash => {
                    let _ = new_installed.insert(asset.key, current.clone());
                }
                current => {
                    if let Some(current) = current {
                        obsolete.push(current.path.clone());
                    }
                    let path = match self.install(&asset).await {
                        Ok(path) => path,
                        Err(err) => {
                            remove_files(&fresh_paths).await;
                            return Err(err);
                        }
                    };
                    fresh_paths.push(path.clone());
                    let _ = new_installed.insert(
                        asset.key,
                        InstalledAsset {
                            path,
                            hash: asset.hash,
                        },
                    );
                }
            }
        }

        let registry = {
            let previous = std::mem::replace(&mut self.installed, new_installed);
            match self.build_registry() {
                Ok(registry) => registry,
                Err(err) => {
                    self.installed = previous;
                    remove_files(&fresh_paths).await;
                    return Err(err);
                }
            }
        };
        self.registry.store(Arc::new(registry));

        remove_files(&obsolete).await;
        drop(paused);

        info!(asset_count = %self.installed.len(), "registry swapped to refreshed assets");
        Ok(true)
    }

    /// Deletes every installed file. Called once the pipeline has released
    /// the enrich stage.
    pub async fn unload(&mut self) {
        let paths: Vec<PathBuf> = self.installed.drain().map(|(_, asset)| asset.path).collect();
        remove_files(&paths).await;
        info!("assets unloaded");
    }

    /// The shared registry reference this manager writes.
    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    async fn fetch_all(&self) -> Result<Vec<StagedAsset>, Error> {
        let mut staged = Vec::new();
        for enrichment in &self.enrichments {
            for uri in enrichment.asset_uris() {
                let bytes = self.fetcher.fetch(&uri).await?;
                let hash = blake3::hash(&bytes).to_hex().to_string();
                staged.push(StagedAsset {
                    key: (enrichment.name().to_string(), uri),
                    bytes,
                    hash,
                });
            }
        }
        Ok(staged)
    }

    async fn install(&self, asset: &StagedAsset) -> Result<PathBuf, Error> {
        let path = self.directory.join(file_name(&asset.key.1, &asset.hash));
        tokio::fs::write(&path, &asset.bytes).await.map_err(|err| Error::Io {
            path: path.display().to_string(),
            error: err.to_string(),
        })?;
        Ok(path)
    }

    fn build_registry(&self) -> Result<Registry, Error> {
        let assets: AssetMap = self
            .installed
            .iter()
            .map(|(key, asset)| (key.clone(), asset.path.clone()))
            .collect();
        Ok(Registry::new(
            self.enrichments.clone(),
            assets,
            self.schema_client.clone(),
        )?)
    }
}

/// The background refresh stream: one refresh cycle per period until the
/// stop flag flips.
pub async fn run_refresh_loop(manager: Arc<Mutex<AssetManager>>, period: Duration, mut stop: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick of a tokio interval completes immediately.
    let _ = interval.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => break,
            _ = interval.tick() => {
                match manager.lock().await.refresh().await {
                    Ok(true) => {}
                    Ok(false) => {}
                    Err(error) => {
                        warn!(%error, "asset refresh abandoned, previous registry retained");
                    }
                }
            }
        }
    }
    debug!("asset refresh loop stopped");
}

/// Content-addressed install name: the last URI segment plus a hash prefix.
fn file_name(uri: &str, hash: &str) -> String {
    let base = uri
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("asset");
    let base: String = base
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' { c } else { '_' })
        .collect();
    format!("{}-{}", base, &hash[..16.min(hash.len())])
}

async fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(error) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), %error, "asset file not removed");
        }
    }
}
