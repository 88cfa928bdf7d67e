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

//! The enrichment dispatcher and its collaborators: the decoded payload
//! model, the failure-record model, the enrichment registry, and the narrow
//! traits through which external enrichment logic is consumed.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use event::EnrichedEvent;
use serde::Serialize;

pub mod badrow;
pub mod dispatcher;
pub mod passthrough;

/// All the errors of this crate.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Two enrichments with the same name were configured.
    #[error("duplicate enrichment '{enrichment}'")]
    DuplicateEnrichment {
        /// The enrichment name.
        enrichment: String,
    },
}

/// Identity of the enrichment processor, stamped on every event (`v_etl`)
/// and every failure record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessorId {
    /// The artifact name.
    pub name: String,
    /// The artifact version.
    pub version: String,
}

impl ProcessorId {
    /// Creates a processor identity.
    pub fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// The `name-version` tag written to the `v_etl` field.
    pub fn tag(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

/// The decoded, structured form of one raw record: zero-or-more logical
/// events plus contextual metadata.
#[derive(Debug, Clone, Default)]
pub struct CollectorPayload {
    /// Timestamp stamped by the collector.
    pub collector_tstamp: Option<DateTime<Utc>>,
    /// Source IP of the tracked device.
    pub source_ip: Option<String>,
    /// User agent of the tracked device.
    pub useragent: Option<String>,
    /// Raw collector headers.
    pub headers: Vec<String>,
    /// The logical events, each a partially-populated seed of the canonical
    /// event.
    pub events: Vec<EnrichedEvent>,
}

/// A decode failure, carrying the messages for the resulting
/// `cpformat-violation` failure record.
#[derive(Debug, Clone)]
pub struct DecodeFailure {
    /// The failure messages.
    pub messages: Vec<String>,
}

/// The collector payload binary decoder.
pub trait Decoder: Send + Sync {
    /// Decodes one raw record. `Ok(None)` means a recognized payload that
    /// carries no events.
    fn decode(&self, bytes: &[u8]) -> Result<Option<CollectorPayload>, DecodeFailure>;
}

/// The schema registry client used for validation.
pub trait SchemaClient: Send + Sync {
    /// Validates one self-describing JSON value against its schema.
    fn validate(&self, json: &serde_json::Value, schema_key: &str) -> Result<(), Vec<String>>;
}

/// The capability set every enrichment exposes.
pub trait Enrichment: Send + Sync {
    /// The unique name of the enrichment.
    fn name(&self) -> &str;

    /// URIs of the remote files this enrichment needs, if any.
    fn asset_uris(&self) -> Vec<String> {
        vec![]
    }

    /// Applies the enrichment to one event, mutating it in place. On
    /// success, returns the self-describing contexts to attach; on failure,
    /// returns one or more failure messages.
    fn apply(&self, registry: &Registry, event: &mut EnrichedEvent) -> Result<Vec<serde_json::Value>, Vec<String>>;
}

/// The canonical PII-split rule: given an enriched event, derive
/// zero-or-one event carrying the personally-identifying fields.
pub trait PiiExtractor: Send + Sync {
    /// Derives the PII event, when the source event carries any PII field.
    fn extract(&self, event: &EnrichedEvent) -> Option<EnrichedEvent>;
}

/// The asset state: a mapping from `(enrichment-name, asset-URI)` to the
/// installed local file path.
pub type AssetMap = HashMap<(String, String), PathBuf>;

/// An immutable snapshot of the configured enrichments, their installed
/// asset files, and the shared schema client.
///
/// Snapshots are swapped atomically by the asset manager; a dispatch call
/// reads the reference exactly once, so every lookup within one call
/// resolves from the same snapshot.
pub struct Registry {
    enrichments: Vec<Arc<dyn Enrichment>>,
    assets: AssetMap,
    schema_client: Arc<dyn SchemaClient>,
}

impl Registry {
    /// Builds a snapshot, rejecting duplicate enrichment names.
    pub fn new(
        enrichments: Vec<Arc<dyn Enrichment>>,
        assets: AssetMap,
        schema_client: Arc<dyn SchemaClient>,
    ) -> Result<Self, Error> {
        let mut seen = std::collections::HashSet::new();
        for enrichment in &enrichments {
            if !seen.insert(enrichment.name().to_string()) {
                return Err(Error::DuplicateEnrichment {
                    enrichment: enrichment.name().to_string(),
                });
            }
        }
        Ok(Self {
            enrichments,
            assets,
            schema_client,
        })
    }

    /// The enrichments, in chain order.
    pub fn enrichments(&self) -> &[Arc<dyn Enrichment>] {
        &self.enrichments
    }

    /// Looks an enrichment up by name.
    pub fn by_name(&self, name: &str) -> Option<&Arc<dyn Enrichment>> {
        self.enrichments.iter().find(|e| e.name() == name)
    }

    /// The installed local path of one asset.
    pub fn asset_path(&self, enrichment: &str, uri: &str) -> Option<&Path> {
        self.assets
            .get(&(enrichment.to_string(), uri.to_string()))
            .map(PathBuf::as_path)
    }

    /// The shared schema client.
    pub fn schema_client(&self) -> &Arc<dyn SchemaClient> {
        &self.schema_client
    }
}

/// The shared, atomically-swappable registry reference.
pub type SharedRegistry = Arc<ArcSwap<Registry>>;

/// Wraps an initial snapshot into the shared reference.
pub fn shared_registry(registry: Registry) -> SharedRegistry {
    Arc::new(ArcSwap::from_pointee(registry))
}
