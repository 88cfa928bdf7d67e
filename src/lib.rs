#![doc = include_str!("../README.md")]
#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results,
    variant_size_differences
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Sluice is a streaming enrichment pipeline built from narrow, composable
//! crates: a **source** pulls raw collector payloads and hands out per-record
//! acknowledge handles; a pool of **enrich** workers turns each payload into
//! a list of good/bad outcomes through a configurable enrichment chain; the
//! **sink** layer batches, partitions, and retries publication to the good,
//! pii, and bad output streams; the **assets** manager refreshes
//! enrichment-referenced files in the background and swaps the registry
//! behind a pause/drain barrier; and the **runtime** wires the three
//! concurrent streams together and owns the shutdown choreography.
//!
//! Deployment flavours supply the broker-specific collaborators (consumer,
//! producers, decoder, schema client, enrichments) through the traits in
//! these crates and start the pipeline with [`runtime::run`].

pub use assets;
pub use config;
pub use enrich;
pub use event;
pub use runtime;
pub use signal;
pub use sink;
pub use source;
pub use task;
pub use telemetry;
