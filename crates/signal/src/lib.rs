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

//! The pause signal: the shared gate asserted around a registry swap.
//!
//! Enrichment calls hold a shared permit for the duration of one dispatch;
//! the asset manager takes the exclusive permit to swap the registry.
//! Taking the exclusive permit asserts the pause (new shared acquisitions
//! queue behind it) and waits for every in-flight dispatch to drain, which
//! is exactly the pause/drain barrier of a coherent swap.

use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The pause gate shared between the source, the enrich stage, and the
/// asset manager.
///
/// Built on a write-preferring `tokio::sync::RwLock`: once `pause` is
/// pending, new `enter` calls block until the pause is released, so the
/// swap cannot be starved by a steady record flow.
#[derive(Debug, Default)]
pub struct PauseGate {
    lock: RwLock<()>,
}

/// A shared permit held for the duration of one enrichment dispatch.
#[derive(Debug)]
pub struct EnterPermit<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// The exclusive permit held while the registry is swapped. The pause is
/// de-asserted when the permit is dropped, on every exit path.
#[derive(Debug)]
pub struct PausePermit<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl PauseGate {
    /// Creates a new, unasserted gate.
    pub fn new() -> Self {
        Default::default()
    }

    /// Acquires a shared permit, waiting first if the pause is asserted.
    pub async fn enter(&self) -> EnterPermit<'_> {
        EnterPermit {
            _guard: self.lock.read().await,
        }
    }

    /// Suspends while the pause is asserted, without keeping a permit.
    pub async fn wait_if_paused(&self) {
        let _guard = self.lock.read().await;
    }

    /// Asserts the pause and waits for all in-flight permits to drain.
    pub async fn pause(&self) -> PausePermit<'_> {
        PausePermit {
            _guard: self.lock.write().await,
        }
    }

    /// Returns true when the pause is asserted (or pending).
    pub fn is_paused(&self) -> bool {
        self.lock.try_read().is_err()
    }
}
