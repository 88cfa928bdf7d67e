//! A minimal enrichment that forwards events untouched.

use event::EnrichedEvent;

use crate::{Enrichment, Registry};

/// An enrichment that mutates nothing and attaches nothing. Useful for
/// wiring tests and as the smallest example of the capability set.
pub struct Passthrough {
    name: String,
}

impl Passthrough {
    /// Creates a new passthrough enrichment.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Enrichment for Passthrough {
    fn name(&self) -> &str {
        &self.name
    }

    fn apply(&self, _registry: &Registry, event: &mut EnrichedEvent) -> Result<Vec<serde_json::Value>, Vec<String>> {
        tracing::trace!(
            enrichment = %self.name,
            event_id = event.event_id.as_deref().unwrap_or(""),
            "passthrough"
        );
        Ok(vec![])
    }
}
