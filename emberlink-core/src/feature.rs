//! Feature registration and lifecycle
//!
//! A feature is a named instrumentation source wired into both the
//! aggregator (a buffer slot) and the scheduler (a harvest job). The
//! registry tracks which features exist and carries the one-way `blocked`
//! flag; blocking is monotonic — once true it never returns to false, and
//! every subsequent record or harvest trigger for that feature is a no-op.
//!
//! The registry is an explicit instance constructed once per session and
//! passed by reference to its collaborators, not a module-level singleton.

use std::collections::HashMap;

/// Registration entry for one feature.
#[derive(Debug, Clone)]
pub struct FeatureRegistration {
    /// One-way flag; see module docs
    pub blocked: bool,
    /// Agent-relative registration time in milliseconds
    pub registered_at_ms: i64,
}

/// Mapping from feature name to its registration.
#[derive(Debug, Default)]
pub struct FeatureRegistry {
    features: HashMap<String, FeatureRegistration>,
}

impl FeatureRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a feature. Re-registering keeps the existing entry (and its
    /// `blocked` flag — blocking survives re-registration).
    pub fn register(&mut self, feature: &str, registered_at_ms: i64) {
        self.features
            .entry(feature.to_string())
            .or_insert(FeatureRegistration {
                blocked: false,
                registered_at_ms,
            });
    }

    /// Remove a feature entirely (session teardown).
    pub fn deregister(&mut self, feature: &str) {
        self.features.remove(feature);
    }

    /// Set the one-way `blocked` flag. Returns true if the flag changed.
    pub fn block(&mut self, feature: &str) -> bool {
        match self.features.get_mut(feature) {
            Some(entry) if !entry.blocked => {
                entry.blocked = true;
                true
            }
            _ => false,
        }
    }

    /// Queried by instrumentation call sites before recording.
    pub fn is_blocked(&self, feature: &str) -> bool {
        self.features
            .get(feature)
            .map(|entry| entry.blocked)
            .unwrap_or(false)
    }

    /// Whether a feature has been registered.
    pub fn is_registered(&self, feature: &str) -> bool {
        self.features.contains_key(feature)
    }

    /// Registered feature names, sorted.
    pub fn feature_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.features.keys().cloned().collect();
        names.sort();
        names
    }
}
