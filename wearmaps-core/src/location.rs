//! Location samples and the provider selection criterion.

use serde::{Deserialize, Serialize};

/// One position fix.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub latitude: f64,
    pub longitude: f64,
}

impl LocationSample {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Accuracy {
    /// Any provider will do.
    #[default]
    NoRequirement,
    Fine,
    Coarse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PowerRequirement {
    #[default]
    NoRequirement,
    Low,
    Medium,
    High,
}

/// Accuracy/power trade-off used to pick a provider for a last-known query.
/// The default places no constraint, so the best available provider is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Criteria {
    pub accuracy: Accuracy,
    pub power: PowerRequirement,
}

/// Whether location updates are being streamed to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocationState {
    #[default]
    Idle,
    Subscribed,
}
