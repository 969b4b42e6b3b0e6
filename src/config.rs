#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Knobs of the per-frame [`Runner`](crate::runner::Runner).
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct RuntimeConfig {
    /// Whether nodes recompute only pixels downstream of changed input.
    pub mask_enabled: bool,
    /// Accumulated per-pixel difference, summed over channels, above which a pixel is dirty.
    pub change_threshold: f32,
    /// Per-channel mean subtracted from every frame before inference. Empty for none.
    pub mean: Vec<f32>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mask_enabled: true,
            change_threshold: 30.0,
            mean: vec![],
        }
    }
}
