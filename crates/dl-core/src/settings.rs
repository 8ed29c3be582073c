//! Stabilizer configuration.
//!
//! Every section deserializes with defaults, so a partial TOML file (or none
//! at all) is valid input. Call [`StabilizerSettings::validate`] before
//! handing settings to a [`crate::Stabilizer`]; construction refuses invalid
//! settings.

use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_ANCHOR_ADD_COOLDOWN, DEFAULT_MAX_ANCHOR_EDGE_LENGTH, DEFAULT_MIN_MOVE_DISTANCE,
    DEFAULT_MIN_NEW_ANCHOR_DISTANCE, DEFAULT_PENDING_ANCHOR_TIMEOUT, DEFAULT_TRACKING_START_DELAY,
    DEFAULT_TRIANGULATION_EXTENT,
};
use crate::error::ConfigValidationError;

/// Anchor graph construction policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnchorSettings {
    /// No located anchor within this radius of the device triggers a proposal.
    /// Default: 1.0
    pub min_new_anchor_distance: f64,

    /// New anchors get edges to every anchor within this radius.
    /// Must exceed `min_new_anchor_distance`. Default: 1.2
    pub max_anchor_edge_length: f64,

    /// Cap on live anchors; the farthest is culled when exceeded. 0 = unlimited.
    pub max_local_anchors: usize,

    /// Seconds of regained tracking before proposals resume. Default: 0.3
    pub tracking_start_delay: f64,

    /// Minimum seconds between proposals. Default: 0.4
    pub anchor_add_cooldown: f64,

    /// Seconds a proposal may stay unlocated before it is discarded. Default: 3.0
    pub pending_anchor_timeout: f64,
}

impl Default for AnchorSettings {
    fn default() -> Self {
        Self {
            min_new_anchor_distance: DEFAULT_MIN_NEW_ANCHOR_DISTANCE,
            max_anchor_edge_length: DEFAULT_MAX_ANCHOR_EDGE_LENGTH,
            max_local_anchors: 0,
            tracking_start_delay: DEFAULT_TRACKING_START_DELAY,
            anchor_add_cooldown: DEFAULT_ANCHOR_ADD_COOLDOWN,
            pending_anchor_timeout: DEFAULT_PENDING_ANCHOR_TIMEOUT,
        }
    }
}

/// Fragment reconciliation policy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FragmentSettings {
    /// Merge fragments whenever the optimizer indicates it.
    pub auto_merge: bool,

    /// Refreeze whenever the optimizer indicates it.
    pub auto_refreeze: bool,

    /// Attachment point moves shorter than this are ignored (meters).
    pub min_move_distance: f64,
}

impl Default for FragmentSettings {
    fn default() -> Self {
        Self {
            auto_merge: true,
            auto_refreeze: true,
            min_move_distance: DEFAULT_MIN_MOVE_DISTANCE,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignmentSettings {
    /// Half-size of the square (x, z) domain pins may occupy.
    pub triangulation_extent: f64,
}

impl Default for AlignmentSettings {
    fn default() -> Self {
        Self {
            triangulation_extent: DEFAULT_TRIANGULATION_EXTENT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// Pin record location, relative to the working directory unless absolute.
    pub pin_file: String,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            pin_file: "pins.bin".to_string(),
        }
    }
}

/// Full stabilizer configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StabilizerSettings {
    #[serde(default)]
    pub anchors: AnchorSettings,

    #[serde(default)]
    pub fragments: FragmentSettings,

    #[serde(default)]
    pub alignment: AlignmentSettings,

    #[serde(default)]
    pub persistence: PersistenceSettings,
}

fn require(ok: bool, msg: impl FnOnce() -> String) -> Result<(), ConfigValidationError> {
    if ok {
        Ok(())
    } else {
        Err(ConfigValidationError::InvalidValue(msg()))
    }
}

impl AnchorSettings {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        let values = [
            ("min_new_anchor_distance", self.min_new_anchor_distance),
            ("max_anchor_edge_length", self.max_anchor_edge_length),
            ("tracking_start_delay", self.tracking_start_delay),
            ("anchor_add_cooldown", self.anchor_add_cooldown),
            ("pending_anchor_timeout", self.pending_anchor_timeout),
        ];
        for (name, value) in values {
            require(value.is_finite(), || format!("anchors.{name} must be finite"))?;
        }
        require(self.min_new_anchor_distance > 0.0, || {
            "anchors.min_new_anchor_distance must be > 0".to_string()
        })?;
        require(
            self.max_anchor_edge_length > self.min_new_anchor_distance,
            || {
                format!(
                    "anchors.max_anchor_edge_length ({}) must exceed min_new_anchor_distance ({})",
                    self.max_anchor_edge_length, self.min_new_anchor_distance
                )
            },
        )?;
        require(self.tracking_start_delay >= 0.0, || {
            "anchors.tracking_start_delay must be >= 0".to_string()
        })?;
        require(self.anchor_add_cooldown >= 0.0, || {
            "anchors.anchor_add_cooldown must be >= 0".to_string()
        })?;
        require(self.pending_anchor_timeout > 0.0, || {
            "anchors.pending_anchor_timeout must be > 0".to_string()
        })
    }
}

impl StabilizerSettings {
    /// Check every section. The first violation is returned.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        self.anchors.validate()?;
        require(
            self.fragments.min_move_distance.is_finite() && self.fragments.min_move_distance >= 0.0,
            || "fragments.min_move_distance must be finite and >= 0".to_string(),
        )?;
        require(
            self.alignment.triangulation_extent.is_finite()
                && self.alignment.triangulation_extent > 0.0,
            || "alignment.triangulation_extent must be finite and > 0".to_string(),
        )?;
        require(!self.persistence.pin_file.trim().is_empty(), || {
            "persistence.pin_file must not be empty".to_string()
        })
    }
}
