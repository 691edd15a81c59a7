//! Engine configuration.
//!
//! Every field has a default, so a partial JSON document is enough to
//! override a handful of knobs.

use crate::model::RoutingType;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Tunables for the canvas engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Smallest allowed viewport scale.
    pub min_scale: f64,
    /// Largest allowed viewport scale.
    pub max_scale: f64,
    /// Multiplicative zoom factor for one wheel notch or key press.
    pub zoom_step: f64,
    /// Exponential decay rate of inertial pan velocity, per second.
    pub pan_friction: f64,
    /// Below this speed (screen px/s) inertial panning stops.
    pub settle_velocity: f64,
    /// Edge length of a spatial index tile, in world units.
    pub cull_tile_size: f64,
    /// Extra screen-space margin added around the viewport when culling.
    pub cull_padding: f64,
    /// Pick radius for node anchors, in screen pixels.
    pub anchor_tolerance: f64,
    /// Pick radius for resize handles, in screen pixels.
    pub handle_tolerance: f64,
    /// Arrow head length in world units.
    pub arrow_head_size: f64,
    /// Routing used for connections drawn interactively.
    pub default_routing: RoutingType,
    /// Debounce window for durable writes.
    pub persistence_debounce_ms: u64,
    /// First retry delay after a failed durable write.
    pub retry_base_ms: u64,
    /// Upper bound on the retry delay.
    pub retry_max_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_scale: 0.1,
            max_scale: 10.0,
            zoom_step: 1.1,
            pan_friction: 6.0,
            settle_velocity: 5.0,
            cull_tile_size: 512.0,
            cull_padding: 64.0,
            anchor_tolerance: 8.0,
            handle_tolerance: 8.0,
            arrow_head_size: 12.0,
            default_routing: RoutingType::Straight,
            persistence_debounce_ms: 500,
            retry_base_ms: 250,
            retry_max_ms: 30_000,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from JSON and repair inconsistent values.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        Ok(config.validate())
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Clamp values into a usable range.
    ///
    /// Out-of-range values are replaced rather than rejected; a warning is
    /// logged for each repair.
    pub fn validate(mut self) -> Self {
        let defaults = Self::default();
        if !(self.min_scale.is_finite() && self.min_scale > 0.0) {
            log::warn!("Invalid min_scale {}, using {}", self.min_scale, defaults.min_scale);
            self.min_scale = defaults.min_scale;
        }
        if !(self.max_scale.is_finite() && self.max_scale >= self.min_scale) {
            log::warn!("Invalid max_scale {}, using {}", self.max_scale, defaults.max_scale.max(self.min_scale));
            self.max_scale = defaults.max_scale.max(self.min_scale);
        }
        if !(self.zoom_step.is_finite() && self.zoom_step > 1.0) {
            self.zoom_step = defaults.zoom_step;
        }
        if !(self.pan_friction.is_finite() && self.pan_friction > 0.0) {
            self.pan_friction = defaults.pan_friction;
        }
        if !(self.cull_tile_size.is_finite() && self.cull_tile_size > 0.0) {
            log::warn!("Invalid cull_tile_size {}, using {}", self.cull_tile_size, defaults.cull_tile_size);
            self.cull_tile_size = defaults.cull_tile_size;
        }
        if !self.cull_padding.is_finite() || self.cull_padding < 0.0 {
            self.cull_padding = 0.0;
        }
        if self.retry_max_ms < self.retry_base_ms {
            self.retry_max_ms = self.retry_base_ms;
        }
        self
    }

    pub fn persistence_debounce(&self) -> Duration {
        Duration::from_millis(self.persistence_debounce_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = EngineConfig::from_json(r#"{"max_scale": 4.0}"#).unwrap();
        assert!((config.max_scale - 4.0).abs() < f64::EPSILON);
        assert!((config.min_scale - 0.1).abs() < f64::EPSILON);
        assert_eq!(config.default_routing, RoutingType::Straight);
    }

    #[test]
    fn test_routing_parsed_from_json() {
        let config = EngineConfig::from_json(r#"{"default_routing": "elbow"}"#).unwrap();
        assert_eq!(config.default_routing, RoutingType::Elbow);
    }

    #[test]
    fn test_validate_repairs_inverted_scale_range() {
        let config = EngineConfig::from_json(r#"{"min_scale": 2.0, "max_scale": 1.0}"#).unwrap();
        assert!(config.max_scale >= config.min_scale);
    }

    #[test]
    fn test_validate_repairs_bad_tile_size() {
        let config = EngineConfig::from_json(r#"{"cull_tile_size": -5.0}"#).unwrap();
        assert!((config.cull_tile_size - 512.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_json_is_error() {
        assert!(matches!(EngineConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }
}
