//! Zone Routing Table: per-zone, per-step route selection.
//!
//! Read-only from the engine's point of view. A zone missing from the table
//! is a configuration fault: there is no default route.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::types::{ActivationStep, RouteMode, ZoneConfig};
use crate::error::{OnboardingError, OnboardingResult};

/// YAML shape of a standalone zone routing file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ZoneRoutingFile {
    pub zones: Vec<ZoneConfig>,
}

/// Indexed zone configuration for route lookups.
#[derive(Debug, Clone, Default)]
pub struct ZoneRoutingTable {
    by_zone: HashMap<String, ZoneConfig>,
}

impl ZoneRoutingTable {
    pub fn from_configs(configs: impl IntoIterator<Item = ZoneConfig>) -> Self {
        let mut by_zone = HashMap::new();
        for config in configs {
            if by_zone.contains_key(&config.zone_code) {
                tracing::warn!(
                    zone_code = %config.zone_code,
                    "Duplicate zone config, last definition wins"
                );
            }
            by_zone.insert(config.zone_code.clone(), config);
        }
        Self { by_zone }
    }

    /// Load from a YAML file of the form `zones: [...]`.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
        let file: ZoneRoutingFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Parsing {}", path.display()))?;
        Ok(Self::from_configs(file.zones))
    }

    /// Route for `step` in `zone_code`. Pure lookup, no side effects.
    pub fn resolve_route(&self, zone_code: &str, step: ActivationStep) -> OnboardingResult<RouteMode> {
        self.by_zone
            .get(zone_code)
            .map(|config| config.mode_for(step))
            .ok_or_else(|| OnboardingError::UnconfiguredZone {
                zone_code: zone_code.to_string(),
            })
    }

    pub fn zone(&self, zone_code: &str) -> Option<&ZoneConfig> {
        self.by_zone.get(zone_code)
    }

    pub fn zone_count(&self) -> usize {
        self.by_zone.len()
    }
}
