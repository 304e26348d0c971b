use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{error::Result, restir::RestirSettings, svgf::SvgfSettings};

/// Coordinated quality levels. Each preset fixes the settings that dominate
/// frame time across both resampling and denoising.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum QualityPreset {
    VeryLow,
    Low,
    Medium,
    High,
    Ultra,
}

impl QualityPreset {
    pub const ALL: [QualityPreset; 5] = [
        QualityPreset::VeryLow,
        QualityPreset::Low,
        QualityPreset::Medium,
        QualityPreset::High,
        QualityPreset::Ultra,
    ];

    pub fn target_fps(self) -> u32 {
        match self {
            QualityPreset::VeryLow => 240,
            QualityPreset::Low => 144,
            QualityPreset::Medium => 120,
            QualityPreset::High => 90,
            QualityPreset::Ultra => 60,
        }
    }

    /// Overwrites the coordinated fields of both settings structs. Fields a
    /// preset does not coordinate (thresholds, edge-stopping powers) keep
    /// their current values.
    pub fn apply(self, restir: &mut RestirSettings, svgf: &mut SvgfSettings) {
        let (candidates, spatial_iterations, spatial_samples, restir_max_m) = match self {
            QualityPreset::VeryLow => (8, 1, 3, 8),
            QualityPreset::Low => (16, 2, 4, 16),
            QualityPreset::Medium => (32, 3, 5, 20),
            QualityPreset::High => (48, 3, 8, 30),
            QualityPreset::Ultra => (64, 4, 10, 40),
        };

        let (wavelet_iterations, variance_kernel, svgf_max_m) = match self {
            QualityPreset::VeryLow => (3, 3, 16),
            QualityPreset::Low => (4, 3, 24),
            QualityPreset::Medium => (5, 3, 32),
            QualityPreset::High => (5, 3, 48),
            QualityPreset::Ultra => (5, 5, 64),
        };

        restir.initial_candidates = candidates;
        restir.spatial_iterations = spatial_iterations;
        restir.spatial_samples = spatial_samples;
        restir.temporal_max_m = restir_max_m;

        svgf.wavelet_iterations = wavelet_iterations;
        svgf.variance_kernel_size = variance_kernel;
        svgf.temporal_max_m = svgf_max_m;
    }
}

/// The whole host-facing configuration surface, loadable from json.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Applied on top of the explicit settings when present.
    pub preset: Option<QualityPreset>,
    pub restir: RestirSettings,
    pub svgf: SvgfSettings,
    pub restir_enabled: bool,
    pub svgf_enabled: bool,
    pub profiling: bool,
    pub grid_dim: [u32; 3],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            preset: None,
            restir: RestirSettings::default(),
            svgf: SvgfSettings::default(),
            restir_enabled: true,
            svgf_enabled: true,
            profiling: true,
            grid_dim: [16, 9, 24],
        }
    }
}

impl Config {
    pub fn from_json(json: &str) -> Result<Self> {
        let mut config: Config = serde_json::from_str(json)?;
        config.apply_preset();
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    pub fn apply_preset(&mut self) {
        if let Some(preset) = self.preset {
            preset.apply(&mut self.restir, &mut self.svgf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Per-frame dispatch work driven by a preset, as a proxy for frame
    /// time: candidate loops plus merge and filter passes per pixel.
    fn cost(restir: &RestirSettings, svgf: &SvgfSettings) -> u64 {
        u64::from(restir.initial_candidates)
            + u64::from(restir.spatial_iterations) * u64::from(restir.spatial_samples)
            + u64::from(svgf.wavelet_iterations) * 25
            + u64::from(svgf.variance_kernel_size).pow(2)
    }

    #[test]
    fn presets_are_monotonic_in_work() {
        let mut previous = None;

        for preset in QualityPreset::ALL {
            let mut restir = RestirSettings::default();
            let mut svgf = SvgfSettings::default();
            preset.apply(&mut restir, &mut svgf);

            let cost = cost(&restir, &svgf);
            if let Some(previous) = previous {
                assert!(cost >= previous, "{preset:?} regressed below its predecessor");
            }
            previous = Some(cost);
        }
    }

    #[test]
    fn faster_presets_target_higher_fps() {
        for pair in QualityPreset::ALL.windows(2) {
            assert!(pair[0].target_fps() > pair[1].target_fps());
        }
    }

    #[test]
    fn medium_is_the_documented_default_target() {
        let mut restir = RestirSettings::default();
        let mut svgf = SvgfSettings::default();
        QualityPreset::Medium.apply(&mut restir, &mut svgf);

        // Medium matches the crate defaults.
        assert_eq!(restir, RestirSettings::default());
        assert_eq!(svgf, SvgfSettings::default());
        assert_eq!(QualityPreset::Medium.target_fps(), 120);
    }

    #[test]
    fn config_round_trips_through_json() {
        let mut config = Config::default();
        config.restir.initial_candidates = 12;
        config.svgf.wavelet_iterations = 4;
        config.svgf_enabled = false;

        let json = serde_json::to_string(&config).unwrap();
        let parsed = Config::from_json(&json).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let config = Config::from_json(r#"{ "restir": { "initial_candidates": 4 } }"#).unwrap();
        assert_eq!(config.restir.initial_candidates, 4);
        assert_eq!(config.restir.spatial_iterations, 3);
        assert_eq!(config.svgf, SvgfSettings::default());
        assert!(config.restir_enabled);
    }

    #[test]
    fn preset_in_json_overrides_coordinated_fields() {
        let config =
            Config::from_json(r#"{ "preset": "Ultra", "restir": { "initial_candidates": 4 } }"#)
                .unwrap();
        assert_eq!(config.restir.initial_candidates, 64);
        assert_eq!(config.svgf.temporal_max_m, 64);
    }
}
