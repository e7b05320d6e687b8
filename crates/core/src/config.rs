use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::geometry::{PatchGeometry, Shape2};

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "PATCHDIFF_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AppConfig {
    pub sampler: EdmConfig,
    pub patching: PatchConfig,
    pub inference: InferenceConfig,
}

/// EDM sampler hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EdmConfig {
    pub num_steps: usize,
    pub sigma_min: f64,
    pub sigma_max: f64,
    pub rho: f64,
    pub s_churn: f64,
    pub s_min: f64,
    pub s_max: f64,
    pub s_noise: f64,
}

/// Image and patch layout for tiled denoising.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PatchConfig {
    pub img_shape: Shape2,
    pub patch_shape: Shape2,
    pub overlap_pix: usize,
    pub boundary_pix: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InferenceConfig {
    /// `cuda` or `tensorrt`.
    pub backend: String,
    pub trt_cache_dir: PathBuf,
    /// Minimum sigma the exported network was trained for.
    pub net_sigma_min: f64,
    /// Channel count of the broadcast noise-level tensor.
    pub sigma_channels: usize,
    pub input_names: OnnxInputNames,
    pub output_name: String,
}

/// Graph input names of an exported denoiser. Optional inputs are only bound
/// when the model declares them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OnnxInputNames {
    pub x: String,
    pub x_lr: String,
    pub sigma: String,
    pub class_labels: String,
    pub lead_time_label: String,
    pub global_index: String,
}

impl Default for EdmConfig {
    fn default() -> Self {
        Self {
            num_steps: 18,
            sigma_min: 0.002,
            sigma_max: 800.0,
            rho: 7.0,
            s_churn: 0.0,
            s_min: 0.0,
            s_max: f64::INFINITY,
            s_noise: 1.0,
        }
    }
}

impl Default for PatchConfig {
    fn default() -> Self {
        Self {
            img_shape: Shape2::square(448),
            patch_shape: Shape2::square(448),
            overlap_pix: 4,
            boundary_pix: 2,
        }
    }
}

impl PatchConfig {
    pub fn geometry(&self) -> Result<PatchGeometry> {
        PatchGeometry::new(
            self.img_shape,
            self.patch_shape,
            self.overlap_pix,
            self.boundary_pix,
        )
        .with_context(|| {
            format!(
                "invalid patch layout: image {} / patch {}",
                self.img_shape, self.patch_shape
            )
        })
    }
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            backend: "cuda".to_string(),
            trt_cache_dir: PathBuf::from("trt_cache"),
            net_sigma_min: 0.0,
            sigma_channels: 16,
            input_names: OnnxInputNames::default(),
            output_name: "denoised".to_string(),
        }
    }
}

impl Default for OnnxInputNames {
    fn default() -> Self {
        Self {
            x: "x".to_string(),
            x_lr: "img_lr".to_string(),
            sigma: "sigma".to_string(),
            class_labels: "class_labels".to_string(),
            lead_time_label: "lead_time_label".to_string(),
            global_index: "global_index".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. PATCHDIFF_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and a default config.toml if either is missing.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}

/// Returns the path as-is if absolute, otherwise joins it to base.
pub fn resolve_relative_to(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}
