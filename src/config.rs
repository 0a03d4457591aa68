use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_MAX_BODY_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsCfg{ pub ssim: bool, pub keypoints: bool }

impl Default for MetricsCfg {
    fn default() -> Self { Self{ ssim: true, keypoints: false } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeypointCfg{
    pub max_features: usize,
    pub fast_threshold: u8,
    pub levels: u32,
    pub scale_factor: f32,
}

impl Default for KeypointCfg {
    fn default() -> Self {
        Self{ max_features: 500, fast_threshold: 20, levels: 8, scale_factor: 1.2 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaperCfg{ pub enabled: bool, pub interval_secs: u64, pub max_age_secs: u64 }

impl Default for ReaperCfg {
    fn default() -> Self { Self{ enabled: true, interval_secs: 300, max_age_secs: 3600 } }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceCfg{
    pub bind: String,
    pub scratch_dir: PathBuf,
    pub allowed_extensions: Vec<String>,
    pub max_body_bytes: u64,
    pub compute_timeout_ms: u64,
    pub metrics: MetricsCfg,
    pub keypoints: KeypointCfg,
    pub reaper: ReaperCfg,
}

impl Default for ServiceCfg {
    fn default() -> Self {
        Self{
            bind: "127.0.0.1:5000".into(),
            scratch_dir: PathBuf::from("uploads"),
            allowed_extensions: ["png", "jpg", "jpeg", "gif"].iter().map(|s| s.to_string()).collect(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            compute_timeout_ms: 30_000,
            metrics: MetricsCfg::default(),
            keypoints: KeypointCfg::default(),
            reaper: ReaperCfg::default(),
        }
    }
}

impl ServiceCfg {
    /// Reads a YAML config file. Missing keys fall back to defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let txt = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: ServiceCfg = serde_yaml::from_str(&txt).context("Failed to parse config YAML")?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.allowed_extensions.is_empty() {
            bail!("allowed_extensions must not be empty");
        }
        if self.max_body_bytes == 0 {
            bail!("max_body_bytes must be greater than 0");
        }
        if self.compute_timeout_ms == 0 {
            bail!("compute_timeout_ms must be greater than 0");
        }
        if self.metrics.keypoints {
            if self.keypoints.max_features == 0 {
                bail!("keypoints.max_features must be greater than 0");
            }
            if self.keypoints.levels == 0 {
                bail!("keypoints.levels must be at least 1");
            }
            if self.keypoints.scale_factor <= 1.0 {
                bail!("keypoints.scale_factor must be greater than 1.0");
            }
        }
        if self.reaper.enabled && self.reaper.interval_secs == 0 {
            bail!("reaper.interval_secs must be greater than 0");
        }
        Ok(())
    }

    pub fn allows_extension(&self, ext: &str) -> bool {
        self.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(ext))
    }

    /// Comma-separated allow-list for error messages.
    pub fn allowed_list(&self) -> String {
        self.allowed_extensions.join(", ")
    }
}
