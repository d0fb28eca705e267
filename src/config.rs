use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

fn default_batch_size() -> usize {
    8
}

fn default_input_shape() -> [u32; 3] {
    [3, 768, 768]
}

fn default_epochs() -> usize {
    50
}

fn default_learning_rate() -> f64 {
    1e-3
}

fn default_momentum() -> f64 {
    0.9
}

fn default_weight_decay() -> f64 {
    1e-4
}

fn default_nesterov() -> bool {
    true
}

fn default_gpus() -> i64 {
    -1
}

fn default_val_interval() -> usize {
    1
}

fn default_ckpt_dir() -> PathBuf {
    PathBuf::from("ckpts")
}

/// Training configuration, read from the JSON file passed to `train`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct TrainConfig {
    #[serde(default)]
    pub data_root_dir: Option<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub num_workers: usize,
    #[serde(default)]
    pub pin_memory: bool,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub rotated_bbox: bool,
    /// `[channels, height, width]` of the network input.
    #[serde(default = "default_input_shape")]
    pub input_shape: [u32; 3],
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_momentum")]
    pub momentum: f64,
    #[serde(default)]
    pub dampening: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default = "default_nesterov")]
    pub nesterov: bool,
    #[serde(default = "default_gpus")]
    pub gpus: i64,
    #[serde(default = "default_val_interval")]
    pub val_interval: usize,
    #[serde(default = "default_ckpt_dir")]
    pub ckpt_dir: PathBuf,
}

impl TrainConfig {
    pub fn from_file<P: AsRef<Path>>(file_path: P) -> Result<Self> {
        let file_path = file_path.as_ref();
        if !file_path.is_file() {
            return Err(anyhow!("File {} doesn't exist", file_path.display()));
        }
        let reader = BufReader::new(File::open(file_path)?);
        let config: Self = serde_json::from_reader(reader)
            .with_context(|| format!("parsing training config {}", file_path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(anyhow!("batch_size must be positive"));
        }
        if self.input_shape[0] != 3 {
            return Err(anyhow!(
                "input_shape must describe a 3 channel image, got {:?}",
                self.input_shape
            ));
        }
        let (h, w) = self.image_dimensions();
        if h == 0 || w == 0 || h % 32 != 0 || w % 32 != 0 {
            return Err(anyhow!(
                "input_shape height and width must be positive multiples of 32, got {:?}",
                self.input_shape
            ));
        }
        if self.val_interval == 0 {
            return Err(anyhow!("val_interval must be positive"));
        }
        Ok(())
    }

    /// `(height, width)` every sample is resized to.
    pub fn image_dimensions(&self) -> (u32, u32) {
        (self.input_shape[1], self.input_shape[2])
    }
}
