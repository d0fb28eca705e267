use crate::model_store::DEFAULT_MODEL_NAME;
use crate::utils::parse_number;
use anyhow::{anyhow, Result};
use std::path::PathBuf;

fn required<'a>(args: &'a clap::ArgMatches, name: &str) -> Result<&'a str> {
    args.value_of(name)
        .ok_or_else(|| anyhow!("missing required argument '{}'", name))
}

#[derive(Debug)]
pub struct TrainOptions<'a> {
    pub model_name: &'a str,
    pub index_dir: &'a str,
    pub train_config_fp: &'a str,
    pub resume_from_checkpoint: Option<&'a str>,
    pub pretrained_model_fp: Option<&'a str>,
    pub model_root_dir: Option<PathBuf>,
}

impl<'a> TrainOptions<'a> {
    pub fn new(args: &'a clap::ArgMatches) -> Result<Self> {
        Ok(Self {
            model_name: args.value_of("model-name").unwrap_or(DEFAULT_MODEL_NAME),
            index_dir: required(args, "index-dir")?,
            train_config_fp: required(args, "train-config-fp")?,
            resume_from_checkpoint: args.value_of("resume-from-checkpoint"),
            pretrained_model_fp: args.value_of("pretrained-model-fp"),
            model_root_dir: args.value_of("model-root-dir").map(PathBuf::from),
        })
    }
}

#[derive(Debug)]
pub struct EvalOptions<'a> {
    pub backbone: &'a str,
    pub model_root_dir: Option<PathBuf>,
    pub model_epoch: Option<usize>,
    pub img_dir: &'a str,
    pub max_size: u32,
    pub pse_threshold: f32,
    pub pse_min_area: f64,
    pub gpu: i64,
    pub output_dir: &'a str,
}

impl<'a> Default for EvalOptions<'a> {
    fn default() -> Self {
        Self {
            backbone: DEFAULT_MODEL_NAME,
            model_root_dir: None,
            model_epoch: None,
            img_dir: "",
            max_size: 768,
            pse_threshold: 0.45,
            pse_min_area: 100.,
            gpu: -1,
            output_dir: "outputs",
        }
    }
}

impl<'a> EvalOptions<'a> {
    pub fn new(args: &'a clap::ArgMatches) -> Result<Self> {
        let mut opts = Self {
            img_dir: required(args, "img_dir")?,
            ..Self::default()
        };
        if let Some(backbone) = args.value_of("backbone") {
            opts.backbone = backbone;
        }
        if let Some(dir) = args.value_of("model_root_dir") {
            opts.model_root_dir = Some(PathBuf::from(dir));
        }
        if let Some(epoch) = args.value_of("model_epoch") {
            opts.model_epoch = Some(parse_number(epoch, "model epoch")?);
        }
        if let Some(max_size) = args.value_of("max_size") {
            opts.max_size = parse_number(max_size, "max size")?;
        }
        if let Some(thresh) = args.value_of("pse_threshold") {
            opts.pse_threshold = parse_number(thresh, "threshold")?;
        }
        if let Some(min_area) = args.value_of("pse_min_area") {
            opts.pse_min_area = parse_number(min_area, "min area")?;
        }
        if let Some(gpu) = args.value_of("gpu") {
            opts.gpu = parse_number(gpu, "gpu")?;
        }
        if let Some(dir) = args.value_of("output_dir") {
            opts.output_dir = dir;
        }
        Ok(opts)
    }
}

#[derive(Debug)]
pub struct VisualizeOptions<'a> {
    pub index_dir: &'a str,
    pub train_config_fp: &'a str,
    pub index: usize,
    pub output_dir: &'a str,
}

impl<'a> VisualizeOptions<'a> {
    pub fn new(args: &'a clap::ArgMatches) -> Result<Self> {
        let index = match args.value_of("index") {
            Some(index) => parse_number(index, "index")?,
            None => 0,
        };
        Ok(Self {
            index_dir: required(args, "index-dir")?,
            train_config_fp: required(args, "train-config-fp")?,
            index,
            output_dir: args.value_of("output-dir").unwrap_or("."),
        })
    }
}
