#[macro_use]
extern crate lazy_static;
extern crate log;
extern crate log4rs;
extern crate tch;

#[macro_use]
mod macros;
mod annotation;
mod config;
mod dataset;
mod detector;
mod image_ops;
mod model_store;
mod polygon;
mod text_detection;
mod transforms;
mod utils;

use anyhow::Result;
use clap::{App, AppSettings, Arg, SubCommand};
use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Config, Root};
use std::path::Path;
use text_detection::options::{EvalOptions, TrainOptions, VisualizeOptions};

const LOG_CONFIG_FILE: &str = "log4rs.yml";

fn init_logging() -> Result<()> {
    if Path::new(LOG_CONFIG_FILE).is_file() {
        log4rs::init_file(LOG_CONFIG_FILE, Default::default())?;
    } else {
        let stdout = ConsoleAppender::builder().build();
        let config = Config::builder()
            .appender(Appender::builder().build("stdout", Box::new(stdout)))
            .build(Root::builder().appender("stdout").build(LevelFilter::Info))?;
        log4rs::init_config(config)?;
    }
    Ok(())
}

fn build_app() -> App<'static, 'static> {
    App::new("cnstd")
        .about("Scene text detection with differentiable binarization models")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .subcommand(
            SubCommand::with_name("train")
                .about("Train a text detection model")
                .arg(
                    Arg::with_name("model-name")
                        .short("m")
                        .long("model-name")
                        .takes_value(true)
                        .default_value(model_store::DEFAULT_MODEL_NAME)
                        .help("Model name"),
                )
                .arg(
                    Arg::with_name("index-dir")
                        .short("i")
                        .long("index-dir")
                        .takes_value(true)
                        .required(true)
                        .help("Directory holding train.tsv and dev.tsv"),
                )
                .arg(
                    Arg::with_name("train-config-fp")
                        .long("train-config-fp")
                        .takes_value(true)
                        .required(true)
                        .help("JSON training configuration"),
                )
                .arg(
                    Arg::with_name("resume-from-checkpoint")
                        .short("r")
                        .long("resume-from-checkpoint")
                        .takes_value(true)
                        .help("Checkpoint to continue training from"),
                )
                .arg(
                    Arg::with_name("pretrained-model-fp")
                        .short("p")
                        .long("pretrained-model-fp")
                        .takes_value(true)
                        .help("Initial model weights"),
                )
                .arg(
                    Arg::with_name("model-root-dir")
                        .long("model-root-dir")
                        .takes_value(true)
                        .help("Root directory of the model store"),
                ),
        )
        .subcommand(
            SubCommand::with_name("evaluate")
                .about("Detect text on images and save the results")
                .arg(
                    Arg::with_name("backbone")
                        .long("backbone")
                        .takes_value(true)
                        .help("Model name"),
                )
                .arg(
                    Arg::with_name("model_root_dir")
                        .long("model_root_dir")
                        .takes_value(true)
                        .help("Root directory of the model store"),
                )
                .arg(
                    Arg::with_name("model_epoch")
                        .long("model_epoch")
                        .takes_value(true)
                        .help("Model epoch"),
                )
                .arg(
                    Arg::with_name("img_dir")
                        .short("i")
                        .long("img_dir")
                        .takes_value(true)
                        .required(true)
                        .help("Image file or directory of images"),
                )
                .arg(
                    Arg::with_name("max_size")
                        .long("max_size")
                        .takes_value(true)
                        .default_value("768")
                        .help("Side the images are resized to, a multiple of 32"),
                )
                .arg(
                    Arg::with_name("pse_threshold")
                        .long("pse_threshold")
                        .takes_value(true)
                        .default_value("0.45")
                        .help("Binarization threshold of the probability map"),
                )
                .arg(
                    Arg::with_name("pse_min_area")
                        .long("pse_min_area")
                        .takes_value(true)
                        .default_value("100")
                        .help("Minimum area of a detected box"),
                )
                .arg(
                    Arg::with_name("gpu")
                        .long("gpu")
                        .takes_value(true)
                        .allow_hyphen_values(true)
                        .default_value("-1")
                        .help("Number of GPUs, -1 picks CUDA when available"),
                )
                .arg(
                    Arg::with_name("output_dir")
                        .short("o")
                        .long("output_dir")
                        .takes_value(true)
                        .default_value("outputs")
                        .help("Directory for the results"),
                ),
        )
        .subcommand(
            SubCommand::with_name("visualize")
                .about("Save the rasterized training targets of one sample")
                .arg(
                    Arg::with_name("index-dir")
                        .short("i")
                        .long("index-dir")
                        .takes_value(true)
                        .required(true)
                        .help("Directory holding train.tsv"),
                )
                .arg(
                    Arg::with_name("train-config-fp")
                        .long("train-config-fp")
                        .takes_value(true)
                        .required(true)
                        .help("JSON training configuration"),
                )
                .arg(
                    Arg::with_name("index")
                        .long("index")
                        .takes_value(true)
                        .help("Sample index"),
                )
                .arg(
                    Arg::with_name("output-dir")
                        .short("o")
                        .long("output-dir")
                        .takes_value(true)
                        .help("Directory for the debug images"),
                ),
        )
}

fn main() -> Result<()> {
    init_logging()?;
    let matches = build_app().get_matches();
    match matches.subcommand() {
        ("train", Some(args)) => text_detection::train_model(&TrainOptions::new(args)?),
        ("evaluate", Some(args)) => text_detection::evaluate(&EvalOptions::new(args)?),
        ("visualize", Some(args)) => text_detection::visualize(&VisualizeOptions::new(args)?),
        _ => Ok(()),
    }
}
