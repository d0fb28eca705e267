use anyhow::{anyhow, Context, Result};
use log::{info, warn};
use regex::Regex;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MODEL_VERSION: &str = "1.0";
pub const DEFAULT_MODEL_NAME: &str = "db_resnet18";
const CHECKPOINT_EXT: &str = "ckpt";
const DEFAULT_DOWNLOAD_URL: &str =
    "https://huggingface.co/breezedeus/cnstd-cnocr-models/resolve/main/models/cnstd";

lazy_static! {
    /// Models released for `MODEL_VERSION`, with the epoch of their shipped checkpoint.
    pub static ref AVAILABLE_MODELS: HashMap<&'static str, usize> = {
        let mut models = HashMap::new();
        models.insert("db_resnet18", 29);
        models.insert("db_resnet34", 29);
        models.insert("db_mobilenet_v3", 47);
        models.insert("db_mobilenet_v3_small", 35);
        models.insert("db_shufflenet_v2", 41);
        models.insert("db_shufflenet_v2_small", 34);
        models
    };
    static ref EPOCH_REGEX: Regex = Regex::new(r"epoch=(\d+)").expect("valid epoch pattern");
}

/// Root directory of the model store: `$CNSTD_HOME`, `%APPDATA%/cnstd` on
/// Windows, `~/.cnstd` elsewhere.
pub fn data_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os("CNSTD_HOME") {
        return Ok(PathBuf::from(home));
    }
    let default_dir = if cfg!(windows) {
        dirs::data_dir().map(|dir| dir.join("cnstd"))
    } else {
        dirs::home_dir().map(|home| home.join(".cnstd"))
    };
    default_dir.ok_or_else(|| anyhow!("can not locate the home directory, set CNSTD_HOME"))
}

/// The given store root, or [`data_dir`] when none is set.
pub fn store_root(root: Option<&Path>) -> Result<PathBuf> {
    match root {
        Some(root) => Ok(root.to_path_buf()),
        None => data_dir(),
    }
}

pub fn check_model_name(model_name: &str) -> Result<()> {
    if AVAILABLE_MODELS.contains_key(model_name) {
        return Ok(());
    }
    let mut names = AVAILABLE_MODELS.keys().copied().collect::<Vec<&str>>();
    names.sort_unstable();
    Err(anyhow!(
        "unsupported model '{}', choose one of: {}",
        model_name,
        names.join(", ")
    ))
}

pub fn model_file_prefix(model_name: &str) -> String {
    format!("cnstd-v{}-{}", MODEL_VERSION, model_name)
}

pub fn checkpoint_file_name(model_name: &str, epoch: usize) -> String {
    format!(
        "{}-epoch={:03}.{}",
        model_file_prefix(model_name),
        epoch,
        CHECKPOINT_EXT
    )
}

/// Extracts the epoch encoded in a checkpoint file name.
pub fn parse_epoch<P: AsRef<Path>>(path: P) -> Option<usize> {
    let file_name = path.as_ref().file_name()?.to_str()?;
    EPOCH_REGEX
        .captures(file_name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn model_dir(model_name: &str, root: &Path) -> PathBuf {
    root.join(MODEL_VERSION).join(model_name)
}

fn find_checkpoints(dir: &Path, prefix: &str) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let matches = path.is_file()
            && path.extension().and_then(|e| e.to_str()) == Some(CHECKPOINT_EXT)
            && path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(prefix));
        if matches {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

fn single_checkpoint(mut found: Vec<PathBuf>, dir: &Path) -> Result<Option<PathBuf>> {
    match found.len() {
        0 => Ok(None),
        1 => Ok(found.pop()),
        _ => Err(anyhow!(
            "ambiguous checkpoint: {} model files found in {}: {:?}",
            found.len(),
            dir.display(),
            found
        )),
    }
}

/// Locates the checkpoint of `model_name`.
///
/// An explicit `model_fp` wins and must exist. Otherwise the store under
/// `root` is searched, downloading the model archive when nothing matches.
/// `epoch` defaults to the epoch of the released checkpoint.
pub fn resolve_model_file(
    model_name: &str,
    epoch: Option<usize>,
    model_fp: Option<&Path>,
    root: &Path,
) -> Result<PathBuf> {
    if let Some(model_fp) = model_fp {
        if !model_fp.is_file() {
            return Err(anyhow!("can not find model file {}", model_fp.display()));
        }
        return Ok(model_fp.to_path_buf());
    }

    let epoch = epoch.or_else(|| AVAILABLE_MODELS.get(model_name).copied());
    let prefix = match epoch {
        Some(epoch) => format!("{}-epoch={:03}", model_file_prefix(model_name), epoch),
        None => model_file_prefix(model_name),
    };
    let dir = model_dir(model_name, root);
    if let Some(found) = single_checkpoint(find_checkpoints(&dir, &prefix)?, &dir)? {
        return Ok(found);
    }

    warn!(
        "no model file with prefix {} in {}, downloading it",
        prefix,
        dir.display()
    );
    download_and_unzip(model_name, &root.join(MODEL_VERSION))?;
    single_checkpoint(find_checkpoints(&dir, &prefix)?, &dir)?.ok_or_else(|| {
        anyhow!(
            "can not find model file with prefix {} in {}",
            prefix,
            dir.display()
        )
    })
}

fn download_url(model_name: &str) -> String {
    let base = std::env::var("CNSTD_DOWNLOAD_URL").unwrap_or_else(|_| DEFAULT_DOWNLOAD_URL.into());
    format!(
        "{}/{}/{}.zip",
        base.trim_end_matches('/'),
        MODEL_VERSION,
        model_name
    )
}

/// Downloads `<model_name>.zip` into `dest_dir` and extracts it there.
pub fn download_and_unzip(model_name: &str, dest_dir: &Path) -> Result<()> {
    fs::create_dir_all(dest_dir)?;
    let url = download_url(model_name);
    let zip_fp = dest_dir.join(format!("{}.zip", model_name));
    info!("downloading {} into {}", url, zip_fp.display());

    let bytes = measure_time!(
        "download model",
        || -> Result<_> {
            Ok(reqwest::blocking::get(&url)
                .and_then(|r| r.error_for_status())
                .and_then(|r| r.bytes())
                .with_context(|| format!("downloading {}", url))?)
        },
        log::Level::Info
    )?;
    File::create(&zip_fp)?.write_all(&bytes)?;

    unzip(&zip_fp, dest_dir)?;
    fs::remove_file(&zip_fp)?;
    Ok(())
}

pub fn unzip(zip_fp: &Path, dest_dir: &Path) -> Result<()> {
    let mut archive = zip::ZipArchive::new(File::open(zip_fp)?)
        .with_context(|| format!("opening archive {}", zip_fp.display()))?;
    archive
        .extract(dest_dir)
        .with_context(|| format!("extracting {}", zip_fp.display()))?;
    info!("extracted {} files into {}", archive.len(), dest_dir.display());
    Ok(())
}
