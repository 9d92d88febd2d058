//! parameters_toml
#![deny(missing_docs)]

use anyhow::{Context, Result};
use log::warn;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::OnceLock;

/// Environment variable naming an explicit parameters.toml.
pub const PARAMETERS_ENV_VAR: &str = "COUNT_MATRIX_PARAMETERS";

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default, deny_unknown_fields)]
struct Parameters {
    /// Cell filtration keeps barcodes with at least this many total counts.
    min_counts_per_barcode: i64,
    /// Cell filtration keeps barcodes with at least this many detected features.
    min_features_per_barcode: usize,
    /// Chunk length of the numeric datasets in a matrix h5.
    h5_chunk_size: usize,
    /// Deflate level of the datasets in a matrix h5.
    h5_deflate_level: u8,
}

const DEFAULT_PARAMETERS: Parameters = Parameters {
    min_counts_per_barcode: 1,
    min_features_per_barcode: 1,
    h5_chunk_size: 10_000,
    h5_deflate_level: 1,
};

impl Default for Parameters {
    fn default() -> Self {
        DEFAULT_PARAMETERS
    }
}

static PARAMETERS: OnceLock<Result<Parameters>> = OnceLock::new();

fn parameters_path() -> Result<PathBuf> {
    if let Some(path) = std::env::var_os(PARAMETERS_ENV_VAR) {
        return Ok(PathBuf::from(path));
    }
    Ok(std::env::current_exe()
        .context("Unable to locate the running executable")?
        .with_file_name("parameters.toml"))
}

fn load_parameters() -> Result<Parameters> {
    let path = parameters_path()?;
    if !path.exists() {
        warn!(
            "could not find parameters.toml at {}, falling back to defaults",
            path.display()
        );
        return Ok(DEFAULT_PARAMETERS);
    }
    let s = std::fs::read_to_string(&path).with_context(|| path.display().to_string())?;
    parse_parameters(&s).with_context(|| path.display().to_string())
}

fn parse_parameters(s: &str) -> Result<Parameters> {
    Ok(toml::from_str(s)?)
}

/// Return a reference to the global parameters.
/// The parameters may need to be loaded; if loading fails, return Err.
fn parameters() -> &'static Result<Parameters> {
    PARAMETERS.get_or_init(load_parameters)
}

/// Get a parameter from parameters.toml
macro_rules! parameter_getter {
    ($a:ident, $t:ty) => {
        /// Get this parameter from parameters.toml
        pub fn $a() -> Result<&'static $t> {
            let val = match parameters() {
                Err(e) => return Err(anyhow::anyhow!("{e:#}")),
                Ok(p) => &p.$a,
            };
            if DEFAULT_PARAMETERS.$a != *val {
                warn!("using non-default {} = {:?}", stringify!($a), val);
            }
            Ok(val)
        }
    };
}

parameter_getter!(min_counts_per_barcode, i64);
parameter_getter!(min_features_per_barcode, usize);
parameter_getter!(h5_chunk_size, usize);
parameter_getter!(h5_deflate_level, u8);
