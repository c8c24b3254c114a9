//! Run configuration, loaded from a toml file.
//!
//! Every field is optional; anything missing falls back to the defaults below, which describe the
//! standard five SIRS variables on a MIMIC-III database.
//!
//! ```toml
//! cohort_size = 1000
//! seed = 7
//!
//! [source]
//! path = "mimic3.sqlite"
//! # or kind = "postgres", with host, port, user, password, dbname and schema
//!
//! [cache]
//! dir = "cache"
//! mode = "cached"
//!
//! [[variables]]
//! name = "heart_rate"
//! table = "chartevents"
//! item_ids = [211, 220045]
//! valid_range = { low = 0.0, high = 300.0 }
//! ```
use crate::{
    cache::CacheMode,
    diagnosis::SEPTIC_CODES,
    extract::VariableSpec,
    sample::{DEFAULT_COHORT_SIZE, DEFAULT_SEED},
    source::EventTable,
    units::{Normalization, CELSIUS_TEMPERATURE_RANGE, RAW_TEMPERATURE_RANGE},
    ArcStr, Result, ValidRange,
};
use qu::ick_use::*;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub cohort_size: usize,
    pub seed: u64,
    /// Diagnosis codes that mark a subject as septic.
    pub septic_codes: Vec<ArcStr>,
    /// Where the cohort table is written.
    pub output: PathBuf,
    pub source: SourceConfig,
    pub cache: CacheConfig,
    pub variables: Vec<VariableSpec>,
}

/// Where the MIMIC tables are read from.
///
/// `kind = "sqlite"` uses `path`. `kind = "postgres"` uses `host`, `port`, `user`, `password` and
/// `dbname`. Both use `schema`: for SQLite the file is attached under that name, for Postgres it
/// becomes the `search_path`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SourceConfig {
    pub kind: SourceKind,
    /// Path to the SQLite database.
    pub path: PathBuf,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dbname: String,
    /// Schema the MIMIC tables live in.
    pub schema: Option<String>,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    #[default]
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheConfig {
    pub dir: PathBuf,
    pub mode: CacheMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cohort_size: DEFAULT_COHORT_SIZE,
            seed: DEFAULT_SEED,
            septic_codes: SEPTIC_CODES.iter().map(|&code| code.into()).collect(),
            output: PathBuf::from("cohort.csv"),
            source: SourceConfig::default(),
            cache: CacheConfig::default(),
            variables: default_variables(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Sqlite,
            path: PathBuf::from("mimic3.sqlite"),
            host: "localhost".into(),
            port: 5432,
            user: None,
            password: None,
            dbname: "mimic".into(),
            schema: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cache"),
            mode: CacheMode::Live,
        }
    }
}

/// Temperature, heart rate, respiratory rate, PaCO2 and white cell count.
///
/// Item ids cover both the CareVue and MetaVision recording systems.
pub fn default_variables() -> Vec<VariableSpec> {
    vec![
        VariableSpec::new(
            "temperature",
            EventTable::ChartEvents,
            [676, 678, 223761, 223762],
            RAW_TEMPERATURE_RANGE,
        )
        .with_normalization(Normalization::FahrenheitToCelsius {
            valid_range: CELSIUS_TEMPERATURE_RANGE,
        }),
        VariableSpec::new(
            "heart_rate",
            EventTable::ChartEvents,
            [211, 220045],
            ValidRange::new(0., 300.),
        ),
        VariableSpec::new(
            "resp_rate",
            EventTable::ChartEvents,
            [618, 220210],
            ValidRange::new(0., 100.),
        ),
        VariableSpec::new(
            "paco2",
            EventTable::LabEvents,
            [50818],
            ValidRange::new(0., 200.),
        ),
        VariableSpec::new(
            "wbc",
            EventTable::LabEvents,
            [51300, 51301],
            ValidRange::new(0., 1000.),
        ),
    ]
}

impl Config {
    /// Load and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        fn inner(path: &Path) -> Result<Config> {
            let text = fs::read_to_string(path)?;
            Config::from_toml_str(&text)
        }
        let path = path.as_ref();
        inner(path).with_context(|| format!("loading config \"{}\"", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result {
        ensure!(self.cohort_size > 0, "cohort size must be at least 1");
        ensure!(
            !self.septic_codes.is_empty(),
            "at least one septic code is needed"
        );
        ensure!(!self.variables.is_empty(), "no variables to extract");
        let mut seen = BTreeSet::new();
        for var in &self.variables {
            ensure!(
                !var.name.is_empty()
                    && var
                        .name
                        .chars()
                        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-')),
                "variable name \"{}\" may only contain letters, digits, `_` and `-`",
                var.name
            );
            ensure!(
                seen.insert(var.name.clone()),
                "variable \"{}\" is listed twice",
                var.name
            );
            ensure!(
                !var.item_ids.is_empty(),
                "variable \"{}\" has no item ids",
                var.name
            );
            check_range(&var.name, var.valid_range)?;
            if let Some(Normalization::FahrenheitToCelsius { valid_range }) = var.normalize {
                check_range(&var.name, valid_range)?;
            }
        }
        Ok(())
    }
}

fn check_range(name: &str, range: ValidRange) -> Result {
    ensure!(
        range.low < range.high,
        "variable \"{}\": range {} is empty",
        name,
        range
    );
    Ok(())
}
