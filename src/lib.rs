pub mod analysis;
pub mod cache;
pub mod cohort;
pub mod config;
pub mod diagnosis;
pub mod extract;
pub mod pipeline;
mod range;
pub mod report;
pub mod sample;
pub mod source;
pub mod units;
mod util;

pub use anyhow::{Context, Error};
use std::sync::Arc;

pub use crate::{
    analysis::{AnalysisRow, AnalysisTable},
    cache::{CacheMode, CacheStore, DirCache, MemoryCache},
    cohort::{Cohort, CohortRow},
    config::Config,
    diagnosis::{DiagnosisSet, SepticMatcher},
    extract::{FirstReadings, Observation, VariableSpec},
    range::{Range, RangeSet, RangeSetCounts, ValidRange},
    source::{DataSource, EventTable, PostgresSource, SqliteSource},
    util::{header, HtmlTable},
};

pub type ArcStr = Arc<str>;
pub type Result<T = (), E = anyhow::Error> = std::result::Result<T, E>;
/// MIMIC `subject_id`: one per patient.
pub type SubjectId = i64;
/// MIMIC `hadm_id`: one per hospital admission.
pub type AdmissionId = i64;
/// MIMIC `itemid`: identifies what was measured in an event table.
pub type ItemId = i64;

/// The failures callers may want to tell apart.
///
/// These are always carried inside an `anyhow::Error` (usually with some context attached), so
/// use `err.downcast_ref::<CohortError>()` to inspect them.
#[derive(Debug, thiserror::Error)]
pub enum CohortError {
    #[error("data source unavailable: {0}")]
    SourceUnavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("no cached data for \"{key}\" (run without the cache first)")]
    CacheMissing { key: String },

    #[error("cached data for \"{key}\" could not be decoded")]
    CacheCorrupt {
        key: String,
        #[source]
        source: bincode::Error,
    },

    #[error("cannot sample {requested} subjects from a population of {population}")]
    SampleSizeExceedsPopulation { requested: usize, population: usize },
}

impl From<rusqlite::Error> for CohortError {
    fn from(e: rusqlite::Error) -> Self {
        CohortError::SourceUnavailable(Box::new(e))
    }
}

impl From<postgres::Error> for CohortError {
    fn from(e: postgres::Error) -> Self {
        CohortError::SourceUnavailable(Box::new(e))
    }
}
