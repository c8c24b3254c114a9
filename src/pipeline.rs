//! The two stages end to end: building the cohort table from the database, and turning a cohort
//! table into the analysis table.
use crate::{
    analysis::AnalysisTable,
    cache::CacheStore,
    cohort::Cohort,
    config::Config,
    diagnosis::{aggregate_diagnoses, SepticMatcher},
    extract::extract,
    sample::sample_cohort,
    source::DataSource,
    Result,
};
use qu::ick_use::*;

/// Sample the cohort, attach diagnoses, then extract and merge every configured variable in
/// order.
///
/// Diagnoses always come from `source`. In [`CacheMode::Cached`](crate::CacheMode::Cached) the
/// variable measurements come from `cache` instead.
pub fn extract_cohort<S, C>(source: &S, cache: &mut C, config: &Config) -> Result<Cohort>
where
    S: DataSource + ?Sized,
    C: CacheStore + ?Sized,
{
    let subjects = sample_cohort(source, config.cohort_size, config.seed)?;
    let diagnoses = aggregate_diagnoses(source.diagnoses(&subjects)?);
    event!(
        Level::INFO,
        "{} of {} sampled subjects have diagnosis codes",
        diagnoses.len(),
        subjects.len()
    );
    let mut cohort = Cohort::from_diagnoses(diagnoses);

    for spec in &config.variables {
        let mut readings = extract(source, spec, &subjects, cache, config.cache.mode)
            .with_context(|| format!("extracting \"{}\"", spec.name))?;
        if let Some(normalize) = &spec.normalize {
            let before = readings.len();
            readings = normalize.apply(readings);
            event!(
                Level::INFO,
                "{}: {} of {} readings left after unit normalization",
                spec.name,
                readings.len(),
                before
            );
        }
        cohort.merge(&spec.name, &readings);
    }
    Ok(cohort)
}

/// Label and filter a cohort table using the configured septic codes.
pub fn analyze(cohort: &Cohort, config: &Config) -> AnalysisTable {
    let matcher = SepticMatcher::new(config.septic_codes.iter().cloned());
    AnalysisTable::from_cohort(cohort, &matcher)
}
