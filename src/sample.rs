//! Drawing the cohort.
use crate::{source::DataSource, CohortError, Result, SubjectId};
use qu::ick_use::*;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::collections::BTreeSet;

pub const DEFAULT_COHORT_SIZE: usize = 5000;
pub const DEFAULT_SEED: u64 = 42;

/// Draw `size` distinct subjects uniformly at random, returned in ascending order.
///
/// The population is de-duplicated and sorted first, so the result only depends on which ids are
/// present, `size` and `seed`.
pub fn sample_subjects(
    population: impl IntoIterator<Item = SubjectId>,
    size: usize,
    seed: u64,
) -> Result<Vec<SubjectId>> {
    let population: Vec<SubjectId> = population
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    if size > population.len() {
        return Err(CohortError::SampleSizeExceedsPopulation {
            requested: size,
            population: population.len(),
        }
        .into());
    }
    let mut rng = StdRng::seed_from_u64(seed);
    let mut sample: Vec<SubjectId> = population
        .choose_multiple(&mut rng, size)
        .copied()
        .collect();
    sample.sort_unstable();
    Ok(sample)
}

/// Sample the cohort from every subject with a diagnosis record.
pub fn sample_cohort<S>(source: &S, size: usize, seed: u64) -> Result<Vec<SubjectId>>
where
    S: DataSource + ?Sized,
{
    let population = source.subject_ids()?;
    event!(
        Level::INFO,
        "sampling {} of {} subjects (seed {})",
        size,
        population.len(),
        seed
    );
    sample_subjects(population, size, seed)
}
