//! Per-variable extraction: fetch raw observations (live or from the cache), drop implausible
//! values, and keep the earliest remaining reading for each subject.
use crate::{
    cache::{CacheMode, CacheStore},
    source::{DataSource, EventTable},
    units::Normalization,
    AdmissionId, ArcStr, CohortError, ItemId, Result, SubjectId, ValidRange,
};
use chrono::NaiveDateTime;
use qu::ick_use::*;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, ops::Deref};

/// One measurement of one variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub subject_id: SubjectId,
    pub admission_id: Option<AdmissionId>,
    pub timestamp: NaiveDateTime,
    pub value: Option<f64>,
    pub unit: Option<ArcStr>,
}

/// What to extract for one physiological variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    /// Column name in the cohort table, also used as the cache key.
    pub name: ArcStr,
    pub table: EventTable,
    /// Item ids that all measure this variable (CareVue and MetaVision use different ids).
    pub item_ids: Vec<ItemId>,
    /// Values outside this range are discarded before choosing the first reading.
    pub valid_range: ValidRange,
    /// Unit conversion applied to the first readings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalize: Option<Normalization>,
}

impl VariableSpec {
    pub fn new(
        name: impl Into<ArcStr>,
        table: EventTable,
        item_ids: impl IntoIterator<Item = ItemId>,
        valid_range: ValidRange,
    ) -> Self {
        Self {
            name: name.into(),
            table,
            item_ids: item_ids.into_iter().collect(),
            valid_range,
            normalize: None,
        }
    }

    pub fn with_normalization(mut self, normalize: Normalization) -> Self {
        self.normalize = Some(normalize);
        self
    }
}

/// At most one observation per subject, with a pre-built index for the subject id.
///
/// When built from an iterator, the first observation seen for a subject is kept and later ones
/// are dropped.
#[derive(Debug, Clone, Default)]
pub struct FirstReadings {
    els: Vec<Observation>,
    id_idx: BTreeMap<SubjectId, usize>,
}

impl FirstReadings {
    pub fn get(&self, subject_id: SubjectId) -> Option<&Observation> {
        let idx = self.id_idx.get(&subject_id)?;
        self.els.get(*idx)
    }

    pub fn value(&self, subject_id: SubjectId) -> Option<f64> {
        self.get(subject_id).and_then(|obs| obs.value)
    }

    pub fn subject_ids(&self) -> impl Iterator<Item = SubjectId> + '_ {
        self.els.iter().map(|obs| obs.subject_id)
    }

    /// Keep only readings matching the predicate.
    pub fn filter(self, f: impl Fn(&Observation) -> bool) -> Self {
        self.els.into_iter().filter(f).collect()
    }

    /// Transform every reading. The subject id must not be changed.
    pub fn map(self, f: impl Fn(Observation) -> Observation) -> Self {
        self.els.into_iter().map(f).collect()
    }
}

impl Deref for FirstReadings {
    type Target = [Observation];
    fn deref(&self) -> &Self::Target {
        &self.els
    }
}

impl FromIterator<Observation> for FirstReadings {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = Observation>,
    {
        let mut this = Self::default();
        for obs in iter {
            if this.id_idx.contains_key(&obs.subject_id) {
                continue;
            }
            this.id_idx.insert(obs.subject_id, this.els.len());
            this.els.push(obs);
        }
        this
    }
}

/// Query the database, and store the raw result in the cache under `spec.name` before returning
/// it.
pub fn fetch_live<S, C>(
    source: &S,
    spec: &VariableSpec,
    subjects: &[SubjectId],
    cache: &mut C,
) -> Result<Vec<Observation>>
where
    S: DataSource + ?Sized,
    C: CacheStore + ?Sized,
{
    let observations = source.observations(spec.table, &spec.item_ids, subjects)?;
    event!(
        Level::INFO,
        "{}: fetched {} observations from {}",
        spec.name,
        observations.len(),
        spec.table
    );
    let bytes = bincode::serialize(&observations)
        .with_context(|| format!("serializing observations for \"{}\"", spec.name))?;
    cache.put(&spec.name, &bytes)?;
    Ok(observations)
}

/// Load the raw result a previous [`fetch_live`] stored under `key`.
pub fn fetch_cached<C>(cache: &C, key: &str) -> Result<Vec<Observation>>
where
    C: CacheStore + ?Sized,
{
    let bytes = cache.get(key)?;
    let observations: Vec<Observation> =
        bincode::deserialize(&bytes).map_err(|source| CohortError::CacheCorrupt {
            key: key.into(),
            source,
        })?;
    event!(
        Level::INFO,
        "{}: loaded {} observations from cache",
        key,
        observations.len()
    );
    Ok(observations)
}

/// Drop observations without a value, or with a value outside `range`.
pub fn raw_plausibility_filter(
    observations: Vec<Observation>,
    range: ValidRange,
) -> Vec<Observation> {
    observations
        .into_iter()
        .filter(|obs| matches!(obs.value, Some(v) if range.contains(v)))
        .collect()
}

/// Keep the chronologically first observation for each subject.
///
/// The sort is stable, so observations with the same timestamp keep their original order.
pub fn earliest_per_subject(mut observations: Vec<Observation>) -> FirstReadings {
    observations.par_sort_by_key(|obs| obs.timestamp);
    observations.into_iter().collect()
}

/// Get the earliest plausible reading of a variable for each subject.
///
/// Subjects without any plausible reading are absent from the result.
pub fn extract<S, C>(
    source: &S,
    spec: &VariableSpec,
    subjects: &[SubjectId],
    cache: &mut C,
    mode: CacheMode,
) -> Result<FirstReadings>
where
    S: DataSource + ?Sized,
    C: CacheStore + ?Sized,
{
    let raw = match mode {
        CacheMode::Live => fetch_live(source, spec, subjects, cache)?,
        CacheMode::Cached => fetch_cached(cache, &spec.name)?,
    };
    let raw_len = raw.len();
    let plausible = raw_plausibility_filter(raw, spec.valid_range);
    event!(
        Level::DEBUG,
        "{}: {} of {} observations in {}",
        spec.name,
        plausible.len(),
        raw_len,
        spec.valid_range
    );
    let readings = earliest_per_subject(plausible);
    if readings.is_empty() {
        event!(
            Level::WARN,
            "{}: no plausible readings, column will be empty",
            spec.name
        );
    }
    Ok(readings)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::{cache::MemoryCache, source::test_source};
    use chrono::NaiveDate;

    pub(crate) fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2101, 1, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    pub(crate) fn obs(subject_id: SubjectId, ts: NaiveDateTime, value: Option<f64>) -> Observation {
        Observation {
            subject_id,
            admission_id: None,
            timestamp: ts,
            value,
            unit: None,
        }
    }

    fn heart_rate() -> VariableSpec {
        VariableSpec::new(
            "heart_rate",
            EventTable::ChartEvents,
            [211, 220045],
            ValidRange::new(0., 300.),
        )
    }

    #[test]
    fn plausibility_filter_is_strict() {
        let range = ValidRange::new(0., 300.);
        let kept = raw_plausibility_filter(
            vec![
                obs(1, at(1, 1), Some(0.)),
                obs(1, at(1, 2), Some(80.)),
                obs(1, at(1, 3), None),
                obs(1, at(1, 4), Some(300.)),
                obs(1, at(1, 5), Some(299.9)),
            ],
            range,
        );
        assert_eq!(kept.len(), 2);
        assert!(kept
            .iter()
            .all(|o| range.low < o.value.unwrap() && o.value.unwrap() < range.high));
    }

    #[test]
    fn earliest_reading_per_subject() {
        let readings = earliest_per_subject(vec![
            obs(1, at(3, 0), Some(1.)),
            obs(2, at(2, 0), Some(2.)),
            obs(1, at(1, 5), Some(3.)),
            obs(2, at(2, 0), Some(4.)),
            obs(1, at(1, 6), Some(5.)),
        ]);
        assert_eq!(readings.len(), 2);
        assert_eq!(readings.value(1), Some(3.));
        // ties keep the original order
        assert_eq!(readings.value(2), Some(2.));
        assert_eq!(readings.value(3), None);
        // output is in time order
        assert_eq!(readings.subject_ids().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn earliest_is_minimum_of_valid_readings() {
        let raw = vec![
            obs(5, at(1, 1), Some(500.)), // implausible, earliest
            obs(5, at(1, 3), Some(90.)),
            obs(5, at(1, 2), None), // missing
            obs(5, at(1, 4), Some(85.)),
        ];
        let readings = earliest_per_subject(raw_plausibility_filter(
            raw.clone(),
            ValidRange::new(0., 300.),
        ));
        let first = readings.get(5).unwrap();
        assert_eq!(first.value, Some(90.));
        assert!(raw
            .iter()
            .filter(|o| matches!(o.value, Some(v) if v < 300.))
            .all(|o| first.timestamp <= o.timestamp));
    }

    #[test]
    fn live_fetch_fills_cache_and_cached_fetch_reads_it() {
        let source = test_source(
            "INSERT INTO chartevents VALUES
                (1, 10, 211, '2101-01-01 10:00:00', 80, 'bpm'),
                (1, 10, 211, '2101-01-01 09:00:00', 400, 'bpm'),
                (1, 10, 220045, '2101-01-01 11:00:00', 82, 'bpm'),
                (2, 20, 220045, '2101-01-02 09:30:00', NULL, 'bpm'),
                (3, 30, 211, '2101-01-03 08:00:00', 95, 'bpm');",
        );
        let mut cache = MemoryCache::new();
        let spec = heart_rate();
        let live = extract(&source, &spec, &[1, 2], &mut cache, CacheMode::Live).unwrap();
        assert!(cache.contains("heart_rate"));
        assert_eq!(live.len(), 1);
        assert_eq!(live.value(1), Some(80.));

        let raw = fetch_cached(&cache, "heart_rate").unwrap();
        assert_eq!(raw.len(), 4);

        // the cached path must not touch the database
        let empty = crate::SqliteSource::open_in_memory().unwrap();
        let cached = extract(&empty, &spec, &[1, 2], &mut cache, CacheMode::Cached).unwrap();
        assert_eq!(cached.len(), live.len());
        assert_eq!(cached.get(1), live.get(1));
    }

    #[test]
    fn live_fetch_reports_query_failure() {
        let source = crate::SqliteSource::open_in_memory().unwrap();
        let mut cache = MemoryCache::new();
        let err = extract(&source, &heart_rate(), &[1], &mut cache, CacheMode::Live).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CohortError>(),
            Some(CohortError::SourceUnavailable(_))
        ));
        assert!(!cache.contains("heart_rate"));
    }

    #[test]
    fn cached_fetch_errors() {
        let mut cache = MemoryCache::new();
        let err = fetch_cached(&cache, "wbc").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CohortError>(),
            Some(CohortError::CacheMissing { .. })
        ));

        cache.put("wbc", b"not bincode").unwrap();
        let err = fetch_cached(&cache, "wbc").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CohortError>(),
            Some(CohortError::CacheCorrupt { .. })
        ));
    }

    #[test]
    fn empty_after_filtering_is_not_an_error() {
        let source = test_source(
            "INSERT INTO chartevents VALUES (1, 10, 211, '2101-01-01 10:00:00', -5, 'bpm');",
        );
        let mut cache = MemoryCache::new();
        let readings =
            extract(&source, &heart_rate(), &[1], &mut cache, CacheMode::Live).unwrap();
        assert!(readings.is_empty());
    }
}
