//! Diagnosis codes per subject, and the septic label derived from them.
use crate::{ArcStr, SubjectId};
use aho_corasick::AhoCorasick;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

/// ICD-9 codes for sepsis, severe sepsis and septic shock.
pub const SEPTIC_CODES: [&str; 3] = ["99591", "99592", "78552"];

/// One row of `diagnoses_icd`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosisRecord {
    pub subject_id: SubjectId,
    pub code: Option<ArcStr>,
}

/// The distinct diagnosis codes recorded for a subject, across all their admissions.
///
/// Displayed (and persisted) as the sorted codes joined with `", "`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosisSet {
    codes: BTreeSet<ArcStr>,
}

impl DiagnosisSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blank codes are ignored.
    pub fn insert(&mut self, code: ArcStr) {
        if !code.trim().is_empty() {
            self.codes.insert(code);
        }
    }

    /// Exact membership (unlike [`SepticMatcher`]).
    pub fn contains(&self, code: &str) -> bool {
        self.codes.contains(code)
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.codes.iter().map(|code| &**code)
    }
}

impl fmt::Display for DiagnosisSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.codes.iter().join(", "))
    }
}

impl FromStr for DiagnosisSet {
    type Err = std::convert::Infallible;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(s.split(',').map(|code| ArcStr::from(code.trim())).collect())
    }
}

impl FromIterator<ArcStr> for DiagnosisSet {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = ArcStr>,
    {
        let mut set = Self::new();
        for code in iter {
            set.insert(code);
        }
        set
    }
}

impl<'a> FromIterator<&'a str> for DiagnosisSet {
    fn from_iter<T>(iter: T) -> Self
    where
        T: IntoIterator<Item = &'a str>,
    {
        iter.into_iter().map(ArcStr::from).collect()
    }
}

/// Group diagnosis records by subject.
///
/// Subjects without any (non-null) code don't appear in the output.
pub fn aggregate_diagnoses(
    records: impl IntoIterator<Item = DiagnosisRecord>,
) -> BTreeMap<SubjectId, DiagnosisSet> {
    let mut map: BTreeMap<SubjectId, DiagnosisSet> = BTreeMap::new();
    for record in records {
        let Some(code) = record.code else {
            continue;
        };
        map.entry(record.subject_id).or_default().insert(code);
    }
    map.retain(|_, set| !set.is_empty());
    map
}

/// Tests diagnosis strings for any of a set of target codes.
///
/// This is a substring test on the serialized code list, not set membership: a longer code that
/// happens to contain a target code will also match.
pub struct SepticMatcher {
    codes: Vec<ArcStr>,
    matcher: AhoCorasick,
}

impl SepticMatcher {
    pub fn new(codes: impl IntoIterator<Item = impl Into<ArcStr>>) -> Self {
        let codes: Vec<ArcStr> = codes
            .into_iter()
            .map(Into::into)
            .filter(|code: &ArcStr| !code.is_empty())
            .collect();
        let matcher = AhoCorasick::new(codes.iter().map(|code| code.as_bytes()));
        Self { codes, matcher }
    }

    pub fn codes(&self) -> &[ArcStr] {
        &self.codes
    }

    pub fn is_match(&self, diagnoses: &str) -> bool {
        self.matcher.is_match(diagnoses)
    }

    pub fn is_septic(&self, diagnoses: &DiagnosisSet) -> bool {
        self.is_match(&diagnoses.to_string())
    }
}

impl Default for SepticMatcher {
    fn default() -> Self {
        Self::new(SEPTIC_CODES)
    }
}
