//! Turning the persisted cohort into the table the report is computed from.
//!
//! Each row gets a septic label from its diagnoses, then every row with anything missing is
//! dropped.
use crate::{
    cohort::{Cohort, CohortRow, DIAGNOSES_COLUMN, SUBJECT_ID_COLUMN},
    diagnosis::{DiagnosisSet, SepticMatcher},
    ArcStr, HtmlTable, SubjectId,
};
use qu::ick_use::*;
use std::ops::Deref;

pub const LABEL_COLUMN: &str = "septic";

/// A complete row: every field is present.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRow {
    pub subject_id: SubjectId,
    pub diagnoses: DiagnosisSet,
    pub values: Vec<f64>,
    pub septic: bool,
}

/// The analysis-ready table.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisTable {
    variables: Vec<ArcStr>,
    rows: Vec<AnalysisRow>,
    dropped: usize,
}

/// The label for each cohort row, in row order. `None` when the row has no diagnoses.
pub fn derive_labels(cohort: &Cohort, matcher: &SepticMatcher) -> Vec<Option<bool>> {
    cohort
        .iter()
        .map(|row| row.diagnoses.as_ref().map(|d| matcher.is_septic(d)))
        .collect()
}

/// Keep rows where the diagnoses, every value and the label are all present.
///
/// Returns the complete rows in input order, and how many rows were dropped.
pub fn completeness_filter<'a>(
    rows: impl IntoIterator<Item = (&'a CohortRow, Option<bool>)>,
) -> (Vec<AnalysisRow>, usize) {
    let mut kept = vec![];
    let mut dropped = 0;
    for (row, label) in rows {
        match complete_row(row, label) {
            Some(row) => kept.push(row),
            None => dropped += 1,
        }
    }
    (kept, dropped)
}

fn complete_row(row: &CohortRow, label: Option<bool>) -> Option<AnalysisRow> {
    Some(AnalysisRow {
        subject_id: row.subject_id,
        diagnoses: row.diagnoses.clone()?,
        values: row.values.iter().copied().collect::<Option<Vec<f64>>>()?,
        septic: label?,
    })
}

impl AnalysisTable {
    pub fn from_cohort(cohort: &Cohort, matcher: &SepticMatcher) -> Self {
        let labels = derive_labels(cohort, matcher);
        let (rows, dropped) = completeness_filter(cohort.iter().zip(labels));
        event!(
            Level::INFO,
            "{} of {} cohort rows are complete ({} dropped)",
            rows.len(),
            cohort.len(),
            dropped
        );
        Self {
            variables: cohort.variables().to_vec(),
            rows,
            dropped,
        }
    }

    pub fn variables(&self) -> &[ArcStr] {
        &self.variables
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| &**v == name)
    }

    /// Number of cohort rows removed because something was missing.
    pub fn dropped(&self) -> usize {
        self.dropped
    }

    pub fn septic_count(&self) -> usize {
        self.rows.iter().filter(|row| row.septic).count()
    }

    /// All values of a variable, or `None` if there is no such variable.
    pub fn values(&self, variable: &str) -> Option<Vec<f64>> {
        let col = self.column(variable)?;
        Some(self.rows.iter().map(|row| row.values[col]).collect())
    }

    /// Values of a variable for rows with the given label.
    pub fn values_by_label(&self, variable: &str, septic: bool) -> Option<Vec<f64>> {
        let col = self.column(variable)?;
        Some(
            self.rows
                .iter()
                .filter(|row| row.septic == septic)
                .map(|row| row.values[col])
                .collect(),
        )
    }

    pub fn evcxr_display(&self) {
        let mut table = HtmlTable::new(
            [SUBJECT_ID_COLUMN.to_string(), DIAGNOSES_COLUMN.to_string()]
                .into_iter()
                .chain(self.variables.iter().map(|v| v.to_string()))
                .chain([LABEL_COLUMN.to_string()]),
        )
        .with_title(format!(
            "{} complete rows, {} septic",
            self.rows.len(),
            self.septic_count()
        ));
        for row in &self.rows {
            table.push_row(
                [row.subject_id.to_string(), row.diagnoses.to_string()]
                    .into_iter()
                    .chain(row.values.iter().map(|v| format!("{:.3}", v)))
                    .chain([row.septic.to_string()]),
            );
        }
        table.evcxr_display();
    }
}

impl Deref for AnalysisTable {
    type Target = [AnalysisRow];
    fn deref(&self) -> &Self::Target {
        &self.rows
    }
}

#[cfg(test)]
mod test {
    use super::{completeness_filter, derive_labels, AnalysisTable};
    use crate::{
        cohort::Cohort,
        diagnosis::SepticMatcher,
        extract::test::{at, obs},
    };
    use std::collections::BTreeMap;

    fn cohort() -> Cohort {
        let mut diagnoses = BTreeMap::new();
        diagnoses.insert(1, ["99591", "4019"].into_iter().collect());
        diagnoses.insert(2, ["4019", "2724"].into_iter().collect());
        diagnoses.insert(3, ["78552"].into_iter().collect());
        diagnoses.insert(4, ["2724"].into_iter().collect());
        let mut cohort = Cohort::from_diagnoses(diagnoses);
        let hr = [(1, 110.), (2, 70.), (3, 120.), (5, 90.)]
            .into_iter()
            .map(|(id, v)| obs(id, at(1, 0), Some(v)))
            .collect();
        let wbc = [(1, 14.), (2, 6.), (4, 7.), (5, 9.)]
            .into_iter()
            .map(|(id, v)| obs(id, at(1, 0), Some(v)))
            .collect();
        cohort.merge("heart_rate", &hr);
        cohort.merge("wbc", &wbc);
        cohort
    }

    #[test]
    fn labels_follow_diagnoses() {
        let cohort = cohort();
        let labels = derive_labels(&cohort, &SepticMatcher::default());
        assert_eq!(
            labels,
            vec![Some(true), Some(false), Some(true), Some(false), None]
        );
    }

    #[test]
    fn drops_incomplete_rows() {
        let table = AnalysisTable::from_cohort(&cohort(), &SepticMatcher::default());
        // 3 has no wbc, 4 has no heart rate, 5 has no diagnoses
        assert_eq!(
            table.iter().map(|row| row.subject_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(table.dropped(), 3);
        assert_eq!(table.septic_count(), 1);
        assert_eq!(table.values("wbc"), Some(vec![14., 6.]));
        assert_eq!(table.values_by_label("heart_rate", true), Some(vec![110.]));
        assert_eq!(table.values("temperature"), None);
    }

    #[test]
    fn filter_is_deterministic() {
        let cohort = cohort();
        let labels = derive_labels(&cohort, &SepticMatcher::default());
        let a = completeness_filter(cohort.iter().zip(labels.clone()));
        let b = completeness_filter(cohort.iter().zip(labels));
        assert_eq!(a, b);
    }

    #[test]
    fn missing_label_drops_row() {
        let cohort = cohort();
        let labels = vec![None; cohort.len()];
        let (rows, dropped) = completeness_filter(cohort.iter().zip(labels));
        assert!(rows.is_empty());
        assert_eq!(dropped, cohort.len());
    }
}
