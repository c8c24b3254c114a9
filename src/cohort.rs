//! The wide cohort table: one row per subject, one column per variable.
use crate::{
    diagnosis::DiagnosisSet,
    extract::FirstReadings,
    util::{self, fmt_opt, optional_f64},
    ArcStr, HtmlTable, Result, SubjectId,
};
use qu::ick_use::*;
use std::{
    collections::BTreeMap,
    fs, io,
    ops::Deref,
    path::Path,
};

pub const SUBJECT_ID_COLUMN: &str = "subject_id";
pub const DIAGNOSES_COLUMN: &str = "icd9_codes";

/// A row in the cohort table.
///
/// `diagnoses` is only `None` for subjects added by a merge. `values` has one entry per
/// [`Cohort::variables`] column.
#[derive(Debug, Clone, PartialEq)]
pub struct CohortRow {
    pub subject_id: SubjectId,
    pub diagnoses: Option<DiagnosisSet>,
    pub values: Vec<Option<f64>>,
}

/// The cohort table, with a pre-built index for the subject id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Cohort {
    variables: Vec<ArcStr>,
    rows: Vec<CohortRow>,
    id_idx: BTreeMap<SubjectId, usize>,
}

impl Cohort {
    /// Start a cohort with no variables from aggregated diagnoses.
    pub fn from_diagnoses(diagnoses: BTreeMap<SubjectId, DiagnosisSet>) -> Self {
        let rows = diagnoses
            .into_iter()
            .map(|(subject_id, set)| CohortRow {
                subject_id,
                diagnoses: Some(set),
                values: vec![],
            })
            .collect();
        Self::new(vec![], rows)
    }

    /// The variable columns, in the order they were merged.
    pub fn variables(&self) -> &[ArcStr] {
        &self.variables
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.variables.iter().position(|v| &**v == name)
    }

    pub fn subject_ids(&self) -> Vec<SubjectId> {
        self.rows.iter().map(|row| row.subject_id).collect()
    }

    pub fn find_by_id(&self, id: SubjectId) -> Option<&CohortRow> {
        let idx = self.id_idx.get(&id)?;
        self.rows.get(*idx)
    }

    pub fn value(&self, id: SubjectId, variable: &str) -> Option<f64> {
        let col = self.column(variable)?;
        self.find_by_id(id)?.values[col]
    }

    /// Outer-merge a variable's readings onto the table, keyed by subject id.
    ///
    /// Cohort subjects without a reading get `None`. Subjects with a reading but no row are
    /// appended, with no diagnoses and `None` for the other variables. Merging a variable that is
    /// already a column overwrites that column, so merging the same readings twice is a no-op.
    pub fn merge(&mut self, name: &str, readings: &FirstReadings) {
        let col = match self.column(name) {
            Some(col) => col,
            None => {
                self.variables.push(name.into());
                for row in self.rows.iter_mut() {
                    row.values.push(None);
                }
                self.variables.len() - 1
            }
        };
        for row in self.rows.iter_mut() {
            row.values[col] = readings.value(row.subject_id);
        }

        let width = self.variables.len();
        let mut appended = 0;
        for reading in readings.iter() {
            if self.id_idx.contains_key(&reading.subject_id) {
                continue;
            }
            let mut values = vec![None; width];
            values[col] = reading.value;
            self.id_idx.insert(reading.subject_id, self.rows.len());
            self.rows.push(CohortRow {
                subject_id: reading.subject_id,
                diagnoses: None,
                values,
            });
            appended += 1;
        }
        if appended > 0 {
            event!(
                Level::WARN,
                "{}: {} subjects with readings were not in the cohort",
                name,
                appended
            );
        }
        event!(
            Level::INFO,
            "merged {}: {} of {} subjects have a value",
            name,
            self.rows.iter().filter(|row| row.values[col].is_some()).count(),
            self.rows.len()
        );
    }

    /// Write the table as CSV: subject id, diagnosis string, then the variables.
    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result {
        fn inner(this: &Cohort, path: &Path) -> Result {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).context("could not create parent")?;
            }
            if util::path_exists(path)? {
                event!(
                    Level::WARN,
                    "overwriting existing file at \"{}\"",
                    path.display()
                );
            }
            this.to_writer(io::BufWriter::new(fs::File::create(path)?))
        }
        let path = path.as_ref();
        inner(self, path).with_context(|| format!("unable to write cohort to \"{}\"", path.display()))
    }

    pub fn to_writer(&self, writer: impl io::Write) -> Result {
        let mut out = csv::Writer::from_writer(writer);
        out.write_record(
            [SUBJECT_ID_COLUMN, DIAGNOSES_COLUMN]
                .into_iter()
                .chain(self.variables.iter().map(|v| &**v)),
        )?;
        for row in &self.rows {
            let mut record = vec![
                row.subject_id.to_string(),
                row.diagnoses
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
            ];
            record.extend(
                row.values
                    .iter()
                    .map(|v| v.map(|v| v.to_string()).unwrap_or_default()),
            );
            out.write_record(&record)?;
        }
        out.flush()?;
        Ok(())
    }

    /// Load a table written by [`Cohort::write_csv`].
    pub fn read_csv(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = fs::File::open(path)
            .with_context(|| format!("unable to open cohort file \"{}\"", path.display()))?;
        Self::from_reader(io::BufReader::new(file))
            .with_context(|| format!("while loading \"{}\"", path.display()))
    }

    pub fn from_reader(reader: impl io::Read) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = reader.headers()?.clone();
        ensure!(
            headers.get(0) == Some(SUBJECT_ID_COLUMN) && headers.get(1) == Some(DIAGNOSES_COLUMN),
            "expected the first columns to be `{}` and `{}`",
            SUBJECT_ID_COLUMN,
            DIAGNOSES_COLUMN
        );
        let variables: Vec<ArcStr> = headers.iter().skip(2).map(Into::into).collect();

        let mut rows = vec![];
        for (line, record) in reader.records().enumerate() {
            let record = record?;
            let row = parse_row(&record, variables.len())
                .with_context(|| format!("on data row {}", line + 1))?;
            rows.push(row);
        }

        let this = Self::new(variables, rows);
        ensure!(
            this.id_idx.len() == this.rows.len(),
            "subject ids must be unique"
        );
        Ok(this)
    }

    pub fn term_table(&self) -> term_data_table::Table<'_> {
        use term_data_table::{Cell, Row, Table};
        let mut header = Row::new()
            .with_cell(Cell::from(SUBJECT_ID_COLUMN))
            .with_cell(Cell::from(DIAGNOSES_COLUMN));
        for variable in &self.variables {
            header = header.with_cell(Cell::from(variable.to_string()));
        }
        let mut table = Table::new().with_row(header);
        for row in &self.rows {
            let mut cells = Row::new()
                .with_cell(Cell::from(row.subject_id.to_string()))
                .with_cell(Cell::from(
                    row.diagnoses
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                ));
            for value in &row.values {
                cells = cells.with_cell(Cell::from(fmt_opt(*value)));
            }
            table.add_row(cells);
        }
        table
    }

    pub fn evcxr_display(&self) {
        let mut table = HtmlTable::new(
            [SUBJECT_ID_COLUMN.to_string(), DIAGNOSES_COLUMN.to_string()]
                .into_iter()
                .chain(self.variables.iter().map(|v| v.to_string())),
        );
        for row in &self.rows {
            table.push_row(
                [
                    row.subject_id.to_string(),
                    row.diagnoses
                        .as_ref()
                        .map(ToString::to_string)
                        .unwrap_or_default(),
                ]
                .into_iter()
                .chain(row.values.iter().map(|v| fmt_opt(*v))),
            );
        }
        table.evcxr_display();
    }

    fn new(variables: Vec<ArcStr>, rows: Vec<CohortRow>) -> Self {
        let mut this = Self {
            variables,
            rows,
            id_idx: BTreeMap::new(),
        };
        this.rebuild_index();
        this
    }

    fn rebuild_index(&mut self) {
        self.id_idx.clear();
        for (idx, row) in self.rows.iter().enumerate() {
            self.id_idx.insert(row.subject_id, idx);
        }
    }
}

impl Deref for Cohort {
    type Target = [CohortRow];
    fn deref(&self) -> &Self::Target {
        &self.rows
    }
}

fn parse_row(record: &csv::StringRecord, width: usize) -> Result<CohortRow> {
    ensure!(
        record.len() == width + 2,
        "expected {} fields, found {}",
        width + 2,
        record.len()
    );
    let subject_id: SubjectId = record[0]
        .parse()
        .with_context(|| format!("invalid subject id \"{}\"", &record[0]))?;
    let diagnoses = match &record[1] {
        "" => None,
        s => Some(s.parse::<DiagnosisSet>()?),
    };
    let values = record
        .iter()
        .skip(2)
        .map(|field| {
            optional_f64(field).with_context(|| format!("invalid number \"{}\"", field))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(CohortRow {
        subject_id,
        diagnoses,
        values,
    })
}
