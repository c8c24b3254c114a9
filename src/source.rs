//! Read access to the clinical database.
//!
//! Tables follow the MIMIC-III layout:
//!
//! ```text
//! diagnoses_icd(subject_id, hadm_id, icd9_code)
//! chartevents(subject_id, hadm_id, itemid, charttime, valuenum, valueuom)
//! labevents(subject_id, hadm_id, itemid, charttime, valuenum, valueuom)
//! ```
use crate::{
    config::{SourceConfig, SourceKind},
    diagnosis::DiagnosisRecord,
    extract::Observation,
    CohortError, ItemId, Result, SubjectId,
};
use itertools::Itertools;
use parking_lot::Mutex;
use qu::ick_use::*;
use rusqlite::{params_from_iter, Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::{fmt, iter, path::Path, time::Duration};

/// Keeps the number of bound parameters per statement well under SQLite's limit.
const SUBJECTS_PER_QUERY: usize = 500;

/// The two tables physiological measurements are recorded in.
///
/// Table names are never taken from free text.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventTable {
    /// Bedside charted observations (vital signs).
    ChartEvents,
    /// Laboratory results.
    LabEvents,
}

impl EventTable {
    pub fn table_name(self) -> &'static str {
        match self {
            EventTable::ChartEvents => "chartevents",
            EventTable::LabEvents => "labevents",
        }
    }
}

impl fmt::Display for EventTable {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.table_name())
    }
}

/// The queries the extractor needs from a database.
///
/// Implementations report connection and query failures as [`CohortError::SourceUnavailable`].
pub trait DataSource {
    /// Every distinct subject with at least one diagnosis record.
    fn subject_ids(&self) -> Result<Vec<SubjectId>>;

    /// All diagnosis records for the given subjects.
    fn diagnoses(&self, subjects: &[SubjectId]) -> Result<Vec<DiagnosisRecord>>;

    /// All observations in `table` with one of `item_ids`, for the given subjects.
    fn observations(
        &self,
        table: EventTable,
        item_ids: &[ItemId],
        subjects: &[SubjectId],
    ) -> Result<Vec<Observation>>;

    /// Close the connection, reporting any error from doing so.
    fn disconnect(self: Box<Self>) -> Result {
        Ok(())
    }
}

/// Connect to the backend named by `config.kind`.
pub fn open(config: &SourceConfig) -> Result<Box<dyn DataSource>> {
    Ok(match config.kind {
        SourceKind::Sqlite => Box::new(SqliteSource::open(config)?),
        SourceKind::Postgres => Box::new(PostgresSource::connect(config)?),
    })
}

/// A MIMIC database stored in SQLite.
pub struct SqliteSource {
    conn: Connection,
    schema: String,
}

impl SqliteSource {
    /// Open the database read-only.
    ///
    /// With a `schema`, the file is attached to an in-memory connection under that name, so tables
    /// are found as `<schema>.<table>`.
    pub fn open(config: &SourceConfig) -> Result<Self> {
        let schema = config.schema.as_deref().unwrap_or("main");
        check_identifier(schema)?;
        let conn = if schema == "main" {
            Connection::open_with_flags(&config.path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        } else {
            attach_read_only(&config.path, schema)
        }
        .map_err(CohortError::from)
        .with_context(|| format!("opening database \"{}\"", config.path.display()))?;
        event!(
            Level::INFO,
            "connected to \"{}\" (schema {})",
            config.path.display(),
            schema
        );
        Ok(Self {
            conn,
            schema: schema.to_owned(),
        })
    }

    /// Open an empty in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(CohortError::from)?;
        Ok(Self {
            conn,
            schema: "main".into(),
        })
    }

    /// Run a batch of statements, e.g. to create and fill tables.
    pub fn execute_batch(&self, sql: &str) -> Result {
        self.conn
            .execute_batch(sql)
            .map_err(CohortError::from)
            .context("executing statements")?;
        Ok(())
    }

    /// Close the connection, reporting any error from doing so.
    pub fn close(self) -> Result {
        self.conn
            .close()
            .map_err(|(_, e)| CohortError::from(e))
            .context("closing database connection")?;
        Ok(())
    }

    fn table(&self, name: &str) -> String {
        format!("{}.{}", self.schema, name)
    }
}

fn attach_read_only(path: &Path, schema: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open_in_memory_with_flags(
        OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_URI
            | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    // `mode=ro` stops ATTACH from creating a missing file
    let uri = format!(
        "file:{}?mode=ro",
        path.to_string_lossy()
            .replace('%', "%25")
            .replace('?', "%3f")
            .replace('#', "%23")
    );
    conn.execute(&format!("ATTACH DATABASE ?1 AS {}", schema), [uri])?;
    Ok(conn)
}

impl DataSource for SqliteSource {
    fn subject_ids(&self) -> Result<Vec<SubjectId>> {
        let sql = format!(
            "SELECT DISTINCT subject_id FROM {}",
            self.table("diagnoses_icd")
        );
        event!(Level::DEBUG, "{}", sql);
        fn inner(conn: &Connection, sql: &str) -> rusqlite::Result<Vec<SubjectId>> {
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        }
        Ok(inner(&self.conn, &sql)
            .map_err(CohortError::from)
            .context("querying subject ids")?)
    }

    fn diagnoses(&self, subjects: &[SubjectId]) -> Result<Vec<DiagnosisRecord>> {
        fn inner(
            this: &SqliteSource,
            subjects: &[SubjectId],
        ) -> rusqlite::Result<Vec<DiagnosisRecord>> {
            let mut out = vec![];
            for chunk in subjects.chunks(SUBJECTS_PER_QUERY) {
                let sql = format!(
                    "SELECT subject_id, icd9_code FROM {} WHERE subject_id IN ({})",
                    this.table("diagnoses_icd"),
                    placeholders(chunk.len())
                );
                event!(Level::DEBUG, "{}", sql);
                let mut stmt = this.conn.prepare(&sql)?;
                let rows = stmt.query_map(params_from_iter(chunk.iter()), |row| {
                    Ok(DiagnosisRecord {
                        subject_id: row.get(0)?,
                        code: row.get::<_, Option<String>>(1)?.map(Into::into),
                    })
                })?;
                for row in rows {
                    out.push(row?);
                }
            }
            Ok(out)
        }
        Ok(inner(self, subjects)
            .map_err(CohortError::from)
            .context("querying diagnoses")?)
    }

    fn observations(
        &self,
        table: EventTable,
        item_ids: &[ItemId],
        subjects: &[SubjectId],
    ) -> Result<Vec<Observation>> {
        fn inner(
            this: &SqliteSource,
            table: EventTable,
            item_ids: &[ItemId],
            subjects: &[SubjectId],
        ) -> rusqlite::Result<Vec<Observation>> {
            let mut out = vec![];
            if item_ids.is_empty() {
                return Ok(out);
            }
            for chunk in subjects.chunks(SUBJECTS_PER_QUERY) {
                let sql = format!(
                    "SELECT subject_id, hadm_id, charttime, valuenum, valueuom FROM {} \
                     WHERE itemid IN ({}) AND subject_id IN ({})",
                    this.table(table.table_name()),
                    placeholders(item_ids.len()),
                    placeholders(chunk.len())
                );
                event!(Level::DEBUG, "{}", sql);
                let mut stmt = this.conn.prepare(&sql)?;
                let params = item_ids.iter().chain(chunk.iter());
                let rows = stmt.query_map(params_from_iter(params), |row| {
                    Ok(Observation {
                        subject_id: row.get(0)?,
                        admission_id: row.get(1)?,
                        timestamp: row.get(2)?,
                        value: row.get(3)?,
                        unit: row.get::<_, Option<String>>(4)?.map(Into::into),
                    })
                })?;
                for row in rows {
                    out.push(row?);
                }
            }
            Ok(out)
        }
        Ok(inner(self, table, item_ids, subjects)
            .map_err(CohortError::from)
            .with_context(|| format!("querying {} for items {:?}", table, item_ids))?)
    }

    fn disconnect(self: Box<Self>) -> Result {
        self.close()
    }
}

/// A MIMIC database on a PostgreSQL server.
///
/// Columns and id arrays are cast in the queries, since MIMIC-III stores ids as `INT4`.
pub struct PostgresSource {
    client: Mutex<postgres::Client>,
}

impl PostgresSource {
    /// Connect, then point `search_path` at `config.schema` if given.
    pub fn connect(config: &SourceConfig) -> Result<Self> {
        if let Some(schema) = &config.schema {
            check_identifier(schema)?;
        }
        let mut pg = postgres::Config::new();
        pg.host(&config.host)
            .port(config.port)
            .dbname(&config.dbname)
            .connect_timeout(Duration::from_secs(10));
        if let Some(user) = &config.user {
            pg.user(user);
        }
        if let Some(password) = &config.password {
            pg.password(password);
        }
        let mut client = pg
            .connect(postgres::NoTls)
            .map_err(CohortError::from)
            .with_context(|| {
                format!(
                    "connecting to {}:{}/{}",
                    config.host, config.port, config.dbname
                )
            })?;
        if let Some(schema) = &config.schema {
            client
                .batch_execute(&format!("SET search_path TO {}", schema))
                .map_err(CohortError::from)
                .context("setting search_path")?;
        }
        event!(
            Level::INFO,
            "connected to {}:{}/{} (schema {})",
            config.host,
            config.port,
            config.dbname,
            config.schema.as_deref().unwrap_or("public")
        );
        Ok(Self {
            client: Mutex::new(client),
        })
    }
}

impl DataSource for PostgresSource {
    fn subject_ids(&self) -> Result<Vec<SubjectId>> {
        let sql = "SELECT DISTINCT subject_id::int8 FROM diagnoses_icd";
        event!(Level::DEBUG, "{}", sql);
        let rows = self
            .client
            .lock()
            .query(sql, &[])
            .map_err(CohortError::from)
            .context("querying subject ids")?;
        Ok(rows
            .iter()
            .map(|row| row.try_get::<_, SubjectId>(0))
            .collect::<Result<_, _>>()
            .map_err(CohortError::from)
            .context("reading subject ids")?)
    }

    fn diagnoses(&self, subjects: &[SubjectId]) -> Result<Vec<DiagnosisRecord>> {
        let sql = "SELECT subject_id::int8, icd9_code::text FROM diagnoses_icd \
                   WHERE subject_id = ANY($1::int8[])";
        event!(Level::DEBUG, "{}", sql);
        let rows = self
            .client
            .lock()
            .query(sql, &[&subjects])
            .map_err(CohortError::from)
            .context("querying diagnoses")?;
        let read = |row: &postgres::Row| -> Result<DiagnosisRecord, postgres::Error> {
            Ok(DiagnosisRecord {
                subject_id: row.try_get(0)?,
                code: row.try_get::<_, Option<String>>(1)?.map(Into::into),
            })
        };
        Ok(rows
            .iter()
            .map(read)
            .collect::<Result<_, _>>()
            .map_err(CohortError::from)
            .context("reading diagnoses")?)
    }

    fn observations(
        &self,
        table: EventTable,
        item_ids: &[ItemId],
        subjects: &[SubjectId],
    ) -> Result<Vec<Observation>> {
        let sql = format!(
            "SELECT subject_id::int8, hadm_id::int8, charttime::timestamp, valuenum::float8, \
             valueuom::text FROM {} WHERE itemid = ANY($1::int8[]) AND subject_id = ANY($2::int8[])",
            table.table_name()
        );
        event!(Level::DEBUG, "{}", sql);
        let rows = self
            .client
            .lock()
            .query(sql.as_str(), &[&item_ids, &subjects])
            .map_err(CohortError::from)
            .with_context(|| format!("querying {} for items {:?}", table, item_ids))?;
        let read = |row: &postgres::Row| -> Result<Observation, postgres::Error> {
            Ok(Observation {
                subject_id: row.try_get(0)?,
                admission_id: row.try_get(1)?,
                timestamp: row.try_get(2)?,
                value: row.try_get(3)?,
                unit: row.try_get::<_, Option<String>>(4)?.map(Into::into),
            })
        };
        Ok(rows
            .iter()
            .map(read)
            .collect::<Result<_, _>>()
            .map_err(CohortError::from)
            .with_context(|| format!("reading {} rows", table))?)
    }

    fn disconnect(self: Box<Self>) -> Result {
        self.client
            .into_inner()
            .close()
            .map_err(CohortError::from)
            .context("closing database connection")?;
        Ok(())
    }
}

fn placeholders(count: usize) -> String {
    iter::repeat("?").take(count).join(", ")
}

/// Schema names end up in SQL text, so only allow plain identifiers.
fn check_identifier(name: &str) -> Result {
    let mut chars = name.chars();
    ensure!(
        matches!(chars.next(), Some(ch) if ch.is_ascii_alphabetic() || ch == '_')
            && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_'),
        "invalid schema name \"{}\"",
        name
    );
    Ok(())
}

/// Creates the MIMIC tables used here, followed by `inserts`.
#[cfg(test)]
pub(crate) fn test_source(inserts: &str) -> SqliteSource {
    let source = SqliteSource::open_in_memory().unwrap();
    source
        .execute_batch(
            "CREATE TABLE diagnoses_icd (subject_id INTEGER, hadm_id INTEGER, icd9_code TEXT);
             CREATE TABLE chartevents (subject_id INTEGER, hadm_id INTEGER, itemid INTEGER,
                                       charttime TEXT, valuenum REAL, valueuom TEXT);
             CREATE TABLE labevents (subject_id INTEGER, hadm_id INTEGER, itemid INTEGER,
                                     charttime TEXT, valuenum REAL, valueuom TEXT);",
        )
        .unwrap();
    source.execute_batch(inserts).unwrap();
    source
}

#[cfg(test)]
mod test {
    use super::{
        check_identifier, test_source, DataSource, EventTable, PostgresSource, SqliteSource,
    };
    use crate::{
        config::{SourceConfig, SourceKind},
        CohortError,
    };

    #[test]
    fn queries_subjects_and_diagnoses() {
        let source = test_source(
            "INSERT INTO diagnoses_icd VALUES (1, 10, '4019'), (1, 11, '99591'),
                                              (2, 20, '2724'), (3, 30, NULL);",
        );
        let mut ids = source.subject_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec![1, 2, 3]);

        let diagnoses = source.diagnoses(&[1, 3]).unwrap();
        assert_eq!(diagnoses.len(), 3);
        assert!(diagnoses.iter().all(|d| d.subject_id != 2));
        assert!(diagnoses.iter().any(|d| d.code.is_none()));
    }

    #[test]
    fn queries_observations_by_item_and_subject() {
        let source = test_source(
            "INSERT INTO chartevents VALUES
                (1, 10, 211, '2101-01-01 10:00:00', 80, 'bpm'),
                (1, 10, 618, '2101-01-01 10:00:00', 18, 'insp/min'),
                (2, 20, 220045, '2101-01-02 09:30:00', NULL, NULL),
                (3, NULL, 211, '2101-01-03 08:00:00', 95, 'bpm');",
        );
        let obs = source
            .observations(EventTable::ChartEvents, &[211, 220045], &[1, 2])
            .unwrap();
        assert_eq!(obs.len(), 2);
        let first = obs.iter().find(|o| o.subject_id == 1).unwrap();
        assert_eq!(first.value, Some(80.));
        assert_eq!(first.admission_id, Some(10));
        assert_eq!(first.unit.as_deref(), Some("bpm"));
        let second = obs.iter().find(|o| o.subject_id == 2).unwrap();
        assert_eq!(second.value, None);

        let none = source
            .observations(EventTable::LabEvents, &[50818], &[1, 2, 3])
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn missing_table_is_source_unavailable() {
        let source = SqliteSource::open_in_memory().unwrap();
        let err = source.subject_ids().unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CohortError>(),
            Some(CohortError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn missing_database_is_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = SourceConfig {
            path: dir.path().join("missing.sqlite"),
            ..SourceConfig::default()
        };
        let err = SqliteSource::open(&config).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<CohortError>(),
            Some(CohortError::SourceUnavailable(_))
        ));
        config.schema = Some("mimiciii".into());
        let err = SqliteSource::open(&config).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<CohortError>(),
            Some(CohortError::SourceUnavailable(_))
        ));
        assert!(!config.path.exists());
    }

    #[test]
    fn schema_attaches_database_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mimic#1.sqlite");
        let conn = rusqlite::Connection::open(&path).unwrap();
        conn.execute_batch(
            "CREATE TABLE diagnoses_icd (subject_id INTEGER, hadm_id INTEGER, icd9_code TEXT);
             INSERT INTO diagnoses_icd VALUES (1, 10, '99591'), (1, 11, '4019'), (4, 40, '2724');",
        )
        .unwrap();
        conn.close().unwrap();

        let config = SourceConfig {
            path,
            schema: Some("mimiciii".into()),
            ..SourceConfig::default()
        };
        let source = super::open(&config).unwrap();
        let mut ids = source.subject_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec![1, 4]);
        assert_eq!(source.diagnoses(&[1]).unwrap().len(), 2);
        source.disconnect().unwrap();
    }

    #[test]
    fn attached_database_is_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mimic.sqlite");
        rusqlite::Connection::open(&path)
            .unwrap()
            .execute_batch("CREATE TABLE diagnoses_icd (subject_id INTEGER, icd9_code TEXT);")
            .unwrap();
        let source = SqliteSource::open(&SourceConfig {
            path,
            schema: Some("mimiciii".into()),
            ..SourceConfig::default()
        })
        .unwrap();
        assert!(source
            .execute_batch("INSERT INTO mimiciii.diagnoses_icd VALUES (1, '99591');")
            .is_err());
    }

    #[test]
    fn unreachable_server_is_source_unavailable() {
        let config = SourceConfig {
            kind: SourceKind::Postgres,
            host: "127.0.0.1".into(),
            port: 1,
            schema: Some("mimiciii".into()),
            ..SourceConfig::default()
        };
        let err = super::open(&config).err().unwrap();
        assert!(matches!(
            err.downcast_ref::<CohortError>(),
            Some(CohortError::SourceUnavailable(_))
        ));
    }

    #[test]
    fn server_schema_must_be_identifier() {
        let config = SourceConfig {
            kind: SourceKind::Postgres,
            host: "127.0.0.1".into(),
            port: 1,
            schema: Some("mimiciii; DROP SCHEMA public".into()),
            ..SourceConfig::default()
        };
        let err = PostgresSource::connect(&config).err().unwrap();
        assert!(err.downcast_ref::<CohortError>().is_none());
    }

    #[test]
    fn schema_names_are_identifiers() {
        assert!(check_identifier("mimiciii").is_ok());
        assert!(check_identifier("_main2").is_ok());
        assert!(check_identifier("").is_err());
        assert!(check_identifier("main; DROP TABLE x").is_err());
        assert!(check_identifier("2nd").is_err());
    }
}
