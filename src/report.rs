//! Descriptive statistics for each variable, overall and split by the septic label.
use crate::{
    analysis::AnalysisTable,
    util::{self, fmt_opt},
    ArcStr, HtmlTable, Range, RangeSet, Result,
};
use noisy_float::prelude::*;
use qu::ick_use::*;
use rayon::prelude::*;
use serde::Serialize;
use statrs::{
    distribution::{Continuous, Normal},
    statistics::{Data, OrderStatistics, Statistics},
};
use std::{fs, io, path::Path};
use term_data_table as tdt;

/// Number of equal-width histogram buckets.
pub const HISTOGRAM_BUCKETS: usize = 10;

/// Number of points the density curves are evaluated at.
pub const DENSITY_POINTS: usize = 64;

/// Display title for the standard variables.
pub fn title_for(variable: &str) -> String {
    match variable {
        "temperature" => "Temperature (°C)".into(),
        "heart_rate" => "Heart rate (bpm)".into(),
        "resp_rate" => "Respiratory rate (breaths/min)".into(),
        "paco2" => "PaCO2 (mmHg)".into(),
        "wbc" => "White blood cell count (K/uL)".into(),
        other => other.into(),
    }
}

/// Summary statistics for a sample.
///
/// Statistics that need more data than there is (e.g. the standard deviation of one value) are
/// `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation.
    pub sd: Option<f64>,
    /// Adjusted Fisher-Pearson skewness.
    pub skew: Option<f64>,
    /// Bias-corrected excess kurtosis.
    pub kurtosis: Option<f64>,
    pub median: f64,
    pub q1: f64,
    pub q3: f64,
    pub iqr: f64,
    pub min: f64,
    pub max: f64,
    pub range: f64,
    /// Standard error of the mean.
    pub se: Option<f64>,
}

impl Summary {
    /// `None` if `values` is empty.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let count = values.len();
        let n = count as f64;
        let mean = values.iter().mean();
        let min: f64 = Statistics::min(values);
        let max: f64 = Statistics::max(values);
        let sd = if count > 1 {
            Some(values.iter().std_dev())
        } else {
            None
        };
        // Data::quantile uses the approximately median-unbiased (R type 8) definition
        let mut data = Data::new(values.to_vec());
        let median = data.median();
        let q1 = data.lower_quartile();
        let q3 = data.upper_quartile();

        Some(Summary {
            count,
            mean,
            sd,
            skew: skewness(values, mean),
            kurtosis: excess_kurtosis(values, mean),
            median,
            q1,
            q3,
            iqr: q3 - q1,
            min,
            max,
            range: max - min,
            se: sd.map(|sd| sd / n.sqrt()),
        })
    }
}

/// Sums of the 2nd, 3rd and 4th powers of deviations from the mean.
fn central_sums(values: &[f64], mean: f64) -> (f64, f64, f64) {
    values.iter().fold((0., 0., 0.), |(s2, s3, s4), v| {
        let d = v - mean;
        let d2 = d * d;
        (s2 + d2, s3 + d2 * d, s4 + d2 * d2)
    })
}

fn skewness(values: &[f64], mean: f64) -> Option<f64> {
    let n = values.len() as f64;
    if values.len() < 3 {
        return None;
    }
    let (s2, s3, _) = central_sums(values, mean);
    if s2 == 0. {
        return Some(0.);
    }
    let (m2, m3) = (s2 / n, s3 / n);
    Some((n * (n - 1.)).sqrt() / (n - 2.) * m3 / m2.powf(1.5))
}

fn excess_kurtosis(values: &[f64], mean: f64) -> Option<f64> {
    let n = values.len() as f64;
    if values.len() < 4 {
        return None;
    }
    let (s2, _, s4) = central_sums(values, mean);
    if s2 == 0. {
        return Some(0.);
    }
    let correction = 3. * (n - 1.).powi(2) / ((n - 2.) * (n - 3.));
    Some(n * (n + 1.) * (n - 1.) * s4 / ((n - 2.) * (n - 3.) * s2 * s2) - correction)
}

/// Scott's rule: `sd * n^(-1/5)`.
pub fn scott_bandwidth(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let sd = values.iter().std_dev();
    let bw = sd * (values.len() as f64).powf(-0.2);
    if bw.is_finite() && bw > 0. {
        Some(bw)
    } else {
        None
    }
}

/// Gaussian kernel density estimate of `values`, evaluated at each point of `grid`.
///
/// `None` if the bandwidth is undefined (fewer than two values, or no spread).
pub fn gaussian_kde(values: &[f64], grid: &[f64]) -> Option<Vec<f64>> {
    let bw = scott_bandwidth(values)?;
    let kernel = Normal::new(0., 1.).ok()?;
    let norm = values.len() as f64 * bw;
    Some(
        grid.iter()
            .map(|x| values.iter().map(|v| kernel.pdf((x - v) / bw)).sum::<f64>() / norm)
            .collect(),
    )
}

/// Bucket counts for one variable, overall and per group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Histogram {
    pub buckets: Vec<Bucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bucket {
    pub low: f64,
    /// `None` for the last bucket, which is open-ended.
    pub high: Option<f64>,
    pub count: usize,
    pub septic: usize,
    pub non_septic: usize,
}

impl Histogram {
    /// Equal-width buckets spanning `all`, each bucket including its lower edge.
    pub fn new(all: &[f64], septic: &[f64], non_septic: &[f64], buckets: usize) -> Self {
        let set = match bucket_ranges(all, buckets) {
            Some(set) => set,
            None => return Histogram { buckets: vec![] },
        };
        let count = |values: &[f64]| {
            set.clone()
                .bucket_values(values.iter().filter_map(|v| N64::try_new(*v)))
                .iter()
                .map(|(_, count)| count)
                .collect::<Vec<_>>()
        };
        let (all, septic, non_septic) = (count(all), count(septic), count(non_septic));
        let buckets = set
            .iter()
            .zip(all)
            .zip(septic)
            .zip(non_septic)
            .map(|(((range, count), septic), non_septic)| Bucket {
                low: range.start().raw(),
                high: range.end().map(|end| end.raw()),
                count,
                septic,
                non_septic,
            })
            .collect();
        Histogram { buckets }
    }

    pub fn term_table(&self) -> tdt::Table<'_> {
        use tdt::{Cell, Row, Table};
        let mut table = Table::new().with_row(
            Row::new()
                .with_cell(Cell::from("Bucket"))
                .with_cell(Cell::from("All"))
                .with_cell(Cell::from("Septic"))
                .with_cell(Cell::from("Non-septic")),
        );
        for bucket in &self.buckets {
            let label = Range::new(n64(bucket.low), bucket.high.map(n64)).to_string();
            table = table.with_row(
                Row::new()
                    .with_cell(Cell::from(label))
                    .with_cell(Cell::from(bucket.count.to_string()))
                    .with_cell(Cell::from(bucket.septic.to_string()))
                    .with_cell(Cell::from(bucket.non_septic.to_string())),
            );
        }
        table
    }
}

fn bucket_ranges(values: &[f64], buckets: usize) -> Option<RangeSet<N64>> {
    let values = values
        .iter()
        .filter_map(|v| N64::try_new(*v))
        .collect::<Vec<_>>();
    let min = *values.iter().min()?;
    let max = *values.iter().max()?;
    let single = Some(RangeSet::new(vec![Range::new(min, None)]));
    // the span of two finite values can still overflow to infinity
    let width = (max.raw() - min.raw()) / buckets.max(1) as f64;
    if !width.is_finite() || width <= 0. {
        return single;
    }
    let edges = (0..buckets.max(1))
        .map(|i| N64::try_new(min.raw() + width * i as f64))
        .collect::<Option<Vec<_>>>()?;
    if edges.iter().any(|e| !e.raw().is_finite()) || edges.windows(2).any(|w| w[0] >= w[1]) {
        return single;
    }
    let mut set = RangeSet::new(vec![]);
    for (idx, edge) in edges.iter().enumerate() {
        set.push(Range::new(*edge, edges.get(idx + 1).copied()));
    }
    Some(set)
}

/// Density curves for both groups on a shared grid.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Density {
    pub grid: Vec<f64>,
    pub septic: Option<Vec<f64>>,
    pub non_septic: Option<Vec<f64>>,
}

impl Density {
    /// The grid runs from 3 bandwidths below the smallest value to 3 above the largest.
    pub fn new(all: &[f64], septic: &[f64], non_septic: &[f64]) -> Option<Self> {
        let min: f64 = Statistics::min(all);
        let max: f64 = Statistics::max(all);
        if !(min.is_finite() && max.is_finite()) {
            return None;
        }
        let pad = [all, septic, non_septic]
            .into_iter()
            .filter_map(scott_bandwidth)
            .fold(None, |acc: Option<f64>, bw| Some(acc.map_or(bw, |acc| acc.max(bw))))
            .unwrap_or(1.)
            * 3.;
        let (low, high) = (min - pad, max + pad);
        let step = (high - low) / (DENSITY_POINTS - 1) as f64;
        let grid = (0..DENSITY_POINTS)
            .map(|i| low + step * i as f64)
            .collect::<Vec<_>>();
        Some(Density {
            septic: gaussian_kde(septic, &grid),
            non_septic: gaussian_kde(non_septic, &grid),
            grid,
        })
    }
}

/// Everything reported for one variable.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Comparison {
    pub variable: ArcStr,
    pub title: String,
    pub overall: Option<Summary>,
    pub septic: Option<Summary>,
    pub non_septic: Option<Summary>,
    pub histogram: Histogram,
    pub density: Option<Density>,
}

/// Summarize one variable of the analysis table.
pub fn compare(table: &AnalysisTable, variable: &str, title: impl Into<String>) -> Result<Comparison> {
    let (all, septic, non_septic) = match (
        table.values(variable),
        table.values_by_label(variable, true),
        table.values_by_label(variable, false),
    ) {
        (Some(all), Some(septic), Some(non_septic)) => (all, septic, non_septic),
        _ => bail!("unknown variable \"{}\"", variable),
    };
    event!(
        Level::DEBUG,
        "{}: {} values ({} septic)",
        variable,
        all.len(),
        septic.len()
    );
    Ok(Comparison {
        variable: variable.into(),
        title: title.into(),
        overall: Summary::from_values(&all),
        septic: Summary::from_values(&septic),
        non_septic: Summary::from_values(&non_septic),
        histogram: Histogram::new(&all, &septic, &non_septic, HISTOGRAM_BUCKETS),
        density: Density::new(&all, &septic, &non_septic),
    })
}

/// Compare each of `variables`, in parallel. Results are in the same order as `variables`.
pub fn compare_all(table: &AnalysisTable, variables: &[ArcStr]) -> Result<Vec<Comparison>> {
    variables
        .par_iter()
        .map(|variable| compare(table, variable, title_for(variable)))
        .collect()
}

impl Comparison {
    fn stat_rows(&self) -> Vec<(&'static str, [String; 3])> {
        let groups = [&self.overall, &self.septic, &self.non_septic];
        let stat = |f: &dyn Fn(&Summary) -> Option<f64>| {
            groups.map(|summary| fmt_opt(summary.as_ref().and_then(f)))
        };
        vec![
            (
                "count",
                groups.map(|s| s.as_ref().map_or(0, |s| s.count).to_string()),
            ),
            ("mean", stat(&|s| Some(s.mean))),
            ("sd", stat(&|s| s.sd)),
            ("se", stat(&|s| s.se)),
            ("min", stat(&|s| Some(s.min))),
            ("q1", stat(&|s| Some(s.q1))),
            ("median", stat(&|s| Some(s.median))),
            ("q3", stat(&|s| Some(s.q3))),
            ("max", stat(&|s| Some(s.max))),
            ("iqr", stat(&|s| Some(s.iqr))),
            ("range", stat(&|s| Some(s.range))),
            ("skew", stat(&|s| s.skew)),
            ("kurtosis", stat(&|s| s.kurtosis)),
        ]
    }

    pub fn term_table(&self) -> tdt::Table<'_> {
        use tdt::{Cell, Row, Table};
        let mut table = Table::new().with_row(
            Row::new()
                .with_cell(Cell::from(self.title.clone()))
                .with_cell(Cell::from("All"))
                .with_cell(Cell::from("Septic"))
                .with_cell(Cell::from("Non-septic")),
        );
        for (name, [all, septic, non_septic]) in self.stat_rows() {
            table = table.with_row(
                Row::new()
                    .with_cell(Cell::from(name))
                    .with_cell(Cell::from(all))
                    .with_cell(Cell::from(septic))
                    .with_cell(Cell::from(non_septic)),
            );
        }
        table
    }

    pub fn evcxr_display(&self) {
        let mut table = HtmlTable::new(["", "All", "Septic", "Non-septic"])
            .with_title(self.title.clone())
            .with_max_rows(0);
        for (name, cells) in self.stat_rows() {
            table.push_row([name.to_string()].into_iter().chain(cells));
        }
        table.evcxr_display();
    }
}

/// The full analysis output, as written to the JSON report.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub rows: usize,
    pub septic: usize,
    pub dropped: usize,
    pub comparisons: Vec<Comparison>,
}

impl Report {
    pub fn new(table: &AnalysisTable, comparisons: Vec<Comparison>) -> Self {
        Report {
            rows: table.len(),
            septic: table.septic_count(),
            dropped: table.dropped(),
            comparisons,
        }
    }

    pub fn write_json(&self, path: impl AsRef<Path>) -> Result {
        fn inner(this: &Report, path: &Path) -> Result {
            if util::path_exists(path)? {
                event!(
                    Level::WARN,
                    "overwriting existing file at \"{}\"",
                    path.display()
                );
            }
            let mut writer = io::BufWriter::new(fs::File::create(path)?);
            serde_json::to_writer_pretty(&mut writer, this)?;
            io::Write::flush(&mut writer)?;
            Ok(())
        }
        let path = path.as_ref();
        inner(self, path).with_context(|| format!("writing report to \"{}\"", path.display()))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        cohort::Cohort,
        diagnosis::SepticMatcher,
        extract::test::{at, obs},
    };
    use std::collections::BTreeMap;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn summary_matches_hand_computed() {
        let s = Summary::from_values(&[4., 1., 10., 3., 2.]).unwrap();
        assert_eq!(s.count, 5);
        assert!(close(s.mean, 4.));
        assert!(close(s.sd.unwrap(), 12.5f64.sqrt()));
        assert!(close(s.se.unwrap(), 2.5f64.sqrt()));
        assert!(close(s.median, 3.));
        assert!(close(s.q1, 5. / 3.));
        assert!(close(s.q3, 6.));
        assert!(close(s.iqr, 6. - 5. / 3.));
        assert_eq!((s.min, s.max, s.range), (1., 10., 9.));
        assert!(close(s.skew.unwrap(), 1.6970562748477143));
        assert!(close(s.kurtosis.unwrap(), 3.152));
    }

    #[test]
    fn summary_of_small_samples() {
        assert_eq!(Summary::from_values(&[]), None);
        let one = Summary::from_values(&[37.]).unwrap();
        assert_eq!(one.count, 1);
        assert_eq!((one.median, one.min, one.max), (37., 37., 37.));
        assert_eq!((one.sd, one.se, one.skew, one.kurtosis), (None, None, None, None));
        let flat = Summary::from_values(&[2., 2., 2., 2.]).unwrap();
        assert_eq!(flat.sd, Some(0.));
        assert_eq!((flat.skew, flat.kurtosis), (Some(0.), Some(0.)));
    }

    #[test]
    fn histogram_buckets() {
        let all = [0., 1., 2., 5., 9.9, 10.];
        let hist = Histogram::new(&all, &[0., 10.], &[1., 2., 5., 9.9], 5);
        assert_eq!(hist.buckets.len(), 5);
        assert_eq!(hist.buckets[0].low, 0.);
        assert_eq!(hist.buckets[0].high, Some(2.));
        assert_eq!(hist.buckets[4].high, None);
        let counts = hist.buckets.iter().map(|b| b.count).collect::<Vec<_>>();
        // the maximum lands in the open last bucket
        assert_eq!(counts, vec![2, 1, 1, 0, 2]);
        assert_eq!(hist.buckets.iter().map(|b| b.septic).sum::<usize>(), 2);
        assert_eq!(hist.buckets[4].non_septic, 1);

        let flat = Histogram::new(&[3., 3.], &[3.], &[3.], 5);
        assert_eq!(flat.buckets.len(), 1);
        assert_eq!(flat.buckets[0].count, 2);
        assert!(Histogram::new(&[], &[], &[], 5).buckets.is_empty());
    }

    #[test]
    fn histogram_of_extreme_values() {
        let hist = Histogram::new(&[-1e308, 1e308], &[-1e308], &[1e308], 5);
        assert_eq!(hist.buckets.len(), 1);
        assert_eq!(hist.buckets[0].low, -1e308);
        assert_eq!(hist.buckets[0].high, None);
        assert_eq!(hist.buckets[0].count, 2);
        assert_eq!((hist.buckets[0].septic, hist.buckets[0].non_septic), (1, 1));

        let infinite = Histogram::new(&[f64::INFINITY, f64::INFINITY], &[], &[], 5);
        assert_eq!(infinite.buckets.len(), 1);
        assert_eq!(infinite.buckets[0].count, 2);
    }

    #[test]
    fn density_integrates_to_one() {
        let septic = [36.5, 37.0, 38.0, 39.0, 38.5];
        let non_septic = [36.0, 36.6, 37.1, 36.8, 37.3];
        let all = septic.iter().chain(&non_septic).copied().collect::<Vec<_>>();
        let density = Density::new(&all, &septic, &non_septic).unwrap();
        assert_eq!(density.grid.len(), DENSITY_POINTS);
        for curve in [density.septic.unwrap(), density.non_septic.unwrap()] {
            assert!(curve.iter().all(|y| *y >= 0.));
            let area = density
                .grid
                .windows(2)
                .zip(curve.windows(2))
                .map(|(x, y)| (x[1] - x[0]) * (y[0] + y[1]) / 2.)
                .sum::<f64>();
            assert!((area - 1.).abs() < 0.01, "{}", area);
        }
        assert_eq!(gaussian_kde(&[1.], &density.grid), None);
    }

    fn table() -> AnalysisTable {
        let mut diagnoses = BTreeMap::new();
        for (id, code) in [(1, "99591"), (2, "4019"), (3, "78552"), (4, "2724")] {
            diagnoses.insert(id, [code].into_iter().collect());
        }
        let mut cohort = Cohort::from_diagnoses(diagnoses);
        let hr = [(1, 120.), (2, 70.), (3, 110.), (4, 80.)]
            .into_iter()
            .map(|(id, v)| obs(id, at(1, 0), Some(v)))
            .collect();
        cohort.merge("heart_rate", &hr);
        AnalysisTable::from_cohort(&cohort, &SepticMatcher::default())
    }

    #[test]
    fn terminal_tables() {
        let cmp = compare(&table(), "heart_rate", "Heart rate").unwrap();
        let stats = cmp.term_table().for_terminal().to_string();
        assert!(stats.contains("Heart rate"));
        assert!(stats.contains("Non-septic"));
        let buckets = cmp.histogram.term_table().for_terminal().to_string();
        assert!(!buckets.is_empty());
    }

    #[test]
    fn compare_groups() {
        let table = table();
        let cmp = compare(&table, "heart_rate", "Heart rate").unwrap();
        assert_eq!(cmp.overall.as_ref().unwrap().count, 4);
        assert!(close(cmp.septic.as_ref().unwrap().mean, 115.));
        assert!(close(cmp.non_septic.as_ref().unwrap().mean, 75.));
        assert!(compare(&table, "lactate", "Lactate").is_err());

        let all = compare_all(&table, &["heart_rate".into()]).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, title_for("heart_rate"));
        assert!(compare_all(&table, &["heart_rate".into(), "wbc".into()]).is_err());
    }

    #[test]
    fn json_report() {
        let table = table();
        let report = Report::new(&table, compare_all(&table, table.variables()).unwrap());
        assert_eq!((report.rows, report.septic, report.dropped), (4, 2, 0));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report.write_json(&path).unwrap();
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(json["comparisons"][0]["variable"], "heart_rate");
        assert_eq!(json["comparisons"][0]["overall"]["count"], 4);
    }
}
