use clap::Parser;
use qu::ick_use::*;
use sepsis_cohort::{
    header, pipeline,
    report::{self, Report},
    ArcStr, Cohort, Config,
};
use std::path::PathBuf;

#[derive(Parser)]
struct Opt {
    /// The cohort table written by `extract_cohort`.
    cohort: PathBuf,
    /// Config file, for the septic codes.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Only report this variable. Can be given more than once.
    #[clap(long = "variable")]
    variables: Vec<String>,
    /// Also write the report as JSON to this path.
    #[clap(long)]
    json: Option<PathBuf>,
    /// Show the bucket counts for each variable.
    #[clap(long)]
    histograms: bool,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let config = match &opt.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let cohort = Cohort::read_csv(&opt.cohort)?;
    let table = pipeline::analyze(&cohort, &config);

    header("Analysis table");
    println!("cohort rows: {}", cohort.len());
    println!("complete rows: {} ({} dropped)", table.len(), table.dropped());
    println!("septic: {}", table.septic_count());

    let variables: Vec<ArcStr> = if opt.variables.is_empty() {
        table.variables().to_vec()
    } else {
        opt.variables.iter().map(|v| v.as_str().into()).collect()
    };
    let comparisons = report::compare_all(&table, &variables)?;
    for comparison in &comparisons {
        header(&comparison.title);
        println!("{}", comparison.term_table().for_terminal());
        if opt.histograms {
            println!("{}", comparison.histogram.term_table().for_terminal());
        }
    }

    if let Some(path) = &opt.json {
        Report::new(&table, comparisons).write_json(path)?;
        event!(Level::INFO, "report written to \"{}\"", path.display());
    }
    Ok(())
}
