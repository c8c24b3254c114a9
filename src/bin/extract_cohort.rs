use clap::Parser;
use qu::ick_use::*;
use sepsis_cohort::{header, pipeline, source, CacheMode, Config, DirCache};
use std::path::PathBuf;

#[derive(Parser)]
struct Opt {
    /// Config file (toml). Built-in defaults are used if not given.
    #[clap(short, long)]
    config: Option<PathBuf>,
    /// Read measurements from the cache written by a previous run instead of the database.
    #[clap(long)]
    cached: bool,
    /// Where to write the cohort table.
    #[clap(short, long)]
    output: Option<PathBuf>,
    #[clap(long)]
    cohort_size: Option<usize>,
    #[clap(long)]
    seed: Option<u64>,
    /// Path to the SQLite database, when the source is SQLite.
    #[clap(long)]
    database: Option<PathBuf>,
}

#[qu::ick]
pub fn main(opt: Opt) -> Result {
    let mut config = match &opt.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if opt.cached {
        config.cache.mode = CacheMode::Cached;
    }
    if let Some(output) = opt.output {
        config.output = output;
    }
    if let Some(cohort_size) = opt.cohort_size {
        config.cohort_size = cohort_size;
    }
    if let Some(seed) = opt.seed {
        config.seed = seed;
    }
    if let Some(database) = opt.database {
        config.source.path = database;
    }
    config.validate()?;

    let source = source::open(&config.source)?;
    let mut cache = DirCache::new(&config.cache.dir);
    let cohort = pipeline::extract_cohort(&*source, &mut cache, &config)?;
    source.disconnect()?;
    cohort.write_csv(&config.output)?;

    header("Cohort");
    println!("subjects: {}", cohort.len());
    for (col, variable) in cohort.variables().iter().enumerate() {
        let present = cohort
            .iter()
            .filter(|row| row.values[col].is_some())
            .count();
        println!("{}: {} values", variable, present);
    }
    println!("written to \"{}\"", config.output.display());
    Ok(())
}
