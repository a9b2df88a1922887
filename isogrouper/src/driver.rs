use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::thread;
use std::time::Instant;

use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use isogroup::{
    ClusteringError, ClusteringParams, Database, Dataset, KeepPolicy, TargetedError,
    TargetedExperiment, TargetedParams, TracerError, TracerSpec, TracingObserver,
    UntargetedExperiment,
};

use crate::args::{non_negative_float_f64, ArgKeepPolicy};
use crate::io::{
    read_database_path, read_dataset_path, write_database, write_features,
    write_targeted_clusters, write_targeted_summary, write_unclustered, write_untargeted_clusters,
    write_untargeted_summary, UntargetedReport,
};
use crate::rt_range::RtRange;

#[derive(Debug, Error)]
pub enum IsoGrouperError {
    #[error("An IO error occurred: {0}")]
    IOError(
        #[source]
        #[from]
        io::Error,
    ),
    #[error("Failed to read or write a table: {0}")]
    CsvError(
        #[source]
        #[from]
        csv::Error,
    ),
    #[error("Failed to load the configuration: {0}")]
    ConfigError(
        #[source]
        #[from]
        figment::Error,
    ),
    #[error("Malformed input: {0}")]
    MalformedInput(String),
    #[error(transparent)]
    Tracer(#[from] TracerError),
    #[error(transparent)]
    Clustering(#[from] ClusteringError),
    #[error(transparent)]
    Targeted(#[from] TargetedError),
}

/// Group the features of isotope-tracing experiments into isotopologue clusters.
///
/// Read a tab separated feature table with `id`, `mz` and `rt` columns followed by one
/// intensity column per sample. Without a database the features are clustered by
/// searching for tracer mass shift ladders; with a database they are annotated against
/// the known metabolites it lists.
#[derive(Parser, Debug, Deserialize, Serialize)]
#[command(author, version)]
pub struct IsoGrouper {
    /// The path to read the feature table from
    #[arg()]
    pub input_file: PathBuf,

    /// The prefix of the output files, or if '-' is passed, write the cluster table to STDOUT
    #[arg(short = 'o', long = "output", default_value = "-")]
    pub output_prefix: PathBuf,

    /// A ';' or tab separated metabolite database with `metabolite`, `rt`, `formula` and
    /// `charge` columns. When given, features are annotated against it instead of being
    /// clustered without prior knowledge.
    #[arg(short = 'D', long = "database")]
    pub database: Option<PathBuf>,

    /// The isotopic tracer, e.g. 13C
    #[arg(short = 't', long = "tracer", default_value = "13C")]
    pub tracer: String,

    /// The m/z tolerance in ppm
    #[arg(
        short = 'p',
        long = "ppm-tolerance",
        visible_alias = "mztol",
        default_value_t = 5.0,
        value_parser = non_negative_float_f64
    )]
    pub ppm_tolerance: f64,

    /// The retention time tolerance. Used as the half-width of the clustering window
    /// without a database, and as the matching tolerance with one.
    #[arg(
        short = 'w',
        long = "rt-tolerance",
        visible_alias = "rttol",
        default_value_t = 15.0,
        value_parser = non_negative_float_f64
    )]
    pub rt_tolerance: f64,

    /// The largest number of tracer atoms to consider when clustering. If not given, it
    /// is estimated from each feature's m/z.
    #[arg(short = 'm', long = "max-atoms")]
    pub max_atoms: Option<u32>,

    /// How to resolve overlapping clusters when clustering without a database
    #[arg(short = 'k', long = "keep", default_value_t = ArgKeepPolicy::Longest)]
    pub keep: ArgKeepPolicy,

    /// The path to write a log file to, in addition to STDERR
    #[arg(short = 'l', long = "log-file")]
    pub log_file: Option<PathBuf>,

    /// A TOML configuration file to read additional parameters from.
    ///
    /// Configurations are also read from `isogrouper.toml` in the working directory.
    /// Environment variables prefixed with `ISOGROUPER_` will be read too.
    #[arg(long = "config-file")]
    pub config_file: Option<PathBuf>,

    /// The number of threads to use, passing a value < 1 to use all available threads
    #[arg(
        short='n',
        long="threads",
        default_value_t=-1,
    )]
    pub threads: i32,

    /// The retention time range to keep features from, denoted (start?)-(stop?)
    #[arg(
        short='r',
        long="rt-range",
        value_parser=RtRange::from_str,
        value_name="BEGIN-END",
        long_help=r#"The retention time range to keep features from, denoted (start?)-(stop?)

If a start is not specified, features are kept from the start of the run.
If a stop is not specified, features are kept until the end of the run.
"#
    )]
    pub rt_range: Option<RtRange>,
}

impl IsoGrouper {
    fn create_threadpool(&self) -> Result<rayon::ThreadPool, IsoGrouperError> {
        let num_threads = if self.threads > 0 {
            self.threads as usize
        } else {
            thread::available_parallelism()?.into()
        };
        debug!("Using {} cores", num_threads);
        rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .build()
            .map_err(|e| IsoGrouperError::IOError(io::Error::other(e)))
    }

    pub fn is_stdout(&self) -> bool {
        self.output_prefix.as_os_str() == "-"
    }

    fn output_path(&self, suffix: &str) -> PathBuf {
        let mut path: OsString = self.output_prefix.as_os_str().to_owned();
        path.push(suffix);
        PathBuf::from(path)
    }

    fn create_output(&self, suffix: &str) -> Result<fs::File, IsoGrouperError> {
        let path = self.output_path(suffix);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        debug!("Writing {}", path.display());
        Ok(fs::File::create(path)?)
    }

    pub fn clustering_params(&self) -> ClusteringParams {
        ClusteringParams::new(self.rt_tolerance, self.ppm_tolerance, self.max_atoms)
    }

    pub fn targeted_params(&self) -> TargetedParams {
        TargetedParams::new(self.ppm_tolerance, self.rt_tolerance)
    }

    pub fn main(&self) -> Result<(), IsoGrouperError> {
        info!(
            "isogrouper v{}",
            option_env!("CARGO_PKG_VERSION").unwrap_or("?")
        );
        info!("Input: {}", self.input_file.display());
        info!("Output: {}", self.output_prefix.display());
        let pool = self.create_threadpool()?;
        pool.install(|| self.run_workflow())
    }

    fn load_dataset(&self) -> Result<Dataset, IsoGrouperError> {
        let mut dataset = read_dataset_path(&self.input_file)?;
        info!(
            "Read {} features across {} samples",
            dataset.len(),
            dataset.samples().len()
        );
        if let Some(rt_range) = self.rt_range {
            dataset.retain(|row| rt_range.contains(row.rt));
            info!("{} features within retention time range {rt_range}", dataset.len());
        }
        Ok(dataset)
    }

    fn run_workflow(&self) -> Result<(), IsoGrouperError> {
        let start = Instant::now();
        let tracer: TracerSpec = self.tracer.parse()?;
        let dataset = self.load_dataset()?;

        match self.database.as_deref() {
            Some(database) => self.run_targeted(&dataset, tracer, database)?,
            None => self.run_untargeted(&dataset, tracer)?,
        }

        info!("Total Elapsed Time: {:0.3?}", start.elapsed());
        Ok(())
    }

    fn run_untargeted(&self, dataset: &Dataset, tracer: TracerSpec) -> Result<(), IsoGrouperError> {
        let keep: KeepPolicy = self.keep.into();
        let params = self.clustering_params();
        let mut experiment = UntargetedExperiment::new(dataset, tracer.clone(), params)?
            .with_observer(TracingObserver);
        let summary = *experiment.build_final_clusters(keep)?;

        if self.is_stdout() {
            write_untargeted_clusters(io::stdout().lock(), &experiment)?;
            return Ok(());
        }

        write_untargeted_clusters(self.create_output(".clusters.tsv")?, &experiment)?;
        write_features(self.create_output(".features.tsv")?, experiment.samples())?;
        write_unclustered(self.create_output(".unclustered.tsv")?, &experiment)?;
        let report = UntargetedReport {
            tracer: tracer.code().to_string(),
            mass_shift: tracer.mass_shift(),
            params,
            keep,
            summary,
        };
        write_untargeted_summary(self.create_output(".summary.json")?, &report)?;
        Ok(())
    }

    fn run_targeted(
        &self,
        dataset: &Dataset,
        tracer: TracerSpec,
        database_path: &Path,
    ) -> Result<(), IsoGrouperError> {
        let entries = read_database_path(database_path)?;
        let database = Database::new(entries, tracer)?;
        info!(
            "Read {} metabolites from {}, {} theoretical isotopologues",
            database.len(),
            database_path.display(),
            database.features().len()
        );

        let mut experiment = TargetedExperiment::new(dataset, database, self.targeted_params());
        experiment.annotate();
        let n_clusters: usize = experiment.clusterize().values().map(|c| c.len()).sum();
        info!("{n_clusters} metabolite clusters");

        if self.is_stdout() {
            write_targeted_clusters(io::stdout().lock(), &experiment)?;
            return Ok(());
        }
        write_targeted_clusters(self.create_output(".clusters.tsv")?, &experiment)?;
        write_targeted_summary(self.create_output(".summary.tsv")?, &experiment)?;
        write_features(self.create_output(".features.tsv")?, experiment.samples())?;
        write_database(self.create_output(".database.tsv")?, experiment.database())?;
        Ok(())
    }
}
