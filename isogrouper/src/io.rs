//! Reading feature tables and metabolite databases, and writing cluster reports
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

use itertools::Itertools;
use serde::Serialize;

use isogroup::{
    ClusterId, ClusteringParams, ClusteringSummary, Database, Dataset, DatasetRow, Feature,
    KeepPolicy, MetaboliteEntry, SampleMap, TargetedExperiment, UntargetedExperiment,
};

use crate::driver::IsoGrouperError;

const ID_COLUMN: &str = "id";
const MZ_COLUMN: &str = "mz";
const RT_COLUMN: &str = "rt";

fn parse_intensity(value: &str) -> Result<Option<f64>, std::num::ParseFloatError> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case("na") || value.eq_ignore_ascii_case("nan")
    {
        Ok(None)
    } else {
        value.parse().map(Some)
    }
}

/// Read a tab separated feature table.
///
/// The `id`, `mz` and `rt` columns may appear anywhere, every other column is a sample.
pub fn read_dataset<R: Read>(reader: R) -> Result<Dataset, IsoGrouperError> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = rdr.headers()?.clone();
    let find_column = |name: &str| {
        headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                IsoGrouperError::MalformedInput(format!(
                    "The feature table has no '{name}' column"
                ))
            })
    };
    let id_idx = find_column(ID_COLUMN)?;
    let mz_idx = find_column(MZ_COLUMN)?;
    let rt_idx = find_column(RT_COLUMN)?;

    let sample_columns: Vec<(usize, String)> = headers
        .iter()
        .enumerate()
        .filter(|(i, _)| ![id_idx, mz_idx, rt_idx].contains(i))
        .map(|(i, h)| (i, h.to_string()))
        .collect();
    if sample_columns.is_empty() {
        return Err(IsoGrouperError::MalformedInput(
            "The feature table has no sample columns".to_string(),
        ));
    }

    let mut dataset = Dataset::new(sample_columns.iter().map(|(_, s)| s.clone()).collect());
    for (line, record) in rdr.records().enumerate() {
        let record = record?;
        let line = line + 2;
        let field = |i: usize| record.get(i).unwrap_or_default();
        let malformed = |what: &str, value: &str| {
            IsoGrouperError::MalformedInput(format!("Line {line}: invalid {what} '{value}'"))
        };

        let feature_id = field(id_idx).to_string();
        let mz: f64 = field(mz_idx)
            .parse()
            .map_err(|_| malformed(MZ_COLUMN, field(mz_idx)))?;
        let rt: f64 = field(rt_idx)
            .parse()
            .map_err(|_| malformed(RT_COLUMN, field(rt_idx)))?;
        let intensities = sample_columns
            .iter()
            .map(|(i, name)| parse_intensity(field(*i)).map_err(|_| malformed(name.as_str(), field(*i))))
            .collect::<Result<Vec<_>, _>>()?;

        dataset
            .push(DatasetRow::new(feature_id, mz, rt, intensities))
            .map_err(|e| IsoGrouperError::MalformedInput(format!("Line {line}: {e}")))?;
    }
    Ok(dataset)
}

pub fn read_dataset_path<P: AsRef<Path>>(path: P) -> Result<Dataset, IsoGrouperError> {
    let handle = fs::File::open(path.as_ref())?;
    read_dataset(io::BufReader::new(handle))
}

/// Read a metabolite database, separated by `delimiter`
pub fn read_database<R: Read>(
    reader: R,
    delimiter: u8,
) -> Result<Vec<MetaboliteEntry>, IsoGrouperError> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .trim(csv::Trim::All)
        .from_reader(reader);
    let entries = rdr.deserialize().collect::<Result<Vec<MetaboliteEntry>, _>>()?;
    Ok(entries)
}

/// Read a metabolite database, choosing between ';' and tab separation from its header
pub fn read_database_path<P: AsRef<Path>>(path: P) -> Result<Vec<MetaboliteEntry>, IsoGrouperError> {
    let content = fs::read_to_string(path.as_ref())?;
    let header = content.lines().next().unwrap_or_default();
    let delimiter = if header.contains(';') { b';' } else { b'\t' };
    read_database(content.as_bytes(), delimiter)
}

fn join_clusters<I: IntoIterator<Item = ClusterId>>(clusters: I) -> String {
    clusters.into_iter().map(|c| c.to_string()).join(",")
}

fn join_numbers<I: IntoIterator<Item = u32>>(values: I) -> String {
    values.into_iter().map(|v| v.to_string()).join(",")
}

fn tsv_writer<W: Write>(writer: W) -> csv::Writer<W> {
    csv::WriterBuilder::new().delimiter(b'\t').from_writer(writer)
}

#[derive(Debug, Serialize)]
struct UntargetedClusterRow<'a> {
    #[serde(rename = "ClusterID")]
    cluster_id: String,
    #[serde(rename = "FeatureID")]
    feature_id: &'a str,
    #[serde(rename = "RT")]
    rt: f64,
    #[serde(rename = "mz")]
    mz: f64,
    #[serde(rename = "sample")]
    sample: &'a str,
    #[serde(rename = "Intensity")]
    intensity: Option<f64>,
    #[serde(rename = "Isotopologue")]
    isotopologue: String,
    #[serde(rename = "InClusters")]
    in_clusters: String,
    #[serde(rename = "AlsoIn")]
    also_in: String,
}

/// Write one row per cluster member
pub fn write_untargeted_clusters<W: Write, O: isogroup::ClusteringObserver>(
    writer: W,
    experiment: &UntargetedExperiment<O>,
) -> Result<(), IsoGrouperError> {
    let mut wtr = tsv_writer(writer);
    for (features, cluster) in experiment.iter_clusters() {
        let id = cluster.id();
        for key in cluster.members() {
            let feature = &features[*key];
            wtr.serialize(UntargetedClusterRow {
                cluster_id: id.to_string(),
                feature_id: feature.feature_id(),
                rt: feature.rt(),
                mz: feature.mz(),
                sample: feature.sample(),
                intensity: feature.intensity(),
                isotopologue: feature
                    .isotopologue_label(id)
                    .map(|l| l.to_string())
                    .unwrap_or_default(),
                in_clusters: join_clusters(feature.cluster_membership().iter().copied()),
                also_in: join_clusters(feature.also_in(id)),
            })?;
        }
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct FeatureRow<'a> {
    #[serde(rename = "FeatureID")]
    feature_id: &'a str,
    #[serde(rename = "mz")]
    mz: f64,
    #[serde(rename = "RT")]
    rt: f64,
    #[serde(rename = "sample")]
    sample: &'a str,
    #[serde(rename = "Intensity")]
    intensity: Option<f64>,
    #[serde(rename = "InClusters")]
    in_clusters: String,
    #[serde(rename = "Isotopologues")]
    isotopologues: String,
    #[serde(rename = "Metabolites")]
    metabolites: String,
}

impl<'a> From<&'a Feature> for FeatureRow<'a> {
    fn from(feature: &'a Feature) -> Self {
        Self {
            feature_id: feature.feature_id(),
            mz: feature.mz(),
            rt: feature.rt(),
            sample: feature.sample(),
            intensity: feature.intensity(),
            in_clusters: join_clusters(feature.cluster_membership().iter().copied()),
            isotopologues: feature
                .isotopologue_labels()
                .iter()
                .map(|(c, l)| format!("{c}:{l}"))
                .join(","),
            metabolites: feature
                .annotations()
                .iter()
                .map(|a| format!("{}:M+{}", a.metabolite, a.isotopologue))
                .join(","),
        }
    }
}

/// Write every feature of every sample with its cluster memberships
pub fn write_features<W: Write>(writer: W, samples: &SampleMap) -> Result<(), IsoGrouperError> {
    let mut wtr = tsv_writer(writer);
    for features in samples.values() {
        for (_, feature) in features.iter() {
            wtr.serialize(FeatureRow::from(feature))?;
        }
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct UnclusteredRow<'a> {
    #[serde(rename = "FeatureID")]
    feature_id: &'a str,
    #[serde(rename = "mz")]
    mz: f64,
    #[serde(rename = "RT")]
    rt: f64,
    #[serde(rename = "sample")]
    sample: &'a str,
    #[serde(rename = "Intensity")]
    intensity: Option<f64>,
}

pub fn write_unclustered<W: Write, O: isogroup::ClusteringObserver>(
    writer: W,
    experiment: &UntargetedExperiment<O>,
) -> Result<(), IsoGrouperError> {
    let mut wtr = tsv_writer(writer);
    for (features, key) in experiment.iter_unclustered() {
        let feature = &features[key];
        wtr.serialize(UnclusteredRow {
            feature_id: feature.feature_id(),
            mz: feature.mz(),
            rt: feature.rt(),
            sample: feature.sample(),
            intensity: feature.intensity(),
        })?;
    }
    wtr.flush()?;
    Ok(())
}

/// The parameters and outcome of an untargeted run
#[derive(Debug, Clone, Serialize)]
pub struct UntargetedReport {
    pub tracer: String,
    pub mass_shift: f64,
    pub params: ClusteringParams,
    pub keep: KeepPolicy,
    pub summary: ClusteringSummary,
}

pub fn write_untargeted_summary<W: Write>(
    mut writer: W,
    report: &UntargetedReport,
) -> Result<(), IsoGrouperError> {
    serde_json::to_writer_pretty(&mut writer, report).map_err(io::Error::from)?;
    writeln!(writer)?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct TargetedClusterRow<'a> {
    #[serde(rename = "ClusterID")]
    cluster_id: String,
    #[serde(rename = "Metabolite")]
    metabolite: &'a str,
    #[serde(rename = "FeatureID")]
    feature_id: &'a str,
    #[serde(rename = "mz")]
    mz: f64,
    #[serde(rename = "RT")]
    rt: f64,
    #[serde(rename = "PotentialMetabolites")]
    potential_metabolites: String,
    #[serde(rename = "Isotopologue")]
    isotopologue: Option<u32>,
    #[serde(rename = "MzErrorPpm")]
    mz_error_ppm: Option<f64>,
    #[serde(rename = "RtError")]
    rt_error: Option<f64>,
    #[serde(rename = "sample")]
    sample: &'a str,
    #[serde(rename = "Intensity")]
    intensity: Option<f64>,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "MissingIsotopologues")]
    missing_isotopologues: String,
    #[serde(rename = "DuplicatedIsotopologues")]
    duplicated_isotopologues: String,
    #[serde(rename = "AlsoIn")]
    also_in: String,
}

/// Write one row per metabolite cluster member, with the cluster's completeness
pub fn write_targeted_clusters<W: Write>(
    writer: W,
    experiment: &TargetedExperiment,
) -> Result<(), IsoGrouperError> {
    let mut wtr = tsv_writer(writer);
    for (features, cluster) in experiment.iter_clusters() {
        let view = cluster.view(features);
        let status = view.status().to_string();
        let missing = join_numbers(view.missing_isotopologues());
        let duplicated = join_numbers(view.duplicated_isotopologues());
        let name = cluster.name().unwrap_or_default();

        for feature in view.features() {
            let annotation = feature.annotations().iter().find(|a| a.metabolite == name);
            wtr.serialize(TargetedClusterRow {
                cluster_id: cluster.id().to_string(),
                metabolite: name,
                feature_id: feature.feature_id(),
                mz: feature.mz(),
                rt: feature.rt(),
                potential_metabolites: feature
                    .annotations()
                    .iter()
                    .map(|a| a.metabolite.as_str())
                    .join(","),
                isotopologue: annotation.map(|a| a.isotopologue),
                mz_error_ppm: annotation.map(|a| a.mz_error_ppm),
                rt_error: annotation.map(|a| a.rt_error),
                sample: feature.sample(),
                intensity: feature.intensity(),
                status: status.clone(),
                missing_isotopologues: missing.clone(),
                duplicated_isotopologues: duplicated.clone(),
                also_in: join_clusters(feature.also_in(cluster.id())),
            })?;
        }
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct TargetedSummaryRow<'a> {
    #[serde(rename = "ClusterID")]
    cluster_id: String,
    #[serde(rename = "Name")]
    name: &'a str,
    #[serde(rename = "sample")]
    sample: &'a str,
    #[serde(rename = "NumberOfFeatures")]
    number_of_features: usize,
    #[serde(rename = "Isotopologues")]
    isotopologues: String,
    #[serde(rename = "Status")]
    status: String,
    #[serde(rename = "MissingIsotopologues")]
    missing_isotopologues: String,
    #[serde(rename = "DuplicatedIsotopologues")]
    duplicated_isotopologues: String,
}

/// Write one row per metabolite cluster per sample
pub fn write_targeted_summary<W: Write>(
    writer: W,
    experiment: &TargetedExperiment,
) -> Result<(), IsoGrouperError> {
    let mut wtr = tsv_writer(writer);
    for (features, cluster) in experiment.iter_clusters() {
        let view = cluster.view(features);
        wtr.serialize(TargetedSummaryRow {
            cluster_id: cluster.id().to_string(),
            name: cluster.name().unwrap_or_default(),
            sample: cluster.sample(),
            number_of_features: view.len(),
            isotopologues: join_numbers(view.isotopologues()),
            status: view.status().to_string(),
            missing_isotopologues: join_numbers(view.missing_isotopologues()),
            duplicated_isotopologues: join_numbers(view.duplicated_isotopologues()),
        })?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct DatabaseRow<'a> {
    mz: f64,
    rt: f64,
    metabolite: &'a str,
    isotopologue: u32,
    formula: &'a str,
}

/// Write the theoretical isotopologues of every database metabolite
pub fn write_database<W: Write>(writer: W, database: &Database) -> Result<(), IsoGrouperError> {
    let mut wtr = tsv_writer(writer);
    for feature in database.features() {
        wtr.serialize(DatabaseRow {
            mz: feature.mz,
            rt: feature.rt,
            metabolite: &feature.metabolite,
            isotopologue: feature.isotopologue,
            formula: &feature.formula,
        })?;
    }
    wtr.flush()?;
    Ok(())
}
