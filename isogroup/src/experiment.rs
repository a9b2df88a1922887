//! Experiment orchestration: turning a feature table into per-sample arenas and driving
//! either the untargeted clustering engine or the targeted annotator over them.
use std::time::Instant;

use indexmap::IndexMap;
use thiserror::Error;
use tracing::{info, warn};

use crate::cluster::Cluster;
use crate::engine::{
    CancellationToken, ClusterMap, ClusteringEngine, ClusteringError, ClusteringObserver,
    ClusteringParams, ClusteringSummary, KeepPolicy, SampleMap,
};
use crate::feature::{check_coordinates, FeatureError, FeatureKey, SampleFeatures};
use crate::targeted::{Database, TargetedAnnotator, TargetedParams};
use crate::tracer::TracerSpec;

/// A row that does not fit the feature table it is added to
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DatasetError {
    #[error("Feature {feature_id} has {found} intensities but the dataset has {expected} samples")]
    IntensityCount {
        feature_id: String,
        found: usize,
        expected: usize,
    },
    #[error(transparent)]
    InvalidFeature(#[from] FeatureError),
}

/// One feature of the input table, with one intensity per sample column
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRow {
    pub feature_id: String,
    pub mz: f64,
    pub rt: f64,
    pub intensities: Vec<Option<f64>>,
}

impl DatasetRow {
    pub fn new(
        feature_id: impl Into<String>,
        mz: f64,
        rt: f64,
        intensities: Vec<Option<f64>>,
    ) -> Self {
        Self {
            feature_id: feature_id.into(),
            mz,
            rt,
            intensities,
        }
    }
}

/// A feature table: every row is observed in every sample, possibly with a missing intensity
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    samples: Vec<String>,
    rows: Vec<DatasetRow>,
}

impl Dataset {
    pub fn new(samples: Vec<String>) -> Self {
        Self {
            samples,
            rows: Vec::new(),
        }
    }

    /// Add a row, which must carry one intensity per sample, a finite positive m/z and
    /// a finite retention time
    pub fn push(&mut self, row: DatasetRow) -> Result<(), DatasetError> {
        if row.intensities.len() != self.samples.len() {
            return Err(DatasetError::IntensityCount {
                feature_id: row.feature_id,
                found: row.intensities.len(),
                expected: self.samples.len(),
            });
        }
        check_coordinates(&row.feature_id, row.mz, row.rt)?;
        self.rows.push(row);
        Ok(())
    }

    pub fn samples(&self) -> &[String] {
        &self.samples
    }

    pub fn rows(&self) -> &[DatasetRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Keep only the rows for which `predicate` holds
    pub fn retain<F: FnMut(&DatasetRow) -> bool>(&mut self, predicate: F) {
        self.rows.retain(predicate);
    }

    /// Create one feature arena per sample column
    pub fn to_samples(&self) -> SampleMap {
        self.samples
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut features = SampleFeatures::new(name.clone());
                for row in self.rows.iter() {
                    let intensity = row.intensities.get(i).copied().flatten();
                    if let Err(e) = features.push(row.feature_id.clone(), row.mz, row.rt, intensity) {
                        warn!("Skipping a feature of {name}: {e}");
                    }
                }
                (name.clone(), features)
            })
            .collect()
    }
}

/// Walk the clusters of every sample together with the features they refer to
fn iter_clusters<'a>(
    samples: &'a SampleMap,
    clusters: &'a ClusterMap,
) -> impl Iterator<Item = (&'a SampleFeatures, &'a Cluster)> + 'a {
    clusters.iter().flat_map(move |(name, sample_clusters)| {
        samples
            .get(name)
            .into_iter()
            .flat_map(move |features| sample_clusters.values().map(move |c| (features, c)))
    })
}

/// Database-free isotopologue clustering of a dataset
#[derive(Debug)]
pub struct UntargetedExperiment<O: ClusteringObserver = ()> {
    engine: ClusteringEngine<O>,
    samples: SampleMap,
    clusters: Option<ClusterMap>,
    unclustered: IndexMap<String, Vec<FeatureKey>>,
    summary: ClusteringSummary,
}

impl UntargetedExperiment<()> {
    pub fn new(
        dataset: &Dataset,
        tracer: TracerSpec,
        params: ClusteringParams,
    ) -> Result<Self, ClusteringError> {
        let engine = ClusteringEngine::new(tracer, params)?;
        Ok(Self {
            engine,
            samples: dataset.to_samples(),
            clusters: None,
            unclustered: IndexMap::new(),
            summary: ClusteringSummary::default(),
        })
    }
}

impl<O: ClusteringObserver> UntargetedExperiment<O> {
    pub fn with_observer<P: ClusteringObserver>(self, observer: P) -> UntargetedExperiment<P> {
        UntargetedExperiment {
            engine: self.engine.with_observer(observer),
            samples: self.samples,
            clusters: self.clusters,
            unclustered: self.unclustered,
            summary: self.summary,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.engine = self.engine.with_cancellation(token);
        self
    }

    pub fn engine(&self) -> &ClusteringEngine<O> {
        &self.engine
    }

    pub fn tracer(&self) -> &TracerSpec {
        self.engine.tracer()
    }

    pub fn samples(&self) -> &SampleMap {
        &self.samples
    }

    pub fn sample(&self, name: &str) -> Option<&SampleFeatures> {
        self.samples.get(name)
    }

    /// The current clusters, provisional after [`Self::build_clusters`] and final after
    /// [`Self::deduplicate_clusters`]
    pub fn clusters(&self) -> Option<&ClusterMap> {
        self.clusters.as_ref()
    }

    pub fn iter_clusters(&self) -> impl Iterator<Item = (&SampleFeatures, &Cluster)> + '_ {
        self.clusters
            .iter()
            .flat_map(|clusters| iter_clusters(&self.samples, clusters))
    }

    /// Features of `sample` left without a cluster by the last deduplication
    pub fn unclustered(&self, sample: &str) -> &[FeatureKey] {
        self.unclustered
            .get(sample)
            .map(|keys| keys.as_slice())
            .unwrap_or_default()
    }

    pub fn iter_unclustered(&self) -> impl Iterator<Item = (&SampleFeatures, FeatureKey)> + '_ {
        self.unclustered.iter().flat_map(|(name, keys)| {
            self.samples
                .get(name)
                .into_iter()
                .flat_map(move |features| keys.iter().map(move |k| (features, *k)))
        })
    }

    pub fn summary(&self) -> &ClusteringSummary {
        &self.summary
    }

    pub fn build_clusters(&mut self) -> Result<&ClusterMap, ClusteringError> {
        let clusters = self.engine.build(&mut self.samples)?;
        self.unclustered.clear();
        self.summary = ClusteringSummary::default();
        Ok(self.clusters.insert(clusters))
    }

    pub fn deduplicate_clusters(
        &mut self,
        keep: KeepPolicy,
    ) -> Result<&ClusteringSummary, ClusteringError> {
        let clusters = self.clusters.take().ok_or(ClusteringError::NotInitialized)?;
        let result = self.engine.deduplicate(&mut self.samples, clusters, keep)?;
        self.clusters = Some(result.clusters);
        self.unclustered = result.unclustered;
        self.summary = result.summary;
        Ok(&self.summary)
    }

    /// Build then deduplicate clusters, logging progress
    pub fn build_final_clusters(
        &mut self,
        keep: KeepPolicy,
    ) -> Result<&ClusteringSummary, ClusteringError> {
        let start = Instant::now();
        let n_features: usize = self.samples.values().map(|s| s.len()).sum();
        info!(
            "Clustering {} features across {} samples with tracer {} (shift {:0.6})",
            n_features,
            self.samples.len(),
            self.tracer(),
            self.tracer().mass_shift()
        );

        let built: usize = self.build_clusters()?.values().map(|c| c.len()).sum();
        info!("Built {built} provisional clusters");

        self.deduplicate_clusters(keep)?;
        let summary = &self.summary;
        info!(
            "Deduplicated with policy {keep}: {} merged, {} subsets removed, {} candidates dropped",
            summary.clusters_merged, summary.subsets_removed, summary.candidates_dropped
        );
        info!(
            "{} final clusters, {} unclustered features",
            summary.final_clusters, summary.unclustered_features
        );
        info!("Elapsed Time: {:0.3?}", start.elapsed());
        Ok(summary)
    }
}

/// Annotation of a dataset against a metabolite [`Database`]
#[derive(Debug, Clone)]
pub struct TargetedExperiment {
    database: Database,
    params: TargetedParams,
    samples: SampleMap,
    clusters: Option<ClusterMap>,
}

impl TargetedExperiment {
    pub fn new(dataset: &Dataset, database: Database, params: TargetedParams) -> Self {
        Self {
            database,
            params,
            samples: dataset.to_samples(),
            clusters: None,
        }
    }

    pub fn database(&self) -> &Database {
        &self.database
    }

    pub fn params(&self) -> &TargetedParams {
        &self.params
    }

    pub fn samples(&self) -> &SampleMap {
        &self.samples
    }

    pub fn clusters(&self) -> Option<&ClusterMap> {
        self.clusters.as_ref()
    }

    pub fn iter_clusters(&self) -> impl Iterator<Item = (&SampleFeatures, &Cluster)> + '_ {
        self.clusters
            .iter()
            .flat_map(|clusters| iter_clusters(&self.samples, clusters))
    }

    /// Match every feature against the database, returning the number of matches
    pub fn annotate(&mut self) -> usize {
        let annotator = TargetedAnnotator::new(&self.database, self.params);
        let matches = annotator.annotate(&mut self.samples);
        info!(
            "{matches} database matches within {} ppm and {} rt",
            self.params.ppm_tolerance, self.params.rt_tolerance
        );
        self.clusters = None;
        matches
    }

    /// Group annotated features into one cluster per metabolite
    pub fn clusterize(&mut self) -> &ClusterMap {
        let annotator = TargetedAnnotator::new(&self.database, self.params);
        let clusters = annotator.clusterize(&mut self.samples);
        self.clusters.insert(clusters)
    }
}
