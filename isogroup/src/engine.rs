//! The untargeted clustering engine.
//!
//! [`ClusteringEngine::build`] searches each sample for features that form a tracer mass
//! shift ladder within a retention time window, producing many overlapping provisional
//! clusters. [`ClusteringEngine::deduplicate`] then merges identical clusters, optionally
//! removes dominated clusters and redundant candidates according to a [`KeepPolicy`], and
//! rebuilds every feature's cluster membership from the survivors.
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt::Display;
use std::iter::Sum;
use std::ops::{Add, AddAssign};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use indexmap::IndexMap;
use rayon::prelude::*;
use thiserror::Error;
use tracing::{debug, info, trace};

use crate::cluster::Cluster;
use crate::feature::{ClusterId, FeatureKey, IsotopologueLabel, SampleFeatures};
use crate::tracer::{cap_isotopologues, TracerError, TracerSpec};

/// Feature arenas keyed by sample name, in input column order
pub type SampleMap = IndexMap<String, SampleFeatures>;
/// The clusters of a single sample, keyed by their identifier
pub type SampleClusters = BTreeMap<ClusterId, Cluster>;
/// Clusters of every sample, keyed by sample name
pub type ClusterMap = IndexMap<String, SampleClusters>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ClusteringError {
    #[error("Failed to configure the tracer: {0}")]
    Tracer(#[from] TracerError),
    #[error("No clusters have been built. Run the build step before deduplicating")]
    NotInitialized,
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Sample {0} has clusters but no features")]
    UnknownSample(String),
    #[error("Cluster {cluster} of sample {sample} refers to feature {key}, but the sample has {features} features")]
    UnknownFeature {
        sample: String,
        cluster: ClusterId,
        key: usize,
        features: usize,
    },
    #[error("Clustering was cancelled")]
    Cancelled,
}

/// How [`ClusteringEngine::deduplicate`] resolves overlapping clusters beyond merging
/// identical ones.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "snake_case")
)]
pub enum KeepPolicy {
    /// Only merge clusters with identical members
    None,
    /// Drop clusters whose members are a strict subset of a larger cluster's
    #[default]
    Longest,
    /// Keep only the member closest to the theoretical m/z for each isotopologue
    ClosestMz,
    /// Apply [`KeepPolicy::Longest`] and then [`KeepPolicy::ClosestMz`]
    Both,
}

impl KeepPolicy {
    pub fn removes_subsets(&self) -> bool {
        matches!(self, Self::Longest | Self::Both)
    }

    pub fn selects_closest_mz(&self) -> bool {
        matches!(self, Self::ClosestMz | Self::Both)
    }
}

impl Display for KeepPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Longest => "longest",
            Self::ClosestMz => "closest_mz",
            Self::Both => "both",
        };
        f.write_str(s)
    }
}

impl FromStr for KeepPolicy {
    type Err = ClusteringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(Self::None),
            "longest" => Ok(Self::Longest),
            "closest_mz" => Ok(Self::ClosestMz),
            "both" => Ok(Self::Both),
            _ => Err(ClusteringError::InvalidArgument(format!(
                "Unknown keep policy '{s}'. Expected one of none, longest, closest_mz, both"
            ))),
        }
    }
}

/// Parameters controlling the provisional cluster search
#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusteringParams {
    /// The half-width of the retention time window around each base feature
    pub rt_window: f64,
    /// The largest accepted deviation from the theoretical isotopologue m/z, in ppm
    pub ppm_tolerance: f64,
    /// The largest number of tracer atoms to consider. When absent, it is estimated from
    /// the base feature's m/z.
    pub max_atoms: Option<u32>,
}

impl Default for ClusteringParams {
    fn default() -> Self {
        Self {
            rt_window: 15.0,
            ppm_tolerance: 5.0,
            max_atoms: None,
        }
    }
}

impl ClusteringParams {
    pub fn new(rt_window: f64, ppm_tolerance: f64, max_atoms: Option<u32>) -> Self {
        Self {
            rt_window,
            ppm_tolerance,
            max_atoms,
        }
    }

    fn validate(&self) -> Result<(), ClusteringError> {
        if !(self.rt_window.is_finite() && self.rt_window >= 0.0) {
            return Err(ClusteringError::InvalidArgument(format!(
                "The retention time window must be a non-negative number, got {}",
                self.rt_window
            )));
        }
        if !(self.ppm_tolerance.is_finite() && self.ppm_tolerance >= 0.0) {
            return Err(ClusteringError::InvalidArgument(format!(
                "The ppm tolerance must be a non-negative number, got {}",
                self.ppm_tolerance
            )));
        }
        Ok(())
    }
}

/// A shared flag used to abort clustering from another thread
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<(), ClusteringError> {
        if self.is_cancelled() {
            Err(ClusteringError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Counts describing what happened to the clusters of one or more samples
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ClusteringSummary {
    pub samples: usize,
    pub clusters_built: usize,
    pub clusters_merged: usize,
    pub subsets_removed: usize,
    pub candidates_dropped: usize,
    pub final_clusters: usize,
    pub clustered_features: usize,
    pub unclustered_features: usize,
}

impl Add for ClusteringSummary {
    type Output = ClusteringSummary;

    fn add(self, rhs: Self) -> Self::Output {
        let mut dup = self;
        dup += rhs;
        dup
    }
}

impl AddAssign for ClusteringSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.samples += rhs.samples;
        self.clusters_built += rhs.clusters_built;
        self.clusters_merged += rhs.clusters_merged;
        self.subsets_removed += rhs.subsets_removed;
        self.candidates_dropped += rhs.candidates_dropped;
        self.final_clusters += rhs.final_clusters;
        self.clustered_features += rhs.clustered_features;
        self.unclustered_features += rhs.unclustered_features;
    }
}

impl Sum for ClusteringSummary {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), |acc, x| acc + x)
    }
}

/// Receives per-sample progress reports from a [`ClusteringEngine`]
pub trait ClusteringObserver: Send + Sync {
    fn sample_built(&self, _sample: &str, _features: usize, _clusters: usize) {}

    fn sample_deduplicated(&self, _sample: &str, _summary: &ClusteringSummary) {}
}

impl ClusteringObserver for () {}

/// Forwards clustering reports to `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingObserver;

impl ClusteringObserver for TracingObserver {
    fn sample_built(&self, sample: &str, features: usize, clusters: usize) {
        info!("{sample}: built {clusters} provisional clusters from {features} features");
    }

    fn sample_deduplicated(&self, sample: &str, summary: &ClusteringSummary) {
        info!(
            "{sample}: {} merged, {} subsets removed, {} candidates dropped, {} final clusters, {} unclustered features",
            summary.clusters_merged,
            summary.subsets_removed,
            summary.candidates_dropped,
            summary.final_clusters,
            summary.unclustered_features
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum IsotopologueCap {
    Fixed(u32),
    Heuristic { factor: f64, atomic_mass: f64 },
}

impl IsotopologueCap {
    fn at(&self, mz: f64) -> u32 {
        match self {
            Self::Fixed(n) => *n,
            Self::Heuristic {
                factor,
                atomic_mass,
            } => cap_isotopologues(*factor, mz, *atomic_mass),
        }
    }
}

/// The final clusters of one sample
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeduplicatedSample {
    pub clusters: SampleClusters,
    pub unclustered: Vec<FeatureKey>,
    pub summary: ClusteringSummary,
}

/// The final clusters of every sample
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Deduplicated {
    pub clusters: ClusterMap,
    pub unclustered: IndexMap<String, Vec<FeatureKey>>,
    pub summary: ClusteringSummary,
}

#[derive(Debug, Clone)]
pub struct ClusteringEngine<O: ClusteringObserver = ()> {
    tracer: TracerSpec,
    params: ClusteringParams,
    cap: IsotopologueCap,
    cancel: CancellationToken,
    observer: O,
}

impl ClusteringEngine<()> {
    /// Create an engine for `tracer`.
    ///
    /// When `params.max_atoms` is absent the tracer element must support the m/z based
    /// isotopologue estimate, otherwise this fails with [`TracerError::UnsupportedElement`].
    pub fn new(tracer: TracerSpec, params: ClusteringParams) -> Result<Self, ClusteringError> {
        params.validate()?;
        let cap = match params.max_atoms {
            Some(n) => IsotopologueCap::Fixed(n),
            None => IsotopologueCap::Heuristic {
                factor: tracer.isotopologue_cap_factor()?,
                atomic_mass: tracer.atomic_mass(),
            },
        };
        Ok(Self {
            tracer,
            params,
            cap,
            cancel: CancellationToken::default(),
            observer: (),
        })
    }
}

impl<O: ClusteringObserver> ClusteringEngine<O> {
    pub fn with_observer<P: ClusteringObserver>(self, observer: P) -> ClusteringEngine<P> {
        ClusteringEngine {
            tracer: self.tracer,
            params: self.params,
            cap: self.cap,
            cancel: self.cancel,
            observer,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn tracer(&self) -> &TracerSpec {
        &self.tracer
    }

    pub fn params(&self) -> &ClusteringParams {
        &self.params
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    /// The largest isotopologue index accepted around a base feature at `mz`
    pub fn max_isotopologues(&self, mz: f64) -> u32 {
        self.cap.at(mz)
    }

    /// Build provisional clusters for every sample in parallel
    pub fn build(&self, samples: &mut SampleMap) -> Result<ClusterMap, ClusteringError> {
        let built: Vec<(String, SampleClusters)> = samples
            .par_iter_mut()
            .map(|(name, features)| {
                self.build_sample(features)
                    .map(|clusters| (name.clone(), clusters))
            })
            .collect::<Result<_, _>>()?;
        Ok(built.into_iter().collect())
    }

    /// Search one sample for tracer isotopologue ladders.
    ///
    /// Every feature in turn acts as the base of a candidate group, so the result
    /// contains overlapping and duplicate clusters. Any membership left over from a
    /// previous pass is cleared first.
    pub fn build_sample(
        &self,
        features: &mut SampleFeatures,
    ) -> Result<SampleClusters, ClusteringError> {
        features.clear_clusters();

        let order = features.keys_by_rt();
        let rts: Vec<f64> = order.iter().map(|k| features[*k].rt()).collect();
        let width = self.params.rt_window;

        let mut clusters = SampleClusters::new();
        for base_key in order.iter().copied() {
            self.cancel.check()?;
            let base = &features[base_key];
            let (base_mz, base_rt) = (base.mz(), base.rt());

            let start = rts.partition_point(|rt| *rt < base_rt - width);
            let end = rts.partition_point(|rt| *rt <= base_rt + width);
            let max_iso = self.max_isotopologues(base_mz) as i64;

            let mut group = vec![base_key];
            for candidate_key in order[start..end].iter().copied() {
                if candidate_key == base_key {
                    continue;
                }
                let mz = features[candidate_key].mz();
                let iso = self.tracer.isotopologue_index(mz, base_mz);
                if iso.abs() > max_iso {
                    continue;
                }
                let expected = self.tracer.expected_mz(base_mz, iso);
                if expected <= 0.0 {
                    continue;
                }
                let delta_ppm = (expected - mz).abs() / expected * 1e6;
                if delta_ppm <= self.params.ppm_tolerance {
                    group.push(candidate_key);
                }
            }

            if group.len() > 1 {
                let id = ClusterId(clusters.len());
                let mut cluster = Cluster::new(id, features.name(), group);
                cluster.sort_members_by_mz(features);
                trace!(
                    "{}: {id} from base {} with {} members",
                    features.name(),
                    features[base_key].feature_id(),
                    cluster.len()
                );
                self.label_members(features, &cluster);
                clusters.insert(id, cluster);
            }
        }

        debug!(
            "{}: {} provisional clusters from {} features",
            features.name(),
            clusters.len(),
            features.len()
        );
        self.observer
            .sample_built(features.name(), features.len(), clusters.len());
        Ok(clusters)
    }

    /// Resolve the provisional clusters of every sample in parallel.
    ///
    /// Samples with features but no entry in `clusters` end up fully unclustered.
    pub fn deduplicate(
        &self,
        samples: &mut SampleMap,
        mut clusters: ClusterMap,
        keep: KeepPolicy,
    ) -> Result<Deduplicated, ClusteringError> {
        if clusters.is_empty() {
            return Err(ClusteringError::NotInitialized);
        }
        if let Some(name) = clusters.keys().find(|name| !samples.contains_key(*name)) {
            return Err(ClusteringError::UnknownSample(name.clone()));
        }

        let work: Vec<_> = samples
            .iter_mut()
            .map(|(name, features)| {
                let provisional = clusters.shift_remove(name).unwrap_or_default();
                (name.clone(), features, provisional)
            })
            .collect();

        let results: Vec<(String, DeduplicatedSample)> = work
            .into_par_iter()
            .map(|(name, features, provisional)| {
                self.deduplicate_sample(features, provisional, keep)
                    .map(|result| (name, result))
            })
            .collect::<Result<_, _>>()?;

        let mut deduplicated = Deduplicated::default();
        for (name, result) in results {
            deduplicated.summary += result.summary;
            deduplicated.unclustered.insert(name.clone(), result.unclustered);
            deduplicated.clusters.insert(name, result.clusters);
        }
        Ok(deduplicated)
    }

    /// Resolve the provisional clusters of one sample.
    ///
    /// Identical clusters are merged first, then `keep` decides whether subset clusters
    /// and redundant isotopologue candidates are removed. The survivors are renumbered
    /// from `C0` and the membership of every feature in the sample is rebuilt from them.
    pub fn deduplicate_sample(
        &self,
        features: &mut SampleFeatures,
        clusters: SampleClusters,
        keep: KeepPolicy,
    ) -> Result<DeduplicatedSample, ClusteringError> {
        if let Some((cluster, key)) = clusters.values().find_map(|c| {
            c.members()
                .iter()
                .find(|k| features.get(**k).is_none())
                .map(|k| (c.id(), *k))
        }) {
            return Err(ClusteringError::UnknownFeature {
                sample: features.name().to_string(),
                cluster,
                key: key.0,
                features: features.len(),
            });
        }

        let mut summary = ClusteringSummary {
            samples: 1,
            clusters_built: clusters.len(),
            ..Default::default()
        };

        let mut seen: HashSet<BTreeSet<FeatureKey>> = HashSet::with_capacity(clusters.len());
        let mut survivors: Vec<(BTreeSet<FeatureKey>, Cluster)> = Vec::with_capacity(clusters.len());
        for cluster in clusters.into_values() {
            let signature = cluster.signature();
            if seen.insert(signature.clone()) {
                survivors.push((signature, cluster));
            } else {
                summary.clusters_merged += 1;
            }
        }
        self.cancel.check()?;

        if keep.removes_subsets() {
            let before = survivors.len();
            survivors = Self::remove_subsets(survivors);
            summary.subsets_removed = before - survivors.len();
        }

        let mut survivors: Vec<Cluster> = survivors.into_iter().map(|(_, c)| c).collect();

        if keep.selects_closest_mz() {
            for cluster in survivors.iter_mut() {
                summary.candidates_dropped += self.keep_closest_mz(features, cluster);
            }
        }
        self.cancel.check()?;

        features.clear_clusters();
        let mut final_clusters = SampleClusters::new();
        for (i, mut cluster) in survivors.into_iter().enumerate() {
            cluster.id = ClusterId(i);
            cluster.sort_members_by_mz(features);
            self.label_members(features, &cluster);
            final_clusters.insert(cluster.id, cluster);
        }

        let unclustered: Vec<FeatureKey> = features.unclustered().collect();
        summary.final_clusters = final_clusters.len();
        summary.unclustered_features = unclustered.len();
        summary.clustered_features = features.len() - unclustered.len();

        debug!(
            "{}: {} merged, {} subsets removed, {} candidates dropped, {} final clusters",
            features.name(),
            summary.clusters_merged,
            summary.subsets_removed,
            summary.candidates_dropped,
            summary.final_clusters
        );
        self.observer.sample_deduplicated(features.name(), &summary);

        Ok(DeduplicatedSample {
            clusters: final_clusters,
            unclustered,
            summary,
        })
    }

    /// Drop every cluster whose signature is a strict subset of a kept, larger one.
    ///
    /// Clusters are considered from largest to smallest, and the survivors keep their
    /// original relative order.
    fn remove_subsets(
        survivors: Vec<(BTreeSet<FeatureKey>, Cluster)>,
    ) -> Vec<(BTreeSet<FeatureKey>, Cluster)> {
        let mut by_size: Vec<usize> = (0..survivors.len()).collect();
        by_size.sort_by(|a, b| survivors[*b].0.len().cmp(&survivors[*a].0.len()));

        let mut keep_mask = vec![false; survivors.len()];
        let mut kept: Vec<usize> = Vec::new();
        for i in by_size {
            let signature = &survivors[i].0;
            let dominated = kept.iter().any(|j| {
                let other = &survivors[*j].0;
                signature.len() < other.len() && signature.is_subset(other)
            });
            if !dominated {
                keep_mask[i] = true;
                kept.push(i);
            }
        }

        survivors
            .into_iter()
            .zip(keep_mask)
            .filter_map(|(entry, keep)| keep.then_some(entry))
            .collect()
    }

    /// Keep, for each isotopologue index, only the member nearest its theoretical m/z.
    /// Returns the number of members removed.
    fn keep_closest_mz(&self, features: &SampleFeatures, cluster: &mut Cluster) -> usize {
        cluster.sort_members_by_mz(features);
        let Some(base_mz) = cluster.members.first().map(|k| features[*k].mz()) else {
            return 0;
        };

        let mut by_index: BTreeMap<i64, Vec<FeatureKey>> = BTreeMap::new();
        for key in cluster.members.iter().copied() {
            let iso = self.tracer.isotopologue_index(features[key].mz(), base_mz);
            by_index.entry(iso).or_default().push(key);
        }

        let before = cluster.members.len();
        cluster.members = by_index
            .into_iter()
            .filter_map(|(iso, candidates)| {
                let expected = self.tracer.expected_mz(base_mz, iso);
                candidates.into_iter().min_by(|a, b| {
                    let da = (features[*a].mz() - expected).abs();
                    let db = (features[*b].mz() - expected).abs();
                    da.total_cmp(&db)
                })
            })
            .collect();
        before - cluster.members.len()
    }

    /// Record each member's isotopologue label relative to the cluster's first member.
    /// Members must already be sorted by m/z.
    fn label_members(&self, features: &mut SampleFeatures, cluster: &Cluster) {
        let Some(base_mz) = cluster.members.first().map(|k| features[*k].mz()) else {
            return;
        };
        for key in cluster.members.iter().copied() {
            if let Some(feature) = features.get_mut(key) {
                let iso = self.tracer.isotopologue_index(feature.mz(), base_mz).max(0) as u32;
                feature.assign_cluster(cluster.id, IsotopologueLabel::from_index(iso));
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn make_samples(points: &[(&str, f64, f64)]) -> SampleMap {
        let mut sample = SampleFeatures::new("S1");
        for (id, mz, rt) in points {
            sample.push(*id, *mz, *rt, Some(1000.0)).unwrap();
        }
        let mut samples = SampleMap::new();
        samples.insert("S1".to_string(), sample);
        samples
    }

    fn make_engine(rt_window: f64, max_atoms: Option<u32>) -> ClusteringEngine {
        let tracer = TracerSpec::parse("13C").unwrap();
        ClusteringEngine::new(tracer, ClusteringParams::new(rt_window, 5.0, max_atoms)).unwrap()
    }

    fn feature_ids(samples: &SampleMap, cluster: &Cluster) -> Vec<String> {
        let features = &samples[cluster.sample()];
        cluster
            .members()
            .iter()
            .map(|k| features[*k].feature_id().to_string())
            .collect()
    }

    #[test_log::test]
    fn test_pair_cluster() -> Result<(), ClusteringError> {
        let mut samples = make_samples(&[("A", 100.0, 10.0), ("B", 101.00336, 10.05)]);
        let engine = make_engine(0.2, None);

        let clusters = engine.build(&mut samples)?;
        assert_eq!(clusters["S1"].len(), 2);

        let result = engine.deduplicate(&mut samples, clusters, KeepPolicy::Longest)?;
        let sample_clusters = &result.clusters["S1"];
        assert_eq!(sample_clusters.len(), 1);
        let cluster = &sample_clusters[&ClusterId(0)];
        assert_eq!(feature_ids(&samples, cluster), vec!["A", "B"]);

        let features = &samples["S1"];
        let a = features.find("A").unwrap();
        let b = features.find("B").unwrap();
        assert_eq!(
            features[a].isotopologue_label(ClusterId(0)),
            Some(IsotopologueLabel::Unshifted)
        );
        assert_eq!(
            features[b].isotopologue_label(ClusterId(0)).map(|l| l.to_string()),
            Some("M+1".to_string())
        );
        assert_eq!(result.summary.clusters_merged, 1);
        assert!(result.unclustered["S1"].is_empty());
        Ok(())
    }

    #[test]
    fn test_narrow_window() -> Result<(), ClusteringError> {
        let mut samples = make_samples(&[("A", 100.0, 10.0), ("B", 101.00336, 10.05)]);
        let engine = make_engine(0.01, None);

        let clusters = engine.build(&mut samples)?;
        assert!(clusters["S1"].is_empty());

        let result = engine.deduplicate(&mut samples, clusters, KeepPolicy::Longest)?;
        assert!(result.clusters["S1"].is_empty());
        assert_eq!(result.unclustered["S1"].len(), 2);
        assert_eq!(result.summary.unclustered_features, 2);
        Ok(())
    }

    #[test]
    fn test_zero_window() -> Result<(), ClusteringError> {
        let mut samples = make_samples(&[("A", 100.0, 10.0), ("B", 101.00336, 10.05)]);
        let engine = make_engine(0.0, None);
        let clusters = engine.build(&mut samples)?;
        assert!(clusters["S1"].is_empty());
        Ok(())
    }

    fn overlapping() -> SampleMap {
        make_samples(&[
            ("A", 100.0, 10.0),
            ("B", 101.00336, 10.1),
            ("C", 102.00671, 10.2),
        ])
    }

    #[test]
    fn test_overlapping_longest() -> Result<(), ClusteringError> {
        let mut samples = overlapping();
        let engine = make_engine(0.15, None);

        let clusters = engine.build(&mut samples)?;
        let signatures: Vec<Vec<String>> = clusters["S1"]
            .values()
            .map(|c| feature_ids(&samples, c))
            .collect();
        assert_eq!(
            signatures,
            vec![vec!["A", "B"], vec!["A", "B", "C"], vec!["B", "C"]]
        );

        let result = engine.deduplicate(&mut samples, clusters, KeepPolicy::Longest)?;
        assert_eq!(result.summary.subsets_removed, 2);
        let sample_clusters = &result.clusters["S1"];
        assert_eq!(sample_clusters.len(), 1);
        let cluster = &sample_clusters[&ClusterId(0)];
        assert_eq!(feature_ids(&samples, cluster), vec!["A", "B", "C"]);
        let view = cluster.view(&samples["S1"]);
        assert_eq!(view.isotopologues(), vec![0, 1, 2]);
        assert!(view.is_complete());
        Ok(())
    }

    #[test]
    fn test_keep_none_preserves_features() -> Result<(), ClusteringError> {
        let mut samples = overlapping();
        let engine = make_engine(0.15, None);

        let clusters = engine.build(&mut samples)?;
        let result = engine.deduplicate(&mut samples, clusters, KeepPolicy::None)?;
        assert_eq!(result.clusters["S1"].len(), 3);
        assert!(result.unclustered["S1"].is_empty());

        let features = &samples["S1"];
        let b = features.find("B").unwrap();
        assert_eq!(features[b].cluster_membership().len(), 3);
        assert_eq!(
            features[b].also_in(ClusterId(1)).collect::<Vec<_>>(),
            vec![ClusterId(0), ClusterId(2)]
        );
        assert_eq!(
            features[b].isotopologue_label(ClusterId(2)),
            Some(IsotopologueLabel::Unshifted)
        );
        Ok(())
    }

    #[test]
    fn test_closest_mz() -> Result<(), ClusteringError> {
        let mut samples = make_samples(&[
            ("A", 100.0, 10.0),
            ("B", 101.00336, 10.0),
            ("B'", 101.0036, 10.0),
        ]);
        let engine = make_engine(0.5, None);

        let clusters = engine.build(&mut samples)?;
        {
            let view = clusters["S1"][&ClusterId(0)].view(&samples["S1"]);
            assert!(view.is_duplicated());
            assert_eq!(view.duplicated_isotopologues(), vec![1]);
        }

        let result = engine.deduplicate(&mut samples, clusters, KeepPolicy::ClosestMz)?;
        assert_eq!(result.summary.clusters_merged, 2);
        assert_eq!(result.summary.candidates_dropped, 1);
        let cluster = &result.clusters["S1"][&ClusterId(0)];
        assert_eq!(feature_ids(&samples, cluster), vec!["A", "B"]);

        let features = &samples["S1"];
        let unclustered: Vec<&str> = result.unclustered["S1"]
            .iter()
            .map(|k| features[*k].feature_id())
            .collect();
        assert_eq!(unclustered, vec!["B'"]);
        Ok(())
    }

    #[test]
    fn test_max_atoms_zero() -> Result<(), ClusteringError> {
        let mut samples = make_samples(&[
            ("A", 100.0, 10.0),
            ("A'", 100.0002, 10.0),
            ("B", 101.00336, 10.0),
        ]);
        let engine = make_engine(0.5, Some(0));
        let clusters = engine.build(&mut samples)?;
        for cluster in clusters["S1"].values() {
            assert_eq!(feature_ids(&samples, cluster), vec!["A", "A'"]);
        }
        Ok(())
    }

    /// Check that some member of `cluster` can act as its base: every other member lies
    /// within that base's isotopologue cap and ppm tolerance
    fn has_valid_base<O: ClusteringObserver>(
        engine: &ClusteringEngine<O>,
        features: &SampleFeatures,
        cluster: &Cluster,
    ) -> bool {
        let tracer = engine.tracer();
        cluster.members().iter().any(|base| {
            let base_mz = features[*base].mz();
            let cap = engine.max_isotopologues(base_mz) as i64;
            cluster.members().iter().all(|k| {
                let mz = features[*k].mz();
                let iso = tracer.isotopologue_index(mz, base_mz);
                let expected = tracer.expected_mz(base_mz, iso);
                iso.abs() <= cap
                    && (expected - mz).abs() / expected * 1e6 <= engine.params().ppm_tolerance
            })
        })
    }

    #[test]
    fn test_members_respect_cap() -> Result<(), ClusteringError> {
        let tracer = TracerSpec::parse("13C")?;
        let ladder: Vec<(&str, f64, f64)> = ["A", "B", "C", "D"]
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, tracer.expected_mz(30.0, i as i64), 10.0))
            .collect();
        let mut samples = make_samples(&ladder);
        let engine = make_engine(1.0, None);
        assert_eq!(engine.max_isotopologues(30.0), 1);
        assert_eq!(engine.max_isotopologues(ladder[3].1), 1);

        let clusters = engine.build(&mut samples)?;
        let members: Vec<_> = clusters["S1"]
            .values()
            .map(|c| feature_ids(&samples, c))
            .collect();
        assert_eq!(
            members,
            vec![
                vec!["A", "B"],
                vec!["A", "B", "C"],
                vec!["B", "C", "D"],
                vec!["C", "D"]
            ]
        );
        for cluster in clusters["S1"].values() {
            assert!(has_valid_base(&engine, &samples["S1"], cluster), "{:?}", cluster);
        }
        Ok(())
    }

    #[test]
    fn test_members_respect_fixed_cap() -> Result<(), ClusteringError> {
        let tracer = TracerSpec::parse("13C")?;
        let ladder: Vec<(&str, f64, f64)> = ["A", "B", "C", "D"]
            .into_iter()
            .enumerate()
            .map(|(i, id)| (id, tracer.expected_mz(100.0, i as i64), 10.0))
            .collect();
        let mut samples = make_samples(&ladder);
        let engine = make_engine(1.0, Some(2));

        let clusters = engine.build(&mut samples)?;
        let members: Vec<_> = clusters["S1"]
            .values()
            .map(|c| feature_ids(&samples, c))
            .collect();
        // D is three shifts above A, so the ladder based on A stops at C
        assert_eq!(
            members,
            vec![
                vec!["A", "B", "C"],
                vec!["A", "B", "C", "D"],
                vec!["A", "B", "C", "D"],
                vec!["B", "C", "D"]
            ]
        );
        for cluster in clusters["S1"].values() {
            assert!(has_valid_base(&engine, &samples["S1"], cluster));
        }
        Ok(())
    }

    #[test]
    fn test_ppm_tolerance_is_inclusive() -> Result<(), ClusteringError> {
        let tracer = TracerSpec::parse("13C")?;
        let expected = tracer.expected_mz(100.0, 1);
        let observed = 101.004;
        let delta_ppm = (expected - observed).abs() / expected * 1e6;
        assert!(delta_ppm > 6.0 && delta_ppm < 6.5);

        let build = |ppm_tolerance: f64| -> Result<usize, ClusteringError> {
            let mut samples = make_samples(&[("A", 100.0, 10.0), ("B", observed, 10.0)]);
            let engine =
                ClusteringEngine::new(tracer.clone(), ClusteringParams::new(0.2, ppm_tolerance, None))?;
            Ok(engine.build(&mut samples)?["S1"].len())
        };

        // Only A can act as the base, seen from B the deviation is slightly larger
        assert_eq!(build(delta_ppm)?, 1);
        assert_eq!(build(delta_ppm - delta_ppm * 1e-9)?, 0);
        Ok(())
    }

    #[test]
    fn test_rt_window_is_inclusive() -> Result<(), ClusteringError> {
        let tracer = TracerSpec::parse("13C")?;
        let heavy = tracer.expected_mz(100.0, 1);
        let build = |rt_window: f64| -> Result<usize, ClusteringError> {
            let mut samples = make_samples(&[("A", 100.0, 10.0), ("B", heavy, 10.5)]);
            Ok(make_engine(rt_window, None).build(&mut samples)?["S1"].len())
        };

        assert_eq!(build(0.5)?, 2);
        assert_eq!(build(0.5 - 1e-9)?, 0);
        Ok(())
    }

    #[test]
    fn test_non_positive_expected_mz() -> Result<(), ClusteringError> {
        let mut samples = make_samples(&[("A", 1.0, 10.0), ("B", 0.2, 10.0)]);
        let engine = make_engine(0.5, None);
        assert_eq!(engine.max_isotopologues(1.0), 1);
        let clusters = engine.build(&mut samples)?;
        assert!(clusters["S1"].is_empty());
        assert!(samples["S1"].iter().all(|(_, f)| !f.is_clustered()));
        Ok(())
    }

    #[test]
    fn test_unknown_feature_key() -> Result<(), ClusteringError> {
        let mut samples = overlapping();
        let engine = make_engine(0.15, None);
        let mut clusters = engine.build(&mut samples)?;
        let n = samples["S1"].len();

        let stray = Cluster::new(ClusterId(99), "S1", vec![FeatureKey(0), FeatureKey(n)]);
        clusters["S1"].insert(ClusterId(99), stray);
        assert_eq!(
            engine.deduplicate(&mut samples, clusters, KeepPolicy::Longest),
            Err(ClusteringError::UnknownFeature {
                sample: "S1".to_string(),
                cluster: ClusterId(99),
                key: n,
                features: n,
            })
        );
        Ok(())
    }

    #[test]
    fn test_idempotent() -> Result<(), ClusteringError> {
        let mut samples = overlapping();
        let engine = make_engine(0.15, None);

        let clusters = engine.build(&mut samples)?;
        let first = engine.deduplicate(&mut samples, clusters, KeepPolicy::Both)?;
        let features_after_first = samples.clone();

        let second = engine.deduplicate(&mut samples, first.clusters.clone(), KeepPolicy::Both)?;
        assert_eq!(first.clusters, second.clusters);
        assert_eq!(first.unclustered, second.unclustered);
        assert_eq!(features_after_first, samples);
        Ok(())
    }

    #[test]
    fn test_errors() {
        let mut samples = overlapping();
        let engine = make_engine(0.15, None);

        assert_eq!(
            engine.deduplicate(&mut samples, ClusterMap::new(), KeepPolicy::None),
            Err(ClusteringError::NotInitialized)
        );

        let mut clusters = ClusterMap::new();
        clusters.insert("S9".to_string(), SampleClusters::new());
        assert_eq!(
            engine.deduplicate(&mut samples, clusters, KeepPolicy::None),
            Err(ClusteringError::UnknownSample("S9".to_string()))
        );

        assert!(matches!(
            "richest".parse::<KeepPolicy>(),
            Err(ClusteringError::InvalidArgument(_))
        ));
        assert_eq!("closest_mz".parse::<KeepPolicy>(), Ok(KeepPolicy::ClosestMz));
        assert_eq!(KeepPolicy::Both.to_string(), "both");

        let tracer = TracerSpec::parse("34S").unwrap();
        assert_eq!(
            ClusteringEngine::new(tracer.clone(), ClusteringParams::default()).err(),
            Some(ClusteringError::Tracer(TracerError::UnsupportedElement(
                "S".to_string()
            )))
        );
        assert!(ClusteringEngine::new(tracer, ClusteringParams::new(15.0, 5.0, Some(3))).is_ok());
        assert!(matches!(
            ClusteringEngine::new(
                TracerSpec::parse("13C").unwrap(),
                ClusteringParams::new(-1.0, 5.0, None)
            ),
            Err(ClusteringError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_cancelled() {
        let mut samples = overlapping();
        let token = CancellationToken::new();
        let engine = make_engine(0.15, None).with_cancellation(token.clone());
        token.cancel();
        assert_eq!(engine.build(&mut samples), Err(ClusteringError::Cancelled));
    }

    #[test]
    fn test_summary_sum() {
        let a = ClusteringSummary {
            samples: 1,
            clusters_built: 7,
            clusters_merged: 5,
            final_clusters: 2,
            ..Default::default()
        };
        let total: ClusteringSummary = [a, a].into_iter().sum();
        assert_eq!(total.samples, 2);
        assert_eq!(total.clusters_built, 14);
        assert_eq!(total.final_clusters, 4);
    }
}
