//! Features are the per-sample m/z, retention time and intensity observations that
//! clustering groups together.
//!
//! Features of one sample live in a [`SampleFeatures`] arena and are addressed by
//! [`FeatureKey`]. Clusters refer to features by key only, and the cluster membership
//! recorded on each [`Feature`] is rebuilt from the clusters whenever they are finalized.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::ops::Index;

use thiserror::Error;

use crate::targeted::TargetedAnnotation;

/// An observation that cannot be placed in a [`SampleFeatures`] arena
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FeatureError {
    #[error("Feature {feature_id} has m/z {mz}, expected a finite positive value")]
    InvalidMz { feature_id: String, mz: f64 },
    #[error("Feature {feature_id} has a non-finite retention time {rt}")]
    InvalidRt { feature_id: String, rt: f64 },
}

/// Check that `mz` is finite and positive and `rt` is finite
pub(crate) fn check_coordinates(feature_id: &str, mz: f64, rt: f64) -> Result<(), FeatureError> {
    if !(mz.is_finite() && mz > 0.0) {
        return Err(FeatureError::InvalidMz {
            feature_id: feature_id.to_string(),
            mz,
        });
    }
    if !rt.is_finite() {
        return Err(FeatureError::InvalidRt {
            feature_id: feature_id.to_string(),
            rt,
        });
    }
    Ok(())
}

/// The position of a [`Feature`] in its [`SampleFeatures`] arena
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeatureKey(pub usize);

impl From<usize> for FeatureKey {
    fn from(value: usize) -> Self {
        FeatureKey(value)
    }
}

/// A per-sample cluster identifier, rendered as `C<n>`.
///
/// Identifiers are reassigned every time a sample's clusters are finalized.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterId(pub usize);

impl Display for ClusterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "C{}", self.0)
    }
}

impl From<usize> for ClusterId {
    fn from(value: usize) -> Self {
        ClusterId(value)
    }
}

/// The isotopologue a feature represents within a particular cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IsotopologueLabel {
    /// The lightest member of the cluster, carrying no detected tracer atoms
    Unshifted,
    /// A member `n` tracer mass shifts above the lightest member
    Shifted(u32),
}

impl IsotopologueLabel {
    pub fn from_index(index: u32) -> Self {
        if index == 0 {
            Self::Unshifted
        } else {
            Self::Shifted(index)
        }
    }

    /// The number of tracer mass shifts this label denotes
    pub fn index(&self) -> u32 {
        match self {
            Self::Unshifted => 0,
            Self::Shifted(n) => *n,
        }
    }
}

impl Display for IsotopologueLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unshifted => write!(f, "Mx"),
            Self::Shifted(n) => write!(f, "M+{n}"),
        }
    }
}

/// A single observation of an m/z at a retention time in one sample
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    feature_id: String,
    sample: String,
    mz: f64,
    rt: f64,
    intensity: Option<f64>,
    cluster_membership: BTreeSet<ClusterId>,
    isotopologue_labels: BTreeMap<ClusterId, IsotopologueLabel>,
    annotations: Vec<TargetedAnnotation>,
}

impl Feature {
    pub fn new(
        feature_id: impl Into<String>,
        sample: impl Into<String>,
        mz: f64,
        rt: f64,
        intensity: Option<f64>,
    ) -> Self {
        Self {
            feature_id: feature_id.into(),
            sample: sample.into(),
            mz,
            rt,
            intensity,
            cluster_membership: BTreeSet::new(),
            isotopologue_labels: BTreeMap::new(),
            annotations: Vec::new(),
        }
    }

    pub fn feature_id(&self) -> &str {
        &self.feature_id
    }

    pub fn sample(&self) -> &str {
        &self.sample
    }

    pub fn mz(&self) -> f64 {
        self.mz
    }

    pub fn rt(&self) -> f64 {
        self.rt
    }

    pub fn intensity(&self) -> Option<f64> {
        self.intensity
    }

    /// The clusters this feature currently belongs to, in identifier order
    pub fn cluster_membership(&self) -> &BTreeSet<ClusterId> {
        &self.cluster_membership
    }

    pub fn is_clustered(&self) -> bool {
        !self.cluster_membership.is_empty()
    }

    pub fn in_cluster(&self, cluster: ClusterId) -> bool {
        self.cluster_membership.contains(&cluster)
    }

    /// The clusters this feature belongs to other than `cluster`
    pub fn also_in(&self, cluster: ClusterId) -> impl Iterator<Item = ClusterId> + '_ {
        self.cluster_membership
            .iter()
            .copied()
            .filter(move |c| *c != cluster)
    }

    pub fn isotopologue_label(&self, cluster: ClusterId) -> Option<IsotopologueLabel> {
        self.isotopologue_labels.get(&cluster).copied()
    }

    pub fn isotopologue_labels(&self) -> &BTreeMap<ClusterId, IsotopologueLabel> {
        &self.isotopologue_labels
    }

    /// The database matches recorded by targeted annotation
    pub fn annotations(&self) -> &[TargetedAnnotation] {
        &self.annotations
    }

    pub fn is_annotated(&self) -> bool {
        !self.annotations.is_empty()
    }

    pub(crate) fn assign_cluster(&mut self, cluster: ClusterId, label: IsotopologueLabel) {
        self.cluster_membership.insert(cluster);
        self.isotopologue_labels.insert(cluster, label);
    }

    pub(crate) fn clear_clusters(&mut self) {
        self.cluster_membership.clear();
        self.isotopologue_labels.clear();
    }

    pub(crate) fn push_annotation(&mut self, annotation: TargetedAnnotation) {
        self.annotations.push(annotation);
    }

    pub(crate) fn clear_annotations(&mut self) {
        self.annotations.clear();
    }
}

/// The features observed in one sample, stored contiguously and addressed by [`FeatureKey`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SampleFeatures {
    name: String,
    features: Vec<Feature>,
}

impl SampleFeatures {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            features: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a new feature to the sample, returning its key.
    ///
    /// The m/z must be finite and positive and the retention time finite.
    pub fn push(
        &mut self,
        feature_id: impl Into<String>,
        mz: f64,
        rt: f64,
        intensity: Option<f64>,
    ) -> Result<FeatureKey, FeatureError> {
        let feature_id = feature_id.into();
        check_coordinates(&feature_id, mz, rt)?;
        let key = FeatureKey(self.features.len());
        let feature = Feature::new(feature_id, self.name.clone(), mz, rt, intensity);
        self.features.push(feature);
        Ok(key)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn get(&self, key: FeatureKey) -> Option<&Feature> {
        self.features.get(key.0)
    }

    pub(crate) fn get_mut(&mut self, key: FeatureKey) -> Option<&mut Feature> {
        self.features.get_mut(key.0)
    }

    pub fn keys(&self) -> impl Iterator<Item = FeatureKey> {
        (0..self.features.len()).map(FeatureKey)
    }

    pub fn iter(&self) -> impl Iterator<Item = (FeatureKey, &Feature)> {
        self.features
            .iter()
            .enumerate()
            .map(|(i, f)| (FeatureKey(i), f))
    }

    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut Feature> {
        self.features.iter_mut()
    }

    /// Look up a feature by its identifier
    pub fn find(&self, feature_id: &str) -> Option<FeatureKey> {
        self.features
            .iter()
            .position(|f| f.feature_id == feature_id)
            .map(FeatureKey)
    }

    /// The keys of all features, ordered by increasing retention time
    pub fn keys_by_rt(&self) -> Vec<FeatureKey> {
        let mut keys: Vec<_> = self.keys().collect();
        keys.sort_by(|a, b| self[*a].rt.total_cmp(&self[*b].rt));
        keys
    }

    /// The keys of the features that belong to no cluster
    pub fn unclustered(&self) -> impl Iterator<Item = FeatureKey> + '_ {
        self.iter()
            .filter(|(_, f)| !f.is_clustered())
            .map(|(k, _)| k)
    }

    pub(crate) fn clear_clusters(&mut self) {
        self.features.iter_mut().for_each(Feature::clear_clusters);
    }
}

impl Index<FeatureKey> for SampleFeatures {
    type Output = Feature;

    fn index(&self, index: FeatureKey) -> &Self::Output {
        &self.features[index.0]
    }
}
