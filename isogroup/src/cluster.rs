//! Clusters of features hypothesized to be isotopologues of the same molecule.
//!
//! A [`Cluster`] only stores the keys of its members. All aggregate properties are
//! computed on demand through a [`ClusterView`] that borrows the sample's features,
//! so they always reflect the current member list.
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::ops::RangeInclusive;

use crate::feature::{ClusterId, Feature, FeatureKey, SampleFeatures};

#[derive(Debug, Clone, PartialEq)]
pub struct Cluster {
    pub(crate) id: ClusterId,
    pub(crate) sample: String,
    pub(crate) members: Vec<FeatureKey>,
    pub(crate) name: Option<String>,
    pub(crate) expected_tracer_atoms: Option<u32>,
}

impl Cluster {
    pub fn new(id: ClusterId, sample: impl Into<String>, members: Vec<FeatureKey>) -> Self {
        Self {
            id,
            sample: sample.into(),
            members,
            name: None,
            expected_tracer_atoms: None,
        }
    }

    /// Attach a metabolite name and the number of tracer atoms its formula carries
    pub fn with_identity(mut self, name: impl Into<String>, expected_tracer_atoms: u32) -> Self {
        self.name = Some(name.into());
        self.expected_tracer_atoms = Some(expected_tracer_atoms);
        self
    }

    pub fn id(&self) -> ClusterId {
        self.id
    }

    pub fn sample(&self) -> &str {
        &self.sample
    }

    pub fn members(&self) -> &[FeatureKey] {
        &self.members
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn expected_tracer_atoms(&self) -> Option<u32> {
        self.expected_tracer_atoms
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, key: FeatureKey) -> bool {
        self.members.contains(&key)
    }

    /// The set of member keys, which identifies duplicate and subset clusters
    pub fn signature(&self) -> BTreeSet<FeatureKey> {
        self.members.iter().copied().collect()
    }

    /// Borrow the features of the cluster's sample to compute derived properties
    pub fn view<'a>(&'a self, features: &'a SampleFeatures) -> ClusterView<'a> {
        ClusterView {
            cluster: self,
            features,
        }
    }

    pub(crate) fn sort_members_by_mz(&mut self, features: &SampleFeatures) {
        self.members
            .sort_by(|a, b| features[*a].mz().total_cmp(&features[*b].mz()));
    }
}

/// The completeness flags of a cluster's isotopologue ladder
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ClusterStatus {
    pub complete: bool,
    pub incomplete: bool,
    pub duplicated: bool,
}

impl Display for ClusterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut parts = Vec::with_capacity(3);
        if self.complete {
            parts.push("Complete");
        }
        if self.incomplete {
            parts.push("Incomplete");
        }
        if self.duplicated {
            parts.push("Duplicated isotopologues");
        }
        write!(f, "{}", parts.join(", "))
    }
}

/// A read-only view of a [`Cluster`] joined with the features it refers to
#[derive(Debug, Clone, Copy)]
pub struct ClusterView<'a> {
    cluster: &'a Cluster,
    features: &'a SampleFeatures,
}

impl<'a> ClusterView<'a> {
    pub fn cluster(&self) -> &'a Cluster {
        self.cluster
    }

    pub fn id(&self) -> ClusterId {
        self.cluster.id
    }

    pub fn len(&self) -> usize {
        self.cluster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cluster.is_empty()
    }

    /// The member features in cluster order
    pub fn features(&self) -> impl Iterator<Item = &'a Feature> + 'a {
        let features = self.features;
        self.cluster.members.iter().map(move |k| &features[*k])
    }

    pub fn lowest_mz(&self) -> f64 {
        self.features().map(Feature::mz).fold(f64::INFINITY, f64::min)
    }

    pub fn highest_mz(&self) -> f64 {
        self.features()
            .map(Feature::mz)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn lowest_rt(&self) -> f64 {
        self.features().map(Feature::rt).fold(f64::INFINITY, f64::min)
    }

    pub fn highest_rt(&self) -> f64 {
        self.features()
            .map(Feature::rt)
            .fold(f64::NEG_INFINITY, f64::max)
    }

    pub fn mean_mz(&self) -> f64 {
        self.features().map(Feature::mz).sum::<f64>() / self.len() as f64
    }

    pub fn mean_rt(&self) -> f64 {
        self.features().map(Feature::rt).sum::<f64>() / self.len() as f64
    }

    /// The isotopologue index each member carries in this cluster, in member order
    pub fn isotopologues(&self) -> Vec<u32> {
        let id = self.cluster.id;
        self.features()
            .filter_map(|f| f.isotopologue_label(id))
            .map(|label| label.index())
            .collect()
    }

    /// The isotopologue ladder a complete cluster would cover.
    ///
    /// Without a known tracer atom count, the ladder runs up to the heaviest observed member.
    pub fn expected_isotopologues(&self) -> RangeInclusive<u32> {
        let top = match self.cluster.expected_tracer_atoms {
            Some(n) => n,
            None => self.isotopologues().into_iter().max().unwrap_or_default(),
        };
        0..=top
    }

    fn expected_len(&self) -> usize {
        let expected = self.expected_isotopologues();
        (*expected.end() - *expected.start()) as usize + 1
    }

    pub fn is_complete(&self) -> bool {
        self.len() == self.expected_len()
            && self.isotopologues().into_iter().eq(self.expected_isotopologues())
    }

    pub fn is_incomplete(&self) -> bool {
        let distinct: BTreeSet<u32> = self.isotopologues().into_iter().collect();
        self.len() < self.expected_len() || distinct.len() != self.expected_len()
    }

    pub fn is_duplicated(&self) -> bool {
        let isotopologues = self.isotopologues();
        let distinct: BTreeSet<u32> = isotopologues.iter().copied().collect();
        distinct.len() != isotopologues.len()
    }

    pub fn status(&self) -> ClusterStatus {
        ClusterStatus {
            complete: self.is_complete(),
            incomplete: self.is_incomplete(),
            duplicated: self.is_duplicated(),
        }
    }

    /// Expected isotopologues with no member carrying them
    pub fn missing_isotopologues(&self) -> Vec<u32> {
        let present: BTreeSet<u32> = self.isotopologues().into_iter().collect();
        self.expected_isotopologues()
            .filter(|i| !present.contains(i))
            .collect()
    }

    /// Isotopologues carried by more than one member, in increasing order
    pub fn duplicated_isotopologues(&self) -> Vec<u32> {
        let mut counts: BTreeMap<u32, usize> = BTreeMap::new();
        for i in self.isotopologues() {
            *counts.entry(i).or_default() += 1;
        }
        counts
            .into_iter()
            .filter(|(_, n)| *n > 1)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::feature::IsotopologueLabel;

    fn make_sample(points: &[(f64, f64, u32)]) -> (SampleFeatures, Cluster) {
        let mut features = SampleFeatures::new("S1");
        let id = ClusterId(0);
        let mut members = Vec::new();
        for (i, (mz, rt, iso)) in points.iter().enumerate() {
            let key = features.push(format!("F{i}"), *mz, *rt, None).unwrap();
            features
                .get_mut(key)
                .unwrap()
                .assign_cluster(id, IsotopologueLabel::from_index(*iso));
            members.push(key);
        }
        (features, Cluster::new(id, "S1", members))
    }

    #[test]
    fn test_bounds() {
        let (features, cluster) = make_sample(&[(100.0, 10.0, 0), (101.0, 10.5, 1), (102.0, 9.5, 2)]);
        let view = cluster.view(&features);
        assert_eq!(view.lowest_mz(), 100.0);
        assert_eq!(view.highest_mz(), 102.0);
        assert_eq!(view.lowest_rt(), 9.5);
        assert_eq!(view.highest_rt(), 10.5);
        assert!((view.mean_mz() - 101.0).abs() < 1e-12);
        assert!((view.mean_rt() - 10.0).abs() < 1e-12);
        assert_eq!(view.isotopologues(), vec![0, 1, 2]);
        assert!(view.is_complete());
        assert!(!view.is_incomplete());
        assert_eq!(view.status().to_string(), "Complete");
    }

    #[test]
    fn test_incomplete_duplicated() {
        let (features, cluster) = make_sample(&[(100.0, 10.0, 0), (102.0, 10.0, 2), (102.0001, 10.0, 2)]);
        let cluster = cluster.with_identity("Malate", 4);
        let view = cluster.view(&features);
        assert!(!view.is_complete());
        assert!(view.is_incomplete());
        assert!(view.is_duplicated());
        assert_eq!(view.missing_isotopologues(), vec![1, 3, 4]);
        assert_eq!(view.duplicated_isotopologues(), vec![2]);
        assert_eq!(
            view.status().to_string(),
            "Incomplete, Duplicated isotopologues"
        );
    }

    #[test]
    fn test_untargeted_ladder() {
        let (features, cluster) = make_sample(&[(100.0, 10.0, 0), (103.0, 10.0, 3)]);
        let view = cluster.view(&features);
        assert_eq!(view.expected_isotopologues(), 0..=3);
        assert_eq!(view.missing_isotopologues(), vec![1, 2]);
        assert!(view.duplicated_isotopologues().is_empty());
    }

    #[test]
    fn test_signature() {
        let (features, mut cluster) = make_sample(&[(102.0, 10.0, 2), (100.0, 10.0, 0)]);
        cluster.sort_members_by_mz(&features);
        assert_eq!(cluster.members(), &[FeatureKey(1), FeatureKey(0)]);
        assert_eq!(
            cluster.signature(),
            [FeatureKey(0), FeatureKey(1)].into_iter().collect()
        );
    }
}
