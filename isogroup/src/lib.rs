//! `isogroup` groups the features of isotope-tracing mass spectrometry experiments into
//! clusters of isotopologues of the same labeled molecule.
//!
//! Untargeted grouping is done by [`ClusteringEngine`], which searches each sample for
//! features whose m/z differ by whole multiples of the tracer mass shift within a
//! retention time window, then resolves the resulting overlapping clusters. Targeted
//! grouping matches features against a [`Database`] of known metabolites instead.
//!
//! ```rust
//! use isogroup::{Dataset, DatasetRow, KeepPolicy, ClusteringParams, TracerSpec, UntargetedExperiment};
//!
//! let mut dataset = Dataset::new(vec!["Sample_1".to_string()]);
//! dataset.push(DatasetRow::new("F1", 100.0, 10.0, vec![Some(1e6)])).unwrap();
//! dataset.push(DatasetRow::new("F2", 101.00336, 10.05, vec![Some(5e5)])).unwrap();
//!
//! let tracer = TracerSpec::parse("13C").unwrap();
//! let mut experiment = UntargetedExperiment::new(&dataset, tracer, ClusteringParams::new(0.2, 5.0, None)).unwrap();
//! let summary = experiment.build_final_clusters(KeepPolicy::Longest).unwrap();
//! assert_eq!(summary.final_clusters, 1);
//! ```
pub mod cluster;
pub mod engine;
pub mod experiment;
pub mod feature;
pub mod isotopes;
pub mod targeted;
pub mod tracer;

pub use crate::cluster::{Cluster, ClusterStatus, ClusterView};
pub use crate::engine::{
    CancellationToken, ClusterMap, ClusteringEngine, ClusteringError, ClusteringObserver,
    ClusteringParams, ClusteringSummary, Deduplicated, DeduplicatedSample, KeepPolicy,
    SampleClusters, SampleMap, TracingObserver,
};
pub use crate::experiment::{
    Dataset, DatasetError, DatasetRow, TargetedExperiment, UntargetedExperiment,
};
pub use crate::feature::{
    ClusterId, Feature, FeatureError, FeatureKey, IsotopologueLabel, SampleFeatures,
};
pub use crate::isotopes::{default_isotope_table, IsotopeTable, PeriodicTable, PERIODIC_TABLE};
pub use crate::targeted::{
    ChemicalFormula, Database, MetaboliteEntry, TargetedAnnotation, TargetedAnnotator,
    TargetedError, TargetedParams, TheoreticalFeature,
};
pub use crate::tracer::{TracerError, TracerSpec};
