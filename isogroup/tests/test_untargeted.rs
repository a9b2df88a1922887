use std::collections::BTreeSet;

use isogroup::{
    ClusterId, ClusteringError, ClusteringParams, IsotopologueLabel, KeepPolicy, SampleFeatures,
    TracerSpec, TracingObserver, UntargetedExperiment,
};

mod common;

fn member_ids(features: &SampleFeatures, members: &[isogroup::FeatureKey]) -> Vec<String> {
    members
        .iter()
        .map(|k| features[*k].feature_id().to_string())
        .collect()
}

fn make_experiment(rt_window: f64, ppm: f64) -> UntargetedExperiment<TracingObserver> {
    let dataset = common::make_dataset();
    let tracer = TracerSpec::parse("13C").unwrap();
    UntargetedExperiment::new(&dataset, tracer, ClusteringParams::new(rt_window, ppm, None))
        .unwrap()
        .with_observer(TracingObserver)
}

#[test_log::test]
fn test_build_clusters() -> Result<(), ClusteringError> {
    let mut experiment = make_experiment(15.0, 5.0);
    let clusters = experiment.build_clusters()?;
    assert_eq!(clusters.len(), 2);
    for sample_clusters in clusters.values() {
        assert_eq!(sample_clusters.len(), 7);
    }

    let features = experiment.sample("Sample_1").unwrap();
    let clusters = &experiment.clusters().unwrap()["Sample_1"];
    assert_eq!(
        member_ids(features, clusters[&ClusterId(0)].members()),
        vec!["F1", "F2"]
    );
    assert_eq!(
        member_ids(features, clusters[&ClusterId(2)].members()),
        vec!["F9", "F8", "F7", "F6", "F5"]
    );

    let f7 = features.find("F7").unwrap();
    assert_eq!(features[f7].cluster_membership().len(), 5);
    Ok(())
}

#[test_log::test]
fn test_build_final_clusters() -> Result<(), ClusteringError> {
    for keep in [
        KeepPolicy::None,
        KeepPolicy::Longest,
        KeepPolicy::ClosestMz,
        KeepPolicy::Both,
    ] {
        let mut experiment = make_experiment(15.0, 5.0);
        let summary = *experiment.build_final_clusters(keep)?;
        assert_eq!(summary.samples, 2);
        assert_eq!(summary.clusters_built, 14);
        assert_eq!(summary.clusters_merged, 10);
        assert_eq!(summary.subsets_removed, 0);
        assert_eq!(summary.candidates_dropped, 0);
        assert_eq!(summary.final_clusters, 4);
        assert_eq!(summary.unclustered_features, 4);

        for (name, sample_clusters) in experiment.clusters().unwrap() {
            let features = experiment.sample(name).unwrap();
            assert_eq!(sample_clusters.len(), 2);
            let c0 = &sample_clusters[&ClusterId(0)];
            let c1 = &sample_clusters[&ClusterId(1)];
            assert_eq!(member_ids(features, c0.members()), vec!["F1", "F2"]);
            assert_eq!(
                member_ids(features, c1.members()),
                vec!["F9", "F8", "F7", "F6", "F5"]
            );

            let labels: Vec<String> = c1
                .members()
                .iter()
                .map(|k| features[*k].isotopologue_label(ClusterId(1)).unwrap().to_string())
                .collect();
            assert_eq!(labels, vec!["Mx", "M+1", "M+2", "M+3", "M+4"]);

            let view = c1.view(features);
            assert!(view.is_complete());
            assert_eq!(view.lowest_mz(), 133.0140851);
            assert_eq!(view.highest_rt(), 676.8952154);

            let unclustered: BTreeSet<String> = experiment
                .unclustered(name)
                .iter()
                .map(|k| features[*k].feature_id().to_string())
                .collect();
            assert_eq!(
                unclustered,
                ["F3", "F4"].into_iter().map(String::from).collect::<BTreeSet<_>>()
            );

            let f1 = features.find("F1").unwrap();
            assert_eq!(
                features[f1].isotopologue_label(ClusterId(0)),
                Some(IsotopologueLabel::Unshifted)
            );
            assert_eq!(features[f1].cluster_membership().len(), 1);
        }
    }
    Ok(())
}

#[test]
fn test_tight_tolerances() -> Result<(), ClusteringError> {
    let mut experiment = make_experiment(0.01, 0.01);
    let summary = *experiment.build_final_clusters(KeepPolicy::Both)?;
    assert_eq!(summary.clusters_built, 0);
    assert_eq!(summary.final_clusters, 0);
    assert_eq!(summary.unclustered_features, 18);
    assert_eq!(experiment.unclustered("Sample_2").len(), 9);
    Ok(())
}

#[test]
fn test_rebuild_resets_membership() -> Result<(), ClusteringError> {
    let mut experiment = make_experiment(15.0, 5.0);
    experiment.build_final_clusters(KeepPolicy::Longest)?;
    experiment.build_clusters()?;
    let features = experiment.sample("Sample_1").unwrap();
    let f1 = features.find("F1").unwrap();
    assert_eq!(
        features[f1].cluster_membership().iter().copied().collect::<Vec<_>>(),
        vec![ClusterId(0), ClusterId(1)]
    );
    Ok(())
}
