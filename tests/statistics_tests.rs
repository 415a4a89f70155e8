mod common;

use common::{build, dataset_path, groups, SyntheticInput};
use dataset_builder::loaders::tmp_data_dir;
use dataset_builder::prelude::*;
use tempfile::tempdir;

fn close(a: f64, b: f64) -> bool {
    (a - b).abs() <= 1e-9 * b.abs().max(1.0)
}

#[tokio::test]
async fn test_statistics_need_a_complete_build() {
    let dir = tempdir().unwrap();
    let path = dataset_path(dir.path(), "test.zarr");
    let mut session = build(&path, &LoaderConfig::default(), &groups(), &SyntheticInput::new(), &["1/2"]).await;

    let result = StatisticsAdder::new(StatisticsOutput::Dataset).run(&mut session).await;
    assert!(matches!(result, Err(DatasetError::NotFullyBuilt { .. })));
    assert!(!session.store.has_array("mean").await);
}

#[tokio::test]
async fn test_statistics_are_written_into_dataset() {
    let dir = tempdir().unwrap();
    let path = dataset_path(dir.path(), "test.zarr");
    let mut session = build(&path, &LoaderConfig::default(), &groups(), &SyntheticInput::new(), &["all"]).await;

    let summary = StatisticsAdder::new(StatisticsOutput::Dataset)
        .run(&mut session)
        .await
        .unwrap();
    let stored = Summary::read_from_store(&session.store, None, &summary.variables)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, summary);
    assert!(session.registry.has_event("compute_statistics_end").await.unwrap());

    // Variable 'b' is variable 'a' shifted by ten
    assert!(close(summary.mean[1] - summary.mean[0], 10.0));
    assert!(close(summary.stdev[1], summary.stdev[0]));
    assert_eq!(summary.maximum[1] - summary.maximum[0], 10.0);
}

#[tokio::test]
async fn test_user_bounds_cannot_go_into_dataset() {
    let dir = tempdir().unwrap();
    let path = dataset_path(dir.path(), "test.zarr");
    let mut session = build(&path, &LoaderConfig::default(), &groups(), &SyntheticInput::new(), &["all"]).await;

    let result = StatisticsAdder::new(StatisticsOutput::Dataset)
        .with_bounds(Some("2020-01-02".to_string()), None)
        .run(&mut session)
        .await;
    assert!(matches!(result, Err(DatasetError::InvalidConfig(_))));
}

#[tokio::test]
async fn test_statistics_to_json_file() {
    let dir = tempdir().unwrap();
    let path = dataset_path(dir.path(), "test.zarr");
    let mut session = build(&path, &LoaderConfig::default(), &groups(), &SyntheticInput::new(), &["all"]).await;

    let file = dir.path().join("stats.json");
    let summary = StatisticsAdder::new(StatisticsOutput::File(file.clone()))
        .run(&mut session)
        .await
        .unwrap();
    let loaded = Summary::load(&file).unwrap();
    assert_eq!(loaded.variables, summary.variables);
    assert_eq!(loaded.count, summary.count);
    for v in 0..2 {
        assert!(close(loaded.mean[v], summary.mean[v]));
        assert!(close(loaded.stdev[v], summary.stdev[v]));
    }
    assert!(!session.store.has_array("mean").await);
}

#[tokio::test]
async fn test_end_bound_comes_from_end_date() {
    let dir = tempdir().unwrap();
    let path = dataset_path(dir.path(), "test.zarr");
    let mut session = build(&path, &LoaderConfig::default(), &groups(), &SyntheticInput::new(), &["all"]).await;
    let bounds = (Some("2020-01-01".to_string()), Some("2020-01-02".to_string()));

    let end = StatisticsAdder::new(StatisticsOutput::Log).with_bounds(bounds.0.clone(), bounds.1.clone());
    let summary = end.run(&mut session).await.unwrap();
    assert_eq!(summary.count.to_vec(), vec![48, 48]);

    let start = StatisticsAdder::new(StatisticsOutput::Log)
        .with_bounds(bounds.0, bounds.1)
        .with_end_bound_source(EndBoundSource::Start);
    let summary = start.run(&mut session).await.unwrap();
    assert_eq!(summary.count.to_vec(), vec![24, 24]);
}

#[tokio::test]
async fn test_additions_match_build_statistics() {
    let dir = tempdir().unwrap();
    let path = dataset_path(dir.path(), "test.zarr");
    let mut session = build(&path, &LoaderConfig::default(), &groups(), &SyntheticInput::new(), &["all"]).await;
    let statistics = StatisticsAdder::new(StatisticsOutput::Dataset)
        .run(&mut session)
        .await
        .unwrap();

    let additions = AdditionsLoader::open(&path, "extra").unwrap();
    additions.initialise().await.unwrap();
    let first = additions.run(&"2/2".parse().unwrap()).await.unwrap();
    let second = additions.run(&"1/2".parse().unwrap()).await.unwrap();
    assert_eq!(first.built, vec![4, 5, 6, 7]);
    assert_eq!(second.built, vec![0, 1, 2, 3]);

    let summary = additions.finalise().await.unwrap();
    assert_eq!(summary.count, statistics.count);
    for v in 0..2 {
        assert!(close(summary.mean[v], statistics.mean[v]));
        assert!(close(summary.stdev[v], statistics.stdev[v]));
        assert_eq!(summary.minimum[v], statistics.minimum[v]);
    }
    let stored = Summary::read_from_store(&session.store, Some("extra"), &summary.variables)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored, summary);
    assert!(!tmp_data_dir(&path).join("extra").exists());
}

#[tokio::test]
async fn test_additions_cover_missing_dates() {
    let dir = tempdir().unwrap();
    let path = dataset_path(dir.path(), "test.zarr");
    let all = common::dates("2020-01-01", 8);
    let groups = Groups::from_dates(all.clone(), 3, vec![all[2]], common::FREQUENCY).unwrap();
    let mut input = SyntheticInput::new();
    input.missing = vec![all[2]];
    let mut session = build(&path, &LoaderConfig::default(), &groups, &input, &["all"]).await;
    let statistics = StatisticsAdder::new(StatisticsOutput::Dataset)
        .run(&mut session)
        .await
        .unwrap();

    let additions = AdditionsLoader::open(&path, "extra").unwrap();
    additions.initialise().await.unwrap();
    let report = additions.run(&Parts::All).await.unwrap();
    assert_eq!(report.built, (0..8).collect::<Vec<_>>());
    let summary = additions.finalise().await.unwrap();
    assert_eq!(summary.count.to_vec(), vec![42, 42]);
    assert!(close(summary.mean[0], statistics.mean[0]));
}

#[tokio::test]
async fn test_additions_detect_inconsistent_statistics() {
    let dir = tempdir().unwrap();
    let path = dataset_path(dir.path(), "test.zarr");
    let mut session = build(&path, &LoaderConfig::default(), &groups(), &SyntheticInput::new(), &["all"]).await;
    let mut statistics = StatisticsAdder::new(StatisticsOutput::Dataset)
        .run(&mut session)
        .await
        .unwrap();
    statistics.mean[0] += 1.0;
    statistics.write_to_store(&session.store, None).await.unwrap();

    let additions = AdditionsLoader::open(&path, "extra").unwrap();
    additions.initialise().await.unwrap();
    additions.run(&Parts::All).await.unwrap();
    match additions.finalise().await {
        Err(DatasetError::StatisticsMismatch { field, variable, .. }) => {
            assert_eq!(field, "mean");
            assert_eq!(variable, "a");
        }
        other => panic!("expected a statistics mismatch, got {other:?}"),
    }
    assert!(!session.store.has_array("extra_mean").await);
}
