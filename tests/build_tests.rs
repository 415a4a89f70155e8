mod common;

use chrono::Duration;
use common::{build, chunk_files, dataset_path, dates, groups, initialise, SyntheticInput, FREQUENCY};
use dataset_builder::check::ValuesPolicy;
use dataset_builder::loaders::{build_state, BuildState};
use dataset_builder::prelude::*;
use std::sync::Arc;
use tempfile::tempdir;

/// Initialise, then load every part at the same time, each in its own task and session
async fn build_concurrently(path: &str, config: LoaderConfig, groups: Groups, parts: &[&str]) -> BuildSession<ZarrStore> {
    let input = SyntheticInput::new();
    initialise(path, &config, &groups, &input).await;
    let shared = Arc::new((config, groups, input));
    let tasks: Vec<_> = parts
        .iter()
        .map(|part| {
            let shared = Arc::clone(&shared);
            let path = path.to_string();
            let parts: Parts = part.parse().unwrap();
            tokio::spawn(async move {
                let (config, groups, input) = &*shared;
                let mut session = BuildSession::open(&path).unwrap();
                ContentLoader::new(config, groups, input, parts).load(&mut session).await
            })
        })
        .collect();
    for report in futures::future::join_all(tasks).await {
        report.unwrap().unwrap();
    }
    BuildSession::open(path).unwrap()
}

#[tokio::test]
async fn test_initialise_writes_metadata_and_empty_registry() {
    let dir = tempdir().unwrap();
    let path = dataset_path(dir.path(), "test.zarr");
    let mut config = LoaderConfig::default();
    config.licence = "CC-BY-4.0".to_string();
    config
        .force_metadata
        .insert("licence".to_string(), serde_json::json!("forced"));
    let mut session = initialise(&path, &config, &groups(), &SyntheticInput::new()).await;

    let meta = DatasetMetadata::read(&session.store).await.unwrap();
    assert_eq!(meta.shape, vec![8, 2, 2, 3]);
    assert_eq!(meta.variables, vec!["a", "b"]);
    assert_eq!(meta.dates, dates("2020-01-01", 8));
    assert_eq!(meta.statistics_start, meta.dates.first().copied());
    assert_eq!(meta.statistics_end, meta.dates.last().copied());

    let store = &session.store;
    assert_eq!(store.get_attribute("licence").await.unwrap().unwrap(), "forced");
    assert_eq!(store.get_attribute("frequency").await.unwrap().unwrap(), FREQUENCY);
    assert_eq!(store.get_attribute("resolution").await.unwrap().unwrap(), "o96");
    assert!(store.get_attribute("uuid").await.unwrap().is_some());
    assert_eq!(store.read_array("longitudes").await.unwrap().as_slice().unwrap(), &[0.0, 2.0, 4.0]);

    assert_eq!(session.registry.get_lengths().await.unwrap(), vec![3, 3, 2]);
    assert_eq!(session.registry.get_flags(true).await.unwrap(), vec![false; 3]);
    assert!(session.registry.has_event("init_finished").await.unwrap());
    assert!(session.statistics.exists());
    assert!(session.statistics.is_empty());
}

#[tokio::test]
async fn test_groups_must_align_with_date_chunks() {
    let dir = tempdir().unwrap();
    let input = SyntheticInput::new();
    let mut config = LoaderConfig::default();
    config.output.chunking.dates = 2;

    // Group 1 starts at row 3, inside the chunk of rows 2 and 3
    let path = dataset_path(dir.path(), "unaligned.zarr");
    let mut session = BuildSession::open(&path).unwrap();
    let result = DatasetInitialiser::new(&config, &groups(), &input)
        .initialise(&mut session, false)
        .await;
    assert!(matches!(result, Err(DatasetError::InvalidConfig(_))));
    assert_eq!(build_state(&mut session).await.unwrap(), BuildState::Uninitialized);

    let aligned = Groups::from_dates(dates("2020-01-01", 8), 4, Vec::new(), FREQUENCY).unwrap();
    let path = dataset_path(dir.path(), "aligned.zarr");
    let mut session = initialise(&path, &config, &aligned, &input).await;
    assert_eq!(build_state(&mut session).await.unwrap(), BuildState::Initialized);
    let meta = session.store.get_metadata("data").await.unwrap();
    assert_eq!(meta.chunks[0], 2);
}

#[tokio::test]
async fn test_registry_cannot_be_created_twice() {
    let dir = tempdir().unwrap();
    let path = dataset_path(dir.path(), "test.zarr");
    let groups = groups();
    let mut session = initialise(&path, &LoaderConfig::default(), &groups, &SyntheticInput::new()).await;

    let again = session.registry.create(&groups.lengths()).await;
    assert!(matches!(again, Err(DatasetError::RegistryExists { .. })));
}

#[tokio::test]
async fn test_build_state_follows_progress() {
    let dir = tempdir().unwrap();
    let path = dataset_path(dir.path(), "test.zarr");
    let config = LoaderConfig::default();
    let groups = groups();
    let input = SyntheticInput::new();

    let mut session = BuildSession::open(&path).unwrap();
    assert_eq!(build_state(&mut session).await.unwrap(), BuildState::Uninitialized);

    let mut session = initialise(&path, &config, &groups, &input).await;
    assert_eq!(build_state(&mut session).await.unwrap(), BuildState::Initialized);

    ContentLoader::new(&config, &groups, &input, "1/2".parse().unwrap())
        .load(&mut session)
        .await
        .unwrap();
    assert_eq!(build_state(&mut session).await.unwrap(), BuildState::Loading);

    ContentLoader::new(&config, &groups, &input, "2/2".parse().unwrap())
        .load(&mut session)
        .await
        .unwrap();
    assert_eq!(build_state(&mut session).await.unwrap(), BuildState::Loaded);
}

#[tokio::test]
async fn test_rerun_skips_built_groups_and_keeps_data() {
    let dir = tempdir().unwrap();
    let path = dataset_path(dir.path(), "test.zarr");
    let config = LoaderConfig::default();
    let groups = groups();
    let input = SyntheticInput::new();
    let mut session = initialise(&path, &config, &groups, &input).await;

    let loader = ContentLoader::new(&config, &groups, &input, Parts::All);
    let first = loader.load(&mut session).await.unwrap();
    assert_eq!(first.built, vec![0, 1, 2]);
    assert!(first.skipped.is_empty());
    let data = session.store.read_array("data").await.unwrap();
    let flags = session.registry.get_flags(true).await.unwrap();
    let chunks = chunk_files(&path, "data");
    assert_eq!(flags, vec![true; 3]);
    assert_eq!(chunks.len(), 8);
    assert_eq!(session.statistics.len(), 3);

    let mut session = BuildSession::open(&path).unwrap();
    let second = loader.load(&mut session).await.unwrap();
    assert!(second.built.is_empty());
    assert_eq!(second.skipped, vec![0, 1, 2]);
    assert_eq!(session.store.read_array("data").await.unwrap(), data);
    assert_eq!(session.registry.get_flags(true).await.unwrap(), flags);
    assert_eq!(chunk_files(&path, "data"), chunks);
    assert_eq!(session.statistics.len(), 3);

    // Row 4 is the second date of group 1
    let row = session.store.read_rows("data", &[4]).await.unwrap();
    let date = dates("2020-01-01", 8)[4];
    assert_eq!(row[[0, 1, 1, 2]], f64::from(input.value(&date, 1, 1, 2)));
}

#[tokio::test]
async fn test_workers_in_any_order_match_single_worker() {
    let dir = tempdir().unwrap();
    let config = LoaderConfig::default();
    let groups = Groups::from_dates(dates("2020-01-01", 8), 2, Vec::new(), FREQUENCY).unwrap();
    let input = SyntheticInput::new();

    let single = dataset_path(dir.path(), "single.zarr");
    let mut reference = build(&single, &config, &groups, &input, &["all"]).await;
    let expected_data = reference.store.read_array("data").await.unwrap();
    let adder = StatisticsAdder::new(StatisticsOutput::Log);
    let expected = adder.run(&mut reference).await.unwrap();
    assert_eq!(expected.count.to_vec(), vec![48, 48]);

    // Worker 1/2 owns groups {0, 1}, worker 2/2 owns {2, 3}
    let orders: [&[&str]; 3] = [&["1/2", "2/2"], &["2/2", "1/2"], &["3", "1", "4", "2"]];
    for (i, parts) in orders.iter().enumerate() {
        let path = dataset_path(dir.path(), &format!("split-{i}.zarr"));
        let mut session = build(&path, &config, &groups, &input, parts).await;
        assert_eq!(session.store.read_array("data").await.unwrap(), expected_data);
        assert_eq!(adder.run(&mut session).await.unwrap(), expected);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_workers_match_single_worker() {
    let dir = tempdir().unwrap();
    let adder = StatisticsAdder::new(StatisticsOutput::Log);
    let input = SyntheticInput::new();

    // Chunks of one date, then chunks of two dates shared by no two groups
    for (date_chunk, size) in [(1, 2), (2, 2), (2, 4)] {
        let mut config = LoaderConfig::default();
        config.output.chunking.dates = date_chunk;
        let groups = Groups::from_dates(dates("2020-01-01", 8), size, Vec::new(), FREQUENCY).unwrap();

        let single = dataset_path(dir.path(), &format!("single-{date_chunk}-{size}.zarr"));
        let mut reference = build(&single, &config, &groups, &input, &["all"]).await;
        let expected_data = reference.store.read_array("data").await.unwrap();
        let expected = adder.run(&mut reference).await.unwrap();

        let path = dataset_path(dir.path(), &format!("concurrent-{date_chunk}-{size}.zarr"));
        let mut session = build_concurrently(&path, config, groups, &["1/2", "2/2"]).await;
        assert_eq!(build_state(&mut session).await.unwrap(), BuildState::Loaded);
        assert_eq!(session.store.read_array("data").await.unwrap(), expected_data);
        assert_eq!(chunk_files(&path, "data"), chunk_files(&single, "data"));
        assert_eq!(adder.run(&mut session).await.unwrap(), expected);
    }
}

#[tokio::test]
async fn test_wrong_dates_from_input_fail_the_group() {
    let dir = tempdir().unwrap();
    let path = dataset_path(dir.path(), "test.zarr");
    let config = LoaderConfig::default();
    let groups = groups();
    let mut input = SyntheticInput::new();
    input.shift = Some(Duration::hours(FREQUENCY));
    let mut session = initialise(&path, &config, &groups, &input).await;

    let result = ContentLoader::new(&config, &groups, &input, Parts::All)
        .load(&mut session)
        .await;
    match result {
        Err(DatasetError::DatesMismatch { requested, returned, .. }) => {
            assert_eq!(requested, 3);
            assert_eq!(returned, 3);
        }
        other => panic!("expected a dates mismatch, got {other:?}"),
    }
    assert_eq!(session.registry.get_flags(true).await.unwrap(), vec![false; 3]);
    assert!(session.statistics.is_empty());
}

#[tokio::test]
async fn test_wrong_valid_datetimes_fail_the_group() {
    let dir = tempdir().unwrap();
    let path = dataset_path(dir.path(), "test.zarr");
    let config = LoaderConfig::default();
    let groups = groups();
    let mut input = SyntheticInput::new();
    input.valid_shift = Some(Duration::hours(FREQUENCY));
    let mut session = initialise(&path, &config, &groups, &input).await;

    let result = ContentLoader::new(&config, &groups, &input, Parts::All)
        .load(&mut session)
        .await;
    match result {
        Err(DatasetError::DatesMismatch { first_requested, first_returned, .. }) => {
            assert_eq!(first_requested, Some(dates("2020-01-01", 1)[0]));
            assert_eq!(first_returned, Some(dates("2020-01-01", 2)[1]));
        }
        other => panic!("expected a dates mismatch, got {other:?}"),
    }
    assert_eq!(session.registry.get_flags(true).await.unwrap(), vec![false; 3]);
    assert!(session.statistics.is_empty());
}

#[tokio::test]
async fn test_values_policy_controls_reporting() {
    let dir = tempdir().unwrap();
    let groups = groups();
    let input = SyntheticInput::new();

    let mut failures = Vec::new();
    for (name, policy) in [("fail.zarr", ValuesPolicy::Fail), ("collect.zarr", ValuesPolicy::Collect)] {
        let mut config = LoaderConfig::default();
        config.statistics.value_ranges.insert("a".to_string(), (0.0, 1.0));
        config.statistics.values_policy = policy;
        let path = dataset_path(dir.path(), name);
        let mut session = initialise(&path, &config, &groups, &input).await;

        match ContentLoader::new(&config, &groups, &input, Parts::All)
            .load(&mut session)
            .await
        {
            Err(DatasetError::DataValues { failures: found }) => failures.push(found.len()),
            other => panic!("expected a values failure, got {other:?}"),
        }
        assert!(!session.registry.get_flag(0).await.unwrap());
    }
    // One field of the first group, then variable 'a' on each of its three dates
    assert_eq!(failures, vec![1, 3]);
}

#[tokio::test]
async fn test_missing_dates_are_excluded_from_statistics() {
    let dir = tempdir().unwrap();
    let path = dataset_path(dir.path(), "test.zarr");
    let all = dates("2020-01-01", 8);
    let groups = Groups::from_dates(all.clone(), 3, vec![all[4]], FREQUENCY).unwrap();
    let mut input = SyntheticInput::new();
    input.missing = vec![all[4]];
    let config = LoaderConfig::default();

    let mut session = build(&path, &config, &groups, &input, &["all"]).await;
    assert!(session.store.read_rows("data", &[4]).await.unwrap().iter().all(|v| v.is_nan()));

    let summary = StatisticsAdder::new(StatisticsOutput::Dataset)
        .run(&mut session)
        .await
        .unwrap();
    assert_eq!(summary.count.to_vec(), vec![42, 42]);
    assert!(!summary.has_nans.iter().any(|&n| n));

    for v in 0..2 {
        let mut values = Vec::new();
        for date in all.iter().filter(|d| **d != all[4]) {
            for e in 0..2 {
                for g in 0..3 {
                    values.push(f64::from(input.value(date, v, e, g)));
                }
            }
        }
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        assert!((summary.mean[v] - mean).abs() < 1e-9);
        assert_eq!(summary.minimum[v], min);
    }
}
