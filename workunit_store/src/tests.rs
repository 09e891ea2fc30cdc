// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use crate::{Level, Metric, ObservationMetric, WorkunitMetadata, WorkunitState, WorkunitStore};

#[test]
fn workunits_started_and_completed_appear_in_timeline() {
    let store = WorkunitStore::new(false, Level::Debug);

    let mut running = store.start_workunit(
        "iguana",
        Level::Info,
        None,
        Some(WorkunitMetadata {
            desc: Some("iguana description".to_string()),
            ..WorkunitMetadata::default()
        }),
    );

    let (started, completed) = store.latest_workunits(Level::Debug);
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].name, "iguana");
    assert!(matches!(started[0].state, WorkunitState::Started { .. }));
    assert!(completed.is_empty());

    running.complete();

    let (started, completed) = store.latest_workunits(Level::Debug);
    assert!(started.is_empty());
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].name, "iguana");
    assert!(completed[0].time_span().is_some());
}

#[test]
fn latest_workunits_drains() {
    let store = WorkunitStore::new(false, Level::Debug);
    store.start_workunit("once", Level::Info, None, None).complete();

    let (_, completed) = store.latest_workunits(Level::Debug);
    assert_eq!(completed.len(), 1);

    // A second poll returns nothing new.
    let (started, completed) = store.latest_workunits(Level::Debug);
    assert!(started.is_empty() && completed.is_empty());
}

#[test]
fn workunits_above_the_verbosity_threshold_are_filtered() {
    let store = WorkunitStore::new(false, Level::Trace);

    let _running = store.start_workunit("chameleon", Level::Trace, None, None);

    let (started, _) = store.latest_workunits(Level::Info);
    assert!(started.is_empty());
}

#[test]
fn nested_workunits_track_their_parents() {
    let store = WorkunitStore::new(false, Level::Debug);

    let outer = store.start_workunit("outer", Level::Info, None, None);
    let _inner = store.start_workunit("inner", Level::Info, Some(outer.span_id()), None);

    let (started, _) = store.latest_workunits(Level::Debug);
    assert_eq!(started.len(), 2);
    let inner = started.iter().find(|wu| wu.name == "inner").unwrap();
    assert_eq!(inner.parent_ids, vec![outer.span_id()]);
}

#[test]
fn dropping_a_running_workunit_cancels_it() {
    let store = WorkunitStore::new(false, Level::Debug);

    let running = store.start_workunit("doomed", Level::Info, None, None);
    std::mem::drop(running);

    let (started, completed) = store.latest_workunits(Level::Debug);
    assert_eq!(started.len(), 1);
    assert!(completed.is_empty());
}

#[test]
fn metadata_updates_are_reflected_at_completion() {
    let store = WorkunitStore::new(false, Level::Debug);

    let mut running = store.start_workunit(
        "renamed",
        Level::Debug,
        None,
        Some(WorkunitMetadata::default()),
    );
    running.update_metadata(|current| {
        current.map(|(metadata, _level)| {
            (
                WorkunitMetadata {
                    desc: Some("updated".to_owned()),
                    ..metadata
                },
                Level::Info,
            )
        })
    });
    running.complete();

    let (_, completed) = store.latest_workunits(Level::Debug);
    assert_eq!(completed[0].level, Level::Info);
    assert_eq!(
        completed[0].metadata.as_ref().unwrap().desc.as_deref(),
        Some("updated")
    );
}

#[test]
fn blocking_token_toggles_blocked_state() {
    let store = WorkunitStore::new(false, Level::Debug);
    let mut running = store.start_workunit("blocked", Level::Info, None, None);

    let (started, _) = store.latest_workunits(Level::Debug);
    let token = running.blocking();
    assert!(started[0].state.blocked());
    std::mem::drop(token);
    assert!(!started[0].state.blocked());
}

#[test]
fn counters_accumulate() {
    let store = WorkunitStore::new(false, Level::Debug);
    store.increment_counter(Metric::LocalCacheRequests, 1);
    store.increment_counter(Metric::LocalCacheRequests, 2);

    let metrics = store.get_metrics();
    assert_eq!(metrics.get("local_cache_requests"), Some(&3));
}

#[test]
fn observations_summarize() {
    let store = WorkunitStore::new(false, Level::Debug);
    store.record_observation(ObservationMetric::LocalStoreReadBlobSize, 4);
    store.record_observation(ObservationMetric::LocalStoreReadBlobSize, 10);
    store.record_observation(ObservationMetric::LocalStoreReadBlobSize, 2);

    let observations = store.get_observations();
    let summary = observations.get("local_store_read_blob_size").unwrap();
    assert_eq!((summary.count, summary.sum, summary.max), (3, 16, 10));
}
