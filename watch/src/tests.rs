// Copyright 2024 Pants project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use fs::GitignoreStyleExcludes;
use notify::event::{CreateKind, Event, EventKind};
use parking_lot::Mutex;

use crate::{Invalidatable, InvalidationWatcher};

struct RecordingInvalidatable {
    invalidations: Mutex<Vec<HashSet<PathBuf>>>,
}

impl Invalidatable for RecordingInvalidatable {
    fn invalidate(&self, paths: &HashSet<PathBuf>, _caller: &str) -> usize {
        self.invalidations.lock().push(paths.clone());
        paths.len()
    }
}

fn setup(
    ignorer: Arc<GitignoreStyleExcludes>,
    build_root: PathBuf,
) -> (
    Arc<RecordingInvalidatable>,
    Sender<notify::Result<Event>>,
    crossbeam_channel::Receiver<String>,
) {
    let invalidatable = Arc::new(RecordingInvalidatable {
        invalidations: Mutex::default(),
    });
    let (event_sender, event_receiver) = crossbeam_channel::unbounded();
    let (liveness_sender, liveness_receiver) = crossbeam_channel::unbounded();
    InvalidationWatcher::start_background_thread(
        Arc::downgrade(&invalidatable),
        ignorer,
        build_root,
        liveness_sender,
        event_receiver,
    );
    (invalidatable, event_sender, liveness_receiver)
}

fn file_created_event(path: PathBuf) -> notify::Result<Event> {
    Ok(Event::new(EventKind::Create(CreateKind::File)).add_path(path))
}

fn wait_for_invalidations(invalidatable: &RecordingInvalidatable) -> Vec<HashSet<PathBuf>> {
    for _ in 0..100 {
        {
            let invalidations = invalidatable.invalidations.lock();
            if !invalidations.is_empty() {
                return invalidations.clone();
            }
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    invalidatable.invalidations.lock().clone()
}

#[test]
fn events_are_relativized_and_include_parents() {
    let build_root = PathBuf::from("/the/build/root");
    let (invalidatable, event_sender, _liveness) =
        setup(GitignoreStyleExcludes::empty(), build_root.clone());

    event_sender
        .send(file_created_event(build_root.join("src/lib.rs")))
        .unwrap();

    let invalidations = wait_for_invalidations(&invalidatable);
    assert_eq!(invalidations.len(), 1);
    let expected: HashSet<PathBuf> =
        vec![PathBuf::from("src"), PathBuf::from("src/lib.rs")].into_iter().collect();
    assert_eq!(invalidations[0], expected);
}

#[test]
fn ignored_paths_produce_no_invalidations() {
    let build_root = PathBuf::from("/the/build/root");
    let ignorer = GitignoreStyleExcludes::create(vec!["*.pyc".to_owned()]).unwrap();
    let (invalidatable, event_sender, _liveness) = setup(ignorer, build_root.clone());

    event_sender
        .send(file_created_event(build_root.join("a/b.pyc")))
        .unwrap();

    // Allow the event to be processed, and confirm that no invalidation arrived.
    std::thread::sleep(Duration::from_millis(100));
    assert!(invalidatable.invalidations.lock().is_empty());
}

#[test]
fn watcher_thread_exits_when_invalidatable_is_dropped() {
    let build_root = PathBuf::from("/the/build/root");
    let (invalidatable, _event_sender, liveness) =
        setup(GitignoreStyleExcludes::empty(), build_root);

    std::mem::drop(invalidatable);
    let exit_msg = liveness
        .recv_timeout(Duration::from_secs(5))
        .expect("Expected the background thread to exit");
    assert!(exit_msg.contains("shut down"), "Got: {exit_msg}");
}

#[test]
fn watch_error_is_reported_via_liveness() {
    let build_root = PathBuf::from("/the/build/root");
    let (_invalidatable, event_sender, liveness) =
        setup(GitignoreStyleExcludes::empty(), build_root);

    event_sender
        .send(Err(notify::Error::generic("boom")))
        .unwrap();
    let exit_msg = liveness
        .recv_timeout(Duration::from_secs(5))
        .expect("Expected the background thread to exit");
    assert!(exit_msg.contains("boom"), "Got: {exit_msg}");
}
