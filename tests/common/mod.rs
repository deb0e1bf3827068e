#![allow(dead_code)]

use spindle::backend::memory::MemoryBackend;
use spindle::{ActivityRegistry, Client, Event, Worker, WorkerHandle, WorkerOptions, WorkflowRegistry};
use std::sync::Arc;
use std::time::Duration;

pub fn fast_worker_options() -> WorkerOptions {
    WorkerOptions {
        poll_interval: Duration::from_millis(2),
        ..WorkerOptions::default()
    }
}

pub fn start_worker(
    backend: Arc<MemoryBackend>,
    workflows: WorkflowRegistry,
    activities: ActivityRegistry,
) -> (WorkerHandle, Client) {
    let handle = Worker::new(backend.clone(), workflows, activities)
        .with_options(fast_worker_options())
        .start();
    (handle, Client::new(backend))
}

/// Committed sequence ids must form a dense increasing run from 1.
pub fn assert_sequence_dense(history: &[Event]) {
    for (i, ev) in history.iter().enumerate() {
        assert_eq!(
            ev.sequence_id,
            (i + 1) as u64,
            "event {i} has sequence id {} in {:?}",
            ev.sequence_id,
            ev.event_type()
        );
    }
}

/// Every response event must correlate to an earlier scheduling event of
/// the matching kind.
pub fn assert_response_correlation(history: &[Event]) {
    for (idx, ev) in history.iter().enumerate() {
        let Some(expected) = ev.event_type().scheduling_counterpart() else {
            continue;
        };
        let sid = ev
            .schedule_event_id
            .unwrap_or_else(|| panic!("{:?} without schedule_event_id", ev.event_type()));
        let found = history[..idx]
            .iter()
            .any(|e| e.event_type() == expected && e.schedule_event_id == Some(sid));
        assert!(
            found,
            "{:?} (schedule id {sid}) has no earlier {expected:?}",
            ev.event_type()
        );
    }
}

/// Exactly one terminal event, and it is the last committed event.
pub fn assert_single_terminal(history: &[Event]) {
    let terminals = history.iter().filter(|e| e.is_terminal()).count();
    assert_eq!(terminals, 1, "expected exactly one terminal event");
    assert!(
        history.last().is_some_and(Event::is_terminal),
        "terminal event must be the last committed event"
    );
}
