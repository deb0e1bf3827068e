//! Determinism properties: a history produced by one run must replay to
//! the same state with no new commands, side effects must be stable, and
//! committed histories must satisfy the sequence and correlation
//! invariants.

use futures::future::{Either, join3, select};
use spindle::backend::memory::MemoryBackend;
use spindle::payload::to_payload;
use spindle::{
    ActivityContext, ActivityRegistry, Backend, Event, EventAttributes, EventType, Metadata, WorkflowContext,
    WorkflowError, WorkflowExecutor, WorkflowInstance, WorkflowRegistry, WorkflowTask,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod common;

fn empty_task(instance: &WorkflowInstance, last_sequence_id: u64) -> WorkflowTask {
    WorkflowTask {
        token: String::new(),
        instance: instance.clone(),
        last_sequence_id,
        new_events: Vec::new(),
        lease_timeout: Duration::from_secs(30),
    }
}

fn composite_workflows() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register("Composite", |ctx: WorkflowContext, start: i64| async move {
            let activity = ctx.schedule_activity::<_, i64>("Increment", &start);
            let timer = ctx.timer(Duration::from_millis(5));
            let signal = ctx.wait_signal::<String>("go");
            let (a, t, s) = join3(activity, timer, signal).await;
            let incremented = a?;
            t?;
            let payload = s?;
            ctx.schedule_activity::<_, String>("Echo", &format!("{incremented}-{payload}"))
                .await
        })
        .build()
}

fn composite_activities() -> ActivityRegistry {
    ActivityRegistry::builder()
        .register("Increment", |_ctx: ActivityContext, n: i64| async move {
            Ok::<_, WorkflowError>(n + 1)
        })
        .register("Echo", |_ctx: ActivityContext, s: String| async move {
            Ok::<_, WorkflowError>(format!("{s}!"))
        })
        .build()
}

#[tokio::test]
async fn workflow_replays_without_new_commands_or_events() {
    let backend = Arc::new(MemoryBackend::new());
    let workflows = composite_workflows();
    let (worker, client) = common::start_worker(backend.clone(), workflows.clone(), composite_activities());

    let instance = client
        .create_workflow_instance("det-1", "Composite", &1i64)
        .await
        .unwrap();
    client.signal_workflow("det-1", "go", &"ok").await.unwrap();
    let result: String = client.get_workflow_result(&instance, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result, "2-ok!");
    worker.shutdown().await;

    let history = backend.get_workflow_instance_history(&instance, None).await.unwrap();
    common::assert_sequence_dense(&history);
    common::assert_response_correlation(&history);
    common::assert_single_terminal(&history);

    // Re-execute against the produced history with no new events: a clean
    // replay yields no commands and no events.
    let mut executor = WorkflowExecutor::new(workflows, backend.converter(), instance.clone());
    executor.replay(&history).expect("replay must be deterministic");
    let result = executor
        .execute_task(&empty_task(&instance, history.len() as u64))
        .expect("re-execution succeeds");
    assert!(result.executed_events.is_empty(), "replay must not emit events");
    assert!(result.activity_messages.is_empty());
    assert!(result.timer_messages.is_empty());
    assert!(result.instance_messages.is_empty());
}

#[tokio::test]
async fn first_turn_commands_are_ordered_and_dense() {
    let backend = Arc::new(MemoryBackend::new());
    let converter = backend.converter();
    let instance = WorkflowInstance::new("det-order");
    let start = Event::new_pending(
        0,
        EventAttributes::WorkflowExecutionStarted {
            name: "Composite".into(),
            input: to_payload(converter.as_ref(), &7i64).unwrap(),
            metadata: Metadata::default(),
            parent: None,
        },
    );
    let task = WorkflowTask {
        token: String::new(),
        instance: instance.clone(),
        last_sequence_id: 0,
        new_events: vec![start],
        lease_timeout: Duration::from_secs(30),
    };

    let mut executor = WorkflowExecutor::new(composite_workflows(), converter, instance);
    let result = executor.execute_task(&task).unwrap();

    let kinds: Vec<EventType> = result.executed_events.iter().map(Event::event_type).collect();
    assert_eq!(
        kinds,
        vec![
            EventType::WorkflowExecutionStarted,
            EventType::WorkflowTaskStarted,
            EventType::ActivityScheduled,
            EventType::TimerScheduled,
        ],
        "commands must be recorded in declaration order"
    );
    assert_eq!(result.executed_events[2].schedule_event_id, Some(1));
    assert_eq!(result.executed_events[3].schedule_event_id, Some(2));
    common::assert_sequence_dense(&result.executed_events);
    assert_eq!(result.activity_messages.len(), 1);
    assert_eq!(result.timer_messages.len(), 1);
}

#[tokio::test]
async fn side_effect_values_are_recorded_and_stable() {
    let backend = Arc::new(MemoryBackend::new());
    let observed: Arc<Mutex<Vec<u64>>> = Arc::new(Mutex::new(Vec::new()));
    let observed_by_activity = observed.clone();
    let activities = ActivityRegistry::builder()
        .register("Record", move |_ctx: ActivityContext, n: u64| {
            let observed = observed_by_activity.clone();
            async move {
                observed.lock().unwrap().push(n);
                Ok::<_, WorkflowError>(n)
            }
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("Lucky", |ctx: WorkflowContext, _input: ()| async move {
            let drawn: u64 = ctx.side_effect(rand::random::<u64>)?;
            ctx.schedule_activity::<_, u64>("Record", &drawn).await
        })
        .build();
    let (worker, client) = common::start_worker(backend.clone(), workflows.clone(), activities);

    let instance = client.create_workflow_instance("det-se", "Lucky", &()).await.unwrap();
    let result: u64 = client.get_workflow_result(&instance, Duration::from_secs(5)).await.unwrap();
    worker.shutdown().await;
    assert_eq!(observed.lock().unwrap().as_slice(), &[result]);

    let history = backend.get_workflow_instance_history(&instance, None).await.unwrap();
    assert!(
        history
            .iter()
            .any(|e| e.event_type() == EventType::SideEffectResult)
    );

    // Replaying returns the recorded value: no new events, and the
    // recording lambda does not run again.
    let mut executor = WorkflowExecutor::new(workflows, backend.converter(), instance.clone());
    executor.replay(&history).expect("side effect replay");
    let replayed = executor
        .execute_task(&empty_task(&instance, history.len() as u64))
        .unwrap();
    assert!(replayed.executed_events.is_empty());
    assert_eq!(observed.lock().unwrap().len(), 1, "side effect must not re-run");
}

#[tokio::test]
async fn select_resolution_follows_history_order() {
    let backend = Arc::new(MemoryBackend::new());
    let workflows = WorkflowRegistry::builder()
        .register("Race", |ctx: WorkflowContext, _input: ()| async move {
            let timer = ctx.timer(Duration::from_secs(60));
            let signal = ctx.wait_signal::<String>("go");
            match select(timer, signal).await {
                Either::Left((fired, _)) => {
                    fired?;
                    Ok::<_, WorkflowError>("timer".to_string())
                }
                Either::Right((payload, _)) => {
                    payload?;
                    Ok::<_, WorkflowError>("signal".to_string())
                }
            }
        })
        .build();
    let (worker, client) = common::start_worker(backend.clone(), workflows.clone(), ActivityRegistry::default());

    let instance = client.create_workflow_instance("det-race", "Race", &()).await.unwrap();
    client.signal_workflow("det-race", "go", &"now").await.unwrap();
    let winner: String = client.get_workflow_result(&instance, Duration::from_secs(5)).await.unwrap();
    assert_eq!(winner, "signal");
    worker.shutdown().await;

    let history = backend.get_workflow_instance_history(&instance, None).await.unwrap();
    common::assert_single_terminal(&history);

    // The losing timer stays unresolved past termination; replay is still
    // clean because its scheduling event matches the re-created command.
    let mut executor = WorkflowExecutor::new(workflows, backend.converter(), instance.clone());
    executor.replay(&history).expect("race replay");
    let replayed = executor
        .execute_task(&empty_task(&instance, history.len() as u64))
        .unwrap();
    assert!(replayed.executed_events.is_empty());
}
