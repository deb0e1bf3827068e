//! End-to-end scenarios driven through the client, the in-memory backend,
//! and a full worker: the places where all the moving parts have to agree.

use spindle::backend::memory::MemoryBackend;
use spindle::{
    ActivityContext, ActivityRegistry, Backend, ClientError, Event, EventType, RetryPolicy, SubWorkflowOptions,
    WorkflowContext, WorkflowError, WorkflowRegistry, WorkflowState,
};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

mod common;

/// Single activity happy path: `Add(2, 3)` with the exact committed
/// history shape.
#[tokio::test]
async fn single_activity_happy_path() {
    let backend = Arc::new(MemoryBackend::new());
    let activities = ActivityRegistry::builder()
        .register("Add", |_ctx: ActivityContext, (a, b): (i64, i64)| async move {
            Ok::<_, WorkflowError>(a + b)
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("Adder", |ctx: WorkflowContext, input: (i64, i64)| async move {
            ctx.schedule_activity::<_, i64>("Add", &input).await
        })
        .build();
    let (worker, client) = common::start_worker(backend.clone(), workflows, activities);

    let instance = client
        .create_workflow_instance("add-1", "Adder", &(2i64, 3i64))
        .await
        .unwrap();
    let result: i64 = client.get_workflow_result(&instance, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result, 5);
    worker.shutdown().await;

    let history = backend.get_workflow_instance_history(&instance, None).await.unwrap();
    let kinds: Vec<EventType> = history.iter().map(Event::event_type).collect();
    assert_eq!(
        kinds,
        vec![
            EventType::WorkflowExecutionStarted,
            EventType::WorkflowTaskStarted,
            EventType::ActivityScheduled,
            EventType::ActivityCompleted,
            EventType::WorkflowTaskStarted,
            EventType::WorkflowExecutionFinished,
        ]
    );
    assert_eq!(history[2].schedule_event_id, Some(1));
    assert_eq!(history[3].schedule_event_id, Some(1));
    common::assert_sequence_dense(&history);
    common::assert_response_correlation(&history);
    common::assert_single_terminal(&history);
}

/// Timer scenario: sleep 50 ms, return "ok", and take at least that long.
#[tokio::test]
async fn timer_fires_after_delay() {
    let backend = Arc::new(MemoryBackend::new());
    let workflows = WorkflowRegistry::builder()
        .register("Sleeper", |ctx: WorkflowContext, _input: ()| async move {
            ctx.timer(Duration::from_millis(50)).await?;
            Ok::<_, WorkflowError>("ok".to_string())
        })
        .build();
    let (worker, client) = common::start_worker(backend.clone(), workflows, ActivityRegistry::default());

    let started = Instant::now();
    let instance = client.create_workflow_instance("timer-1", "Sleeper", &()).await.unwrap();
    let result: String = client.get_workflow_result(&instance, Duration::from_secs(5)).await.unwrap();
    let elapsed = started.elapsed();
    assert_eq!(result, "ok");
    assert!(elapsed >= Duration::from_millis(50), "completed after {elapsed:?}");
    worker.shutdown().await;

    let history = backend.get_workflow_instance_history(&instance, None).await.unwrap();
    let kinds: Vec<EventType> = history.iter().map(Event::event_type).collect();
    assert!(kinds.contains(&EventType::TimerScheduled));
    assert!(kinds.contains(&EventType::TimerFired));
    common::assert_response_correlation(&history);
}

/// Signal-driven workflow: return the payload of the "go" signal.
#[tokio::test]
async fn signal_resolves_waiting_workflow() {
    let backend = Arc::new(MemoryBackend::new());
    let workflows = WorkflowRegistry::builder()
        .register("WaitGo", |ctx: WorkflowContext, _input: ()| async move {
            ctx.wait_signal::<String>("go").await
        })
        .build();
    let (worker, client) = common::start_worker(backend.clone(), workflows, ActivityRegistry::default());

    let instance = client.create_workflow_instance("sig-1", "WaitGo", &()).await.unwrap();
    client.signal_workflow("sig-1", "go", &"hi").await.unwrap();
    let result: String = client.get_workflow_result(&instance, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result, "hi");
    worker.shutdown().await;

    let history = backend.get_workflow_instance_history(&instance, None).await.unwrap();
    assert!(
        history
            .iter()
            .any(|e| e.event_type() == EventType::SignalReceived)
    );
}

/// Activity failure with retry: two retryable failures, then success.
#[tokio::test]
async fn activity_retries_until_success() {
    let backend = Arc::new(MemoryBackend::new());
    let attempts = Arc::new(Mutex::new(0u32));
    let attempts_in_activity = attempts.clone();
    let activities = ActivityRegistry::builder()
        .register("Flaky", move |_ctx: ActivityContext, _input: ()| {
            let attempts = attempts_in_activity.clone();
            async move {
                let mut guard = attempts.lock().unwrap();
                *guard += 1;
                if *guard <= 2 {
                    Err(WorkflowError::application(format!("attempt {} failed", *guard)))
                } else {
                    Ok("done".to_string())
                }
            }
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("Retrier", |ctx: WorkflowContext, _input: ()| async move {
            let policy = RetryPolicy {
                max_attempts: 3,
                initial_interval: Duration::from_millis(1),
                backoff_coefficient: 2.0,
                max_interval: Duration::from_millis(10),
                jitter: 0.0,
            };
            ctx.schedule_activity_with_retry::<_, String>("Flaky", &(), policy).await
        })
        .build();
    let (worker, client) = common::start_worker(backend.clone(), workflows, activities);

    let instance = client.create_workflow_instance("retry-1", "Retrier", &()).await.unwrap();
    let result: String = client.get_workflow_result(&instance, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result, "done");
    worker.shutdown().await;

    let history = backend.get_workflow_instance_history(&instance, None).await.unwrap();
    let count = |t: EventType| history.iter().filter(|e| e.event_type() == t).count();
    assert_eq!(count(EventType::ActivityScheduled), 3);
    assert_eq!(count(EventType::ActivityFailed), 2);
    assert_eq!(count(EventType::ActivityCompleted), 1);
    common::assert_response_correlation(&history);
}

/// Cancellation: a workflow parked on a long timer is canceled and the
/// client observes the cancellation promptly.
#[tokio::test]
async fn cancellation_interrupts_long_timer() {
    let backend = Arc::new(MemoryBackend::new());
    let workflows = WorkflowRegistry::builder()
        .register("LongSleep", |ctx: WorkflowContext, _input: ()| async move {
            ctx.timer(Duration::from_secs(60)).await?;
            Ok::<_, WorkflowError>("done".to_string())
        })
        .build();
    let (worker, client) = common::start_worker(backend.clone(), workflows.clone(), ActivityRegistry::default());

    let instance = client.create_workflow_instance("cancel-1", "LongSleep", &()).await.unwrap();
    // Let the first task commit the timer before canceling.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let canceled_at = Instant::now();
    client.cancel_workflow_instance(&instance).await.unwrap();
    let result = client
        .get_workflow_result::<String>(&instance, Duration::from_secs(5))
        .await;
    assert!(matches!(result, Err(ClientError::Canceled)), "got {result:?}");
    assert!(canceled_at.elapsed() < Duration::from_secs(1));
    worker.shutdown().await;

    // The Canceled event is the single terminal, last in history.
    let history = backend.get_workflow_instance_history(&instance, None).await.unwrap();
    assert!(
        history
            .last()
            .is_some_and(|e| e.event_type() == EventType::WorkflowExecutionCanceled),
        "cancellation must terminate the history"
    );
    common::assert_single_terminal(&history);

    // A canceled history replays cleanly: the terminal event settles the
    // open timer the same way the live cancellation did.
    let mut executor =
        spindle::WorkflowExecutor::new(workflows, backend.converter(), instance.clone());
    executor.replay(&history).expect("canceled history replays");
    let replayed = executor
        .execute_task(&spindle::WorkflowTask {
            token: String::new(),
            instance: instance.clone(),
            last_sequence_id: history.len() as u64,
            new_events: Vec::new(),
            lease_timeout: Duration::from_secs(30),
        })
        .unwrap();
    assert!(replayed.executed_events.is_empty());
}

/// A workflow may suppress cancellation: it observes the canceled await
/// and finishes with its own result, so the terminal is Finished and the
/// cancellation leaves no history trace.
#[tokio::test]
async fn cancellation_can_be_suppressed() {
    let backend = Arc::new(MemoryBackend::new());
    let workflows = WorkflowRegistry::builder()
        .register("Stubborn", |ctx: WorkflowContext, _input: ()| async move {
            match ctx.timer(Duration::from_secs(60)).await {
                Ok(()) => Ok::<_, WorkflowError>("slept".to_string()),
                Err(e) if e.is_canceled() => Ok("interrupted".to_string()),
                Err(e) => Err(e),
            }
        })
        .build();
    let (worker, client) = common::start_worker(backend.clone(), workflows, ActivityRegistry::default());

    let instance = client.create_workflow_instance("suppress-1", "Stubborn", &()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.cancel_workflow_instance(&instance).await.unwrap();
    let result: String = client.get_workflow_result(&instance, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result, "interrupted");
    worker.shutdown().await;

    let history = backend.get_workflow_instance_history(&instance, None).await.unwrap();
    assert!(
        history
            .last()
            .is_some_and(|e| e.event_type() == EventType::WorkflowExecutionFinished)
    );
    assert!(
        history
            .iter()
            .all(|e| e.event_type() != EventType::WorkflowExecutionCanceled),
        "a suppressed cancellation leaves no history trace"
    );
    common::assert_single_terminal(&history);
}

/// ContinueAsNew: the first execution ends with the continuation payload,
/// the second starts from a fresh history carrying it.
#[tokio::test]
async fn continue_as_new_starts_fresh_execution() {
    let backend = Arc::new(MemoryBackend::new());
    let marks: Arc<Mutex<Vec<(String, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let marks_in_activity = marks.clone();
    let activities = ActivityRegistry::builder()
        .register("Mark", move |ctx: ActivityContext, input: String| {
            let marks = marks_in_activity.clone();
            async move {
                marks.lock().unwrap().push((ctx.instance.execution_id.clone(), input.clone()));
                Ok::<_, WorkflowError>(input)
            }
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("Looper", |ctx: WorkflowContext, input: String| async move {
            if input == "start" {
                ctx.continue_as_new(&"x".to_string())?;
                return Ok::<_, WorkflowError>(String::new());
            }
            ctx.schedule_activity::<_, String>("Mark", &input).await
        })
        .build();
    let (worker, client) = common::start_worker(backend.clone(), workflows, activities);

    let instance = client
        .create_workflow_instance("loop-1", "Looper", &"start".to_string())
        .await
        .unwrap();
    // The first execution's result is the continuation payload.
    let result: String = client.get_workflow_result(&instance, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result, "x");
    let state = backend.get_workflow_instance_state(&instance).await.unwrap();
    assert_eq!(state.state, WorkflowState::ContinuedAsNew);

    // The second execution runs with the carried input and a new id.
    let deadline = Instant::now() + Duration::from_secs(5);
    while marks.lock().unwrap().is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    worker.shutdown().await;
    let marks = marks.lock().unwrap();
    assert_eq!(marks.len(), 1);
    assert_eq!(marks[0].1, "x");
    assert_ne!(marks[0].0, instance.execution_id, "fresh execution id");

    let first_history = backend.get_workflow_instance_history(&instance, None).await.unwrap();
    assert!(
        first_history
            .last()
            .is_some_and(|e| e.event_type() == EventType::WorkflowExecutionContinuedAsNew)
    );
    common::assert_single_terminal(&first_history);
}

/// Sub-workflow: the parent awaits the child's result; the child's
/// completion is routed back by correlation id.
#[tokio::test]
async fn sub_workflow_roundtrip() {
    let backend = Arc::new(MemoryBackend::new());
    let activities = ActivityRegistry::builder()
        .register("Increment", |_ctx: ActivityContext, n: i64| async move {
            Ok::<_, WorkflowError>(n + 1)
        })
        .build();
    let workflows = WorkflowRegistry::builder()
        .register("Parent", |ctx: WorkflowContext, n: i64| async move {
            let child: i64 = ctx
                .schedule_sub_workflow("Child", SubWorkflowOptions::default(), &n)
                .await?;
            Ok::<_, WorkflowError>(child * 2)
        })
        .register("Child", |ctx: WorkflowContext, n: i64| async move {
            ctx.schedule_activity::<_, i64>("Increment", &n).await
        })
        .build();
    let (worker, client) = common::start_worker(backend.clone(), workflows, activities);

    let instance = client.create_workflow_instance("parent-1", "Parent", &5i64).await.unwrap();
    let result: i64 = client.get_workflow_result(&instance, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result, 12);
    worker.shutdown().await;

    let history = backend.get_workflow_instance_history(&instance, None).await.unwrap();
    let kinds: Vec<EventType> = history.iter().map(Event::event_type).collect();
    assert!(kinds.contains(&EventType::SubWorkflowScheduled));
    assert!(kinds.contains(&EventType::SubWorkflowCompleted));
    common::assert_response_correlation(&history);
}

/// Workflow-to-workflow signaling: one instance unblocks another.
#[tokio::test]
async fn workflow_signals_sibling_workflow() {
    let backend = Arc::new(MemoryBackend::new());
    let workflows = WorkflowRegistry::builder()
        .register("Receiver", |ctx: WorkflowContext, _input: ()| async move {
            ctx.wait_signal::<String>("poke").await
        })
        .register("Sender", |ctx: WorkflowContext, target: String| async move {
            ctx.signal_workflow(&target, "poke", &"from-sender".to_string());
            Ok::<_, WorkflowError>("sent".to_string())
        })
        .build();
    let (worker, client) = common::start_worker(backend.clone(), workflows, ActivityRegistry::default());

    let receiver = client.create_workflow_instance("recv-1", "Receiver", &()).await.unwrap();
    let sender = client
        .create_workflow_instance("send-1", "Sender", &"recv-1".to_string())
        .await
        .unwrap();
    let sent: String = client.get_workflow_result(&sender, Duration::from_secs(5)).await.unwrap();
    assert_eq!(sent, "sent");
    let received: String = client.get_workflow_result(&receiver, Duration::from_secs(5)).await.unwrap();
    assert_eq!(received, "from-sender");
    worker.shutdown().await;

    let sender_history = backend.get_workflow_instance_history(&sender, None).await.unwrap();
    assert!(
        sender_history
            .iter()
            .any(|e| e.event_type() == EventType::SignalSent)
    );
}
