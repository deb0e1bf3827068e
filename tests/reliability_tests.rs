//! Backend and worker behavior under failure: leases, redelivery,
//! duplicate creates, and signals to instances that cannot take them.

use spindle::backend::memory::{MemoryBackend, MemoryBackendOptions};
use spindle::{
    ActivityRegistry, Backend, BackendError, Client, ClientError, WorkflowContext, WorkflowError,
    WorkflowRegistry, WorkflowTaskResult,
};
use std::sync::Arc;
use std::time::Duration;

mod common;

fn noop_workflows() -> WorkflowRegistry {
    WorkflowRegistry::builder()
        .register("Noop", |_ctx: WorkflowContext, _input: ()| async move {
            Ok::<_, WorkflowError>("done".to_string())
        })
        .build()
}

#[tokio::test]
async fn duplicate_instance_create_is_rejected() {
    let backend = Arc::new(MemoryBackend::new());
    let client = Client::new(backend);
    client.create_workflow_instance("dup-1", "Noop", &()).await.unwrap();
    let second = client.create_workflow_instance("dup-1", "Noop", &()).await;
    assert!(
        matches!(second, Err(ClientError::Backend(BackendError::InstanceAlreadyExists(_)))),
        "got {second:?}"
    );
}

#[tokio::test]
async fn signal_to_unknown_instance_fails() {
    let backend = Arc::new(MemoryBackend::new());
    let client = Client::new(backend);
    let result = client.signal_workflow("nobody", "go", &()).await;
    assert!(
        matches!(result, Err(ClientError::Backend(BackendError::InstanceNotFound(_)))),
        "got {result:?}"
    );
}

#[tokio::test]
async fn signal_to_finished_instance_is_rejected_explicitly() {
    let backend = Arc::new(MemoryBackend::new());
    let (worker, client) = common::start_worker(backend.clone(), noop_workflows(), ActivityRegistry::default());
    let instance = client.create_workflow_instance("fin-1", "Noop", &()).await.unwrap();
    let _: String = client.get_workflow_result(&instance, Duration::from_secs(5)).await.unwrap();
    worker.shutdown().await;

    let result = client.signal_workflow("fin-1", "go", &()).await;
    assert!(
        matches!(result, Err(ClientError::Backend(BackendError::InstanceFinished(_)))),
        "got {result:?}"
    );
    // Cancellation of a finished instance is rejected the same way.
    let cancel = client.cancel_workflow_instance(&instance).await;
    assert!(matches!(
        cancel,
        Err(ClientError::Backend(BackendError::InstanceFinished(_)))
    ));
}

#[tokio::test]
async fn remove_is_only_legal_on_terminal_instances() {
    let backend = Arc::new(MemoryBackend::new());
    let client = Client::new(backend.clone());
    let instance = client.create_workflow_instance("rm-1", "Noop", &()).await.unwrap();
    let early = client.remove_workflow_instance(&instance).await;
    assert!(
        matches!(early, Err(ClientError::Backend(BackendError::InstanceNotTerminal(_)))),
        "got {early:?}"
    );

    let worker = spindle::Worker::new(backend.clone(), noop_workflows(), ActivityRegistry::default())
        .with_options(common::fast_worker_options())
        .start();
    let _: String = client.get_workflow_result(&instance, Duration::from_secs(5)).await.unwrap();
    worker.shutdown().await;

    client.remove_workflow_instance(&instance).await.unwrap();
    let gone = backend.get_workflow_instance_state(&instance).await;
    assert!(matches!(gone, Err(BackendError::InstanceNotFound(_))));
}

#[tokio::test]
async fn workflow_lease_is_exclusive_and_redelivered_on_expiry() {
    let backend = Arc::new(MemoryBackend::with_options(MemoryBackendOptions {
        workflow_lease_timeout: Duration::from_millis(60),
        activity_lease_timeout: Duration::from_millis(60),
    }));
    let client = Client::new(backend.clone());
    client.create_workflow_instance("lease-1", "Noop", &()).await.unwrap();

    let first = backend.get_workflow_task().await.unwrap().expect("task available");
    assert_eq!(first.instance.instance_id, "lease-1");
    // Single writer: the same instance is never leased twice at once.
    assert!(backend.get_workflow_task().await.unwrap().is_none());

    // Heartbeat extends the lease.
    backend.extend_workflow_task(&first).await.unwrap();

    // A silent worker loses the lease; the task is redelivered.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let second = backend.get_workflow_task().await.unwrap().expect("redelivery");
    assert_eq!(second.instance.instance_id, "lease-1");
    assert_eq!(second.new_events.len(), first.new_events.len());

    // The stale lease can neither extend nor complete.
    assert!(matches!(
        backend.extend_workflow_task(&first).await,
        Err(BackendError::LeaseLost(_))
    ));
    assert!(matches!(
        backend.complete_workflow_task(&first, WorkflowTaskResult::new()).await,
        Err(BackendError::LeaseLost(_))
    ));
}

#[tokio::test]
async fn worker_crash_mid_task_is_recovered_by_lease_expiry() {
    let backend = Arc::new(MemoryBackend::with_options(MemoryBackendOptions {
        workflow_lease_timeout: Duration::from_millis(80),
        activity_lease_timeout: Duration::from_millis(80),
    }));
    let client = Client::new(backend.clone());
    let instance = client.create_workflow_instance("crash-1", "Noop", &()).await.unwrap();

    // Simulate a worker that claimed the task and died.
    let _abandoned = backend.get_workflow_task().await.unwrap().expect("claimed");

    // A healthy worker picks the instance up after expiry and finishes it.
    let worker = spindle::Worker::new(backend.clone(), noop_workflows(), ActivityRegistry::default())
        .with_options(common::fast_worker_options())
        .start();
    let result: String = client.get_workflow_result(&instance, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result, "done");
    worker.shutdown().await;

    let history = backend.get_workflow_instance_history(&instance, None).await.unwrap();
    common::assert_sequence_dense(&history);
    common::assert_single_terminal(&history);
}

#[tokio::test]
async fn delivery_failures_inside_workflows_do_not_crash_the_worker() {
    let backend = Arc::new(MemoryBackend::new());
    let workflows = WorkflowRegistry::builder()
        .register("BlindSender", |ctx: WorkflowContext, _input: ()| async move {
            // Target does not exist; the send is recorded and the delivery
            // dropped by the backend.
            ctx.signal_workflow("ghost", "poke", &());
            Ok::<_, WorkflowError>("sent".to_string())
        })
        .build();
    let (worker, client) = common::start_worker(backend.clone(), workflows, ActivityRegistry::default());
    let instance = client.create_workflow_instance("blind-1", "BlindSender", &()).await.unwrap();
    let result: String = client.get_workflow_result(&instance, Duration::from_secs(5)).await.unwrap();
    assert_eq!(result, "sent");
    worker.shutdown().await;
}

#[tokio::test]
async fn unregistered_workflow_fails_the_instance_not_the_worker() {
    let backend = Arc::new(MemoryBackend::new());
    let (worker, client) = common::start_worker(backend.clone(), noop_workflows(), ActivityRegistry::default());
    let instance = client.create_workflow_instance("missing-1", "NoSuchWorkflow", &()).await.unwrap();
    let result = client.get_workflow_result::<String>(&instance, Duration::from_secs(5)).await;
    match result {
        Err(ClientError::WorkflowFailed(e)) => assert!(e.message.contains("not registered")),
        other => panic!("expected workflow failure, got {other:?}"),
    }
    worker.shutdown().await;
}
