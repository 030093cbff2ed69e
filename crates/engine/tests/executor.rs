mod support;

use std::sync::Arc;

use cvmstep_engine::RemoteExecutor;
use cvmstep_storage::MemoryObjectStore;
use cvmstep_types::StepOutcome;
use support::{FakeProvisioner, context, spec, step};

#[test]
fn execute_blocks_until_outcome_without_a_runtime() {
    let store = Arc::new(MemoryObjectStore::new());
    let provisioner = FakeProvisioner::new();
    provisioner.completes_with(Arc::clone(&store), 3);

    let executor = RemoteExecutor::new(context(&store, &provisioner), Arc::new(b"hello".to_vec()));
    let outcome = executor.execute(step("r1", "1"), spec(60));

    assert_eq!(outcome, StepOutcome::Failure { exit_code: 3 });
    assert_eq!(outcome.process_exit_code(), 3);
    assert_eq!(provisioner.count("destroy"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn execute_reuses_an_ambient_multi_thread_runtime() {
    let store = Arc::new(MemoryObjectStore::new());
    let provisioner = FakeProvisioner::new();
    provisioner.completes_with(Arc::clone(&store), 0);

    let executor = RemoteExecutor::new(context(&store, &provisioner), Arc::new(b"hello".to_vec()));
    let outcome = executor.execute(step("r1", "1"), spec(60));

    assert!(outcome.is_success());
}

#[tokio::test]
async fn execute_inside_current_thread_runtime_reports_infrastructure_error() {
    let store = Arc::new(MemoryObjectStore::new());
    let provisioner = FakeProvisioner::new();

    let executor = RemoteExecutor::new(context(&store, &provisioner), Arc::new(b"hello".to_vec()));
    let outcome = executor.execute(step("r1", "1"), spec(60));

    assert!(matches!(outcome, StepOutcome::InfrastructureError { .. }));
    assert!(provisioner.calls().is_empty());
}
