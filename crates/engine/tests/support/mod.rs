#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use cvmstep_api::{ApiError, InstanceProvisioner};
use cvmstep_engine::{DispatchContext, DispatchSettings};
use cvmstep_storage::{MemoryObjectStore, ObjectStore};
use cvmstep_types::{BootstrapPayload, InstanceHandle, InstanceSpec, InstanceStatus, StepDescriptor};
use cvmstep_util::RetryPolicy;
use indexmap::IndexMap;

/// Provisioner double that records every call and can simulate the remote
/// instance writing its sentinel as soon as it is started.
#[derive(Debug, Default)]
pub struct FakeProvisioner {
    pub calls: Mutex<Vec<String>>,
    pub created: Mutex<Vec<(InstanceSpec, BootstrapPayload)>>,
    create_failures: Mutex<VecDeque<u16>>,
    start_failures: Mutex<VecDeque<u16>>,
    destroy_failures: Mutex<VecDeque<u16>>,
    sentinel: Mutex<Option<(Arc<MemoryObjectStore>, i32)>>,
    sentinel_objects: Mutex<HashMap<String, String>>,
    read_failures_on_start: Mutex<Option<(Arc<MemoryObjectStore>, u32)>>,
}

impl FakeProvisioner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// On `start`, write a sentinel with `exit_code` into `store`.
    pub fn completes_with(&self, store: Arc<MemoryObjectStore>, exit_code: i32) {
        *self.sentinel.lock().unwrap() = Some((store, exit_code));
    }

    /// On `start`, make the next `count` reads of `store` fail.
    pub fn breaks_reads_on_start(&self, store: Arc<MemoryObjectStore>, count: u32) {
        *self.read_failures_on_start.lock().unwrap() = Some((store, count));
    }

    pub fn fail_creates(&self, statuses: &[u16]) {
        self.create_failures.lock().unwrap().extend(statuses);
    }

    pub fn fail_starts(&self, statuses: &[u16]) {
        self.start_failures.lock().unwrap().extend(statuses);
    }

    pub fn fail_destroys(&self, statuses: &[u16]) {
        self.destroy_failures.lock().unwrap().extend(statuses);
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.split(':').next() == Some(operation))
            .count()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn next_failure(queue: &Mutex<VecDeque<u16>>, operation: &'static str) -> Result<(), ApiError> {
        match queue.lock().unwrap().pop_front() {
            Some(status) => Err(ApiError::from_status(operation, status, "simulated")),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl InstanceProvisioner for FakeProvisioner {
    async fn create(&self, spec: &InstanceSpec, payload: &BootstrapPayload) -> Result<InstanceHandle, ApiError> {
        self.record("create".to_string());
        Self::next_failure(&self.create_failures, "create")?;
        let handle = InstanceHandle::new(format!("cvm-{}", self.count("create")));
        if let Some(object) = payload.environment.get("CVMSTEP_SENTINEL_OBJECT") {
            self.sentinel_objects
                .lock()
                .unwrap()
                .insert(handle.id().to_string(), object.clone());
        }
        self.created.lock().unwrap().push((spec.clone(), payload.clone()));
        Ok(handle)
    }

    async fn start(&self, handle: &InstanceHandle) -> Result<(), ApiError> {
        self.record(format!("start:{handle}"));
        Self::next_failure(&self.start_failures, "start")?;

        if let Some((store, count)) = self.read_failures_on_start.lock().unwrap().take() {
            store.fail_next_reads(count);
        }

        let sentinel = self.sentinel.lock().unwrap().clone();
        if let Some((store, exit_code)) = sentinel {
            let key = self
                .sentinel_objects
                .lock()
                .unwrap()
                .get(handle.id())
                .cloned()
                .expect("payload carries sentinel object");
            let record = format!(r#"{{"key":"{key}","exit_code":{exit_code},"written_at":"2026-01-01T00:00:00Z"}}"#);
            store.put(&key, record.into_bytes()).await.expect("write sentinel");
        }
        Ok(())
    }

    async fn destroy(&self, handle: &InstanceHandle) -> Result<(), ApiError> {
        self.record(format!("destroy:{handle}"));
        Self::next_failure(&self.destroy_failures, "destroy")
    }

    async fn status(&self, handle: &InstanceHandle) -> Result<InstanceStatus, ApiError> {
        self.record(format!("status:{handle}"));
        Ok(InstanceStatus {
            status: "running".to_string(),
        })
    }
}

pub fn settings() -> DispatchSettings {
    DispatchSettings {
        poll_interval: Duration::from_secs(1),
        max_poll_errors: 3,
        provision_retry: RetryPolicy::immediate(3),
        storage_retry: RetryPolicy::immediate(3),
        destroy_retry: RetryPolicy::immediate(5),
    }
}

pub fn context(store: &Arc<MemoryObjectStore>, provisioner: &Arc<FakeProvisioner>) -> DispatchContext {
    let store: Arc<dyn ObjectStore> = store.clone();
    let provisioner: Arc<dyn InstanceProvisioner> = provisioner.clone();
    DispatchContext::new(store, provisioner, settings())
}

pub fn step(run_id: &str, task_id: &str) -> StepDescriptor {
    StepDescriptor {
        flow_name: "HelloFlow".into(),
        step_name: "start".into(),
        run_id: run_id.into(),
        task_id: task_id.into(),
        attempt: 0,
        setup_commands: vec!["pip install -r requirements.txt".into()],
        command: "python flow.py step start".into(),
    }
}

pub fn spec(timeout_s: u64) -> InstanceSpec {
    InstanceSpec {
        image: "python:3.11-slim".into(),
        cpu: 2,
        memory_mb: 2048,
        disk_gb: 20,
        timeout_s,
        env: IndexMap::new(),
    }
}
