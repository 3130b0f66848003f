//! Stateful in-process control plane.
//!
//! Resources are registered when the create call is accepted, so a second
//! create for the same path sees ALREADY_EXISTS the way the emulator does.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::{
    AdminError, AdminGateway, CreateDatabaseRequest, CreateInstanceRequest, Operation, StatusCode,
};
use crate::targets;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminCall {
    CreateInstance(String),
    CreateDatabase(String),
    WaitOperation(String),
}

#[derive(Default)]
struct MemoryState {
    instances: BTreeSet<String>,
    databases: BTreeSet<String>,
    calls: Vec<AdminCall>,
    submit_failures: BTreeMap<String, AdminError>,
    submit_delays: BTreeMap<String, Duration>,
    wait_failures: BTreeMap<String, String>,
    pending: BTreeMap<String, String>,
    next_operation: u64,
}

#[derive(Default)]
pub struct InMemoryAdmin {
    state: Mutex<MemoryState>,
}

impl InMemoryAdmin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an instance as if an earlier run had created it.
    pub fn with_instance(self, project: &str, instance: &str) -> Self {
        self.lock()
            .instances
            .insert(targets::instance_path(project, instance));
        self
    }

    /// Makes create calls for `path` fail with `error` before anything is registered.
    pub fn fail_submit(&self, path: impl Into<String>, error: AdminError) {
        self.lock().submit_failures.insert(path.into(), error);
    }

    /// Holds create calls for `path` for `delay` before they reach the control
    /// plane, like an endpoint that is not ready yet. Cancellation during the
    /// hold leaves no call behind.
    pub fn delay_submit(&self, path: impl Into<String>, delay: Duration) {
        self.lock().submit_delays.insert(path.into(), delay);
    }

    /// Makes the operation for `path` finish with an INTERNAL error.
    pub fn fail_operation(&self, path: impl Into<String>, message: impl Into<String>) {
        self.lock().wait_failures.insert(path.into(), message.into());
    }

    pub fn calls(&self) -> Vec<AdminCall> {
        self.lock().calls.clone()
    }

    pub fn instance_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, AdminCall::CreateInstance(_)))
    }

    pub fn database_calls(&self) -> usize {
        self.count_calls(|call| matches!(call, AdminCall::CreateDatabase(_)))
    }

    pub fn has_instance(&self, project: &str, instance: &str) -> bool {
        self.lock()
            .instances
            .contains(&targets::instance_path(project, instance))
    }

    pub fn has_database(&self, project: &str, instance: &str, database: &str) -> bool {
        self.lock()
            .databases
            .contains(&targets::database_path(project, instance, database))
    }

    fn count_calls(&self, predicate: impl Fn(&AdminCall) -> bool) -> usize {
        self.lock().calls.iter().filter(|call| predicate(call)).count()
    }

    async fn admit(&self, path: &str, cancel: &CancellationToken) -> Result<(), AdminError> {
        if cancel.is_cancelled() {
            return Err(AdminError::Cancelled);
        }
        let delay = self.lock().submit_delays.get(path).copied();
        if let Some(delay) = delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(AdminError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MemoryState {
    fn start_operation(&mut self, path: &str) -> Operation {
        self.next_operation += 1;
        let name = format!("{path}/operations/op-{}", self.next_operation);
        self.pending.insert(name.clone(), path.to_string());
        Operation::pending(name)
    }
}

#[async_trait]
impl AdminGateway for InMemoryAdmin {
    async fn create_instance(
        &self,
        request: &CreateInstanceRequest,
        cancel: &CancellationToken,
    ) -> Result<Operation, AdminError> {
        let path = request.path();
        self.admit(&path, cancel).await?;
        let mut state = self.lock();
        state.calls.push(AdminCall::CreateInstance(path.clone()));
        if let Some(err) = state.submit_failures.get(&path) {
            return Err(err.clone());
        }
        if !state.instances.insert(path.clone()) {
            return Err(AdminError::status(
                StatusCode::AlreadyExists,
                format!("Instance already exists: {path}"),
            ));
        }
        Ok(state.start_operation(&path))
    }

    async fn create_database(
        &self,
        request: &CreateDatabaseRequest,
        cancel: &CancellationToken,
    ) -> Result<Operation, AdminError> {
        let path = request.path();
        self.admit(&path, cancel).await?;
        let mut state = self.lock();
        state.calls.push(AdminCall::CreateDatabase(path.clone()));
        if let Some(err) = state.submit_failures.get(&path) {
            return Err(err.clone());
        }
        if !state.instances.contains(&request.parent()) {
            return Err(AdminError::status(
                StatusCode::NotFound,
                format!("Instance not found: {}", request.parent()),
            ));
        }
        if !state.databases.insert(path.clone()) {
            return Err(AdminError::status(
                StatusCode::AlreadyExists,
                format!("Database already exists: {path}"),
            ));
        }
        Ok(state.start_operation(&path))
    }

    async fn wait_operation(
        &self,
        operation: Operation,
        cancel: &CancellationToken,
    ) -> Result<(), AdminError> {
        if cancel.is_cancelled() {
            return Err(AdminError::Cancelled);
        }
        let mut state = self.lock();
        state
            .calls
            .push(AdminCall::WaitOperation(operation.name.clone()));
        let Some(path) = state.pending.remove(&operation.name) else {
            return Err(AdminError::status(
                StatusCode::NotFound,
                format!("Operation not found: {}", operation.name),
            ));
        };
        match state.wait_failures.get(&path) {
            Some(message) => Err(AdminError::OperationFailed {
                name: operation.name,
                code: StatusCode::Internal,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}
