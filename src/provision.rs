//! Concurrent, idempotent provisioning of instances and databases.
//!
//! Targets are grouped by `(project, instance)`. Each group runs as its own
//! task: the instance is created first, then every database of the group is
//! created concurrently. A failure is recorded against the resource it hit and
//! never stops sibling work unless `fail_fast` is set.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use indexmap::{IndexMap, IndexSet};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admin::{
    AdminError, AdminGateway, CreateDatabaseRequest, CreateInstanceRequest, Operation,
    RestAdminClient, RetryPolicy,
};
use crate::targets::{self, ProvisioningTarget};

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error(transparent)]
    Admin(#[from] AdminError),
    #[error("instance {instance} was not provisioned")]
    PrerequisiteFailed { instance: String },
    #[error("not attempted: the run was cancelled")]
    Cancelled,
    #[error("provisioning task aborted: {0}")]
    TaskAborted(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CreationOutcome {
    Created,
    AlreadyExisted,
    Failed(ProvisionError),
}

impl CreationOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed(_))
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::AlreadyExisted => "already_existed",
            Self::Failed(_) => "failed",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Resource {
    Instance {
        project: String,
        instance: String,
    },
    Database {
        project: String,
        instance: String,
        database: String,
    },
}

impl Resource {
    pub fn path(&self) -> String {
        match self {
            Self::Instance { project, instance } => targets::instance_path(project, instance),
            Self::Database {
                project,
                instance,
                database,
            } => targets::database_path(project, instance, database),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Instance { .. } => "instance",
            Self::Database { .. } => "database",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourceOutcome {
    pub resource: Resource,
    pub outcome: CreationOutcome,
}

/// Outcome of one provisioning run.
#[derive(Clone, Debug, Default)]
pub struct ProvisioningReport {
    pub outcomes: Vec<ResourceOutcome>,
}

#[derive(Clone, Debug, Error)]
#[error("provisioning failed for {resource} ({failed} failure(s)): {cause}")]
pub struct ProvisioningFailed {
    pub resource: String,
    pub cause: ProvisionError,
    pub failed: usize,
}

impl ProvisioningReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|entry| entry.outcome.is_success())
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn failures(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.outcomes
            .iter()
            .filter(|entry| !entry.outcome.is_success())
    }

    pub fn first_failure(&self) -> Option<&ResourceOutcome> {
        self.failures().next()
    }

    pub fn count(&self, label: &str) -> usize {
        self.outcomes
            .iter()
            .filter(|entry| entry.outcome.label() == label)
            .count()
    }

    pub fn outcome_for(&self, path: &str) -> Option<&CreationOutcome> {
        self.outcomes
            .iter()
            .find(|entry| entry.resource.path() == path)
            .map(|entry| &entry.outcome)
    }

    pub fn ensure_success(&self) -> Result<(), ProvisioningFailed> {
        match self.first_failure() {
            Some(entry) => {
                let cause = match &entry.outcome {
                    CreationOutcome::Failed(cause) => cause.clone(),
                    _ => ProvisionError::TaskAborted("unexpected outcome".to_string()),
                };
                Err(ProvisioningFailed {
                    resource: entry.resource.path(),
                    cause,
                    failed: self.failures().count(),
                })
            }
            None => Ok(()),
        }
    }

    pub fn to_json(&self) -> Value {
        let resources = self
            .outcomes
            .iter()
            .map(|entry| {
                let mut value = json!({
                    "kind": entry.resource.kind(),
                    "path": entry.resource.path(),
                    "outcome": entry.outcome.label(),
                });
                if let CreationOutcome::Failed(cause) = &entry.outcome {
                    value["error"] = Value::String(cause.to_string());
                }
                value
            })
            .collect::<Vec<_>>();
        json!({
            "success": self.is_success(),
            "created": self.count("created"),
            "already_existed": self.count("already_existed"),
            "failed": self.count("failed"),
            "resources": resources,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceTemplate {
    pub config: String,
    pub node_count: u32,
}

impl Default for InstanceTemplate {
    fn default() -> Self {
        Self {
            config: "emulator-config".to_string(),
            node_count: 1,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProvisioningOptions {
    pub instance_template: InstanceTemplate,
    /// When false, instances are assumed to exist and only databases are
    /// created. Instance-only targets then produce no report entry.
    pub create_instances: bool,
    /// Stop starting new creations after the first failure.
    pub fail_fast: bool,
}

impl Default for ProvisioningOptions {
    fn default() -> Self {
        Self {
            instance_template: InstanceTemplate::default(),
            create_instances: true,
            fail_fast: false,
        }
    }
}

/// Databases sharing one `(project, instance)` pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceGroup {
    pub project: String,
    pub instance: String,
    pub databases: Vec<String>,
}

impl InstanceGroup {
    fn instance_resource(&self) -> Resource {
        Resource::Instance {
            project: self.project.clone(),
            instance: self.instance.clone(),
        }
    }

    fn database_resource(&self, database: &str) -> Resource {
        Resource::Database {
            project: self.project.clone(),
            instance: self.instance.clone(),
            database: database.to_string(),
        }
    }
}

/// Groups targets by instance, keeping first-appearance order and dropping
/// repeated databases.
pub fn group_targets(targets: &[ProvisioningTarget]) -> Vec<InstanceGroup> {
    let mut groups: IndexMap<(String, String), IndexSet<String>> = IndexMap::new();
    for target in targets {
        let databases = groups
            .entry((target.project.clone(), target.instance.clone()))
            .or_default();
        if target.has_database() {
            databases.insert(target.database.clone());
        }
    }
    groups
        .into_iter()
        .map(|((project, instance), databases)| InstanceGroup {
            project,
            instance,
            databases: databases.into_iter().collect(),
        })
        .collect()
}

/// Runs one create call and folds the already-exists race into success.
pub async fn create_idempotent<F, Fut>(
    gateway: &dyn AdminGateway,
    cancel: &CancellationToken,
    submit: F,
) -> CreationOutcome
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Operation, AdminError>>,
{
    if cancel.is_cancelled() {
        return CreationOutcome::Failed(ProvisionError::Cancelled);
    }
    match submit().await {
        Err(err) if err.is_already_exists() => CreationOutcome::AlreadyExisted,
        Err(err) => failed(err),
        Ok(operation) => match gateway.wait_operation(operation, cancel).await {
            Ok(()) => CreationOutcome::Created,
            Err(err) => failed(err),
        },
    }
}

fn failed(err: AdminError) -> CreationOutcome {
    match err {
        AdminError::Cancelled => CreationOutcome::Failed(ProvisionError::Cancelled),
        err => CreationOutcome::Failed(err.into()),
    }
}

pub struct Provisioner {
    gateway: Arc<dyn AdminGateway>,
    options: Arc<ProvisioningOptions>,
}

impl Provisioner {
    pub fn new(gateway: Arc<dyn AdminGateway>, options: ProvisioningOptions) -> Self {
        Self {
            gateway,
            options: Arc::new(options),
        }
    }

    /// Provisions every target and waits for all scheduled work.
    pub async fn run(
        &self,
        targets: &[ProvisioningTarget],
        cancel: &CancellationToken,
    ) -> ProvisioningReport {
        let groups = group_targets(targets);
        if groups.is_empty() {
            return ProvisioningReport::default();
        }
        let run_cancel = cancel.child_token();
        tracing::info!(
            groups = groups.len(),
            databases = groups.iter().map(|group| group.databases.len()).sum::<usize>(),
            "provisioning targets"
        );

        let handles = groups
            .into_iter()
            .map(|group| {
                let gateway = self.gateway.clone();
                let options = self.options.clone();
                let cancel = run_cancel.clone();
                let task_group = group.clone();
                let handle: JoinHandle<Vec<ResourceOutcome>> = tokio::spawn(async move {
                    provision_group(gateway, options, task_group, cancel).await
                });
                (group, handle)
            })
            .collect::<Vec<_>>();

        let mut report = ProvisioningReport::default();
        for (group, handle) in handles {
            match handle.await {
                Ok(outcomes) => report.outcomes.extend(outcomes),
                Err(err) => {
                    let cause = ProvisionError::TaskAborted(err.to_string());
                    if self.options.create_instances {
                        report.outcomes.push(ResourceOutcome {
                            resource: group.instance_resource(),
                            outcome: CreationOutcome::Failed(cause.clone()),
                        });
                    }
                    for database in &group.databases {
                        report.outcomes.push(ResourceOutcome {
                            resource: group.database_resource(database),
                            outcome: CreationOutcome::Failed(cause.clone()),
                        });
                    }
                }
            }
        }

        tracing::info!(
            created = report.count("created"),
            already_existed = report.count("already_existed"),
            failed = report.count("failed"),
            "provisioning finished"
        );
        report
    }
}

async fn provision_group(
    gateway: Arc<dyn AdminGateway>,
    options: Arc<ProvisioningOptions>,
    group: InstanceGroup,
    cancel: CancellationToken,
) -> Vec<ResourceOutcome> {
    let mut outcomes = Vec::with_capacity(group.databases.len() + 1);

    if !options.create_instances && group.databases.is_empty() {
        tracing::info!(
            project = %group.project,
            instance = %group.instance,
            "instance assumed to exist, nothing to create"
        );
    }

    if options.create_instances {
        let request = CreateInstanceRequest {
            project: group.project.clone(),
            instance_id: group.instance.clone(),
            config: options.instance_template.config.clone(),
            node_count: options.instance_template.node_count,
            display_name: String::new(),
        };
        tracing::info!(
            project = %group.project,
            instance = %group.instance,
            "attempting to create instance"
        );
        let outcome = create_idempotent(gateway.as_ref(), &cancel, || {
            gateway.create_instance(&request, &cancel)
        })
        .await;
        let resource = group.instance_resource();
        record(&resource, &outcome, &options, &cancel);
        let ready = outcome.is_success();
        outcomes.push(ResourceOutcome { resource, outcome });

        if !ready {
            let instance = group.instance_resource().path();
            for database in &group.databases {
                let resource = group.database_resource(database);
                tracing::warn!(
                    database = %resource,
                    %instance,
                    "skipping database, its instance was not provisioned"
                );
                outcomes.push(ResourceOutcome {
                    resource,
                    outcome: CreationOutcome::Failed(ProvisionError::PrerequisiteFailed {
                        instance: instance.clone(),
                    }),
                });
            }
            return outcomes;
        }
    }

    let handles = group
        .databases
        .iter()
        .map(|database| {
            let gateway = gateway.clone();
            let options = options.clone();
            let cancel = cancel.clone();
            let resource = group.database_resource(database);
            let request = CreateDatabaseRequest {
                project: group.project.clone(),
                instance: group.instance.clone(),
                database_id: database.clone(),
            };
            let handle = tokio::spawn(async move {
                tracing::info!(database = %resource, "attempting to create database");
                let outcome = create_idempotent(gateway.as_ref(), &cancel, || {
                    gateway.create_database(&request, &cancel)
                })
                .await;
                record(&resource, &outcome, &options, &cancel);
                outcome
            });
            (group.database_resource(database), handle)
        })
        .collect::<Vec<_>>();

    for (resource, handle) in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(err) => CreationOutcome::Failed(ProvisionError::TaskAborted(err.to_string())),
        };
        outcomes.push(ResourceOutcome { resource, outcome });
    }
    outcomes
}

fn record(
    resource: &Resource,
    outcome: &CreationOutcome,
    options: &ProvisioningOptions,
    cancel: &CancellationToken,
) {
    match outcome {
        CreationOutcome::Created => {
            tracing::info!(resource = %resource, kind = resource.kind(), "created");
        }
        CreationOutcome::AlreadyExisted => {
            tracing::info!(
                resource = %resource,
                kind = resource.kind(),
                "already exists, continuing"
            );
        }
        CreationOutcome::Failed(cause) => {
            tracing::error!(
                resource = %resource,
                kind = resource.kind(),
                error = %cause,
                "creation failed"
            );
            if options.fail_fast {
                cancel.cancel();
            }
        }
    }
}

/// Connection settings for the administrative endpoint.
#[derive(Clone, Debug)]
pub struct AdminSettings {
    pub endpoint: String,
    pub retry: RetryPolicy,
}

/// Builds the REST gateway and provisions `targets`.
///
/// Returns `Err` only when the gateway cannot be constructed; per-resource
/// failures are in the report.
pub async fn provision_targets(
    settings: &AdminSettings,
    targets: &[ProvisioningTarget],
    options: ProvisioningOptions,
    cancel: &CancellationToken,
) -> Result<ProvisioningReport, AdminError> {
    if targets.is_empty() {
        tracing::info!("no provisioning targets configured");
        return Ok(ProvisioningReport::default());
    }
    let client = RestAdminClient::connect(&settings.endpoint, settings.retry.clone())?;
    tracing::info!(endpoint = client.endpoint(), "admin client ready");
    let provisioner = Provisioner::new(Arc::new(client), options);
    Ok(provisioner.run(targets, cancel).await)
}
