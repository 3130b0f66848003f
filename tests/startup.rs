#![cfg(unix)]

mod common;

use std::collections::BTreeMap;
use std::path::Path;
use std::time::{Duration, Instant};

use spanner_gateway_shim::admin::{AdminError, RetryPolicy};
use spanner_gateway_shim::config::{FailurePolicy, ProvisioningMode};
use spanner_gateway_shim::provision::{
    AdminSettings, CreationOutcome, ProvisionError, ProvisioningOptions, ProvisioningReport,
    Resource, ResourceOutcome,
};
use spanner_gateway_shim::startup::{self, StartupPlan, apply_failure_policy};
use spanner_gateway_shim::supervisor::GatewaySpec;
use spanner_gateway_shim::targets::ProvisioningTarget;
use tokio_util::sync::CancellationToken;

use common::{fast_retry, start_fake};

fn plan(
    targets: Vec<ProvisioningTarget>,
    endpoint: &str,
    mode: ProvisioningMode,
    on_failure: FailurePolicy,
    script: &str,
    cwd: &Path,
) -> StartupPlan {
    StartupPlan {
        targets,
        admin: AdminSettings {
            endpoint: endpoint.to_string(),
            retry: RetryPolicy::bounded(1),
        },
        options: ProvisioningOptions::default(),
        mode,
        on_failure,
        gateway: GatewaySpec {
            argv: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            cwd: Some(cwd.to_path_buf()),
            env: BTreeMap::new(),
            stop_timeout: Duration::from_millis(500),
        },
    }
}

fn one_target() -> Vec<ProvisioningTarget> {
    vec![ProvisioningTarget::new("p", "i", "d")]
}

#[tokio::test]
async fn blocking_without_targets_runs_gateway_and_returns_its_code() {
    let temp = tempfile::tempdir().unwrap();
    let plan = plan(
        Vec::new(),
        "localhost:9020",
        ProvisioningMode::Blocking,
        FailurePolicy::Abort,
        "exit 7",
        temp.path(),
    );
    let code = startup::run(plan, CancellationToken::new()).await.unwrap();
    assert_eq!(code, 7);
}

#[tokio::test]
async fn blocking_abort_never_starts_gateway() {
    let temp = tempfile::tempdir().unwrap();
    let plan = plan(
        one_target(),
        "https://spanner.example.com",
        ProvisioningMode::Blocking,
        FailurePolicy::Abort,
        "touch started",
        temp.path(),
    );
    let err = startup::run(plan, CancellationToken::new()).await.unwrap_err();
    assert!(format!("{err:#}").contains("invalid admin endpoint"));
    assert!(!temp.path().join("started").exists());
}

#[tokio::test]
async fn blocking_log_policy_still_starts_gateway() {
    let temp = tempfile::tempdir().unwrap();
    let plan = plan(
        one_target(),
        "https://spanner.example.com",
        ProvisioningMode::Blocking,
        FailurePolicy::Log,
        "touch started",
        temp.path(),
    );
    let code = startup::run(plan, CancellationToken::new()).await.unwrap();
    assert_eq!(code, 0);
    assert!(temp.path().join("started").exists());
}

#[tokio::test]
async fn background_abort_stops_running_gateway() {
    let temp = tempfile::tempdir().unwrap();
    let plan = plan(
        one_target(),
        "https://spanner.example.com",
        ProvisioningMode::Background,
        FailurePolicy::Abort,
        "sleep 30",
        temp.path(),
    );
    let started = Instant::now();
    let result = startup::run(plan, CancellationToken::new()).await;
    assert!(result.is_err());
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn background_gateway_exit_wins_over_slow_provisioning() {
    let temp = tempfile::tempdir().unwrap();
    let mut plan = plan(
        one_target(),
        "127.0.0.1:9",
        ProvisioningMode::Background,
        FailurePolicy::Abort,
        "exit 4",
        temp.path(),
    );
    plan.admin.retry = RetryPolicy::default();
    let code = startup::run(plan, CancellationToken::new()).await.unwrap();
    assert_eq!(code, 4);
}

#[tokio::test]
async fn background_interrupt_keeps_gateway_running() {
    let temp = tempfile::tempdir().unwrap();
    let mut plan = plan(
        one_target(),
        "127.0.0.1:9",
        ProvisioningMode::Background,
        FailurePolicy::Abort,
        "sleep 1; exit 5",
        temp.path(),
    );
    plan.admin.retry = fast_retry();
    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        interrupt.cancel();
    });

    let code = startup::run(plan, cancel).await.unwrap();

    assert_eq!(code, 5);
}

#[tokio::test]
async fn background_abort_stops_gateway_on_resource_failure() {
    let (endpoint, _state) = start_fake().await;
    let temp = tempfile::tempdir().unwrap();
    let mut plan = plan(
        vec![ProvisioningTarget::new("p", "i", "broken")],
        &endpoint,
        ProvisioningMode::Background,
        FailurePolicy::Abort,
        "sleep 30",
        temp.path(),
    );
    plan.admin.retry = fast_retry();
    let started = Instant::now();

    let err = startup::run(plan, CancellationToken::new()).await.unwrap_err();

    assert!(format!("{err:#}").contains("projects/p/instances/i/databases/broken"));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn background_log_policy_returns_gateway_exit_code() {
    let (endpoint, state) = start_fake().await;
    let temp = tempfile::tempdir().unwrap();
    let mut plan = plan(
        vec![
            ProvisioningTarget::new("p", "i", "broken"),
            ProvisioningTarget::new("p", "i", "fine"),
        ],
        &endpoint,
        ProvisioningMode::Background,
        FailurePolicy::Log,
        "sleep 1; exit 6",
        temp.path(),
    );
    plan.admin.retry = fast_retry();

    let code = startup::run(plan, CancellationToken::new()).await.unwrap();

    assert_eq!(code, 6);
    assert!(
        state
            .lock()
            .unwrap()
            .databases
            .contains("projects/p/instances/i/databases/fine")
    );
}

#[tokio::test]
async fn background_success_keeps_waiting_on_gateway() {
    let (endpoint, state) = start_fake().await;
    let temp = tempfile::tempdir().unwrap();
    let mut plan = plan(
        one_target(),
        &endpoint,
        ProvisioningMode::Background,
        FailurePolicy::Abort,
        "sleep 1; touch finished; exit 9",
        temp.path(),
    );
    plan.admin.retry = fast_retry();

    let code = startup::run(plan, CancellationToken::new()).await.unwrap();

    assert_eq!(code, 9);
    assert!(temp.path().join("finished").exists());
    assert!(
        state
            .lock()
            .unwrap()
            .databases
            .contains("projects/p/instances/i/databases/d")
    );
}

#[test]
fn failure_policy_decides_fatality() {
    let failed = ProvisioningReport {
        outcomes: vec![ResourceOutcome {
            resource: Resource::Instance {
                project: "p".to_string(),
                instance: "i".to_string(),
            },
            outcome: CreationOutcome::Failed(ProvisionError::Admin(AdminError::Transport(
                "refused".to_string(),
            ))),
        }],
    };
    let err = apply_failure_policy(Ok(failed.clone()), FailurePolicy::Abort).unwrap_err();
    assert!(format!("{err:#}").contains("projects/p/instances/i"));
    assert!(apply_failure_policy(Ok(failed), FailurePolicy::Log).is_ok());
    assert!(apply_failure_policy(Ok(ProvisioningReport::default()), FailurePolicy::Abort).is_ok());
}
