//! Provisioning wired into gateway startup.
//!
//! `Blocking` provisions first and only then launches the gateway.
//! `Background` launches the gateway immediately and provisions alongside it;
//! the report is only observed through the failure policy.

use anyhow::Context;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::admin::AdminError;
use crate::config::{FailurePolicy, ProvisioningMode};
use crate::provision::{self, AdminSettings, ProvisioningOptions, ProvisioningReport};
use crate::supervisor::{self, GatewaySpec};
use crate::targets::ProvisioningTarget;

pub struct StartupPlan {
    pub targets: Vec<ProvisioningTarget>,
    pub admin: AdminSettings,
    pub options: ProvisioningOptions,
    pub mode: ProvisioningMode,
    pub on_failure: FailurePolicy,
    pub gateway: GatewaySpec,
}

/// Provisions and supervises the gateway; returns the exit code to use.
pub async fn run(plan: StartupPlan, cancel: CancellationToken) -> anyhow::Result<i32> {
    tracing::info!(
        mode = ?plan.mode,
        on_failure = ?plan.on_failure,
        targets = plan.targets.len(),
        "starting gateway shim"
    );
    match plan.mode {
        ProvisioningMode::Blocking => run_blocking(plan, cancel).await,
        ProvisioningMode::Background => run_background(plan, cancel).await,
    }
}

async fn run_blocking(plan: StartupPlan, cancel: CancellationToken) -> anyhow::Result<i32> {
    let result =
        provision::provision_targets(&plan.admin, &plan.targets, plan.options, &cancel).await;
    apply_failure_policy(result, plan.on_failure)?;
    let status = supervisor::run_gateway(&plan.gateway).await?;
    Ok(supervisor::exit_code(&status))
}

async fn run_background(plan: StartupPlan, cancel: CancellationToken) -> anyhow::Result<i32> {
    let StartupPlan {
        targets,
        admin,
        options,
        on_failure,
        gateway,
        ..
    } = plan;

    let provisioning_cancel = cancel.child_token();
    let task_cancel = provisioning_cancel.clone();
    let mut provisioning: JoinHandle<Result<ProvisioningReport, AdminError>> =
        tokio::spawn(async move {
            provision::provision_targets(&admin, &targets, options, &task_cancel).await
        });
    let mut provisioning_done = false;

    let mut child = match supervisor::spawn_gateway(&gateway) {
        Ok(child) => child,
        Err(err) => {
            provisioning_cancel.cancel();
            return Err(err);
        }
    };
    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.context("failed waiting for gateway")?;
                tracing::info!(status = %status, "gateway exited");
                provisioning_cancel.cancel();
                return Ok(supervisor::exit_code(&status));
            }
            joined = &mut provisioning, if !provisioning_done => {
                provisioning_done = true;
                let result = match joined {
                    Ok(result) => result,
                    Err(err) => {
                        tracing::error!(error = %err, "provisioning task failed, stopping gateway");
                        supervisor::terminate_gateway(&mut child, gateway.stop_timeout).await?;
                        return Err(anyhow::Error::new(err).context("provisioning task panicked"));
                    }
                };
                // Ctrl-C during provisioning leaves the gateway running.
                if cancel.is_cancelled() {
                    tracing::warn!("provisioning interrupted, waiting for gateway to exit");
                } else if let Err(err) = apply_failure_policy(result, on_failure) {
                    tracing::error!(
                        error = %format!("{err:#}"),
                        "stopping gateway after provisioning failure"
                    );
                    let status =
                        supervisor::terminate_gateway(&mut child, gateway.stop_timeout).await?;
                    tracing::info!(status = %status, "gateway stopped");
                    return Err(err);
                }
            }
        }
    }
}

/// Logs the provisioning result and decides whether it is fatal.
pub fn apply_failure_policy(
    result: Result<ProvisioningReport, AdminError>,
    policy: FailurePolicy,
) -> anyhow::Result<()> {
    let outcome = match result {
        Ok(report) => match report.ensure_success() {
            Ok(()) => {
                if !report.is_empty() {
                    tracing::info!(
                        created = report.count("created"),
                        already_existed = report.count("already_existed"),
                        "provisioning complete"
                    );
                }
                return Ok(());
            }
            Err(failed) => anyhow::Error::new(failed),
        },
        Err(err) => anyhow::Error::new(err).context("unable to construct admin client"),
    };
    match policy {
        FailurePolicy::Abort => Err(outcome),
        FailurePolicy::Log => {
            tracing::warn!(error = %format!("{outcome:#}"), "provisioning failed, continuing");
            Ok(())
        }
    }
}
