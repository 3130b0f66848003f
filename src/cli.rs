use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use crate::admin::{RestTransport, RetryPolicy};
use crate::config::{self, FailurePolicy, ProvisioningMode, ShimConfig};
use crate::logging::{self, Level};
use crate::provision::{self, AdminSettings};
use crate::smoke::{self, SmokeTarget};
use crate::startup::{self, StartupPlan};
use crate::supervisor::GatewaySpec;
use crate::targets::TargetInputs;

const SMOKE_ATTEMPTS: u32 = 5;

#[derive(Parser)]
#[command(name = "spanner-gateway-shim")]
#[command(about = "Provision Spanner emulator resources and run the gateway", version)]
pub struct Cli {
    /// YAML config file (defaults to ./shim.yaml when present).
    #[arg(long, global = true, env = "SHIM_CONFIG")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_enum, default_value_t = Level::Info)]
    log_level: Level,
    /// Write shim.log into this directory instead of stderr.
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Up(UpArgs),
    Provision(ProvisionArgs),
    Smoke(SmokeArgs),
}

#[derive(Parser)]
struct TargetArgs {
    #[arg(long, env = "SPANNER_PROJECT_ID", default_value = "")]
    project: String,
    #[arg(long, env = "SPANNER_INSTANCE_ID", default_value = "")]
    instance: String,
    #[arg(long, env = "SPANNER_DATABASE_ID", default_value = "")]
    database: String,
    /// Comma-separated `projects/<p>/instances/<i>[/databases/<d>]` paths.
    #[arg(long, env = "SPANNER_RESOURCE_PATHS", default_value = "")]
    resources: String,
}

impl TargetArgs {
    fn inputs(&self) -> TargetInputs {
        TargetInputs {
            project: self.project.clone(),
            instance: self.instance.clone(),
            database: self.database.clone(),
            resource_paths: self.resources.clone(),
        }
    }
}

#[derive(Parser)]
struct AdminArgs {
    /// Emulator REST endpoint, `host:port` or `http://host:port`.
    #[arg(long, env = "SPANNER_EMULATOR_REST_HOST")]
    admin_endpoint: Option<String>,
    /// Assume instances exist and only create databases.
    #[arg(long)]
    skip_instance_creation: bool,
    /// Stop starting new creations after the first failure.
    #[arg(long)]
    fail_fast: bool,
}

impl AdminArgs {
    fn apply(&self, config: &mut ShimConfig) {
        if let Some(endpoint) = &self.admin_endpoint {
            config.admin.endpoint = endpoint.clone();
        }
        if self.skip_instance_creation {
            config.provisioning.create_instances = false;
        }
        if self.fail_fast {
            config.provisioning.fail_fast = true;
        }
    }
}

#[derive(Parser)]
#[command(
    about = "Provision resources and run the gateway in the foreground.",
    after_help = "Arguments after `--` are passed to the gateway."
)]
struct UpArgs {
    #[command(flatten)]
    targets: TargetArgs,
    #[command(flatten)]
    admin: AdminArgs,
    #[arg(long, value_enum, env = "SHIM_PROVISIONING_MODE")]
    mode: Option<ProvisioningMode>,
    #[arg(long, value_enum, env = "SHIM_ON_FAILURE")]
    on_failure: Option<FailurePolicy>,
    #[arg(long, env = "SHIM_GATEWAY_BINARY")]
    gateway_binary: Option<String>,
    #[arg(long)]
    listen_addr: Option<String>,
    #[arg(last = true)]
    gateway_args: Vec<String>,
}

#[derive(Parser)]
#[command(about = "Provision resources once and print the report.")]
struct ProvisionArgs {
    #[command(flatten)]
    targets: TargetArgs,
    #[command(flatten)]
    admin: AdminArgs,
    #[arg(long)]
    json: bool,
}

#[derive(Parser)]
#[command(about = "Run a trivial query against the configured database.")]
struct SmokeArgs {
    #[command(flatten)]
    targets: TargetArgs,
    #[arg(long, env = "SPANNER_EMULATOR_REST_HOST")]
    admin_endpoint: Option<String>,
}

impl Cli {
    pub fn run(self) -> anyhow::Result<()> {
        logging::init(self.log_dir.clone(), self.log_level)?;
        let config = config::resolve_config(self.config.as_deref())?;
        let runtime = Runtime::new().context("failed to create tokio runtime")?;
        let cancel = CancellationToken::new();
        let signal_cancel = cancel.clone();
        runtime.spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received, cancelling provisioning");
                signal_cancel.cancel();
            }
        });
        match self.command {
            Command::Up(args) => {
                let code = runtime.block_on(args.run(config, cancel))?;
                if code != 0 {
                    std::process::exit(code);
                }
                Ok(())
            }
            Command::Provision(args) => runtime.block_on(args.run(config, cancel)),
            Command::Smoke(args) => runtime.block_on(args.run(config, cancel)),
        }
    }
}

fn admin_settings(config: &ShimConfig) -> AdminSettings {
    AdminSettings {
        endpoint: config.admin.endpoint.clone(),
        retry: config.admin.retry.clone(),
    }
}

impl UpArgs {
    async fn run(self, mut config: ShimConfig, cancel: CancellationToken) -> anyhow::Result<i32> {
        self.admin.apply(&mut config);
        if let Some(mode) = self.mode {
            config.provisioning.mode = mode;
        }
        if let Some(policy) = self.on_failure {
            config.provisioning.on_failure = policy;
        }
        if let Some(binary) = self.gateway_binary {
            config.gateway.binary = binary;
        }
        if let Some(addr) = self.listen_addr {
            config.gateway.listen_addr = addr;
        }
        config.gateway.args.extend(self.gateway_args);

        let plan = StartupPlan {
            targets: self.targets.inputs().targets(),
            admin: admin_settings(&config),
            options: config.provisioning_options(),
            mode: config.provisioning.mode,
            on_failure: config.provisioning.on_failure,
            gateway: GatewaySpec::from_config(&config.gateway),
        };
        startup::run(plan, cancel).await
    }
}

impl ProvisionArgs {
    async fn run(self, mut config: ShimConfig, cancel: CancellationToken) -> anyhow::Result<()> {
        self.admin.apply(&mut config);
        let targets = self.targets.inputs().targets();
        let report = provision::provision_targets(
            &admin_settings(&config),
            &targets,
            config.provisioning_options(),
            &cancel,
        )
        .await
        .context("unable to construct admin client")?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&report.to_json())?);
        } else if report.is_empty() {
            println!("nothing to provision");
        } else {
            for entry in &report.outcomes {
                match &entry.outcome {
                    provision::CreationOutcome::Failed(cause) => {
                        println!("{:<15} {} ({cause})", entry.outcome.label(), entry.resource)
                    }
                    outcome => println!("{:<15} {}", outcome.label(), entry.resource),
                }
            }
        }
        report.ensure_success()?;
        Ok(())
    }
}

impl SmokeArgs {
    async fn run(self, config: ShimConfig, cancel: CancellationToken) -> anyhow::Result<()> {
        let target = SmokeTarget::new(
            &self.targets.project,
            &self.targets.instance,
            &self.targets.database,
        )?;
        let endpoint = self.admin_endpoint.unwrap_or(config.admin.endpoint);
        let retry = RetryPolicy {
            max_attempts: Some(SMOKE_ATTEMPTS),
            ..config.admin.retry
        };
        let transport = RestTransport::connect(&endpoint, retry)
            .with_context(|| format!("failed to create client for {endpoint}"))?;
        smoke::run(&transport, &target, &cancel).await?;
        tracing::info!(
            database = %target.database_path(),
            "successfully connected to the emulator and executed query"
        );
        println!("ok {}", target.database_path());
        Ok(())
    }
}
