use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::Context;
use tokio::process::{Child, Command};

use crate::config::GatewayConfig;

#[derive(Clone, Debug)]
pub struct GatewaySpec {
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub stop_timeout: Duration,
}

impl GatewaySpec {
    /// `binary <hostname-flag> <listen-addr> [args...]`
    pub fn from_config(config: &GatewayConfig) -> Self {
        let mut argv = vec![
            config.binary.clone(),
            config.hostname_flag.clone(),
            config.listen_addr.clone(),
        ];
        argv.extend(config.args.iter().cloned());
        Self {
            argv,
            cwd: config.cwd.clone(),
            env: config.env.clone(),
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
        }
    }
}

/// Starts the gateway with the shim's own stdout/stderr. Dropping the handle
/// kills the gateway.
pub fn spawn_gateway(spec: &GatewaySpec) -> anyhow::Result<Child> {
    let Some((program, args)) = spec.argv.split_first() else {
        return Err(anyhow::anyhow!("gateway argv cannot be empty"));
    };
    let mut command = Command::new(program);
    command.args(args);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    command.envs(spec.env.iter());
    let child = command
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .with_context(|| format!("unable to start gateway {program}"))?;
    tracing::info!(
        program = %program,
        args = ?args,
        pid = child.id(),
        "gateway started"
    );
    Ok(child)
}

/// Runs the gateway to completion.
pub async fn run_gateway(spec: &GatewaySpec) -> anyhow::Result<ExitStatus> {
    let mut child = spawn_gateway(spec)?;
    let status = child
        .wait()
        .await
        .context("failed waiting for gateway")?;
    tracing::info!(status = %status, "gateway exited");
    Ok(status)
}

/// Asks the gateway to stop, then kills it once `graceful_timeout` passes.
pub async fn terminate_gateway(
    child: &mut Child,
    graceful_timeout: Duration,
) -> anyhow::Result<ExitStatus> {
    if let Some(status) = child.try_wait()? {
        return Ok(status);
    }

    #[cfg(unix)]
    if let Some(pid) = child.id() {
        let _ = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if let Ok(status) = tokio::time::timeout(graceful_timeout, child.wait()).await {
            return Ok(status?);
        }
        tracing::warn!(
            pid,
            timeout_ms = graceful_timeout.as_millis() as u64,
            "gateway ignored SIGTERM, killing"
        );
    }

    #[cfg(not(unix))]
    let _ = graceful_timeout;

    child.kill().await.context("unable to kill gateway")?;
    Ok(child.wait().await?)
}

/// Exit code to report for a finished gateway; signals map to 128 + signo.
pub fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_binds_all_interfaces_by_default() {
        let mut config = GatewayConfig::default();
        config.args = vec!["--port".to_string(), "8080".to_string()];
        let spec = GatewaySpec::from_config(&config);
        assert_eq!(
            spec.argv,
            vec!["./gateway_main", "--hostname", "0.0.0.0", "--port", "8080"]
        );
        assert_eq!(spec.stop_timeout, Duration::from_secs(5));
    }

    #[test]
    fn empty_argv_is_rejected() {
        let spec = GatewaySpec {
            argv: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
            stop_timeout: Duration::from_millis(10),
        };
        assert!(spawn_gateway(&spec).is_err());
    }
}
