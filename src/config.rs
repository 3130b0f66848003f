use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::ValueEnum;
use serde::Deserialize;

use crate::admin::RetryPolicy;
use crate::admin::rest::DEFAULT_ENDPOINT;
use crate::provision::{InstanceTemplate, ProvisioningOptions};

pub const DEFAULT_CONFIG_FILE: &str = "shim.yaml";

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ShimConfig {
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub provisioning: ProvisioningConfig,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AdminConfig {
    #[serde(default = "default_admin_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub instance: InstanceTemplate,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            endpoint: default_admin_endpoint(),
            instance: InstanceTemplate::default(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_binary")]
    pub binary: String,
    #[serde(default = "default_hostname_flag")]
    pub hostname_flag: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            binary: default_gateway_binary(),
            hostname_flag: default_hostname_flag(),
            listen_addr: default_listen_addr(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            stop_timeout_ms: default_stop_timeout_ms(),
        }
    }
}

/// Whether the gateway waits for provisioning.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ProvisioningMode {
    /// Start the gateway right away and provision alongside it.
    #[default]
    Background,
    /// Provision first, then start the gateway.
    Blocking,
}

/// What a failed provisioning report does to the whole process.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    #[default]
    Abort,
    Log,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProvisioningConfig {
    #[serde(default)]
    pub mode: ProvisioningMode,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    #[serde(default = "default_true")]
    pub create_instances: bool,
    #[serde(default)]
    pub fail_fast: bool,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            mode: ProvisioningMode::default(),
            on_failure: FailurePolicy::default(),
            create_instances: true,
            fail_fast: false,
        }
    }
}

impl ShimConfig {
    pub fn provisioning_options(&self) -> ProvisioningOptions {
        ProvisioningOptions {
            instance_template: self.admin.instance.clone(),
            create_instances: self.provisioning.create_instances,
            fail_fast: self.provisioning.fail_fast,
        }
    }
}

pub fn load_shim_config(path: &Path) -> anyhow::Result<Option<ShimConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("unable to read {}", path.display()))?;
    if contents
        .lines()
        .all(|line| line.trim().is_empty() || line.trim().starts_with('#'))
    {
        return Ok(None);
    }
    let config: ShimConfig = serde_yaml_bw::from_str(&contents)
        .with_context(|| format!("invalid config in {}", path.display()))?;
    Ok(Some(config))
}

/// Loads an explicitly requested file, or `shim.yaml` from the working
/// directory when present. Only an explicit path is required to exist.
pub fn resolve_config(explicit: Option<&Path>) -> anyhow::Result<ShimConfig> {
    if let Some(path) = explicit {
        if !path.exists() {
            anyhow::bail!("config file not found: {}", path.display());
        }
        return Ok(load_shim_config(path)?.unwrap_or_default());
    }
    Ok(load_shim_config(Path::new(DEFAULT_CONFIG_FILE))?.unwrap_or_default())
}

fn default_admin_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_gateway_binary() -> String {
    "./gateway_main".to_string()
}

fn default_hostname_flag() -> String {
    "--hostname".to_string()
}

fn default_listen_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_stop_timeout_ms() -> u64 {
    5_000
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_and_comment_only_files_are_absent() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("shim.yaml");
        assert!(load_shim_config(&path)?.is_none());
        std::fs::write(&path, "# nothing here\n\n")?;
        assert!(load_shim_config(&path)?.is_none());
        Ok(())
    }

    #[test]
    fn partial_file_keeps_defaults() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("shim.yaml");
        std::fs::write(
            &path,
            "provisioning:\n  mode: blocking\n  on_failure: log\ngateway:\n  args: [\"--verbose\"]\nadmin:\n  retry:\n    max_attempts: 3\n",
        )?;
        let config = load_shim_config(&path)?.expect("config should load");
        assert_eq!(config.provisioning.mode, ProvisioningMode::Blocking);
        assert_eq!(config.provisioning.on_failure, FailurePolicy::Log);
        assert!(config.provisioning.create_instances);
        assert_eq!(config.gateway.binary, "./gateway_main");
        assert_eq!(config.gateway.args, vec!["--verbose".to_string()]);
        assert_eq!(config.admin.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.admin.retry.max_attempts, Some(3));
        assert_eq!(config.admin.retry.base_delay_ms, 100);
        assert_eq!(config.admin.instance.config, "emulator-config");
        Ok(())
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempdir().unwrap();
        let err = resolve_config(Some(&dir.path().join("absent.yaml"))).unwrap_err();
        assert!(err.to_string().contains("config file not found"));
    }

    #[test]
    fn options_follow_provisioning_section() {
        let mut config = ShimConfig::default();
        config.provisioning.create_instances = false;
        config.provisioning.fail_fast = true;
        config.admin.instance.node_count = 3;
        let options = config.provisioning_options();
        assert!(!options.create_instances);
        assert!(options.fail_fast);
        assert_eq!(options.instance_template.node_count, 3);
    }
}
