//! External host provisioning.
//!
//! Templated machines are created by a docker-machine style command. All of
//! its state lives under a storage directory (`MACHINE_STORAGE_PATH`), which
//! the machine controller checkpoints into the encrypted store.

use async_trait::async_trait;
use driver_gateway::DriverError;
use driver_gateway::process::run_streaming;
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors from the host-provisioning command
#[derive(Debug, Error)]
pub enum HostError {
    /// The host is already there
    #[error("host {0} already exists")]
    AlreadyExists(String),

    /// Command exited unsuccessfully
    #[error("{command} failed: {message}")]
    Command {
        /// Command line that failed
        command: String,
        /// Tail of its output
        message: String,
    },

    /// Process could not be run
    #[error("host command error: {0}")]
    Process(String),
}

impl HostError {
    fn from_driver(host: &str, err: DriverError) -> Self {
        match err {
            DriverError::Command { message, .. } if message.contains("already exists") => {
                Self::AlreadyExists(host.to_string())
            }
            DriverError::Command { command, message } => Self::Command { command, message },
            other => Self::Process(other.to_string()),
        }
    }
}

/// Everything needed to create one host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostRequest {
    /// Name the host is created under
    pub hostname: String,
    /// Host-provisioning driver, e.g. `amazonec2`
    pub driver: String,
    /// Container engine install script
    pub engine_install_url: String,
    /// Driver flags, e.g. `{"region": "us-west-2"}`
    pub config: Map<String, Value>,
}

/// Creates and destroys hosts inside a storage directory.
#[async_trait]
pub trait HostProvisioner: Send + Sync {
    async fn create(&self, request: &HostRequest, storage: &Path) -> Result<(), HostError>;

    async fn exists(&self, hostname: &str, storage: &Path) -> Result<bool, HostError>;

    async fn remove(&self, hostname: &str, storage: &Path) -> Result<(), HostError>;
}

/// [`HostProvisioner`] running a docker-machine compatible binary.
#[derive(Debug, Clone)]
pub struct MachineCommand {
    binary: String,
}

impl MachineCommand {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    fn command(&self, storage: &Path, args: &[String]) -> Command {
        let mut command = Command::new(&self.binary);
        command.env("MACHINE_STORAGE_PATH", storage).args(args);
        command
    }

    async fn run(&self, hostname: &str, storage: &Path, args: Vec<String>) -> Result<(), HostError> {
        let command = self.command(storage, &args);
        run_streaming(
            command,
            |line| debug!(host = %hostname, "{}", line),
            &CancellationToken::new(),
        )
        .await
        .map(|_| ())
        .map_err(|e| HostError::from_driver(hostname, e))
    }
}

/// `camelCase` or `snake_case` flag name to `kebab-case`.
fn kebab(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for (i, c) in key.chars().enumerate() {
        if c.is_ascii_uppercase() {
            if i > 0 {
                out.push('-');
            }
            out.push(c.to_ascii_lowercase());
        } else if c == '_' {
            out.push('-');
        } else {
            out.push(c);
        }
    }
    out
}

/// Arguments of the create command.
///
/// Each config entry becomes `--<driver>-<kebab key>`; `true` booleans are
/// bare flags, arrays repeat the flag, empty and `false` values are skipped.
pub fn create_args(request: &HostRequest) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "-d".to_string(),
        request.driver.clone(),
    ];
    if !request.engine_install_url.is_empty() {
        args.push("--engine-install-url".to_string());
        args.push(request.engine_install_url.clone());
    }

    let mut keys: Vec<&String> = request.config.keys().collect();
    keys.sort();
    for key in keys {
        let flag = format!("--{}-{}", request.driver, kebab(key));
        match &request.config[key] {
            Value::Bool(true) => args.push(flag),
            Value::Bool(false) | Value::Null => {}
            Value::String(s) if s.is_empty() => {}
            Value::String(s) => {
                args.push(flag);
                args.push(s.clone());
            }
            Value::Array(items) => {
                for item in items {
                    args.push(flag.clone());
                    args.push(match item {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                }
            }
            other => {
                args.push(flag);
                args.push(other.to_string());
            }
        }
    }

    args.push(request.hostname.clone());
    args
}

#[async_trait]
impl HostProvisioner for MachineCommand {
    async fn create(&self, request: &HostRequest, storage: &Path) -> Result<(), HostError> {
        self.run(&request.hostname, storage, create_args(request)).await
    }

    async fn exists(&self, hostname: &str, storage: &Path) -> Result<bool, HostError> {
        let dir = storage.join("machines").join(hostname);
        tokio::fs::try_exists(&dir)
            .await
            .map_err(|e| HostError::Process(e.to_string()))
    }

    async fn remove(&self, hostname: &str, storage: &Path) -> Result<(), HostError> {
        let args = vec!["rm".to_string(), "-f".to_string(), "-y".to_string(), hostname.to_string()];
        self.run(hostname, storage, args).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(config: Value) -> HostRequest {
        HostRequest {
            hostname: "n1".to_string(),
            driver: "amazonec2".to_string(),
            engine_install_url: "https://get.docker.com".to_string(),
            config: config.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_create_args_follow_flag_convention() {
        let args = create_args(&request(json!({
            "region": "us-west-2",
            "instanceType": "t3.large",
            "privateAddressOnly": true,
            "useEbsOptimizedInstance": false,
            "rootSize": 64,
            "securityGroup": ["default", "nodes"],
            "sessionToken": ""
        })));

        assert_eq!(
            args,
            vec![
                "create",
                "-d",
                "amazonec2",
                "--engine-install-url",
                "https://get.docker.com",
                "--amazonec2-instance-type",
                "t3.large",
                "--amazonec2-private-address-only",
                "--amazonec2-region",
                "us-west-2",
                "--amazonec2-root-size",
                "64",
                "--amazonec2-security-group",
                "default",
                "--amazonec2-security-group",
                "nodes",
                "n1",
            ]
        );
    }

    #[test]
    fn test_kebab_case() {
        assert_eq!(kebab("sshUser"), "ssh-user");
        assert_eq!(kebab("vpc_id"), "vpc-id");
        assert_eq!(kebab("region"), "region");
    }

    #[test]
    fn test_already_exists_output_is_recognised() {
        let err = HostError::from_driver(
            "n1",
            DriverError::Command {
                command: "docker-machine create".to_string(),
                message: "Host already exists: \"n1\"".to_string(),
            },
        );
        assert!(matches!(err, HostError::AlreadyExists(host) if host == "n1"));
    }

    #[tokio::test]
    async fn test_exists_checks_storage_directory() {
        let tmp = tempfile::TempDir::new().unwrap();
        let host = MachineCommand::new("docker-machine");
        assert!(!host.exists("n1", tmp.path()).await.unwrap());

        std::fs::create_dir_all(tmp.path().join("machines/n1")).unwrap();
        assert!(host.exists("n1", tmp.path()).await.unwrap());
    }
}
