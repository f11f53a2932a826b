//! Juju Unit Tools
//!
//! The sync runs from cron, outside any hook, so hook tools are reached
//! through `juju-run <unit> '<cmd>'`. When started from an action the hook
//! context is already present and tools are called directly.

use std::env;
use std::fmt;
use std::process::Command;

use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};
use crate::proxy::{parse_proxy_settings, ProxySettings};
use crate::reconcile::EndpointUpdate;

/// Relation the product-streams endpoint is announced on
pub const IDENTITY_RELATION: &str = "identity-service";

/// Workload status values the sync sets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadStatus {
    Maintenance,
    Active,
    Blocked,
}

impl fmt::Display for WorkloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkloadStatus::Maintenance => write!(f, "maintenance"),
            WorkloadStatus::Active => write!(f, "active"),
            WorkloadStatus::Blocked => write!(f, "blocked"),
        }
    }
}

/// Status channel. Failures to report are logged, never raised.
pub trait StatusReporter {
    fn status_set(&self, status: WorkloadStatus, message: &str);
}

/// Announces product-streams endpoint changes to the identity service
pub trait EndpointNotifier {
    fn update_endpoints(&self, update: &EndpointUpdate) -> Result<()>;
}

/// Source of the model's proxy configuration
pub trait ProxySource {
    fn proxy_settings(&self) -> Result<Option<ProxySettings>>;
}

/// Hook tools for one unit
#[derive(Debug, Clone)]
pub struct JujuTools {
    unit_name: String,
    in_hook_context: bool,
}

impl JujuTools {
    /// Detect the hook context from `JUJU_CONTEXT_ID`
    pub fn new(unit_name: impl Into<String>) -> Self {
        Self::with_hook_context(unit_name, env::var_os("JUJU_CONTEXT_ID").is_some())
    }

    pub fn with_hook_context(unit_name: impl Into<String>, in_hook_context: bool) -> Self {
        Self {
            unit_name: unit_name.into(),
            in_hook_context,
        }
    }

    /// Full argument vector for a hook tool invocation
    fn command_line(&self, cmd: &[String]) -> Vec<String> {
        if self.in_hook_context {
            cmd.to_vec()
        } else {
            vec!["juju-run".to_string(), self.unit_name.clone(), cmd.join(" ")]
        }
    }

    fn run(&self, cmd: &[String]) -> Result<String> {
        let argv = self.command_line(cmd);
        info!(command = ?argv, "Executing command");

        let (program, args) = argv
            .split_first()
            .ok_or_else(|| SyncError::command("", "empty command line"))?;

        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| SyncError::command(argv.join(" "), e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SyncError::command(
                argv.join(" "),
                format!("exited with {}: {}", output.status, stderr.trim()),
            ));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn status_command(&self, status: WorkloadStatus, message: &str) -> Vec<String> {
        // juju-run joins the command into one shell string
        let message = if self.in_hook_context {
            message.to_string()
        } else {
            format!("\"{}\"", message)
        };
        vec!["status-set".to_string(), status.to_string(), message]
    }

    fn relation_set_command(relation_id: &str, update: &EndpointUpdate) -> Vec<String> {
        let mut cmd = vec![
            "relation-set".to_string(),
            "-r".to_string(),
            relation_id.to_string(),
        ];
        cmd.extend(update.relation_data().map(|(k, v)| format!("{}={}", k, v)));
        cmd
    }
}

impl StatusReporter for JujuTools {
    fn status_set(&self, status: WorkloadStatus, message: &str) {
        if let Err(e) = self.run(&self.status_command(status, message)) {
            warn!(error = %e, status = %status, message, "Could not set workload status");
        }
    }
}

impl EndpointNotifier for JujuTools {
    fn update_endpoints(&self, update: &EndpointUpdate) -> Result<()> {
        let ids = self.run(&["relation-ids".to_string(), IDENTITY_RELATION.to_string()])?;
        for rid in ids.split_whitespace() {
            info!(relation_id = rid, "Updating relation data");
            self.run(&Self::relation_set_command(rid, update))?;
        }
        Ok(())
    }
}

impl ProxySource for JujuTools {
    fn proxy_settings(&self) -> Result<Option<ProxySettings>> {
        let output = self.run(&["env".to_string()])?;
        let settings = parse_proxy_settings(&output);
        debug!(configured = settings.is_some(), "Read model proxy settings");
        Ok(settings)
    }
}
