//! Image Mirroring
//!
//! Runs `sstream-mirror-glance` once per configured mirror. Image metadata
//! goes either straight to the object store or into a scratch directory that
//! is rsynced to the local web root afterwards.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, info};

use crate::config::{MirrorConfig, MirrorInfo};
use crate::error::{Result, SyncError};
use crate::reconcile::SWIFT_DATA_DIR;

pub const SSTREAM_MIRROR_GLANCE: &str = "/snap/bin/simplestreams.sstream-mirror-glance";
pub const KEYRING: &str = "/usr/share/keyrings/ubuntu-cloudimage-keyring.gpg";
pub const SSTREAM_LOG_FILE: &str = "/var/snap/simplestreams/common/sstream-mirror-glance.log";
pub const APACHE_DATA_DIR: &str = "/var/www/html";

/// Where a mirror run writes its stream metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputTarget {
    ObjectStore,
    Directory(PathBuf),
}

/// Runs external programs with an explicit environment
pub trait CommandRunner {
    /// Run to completion; non-zero exit is an error.
    ///
    /// `env` is added on top of the inherited process environment.
    fn run(&self, program: &str, args: &[String], env: &BTreeMap<String, String>) -> Result<()>;
}

/// [`CommandRunner`] backed by real child processes
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, program: &str, args: &[String], env: &BTreeMap<String, String>) -> Result<()> {
        let command_line = format!("{} {}", program, args.join(" "));
        debug!(command = %command_line, "Executing command");

        let status = Command::new(program)
            .args(args)
            .envs(env)
            .status()
            .map_err(|e| SyncError::command(&command_line, e.to_string()))?;

        if !status.success() {
            return Err(SyncError::command(command_line, format!("exited with {}", status)));
        }
        Ok(())
    }
}

/// Argument vector for one `sstream-mirror-glance` invocation
pub fn sync_command_args(config: &MirrorConfig, mirror: &MirrorInfo, output: &OutputTarget) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-vv".into(),
        "--keep".into(),
        "--max".into(),
        mirror.max.to_string(),
        "--content-id".into(),
        config.content_id(),
        "--cloud-name".into(),
        config.cloud_name.clone(),
        "--path".into(),
        mirror.path.clone(),
        "--name-prefix".into(),
        config.name_prefix.clone(),
        "--keyring".into(),
        KEYRING.into(),
        "--log-file".into(),
        SSTREAM_LOG_FILE.into(),
    ];

    match output {
        OutputTarget::ObjectStore => {
            args.push("--output-swift".into());
            args.push(SWIFT_DATA_DIR.into());
        }
        OutputTarget::Directory(dir) => {
            args.push("--output-dir".into());
            args.push(dir.display().to_string());
        }
    }

    if config.hypervisor_mapping {
        args.push("--hypervisor-mapping".into());
    }
    for property in config.custom_properties() {
        args.push("--custom-property".into());
        args.push(property.to_string());
    }

    args.push(mirror.url.clone());
    args.extend(mirror.item_filters.iter().cloned());
    args
}

/// `rsync` arguments publishing a local mirror to the web root
fn publish_args(output_dir: &Path, region: &str) -> Vec<String> {
    vec![
        "-avz".into(),
        output_dir.join(region).join("streams").display().to_string(),
        APACHE_DATA_DIR.into(),
    ]
}

/// Mirror every configured source.
///
/// Scratch directories are created under `work_dir` (the snap can only
/// write below `$HOME`) and removed when each mirror finishes, whatever the
/// outcome. Stops at the first failing command.
pub fn do_sync<R: CommandRunner + ?Sized>(
    config: &MirrorConfig,
    env: &BTreeMap<String, String>,
    runner: &R,
    work_dir: &Path,
) -> Result<()> {
    for mirror in &config.mirror_list {
        let scratch = tempfile::Builder::new()
            .prefix("sstream-")
            .tempdir_in(work_dir)?;

        info!(url = %mirror.url, path = %mirror.path, max = mirror.max, "Configuring sync for mirror");

        let output = if config.use_swift {
            OutputTarget::ObjectStore
        } else {
            OutputTarget::Directory(scratch.path().to_path_buf())
        };

        info!("Calling sstream-mirror-glance");
        runner.run(SSTREAM_MIRROR_GLANCE, &sync_command_args(config, mirror, &output), env)?;

        if !config.use_swift {
            runner.run("rsync", &publish_args(scratch.path(), &config.region), env)?;
        }
    }
    Ok(())
}
