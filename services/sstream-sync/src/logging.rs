//! Logging setup for the sync binary

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILE: &str = "/var/log/glance-simplestreams-sync.log";

/// Where log lines go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    File(PathBuf),
}

impl LogTarget {
    /// `-` means stderr, anything else is a file path
    pub fn parse(value: &str) -> Self {
        if value == "-" {
            LogTarget::Stderr
        } else {
            LogTarget::File(PathBuf::from(value))
        }
    }
}

/// Open `path` for appending, creating it readable by owner and group only
pub fn open_log_file(path: &Path) -> Result<File> {
    let mut options = OpenOptions::new();
    options.create(true).append(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o640);
    }
    options
        .open(path)
        .with_context(|| format!("Failed to open log file: {:?}", path))
}

fn env_filter(verbose: bool) -> EnvFilter {
    let default = if verbose { "debug" } else { "info" };
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. `RUST_LOG` overrides the level.
pub fn init_logging(target: &LogTarget, verbose: bool, json: bool) -> Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter(verbose))
        .with_target(false);

    let result = match (target, json) {
        (LogTarget::Stderr, false) => builder.with_writer(std::io::stderr).try_init(),
        (LogTarget::Stderr, true) => builder.json().with_writer(std::io::stderr).try_init(),
        (LogTarget::File(path), false) => builder
            .with_ansi(false)
            .with_writer(Mutex::new(open_log_file(path)?))
            .try_init(),
        (LogTarget::File(path), true) => builder
            .json()
            .with_writer(Mutex::new(open_log_file(path)?))
            .try_init(),
    };

    result.map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_log_target_parse() {
        assert_eq!(LogTarget::parse("-"), LogTarget::Stderr);
        assert_eq!(
            LogTarget::parse("/var/log/gss.log"),
            LogTarget::File(PathBuf::from("/var/log/gss.log"))
        );
    }

    #[test]
    fn test_open_log_file_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.log");

        writeln!(open_log_file(&path).unwrap(), "first").unwrap();
        writeln!(open_log_file(&path).unwrap(), "second").unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\nsecond\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_open_log_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempdir().unwrap();
        let path = dir.path().join("sync.log");
        open_log_file(&path).unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        // umask can only remove bits
        assert_eq!(mode & !0o640, 0);
    }
}
