//! Device session lifecycle: detect, open, eject, shutdown.
//!
//! A session starts `Closed`. `detect` probes `rmapi -ni account`; once it
//! has succeeded the device is assumed present until `eject`. `open` refreshes
//! capacity (best effort) and makes sure the export folder exists.

use std::io::Write;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use tempfile::TempDir;
use thiserror::Error;

use super::capacity::{self, DeviceCapacity};
use super::catalog::Catalog;
use super::runner::{CommandOutput, CommandRunner, Invocation, RunError};
use super::transfer::UploadReport;
use crate::config::DeviceConfig;

static SYNC_VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"SyncVersion:\s*(\d+)").expect("sync version regex"));

/// Errors surfaced by device operations.
///
/// Per-item command failures are not errors; they are reported in the
/// operation's outcome.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error(transparent)]
    Runner(#[from] RunError),

    #[error(
        "no space left on device for {}: {size} bytes needed, {free} of {total} bytes free",
        .file.display()
    )]
    FreeSpace {
        file: PathBuf,
        size: u64,
        free: u64,
        total: u64,
        /// Items handled before the batch stopped.
        completed: UploadReport,
    },

    #[error("device session not started")]
    NotStarted,

    #[error("{files} files but {names} names or metadata records")]
    MetadataMismatch { files: usize, names: usize },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Closed,
    Detecting,
    Open,
}

/// Identity reported to the host.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub version: u32,
    /// Sync protocol version from `rmapi account`, when reported.
    pub software_version: Option<u32>,
    pub model: String,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            name: "rMAPI".to_string(),
            version: 2,
            software_version: None,
            model: "reMarkable".to_string(),
        }
    }
}

/// A reMarkable tablet reached through `rmapi`.
pub struct RemarkableDevice<R: CommandRunner> {
    pub(crate) config: DeviceConfig,
    pub(crate) runner: R,
    pub(crate) state: SessionState,
    pub(crate) seen_device: bool,
    pub(crate) capacity: DeviceCapacity,
    pub(crate) info: DeviceInfo,
    pub(crate) catalog: Catalog,
    pub(crate) working_dir: Option<TempDir>,
}

impl<R: CommandRunner> RemarkableDevice<R> {
    pub fn new(config: DeviceConfig, runner: R) -> Self {
        Self {
            config,
            runner,
            state: SessionState::Closed,
            seen_device: false,
            capacity: DeviceCapacity::unknown(),
            info: DeviceInfo::default(),
            catalog: Catalog::new(),
            working_dir: None,
        }
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn is_detected(&self) -> bool {
        self.seen_device
    }

    pub fn capacity(&self) -> DeviceCapacity {
        self.capacity
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Replace the catalog, e.g. with one restored from disk.
    pub fn set_catalog(&mut self, catalog: Catalog) {
        self.catalog = catalog;
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_ref().map(TempDir::path)
    }

    /// Allocate the scratch directory used by file retrieval.
    pub fn startup(&mut self) -> Result<(), DeviceError> {
        if self.working_dir.is_none() {
            let dir = tempfile::Builder::new().prefix("rmdev_").tempdir()?;
            tracing::debug!(dir = %dir.path().display(), "working directory allocated");
            self.working_dir = Some(dir);
        }
        Ok(())
    }

    /// Check that `rmapi` is installed and authenticated.
    ///
    /// Returns `Ok(false)` when the probe exits non-zero or times out; only a
    /// binary that cannot be spawned is an error.
    pub fn detect(&mut self) -> Result<bool, DeviceError> {
        if self.seen_device {
            return Ok(true);
        }

        self.state = SessionState::Detecting;
        tracing::info!(
            rmapi = %self.config.rmapi.display(),
            resolved = ?which::which(&self.config.rmapi).ok(),
            "probing rmapi"
        );

        match self.account_probe() {
            Ok(output) if output.success() => {
                self.seen_device = true;
                if let Some(version) = parse_sync_version(&output.stdout_lossy()) {
                    self.info.software_version = Some(version);
                }
                tracing::info!(
                    software_version = ?self.info.software_version,
                    "device detected"
                );
                Ok(true)
            }
            Ok(output) => {
                self.state = SessionState::Closed;
                tracing::warn!(
                    exit_code = ?output.exit_code,
                    "rmapi not configured, run `rmapi` once to authenticate"
                );
                Ok(false)
            }
            Err(RunError::TimedOut { timeout, .. }) => {
                self.state = SessionState::Closed;
                tracing::warn!(timeout_secs = timeout.as_secs(), "rmapi probe timed out");
                Ok(false)
            }
            Err(e) => {
                self.state = SessionState::Closed;
                Err(e.into())
            }
        }
    }

    /// Write a detection report without changing session state.
    pub fn debug_detection(&self, out: &mut dyn Write) -> Result<bool, DeviceError> {
        writeln!(out, "rmapi binary: {}", self.config.rmapi.display())?;
        match which::which(&self.config.rmapi) {
            Ok(path) => writeln!(out, "resolved to: {}", path.display())?,
            Err(e) => writeln!(out, "not resolvable on PATH: {e}")?,
        }

        let detected = match self.account_probe() {
            Ok(output) => {
                writeln!(out, "account probe exit code: {:?}", output.exit_code)?;
                match parse_sync_version(&output.stdout_lossy()) {
                    Some(v) => writeln!(out, "sync version: {v}")?,
                    None => writeln!(out, "sync version: unknown")?,
                }
                output.success()
            }
            Err(e) => {
                writeln!(out, "account probe failed: {e}")?;
                false
            }
        };
        writeln!(
            out,
            "device {}",
            if detected { "detected" } else { "not detected" }
        )?;
        Ok(detected)
    }

    /// Attach to the device: refresh capacity and ensure the export folder.
    pub fn open(&mut self) -> Result<(), DeviceError> {
        tracing::info!("opening reMarkable device");
        self.state = SessionState::Open;
        self.refresh_capacity();
        self.ensure_export_dir()
    }

    /// Re-run the capacity probe. Failure leaves capacity unknown.
    pub fn refresh_capacity(&mut self) {
        match capacity::probe(
            &self.runner,
            &self.config.capacity_command,
            self.config.timeout(),
        ) {
            Ok(cap) => self.capacity = cap,
            Err(e) => {
                tracing::info!(error = %e, "device capacity unavailable");
                self.capacity = DeviceCapacity::unknown();
            }
        }
    }

    /// `mkdir` each level of the export path, tolerating existing folders.
    fn ensure_export_dir(&mut self) -> Result<(), DeviceError> {
        let export = self.config.export_dir().to_string();
        let mut prefix = String::new();
        for segment in export.split('/').filter(|s| !s.is_empty()) {
            if !prefix.is_empty() {
                prefix.push('/');
            }
            prefix.push_str(segment);

            let output = self.rmapi_soft(&["mkdir", prefix.as_str()])?;
            if !output.success() {
                tracing::debug!(
                    dir = %prefix,
                    exit_code = ?output.exit_code,
                    "mkdir failed, assuming folder exists"
                );
            }
        }
        Ok(())
    }

    /// Forget the device. Safe to call repeatedly.
    pub fn eject(&mut self) {
        self.seen_device = false;
        self.state = SessionState::Closed;
    }

    pub fn post_yank_cleanup(&mut self) {
        self.eject();
    }

    pub fn stop_plugin(&mut self) {
        self.eject();
    }

    /// Eject and remove the working directory.
    pub fn shutdown(&mut self) {
        self.eject();
        if let Some(dir) = self.working_dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close()
                && e.kind() != std::io::ErrorKind::NotFound
            {
                tracing::warn!(dir = %path.display(), error = %e, "failed to remove working directory");
            }
        }
    }

    pub fn device_information(&self) -> &DeviceInfo {
        &self.info
    }

    /// Storage cards on the device: none.
    pub fn card_prefix(&self) -> (Option<String>, Option<String>) {
        (None, None)
    }

    pub fn total_space(&self) -> Option<u64> {
        self.capacity.total
    }

    pub fn free_space(&self) -> Option<u64> {
        self.capacity.free
    }

    /// Swap in a new configuration.
    pub fn apply_config(&mut self, config: DeviceConfig) {
        self.config = config;
    }

    fn account_probe(&self) -> Result<CommandOutput, RunError> {
        let invocation = self.rmapi_invocation(["-ni", "account"]);
        self.runner.run(&invocation)
    }

    pub(crate) fn rmapi_invocation<I, S>(&self, args: I) -> Invocation
    where
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString>,
    {
        Invocation::new(&self.config.rmapi, self.config.timeout()).args(args)
    }

    /// Run an rmapi subcommand, folding a timeout into a failed exit.
    ///
    /// Spawn and wait failures still propagate.
    pub(crate) fn rmapi_soft<S: AsRef<std::ffi::OsStr>>(
        &self,
        args: &[S],
    ) -> Result<CommandOutput, DeviceError> {
        let invocation = self.rmapi_invocation(args.iter().map(|a| a.as_ref().to_os_string()));
        self.run_soft(&invocation)
    }

    pub(crate) fn run_soft(&self, invocation: &Invocation) -> Result<CommandOutput, DeviceError> {
        match self.runner.run(invocation) {
            Ok(output) => Ok(output),
            Err(RunError::TimedOut { program, timeout }) => {
                tracing::warn!(
                    program = %program,
                    args = ?invocation.args_lossy(),
                    timeout_secs = timeout.as_secs(),
                    "command timed out"
                );
                Ok(CommandOutput {
                    exit_code: None,
                    stdout: Vec::new(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Extract the `SyncVersion: <n>` value from `rmapi account` output.
pub fn parse_sync_version(output: &str) -> Option<u32> {
    SYNC_VERSION_RE
        .captures(output)
        .and_then(|caps| caps[1].parse().ok())
}
