//! Device storage accounting.
//!
//! `rmapi` has no space-accounting command, so capacity comes from a second
//! transport: a `df` run on the tablet over SSH. The report's second line is
//! parsed as `<fs> <total> <used> <avail> <pct> <mount>` in 1K blocks.
//!
//! Capacity is an estimate. After a probe the session keeps it current by
//! debiting uploads and crediting deletes; any failure to probe leaves both
//! numbers unknown, which disables admission checks entirely.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use super::runner::{CommandRunner, Invocation, RunError};

/// `df` reports sizes in 1K blocks.
pub const DF_BLOCK_SIZE: u64 = 1024;

/// Upper bound for the `ssh -o ConnectTimeout` value, in seconds.
const SSH_CONNECT_TIMEOUT_CAP_SECS: u64 = 30;

static DF_LINE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*(/\S*)\s+(\d+)\s+(\d+)\s+(\d+)\s+(\S+)\s+(/.*?)\s*$").expect("df line regex")
});

/// Reasons a capacity probe produced no numbers.
#[derive(Error, Debug)]
pub enum CapacityError {
    #[error("capacity command is empty")]
    EmptyCommand,

    #[error("capacity command could not be parsed: {0}")]
    BadCommand(String),

    #[error(transparent)]
    Command(#[from] RunError),

    #[error("capacity command exited with {0:?}")]
    NonZeroExit(Option<i32>),

    #[error("disk usage report has no data line")]
    MissingReportLine,

    #[error("unrecognised disk usage line: {0:?}")]
    Unparseable(String),
}

/// Total and free bytes on the device, `None` when unknown.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeviceCapacity {
    pub total: Option<u64>,
    pub free: Option<u64>,
}

/// Why an upload was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceShortfall {
    pub size: u64,
    pub free: u64,
    pub total: u64,
}

impl DeviceCapacity {
    pub fn unknown() -> Self {
        Self::default()
    }

    pub fn known(total: u64, free: u64) -> Self {
        Self {
            total: Some(total),
            free: Some(free.min(total)),
        }
    }

    pub fn is_known(&self) -> bool {
        self.total.is_some() && self.free.is_some()
    }

    /// Admission check for an upload of `size` bytes.
    ///
    /// Refuses when `free + size > total`. Unknown capacity always admits.
    pub fn admit(&self, size: u64) -> Result<(), SpaceShortfall> {
        match (self.free, self.total) {
            (Some(free), Some(total)) if free.saturating_add(size) > total => {
                Err(SpaceShortfall { size, free, total })
            }
            _ => Ok(()),
        }
    }

    /// Record `size` bytes as consumed.
    pub fn debit(&mut self, size: u64) {
        if let Some(free) = self.free.as_mut() {
            *free = free.saturating_sub(size);
        }
    }

    /// Record `size` bytes as released, never exceeding total.
    pub fn credit(&mut self, size: u64) {
        if let Some(free) = self.free.as_mut() {
            let credited = free.saturating_add(size);
            *free = match self.total {
                Some(total) => credited.min(total),
                None => credited,
            };
        }
    }
}

/// Parse a `df` report into capacity.
pub fn parse_df_report(report: &str) -> Result<DeviceCapacity, CapacityError> {
    let line = report.lines().nth(1).ok_or(CapacityError::MissingReportLine)?;
    let caps = DF_LINE_RE
        .captures(line)
        .ok_or_else(|| CapacityError::Unparseable(line.to_string()))?;

    let blocks = |idx: usize| -> Result<u64, CapacityError> {
        caps[idx]
            .parse::<u64>()
            .map_err(|_| CapacityError::Unparseable(line.to_string()))
    };
    let total = blocks(2)?.saturating_mul(DF_BLOCK_SIZE);
    let free = blocks(4)?.saturating_mul(DF_BLOCK_SIZE);

    Ok(DeviceCapacity::known(total, free))
}

/// Build the probe invocation from a shell-style command line.
///
/// `ssh` gets `-o BatchMode=yes` so a missing key fails fast instead of
/// prompting for a password, and `-o ConnectTimeout` (at most 30 s) so an
/// unreachable tablet fails at connect time. Options already present in the
/// command are left alone.
pub fn capacity_invocation(command: &str, timeout: Duration) -> Result<Invocation, CapacityError> {
    let words =
        shell_words::split(command).map_err(|e| CapacityError::BadCommand(e.to_string()))?;
    let (program, rest) = words.split_first().ok_or(CapacityError::EmptyCommand)?;

    let mut invocation = Invocation::new(program, timeout);
    let is_ssh = std::path::Path::new(program)
        .file_name()
        .is_some_and(|name| name == "ssh");
    if is_ssh && !rest.iter().any(|w| w.contains("BatchMode")) {
        invocation = invocation.args(["-o", "BatchMode=yes"]);
    }
    if is_ssh && !rest.iter().any(|w| w.contains("ConnectTimeout")) {
        let secs = timeout.as_secs().clamp(1, SSH_CONNECT_TIMEOUT_CAP_SECS);
        invocation = invocation.args(["-o".to_string(), format!("ConnectTimeout={secs}")]);
    }
    Ok(invocation.args(rest))
}

/// Run the configured disk-usage command and parse its report.
pub fn probe<R: CommandRunner>(
    runner: &R,
    command: &str,
    timeout: Duration,
) -> Result<DeviceCapacity, CapacityError> {
    let invocation = capacity_invocation(command, timeout)?;
    let output = runner.run(&invocation)?;
    if !output.success() {
        return Err(CapacityError::NonZeroExit(output.exit_code));
    }
    let capacity = parse_df_report(&output.stdout_lossy())?;

    tracing::debug!(
        total = ?capacity.total,
        free = ?capacity.free,
        "device capacity probed"
    );
    Ok(capacity)
}
