//! reMarkable device driver.
//!
//! The tablet is never talked to directly. Library operations shell out to
//! `rmapi`; free space comes from a `df` run over SSH. Everything is
//! sequential and blocking.

pub mod capacity;
pub mod catalog;
pub mod plugin;
pub mod runner;
pub mod session;
pub mod transfer;

pub use capacity::{CapacityError, DeviceCapacity};
pub use catalog::{Catalog, CatalogSnapshot};
pub use plugin::{DevicePlugin, FORMATS};
pub use runner::{CommandOutput, CommandRunner, Invocation, ProcessRunner, RunError};
pub use session::{DeviceError, DeviceInfo, RemarkableDevice, SessionState};
pub use transfer::{
    DeleteOutcome, DeleteReport, FetchOutcome, RenameOutcome, UploadItem, UploadOutcome,
    UploadReport,
};
