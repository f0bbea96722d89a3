//! Host framework contract.
//!
//! An e-book manager drives a device through these hooks. Capability queries
//! are plain methods; everything touching the tablet returns a `Result`.

use std::io::Write;
use std::path::PathBuf;

use super::catalog::Catalog;
use super::runner::CommandRunner;
use super::session::{DeviceError, DeviceInfo, RemarkableDevice};
use super::transfer::{DeleteReport, FetchOutcome, UploadReport};
use crate::config::{ConfigError, ConfigStore, DeviceConfig};
use crate::model::types::BookMetadata;

/// Book formats the device accepts.
pub const FORMATS: &[&str] = &["epub", "pdf"];

pub trait DevicePlugin {
    fn startup(&mut self) -> Result<(), DeviceError>;
    fn shutdown(&mut self);

    fn detect(&mut self) -> Result<bool, DeviceError>;
    fn debug_detection(&self, out: &mut dyn Write) -> Result<bool, DeviceError>;
    fn open(&mut self) -> Result<(), DeviceError>;
    fn eject(&mut self);
    fn post_yank_cleanup(&mut self);
    fn stop_plugin(&mut self);

    fn device_information(&self) -> &DeviceInfo;
    fn card_prefix(&self) -> (Option<String>, Option<String>);
    fn total_space(&self) -> Option<u64>;
    fn free_space(&self) -> Option<u64>;

    /// Books on the device; `on_card` lists are always empty.
    fn books(&self, on_card: bool) -> &Catalog;

    fn upload_books(
        &mut self,
        files: &[PathBuf],
        names: &[String],
        metadata: Option<&[BookMetadata]>,
    ) -> Result<UploadReport, DeviceError>;
    fn add_books_to_metadata(&mut self, report: &UploadReport, metadata: &[BookMetadata]) -> usize;
    fn delete_books(&mut self, paths: &[String]) -> Result<DeleteReport, DeviceError>;
    fn remove_books_from_metadata(&mut self, paths: &[String]) -> usize;
    fn sync_booklists(&mut self);
    fn get_file(&self, path: &str, out: &mut dyn Write) -> Result<FetchOutcome, DeviceError>;

    fn supports_collections(&self) -> bool {
        false
    }

    fn formats(&self) -> &'static [&'static str] {
        FORMATS
    }

    /// Persist `config` and make it the live configuration.
    fn save_settings(&mut self, store: &ConfigStore, config: DeviceConfig)
    -> Result<(), ConfigError>;
}

impl<R: CommandRunner> DevicePlugin for RemarkableDevice<R> {
    fn startup(&mut self) -> Result<(), DeviceError> {
        RemarkableDevice::startup(self)
    }

    fn shutdown(&mut self) {
        RemarkableDevice::shutdown(self);
    }

    fn detect(&mut self) -> Result<bool, DeviceError> {
        RemarkableDevice::detect(self)
    }

    fn debug_detection(&self, out: &mut dyn Write) -> Result<bool, DeviceError> {
        RemarkableDevice::debug_detection(self, out)
    }

    fn open(&mut self) -> Result<(), DeviceError> {
        RemarkableDevice::open(self)
    }

    fn eject(&mut self) {
        RemarkableDevice::eject(self);
    }

    fn post_yank_cleanup(&mut self) {
        RemarkableDevice::post_yank_cleanup(self);
    }

    fn stop_plugin(&mut self) {
        RemarkableDevice::stop_plugin(self);
    }

    fn device_information(&self) -> &DeviceInfo {
        RemarkableDevice::device_information(self)
    }

    fn card_prefix(&self) -> (Option<String>, Option<String>) {
        RemarkableDevice::card_prefix(self)
    }

    fn total_space(&self) -> Option<u64> {
        RemarkableDevice::total_space(self)
    }

    fn free_space(&self) -> Option<u64> {
        RemarkableDevice::free_space(self)
    }

    fn books(&self, on_card: bool) -> &Catalog {
        RemarkableDevice::books(self, on_card)
    }

    fn upload_books(
        &mut self,
        files: &[PathBuf],
        names: &[String],
        metadata: Option<&[BookMetadata]>,
    ) -> Result<UploadReport, DeviceError> {
        RemarkableDevice::upload_books(self, files, names, metadata)
    }

    fn add_books_to_metadata(&mut self, report: &UploadReport, metadata: &[BookMetadata]) -> usize {
        RemarkableDevice::add_books_to_metadata(self, report, metadata)
    }

    fn delete_books(&mut self, paths: &[String]) -> Result<DeleteReport, DeviceError> {
        RemarkableDevice::delete_books(self, paths)
    }

    fn remove_books_from_metadata(&mut self, paths: &[String]) -> usize {
        RemarkableDevice::remove_books_from_metadata(self, paths)
    }

    fn sync_booklists(&mut self) {
        RemarkableDevice::sync_booklists(self);
    }

    fn get_file(&self, path: &str, out: &mut dyn Write) -> Result<FetchOutcome, DeviceError> {
        RemarkableDevice::get_file(self, path, out)
    }

    fn supports_collections(&self) -> bool {
        self.catalog.supports_collections()
    }

    fn save_settings(
        &mut self,
        store: &ConfigStore,
        config: DeviceConfig,
    ) -> Result<(), ConfigError> {
        store.save(&config)?;
        tracing::info!(path = %store.path().display(), "settings saved");
        self.apply_config(config);
        Ok(())
    }
}
