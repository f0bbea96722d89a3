//! Moving books to and from the device.
//!
//! Batches run strictly one item at a time. A failed `rmapi` command never
//! aborts a batch; it is recorded in the item's outcome and the next item is
//! tried. The one exception is the free-space check, which stops the batch
//! before anything is sent for the offending file.

use std::io::Write;
use std::path::{Path, PathBuf};

use super::catalog::Catalog;
use super::runner::CommandRunner;
use super::session::{DeviceError, RemarkableDevice};
use crate::model::types::{BookEntry, BookMetadata};

/// Result of the optional rename after an upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RenameOutcome {
    NotNeeded,
    Renamed,
    /// `mv` failed; the book kept the name derived from its file.
    Failed { exit_code: Option<i32> },
}

/// What happened to one file of an upload batch.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UploadOutcome {
    Uploaded {
        remote_path: String,
        rename: RenameOutcome,
    },
    /// The local file could not be read.
    Unreadable { reason: String },
    /// `rmapi put` exited non-zero, or timed out (`exit_code: None`).
    PutFailed { exit_code: Option<i32> },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct UploadItem {
    pub file: PathBuf,
    pub name: String,
    pub size: u64,
    pub outcome: UploadOutcome,
}

/// Per-file outcomes of an upload batch, in input order.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct UploadReport {
    pub items: Vec<UploadItem>,
}

impl UploadReport {
    /// Remote paths produced by successful uploads.
    pub fn locations(&self) -> Vec<String> {
        self.items
            .iter()
            .filter_map(|item| match &item.outcome {
                UploadOutcome::Uploaded { remote_path, .. } => Some(remote_path.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn uploaded(&self) -> usize {
        self.items
            .iter()
            .filter(|i| matches!(i.outcome, UploadOutcome::Uploaded { .. }))
            .count()
    }

    pub fn failed(&self) -> usize {
        self.items.len() - self.uploaded()
    }
}

/// What happened to one path of a delete batch.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeleteOutcome {
    /// Removed; `credited` is the catalog size returned to the free-space estimate.
    Deleted { credited: Option<u64> },
    /// `rmapi rm` exited non-zero, or timed out (`exit_code: None`).
    Failed { exit_code: Option<i32> },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DeleteReport {
    pub items: Vec<(String, DeleteOutcome)>,
}

impl DeleteReport {
    /// Paths the device confirmed as removed.
    pub fn deleted(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|(_, outcome)| matches!(outcome, DeleteOutcome::Deleted { .. }))
            .map(|(path, _)| path.clone())
            .collect()
    }

    pub fn failed(&self) -> Vec<String> {
        self.items
            .iter()
            .filter(|(_, outcome)| matches!(outcome, DeleteOutcome::Failed { .. }))
            .map(|(path, _)| path.clone())
            .collect()
    }
}

/// Result of fetching a book from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    Fetched { bytes: u64 },
    AnnotationExportFailed { exit_code: Option<i32> },
    DownloadFailed { exit_code: Option<i32> },
}

static EMPTY_CATALOG: Catalog = Catalog::new();

impl<R: CommandRunner> RemarkableDevice<R> {
    /// Upload `files` into the export folder.
    ///
    /// Each book is named after `metadata[i].title` when metadata is given,
    /// otherwise after `names[i]`. Returns per-file outcomes; stops with
    /// [`DeviceError::FreeSpace`] when the capacity check refuses a file.
    pub fn upload_books(
        &mut self,
        files: &[PathBuf],
        names: &[String],
        metadata: Option<&[BookMetadata]>,
    ) -> Result<UploadReport, DeviceError> {
        let provided = metadata.map_or(names.len(), <[BookMetadata]>::len);
        if provided != files.len() {
            return Err(DeviceError::MetadataMismatch {
                files: files.len(),
                names: provided,
            });
        }

        tracing::info!(count = files.len(), "uploading books");
        let export = self.config.export_dir().to_string();
        let mut report = UploadReport::default();

        for (i, file) in files.iter().enumerate() {
            let name = match metadata {
                Some(meta) => meta[i].title.clone(),
                None => names[i].clone(),
            };

            let size = match std::fs::metadata(file) {
                Ok(meta) => meta.len(),
                Err(e) => {
                    tracing::warn!(file = %file.display(), error = %e, "cannot read book file");
                    report.items.push(UploadItem {
                        file: file.clone(),
                        name,
                        size: 0,
                        outcome: UploadOutcome::Unreadable {
                            reason: e.to_string(),
                        },
                    });
                    continue;
                }
            };

            if let Err(short) = self.capacity.admit(size) {
                return Err(DeviceError::FreeSpace {
                    file: file.clone(),
                    size: short.size,
                    free: short.free,
                    total: short.total,
                    completed: report,
                });
            }

            let outcome = self.upload_one(file, &name, size, &export)?;
            report.items.push(UploadItem {
                file: file.clone(),
                name,
                size,
                outcome,
            });
        }

        tracing::info!(
            uploaded = report.uploaded(),
            failed = report.failed(),
            "finished uploading books"
        );
        Ok(report)
    }

    fn upload_one(
        &mut self,
        file: &Path,
        name: &str,
        size: u64,
        export: &str,
    ) -> Result<UploadOutcome, DeviceError> {
        let put = self.rmapi_invocation([
            std::ffi::OsString::from("put"),
            file.as_os_str().to_os_string(),
            std::ffi::OsString::from(export),
        ]);
        let output = self.run_soft(&put)?;
        if !output.success() {
            tracing::warn!(
                file = %file.display(),
                exit_code = ?output.exit_code,
                "upload was unsuccessful"
            );
            return Ok(UploadOutcome::PutFailed {
                exit_code: output.exit_code,
            });
        }

        self.capacity.debit(size);
        tracing::info!(file = %file.display(), "uploaded");

        let basename = file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let stem = file
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let remote_path = format!("{export}/{stem}");

        if name == basename || name == stem {
            return Ok(UploadOutcome::Uploaded {
                remote_path,
                rename: RenameOutcome::NotNeeded,
            });
        }

        let named_path = format!("{export}/{name}");
        let output = self.rmapi_soft(&["mv", remote_path.as_str(), named_path.as_str()])?;
        if output.success() {
            Ok(UploadOutcome::Uploaded {
                remote_path: named_path,
                rename: RenameOutcome::Renamed,
            })
        } else {
            tracing::warn!(
                file = %file.display(),
                from = %remote_path,
                to = %named_path,
                exit_code = ?output.exit_code,
                "renaming of uploaded file was unsuccessful"
            );
            Ok(UploadOutcome::Uploaded {
                remote_path,
                rename: RenameOutcome::Failed {
                    exit_code: output.exit_code,
                },
            })
        }
    }

    /// Add catalog entries for the uploaded items of `report`.
    ///
    /// `metadata` is aligned with the batch input. Books whose uuid is
    /// already catalogued are skipped. Returns the number of entries added.
    pub fn add_books_to_metadata(&mut self, report: &UploadReport, metadata: &[BookMetadata]) -> usize {
        let mut added = 0;
        for (item, meta) in report.items.iter().zip(metadata) {
            let UploadOutcome::Uploaded { remote_path, .. } = &item.outcome else {
                continue;
            };
            if self.catalog.contains_uuid(&meta.uuid) {
                tracing::debug!(uuid = %meta.uuid, "book already catalogued");
                continue;
            }
            let mut entry = BookEntry::from_metadata(meta, remote_path.as_str());
            if entry.size == 0 {
                entry.size = item.size;
            }
            self.catalog.add_book(entry);
            added += 1;
        }
        added
    }

    /// Remove `paths` from the device, one `rmapi rm` each.
    pub fn delete_books(&mut self, paths: &[String]) -> Result<DeleteReport, DeviceError> {
        tracing::info!(count = paths.len(), "deleting books");
        let mut report = DeleteReport::default();

        for path in paths {
            let output = self.rmapi_soft(&["rm", path.as_str()])?;
            if !output.success() {
                tracing::warn!(path = %path, exit_code = ?output.exit_code, "deleting was unsuccessful");
                report.items.push((
                    path.clone(),
                    DeleteOutcome::Failed {
                        exit_code: output.exit_code,
                    },
                ));
                continue;
            }

            let credited = self.catalog.find_by_path(path).map(|e| e.size);
            if let Some(size) = credited {
                self.capacity.credit(size);
            }
            report
                .items
                .push((path.clone(), DeleteOutcome::Deleted { credited }));
        }

        tracing::info!(
            deleted = report.deleted().len(),
            failed = report.failed().len(),
            "finished deleting books"
        );
        Ok(report)
    }

    /// Drop every catalog entry whose path is in `paths`.
    ///
    /// Matches on path alone, regardless of whether the device confirmed the
    /// delete. Returns the number of entries removed.
    pub fn remove_books_from_metadata(&mut self, paths: &[String]) -> usize {
        self.catalog.remove_paths(paths)
    }

    /// The catalog is only held in memory; nothing to push to the device.
    pub fn sync_booklists(&mut self) {}

    /// Books on main memory; the device has no cards.
    pub fn books(&self, on_card: bool) -> &Catalog {
        if on_card {
            &EMPTY_CATALOG
        } else {
            &self.catalog
        }
    }

    /// Export annotations, download `remote_path` and copy it into `out`.
    pub fn get_file(
        &self,
        remote_path: &str,
        out: &mut dyn Write,
    ) -> Result<FetchOutcome, DeviceError> {
        let workdir = self.working_dir().ok_or(DeviceError::NotStarted)?;

        let geta = self
            .rmapi_invocation(["geta", remote_path])
            .current_dir(workdir);
        let output = self.run_soft(&geta)?;
        if !output.success() {
            tracing::warn!(path = %remote_path, exit_code = ?output.exit_code, "annotation export failed");
            return Ok(FetchOutcome::AnnotationExportFailed {
                exit_code: output.exit_code,
            });
        }

        let get = self
            .rmapi_invocation(["get", remote_path])
            .current_dir(workdir);
        let output = self.run_soft(&get)?;
        if !output.success() {
            tracing::warn!(path = %remote_path, exit_code = ?output.exit_code, "download failed");
            return Ok(FetchOutcome::DownloadFailed {
                exit_code: output.exit_code,
            });
        }

        let basename = remote_path.rsplit('/').next().unwrap_or(remote_path);
        let mut fetched = std::fs::File::open(workdir.join(basename))?;
        let bytes = std::io::copy(&mut fetched, out)?;
        tracing::info!(path = %remote_path, bytes, "fetched book");
        Ok(FetchOutcome::Fetched { bytes })
    }
}
