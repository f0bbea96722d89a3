pub mod config;
pub mod device;
pub mod model;

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{ArgAction, CommandFactory, Parser, Subcommand};

use config::{ConfigStore, DeviceConfig};
use device::{
    CatalogSnapshot, DeleteOutcome, DeviceError, DevicePlugin, FetchOutcome, ProcessRunner,
    RemarkableDevice, RenameOutcome, UploadOutcome, UploadReport,
};
use model::types::BookMetadata;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "rmdev",
    version,
    about = "Manage books on a reMarkable tablet through rmapi"
)]
pub struct Cli {
    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory holding the catalog snapshot (defaults to the platform data dir)
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// More log output on stderr (-v info, -vv debug); RUST_LOG wins when set
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Check that rmapi is installed and authenticated
    Detect {
        /// Print a detection report instead of attaching
        #[arg(long)]
        debug: bool,
    },
    /// Show device identity and storage
    Info {
        #[arg(long)]
        json: bool,
    },
    /// Upload books into the export folder
    Upload {
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Display name per file, in order (defaults to the file stem)
        #[arg(long = "name")]
        names: Vec<String>,

        #[arg(long)]
        json: bool,
    },
    /// Delete books from the device
    Delete {
        #[arg(required = true)]
        paths: Vec<String>,
    },
    /// Download a book with its annotations
    Get {
        path: String,

        /// Output file, `-` for stdout (defaults to the book's name in the current dir)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// List books recorded as being on the device
    Books {
        #[arg(long)]
        json: bool,
    },
    /// Inspect or change configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
    /// Generate shell completions to stdout
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate man page to stdout
    Man,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Print the config file location
    Path,
    /// Update the config file
    Set {
        #[arg(long)]
        rmapi: Option<PathBuf>,
        #[arg(long)]
        export_path: Option<String>,
        #[arg(long)]
        timeout_secs: Option<u64>,
        #[arg(long)]
        capacity_command: Option<String>,
    },
}

/// Resolved locations for one CLI invocation.
struct Locations {
    store: ConfigStore,
    data_dir: PathBuf,
}

impl Locations {
    fn from_cli(cli: &Cli) -> Self {
        let store = cli
            .config
            .clone()
            .map_or_else(ConfigStore::at_default_location, ConfigStore::new);
        let data_dir = cli.data_dir.clone().unwrap_or_else(config::default_data_dir);
        Self { store, data_dir }
    }

    fn load_config(&self) -> Result<DeviceConfig> {
        self.store
            .load()
            .with_context(|| format!("loading config from {}", self.store.path().display()))
    }
}

pub fn run(cli: Cli) -> Result<()> {
    let ctx = Locations::from_cli(&cli);

    match cli.command {
        Commands::Detect { debug } => run_detect(&ctx, debug),
        Commands::Info { json } => run_info(&ctx, json),
        Commands::Upload { files, names, json } => run_upload(&ctx, &files, names, json),
        Commands::Delete { paths } => run_delete(&ctx, &paths),
        Commands::Get { path, output } => run_get(&ctx, &path, output),
        Commands::Books { json } => run_books(&ctx, json),
        Commands::Config { action } => run_config(&ctx, action),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            clap_complete::generate(shell, &mut cmd, "rmdev", &mut std::io::stdout());
            Ok(())
        }
        Commands::Man => {
            let cmd = Cli::command();
            let man = clap_mangen::Man::new(cmd);
            let mut out = std::io::stdout();
            man.render(&mut out)?;
            Ok(())
        }
    }
}

type Device = RemarkableDevice<ProcessRunner>;

/// Attach to the device, run `op`, then detach and persist the catalog.
///
/// The catalog is saved even when `op` fails so partial batches are kept.
fn with_device<T>(ctx: &Locations, op: impl FnOnce(&mut Device) -> Result<T>) -> Result<T> {
    let config = ctx.load_config()?;
    let snapshot = CatalogSnapshot::load(&ctx.data_dir).with_context(|| {
        format!(
            "reading catalog {}",
            CatalogSnapshot::snapshot_path(&ctx.data_dir).display()
        )
    })?;

    let mut device = RemarkableDevice::new(config, ProcessRunner);
    device.set_catalog(snapshot.books);
    device.startup().context("starting device session")?;

    let result = attach_and_run(&mut device, op);

    device.eject();
    device.shutdown();

    let snapshot = CatalogSnapshot {
        books: device.catalog().clone(),
    };
    snapshot.save(&ctx.data_dir).with_context(|| {
        format!(
            "writing catalog {}",
            CatalogSnapshot::snapshot_path(&ctx.data_dir).display()
        )
    })?;

    result
}

fn attach_and_run<T>(device: &mut Device, op: impl FnOnce(&mut Device) -> Result<T>) -> Result<T> {
    if !device.detect().context("probing rmapi")? {
        bail!(
            "reMarkable device not detected; check that {} is installed and authenticated",
            device.config().rmapi.display()
        );
    }
    device.open().context("opening device")?;
    op(device)
}

fn run_detect(ctx: &Locations, debug: bool) -> Result<()> {
    if debug {
        let config = ctx.load_config()?;
        let device = RemarkableDevice::new(config, ProcessRunner);
        let mut out = std::io::stdout();
        if !device.debug_detection(&mut out)? {
            bail!("reMarkable device not detected");
        }
        return Ok(());
    }

    with_device(ctx, |device| {
        match device.device_information().software_version {
            Some(v) => println!("reMarkable detected (sync version {v})"),
            None => println!("reMarkable detected"),
        }
        Ok(())
    })
}

fn format_bytes(value: Option<u64>) -> String {
    value.map_or_else(|| "unknown".to_string(), |b| format!("{b} bytes"))
}

fn run_info(ctx: &Locations, json: bool) -> Result<()> {
    with_device(ctx, |device| {
        let info = device.device_information();
        if json {
            let payload = serde_json::json!({
                "name": info.name,
                "version": info.version,
                "software_version": info.software_version,
                "model": info.model,
                "total_space": device.total_space(),
                "free_space": device.free_space(),
                "formats": device.formats(),
                "supports_collections": device.supports_collections(),
                "export_path": device.config().export_dir(),
            });
            println!("{}", serde_json::to_string_pretty(&payload)?);
        } else {
            println!("Device:        {} {} (driver v{})", info.model, info.name, info.version);
            println!(
                "Sync version:  {}",
                info.software_version
                    .map_or_else(|| "unknown".to_string(), |v| v.to_string())
            );
            println!("Total space:   {}", format_bytes(device.total_space()));
            println!("Free space:    {}", format_bytes(device.free_space()));
            println!("Export folder: {}", device.config().export_dir());
            println!("Formats:       {}", device.formats().join(", "));
        }
        Ok(())
    })
}

fn print_upload_report(report: &UploadReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    for item in &report.items {
        let file = item.file.display();
        match &item.outcome {
            UploadOutcome::Uploaded {
                remote_path,
                rename: RenameOutcome::Failed { .. },
            } => println!("uploaded {file} -> {remote_path} (rename to {:?} failed)", item.name),
            UploadOutcome::Uploaded { remote_path, .. } => {
                println!("uploaded {file} -> {remote_path}");
            }
            UploadOutcome::Unreadable { reason } => println!("failed   {file}: {reason}"),
            UploadOutcome::PutFailed {
                exit_code: Some(code),
            } => println!("failed   {file}: rmapi put exited with {code}"),
            UploadOutcome::PutFailed { exit_code: None } => {
                println!("failed   {file}: rmapi put did not finish");
            }
        }
    }
    Ok(())
}

fn run_upload(ctx: &Locations, files: &[PathBuf], names: Vec<String>, json: bool) -> Result<()> {
    let names = if names.is_empty() {
        files
            .iter()
            .map(|f| {
                f.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default()
            })
            .collect()
    } else {
        names
    };
    if names.len() != files.len() {
        bail!("{} files but {} --name values", files.len(), names.len());
    }
    let metadata: Vec<BookMetadata> = names
        .iter()
        .map(|name| BookMetadata::new(name.as_str(), name.as_str()))
        .collect();

    with_device(ctx, |device| {
        let report = match device.upload_books(files, &names, Some(&metadata)) {
            Ok(report) => report,
            Err(err @ DeviceError::FreeSpace { .. }) => {
                if let DeviceError::FreeSpace { completed, .. } = &err {
                    device.add_books_to_metadata(completed, &metadata);
                    print_upload_report(completed, json)?;
                }
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };

        device.add_books_to_metadata(&report, &metadata);
        device.sync_booklists();
        print_upload_report(&report, json)?;

        if report.failed() > 0 {
            bail!("{} of {} uploads failed", report.failed(), report.items.len());
        }
        Ok(())
    })
}

fn run_delete(ctx: &Locations, paths: &[String]) -> Result<()> {
    with_device(ctx, |device| {
        let report = device.delete_books(paths)?;
        device.remove_books_from_metadata(&report.deleted());
        device.sync_booklists();

        for (path, outcome) in &report.items {
            match outcome {
                DeleteOutcome::Deleted { .. } => println!("deleted {path}"),
                DeleteOutcome::Failed { .. } => println!("failed  {path}"),
            }
        }
        let failed = report.failed();
        if !failed.is_empty() {
            bail!("{} of {} deletes failed", failed.len(), report.items.len());
        }
        Ok(())
    })
}

fn fetch_failure(path: &str, outcome: FetchOutcome) -> anyhow::Error {
    match outcome {
        FetchOutcome::AnnotationExportFailed { .. } => {
            anyhow::anyhow!("exporting annotations for {path} failed")
        }
        FetchOutcome::DownloadFailed { .. } => anyhow::anyhow!("downloading {path} failed"),
        FetchOutcome::Fetched { .. } => anyhow::anyhow!("unexpected fetch result for {path}"),
    }
}

fn run_get(ctx: &Locations, path: &str, output: Option<PathBuf>) -> Result<()> {
    let dest = output.unwrap_or_else(|| {
        PathBuf::from(path.rsplit('/').next().filter(|s| !s.is_empty()).unwrap_or(path))
    });

    with_device(ctx, |device| {
        if dest == Path::new("-") {
            let mut stdout = std::io::stdout().lock();
            return match device.get_file(path, &mut stdout)? {
                FetchOutcome::Fetched { .. } => Ok(stdout.flush()?),
                other => Err(fetch_failure(path, other)),
            };
        }

        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let mut staged = tempfile::NamedTempFile::new_in(parent)
            .with_context(|| format!("creating temporary file in {}", parent.display()))?;
        match device.get_file(path, staged.as_file_mut())? {
            FetchOutcome::Fetched { bytes } => {
                staged
                    .persist(&dest)
                    .with_context(|| format!("writing {}", dest.display()))?;
                println!("{path} -> {} ({bytes} bytes)", dest.display());
                Ok(())
            }
            other => Err(fetch_failure(path, other)),
        }
    })
}

fn run_books(ctx: &Locations, json: bool) -> Result<()> {
    let snapshot = CatalogSnapshot::load(&ctx.data_dir).with_context(|| {
        format!(
            "reading catalog {}",
            CatalogSnapshot::snapshot_path(&ctx.data_dir).display()
        )
    })?;

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot.books)?);
        return Ok(());
    }
    if snapshot.books.is_empty() {
        println!("No books recorded on the device.");
        return Ok(());
    }
    for entry in &snapshot.books {
        let authors = entry.authors_display();
        if authors.is_empty() {
            println!("{}\t{}\t{} bytes", entry.path, entry.title, entry.size);
        } else {
            println!(
                "{}\t{} ({authors})\t{} bytes",
                entry.path, entry.title, entry.size
            );
        }
    }
    Ok(())
}

fn run_config(ctx: &Locations, action: ConfigCommand) -> Result<()> {
    match action {
        ConfigCommand::Show => {
            let config = ctx.load_config()?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
        ConfigCommand::Path => {
            println!("{}", ctx.store.path().display());
            Ok(())
        }
        ConfigCommand::Set {
            rmapi,
            export_path,
            timeout_secs,
            capacity_command,
        } => {
            // Start from the file alone so environment overrides are not persisted.
            let current = ctx.store.load_file().with_context(|| {
                format!("loading config from {}", ctx.store.path().display())
            })?;
            let mut updated = current.clone();
            if let Some(rmapi) = rmapi {
                updated.rmapi = rmapi;
            }
            if let Some(export_path) = export_path {
                updated.export_path = export_path;
            }
            if let Some(secs) = timeout_secs {
                updated.timeout_secs = secs;
            }
            if let Some(cmd) = capacity_command {
                updated.capacity_command = cmd;
            }

            let mut device = RemarkableDevice::new(current, ProcessRunner);
            device
                .save_settings(&ctx.store, updated)
                .context("saving settings")?;
            println!("Saved {}", ctx.store.path().display());
            Ok(())
        }
    }
}
