//! Fake tablet for CLI tests.
//!
//! A shell script stands in for `rmapi` and another for the `df` transport.
//! The rmapi script appends each argument line to `calls.log` and changes
//! behaviour when marker files exist in its directory.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

const RMAPI_SCRIPT: &str = r#"#!/bin/sh
FAKE_DIR="@FAKE_DIR@"
printf '%s\n' "$*" >> "$FAKE_DIR/calls.log"
cmd="$1"
[ "$cmd" = "-ni" ] && cmd="$2"
case "$cmd" in
  account)
    [ -f "$FAKE_DIR/unauthenticated" ] && exit 1
    echo "Syncing... SyncVersion: 3 ..."
    ;;
  put)
    [ -f "$FAKE_DIR/slow_put" ] && exec sleep 5
    [ -f "$FAKE_DIR/fail_put" ] && exit 1
    ;;
  mv)
    [ -f "$FAKE_DIR/fail_mv" ] && exit 1
    ;;
  rm)
    case "$2" in *missing*) exit 1 ;; esac
    ;;
  get)
    cp "$FAKE_DIR/remote_book" "./$(basename "$2")" || exit 1
    ;;
esac
exit 0
"#;

pub const ROOMY_DF: &str = "Filesystem 1K-blocks Used Available Use% Mounted on\n\
                            /dev/sda1 1048576 524288 524288 50% /mnt\n";

/// 10 KiB device with 9 KiB already marked free.
pub const TIGHT_DF: &str = "Filesystem 1K-blocks Used Available Use% Mounted on\n\
                            /dev/sda1 10 1 9 10% /mnt\n";

#[allow(dead_code)]
pub struct FakeTablet {
    pub tmp: TempDir,
    pub fake_dir: PathBuf,
    pub work_dir: PathBuf,
    pub data_dir: PathBuf,
    pub config_path: PathBuf,
}

#[allow(dead_code)]
impl FakeTablet {
    pub fn new(df_report: &str) -> Self {
        let tmp = TempDir::new().expect("tempdir");
        let fake_dir = tmp.path().join("fake");
        let work_dir = tmp.path().join("work");
        let data_dir = tmp.path().join("data");
        fs::create_dir_all(&fake_dir).unwrap();
        fs::create_dir_all(&work_dir).unwrap();

        let rmapi = fake_dir.join("rmapi");
        write_script(
            &rmapi,
            &RMAPI_SCRIPT.replace("@FAKE_DIR@", &fake_dir.to_string_lossy()),
        );
        fs::write(fake_dir.join("df_report"), df_report).unwrap();
        let df = fake_dir.join("fake_df");
        write_script(
            &df,
            &format!("#!/bin/sh\ncat '{}'\n", fake_dir.join("df_report").display()),
        );
        fs::write(fake_dir.join("calls.log"), "").unwrap();

        let tablet = Self {
            config_path: tmp.path().join("config.toml"),
            tmp,
            fake_dir,
            work_dir,
            data_dir,
        };
        tablet.write_config(&format!(
            "rmapi = \"{}\"\nexport_path = \"calibre_export\"\ntimeout_secs = 10\ncapacity_command = \"'{}'\"\n",
            rmapi.display(),
            df.display()
        ));
        tablet
    }

    pub fn write_config(&self, content: &str) {
        fs::write(&self.config_path, content).unwrap();
    }

    pub fn rmapi_path(&self) -> PathBuf {
        self.fake_dir.join("rmapi")
    }

    /// Create a marker file that switches on a failure mode of the fake rmapi.
    pub fn mark(&self, marker: &str) {
        fs::write(self.fake_dir.join(marker), "").unwrap();
    }

    pub fn set_remote_book(&self, content: &[u8]) {
        fs::write(self.fake_dir.join("remote_book"), content).unwrap();
    }

    /// A local book file of `size` bytes inside the work dir.
    pub fn book(&self, name: &str, size: usize) -> PathBuf {
        let path = self.work_dir.join(name);
        fs::write(&path, vec![b'x'; size]).unwrap();
        path
    }

    pub fn calls(&self) -> Vec<String> {
        fs::read_to_string(self.fake_dir.join("calls.log"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    pub fn clear_calls(&self) {
        fs::write(self.fake_dir.join("calls.log"), "").unwrap();
    }

    /// `rmdev` pointed at this tablet, isolated from the caller's environment.
    pub fn cmd(&self) -> Command {
        let mut cmd = cargo_bin_cmd!("rmdev");
        cmd.arg("--config")
            .arg(&self.config_path)
            .arg("--data-dir")
            .arg(&self.data_dir)
            .current_dir(&self.work_dir)
            .env_remove("RMDEV_RMAPI")
            .env_remove("RMDEV_EXPORT_PATH")
            .env_remove("RMDEV_TIMEOUT_SECS")
            .env_remove("RMDEV_CAPACITY_COMMAND")
            .env_remove("RUST_LOG");
        cmd
    }
}

fn write_script(path: &Path, body: &str) {
    fs::write(path, body).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}
