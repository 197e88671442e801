//! OS facade used by the wipe sequencer.
//!
//! External binaries (`systemctl`, `umount`, `fuser`, `cryptsetup`,
//! `findmnt`) are wrapped behind the [`OsFacade`] trait so the sequencer can
//! be exercised against a mock in tests; `SystemFacade` is the host-backed
//! implementation.

use crate::command::{resolve_binary, CmdOutput, CommandRunner};
use crate::config::VigilConfig;
use crate::error::{VigilError, VigilResult};
use crate::fstab;
use log::{debug, info, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

const MOUNTS_OVERRIDE_ENV: &str = "VIGIL_MOUNTS_PATH";
const FSTAB_OVERRIDE_ENV: &str = "VIGIL_FSTAB_PATH";
const DEFAULT_FSTAB_PATH: &str = "/etc/fstab";

const SYSTEMCTL_PATHS: &[&str] = &["/bin/systemctl", "/usr/bin/systemctl"];
const UMOUNT_PATHS: &[&str] = &["/bin/umount", "/usr/bin/umount", "/sbin/umount"];
const FUSER_PATHS: &[&str] = &["/usr/bin/fuser", "/bin/fuser", "/usr/sbin/fuser"];
const CRYPTSETUP_PATHS: &[&str] = &[
    "/usr/sbin/cryptsetup",
    "/usr/bin/cryptsetup",
    "/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
];
const FINDMNT_PATHS: &[&str] = &["/usr/bin/findmnt", "/bin/findmnt", "/usr/sbin/findmnt"];
const SYSTEMD_ESCAPE_PATHS: &[&str] = &["/bin/systemd-escape", "/usr/bin/systemd-escape"];
const REBOOT_PATHS: &[&str] = &["/sbin/reboot", "/usr/sbin/reboot"];

const OVERWRITE_CHUNK: usize = 8192;

/// Escalation stages for unmounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnmountMode {
    Normal,
    Lazy,
    Force,
}

/// Host operations the wipe sequencer depends on.
pub trait OsFacade {
    fn stop_service(&self, unit: &str) -> VigilResult<()>;
    fn disable_service(&self, unit: &str) -> VigilResult<()>;
    fn is_mounted(&self, mount_point: &Path) -> VigilResult<bool>;
    fn unmount(&self, mount_point: &Path, mode: UnmountMode) -> VigilResult<()>;
    fn kill_holders(&self, mount_point: &Path) -> VigilResult<()>;
    fn remove_mount_declaration(&self, mount_point: &Path) -> VigilResult<()>;
    fn close_mapping(&self, name: &str) -> VigilResult<()>;
    fn overwrite_and_delete(&self, path: &Path, passes: u32) -> VigilResult<()>;
    fn reboot(&self) -> VigilResult<()>;
    fn root_block_device(&self) -> VigilResult<String>;
    fn device_for_path(&self, path: &Path) -> VigilResult<String>;
}

/// Facade backed by the host's own tooling.
#[derive(Debug, Clone)]
pub struct SystemFacade {
    timeout: Duration,
}

impl SystemFacade {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn from_config(config: &VigilConfig) -> Self {
        Self::new(config.command_timeout())
    }

    fn runner(&self, candidates: &[&str], name: &str) -> VigilResult<CommandRunner> {
        let binary = resolve_binary(candidates, name).ok_or_else(|| {
            VigilError::System(format!("unable to locate {name}; tried {candidates:?} and PATH"))
        })?;
        Ok(CommandRunner::new(binary, self.timeout))
    }

    fn systemctl(&self, args: &[&str]) -> VigilResult<CmdOutput> {
        self.runner(SYSTEMCTL_PATHS, "systemctl")?.run(args, None)
    }

    fn fstab_path(&self) -> PathBuf {
        env::var_os(FSTAB_OVERRIDE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_FSTAB_PATH))
    }

    fn mount_table(&self) -> VigilResult<String> {
        if let Some(path) = env::var_os(MOUNTS_OVERRIDE_ENV) {
            return Ok(fs::read_to_string(path)?);
        }
        Ok(fs::read_to_string("/proc/mounts")?)
    }

    /// Derive the systemd mount unit for `mount_point`, preferring the real
    /// escaper and falling back to the common-case conversion.
    fn mount_unit_name(&self, mount_point: &Path) -> String {
        if let Some(escape) = resolve_binary(SYSTEMD_ESCAPE_PATHS, "systemd-escape") {
            let runner = CommandRunner::new(escape, self.timeout);
            let arg = mount_point.to_string_lossy();
            if let Ok(out) = runner.run(&["--path", "--suffix=mount", arg.as_ref()], None) {
                let unit = out.stdout.trim();
                if out.success() && !unit.is_empty() {
                    return unit.to_string();
                }
            }
        }
        naive_mount_unit(mount_point)
    }
}

impl OsFacade for SystemFacade {
    fn stop_service(&self, unit: &str) -> VigilResult<()> {
        let out = self.systemctl(&["stop", unit])?;
        if out.success() {
            Ok(())
        } else {
            Err(VigilError::System(format!(
                "systemctl stop {unit} failed: {}",
                out.diagnostic()
            )))
        }
    }

    fn disable_service(&self, unit: &str) -> VigilResult<()> {
        let out = self.systemctl(&["disable", unit])?;
        if out.success() {
            Ok(())
        } else {
            Err(VigilError::System(format!(
                "systemctl disable {unit} failed: {}",
                out.diagnostic()
            )))
        }
    }

    fn is_mounted(&self, mount_point: &Path) -> VigilResult<bool> {
        let table = self.mount_table()?;
        Ok(mount_table_contains(&table, mount_point))
    }

    fn unmount(&self, mount_point: &Path, mode: UnmountMode) -> VigilResult<()> {
        let runner = self.runner(UMOUNT_PATHS, "umount")?;
        let target = mount_point.to_string_lossy();
        let args: Vec<&str> = match mode {
            UnmountMode::Normal => vec![target.as_ref()],
            UnmountMode::Lazy => vec!["-l", target.as_ref()],
            UnmountMode::Force => vec!["-f", target.as_ref()],
        };

        let out = runner.run(&args, None)?;
        if out.success() {
            Ok(())
        } else {
            Err(VigilError::System(format!(
                "umount {} failed ({mode:?}): {}",
                mount_point.display(),
                out.diagnostic()
            )))
        }
    }

    fn kill_holders(&self, mount_point: &Path) -> VigilResult<()> {
        let runner = self.runner(FUSER_PATHS, "fuser")?;
        let target = mount_point.to_string_lossy();
        // fuser exits non-zero when nothing holds the mount; that is fine
        let out = runner.run(&["-km", target.as_ref()], None)?;
        if !out.success() {
            debug!(
                "fuser -km {} exited {}: {}",
                mount_point.display(),
                out.status,
                out.diagnostic()
            );
        }
        Ok(())
    }

    fn remove_mount_declaration(&self, mount_point: &Path) -> VigilResult<()> {
        let fstab = self.fstab_path();
        match fstab::remove_mount_point(&fstab, mount_point) {
            Ok(0) => debug!("no fstab entry for {}", mount_point.display()),
            Ok(n) => info!(
                "removed {n} fstab entr{} for {}",
                if n == 1 { "y" } else { "ies" },
                mount_point.display()
            ),
            Err(err) => return Err(err),
        }

        // stop any live mount unit so systemd does not remount behind us
        let unit = self.mount_unit_name(mount_point);
        match self.systemctl(&["stop", &unit]) {
            Ok(out) if out.success() => info!("stopped mount unit {unit}"),
            Ok(out) => debug!("systemctl stop {unit}: {}", out.diagnostic()),
            Err(err) => warn!("could not stop mount unit {unit}: {err}"),
        }

        Ok(())
    }

    fn close_mapping(&self, name: &str) -> VigilResult<()> {
        let runner = self.runner(CRYPTSETUP_PATHS, "cryptsetup")?;
        let mut out = runner.run(&["close", name], None)?;
        if !out.success() && action_unsupported(&out) {
            out = runner.run(&["luksClose", name], None)?;
        }

        if out.success() {
            return Ok(());
        }

        let diagnostic = out.diagnostic();
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("does not exist")
            || lower.contains("doesn't exist")
            || lower.contains("not active")
        {
            return Ok(());
        }

        Err(VigilError::System(format!(
            "cryptsetup failed to close mapping `{name}`: {diagnostic} (exit code {})",
            out.status
        )))
    }

    fn overwrite_and_delete(&self, path: &Path, passes: u32) -> VigilResult<()> {
        let meta = fs::symlink_metadata(path).map_err(|err| VigilError::KeyDestruction {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        let len = meta.len();

        let overwrite = |zero: bool| -> std::io::Result<()> {
            let mut file = OpenOptions::new().write(true).open(path)?;
            file.seek(SeekFrom::Start(0))?;
            let mut remaining = len;
            let mut buf = [0u8; OVERWRITE_CHUNK];
            while remaining > 0 {
                let take = remaining.min(OVERWRITE_CHUNK as u64) as usize;
                if zero {
                    buf[..take].fill(0);
                } else {
                    OsRng.fill_bytes(&mut buf[..take]);
                }
                file.write_all(&buf[..take])?;
                remaining -= take as u64;
            }
            file.sync_all()
        };

        for pass in 0..passes.max(1) {
            overwrite(false).map_err(|err| VigilError::KeyDestruction {
                path: path.to_path_buf(),
                reason: format!("overwrite pass {} failed: {err}", pass + 1),
            })?;
        }
        // final zero pass hides that an overwrite happened at all
        overwrite(true).map_err(|err| VigilError::KeyDestruction {
            path: path.to_path_buf(),
            reason: format!("zero pass failed: {err}"),
        })?;

        fs::remove_file(path).map_err(|err| VigilError::KeyDestruction {
            path: path.to_path_buf(),
            reason: format!("unlink failed: {err}"),
        })
    }

    fn reboot(&self) -> VigilResult<()> {
        if let Ok(out) = self.systemctl(&["reboot"]) {
            if out.success() {
                return Ok(());
            }
        }
        let runner = self.runner(REBOOT_PATHS, "reboot")?;
        let out = runner.run(&[], None)?;
        if out.success() {
            Ok(())
        } else {
            Err(VigilError::System(format!(
                "reboot failed: {}",
                out.diagnostic()
            )))
        }
    }

    fn root_block_device(&self) -> VigilResult<String> {
        let runner = self.runner(FINDMNT_PATHS, "findmnt")?;
        let out = runner.run(&["-n", "-o", "SOURCE", "/"], None)?;
        if !out.success() {
            return Err(VigilError::System(format!(
                "findmnt could not resolve the root device: {}",
                out.diagnostic()
            )));
        }
        let source = out.stdout.trim();
        if source.is_empty() {
            return Err(VigilError::System(
                "findmnt returned an empty root device".into(),
            ));
        }
        Ok(strip_partition_suffix(source))
    }

    fn device_for_path(&self, path: &Path) -> VigilResult<String> {
        let runner = self.runner(FINDMNT_PATHS, "findmnt")?;
        let target = path.to_string_lossy();
        let out = runner.run(&["-n", "-o", "SOURCE", "--target", target.as_ref()], None)?;
        if !out.success() {
            return Err(VigilError::System(format!(
                "findmnt could not resolve the device for {}: {}",
                path.display(),
                out.diagnostic()
            )));
        }
        Ok(out.stdout.trim().to_string())
    }
}

/// True when `mount_point` appears as a mount point in a `/proc/mounts`
/// style table.
pub(crate) fn mount_table_contains(table: &str, mount_point: &Path) -> bool {
    let target = mount_point.to_string_lossy();
    for line in table.lines() {
        let mut fields = line.split_whitespace();
        let _device = fields.next();
        if let Some(point) = fields.next() {
            if fstab::unescape_field(point) == target {
                return true;
            }
        }
    }
    false
}

/// Reduce a partition node to its parent disk: `/dev/sda1` → `/dev/sda`,
/// `/dev/mmcblk0p2` → `/dev/mmcblk0`, `/dev/nvme0n1p3` → `/dev/nvme0n1`.
pub(crate) fn strip_partition_suffix(device: &str) -> String {
    let trimmed = device.trim_end_matches(|ch: char| ch.is_ascii_digit());
    if trimmed.len() < device.len() {
        if let Some(base) = trimmed.strip_suffix('p') {
            if base.ends_with(|ch: char| ch.is_ascii_digit()) {
                return base.to_string();
            }
        }
    }
    trimmed.to_string()
}

/// Common-case `/path/to/mount` → `path-to-mount.mount` conversion, used
/// when `systemd-escape` is unavailable. Covers alphanumerics, `_`, and `.`;
/// anything else should go through the real escaper.
fn naive_mount_unit(mount_point: &Path) -> String {
    let trimmed = mount_point
        .to_string_lossy()
        .trim_matches('/')
        .replace('/', "-");
    if trimmed.is_empty() {
        "-.mount".to_string()
    } else {
        format!("{trimmed}.mount")
    }
}

fn action_unsupported(out: &CmdOutput) -> bool {
    let lower = out.diagnostic().to_ascii_lowercase();
    lower.contains("unknown action")
        || lower.contains("unknown command")
        || lower.contains("invalid action")
        || lower.contains("invalid command")
        || lower.contains("unknown option")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn mount_table_lookup_matches_exact_mount_point() {
        let table = "/dev/sda1 / ext4 rw 0 0\n/dev/sdb1 /srv/vault ext4 rw 0 0\n";
        assert!(mount_table_contains(table, Path::new("/srv/vault")));
        assert!(!mount_table_contains(table, Path::new("/srv")));
        assert!(!mount_table_contains(table, Path::new("/srv/vault2")));
    }

    #[test]
    fn mount_table_lookup_decodes_escapes() {
        let table = "/dev/sdb1 /srv/secret\\040vault ext4 rw 0 0\n";
        assert!(mount_table_contains(table, Path::new("/srv/secret vault")));
    }

    #[test]
    fn partition_suffix_stripping_handles_common_node_names() {
        assert_eq!(strip_partition_suffix("/dev/sda1"), "/dev/sda");
        assert_eq!(strip_partition_suffix("/dev/sda"), "/dev/sda");
        assert_eq!(strip_partition_suffix("/dev/mmcblk0p2"), "/dev/mmcblk0");
        assert_eq!(strip_partition_suffix("/dev/nvme0n1p3"), "/dev/nvme0n1");
        assert_eq!(strip_partition_suffix("/dev/vda2"), "/dev/vda");
    }

    #[test]
    fn naive_mount_unit_converts_paths() {
        assert_eq!(naive_mount_unit(Path::new("/srv/vault")), "srv-vault.mount");
        assert_eq!(naive_mount_unit(Path::new("/")), "-.mount");
        assert_eq!(
            naive_mount_unit(Path::new("/mnt/secure_nas")),
            "mnt-secure_nas.mount"
        );
    }

    #[test]
    fn overwrite_and_delete_removes_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("key.raw");
        fs::write(&path, [0x42u8; 64]).unwrap();

        let facade = SystemFacade::new(Duration::from_secs(5));
        facade.overwrite_and_delete(&path, 2).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn overwrite_and_delete_errors_on_missing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("absent.raw");

        let facade = SystemFacade::new(Duration::from_secs(5));
        let err = facade.overwrite_and_delete(&path, 1).unwrap_err();
        assert!(matches!(err, VigilError::KeyDestruction { .. }));
    }

    #[test]
    fn is_mounted_honours_table_override() {
        let dir = tempdir().unwrap();
        let table = dir.path().join("mounts");
        fs::write(&table, "/dev/sdb1 /srv/vault ext4 rw 0 0\n").unwrap();

        env::set_var(MOUNTS_OVERRIDE_ENV, &table);
        let facade = SystemFacade::new(Duration::from_secs(5));
        let mounted = facade.is_mounted(Path::new("/srv/vault")).unwrap();
        let absent = facade.is_mounted(Path::new("/srv/other")).unwrap();
        env::remove_var(MOUNTS_OVERRIDE_ENV);

        assert!(mounted);
        assert!(!absent);
    }
}
