//! Configuration model and helpers used by Vigil services.

use crate::error::{VigilError, VigilResult};
use directories_next::ProjectDirs;
use log::{info, warn};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/vigil.toml";
const KEYFILE_ENV: &str = "VIGIL_KEYFILE";
const BOOTSTRAP_FILE_NAME: &str = "vigil.toml";
const APP_QUALIFIER: &str = "io";
const APP_ORGANIZATION: &str = "Vigil";
const APP_NAME: &str = "vigil";

pub(crate) fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORGANIZATION, APP_NAME)
}

/// The guarded storage volume: block device, mount point, mapping, key material.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Storage {
    /// Block device backing the encrypted volume (e.g. `/dev/sda`).
    pub device: String,

    #[serde(default = "default_mount_point")]
    pub mount_point: String,

    #[serde(default = "default_mapping_name")]
    pub mapping_name: String,

    #[serde(default = "default_keyfile")]
    pub keyfile: String,

    /// Systemd unit serving the volume; stopped first during a wipe.
    #[serde(default = "default_service_unit")]
    pub service: String,
}

fn default_mount_point() -> String {
    "/srv/vault".to_string()
}

fn default_mapping_name() -> String {
    "vault_crypt".to_string()
}

fn default_keyfile() -> String {
    "/etc/vigil/key.raw".to_string()
}

fn default_service_unit() -> String {
    "smbd.service".to_string()
}

impl Default for Storage {
    fn default() -> Self {
        Self {
            device: String::new(),
            mount_point: default_mount_point(),
            mapping_name: default_mapping_name(),
            keyfile: default_keyfile(),
            service: default_service_unit(),
        }
    }
}

/// Inactivity thresholds driving the escalation policy.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Policy {
    #[serde(default = "default_inactivity_days")]
    pub inactivity_days: u64,

    #[serde(default = "default_warning_days")]
    pub warning_days: Vec<u64>,
}

fn default_inactivity_days() -> u64 {
    30
}

fn default_warning_days() -> Vec<u64> {
    vec![23, 27, 29]
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            inactivity_days: default_inactivity_days(),
            warning_days: default_warning_days(),
        }
    }
}

/// Locations of the persisted ledgers.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct State {
    #[serde(default = "default_access_file")]
    pub access_file: String,

    #[serde(default = "default_notification_file")]
    pub notification_file: String,
}

fn default_access_file() -> String {
    "/var/lib/vigil/last_access.json".to_string()
}

fn default_notification_file() -> String {
    "/var/lib/vigil/notifications.json".to_string()
}

impl Default for State {
    fn default() -> Self {
        Self {
            access_file: default_access_file(),
            notification_file: default_notification_file(),
        }
    }
}

/// Live access-event stream settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Watch {
    /// Audit log tailed for access events.
    #[serde(default = "default_audit_log")]
    pub audit_log: String,

    /// Substring identifying a qualifying access line.
    #[serde(default = "default_match_token")]
    pub match_token: String,

    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_audit_log() -> String {
    "/var/log/samba/audit.log".to_string()
}

fn default_match_token() -> String {
    "vault_share".to_string()
}

fn default_check_interval_secs() -> u64 {
    3_600
}

fn default_poll_interval_secs() -> u64 {
    1
}

impl Default for Watch {
    fn default() -> Self {
        Self {
            audit_log: default_audit_log(),
            match_token: default_match_token(),
            check_interval_secs: default_check_interval_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

/// Outbound notification settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Notify {
    #[serde(default)]
    pub enabled: bool,

    /// Sendmail-compatible binary the composed message is piped to.
    #[serde(default = "default_mail_command")]
    pub mail_command: String,

    #[serde(default)]
    pub from: String,

    #[serde(default)]
    pub to: String,

    /// Hostname advertised in notification bodies; autodetected when empty.
    #[serde(default)]
    pub hostname_hint: Option<String>,

    #[serde(default = "default_share_name")]
    pub share_name: String,

    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
}

fn default_mail_command() -> String {
    "/usr/sbin/sendmail".to_string()
}

fn default_share_name() -> String {
    "vault_share".to_string()
}

fn default_send_timeout_secs() -> u64 {
    30
}

impl Default for Notify {
    fn default() -> Self {
        Self {
            enabled: false,
            mail_command: default_mail_command(),
            from: String::new(),
            to: String::new(),
            hostname_hint: None,
            share_name: default_share_name(),
            send_timeout_secs: default_send_timeout_secs(),
        }
    }
}

/// Destructive-sequence knobs.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Wipe {
    #[serde(default = "default_shred_passes")]
    pub shred_passes: u32,

    #[serde(default)]
    pub reboot_after: bool,

    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// The daemon's own unit, disabled after a completed wipe so a restart
    /// does not resurrect the watchdog.
    #[serde(default = "default_disable_unit")]
    pub disable_unit: String,
}

fn default_shred_passes() -> u32 {
    3
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_disable_unit() -> String {
    "vigil.service".to_string()
}

impl Default for Wipe {
    fn default() -> Self {
        Self {
            shred_passes: default_shred_passes(),
            reboot_after: false,
            command_timeout_secs: default_command_timeout_secs(),
            disable_unit: default_disable_unit(),
        }
    }
}

/// Top-level configuration snapshot loaded from disk.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct VigilConfig {
    pub storage: Storage,

    #[serde(default)]
    pub policy: Policy,

    #[serde(default)]
    pub state: State,

    #[serde(default)]
    pub watch: Watch,

    #[serde(default)]
    pub notify: Notify,

    #[serde(default)]
    pub wipe: Wipe,

    #[serde(skip)]
    pub path: PathBuf,

    #[serde(skip)]
    pub format: ConfigFormat,
}

/// Tracks whether we parsed TOML or YAML so writes preserve format.
#[derive(Debug, Clone, Copy, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl VigilConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Resolve the per-user configuration path used for bootstrapping.
    pub fn user_config_path() -> Option<PathBuf> {
        project_dirs().map(|dirs| dirs.config_dir().join(BOOTSTRAP_FILE_NAME))
    }

    /// Load configuration from disk, creating a bootstrap copy when missing.
    ///
    /// When the caller requests the global default and the process lacks
    /// permission to create it, a per-user configuration is written to the
    /// platform config directory instead.
    pub fn load_or_bootstrap<P: AsRef<Path>>(path: P) -> VigilResult<Self> {
        let target = path.as_ref();
        if target.exists() {
            return Self::load(target);
        }

        match ensure_bootstrap_file(target) {
            Ok(created) => {
                if created {
                    info!("vigil config bootstrap created at {}", target.display());
                }
                Self::load(target)
            }
            Err(err) => {
                if target != Self::default_path() {
                    return Err(VigilError::InvalidConfig(format!(
                        "failed to initialise configuration at {}: {err}",
                        target.display()
                    )));
                }

                let user_path = Self::user_config_path().ok_or_else(|| {
                    VigilError::InvalidConfig(
                        "unable to determine user configuration directory; \
                        create /etc/vigil.toml manually"
                            .to_string(),
                    )
                })?;

                let created_user = ensure_bootstrap_file(&user_path).map_err(|io_err| {
                    VigilError::InvalidConfig(format!(
                        "failed to prepare bootstrap configuration at {}: {io_err}",
                        user_path.display()
                    ))
                })?;

                if created_user {
                    info!("vigil config bootstrap created at {}", user_path.display());
                }

                warn!(
                    "configuration missing at {}; using per-user bootstrap at {}",
                    target.display(),
                    user_path.display()
                );

                Self::load(&user_path)
            }
        }
    }

    /// Read a config file from disk, detect format, and validate basics.
    pub fn load<P: AsRef<Path>>(path: P) -> VigilResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };

        cfg.path = path.to_path_buf();
        cfg.format = if is_toml {
            ConfigFormat::Toml
        } else {
            ConfigFormat::Yaml
        };

        Ok(cfg)
    }

    /// Perform the full validation pass and return human-readable issues.
    ///
    /// A non-empty result must prevent the daemon from starting.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.storage.device.trim().is_empty() {
            issues.push("storage.device must name the target block device".to_string());
        }
        if self.storage.mount_point.trim().is_empty() {
            issues.push("storage.mount_point must not be empty".to_string());
        }
        if self.storage.mapping_name.trim().is_empty() {
            issues.push("storage.mapping_name must not be empty".to_string());
        }
        if self.storage.keyfile.trim().is_empty() {
            issues.push("storage.keyfile must not be empty".to_string());
        }

        if self.policy.inactivity_days == 0 {
            issues.push("policy.inactivity_days must be at least 1".to_string());
        }
        let mut previous: Option<u64> = None;
        for day in &self.policy.warning_days {
            if *day >= self.policy.inactivity_days {
                issues.push(format!(
                    "policy.warning_days entry {day} must be less than inactivity_days {}",
                    self.policy.inactivity_days
                ));
            }
            if let Some(prev) = previous {
                if *day <= prev {
                    issues.push(format!(
                        "policy.warning_days must be strictly ascending (found {day} after {prev})"
                    ));
                }
            }
            previous = Some(*day);
        }

        if self.notify.enabled {
            if self.notify.from.trim().is_empty() {
                issues.push("notify.enabled is true but notify.from is empty".to_string());
            }
            if self.notify.to.trim().is_empty() {
                issues.push("notify.enabled is true but notify.to is empty".to_string());
            }
            if self.notify.mail_command.trim().is_empty() {
                issues.push("notify.enabled is true but notify.mail_command is empty".to_string());
            }
        }

        if self.wipe.shred_passes == 0 {
            issues.push("wipe.shred_passes must be at least 1".to_string());
        }
        if self.watch.check_interval_secs == 0 {
            issues.push("watch.check_interval_secs must be at least 1".to_string());
        }
        if self.watch.poll_interval_secs == 0 {
            issues.push("watch.poll_interval_secs must be at least 1".to_string());
        }

        issues
    }

    /// Resolve the path holding the key material.
    pub fn keyfile_path(&self) -> PathBuf {
        if let Ok(override_path) = env::var(KEYFILE_ENV) {
            if !override_path.is_empty() {
                return PathBuf::from(override_path);
            }
        }
        PathBuf::from(&self.storage.keyfile)
    }

    pub fn access_file_path(&self) -> PathBuf {
        PathBuf::from(&self.state.access_file)
    }

    pub fn notification_file_path(&self) -> PathBuf {
        PathBuf::from(&self.state.notification_file)
    }

    pub fn mount_point_path(&self) -> PathBuf {
        PathBuf::from(&self.storage.mount_point)
    }

    /// Timeout applied to every external command the facade spawns.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.wipe.command_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.notify.send_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.watch.check_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.watch.poll_interval_secs)
    }

    /// Persist the configuration back to its original on-disk format.
    pub fn save(&self) -> VigilResult<()> {
        let payload = match self.format {
            ConfigFormat::Toml => toml::to_string_pretty(self)?,
            ConfigFormat::Yaml => serde_yaml::to_string(self)?,
        };
        fs::write(&self.path, payload)?;
        Ok(())
    }
}

/// Render the commented template materialised on first run.
pub fn bootstrap_template() -> String {
    "# Auto-generated Vigil configuration bootstrap.\n\
     # Fill in storage.device before enabling the service.\n\
     \n\
     [storage]\n\
     # Block device backing the encrypted volume.\n\
     device = \"REPLACE_WITH_TARGET_DEVICE\"\n\
     mount_point = \"/srv/vault\"\n\
     mapping_name = \"vault_crypt\"\n\
     keyfile = \"/etc/vigil/key.raw\"\n\
     service = \"smbd.service\"\n\
     \n\
     [policy]\n\
     inactivity_days = 30\n\
     warning_days = [23, 27, 29]\n\
     \n\
     [state]\n\
     access_file = \"/var/lib/vigil/last_access.json\"\n\
     notification_file = \"/var/lib/vigil/notifications.json\"\n\
     \n\
     [watch]\n\
     audit_log = \"/var/log/samba/audit.log\"\n\
     match_token = \"vault_share\"\n\
     check_interval_secs = 3600\n\
     poll_interval_secs = 1\n\
     \n\
     [notify]\n\
     enabled = false\n\
     mail_command = \"/usr/sbin/sendmail\"\n\
     from = \"\"\n\
     to = \"\"\n\
     share_name = \"vault_share\"\n\
     send_timeout_secs = 30\n\
     \n\
     [wipe]\n\
     shred_passes = 3\n\
     reboot_after = false\n\
     command_timeout_secs = 30\n\
     disable_unit = \"vigil.service\"\n"
        .to_string()
}

fn ensure_bootstrap_file(path: &Path) -> io::Result<bool> {
    if path.exists() {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    match OpenOptions::new().create_new(true).write(true).open(path) {
        Ok(mut file) => {
            let template = bootstrap_template();
            file.write_all(template.as_bytes())?;
            file.flush()?;
            #[cfg(unix)]
            {
                let mode = if path.starts_with("/etc/") { 0o640 } else { 0o600 };
                fs::set_permissions(path, PermissionsExt::from_mode(mode))?;
            }
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_config() -> VigilConfig {
        VigilConfig {
            storage: Storage {
                device: "/dev/sdb".into(),
                ..Storage::default()
            },
            policy: Policy::default(),
            state: State::default(),
            watch: Watch::default(),
            notify: Notify::default(),
            wipe: Wipe::default(),
            path: PathBuf::new(),
            format: ConfigFormat::Toml,
        }
    }

    #[test]
    fn defaults_validate_once_device_is_set() {
        let config = sample_config();
        assert!(config.validate().is_empty());
    }

    #[test]
    fn missing_device_is_reported() {
        let mut config = sample_config();
        config.storage.device = String::new();
        let issues = config.validate();
        assert!(issues.iter().any(|issue| issue.contains("storage.device")));
    }

    #[test]
    fn warning_days_must_stay_below_inactivity() {
        let mut config = sample_config();
        config.policy.warning_days = vec![23, 30];
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|issue| issue.contains("less than inactivity_days")));
    }

    #[test]
    fn warning_days_must_be_ascending() {
        let mut config = sample_config();
        config.policy.warning_days = vec![27, 23];
        let issues = config.validate();
        assert!(issues.iter().any(|issue| issue.contains("ascending")));

        config.policy.warning_days = vec![23, 23];
        let issues = config.validate();
        assert!(issues.iter().any(|issue| issue.contains("ascending")));
    }

    #[test]
    fn notify_fields_required_when_enabled() {
        let mut config = sample_config();
        config.notify.enabled = true;
        let issues = config.validate();
        assert!(issues.iter().any(|issue| issue.contains("notify.from")));
        assert!(issues.iter().any(|issue| issue.contains("notify.to")));
    }

    #[test]
    fn bootstrap_template_parses_and_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vigil.toml");
        fs::write(&path, bootstrap_template()).unwrap();

        let config = VigilConfig::load(&path).unwrap();
        assert_eq!(config.storage.device, "REPLACE_WITH_TARGET_DEVICE");
        assert_eq!(config.policy.warning_days, vec![23, 27, 29]);
        assert_eq!(config.policy.inactivity_days, 30);
        config.save().unwrap();
        assert!(VigilConfig::load(&path).is_ok());
    }

    #[test]
    fn yaml_documents_are_accepted_by_extension() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("vigil.yaml");
        fs::write(
            &path,
            "storage:\n  device: /dev/sdc\n  mount_point: /srv/vault\n",
        )
        .unwrap();

        let config = VigilConfig::load(&path).unwrap();
        assert_eq!(config.storage.device, "/dev/sdc");
        assert_eq!(config.policy.inactivity_days, 30);
    }

    #[test]
    fn keyfile_path_respects_env_override() {
        let config = sample_config();
        env::set_var(KEYFILE_ENV, "/tmp/override.raw");
        assert_eq!(config.keyfile_path(), PathBuf::from("/tmp/override.raw"));
        env::remove_var(KEYFILE_ENV);
        assert_eq!(config.keyfile_path(), PathBuf::from(default_keyfile()));
    }
}
