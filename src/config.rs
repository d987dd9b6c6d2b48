use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use tracing as log;

use crate::errors::Fault;
use crate::tooling::codec::{Codec, Mode};

/// Retention policy for one storage tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retention {
    Simple {
        max_backups: usize,
    },
    Gfs {
        daily: u32,
        weekly: u32,
        monthly: u32,
        yearly: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxmoxTypeSetting {
    Auto,
    Pve,
    Pbs,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct Compression {
    pub codec: Codec,
    pub level: u32,
    pub mode: Mode,
    pub threads: u32,
}

#[derive(Debug, Clone)]
pub struct Encryption {
    pub enabled: bool,
    pub recipients_file: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct SecondaryCfg {
    pub path: PathBuf,
    pub retention: Retention,
}

#[derive(Debug, Clone)]
pub struct CloudCfg {
    pub bin: String,
    pub remote: String,
    pub path: String,
    pub log_path: Option<String>,
    pub retries: u32,
    pub backoff_cap: Duration,
    pub op_timeout: Duration,
    pub batch_size: usize,
    pub batch_pause: Duration,
    pub retention: Retention,
}

#[derive(Debug, Clone)]
pub struct OptimizerCfg {
    pub prefilter: bool,
    pub prefilter_max_bytes: u64,
    pub dedup: bool,
    pub chunking: bool,
    pub chunk_size_bytes: u64,
    pub chunk_threshold_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CollectorCfg {
    pub custom_paths: Vec<PathBuf>,
    pub exclude_patterns: Vec<String>,
    pub pxar_include: Option<String>,
    pub pxar_max_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub base_dir: PathBuf,
    pub backup_path: PathBuf,
    pub proxmox_type: ProxmoxTypeSetting,
    pub compression: Compression,
    pub encryption: Encryption,
    pub secondary: Option<SecondaryCfg>,
    pub cloud: Option<CloudCfg>,
    pub local_retention: Retention,
    pub optimizer: OptimizerCfg,
    pub collector: CollectorCfg,
    pub bundle_associated: bool,
    pub min_free_mb: u64,
    pub network_check_host: Option<String>,
    pub notify_hook: Option<String>,
    pub metrics_path: Option<PathBuf>,
    pub lock_grace: Duration,
    pub subproc_timeout: Duration,
    pub term_grace: Duration,
}

// ---------------------------------------------------------------------------
// env-file dialect

#[derive(Debug, Default)]
pub struct EnvFile {
    /// Physical lines kept verbatim so a rewrite preserves comments,
    /// ordering and unknown keys.
    lines: Vec<String>,
    values: HashMap<String, String>,
}

impl EnvFile {
    pub fn parse(text: &str) -> Self {
        let mut lines = Vec::new();
        let mut values = HashMap::new();

        for raw in text.lines() {
            lines.push(raw.to_string());
            let trimmed = raw.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                // `#!` shebang-style lines are comments too
                continue;
            }
            let Some(eq) = raw.find('=') else { continue };
            let key = raw[..eq].trim().to_string();
            if key.is_empty() {
                continue;
            }
            let value = decode_value(&raw[eq + 1..]);
            values.insert(key, value);
        }

        Self { lines, values }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|s| s.as_str())
    }

    /// Render the file with every known-but-absent key appended with its
    /// default. Existing lines (including unknown keys and comments) are
    /// preserved byte-for-byte.
    pub fn render_upgraded(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }

        let mut added_header = false;
        for (key, default, _) in KNOWN_KEYS {
            if !self.values.contains_key(*key) {
                if !added_header {
                    out.push_str("\n# added by --upgrade-config\n");
                    added_header = true;
                }
                out.push_str(&format!("{key}={default}\n"));
            }
        }
        out
    }

    pub fn missing_known_keys(&self) -> Vec<&'static str> {
        KNOWN_KEYS
            .iter()
            .filter(|(k, _, _)| !self.values.contains_key(*k))
            .map(|(k, _, _)| *k)
            .collect()
    }
}

/// Value decoding: strip matching outer quotes; otherwise cut an unquoted
/// trailing `#` comment; trim whitespace either way.
fn decode_value(raw: &str) -> String {
    let v = raw.trim();
    if v.len() >= 2 {
        let bytes = v.as_bytes();
        if (bytes[0] == b'"' && bytes[v.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[v.len() - 1] == b'\'')
        {
            return v[1..v.len() - 1].to_string();
        }
    }
    let cut = match v.find('#') {
        Some(0) => 0,
        Some(i) if v.as_bytes()[i - 1].is_ascii_whitespace() => i,
        _ => v.len(),
    };
    v[..cut].trim().to_string()
}

// ---------------------------------------------------------------------------
// known keys

#[derive(Debug, Clone, Copy)]
enum Kind {
    Bool,
    U64,
    Str,
    PathKind,
    List,
}

/// The canonical key list with defaults, the source of truth for both
/// validation and `--upgrade-config`.
const KNOWN_KEYS: &[(&str, &str, Kind)] = &[
    ("BACKUP_PATH", "/opt/proxmox-backup/backups", Kind::PathKind),
    ("PROXMOX_TYPE", "auto", Kind::Str),
    ("COMPRESSION_TYPE", "auto", Kind::Str),
    ("COMPRESSION_LEVEL", "3", Kind::U64),
    ("COMPRESSION_MODE", "balanced", Kind::Str),
    ("COMPRESSION_THREADS", "0", Kind::U64),
    ("ENCRYPT_ARCHIVE", "false", Kind::Bool),
    ("AGE_RECIPIENTS_FILE", "", Kind::PathKind),
    ("SECONDARY_ENABLED", "false", Kind::Bool),
    ("SECONDARY_PATH", "", Kind::PathKind),
    ("CLOUD_ENABLED", "false", Kind::Bool),
    ("RCLONE_BIN", "rclone", Kind::Str),
    ("CLOUD_REMOTE", "", Kind::Str),
    ("CLOUD_PATH", "proxmox-backups", Kind::Str),
    ("CLOUD_LOG_PATH", "", Kind::Str),
    ("RCLONE_RETRIES", "3", Kind::U64),
    ("RCLONE_BACKOFF_MAX_SECS", "60", Kind::U64),
    ("CLOUD_OP_TIMEOUT_SECS", "600", Kind::U64),
    ("CLOUD_BATCH_SIZE", "10", Kind::U64),
    ("CLOUD_BATCH_PAUSE_SECS", "2", Kind::U64),
    ("LOCAL_RETENTION_POLICY", "simple", Kind::Str),
    ("LOCAL_MAX_BACKUPS", "5", Kind::U64),
    ("LOCAL_GFS_DAILY", "7", Kind::U64),
    ("LOCAL_GFS_WEEKLY", "4", Kind::U64),
    ("LOCAL_GFS_MONTHLY", "6", Kind::U64),
    ("LOCAL_GFS_YEARLY", "1", Kind::U64),
    ("SECONDARY_RETENTION_POLICY", "simple", Kind::Str),
    ("SECONDARY_MAX_BACKUPS", "5", Kind::U64),
    ("SECONDARY_GFS_DAILY", "7", Kind::U64),
    ("SECONDARY_GFS_WEEKLY", "4", Kind::U64),
    ("SECONDARY_GFS_MONTHLY", "6", Kind::U64),
    ("SECONDARY_GFS_YEARLY", "1", Kind::U64),
    ("CLOUD_RETENTION_POLICY", "simple", Kind::Str),
    ("CLOUD_MAX_BACKUPS", "10", Kind::U64),
    ("CLOUD_GFS_DAILY", "7", Kind::U64),
    ("CLOUD_GFS_WEEKLY", "4", Kind::U64),
    ("CLOUD_GFS_MONTHLY", "6", Kind::U64),
    ("CLOUD_GFS_YEARLY", "1", Kind::U64),
    ("PREFILTER_ENABLED", "false", Kind::Bool),
    ("PREFILTER_MAX_SIZE_KB", "512", Kind::U64),
    ("DEDUP_ENABLED", "false", Kind::Bool),
    ("SMART_CHUNKING", "false", Kind::Bool),
    ("CHUNK_SIZE_MB", "64", Kind::U64),
    ("CHUNK_THRESHOLD_MB", "256", Kind::U64),
    ("CUSTOM_BACKUP_PATHS", "", Kind::List),
    ("EXCLUDE_PATTERNS", "", Kind::List),
    ("PXAR_INCLUDE_PATTERN", "", Kind::Str),
    ("PXAR_MAX_SIZE_MB", "16", Kind::U64),
    ("BUNDLE_ASSOCIATED", "false", Kind::Bool),
    ("MIN_FREE_DISK_MB", "1024", Kind::U64),
    ("NETWORK_CHECK_HOST", "", Kind::Str),
    ("NOTIFY_HOOK_CMD", "", Kind::Str),
    ("METRICS_PATH", "", Kind::PathKind),
    ("LOG_LEVEL", "", Kind::Str),
    ("LOCK_GRACE_SECS", "300", Kind::U64),
    ("SUBPROC_TIMEOUT_SECS", "600", Kind::U64),
    ("SIGTERM_GRACE_SECS", "10", Kind::U64),
];

// ---------------------------------------------------------------------------
// typed access, failing closed with the offending key named

struct TypedEnv<'a> {
    env: &'a EnvFile,
}

impl<'a> TypedEnv<'a> {
    fn raw(&self, key: &str) -> Option<&str> {
        self.env.get(key).filter(|v| !v.is_empty())
    }

    fn str_or(&self, key: &str, default: &str) -> String {
        self.raw(key).unwrap_or(default).to_string()
    }

    fn opt_str(&self, key: &str) -> Option<String> {
        self.raw(key).map(|s| s.to_string())
    }

    fn bool_or(&self, key: &str, default: bool) -> Result<bool> {
        match self.raw(key) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" => Ok(false),
                other => bail!("config key {key}: not a boolean: '{other}'"),
            },
        }
    }

    fn u64_or(&self, key: &str, default: u64) -> Result<u64> {
        match self.raw(key) {
            None => Ok(default),
            Some(v) => v
                .parse::<u64>()
                .with_context(|| format!("config key {key}: not a number: '{v}'")),
        }
    }

    fn path_opt(&self, key: &str) -> Option<PathBuf> {
        self.raw(key).map(PathBuf::from)
    }

    fn list(&self, key: &str) -> Vec<String> {
        self.raw(key)
            .map(|v| {
                v.split([' ', ',', '\t'])
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn parse_retention(t: &TypedEnv<'_>, prefix: &str) -> Result<Retention> {
    let key = format!("{prefix}_RETENTION_POLICY");
    let policy = t.str_or(&key, "simple");
    match policy.as_str() {
        "simple" => {
            let max = t.u64_or(&format!("{prefix}_MAX_BACKUPS"), 5)? as usize;
            if max < 1 {
                bail!("config key {prefix}_MAX_BACKUPS: must be >= 1");
            }
            Ok(Retention::Simple { max_backups: max })
        }
        "gfs" => {
            let mut daily = t.u64_or(&format!("{prefix}_GFS_DAILY"), 7)? as u32;
            if daily < 1 {
                log::warn!("{prefix}_GFS_DAILY < 1, clamped to 1");
                daily = 1;
            }
            Ok(Retention::Gfs {
                daily,
                weekly: t.u64_or(&format!("{prefix}_GFS_WEEKLY"), 4)? as u32,
                monthly: t.u64_or(&format!("{prefix}_GFS_MONTHLY"), 6)? as u32,
                yearly: t.u64_or(&format!("{prefix}_GFS_YEARLY"), 1)? as u32,
            })
        }
        other => bail!("config key {key}: unknown policy '{other}' (simple|gfs)"),
    }
}

impl Config {
    pub fn load(path: &Path, base_dir: &Path) -> Result<Self> {
        let env = EnvFile::load(path)?;
        Self::from_env(&env, base_dir)
            .with_context(|| format!("validate config {}", path.display()))
            .context(Fault::Config)
    }

    pub fn from_env(env: &EnvFile, base_dir: &Path) -> Result<Self> {
        let t = TypedEnv { env };

        // tolerated, preserved on rewrite, but worth a trace
        for key in env.keys() {
            if !KNOWN_KEYS.iter().any(|(k, _, _)| *k == key) {
                log::debug!("unknown config key tolerated: {key}");
            }
        }

        let proxmox_type = match t.str_or("PROXMOX_TYPE", "auto").as_str() {
            "auto" => ProxmoxTypeSetting::Auto,
            "pve" => ProxmoxTypeSetting::Pve,
            "pbs" => ProxmoxTypeSetting::Pbs,
            "unknown" => ProxmoxTypeSetting::Unknown,
            other => bail!("config key PROXMOX_TYPE: unknown value '{other}'"),
        };

        let level = t.u64_or("COMPRESSION_LEVEL", 3)? as u32;
        if !(1..=9).contains(&level) {
            bail!("config key COMPRESSION_LEVEL: must be 1..9, got {level}");
        }
        let compression = Compression {
            codec: Codec::from_wire(&t.str_or("COMPRESSION_TYPE", "auto"))
                .context("config key COMPRESSION_TYPE")?,
            level,
            mode: Mode::from_wire(&t.str_or("COMPRESSION_MODE", "balanced"))
                .context("config key COMPRESSION_MODE")?,
            threads: t.u64_or("COMPRESSION_THREADS", 0)? as u32,
        };

        let encryption = Encryption {
            enabled: t.bool_or("ENCRYPT_ARCHIVE", false)?,
            recipients_file: t.path_opt("AGE_RECIPIENTS_FILE"),
        };
        if encryption.enabled && encryption.recipients_file.is_none() {
            bail!("ENCRYPT_ARCHIVE=true requires AGE_RECIPIENTS_FILE");
        }

        let secondary = if t.bool_or("SECONDARY_ENABLED", false)? {
            let path = t
                .path_opt("SECONDARY_PATH")
                .context("SECONDARY_ENABLED=true requires SECONDARY_PATH")?;
            Some(SecondaryCfg {
                path,
                retention: parse_retention(&t, "SECONDARY")?,
            })
        } else {
            None
        };

        let cloud = if t.bool_or("CLOUD_ENABLED", false)? {
            let remote = t
                .opt_str("CLOUD_REMOTE")
                .context("CLOUD_ENABLED=true requires CLOUD_REMOTE")?;
            Some(CloudCfg {
                bin: t.str_or("RCLONE_BIN", "rclone"),
                remote,
                path: t.str_or("CLOUD_PATH", "proxmox-backups"),
                log_path: t.opt_str("CLOUD_LOG_PATH"),
                retries: t.u64_or("RCLONE_RETRIES", 3)? as u32,
                backoff_cap: Duration::from_secs(t.u64_or("RCLONE_BACKOFF_MAX_SECS", 60)?),
                op_timeout: Duration::from_secs(t.u64_or("CLOUD_OP_TIMEOUT_SECS", 600)?),
                batch_size: t.u64_or("CLOUD_BATCH_SIZE", 10)?.max(1) as usize,
                batch_pause: Duration::from_secs(t.u64_or("CLOUD_BATCH_PAUSE_SECS", 2)?),
                retention: parse_retention(&t, "CLOUD")?,
            })
        } else {
            None
        };

        let optimizer = OptimizerCfg {
            prefilter: t.bool_or("PREFILTER_ENABLED", false)?,
            prefilter_max_bytes: t.u64_or("PREFILTER_MAX_SIZE_KB", 512)? * 1024,
            dedup: t.bool_or("DEDUP_ENABLED", false)?,
            chunking: t.bool_or("SMART_CHUNKING", false)?,
            chunk_size_bytes: t.u64_or("CHUNK_SIZE_MB", 64)?.max(1) * 1024 * 1024,
            chunk_threshold_bytes: t.u64_or("CHUNK_THRESHOLD_MB", 256)?.max(1) * 1024 * 1024,
        };

        let collector = CollectorCfg {
            custom_paths: t
                .list("CUSTOM_BACKUP_PATHS")
                .into_iter()
                .map(PathBuf::from)
                .collect(),
            exclude_patterns: t.list("EXCLUDE_PATTERNS"),
            pxar_include: t.opt_str("PXAR_INCLUDE_PATTERN"),
            pxar_max_bytes: t.u64_or("PXAR_MAX_SIZE_MB", 16)? * 1024 * 1024,
        };

        Ok(Config {
            base_dir: base_dir.to_path_buf(),
            backup_path: t
                .path_opt("BACKUP_PATH")
                .unwrap_or_else(|| base_dir.join("backups")),
            proxmox_type,
            compression,
            encryption,
            secondary,
            cloud,
            local_retention: parse_retention(&t, "LOCAL")?,
            optimizer,
            collector,
            bundle_associated: t.bool_or("BUNDLE_ASSOCIATED", false)?,
            min_free_mb: t.u64_or("MIN_FREE_DISK_MB", 1024)?,
            network_check_host: t.opt_str("NETWORK_CHECK_HOST"),
            notify_hook: t.opt_str("NOTIFY_HOOK_CMD"),
            metrics_path: t.path_opt("METRICS_PATH"),
            lock_grace: Duration::from_secs(t.u64_or("LOCK_GRACE_SECS", 300)?),
            subproc_timeout: Duration::from_secs(t.u64_or("SUBPROC_TIMEOUT_SECS", 600)?),
            term_grace: Duration::from_secs(t.u64_or("SIGTERM_GRACE_SECS", 10)?),
        })
    }

    /// Tier names participating in fan-out, primary first. Feeds the
    /// manifest's target list.
    pub fn enabled_tiers(&self) -> Vec<&'static str> {
        let mut tiers = vec!["local"];
        if self.secondary.is_some() {
            tiers.push("secondary");
        }
        if self.cloud.is_some() {
            tiers.push("cloud");
        }
        tiers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn base() -> PathBuf {
        PathBuf::from("/opt/proxmox-backup")
    }

    #[test]
    fn parser_handles_comments_quotes_and_trailing_hash() {
        let env = EnvFile::parse(
            "# leading comment\n\
             #!/usr/bin/env bash\n\
             \n\
             BACKUP_PATH=\"/srv/backups\"\n\
             COMPRESSION_TYPE=zstd   # inline comment\n\
             CLOUD_REMOTE='remote: with spaces'\n\
             EMPTY_OK=\n\
             ANCHOR=a=b=c\n",
        );

        assert_eq!(env.get("BACKUP_PATH"), Some("/srv/backups"));
        assert_eq!(env.get("COMPRESSION_TYPE"), Some("zstd"));
        assert_eq!(env.get("CLOUD_REMOTE"), Some("remote: with spaces"));
        assert_eq!(env.get("EMPTY_OK"), Some(""));
        // first `=` splits
        assert_eq!(env.get("ANCHOR"), Some("a=b=c"));
    }

    #[test]
    fn hash_inside_quotes_survives() {
        let env = EnvFile::parse("NOTIFY_HOOK_CMD=\"notify --tag #backup\"\n");
        assert_eq!(env.get("NOTIFY_HOOK_CMD"), Some("notify --tag #backup"));
    }

    #[test]
    fn defaults_apply_when_file_is_minimal() {
        let env = EnvFile::parse("");
        let cfg = Config::from_env(&env, &base()).unwrap();

        assert_eq!(cfg.backup_path, base().join("backups"));
        assert_eq!(cfg.compression.codec, Codec::Zstd);
        assert_eq!(cfg.compression.level, 3);
        assert!(!cfg.encryption.enabled);
        assert!(cfg.secondary.is_none());
        assert!(cfg.cloud.is_none());
        assert_eq!(cfg.local_retention, Retention::Simple { max_backups: 5 });
        assert_eq!(cfg.enabled_tiers(), vec!["local"]);
    }

    #[test]
    fn bad_values_fail_closed_naming_the_key() {
        let env = EnvFile::parse("COMPRESSION_LEVEL=eleven\n");
        let err = format!("{:#}", Config::from_env(&env, &base()).unwrap_err());
        assert!(err.contains("COMPRESSION_LEVEL"), "err: {err}");

        let env = EnvFile::parse("ENCRYPT_ARCHIVE=maybe\n");
        let err = format!("{:#}", Config::from_env(&env, &base()).unwrap_err());
        assert!(err.contains("ENCRYPT_ARCHIVE"), "err: {err}");

        let env = EnvFile::parse("COMPRESSION_LEVEL=12\n");
        assert!(Config::from_env(&env, &base()).is_err());
    }

    #[test]
    fn cloud_and_secondary_require_their_targets() {
        let env = EnvFile::parse("CLOUD_ENABLED=true\n");
        let err = format!("{:#}", Config::from_env(&env, &base()).unwrap_err());
        assert!(err.contains("CLOUD_REMOTE"), "err: {err}");

        let env = EnvFile::parse("SECONDARY_ENABLED=yes\n");
        let err = format!("{:#}", Config::from_env(&env, &base()).unwrap_err());
        assert!(err.contains("SECONDARY_PATH"), "err: {err}");
    }

    #[test]
    fn full_cloud_config_parses() {
        let env = EnvFile::parse(
            "CLOUD_ENABLED=true\n\
             CLOUD_REMOTE=s3crypt\n\
             CLOUD_PATH=host-backups\n\
             CLOUD_LOG_PATH=logs\n\
             RCLONE_RETRIES=5\n\
             CLOUD_RETENTION_POLICY=gfs\n\
             CLOUD_GFS_DAILY=0\n\
             CLOUD_GFS_WEEKLY=2\n",
        );
        let cfg = Config::from_env(&env, &base()).unwrap();
        let cloud = cfg.cloud.clone().unwrap();
        assert_eq!(cloud.remote, "s3crypt");
        assert_eq!(cloud.retries, 5);
        // daily auto-clamped to 1
        assert_eq!(
            cloud.retention,
            Retention::Gfs {
                daily: 1,
                weekly: 2,
                monthly: 6,
                yearly: 1
            }
        );
        assert_eq!(cfg.enabled_tiers(), vec!["local", "cloud"]);
    }

    #[test]
    fn unknown_keys_are_tolerated_and_preserved() {
        let src = "# my config\nFUTURE_KEY=whatever\nBACKUP_PATH=/b\n";
        let env = EnvFile::parse(src);
        assert!(Config::from_env(&env, &base()).is_ok());

        let upgraded = env.render_upgraded();
        assert!(upgraded.starts_with(src));
        assert!(upgraded.contains("FUTURE_KEY=whatever"));
        // a missing known key got appended with its default
        assert!(upgraded.contains("COMPRESSION_TYPE=auto"));
        assert!(!env.missing_known_keys().contains(&"BACKUP_PATH"));
        assert!(env.missing_known_keys().contains(&"COMPRESSION_TYPE"));
    }

    #[test]
    fn load_maps_failures_to_config_fault() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("backup.env");
        std::fs::write(&path, "LOCAL_MAX_BACKUPS=0\n").unwrap();

        let err = Config::load(&path, &base()).unwrap_err();
        assert_eq!(crate::errors::exit_code_for(&err), 2);
    }

    #[test]
    fn lists_split_on_spaces_and_commas() {
        let env = EnvFile::parse(
            "CUSTOM_BACKUP_PATHS=/etc/special, /srv/app\nEXCLUDE_PATTERNS=*.tmp *.cache\n",
        );
        let cfg = Config::from_env(&env, &base()).unwrap();
        assert_eq!(
            cfg.collector.custom_paths,
            vec![PathBuf::from("/etc/special"), PathBuf::from("/srv/app")]
        );
        assert_eq!(cfg.collector.exclude_patterns, vec!["*.tmp", "*.cache"]);
    }
}
