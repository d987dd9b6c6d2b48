use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use regex::Regex;

use crate::config::CollectorCfg;
use crate::job::ProxmoxType;

/// Always-on host configuration paths, collected when they exist.
pub const ALWAYS_PATHS: &[&str] = &[
    "/etc/fstab",
    "/etc/hosts",
    "/etc/hostname",
    "/etc/resolv.conf",
    "/etc/timezone",
    "/etc/localtime",
    "/etc/network",
    "/etc/netplan",
    "/etc/ssh",
    "/root/.ssh",
    "/etc/ssl",
    "/etc/cron.d",
    "/etc/cron.daily",
    "/etc/cron.weekly",
    "/etc/crontab",
    "/var/spool/cron",
    "/etc/logrotate.d",
    "/etc/zfs",
    "/etc/systemd/system",
    "/etc/apt",
    "/usr/local/bin",
    "/usr/local/sbin",
];

pub const PVE_PATHS: &[&str] = &[
    "/etc/pve",
    "/var/lib/pve-cluster/config.db",
    "/etc/corosync",
    "/etc/vzdump.conf",
    "/etc/ceph",
];

pub const PBS_PATHS: &[&str] = &["/etc/proxmox-backup"];

/// Built-in exclusions, applied before any user denylist. SSL private key
/// material never leaves the host.
pub const BUILTIN_EXCLUDES: &[&str] = &["/etc/ssl/private/**"];

/// Private SSH keys are excluded by default: `id_*` under a `.ssh`
/// directory unless it is the `.pub` half.
pub fn is_private_ssh_key(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let in_ssh_dir = path
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .is_some_and(|n| n == ".ssh");
    in_ssh_dir && name.starts_with("id_") && !name.ends_with(".pub")
}

/// Commands whose output becomes a synthetic file in the staging tree
/// under `/var/lib/proxmox-backup-info/`. A missing tool skips the entry.
pub struct SyntheticCmd {
    pub output: &'static str,
    pub bin: &'static str,
    pub args: &'static [&'static str],
}

pub const SYNTHETIC_ALWAYS: &[SyntheticCmd] = &[
    SyntheticCmd { output: "ip-addr.txt", bin: "ip", args: &["addr"] },
    SyntheticCmd { output: "ip-route.txt", bin: "ip", args: &["route"] },
    SyntheticCmd { output: "iptables.txt", bin: "iptables-save", args: &[] },
    SyntheticCmd { output: "ip6tables.txt", bin: "ip6tables-save", args: &[] },
    SyntheticCmd { output: "uname.txt", bin: "uname", args: &["-a"] },
    SyntheticCmd { output: "os-release.txt", bin: "cat", args: &["/etc/os-release"] },
    SyntheticCmd { output: "lspci.txt", bin: "lspci", args: &["-v"] },
    SyntheticCmd { output: "lsblk.txt", bin: "lsblk", args: &["-f"] },
    SyntheticCmd { output: "lscpu.txt", bin: "lscpu", args: &[] },
    SyntheticCmd { output: "memory.txt", bin: "free", args: &["-h"] },
    SyntheticCmd { output: "disk-usage.txt", bin: "df", args: &["-h"] },
    SyntheticCmd { output: "packages.txt", bin: "dpkg", args: &["-l"] },
    SyntheticCmd {
        output: "services.txt",
        bin: "systemctl",
        args: &["list-units", "--type=service", "--all"],
    },
    SyntheticCmd { output: "zfs-list.txt", bin: "zfs", args: &["list"] },
    SyntheticCmd { output: "zpool-status.txt", bin: "zpool", args: &["status"] },
];

pub const SYNTHETIC_PVE: &[SyntheticCmd] = &[
    SyntheticCmd { output: "pveversion.txt", bin: "pveversion", args: &["-v"] },
    SyntheticCmd {
        output: "pve-storage.txt",
        bin: "pvesm",
        args: &["status"],
    },
    SyntheticCmd {
        output: "pve-vms.txt",
        bin: "qm",
        args: &["list"],
    },
    SyntheticCmd {
        output: "pve-containers.txt",
        bin: "pct",
        args: &["list"],
    },
];

pub const SYNTHETIC_PBS: &[SyntheticCmd] = &[
    SyntheticCmd {
        output: "pbs-version.txt",
        bin: "proxmox-backup-manager",
        args: &["version", "--verbose"],
    },
    SyntheticCmd {
        output: "pbs-datastores.txt",
        bin: "proxmox-backup-manager",
        args: &["datastore", "list"],
    },
    SyntheticCmd {
        output: "pbs-users.txt",
        bin: "proxmox-backup-manager",
        args: &["user", "list"],
    },
    SyntheticCmd {
        output: "pbs-sync-jobs.txt",
        bin: "proxmox-backup-manager",
        args: &["sync-job", "list"],
    },
];

/// Where synthetic files land inside the staging tree.
pub const SYNTHETIC_DIR: &str = "var/lib/proxmox-backup-info";

/// The resolved, ordered collection plan for one run.
pub struct RuleSet {
    pub system_paths: Vec<PathBuf>,
    pub user_paths: Vec<PathBuf>,
    pub synthetic: Vec<&'static SyntheticCmd>,
    /// (pattern, matches-basename-only). Patterns without a slash apply
    /// to file names anywhere in the tree.
    denylist: Vec<(Regex, bool)>,
}

impl RuleSet {
    pub fn build(kind: ProxmoxType, cfg: &CollectorCfg) -> Result<Self> {
        let mut system_paths: Vec<PathBuf> =
            ALWAYS_PATHS.iter().map(PathBuf::from).collect();
        match kind {
            ProxmoxType::Pve => system_paths.extend(PVE_PATHS.iter().map(PathBuf::from)),
            ProxmoxType::Pbs => system_paths.extend(PBS_PATHS.iter().map(PathBuf::from)),
            ProxmoxType::Unknown => {}
        }

        let mut synthetic: Vec<&'static SyntheticCmd> = SYNTHETIC_ALWAYS.iter().collect();
        match kind {
            ProxmoxType::Pve => synthetic.extend(SYNTHETIC_PVE.iter()),
            ProxmoxType::Pbs => synthetic.extend(SYNTHETIC_PBS.iter()),
            ProxmoxType::Unknown => {}
        }

        let mut denylist = Vec::new();
        for pattern in BUILTIN_EXCLUDES
            .iter()
            .copied()
            .chain(cfg.exclude_patterns.iter().map(String::as_str))
        {
            let re = glob_to_regex(pattern)
                .with_context(|| format!("bad exclude pattern: {pattern}"))?;
            denylist.push((re, !pattern.contains('/')));
        }

        Ok(Self {
            system_paths,
            user_paths: cfg.custom_paths.clone(),
            synthetic,
            denylist,
        })
    }

    /// Prune test applied during traversal, never as a post-filter, so
    /// excluded trees are not descended into.
    pub fn is_excluded(&self, path: &Path) -> bool {
        if is_private_ssh_key(path) {
            return true;
        }
        let full = path.to_string_lossy();
        let base = path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        self.denylist.iter().any(|(re, basename_only)| {
            if *basename_only {
                re.is_match(&base)
            } else {
                re.is_match(&full)
            }
        })
    }
}

/// Shell-style wildcard to anchored regex: `*` within a segment, `?` one
/// char, `**` any depth. A pattern with no wildcard matches itself and
/// everything below it.
pub fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut re = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    re.push_str(".*");
                } else {
                    re.push_str("[^/]*");
                }
            }
            '?' => re.push_str("[^/]"),
            c if "\\.+()[]{}^$|".contains(c) => {
                re.push('\\');
                re.push(c);
            }
            c => re.push(c),
        }
    }
    if !pattern.contains(['*', '?']) {
        re.push_str("(/.*)?");
    }
    re.push('$');
    Regex::new(&re).context("compile exclude pattern")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(excludes: &[&str]) -> CollectorCfg {
        CollectorCfg {
            custom_paths: vec![],
            exclude_patterns: excludes.iter().map(|s| s.to_string()).collect(),
            pxar_include: None,
            pxar_max_bytes: 0,
        }
    }

    #[test]
    fn pve_and_pbs_get_their_trees() {
        let pve = RuleSet::build(ProxmoxType::Pve, &cfg(&[])).unwrap();
        assert!(pve.system_paths.iter().any(|p| p == Path::new("/etc/pve")));
        assert!(
            !pve.system_paths
                .iter()
                .any(|p| p == Path::new("/etc/proxmox-backup"))
        );

        let pbs = RuleSet::build(ProxmoxType::Pbs, &cfg(&[])).unwrap();
        assert!(
            pbs.system_paths
                .iter()
                .any(|p| p == Path::new("/etc/proxmox-backup"))
        );
        assert!(pbs.synthetic.iter().any(|s| s.output == "pbs-datastores.txt"));
    }

    #[test]
    fn builtin_excludes_protect_key_material() {
        let rules = RuleSet::build(ProxmoxType::Pve, &cfg(&[])).unwrap();
        assert!(rules.is_excluded(Path::new("/etc/ssl/private/host.key")));
        assert!(!rules.is_excluded(Path::new("/etc/ssl/certs/ca.pem")));

        assert!(rules.is_excluded(Path::new("/root/.ssh/id_ed25519")));
        assert!(rules.is_excluded(Path::new("/root/.ssh/id_rsa")));
        assert!(!rules.is_excluded(Path::new("/root/.ssh/id_ed25519.pub")));
        assert!(!rules.is_excluded(Path::new("/root/.ssh/authorized_keys")));
    }

    #[test]
    fn user_patterns_prune_trees_and_wildcards() {
        let rules =
            RuleSet::build(ProxmoxType::Pve, &cfg(&["/etc/pve/priv", "*.tmp"])).unwrap();
        assert!(rules.is_excluded(Path::new("/etc/pve/priv")));
        assert!(rules.is_excluded(Path::new("/etc/pve/priv/shadow.cfg")));
        assert!(!rules.is_excluded(Path::new("/etc/pve/user.cfg")));
        assert!(rules.is_excluded(Path::new("/var/anything/file.tmp")));
    }

    #[test]
    fn glob_translation_semantics() {
        let re = glob_to_regex("/etc/*.conf").unwrap();
        assert!(re.is_match("/etc/a.conf"));
        assert!(!re.is_match("/etc/sub/a.conf"));

        let re = glob_to_regex("/var/**/cache").unwrap();
        assert!(re.is_match("/var/lib/x/cache"));

        let re = glob_to_regex("/etc/file?").unwrap();
        assert!(re.is_match("/etc/file1"));
        assert!(!re.is_match("/etc/file12"));

        // regex metacharacters in paths are literal
        let re = glob_to_regex("/etc/cron.d").unwrap();
        assert!(re.is_match("/etc/cron.d/job"));
        assert!(!re.is_match("/etc/cronXd"));
    }
}
