use std::collections::BTreeSet;
use std::path::Path;

/// Static, deterministic map from absolute path prefixes to restore
/// categories. First match wins; order puts the most specific trees
/// before the catch-all system groups.
pub struct Category {
    pub id: &'static str,
    pub label: &'static str,
    pub prefixes: &'static [&'static str],
}

pub const CATEGORIES: &[Category] = &[
    Category {
        id: "cluster_pve",
        label: "PVE cluster configuration",
        prefixes: &["/etc/pve", "/var/lib/pve-cluster", "/etc/corosync"],
    },
    Category {
        id: "datastore_pbs",
        label: "PBS datastore configuration",
        prefixes: &["/etc/proxmox-backup"],
    },
    Category {
        id: "vzdump",
        label: "vzdump defaults",
        prefixes: &["/etc/vzdump.conf"],
    },
    Category {
        id: "zfs",
        label: "ZFS configuration",
        prefixes: &["/etc/zfs"],
    },
    Category {
        id: "ceph",
        label: "Ceph configuration",
        prefixes: &["/etc/ceph"],
    },
    Category {
        id: "network",
        label: "Network configuration",
        prefixes: &[
            "/etc/network",
            "/etc/netplan",
            "/etc/hosts",
            "/etc/hostname",
            "/etc/resolv.conf",
        ],
    },
    Category {
        id: "ssh",
        label: "SSH configuration and keys",
        prefixes: &["/etc/ssh", "/root/.ssh"],
    },
    Category {
        id: "ssl",
        label: "SSL certificates",
        prefixes: &["/etc/ssl"],
    },
    Category {
        id: "cron",
        label: "Scheduled jobs",
        prefixes: &[
            "/etc/cron.d",
            "/etc/cron.daily",
            "/etc/cron.weekly",
            "/etc/crontab",
            "/var/spool/cron",
        ],
    },
    Category {
        id: "systemd",
        label: "systemd units",
        prefixes: &["/etc/systemd/system"],
    },
    Category {
        id: "apt",
        label: "APT configuration",
        prefixes: &["/etc/apt"],
    },
    Category {
        id: "scripts",
        label: "Local admin scripts",
        prefixes: &["/usr/local/bin", "/usr/local/sbin"],
    },
    Category {
        id: "system_base",
        label: "Base system configuration",
        prefixes: &[
            "/etc/fstab",
            "/etc/timezone",
            "/etc/localtime",
            "/etc/logrotate.d",
        ],
    },
    Category {
        id: "backup_info",
        label: "Host inventory snapshots",
        prefixes: &["/var/lib/proxmox-backup-info", "/backup_metadata.txt"],
    },
];

/// Categories that hold storage/datastore definitions, selected by the
/// `Storage` restore mode.
pub const STORAGE_CATEGORIES: &[&str] = &["datastore_pbs", "zfs", "ceph", "cluster_pve"];

pub fn by_id(id: &str) -> Option<&'static Category> {
    CATEGORIES.iter().find(|c| c.id == id)
}

/// Category of an absolute path, if any.
pub fn category_of(abs_path: &str) -> Option<&'static str> {
    let path = Path::new(abs_path);
    for cat in CATEGORIES {
        for prefix in cat.prefixes {
            let p = Path::new(prefix);
            if path == p || path.starts_with(p) {
                return Some(cat.id);
            }
        }
    }
    None
}

/// Category of a tar entry path (relative inside the archive).
pub fn category_of_entry(rel: &Path) -> Option<&'static str> {
    let abs = format!("/{}", rel.display());
    category_of(&abs)
}

/// The ordered set of categories present in an iterator of entry paths.
pub fn categories_present<'a, I: IntoIterator<Item = &'a Path>>(paths: I) -> Vec<String> {
    let mut set = BTreeSet::new();
    for p in paths {
        if let Some(id) = category_of_entry(p) {
            set.insert(id.to_string());
        }
    }
    set.into_iter().collect()
}
