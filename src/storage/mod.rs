use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::job::ProxmoxType;
use crate::manifest::Manifest;

pub mod cloud;
pub mod local;

pub use cloud::CloudTier;
pub use local::LocalTier;

/// Sidecar suffixes accompanying every archive in the loose layout.
pub const ASSOCIATED_SUFFIXES: &[&str] = &[".sha256", ".metadata", ".metadata.sha256"];
pub const BUNDLE_SUFFIX: &str = ".bundle.tar";

/// How a backup set is laid out on a tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Loose,
    Bundle,
}

/// A finished backup set on the producing host, ready for fan-out.
#[derive(Debug, Clone)]
pub struct BackupSet {
    pub archive: PathBuf,
    pub layout: Layout,
}

impl BackupSet {
    pub fn archive_name(&self) -> String {
        self.archive
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// Files to ship, in upload order. Bundle layout ships exactly one.
    pub fn objects(&self) -> Vec<PathBuf> {
        match self.layout {
            Layout::Bundle => vec![bundle_path(&self.archive)],
            Layout::Loose => {
                let mut v = vec![self.archive.clone()];
                for suffix in ASSOCIATED_SUFFIXES {
                    v.push(sibling(&self.archive, suffix));
                }
                v
            }
        }
    }
}

pub fn sibling(archive: &Path, suffix: &str) -> PathBuf {
    let mut name = archive
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    name.push_str(suffix);
    archive.with_file_name(name)
}

pub fn bundle_path(archive: &Path) -> PathBuf {
    sibling(archive, BUNDLE_SUFFIX)
}

/// True for `.sha256` / `.metadata` / `.metadata.sha256` sidecars, which
/// must never surface in listings.
pub fn is_associated_name(name: &str) -> bool {
    name.ends_with(".metadata.sha256")
        || name.ends_with(".metadata")
        || name.ends_with(".sha256")
}

// ---------------------------------------------------------------------------
// archive naming

/// Parsed `<type>-backup-<hostname>-<YYYYMMDD-HHMMSS>.<ext...>` archive
/// name. Bundles parse too (the wrapping suffix is stripped first).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedName {
    pub proxmox_type: ProxmoxType,
    pub hostname: String,
    pub timestamp: u64,
    pub encrypted: bool,
}

pub fn archive_file_name(
    proxmox_type: ProxmoxType,
    hostname: &str,
    compact_ts: &str,
    ext: &str,
) -> String {
    format!(
        "{}-backup-{hostname}-{compact_ts}.{ext}",
        proxmox_type.wire_name()
    )
}

pub fn parse_archive_name(name: &str) -> Option<ParsedName> {
    let base = name.strip_suffix(BUNDLE_SUFFIX).unwrap_or(name);
    let (encrypted, base) = match base.strip_suffix(".age") {
        Some(b) => (true, b),
        None => (false, base),
    };

    let (kind_str, rest) = base.split_once("-backup-")?;
    let proxmox_type = match kind_str {
        "pve" => ProxmoxType::Pve,
        "pbs" => ProxmoxType::Pbs,
        "unknown" => ProxmoxType::Unknown,
        _ => return None,
    };

    // hostname may itself contain dashes; the timestamp is the anchored
    // `YYYYMMDD-HHMMSS` group right before the extension
    let dot = rest.find('.')?;
    let (stem, _ext) = rest.split_at(dot);
    if stem.len() < 17 {
        return None;
    }
    let (hostname, ts_part) = stem.split_at(stem.len() - 16);
    if !ts_part.starts_with('-') || hostname.is_empty() {
        return None;
    }
    let timestamp = crate::utils::time::parse_compact(&ts_part[1..]).ok()?;

    Some(ParsedName {
        proxmox_type,
        hostname: hostname.to_string(),
        timestamp,
        encrypted,
    })
}

// ---------------------------------------------------------------------------
// records & tier contract

/// One backup visible on a tier, newest-first in listings.
#[derive(Debug, Clone)]
pub struct BackupRecord {
    pub tier: &'static str,
    /// Tier-local identifier: absolute path for filesystem tiers, remote
    /// object name for the cloud.
    pub path: String,
    pub size: u64,
    pub mtime: u64,
    pub parsed: Option<ParsedName>,
    pub manifest: Option<Manifest>,
}

impl BackupRecord {
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsInfo {
    pub fs_type: String,
    pub mount_point: PathBuf,
    pub supports_ownership: bool,
    pub is_network: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    pub total_backups: u64,
    pub total_bytes: u64,
    pub newest_mtime: u64,
}

/// Contract every storage tier implements. Operations on one tier are
/// serialized by the orchestrator; `store` during `retention` of the same
/// tier is not permitted.
pub trait StorageTier: Send + Sync {
    fn name(&self) -> &'static str;
    fn is_enabled(&self) -> bool;
    fn detect_filesystem(&self) -> FsInfo;
    /// Atomic publish of a backup set; retrying after a transient failure
    /// must not corrupt prior state.
    fn store(&self, set: &BackupSet) -> Result<()>;
    fn list(&self) -> Result<Vec<BackupRecord>>;
    /// Remove the backup and all its associated files; missing members of
    /// a mixed-layout set are no-ops.
    fn delete(&self, record_path: &str) -> Result<()>;
    fn get_stats(&self) -> Result<TierStats>;
    /// Recompute SHA-256 from the live object and compare to `.sha256`.
    fn verify(&self, record_path: &str) -> Result<bool>;
}

/// Newest-first ordering used by every tier: mtime descending, filename
/// descending as the tiebreak.
pub fn sort_newest_first(records: &mut [BackupRecord]) {
    records.sort_by(|a, b| {
        b.mtime
            .cmp(&a.mtime)
            .then_with(|| b.file_name().cmp(a.file_name()))
    });
}

/// Pack archive + sidecars into a single `<archive>.bundle.tar` next to
/// the archive. Members carry their plain file names.
pub fn build_bundle(archive: &Path) -> Result<PathBuf> {
    use anyhow::Context as _;

    let out_path = bundle_path(archive);
    let out = std::fs::File::create(&out_path)
        .with_context(|| format!("create bundle {}", out_path.display()))?;
    let mut builder = tar::Builder::new(out);

    let mut members = vec![archive.to_path_buf()];
    for suffix in ASSOCIATED_SUFFIXES {
        members.push(sibling(archive, suffix));
    }
    for member in members {
        let name = member
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        builder
            .append_path_with_name(&member, &name)
            .with_context(|| format!("bundle member {}", member.display()))?;
    }
    let mut out = builder.into_inner().context("finish bundle tar")?;
    use std::io::Write as _;
    out.flush().context("flush bundle")?;
    out.sync_all().context("fsync bundle")?;
    Ok(out_path)
}

/// Mount-table based filesystem detection for path-backed tiers.
pub fn detect_fs_for_path(path: &Path) -> FsInfo {
    detect_fs_from_mounts(path, Path::new("/proc/mounts"))
}

pub fn detect_fs_from_mounts(path: &Path, mounts: &Path) -> FsInfo {
    let table = std::fs::read_to_string(mounts).unwrap_or_default();
    let mut best: Option<(PathBuf, String)> = None;

    for line in table.lines() {
        let mut it = line.split_whitespace();
        let (Some(_dev), Some(mp), Some(fstype)) = (it.next(), it.next(), it.next()) else {
            continue;
        };
        let mp = PathBuf::from(mp.replace("\\040", " "));
        if path.starts_with(&mp)
            && best
                .as_ref()
                .map(|(b, _)| mp.components().count() > b.components().count())
                .unwrap_or(true)
        {
            best = Some((mp, fstype.to_string()));
        }
    }

    let (mount_point, fs_type) =
        best.unwrap_or_else(|| (PathBuf::from("/"), "unknown".to_string()));

    const NO_OWNERSHIP: &[&str] = &["vfat", "msdos", "exfat", "fat", "ntfs", "fuseblk"];
    const NETWORK: &[&str] = &["nfs", "nfs4", "cifs", "smbfs", "smb3", "sshfs", "fuse.sshfs"];

    FsInfo {
        supports_ownership: !NO_OWNERSHIP.contains(&fs_type.as_str()),
        is_network: NETWORK.contains(&fs_type.as_str()),
        fs_type,
        mount_point,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn archive_names_roundtrip() {
        let name = archive_file_name(ProxmoxType::Pve, "node01", "20250314-070000", "tar.zst");
        assert_eq!(name, "pve-backup-node01-20250314-070000.tar.zst");

        let parsed = parse_archive_name(&name).unwrap();
        assert_eq!(parsed.proxmox_type, ProxmoxType::Pve);
        assert_eq!(parsed.hostname, "node01");
        assert_eq!(
            parsed.timestamp,
            crate::utils::time::parse_rfc3339_to_unix("2025-03-14T07:00:00Z").unwrap()
        );
        assert!(!parsed.encrypted);
    }

    #[test]
    fn hostnames_with_dashes_and_encryption_parse() {
        let parsed =
            parse_archive_name("pbs-backup-my-backup-host-20250314-070000.tar.xz.age").unwrap();
        assert_eq!(parsed.proxmox_type, ProxmoxType::Pbs);
        assert_eq!(parsed.hostname, "my-backup-host");
        assert!(parsed.encrypted);

        let bundled =
            parse_archive_name("pve-backup-node01-20250314-070000.tar.zst.bundle.tar").unwrap();
        assert_eq!(bundled.hostname, "node01");
    }

    #[test]
    fn junk_names_do_not_parse() {
        assert!(parse_archive_name("random-file.txt").is_none());
        assert!(parse_archive_name("qemu-backup-node01-20250314-070000.tar").is_none());
        assert!(parse_archive_name("pve-backup--20250314-070000.tar").is_none());
        assert!(parse_archive_name("pve-backup-node01-2025031x-070000.tar").is_none());
    }

    #[test]
    fn associated_suffixes_are_detected() {
        assert!(is_associated_name("a.tar.zst.sha256"));
        assert!(is_associated_name("a.tar.zst.metadata"));
        assert!(is_associated_name("a.tar.zst.metadata.sha256"));
        assert!(!is_associated_name("a.tar.zst"));
        assert!(!is_associated_name("a.tar.zst.bundle.tar"));
    }

    #[test]
    fn sorting_breaks_mtime_ties_by_name_descending() {
        let rec = |name: &str, mtime: u64| BackupRecord {
            tier: "local",
            path: format!("/b/{name}"),
            size: 1,
            mtime,
            parsed: None,
            manifest: None,
        };
        let mut records = vec![rec("aaa.tar", 100), rec("zzz.tar", 100), rec("mmm.tar", 200)];
        sort_newest_first(&mut records);
        let names: Vec<&str> = records.iter().map(|r| r.file_name()).collect();
        assert_eq!(names, vec!["mmm.tar", "zzz.tar", "aaa.tar"]);
    }

    #[test]
    fn mount_table_detection_prefers_longest_prefix() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mounts = tmp.path().join("mounts");
        std::fs::write(
            &mounts,
            "/dev/sda1 / ext4 rw 0 0\n\
             /dev/sdb1 /mnt/usb vfat rw 0 0\n\
             10.0.0.5:/export /mnt/nas nfs4 rw 0 0\n",
        )
        .unwrap();

        let usb = detect_fs_from_mounts(Path::new("/mnt/usb/backups"), &mounts);
        assert_eq!(usb.fs_type, "vfat");
        assert!(!usb.supports_ownership);
        assert!(!usb.is_network);

        let nas = detect_fs_from_mounts(Path::new("/mnt/nas/x"), &mounts);
        assert_eq!(nas.fs_type, "nfs4");
        assert!(nas.is_network);
        assert!(nas.supports_ownership);

        let root = detect_fs_from_mounts(Path::new("/var/lib"), &mounts);
        assert_eq!(root.fs_type, "ext4");
        assert_eq!(root.mount_point, PathBuf::from("/"));
    }

    #[test]
    fn bundle_objects_collapse_to_one() {
        let set = BackupSet {
            archive: PathBuf::from("/b/pve-backup-n-20250314-070000.tar.zst"),
            layout: Layout::Bundle,
        };
        assert_eq!(
            set.objects(),
            vec![PathBuf::from(
                "/b/pve-backup-n-20250314-070000.tar.zst.bundle.tar"
            )]
        );

        let loose = BackupSet {
            layout: Layout::Loose,
            ..set
        };
        assert_eq!(loose.objects().len(), 4);
    }
}
