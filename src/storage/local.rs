use std::{
    fs,
    io::Read,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use anyhow::{Context, Result, bail};
use tracing as log;

use super::{
    ASSOCIATED_SUFFIXES, BackupRecord, BackupSet, BUNDLE_SUFFIX, FsInfo, StorageTier, TierStats,
    detect_fs_for_path, is_associated_name, parse_archive_name, sibling, sort_newest_first,
};
use crate::manifest::Manifest;
use crate::utils::{exec_policy, hash};

/// Filesystem-backed tier. Serves both the primary (`local`) and the
/// `secondary` mount; the two differ only in root and in the ownership
/// warning policy for FAT-like targets.
pub struct LocalTier {
    name: &'static str,
    root: PathBuf,
    ownership_warned: AtomicBool,
}

impl LocalTier {
    pub fn new(name: &'static str, root: PathBuf) -> Self {
        Self {
            name,
            root,
            ownership_warned: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Archives without a `.sha256` sidecar are leftovers of a crash
    /// between rename and checksum write. Deleted before a new run starts;
    /// primary tier only.
    pub fn clean_orphans(&self) -> Result<u64> {
        let mut removed = 0;
        for entry in match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(_) => return Ok(0),
        } {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_associated_name(&name)
                || name.ends_with(BUNDLE_SUFFIX)
                || parse_archive_name(&name).is_none()
            {
                continue;
            }
            let sha = sibling(&entry.path(), ".sha256");
            if sha.exists() {
                continue;
            }
            if exec_policy::is_dry_run() {
                log::info!("DRY-RUN: would remove orphaned archive {name}");
                continue;
            }
            log::warn!("removing orphaned archive without checksum: {name}");
            fs::remove_file(entry.path())
                .with_context(|| format!("remove orphan {}", entry.path().display()))?;
            // a stale temp from the same crash may sit next to it
            let _ = fs::remove_file(sibling(&entry.path(), ".tmp"));
            removed += 1;
        }
        Ok(removed)
    }

    fn publish(&self, src: &Path) -> Result<()> {
        let name = src
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let dest = self.root.join(&name);
        if src == dest {
            return Ok(());
        }

        let partial = self.root.join(format!("{name}.partial"));
        fs::copy(src, &partial)
            .with_context(|| format!("copy {} to {}", src.display(), partial.display()))?;
        fs::rename(&partial, &dest)
            .with_context(|| format!("rename into place: {}", dest.display()))?;
        Ok(())
    }

    fn warn_ownership_once(&self) {
        let info = self.detect_filesystem();
        if info.is_network {
            log::debug!(
                "tier '{}' sits on a network filesystem ({} at {})",
                self.name,
                info.fs_type,
                info.mount_point.display()
            );
        }
        if !info.supports_ownership && !self.ownership_warned.swap(true, Ordering::Relaxed) {
            log::warn!(
                "tier '{}' on {} does not support ownership; storing data and permissions only",
                self.name,
                info.fs_type
            );
        }
    }

    fn verify_loose(&self, archive: &Path) -> Result<bool> {
        let sha_path = sibling(archive, ".sha256");
        let expected = fs::read_to_string(&sha_path)
            .with_context(|| format!("read checksum {}", sha_path.display()))?;
        let expected = expected.trim();
        let actual = hash::hash_file(archive)?;
        Ok(actual == expected)
    }

    fn verify_bundle(&self, bundle: &Path) -> Result<bool> {
        let file =
            fs::File::open(bundle).with_context(|| format!("open {}", bundle.display()))?;
        let mut tar = tar::Archive::new(file);

        let archive_member = bundle
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .and_then(|n| n.strip_suffix(BUNDLE_SUFFIX).map(str::to_string))
            .context("bundle has no archive name")?;
        let sha_member = format!("{archive_member}.sha256");

        let mut expected = None;
        let mut actual = None;
        for entry in tar.entries().context("read bundle entries")? {
            let mut entry = entry.context("bundle entry")?;
            let path = entry.path().context("bundle entry path")?.into_owned();
            let name = path.to_string_lossy().into_owned();
            if name == sha_member {
                let mut s = String::new();
                entry.read_to_string(&mut s).context("read bundled checksum")?;
                expected = Some(s.trim().to_string());
            } else if name == archive_member {
                actual = Some(hash::hash_reader(&mut entry)?);
            }
        }

        match (expected, actual) {
            (Some(e), Some(a)) => Ok(e == a),
            _ => bail!("bundle {} is missing members", bundle.display()),
        }
    }
}

impl StorageTier for LocalTier {
    fn name(&self) -> &'static str {
        self.name
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn detect_filesystem(&self) -> FsInfo {
        detect_fs_for_path(&self.root)
    }

    fn store(&self, set: &BackupSet) -> Result<()> {
        if exec_policy::is_dry_run() {
            log::info!(
                "DRY-RUN: would store {} on tier '{}'",
                set.archive_name(),
                self.name
            );
            return Ok(());
        }

        fs::create_dir_all(&self.root)
            .with_context(|| format!("create tier root {}", self.root.display()))?;
        self.warn_ownership_once();

        for obj in set.objects() {
            self.publish(&obj)
                .with_context(|| format!("publish to tier '{}'", self.name))?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<BackupRecord>> {
        let mut records = Vec::new();
        let rd = match fs::read_dir(&self.root) {
            Ok(rd) => rd,
            Err(_) => return Ok(records), // absent tier root lists empty
        };

        for entry in rd {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if is_associated_name(&name) || name.ends_with(".partial") || name.ends_with(".tmp")
            {
                continue;
            }
            let Some(parsed) = parse_archive_name(&name) else {
                continue;
            };
            let meta = entry.metadata()?;
            let mtime = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);

            let manifest = Manifest::load(&sibling(&entry.path(), ".metadata")).ok();

            records.push(BackupRecord {
                tier: self.name,
                path: entry.path().to_string_lossy().into_owned(),
                size: meta.len(),
                mtime,
                parsed: Some(parsed),
                manifest,
            });
        }

        sort_newest_first(&mut records);
        Ok(records)
    }

    fn delete(&self, record_path: &str) -> Result<()> {
        if exec_policy::is_dry_run() {
            log::info!("DRY-RUN: would delete {record_path} on tier '{}'", self.name);
            return Ok(());
        }

        let path = Path::new(record_path);
        fs::remove_file(path).with_context(|| format!("delete {record_path}"))?;

        if !record_path.ends_with(BUNDLE_SUFFIX) {
            for suffix in ASSOCIATED_SUFFIXES {
                let assoc = sibling(path, suffix);
                match fs::remove_file(&assoc) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("delete {}", assoc.display()));
                    }
                }
            }
        }
        Ok(())
    }

    fn get_stats(&self) -> Result<TierStats> {
        let records = self.list()?;
        Ok(TierStats {
            total_backups: records.len() as u64,
            total_bytes: records.iter().map(|r| r.size).sum(),
            newest_mtime: records.first().map(|r| r.mtime).unwrap_or(0),
        })
    }

    fn verify(&self, record_path: &str) -> Result<bool> {
        let path = Path::new(record_path);
        if record_path.ends_with(BUNDLE_SUFFIX) {
            self.verify_bundle(path)
        } else {
            self.verify_loose(path)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Layout;
    use tempfile::TempDir;

    fn tier(root: &Path) -> LocalTier {
        LocalTier::new("local", root.to_path_buf())
    }

    fn make_backup(root: &Path, name: &str, payload: &[u8]) -> PathBuf {
        let archive = root.join(name);
        fs::write(&archive, payload).unwrap();
        fs::write(
            sibling(&archive, ".sha256"),
            format!("{}\n", hash::hash_bytes(payload)),
        )
        .unwrap();
        fs::write(sibling(&archive, ".metadata"), "{}").unwrap();
        fs::write(sibling(&archive, ".metadata.sha256"), "x\n").unwrap();
        archive
    }

    #[test]
    fn list_excludes_associated_files_and_sorts() {
        let tmp = TempDir::new().unwrap();
        let a = make_backup(tmp.path(), "pve-backup-n-20250314-070000.tar.zst", b"one");
        let b = make_backup(tmp.path(), "pve-backup-n-20250314-080000.tar.zst", b"two");
        fs::write(tmp.path().join("notes.txt"), "ignored").unwrap();

        // order by mtime: make the earlier-named file newer on disk
        let old = filetime_secs(&b) - 100;
        set_mtime(&a, old + 200);
        set_mtime(&b, old);

        let records = tier(tmp.path()).list().unwrap();
        assert_eq!(records.len(), 2);
        assert!(records[0].path.ends_with("070000.tar.zst"));
        for r in &records {
            assert!(!r.path.ends_with(".sha256"));
            assert!(!r.path.ends_with(".metadata"));
            assert!(!r.path.ends_with(".metadata.sha256"));
        }
    }

    #[test]
    fn delete_removes_archive_and_all_sidecars() {
        let tmp = TempDir::new().unwrap();
        let archive = make_backup(tmp.path(), "pve-backup-n-20250314-070000.tar", b"x");
        // one sidecar already gone: still a success
        fs::remove_file(sibling(&archive, ".metadata.sha256")).unwrap();

        tier(tmp.path())
            .delete(&archive.to_string_lossy())
            .unwrap();

        assert!(!archive.exists());
        assert!(!sibling(&archive, ".sha256").exists());
        assert!(!sibling(&archive, ".metadata").exists());
    }

    #[test]
    fn verify_detects_tampering() {
        let tmp = TempDir::new().unwrap();
        let archive = make_backup(tmp.path(), "pve-backup-n-20250314-070000.tar", b"payload");
        let t = tier(tmp.path());

        assert!(t.verify(&archive.to_string_lossy()).unwrap());

        fs::write(&archive, b"pAyload").unwrap();
        assert!(!t.verify(&archive.to_string_lossy()).unwrap());
    }

    #[test]
    fn bundle_roundtrip_and_verify() {
        let tmp = TempDir::new().unwrap();
        let archive = make_backup(tmp.path(), "pve-backup-n-20250314-070000.tar", b"bundled");

        let bundle = super::super::build_bundle(&archive).unwrap();
        assert!(bundle.to_string_lossy().ends_with(".bundle.tar"));

        let t = tier(tmp.path());
        assert!(t.verify(&bundle.to_string_lossy()).unwrap());
    }

    #[test]
    fn orphan_cleanup_removes_unchecksummed_archives() {
        let tmp = TempDir::new().unwrap();
        let orphan = tmp.path().join("pve-backup-n-20250314-070000.tar");
        fs::write(&orphan, b"crashed before checksum").unwrap();
        let kept = make_backup(tmp.path(), "pve-backup-n-20250314-080000.tar", b"fine");
        fs::write(tmp.path().join("unrelated.dat"), b"keep").unwrap();

        let removed = tier(tmp.path()).clean_orphans().unwrap();
        assert_eq!(removed, 1);
        assert!(!orphan.exists());
        assert!(kept.exists());
        assert!(tmp.path().join("unrelated.dat").exists());
    }

    #[test]
    fn store_publishes_from_foreign_directory() {
        let src_dir = TempDir::new().unwrap();
        let dst_dir = TempDir::new().unwrap();
        let archive = make_backup(src_dir.path(), "pve-backup-n-20250314-070000.tar", b"ship");

        let t = LocalTier::new("secondary", dst_dir.path().join("backups"));
        t.store(&BackupSet {
            archive: archive.clone(),
            layout: Layout::Loose,
        })
        .unwrap();

        let shipped = t.root().join("pve-backup-n-20250314-070000.tar");
        assert!(shipped.exists());
        assert!(t.verify(&shipped.to_string_lossy()).unwrap());

        let stats = t.get_stats().unwrap();
        assert_eq!(stats.total_backups, 1);
        assert_eq!(stats.total_bytes, 4);
    }

    fn filetime_secs(p: &Path) -> u64 {
        fs::metadata(p)
            .unwrap()
            .modified()
            .unwrap()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    fn set_mtime(p: &Path, secs: u64) {
        let t = std::time::UNIX_EPOCH + std::time::Duration::from_secs(secs);
        let f = fs::File::options().write(true).open(p).unwrap();
        f.set_times(fs::FileTimes::new().set_accessed(t).set_modified(t))
            .unwrap();
    }
}
