use std::{
    collections::HashSet,
    fs,
    io::Read,
    path::{Component, Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing as log;

use super::categories;
use crate::commands::backup::{archive, optimize};
use crate::utils::cancel::CancelToken;
use crate::utils::fsmeta;

/// What happened to each entry during selective extraction.
#[derive(Debug, Default)]
pub struct ExtractReport {
    pub restored: Vec<String>,
    pub skipped: u64,
    pub failed: u64,
    pub refused: Vec<String>,
    pub chunks_rebuilt: u64,
    pub chunk_failures: u64,
}

/// Normalize an entry path against the destination root. Absolute
/// entries, `..` components and anything resolving outside the root are
/// rejected; the root itself is the only allowed boundary.
pub fn guarded_target(dest_root: &Path, entry_path: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for comp in entry_path.components() {
        match comp {
            Component::Normal(c) => clean.push(c),
            Component::CurDir => {}
            // `..`, absolute prefixes, and anything else escape-shaped
            _ => return None,
        }
    }
    if clean.as_os_str().is_empty() {
        return None;
    }

    let candidate = dest_root.join(&clean);

    // a symlink already inside the destination could redirect the write;
    // resolve the deepest existing ancestor and require it stays inside
    let mut probe = candidate.parent();
    while let Some(dir) = probe {
        if dir.exists() {
            let resolved = dir.canonicalize().ok()?;
            let root = dest_root.canonicalize().ok()?;
            if !resolved.starts_with(&root) {
                return None;
            }
            break;
        }
        probe = dir.parent();
    }

    Some(candidate)
}

/// Extract the entries of `archive_path` whose category is in `selected`,
/// preserving mode, ownership and nanosecond timestamps. Returns a
/// detailed report; per-entry failures never abort the pass.
pub fn extract_selected(
    archive_path: &Path,
    dest_root: &Path,
    selected: &HashSet<String>,
    cancel: &CancelToken,
) -> Result<ExtractReport> {
    let mut report = ExtractReport::default();
    fs::create_dir_all(dest_root)
        .with_context(|| format!("create destination root {}", dest_root.display()))?;

    let mut tar = archive::open_archive(archive_path)?;
    for entry in tar.entries().context("read archive entries")? {
        cancel.check()?;
        let mut entry = match entry {
            Ok(e) => e,
            Err(e) => {
                log::warn!("unreadable archive entry: {e}");
                report.failed += 1;
                continue;
            }
        };
        let rel = match entry.path() {
            Ok(p) => p.into_owned(),
            Err(e) => {
                log::warn!("entry with undecodable path: {e}");
                report.failed += 1;
                continue;
            }
        };

        let category = categories::category_of_entry(&rel);
        if !category.is_some_and(|c| selected.contains(c)) {
            report.skipped += 1;
            continue;
        }

        let Some(target) = guarded_target(dest_root, &rel) else {
            log::warn!("refusing entry outside destination root: {}", rel.display());
            report.refused.push(rel.display().to_string());
            continue;
        };

        match restore_entry(&mut entry, &target, dest_root) {
            Ok(()) => report.restored.push(rel.display().to_string()),
            Err(e) => {
                log::warn!("restore {}: {e:#}", rel.display());
                report.failed += 1;
            }
        }
    }

    // chunked files written by the optimizer reassemble in place
    let (rebuilt, chunk_failed) = optimize::reassemble_chunks(dest_root);
    report.chunks_rebuilt = rebuilt;
    report.chunk_failures = chunk_failed;

    Ok(report)
}

fn restore_entry<R: Read>(
    entry: &mut tar::Entry<'_, R>,
    target: &Path,
    dest_root: &Path,
) -> Result<()> {
    let header = entry.header();
    let entry_type = header.entry_type();
    let mode = header.mode().unwrap_or(0o644);
    let uid = header.uid().unwrap_or(0) as u32;
    let gid = header.gid().unwrap_or(0) as u32;
    let (atime, mtime) = entry_times(entry)?;

    if let Some(parent) = target.parent()
        && !parent.exists()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("create {}", parent.display()))?;
    }

    match entry_type {
        tar::EntryType::Directory => {
            if !target.is_dir() {
                fs::create_dir_all(target)
                    .with_context(|| format!("create dir {}", target.display()))?;
            }
            let _ = fsmeta::set_mode(target, mode);
            let _ = fsmeta::chown(target, uid, gid);
            let _ = fsmeta::set_times_ns(target, atime, mtime, true);
        }
        tar::EntryType::Symlink => {
            let link = entry
                .link_name()
                .context("symlink without target")?
                .context("symlink without target")?
                .into_owned();
            if fs::symlink_metadata(target).is_ok() {
                fs::remove_file(target).ok();
            }
            std::os::unix::fs::symlink(&link, target)
                .with_context(|| format!("symlink {}", target.display()))?;
            // ownership applies to the link itself, never the target
            let _ = fsmeta::lchown(target, uid, gid);
            let _ = fsmeta::set_times_ns(target, atime, mtime, false);
        }
        tar::EntryType::Link => {
            let link = entry
                .link_name()
                .context("hardlink without target")?
                .context("hardlink without target")?
                .into_owned();
            let source = guarded_target(dest_root, &link)
                .context("hardlink target escapes destination root")?;
            if fs::symlink_metadata(target).is_ok() {
                fs::remove_file(target).ok();
            }
            fs::hard_link(&source, target).with_context(|| {
                format!("hardlink {} -> {}", target.display(), source.display())
            })?;
        }
        tar::EntryType::Regular | tar::EntryType::Continuous | tar::EntryType::GNUSparse => {
            if fs::symlink_metadata(target).is_ok() {
                fs::remove_file(target).ok();
            }
            let mut out = fs::File::create(target)
                .with_context(|| format!("create {}", target.display()))?;
            std::io::copy(entry, &mut out)
                .with_context(|| format!("write {}", target.display()))?;
            drop(out);
            let _ = fsmeta::set_mode(target, mode);
            let _ = fsmeta::chown(target, uid, gid);
            let _ = fsmeta::set_times_ns(target, atime, mtime, true);
        }
        other => {
            log::debug!("skipping entry type {other:?}: {}", target.display());
        }
    }
    Ok(())
}

/// Timestamps from PAX records when present (nanosecond precision), ustar
/// header otherwise.
fn entry_times<R: Read>(entry: &mut tar::Entry<'_, R>) -> Result<((i64, i64), (i64, i64))> {
    let header_mtime = entry.header().mtime().unwrap_or(0) as i64;
    let mut mtime = (header_mtime, 0i64);
    let mut atime = (header_mtime, 0i64);

    if let Ok(Some(pax)) = entry.pax_extensions() {
        for ext in pax.flatten() {
            let (Ok(key), Ok(value)) = (ext.key(), ext.value()) else {
                continue;
            };
            match key {
                "mtime" => {
                    if let Some(t) = parse_pax_time(value) {
                        mtime = t;
                    }
                }
                "atime" => {
                    if let Some(t) = parse_pax_time(value) {
                        atime = t;
                    }
                }
                _ => {}
            }
        }
    }
    Ok((atime, mtime))
}

fn parse_pax_time(value: &str) -> Option<(i64, i64)> {
    match value.split_once('.') {
        Some((secs, frac)) => {
            let secs: i64 = secs.parse().ok()?;
            let mut nanos_str = frac.to_string();
            while nanos_str.len() < 9 {
                nanos_str.push('0');
            }
            let nanos: i64 = nanos_str[..9].parse().ok()?;
            Some((secs, nanos))
        }
        None => Some((value.parse().ok()?, 0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::backup::archive::write_archive;
    use crate::tooling::codec::{Codec, Mode};
    use std::os::unix::fs::MetadataExt;
    use tempfile::TempDir;

    fn selected(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    /// staging tree shaped like a collected backup
    fn build_archive(tmp: &Path) -> PathBuf {
        let staging = tmp.join("staging");
        fs::create_dir_all(staging.join("etc/pve")).unwrap();
        fs::create_dir_all(staging.join("etc/ssh")).unwrap();
        fs::write(staging.join("etc/pve/user.cfg"), b"user:root@pam\n").unwrap();
        fs::write(staging.join("etc/pve/storage.cfg"), b"dir: local\n").unwrap();
        fs::write(staging.join("etc/ssh/sshd_config"), b"Port 22\n").unwrap();
        fs::write(staging.join("etc/hosts"), b"127.0.0.1 localhost\n").unwrap();
        std::os::unix::fs::symlink("user.cfg", staging.join("etc/pve/user-link")).unwrap();

        let archive = tmp.join("pve-backup-n-20250314-070000.tar.zst");
        write_archive(&staging, &archive, Codec::Zstd, 3, Mode::Balanced, 1).unwrap();
        archive
    }

    #[test]
    fn only_selected_categories_are_extracted() {
        let tmp = TempDir::new().unwrap();
        let archive = build_archive(tmp.path());
        let dest = tmp.path().join("restore-root");

        let report = extract_selected(
            &archive,
            &dest,
            &selected(&["cluster_pve"]),
            &CancelToken::new(),
        )
        .unwrap();

        assert!(dest.join("etc/pve/user.cfg").exists());
        assert!(dest.join("etc/pve/storage.cfg").exists());
        assert!(!dest.join("etc/ssh/sshd_config").exists());
        assert!(!dest.join("etc/hosts").exists());
        assert!(report.refused.is_empty());
        assert_eq!(report.failed, 0);
        assert!(report.skipped > 0);

        // symlink restored as symlink
        let link = dest.join("etc/pve/user-link");
        assert!(fs::symlink_metadata(&link).unwrap().is_symlink());
        assert_eq!(fs::read_link(&link).unwrap(), PathBuf::from("user.cfg"));
    }

    #[test]
    fn traversal_attempts_are_refused_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("root");
        fs::create_dir_all(&dest).unwrap();

        // hand-build a malicious archive: one good entry, one escaping
        let evil = tmp.path().join("evil.tar");
        {
            let mut b = tar::Builder::new(fs::File::create(&evil).unwrap());
            let mut h = tar::Header::new_gnu();
            h.set_entry_type(tar::EntryType::Regular);
            h.set_size(4);
            h.set_mode(0o644);
            h.set_cksum();
            b.append_data(&mut h, "etc/hosts", &b"ok\n\n"[..]).unwrap();

            let mut h = tar::Header::new_gnu();
            h.set_entry_type(tar::EntryType::Regular);
            h.set_size(5);
            h.set_mode(0o644);
            h.set_cksum();
            b.append_data(&mut h, "etc/pve/../../../../etc/passwd", &b"evil\n"[..])
                .unwrap();
            b.finish().unwrap();
        }

        let report = extract_selected(
            &evil,
            &dest,
            &selected(&["network", "cluster_pve"]),
            &CancelToken::new(),
        )
        .unwrap();

        assert_eq!(report.restored, vec!["etc/hosts".to_string()]);
        assert_eq!(report.refused.len(), 1);
        assert!(!tmp.path().join("etc/passwd").exists());
        // nothing landed outside the destination root
        assert!(dest.join("etc/hosts").exists());
    }

    #[test]
    fn guard_rejects_absolute_parent_and_symlinked_ancestors() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(&root).unwrap();

        assert!(guarded_target(&root, Path::new("etc/ok")).is_some());
        assert!(guarded_target(&root, Path::new("../escape")).is_none());
        assert!(guarded_target(&root, Path::new("a/../../b")).is_none());
        assert!(guarded_target(&root, Path::new("/etc/absolute")).is_none());
        assert!(guarded_target(&root, Path::new("")).is_none());

        // symlink chain: root/inside -> /tmp outside
        let outside = tmp.path().join("outside");
        fs::create_dir_all(&outside).unwrap();
        std::os::unix::fs::symlink(&outside, root.join("inside")).unwrap();
        assert!(guarded_target(&root, Path::new("inside/file")).is_none());
    }

    #[test]
    fn hardlinks_rebuild_within_destination() {
        let tmp = TempDir::new().unwrap();
        let staging = tmp.path().join("staging");
        fs::create_dir_all(staging.join("etc/pve")).unwrap();
        fs::write(staging.join("etc/pve/a.cfg"), b"shared").unwrap();
        fs::hard_link(staging.join("etc/pve/a.cfg"), staging.join("etc/pve/b.cfg")).unwrap();

        let archive = tmp.path().join("hl.tar");
        write_archive(&staging, &archive, Codec::None, 3, Mode::Balanced, 1).unwrap();

        let dest = tmp.path().join("out");
        let report = extract_selected(
            &archive,
            &dest,
            &selected(&["cluster_pve"]),
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(
            fs::metadata(dest.join("etc/pve/a.cfg")).unwrap().ino(),
            fs::metadata(dest.join("etc/pve/b.cfg")).unwrap().ino()
        );
    }

    #[test]
    fn timestamps_restore_with_nanosecond_precision() {
        let tmp = TempDir::new().unwrap();
        let staging = tmp.path().join("staging");
        fs::create_dir_all(staging.join("etc")).unwrap();
        let f = staging.join("etc/fstab");
        fs::write(&f, b"# fstab\n").unwrap();
        crate::utils::fsmeta::set_times_ns(
            &f,
            (1_700_000_000, 111_222_333),
            (1_700_000_050, 444_555_666),
            true,
        )
        .unwrap();

        let archive = tmp.path().join("ts.tar");
        write_archive(&staging, &archive, Codec::None, 3, Mode::Balanced, 1).unwrap();

        let dest = tmp.path().join("out");
        extract_selected(
            &archive,
            &dest,
            &selected(&["system_base"]),
            &CancelToken::new(),
        )
        .unwrap();

        let meta = fs::metadata(dest.join("etc/fstab")).unwrap();
        assert_eq!(meta.mtime(), 1_700_000_050);
        assert_eq!(meta.mtime_nsec(), 444_555_666);
        assert_eq!(meta.atime(), 1_700_000_000);
        assert_eq!(meta.atime_nsec(), 111_222_333);
    }

    #[test]
    fn pax_time_parsing() {
        assert_eq!(parse_pax_time("1700000000.123456789"), Some((1_700_000_000, 123_456_789)));
        assert_eq!(parse_pax_time("1700000000.5"), Some((1_700_000_000, 500_000_000)));
        assert_eq!(parse_pax_time("1700000000"), Some((1_700_000_000, 0)));
        assert_eq!(parse_pax_time("not-a-time"), None);
    }
}
