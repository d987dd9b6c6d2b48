use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing as log;

use crate::utils::staging::OwnedTempDir;

/// Snapshot the live files a restore is about to overwrite into a
/// tar+gzip under a marker-validated directory in /tmp. Best-effort: the
/// caller treats failure as a confirmable warning. The directory is kept
/// on success so the operator can roll back manually.
pub fn create_safety_backup(
    to_overwrite: &[PathBuf],
    dest_root: &Path,
    timestamp: u64,
) -> Result<Option<PathBuf>> {
    let live: Vec<PathBuf> = to_overwrite
        .iter()
        .map(|rel| dest_root.join(rel))
        .filter(|p| fs::symlink_metadata(p).is_ok())
        .collect();
    if live.is_empty() {
        log::debug!("no live files would be overwritten, skipping safety backup");
        return Ok(None);
    }

    let holder = OwnedTempDir::create(&std::env::temp_dir(), "pre-restore")?;
    let name = format!(
        "pre-restore-{}.tar.gz",
        crate::utils::time::fmt_compact(timestamp)?
    );
    let out_path = holder.path().join(&name);

    let out = fs::File::create(&out_path)
        .with_context(|| format!("create {}", out_path.display()))?;
    let gz = flate2::write::GzEncoder::new(out, flate2::Compression::default());
    let mut builder = tar::Builder::new(gz);
    builder.follow_symlinks(false);

    let mut packed = 0u64;
    for path in &live {
        let rel = path
            .strip_prefix(dest_root)
            .unwrap_or(path.as_path())
            .to_path_buf();
        match builder.append_path_with_name(path, &rel) {
            Ok(()) => packed += 1,
            Err(e) => log::warn!("safety backup skip {}: {e}", path.display()),
        }
    }
    let gz = builder.into_inner().context("finish safety tar")?;
    gz.finish().context("finish safety gzip")?;

    let dir = holder.persist();
    log::info!(
        "safety backup of {packed} file(s): {}",
        dir.join(&name).display()
    );
    Ok(Some(dir.join(name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use tempfile::TempDir;

    #[test]
    fn packs_only_files_that_exist() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("etc/pve")).unwrap();
        fs::write(root.join("etc/pve/user.cfg"), b"live content").unwrap();

        let result = create_safety_backup(
            &[
                PathBuf::from("etc/pve/user.cfg"),
                PathBuf::from("etc/pve/absent.cfg"),
            ],
            root,
            1_741_935_600,
        )
        .unwrap();

        let path = result.expect("live file should force a safety backup");
        assert!(path.to_string_lossy().contains("pre-restore-20250314-070000"));

        let gz = flate2::read::GzDecoder::new(fs::File::open(&path).unwrap());
        let mut tar = tar::Archive::new(gz);
        let mut names = Vec::new();
        for entry in tar.entries().unwrap() {
            let mut e = entry.unwrap();
            names.push(e.path().unwrap().display().to_string());
            let mut content = String::new();
            e.read_to_string(&mut content).unwrap();
            assert_eq!(content, "live content");
        }
        assert_eq!(names, vec!["etc/pve/user.cfg"]);

        // kept for manual rollback; clean up through the validated path
        crate::utils::staging::remove_validated(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn nothing_live_means_no_backup() {
        let tmp = TempDir::new().unwrap();
        let result =
            create_safety_backup(&[PathBuf::from("etc/nope")], tmp.path(), 1_741_935_600)
                .unwrap();
        assert!(result.is_none());
    }
}
