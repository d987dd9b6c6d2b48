use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result};
use tracing as log;

use super::{
    ASSOCIATED_SUFFIXES, BackupRecord, BackupSet, BUNDLE_SUFFIX, FsInfo, StorageTier, TierStats,
    is_associated_name, parse_archive_name, sort_newest_first,
};
use crate::config::CloudCfg;
use crate::errors::Fault;
use crate::tooling::RclonePort;
use crate::utils::{cancel::CancelToken, hash, retry, staging::OwnedTempDir};

/// Remote tier driven entirely by the external sync utility. Remote
/// directories that answer "not found" are cached as absent for the rest
/// of the run so repeated misses issue no further commands.
pub struct CloudTier {
    cfg: CloudCfg,
    rclone: Arc<dyn RclonePort>,
    cancel: CancelToken,
    missing_dirs: Mutex<HashSet<String>>,
}

impl CloudTier {
    pub fn new(cfg: CloudCfg, rclone: Arc<dyn RclonePort>, cancel: CancelToken) -> Self {
        Self {
            cfg,
            rclone,
            cancel,
            missing_dirs: Mutex::new(HashSet::new()),
        }
    }

    fn backup_dir(&self) -> String {
        format!("{}:{}", self.cfg.remote, self.cfg.path)
    }

    fn remote_object(&self, name: &str) -> String {
        format!("{}/{}", self.backup_dir(), name)
    }

    fn log_dir(&self) -> Option<String> {
        self.cfg
            .log_path
            .as_ref()
            .map(|p| format!("{}:{}", self.cfg.remote, p))
    }

    fn backoff(&self) -> retry::Backoff {
        retry::Backoff::new(
            self.cfg.retries.max(1),
            std::time::Duration::from_secs(1),
            self.cfg.backoff_cap,
        )
    }

    fn dir_known_missing(&self, dir: &str) -> bool {
        self.missing_dirs.lock().unwrap().contains(dir)
    }

    fn mark_dir_missing(&self, dir: &str) {
        log::debug!("remote directory cached as absent: {dir}");
        self.missing_dirs.lock().unwrap().insert(dir.to_string());
    }

    /// Best-effort removal of a run log on the remote. Once the log
    /// directory is known to be absent this returns `false` without
    /// issuing any command.
    pub fn delete_associated_log(&self, log_name: &str) -> Result<bool> {
        let Some(dir) = self.log_dir() else {
            return Ok(false);
        };
        if self.dir_known_missing(&dir) {
            return Ok(false);
        }

        match self.rclone.lsl(&dir)? {
            None => {
                self.mark_dir_missing(&dir);
                Ok(false)
            }
            Some(entries) => {
                if !entries.iter().any(|e| e.name == log_name) {
                    return Ok(false);
                }
                self.rclone.deletefile(&format!("{dir}/{log_name}"))
            }
        }
    }

    /// Remote log count for the job summary, via `lsf --files-only`.
    pub fn log_count(&self) -> Result<usize> {
        let Some(dir) = self.log_dir() else {
            return Ok(0);
        };
        if self.dir_known_missing(&dir) {
            return Ok(0);
        }
        match self.rclone.lsf_files(&dir)? {
            None => {
                self.mark_dir_missing(&dir);
                Ok(0)
            }
            Some(files) => Ok(files.len()),
        }
    }
}

impl StorageTier for CloudTier {
    fn name(&self) -> &'static str {
        "cloud"
    }

    fn is_enabled(&self) -> bool {
        true
    }

    fn detect_filesystem(&self) -> FsInfo {
        // synthetic record: there is no local mount behind the remote
        FsInfo {
            fs_type: "rclone".to_string(),
            mount_point: std::path::PathBuf::from(self.backup_dir()),
            supports_ownership: false,
            is_network: true,
        }
    }

    fn store(&self, set: &BackupSet) -> Result<()> {
        let policy = self.backoff();
        for obj in set.objects() {
            let name = obj
                .file_name()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let remote = self.remote_object(&name);
            retry::with_backoff(
                &format!("upload {name}"),
                &self.cancel,
                &policy,
                || self.rclone.copyto(&obj, &remote),
            )
            .context(Fault::storage("cloud", "store"))?;
        }
        Ok(())
    }

    fn list(&self) -> Result<Vec<BackupRecord>> {
        let dir = self.backup_dir();
        if self.dir_known_missing(&dir) {
            return Ok(Vec::new());
        }

        let entries = match self.rclone.lsl(&dir)? {
            None => {
                self.mark_dir_missing(&dir);
                return Ok(Vec::new());
            }
            Some(entries) => entries,
        };

        let mut records = Vec::new();
        for e in entries {
            if is_associated_name(&e.name) {
                continue;
            }
            let Some(parsed) = parse_archive_name(&e.name) else {
                continue;
            };
            records.push(BackupRecord {
                tier: "cloud",
                path: e.name.clone(),
                size: e.size,
                mtime: e.mtime_epoch,
                parsed: Some(parsed),
                manifest: None,
            });
        }
        sort_newest_first(&mut records);
        Ok(records)
    }

    fn delete(&self, record_path: &str) -> Result<()> {
        self.cancel.check()?;
        self.rclone
            .deletefile(&self.remote_object(record_path))
            .context(Fault::storage("cloud", "delete"))?;

        if !record_path.ends_with(BUNDLE_SUFFIX) {
            // mixed layouts leave gaps; absent members are a no-op
            for suffix in ASSOCIATED_SUFFIXES {
                let existed = self
                    .rclone
                    .deletefile(&self.remote_object(&format!("{record_path}{suffix}")))
                    .context(Fault::storage("cloud", "delete"))?;
                if !existed {
                    log::debug!("associated {record_path}{suffix} was not on the remote");
                }
            }
        }

        // run logs are best-effort; absence of the log dir is cached
        match self.delete_associated_log(&format!("{record_path}.log")) {
            Ok(true) => log::debug!("removed remote run log for {record_path}"),
            Ok(false) => {}
            Err(e) => log::debug!("remote log cleanup failed: {e:#}"),
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
        // pull both the object and its checksum, then hash locally
        let work = OwnedTempDir::create(&std::env::temp_dir(), "cloud-verify")?;
        let local = work.path().join(record_path);
        let local_sha = work.path().join(format!("{record_path}.sha256"));

        self.rclone
            .copyto_local(&self.remote_object(record_path), &local)
            .context(Fault::storage("cloud", "verify"))?;
        self.rclone
            .copyto_local(
                &self.remote_object(&format!("{record_path}.sha256")),
                &local_sha,
            )
            .context(Fault::storage("cloud", "verify"))?;

        let expected = std::fs::read_to_string(&local_sha)
            .with_context(|| format!("read downloaded checksum for {record_path}"))?;
        Ok(hash::hash_file(&local)? == expected.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Retention;
    use crate::tooling::rclone::RemoteEntry;
    use std::path::Path;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeRclone {
        calls: Mutex<Vec<String>>,
        copy_failures: AtomicU32,
        log_dir_exists: bool,
        listing: Vec<RemoteEntry>,
    }

    impl FakeRclone {
        fn record(&self, s: String) {
            self.calls.lock().unwrap().push(s);
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl RclonePort for FakeRclone {
        fn copyto(&self, src: &Path, remote: &str) -> Result<()> {
            self.record(format!("copyto {} {remote}", src.display()));
            if self.copy_failures.load(Ordering::SeqCst) > 0 {
                self.copy_failures.fetch_sub(1, Ordering::SeqCst);
                anyhow::bail!("transient network failure");
            }
            Ok(())
        }

        fn copyto_local(&self, remote: &str, dst: &Path) -> Result<()> {
            self.record(format!("copyto_local {remote} {}", dst.display()));
            Ok(())
        }

        fn lsl(&self, remote: &str) -> Result<Option<Vec<RemoteEntry>>> {
            self.record(format!("lsl {remote}"));
            if remote.ends_with("logs") && !self.log_dir_exists {
                return Ok(None);
            }
            Ok(Some(self.listing.clone()))
        }

        fn deletefile(&self, remote: &str) -> Result<bool> {
            self.record(format!("deletefile {remote}"));
            Ok(!remote.ends_with(".metadata.sha256"))
        }

        fn lsf_files(&self, remote: &str) -> Result<Option<Vec<String>>> {
            self.record(format!("lsf {remote}"));
            Ok(Some(vec![]))
        }
    }

    fn cfg() -> CloudCfg {
        CloudCfg {
            bin: "rclone".into(),
            remote: "remote".into(),
            path: "backups".into(),
            log_path: Some("logs".into()),
            retries: 3,
            backoff_cap: std::time::Duration::from_millis(2),
            op_timeout: std::time::Duration::from_secs(5),
            batch_size: 10,
            batch_pause: std::time::Duration::from_millis(1),
            retention: Retention::Simple { max_backups: 5 },
        }
    }

    fn tier(fake: Arc<FakeRclone>) -> CloudTier {
        CloudTier::new(cfg(), fake, CancelToken::new())
    }

    #[test]
    fn missing_log_directory_is_cached_for_the_run() {
        let fake = Arc::new(FakeRclone::default());
        let t = tier(fake.clone());

        assert!(!t.delete_associated_log("job-1.log").unwrap());
        let after_first = fake.call_count();
        assert_eq!(after_first, 1, "first miss probes the remote once");

        // no further commands for subsequent calls
        assert!(!t.delete_associated_log("job-2.log").unwrap());
        assert!(!t.delete_associated_log("job-3.log").unwrap());
        assert_eq!(fake.call_count(), after_first);
        assert_eq!(t.log_count().unwrap(), 0);
        assert_eq!(fake.call_count(), after_first);
    }

    #[test]
    fn store_retries_transient_failures_with_backoff() {
        let fake = Arc::new(FakeRclone {
            copy_failures: AtomicU32::new(2),
            ..Default::default()
        });
        let t = tier(fake.clone());

        t.store(&BackupSet {
            archive: std::path::PathBuf::from("/b/pve-backup-n-20250314-070000.tar"),
            layout: super::super::Layout::Bundle,
        })
        .unwrap();

        // two failures then success, one object
        assert_eq!(fake.call_count(), 3);
    }

    #[test]
    fn store_gives_up_after_exhausting_retries() {
        let fake = Arc::new(FakeRclone {
            copy_failures: AtomicU32::new(10),
            ..Default::default()
        });
        let t = tier(fake);

        let err = t
            .store(&BackupSet {
                archive: std::path::PathBuf::from("/b/pve-backup-n-20250314-070000.tar"),
                layout: super::super::Layout::Bundle,
            })
            .unwrap_err();
        assert_eq!(crate::errors::exit_code_for(&err), 5);
    }

    #[test]
    fn list_filters_associated_and_sorts_newest_first() {
        let entry = |name: &str, mtime: u64| RemoteEntry {
            size: 10,
            mtime_epoch: mtime,
            name: name.to_string(),
        };
        let fake = Arc::new(FakeRclone {
            listing: vec![
                entry("pve-backup-n-20250314-070000.tar.zst", 100),
                entry("pve-backup-n-20250314-070000.tar.zst.sha256", 100),
                entry("pve-backup-n-20250314-080000.tar.zst", 200),
                entry("stray-file.bin", 300),
            ],
            log_dir_exists: true,
            ..Default::default()
        });
        let t = tier(fake);

        let records = t.list().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].path, "pve-backup-n-20250314-080000.tar.zst");
        assert!(records.iter().all(|r| !r.path.ends_with(".sha256")));
    }

    #[test]
    fn delete_tolerates_missing_bundle_members() {
        let fake = Arc::new(FakeRclone {
            log_dir_exists: true,
            ..Default::default()
        });
        let t = tier(fake.clone());

        // fake reports .metadata.sha256 as absent; still a success
        t.delete("pve-backup-n-20250314-070000.tar.zst").unwrap();
        // archive + three sidecars + one log-dir probe
        assert_eq!(fake.call_count(), 5);

        // second delete reuses the probed log dir state only when absent;
        // with the dir present it probes again, which is fine
        t.delete("pve-backup-n-20250314-080000.tar.zst.bundle.tar")
            .unwrap();
        let calls = fake.calls.lock().unwrap();
        // bundle delete touches no sidecars
        assert!(
            !calls
                .iter()
                .any(|c| c.contains("bundle.tar.sha256"))
        );
    }
}
