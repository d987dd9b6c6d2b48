use std::{
    fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use tracing as log;
use walkdir::WalkDir;

use super::rules::{RuleSet, SYNTHETIC_DIR};
use crate::config::Config;
use crate::job::BackupJob;
use crate::utils::process::{CmdSpec, ExecCtl, Pipeline, Runner, StdioSpec};
use crate::utils::{bins, fsmeta};

pub const METADATA_FILE: &str = "backup_metadata.txt";

/// What the collector hands to the optimizer: where the user-declared
/// trees landed, so deduplication can respect the system/user boundary.
#[derive(Debug, Default)]
pub struct CollectOutcome {
    pub user_roots: Vec<PathBuf>,
}

pub struct Collector<'a> {
    rules: RuleSet,
    cfg: &'a Config,
    job: &'a BackupJob,
    runner: &'a dyn Runner,
    ctl: ExecCtl,
}

impl<'a> Collector<'a> {
    pub fn new(
        cfg: &'a Config,
        job: &'a BackupJob,
        runner: &'a dyn Runner,
        ctl: ExecCtl,
    ) -> Result<Self> {
        let rules = RuleSet::build(job.proxmox_type, &cfg.collector)?;
        Ok(Self::with_rules(rules, cfg, job, runner, ctl))
    }

    pub fn with_rules(
        rules: RuleSet,
        cfg: &'a Config,
        job: &'a BackupJob,
        runner: &'a dyn Runner,
        ctl: ExecCtl,
    ) -> Self {
        Self {
            rules,
            cfg,
            job,
            runner,
            ctl,
        }
    }

    /// Populate the staging tree. Best-effort throughout: per-file
    /// failures count as warnings, a missing declared path is DEBUG, and
    /// absent tools skip their synthetic file.
    pub fn run(&self, staging: &Path) -> Result<CollectOutcome> {
        let mut outcome = CollectOutcome::default();

        for src in &self.rules.system_paths {
            self.stage_declared_path(src, staging);
        }

        for src in &self.cfg.collector.custom_paths {
            if self.stage_declared_path(src, staging) {
                outcome.user_roots.push(mirror_path(staging, src));
            }
        }

        self.collect_synthetic(staging);

        if self.job.proxmox_type == crate::job::ProxmoxType::Pbs {
            self.collect_small_pxar(staging);
        }

        self.write_backup_metadata(staging)
            .context("write backup metadata")?;

        let snap = self.job.counters.snapshot();
        log::info!(
            "collected {} file(s), {} dir(s), {} failure(s), {} bytes staged",
            snap.files_collected,
            snap.dirs_created,
            snap.files_failed,
            snap.bytes_staged
        );
        Ok(outcome)
    }

    /// Returns whether anything was staged for this declared path.
    fn stage_declared_path(&self, src: &Path, staging: &Path) -> bool {
        match fs::symlink_metadata(src) {
            Err(_) => {
                log::debug!("declared path absent, skipping: {}", src.display());
                false
            }
            Ok(_) => {
                if let Err(e) = self.stage_tree(src, staging) {
                    log::warn!("cannot read declared path {}: {e:#}", src.display());
                    self.job.counters.add_failure();
                    false
                } else {
                    true
                }
            }
        }
    }

    fn stage_tree(&self, src: &Path, staging: &Path) -> Result<()> {
        let walker = WalkDir::new(src)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !self.rules.is_excluded(e.path()));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    log::warn!("collect: {e}");
                    self.job.counters.add_failure();
                    continue;
                }
            };
            let dest = mirror_path(staging, entry.path());
            if let Err(e) = self.stage_entry(entry.path(), &dest) {
                log::warn!("collect {}: {e:#}", entry.path().display());
                self.job.counters.add_failure();
            }
        }
        Ok(())
    }

    fn stage_entry(&self, src: &Path, dest: &Path) -> Result<()> {
        let meta = fs::symlink_metadata(src)
            .with_context(|| format!("stat {}", src.display()))?;
        let ftype = meta.file_type();

        if let Some(parent) = dest.parent()
            && !parent.exists()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }

        if ftype.is_dir() {
            if !dest.exists() {
                fs::create_dir(dest)
                    .with_context(|| format!("create dir {}", dest.display()))?;
                self.job.counters.add_dir();
            }
            let _ = fsmeta::set_mode(dest, meta.mode() & 0o7777);
            let _ = fsmeta::chown(dest, meta.uid(), meta.gid());
            let _ = fsmeta::set_times_ns(
                dest,
                (meta.atime(), meta.atime_nsec()),
                (meta.mtime(), meta.mtime_nsec()),
                true,
            );
        } else if ftype.is_symlink() {
            let target =
                fs::read_link(src).with_context(|| format!("readlink {}", src.display()))?;
            if dest.exists() || fs::symlink_metadata(dest).is_ok() {
                fs::remove_file(dest).ok();
            }
            std::os::unix::fs::symlink(&target, dest)
                .with_context(|| format!("symlink {}", dest.display()))?;
            let _ = fsmeta::lchown(dest, meta.uid(), meta.gid());
            let _ = fsmeta::set_times_ns(
                dest,
                (meta.atime(), meta.atime_nsec()),
                (meta.mtime(), meta.mtime_nsec()),
                false,
            );
            self.job.counters.add_file(0);
        } else if ftype.is_file() {
            fs::copy(src, dest)
                .with_context(|| format!("copy to {}", dest.display()))?;
            let _ = fsmeta::chown(dest, meta.uid(), meta.gid());
            let _ = fsmeta::set_times_ns(
                dest,
                (meta.atime(), meta.atime_nsec()),
                (meta.mtime(), meta.mtime_nsec()),
                true,
            );
            self.job.counters.add_file(meta.len());
        } else {
            log::debug!("skipping special file: {}", src.display());
        }
        Ok(())
    }

    fn collect_synthetic(&self, staging: &Path) {
        let dir = staging.join(SYNTHETIC_DIR);
        if let Err(e) = fs::create_dir_all(&dir) {
            log::warn!("cannot create synthetic-data dir: {e}");
            self.job.counters.add_failure();
            return;
        }

        for cmd in &self.rules.synthetic {
            if !bins::have_bin(cmd.bin) {
                log::debug!("tool '{}' absent, skipping {}", cmd.bin, cmd.output);
                continue;
            }
            let spec = CmdSpec::new(cmd.bin)
                .args(cmd.args.iter().copied())
                .stdout(StdioSpec::Pipe)
                .stderr(StdioSpec::Null);
            match self.runner.run_capture(&Pipeline::new().cmd(spec), &self.ctl) {
                Ok(cap) if cap.ok() => {
                    let out = dir.join(cmd.output);
                    if let Err(e) = fs::write(&out, cap.stdout.as_bytes()) {
                        log::warn!("write {}: {e}", out.display());
                        self.job.counters.add_failure();
                    } else {
                        self.job.counters.add_file(cap.stdout.len() as u64);
                    }
                }
                Ok(cap) => {
                    log::debug!("{} exited {}; skipping {}", cmd.bin, cap.status, cmd.output);
                }
                Err(e) => {
                    log::debug!("{} failed: {e:#}", cmd.bin);
                }
            }
        }
    }

    /// Small `.pxar` archives matching the include pattern are copied;
    /// data blobs never are.
    fn collect_small_pxar(&self, staging: &Path) {
        let Some(pattern) = self.cfg.collector.pxar_include.as_deref() else {
            return;
        };
        let re = match super::rules::glob_to_regex(pattern) {
            Ok(re) => re,
            Err(e) => {
                log::warn!("bad PXAR_INCLUDE_PATTERN: {e:#}");
                return;
            }
        };

        for store in pbs_datastore_paths(Path::new("/etc/proxmox-backup/datastore.cfg")) {
            for entry in WalkDir::new(&store).follow_links(false).into_iter().flatten() {
                let name = entry.file_name().to_string_lossy();
                if !name.ends_with(".pxar") && !name.contains(".pxar.") {
                    continue;
                }
                if !re.is_match(&name) {
                    continue;
                }
                let Ok(meta) = entry.metadata() else { continue };
                if meta.len() > self.cfg.collector.pxar_max_bytes {
                    log::debug!("pxar too large, skipping: {}", entry.path().display());
                    continue;
                }
                let dest = mirror_path(staging, entry.path());
                if let Err(e) = self.stage_entry(entry.path(), &dest) {
                    log::warn!("pxar copy {}: {e:#}", entry.path().display());
                    self.job.counters.add_failure();
                }
            }
        }
    }

    /// Capability declaration consumed by the restore engine.
    fn write_backup_metadata(&self, staging: &Path) -> Result<()> {
        let mut features = vec!["selective-restore"];
        if self.cfg.optimizer.prefilter {
            features.push("prefilter");
        }
        if self.cfg.optimizer.dedup {
            features.push("dedup");
        }
        if self.cfg.optimizer.chunking {
            features.push("chunking");
        }
        if self.cfg.encryption.enabled {
            features.push("encryption");
        }

        let content = format!(
            "VERSION={}\nBACKUP_TYPE={}\nTIMESTAMP={}\nHOSTNAME={}\n\
             SUPPORTS_SELECTIVE_RESTORE=true\nBACKUP_FEATURES={}\n",
            env!("CARGO_PKG_VERSION"),
            self.job.proxmox_type.wire_name(),
            self.job.started_at_rfc3339()?,
            self.job.hostname,
            features.join(",")
        );
        fs::write(staging.join(METADATA_FILE), content)?;
        Ok(())
    }
}

/// Mirror an absolute source path under the staging root.
pub fn mirror_path(staging: &Path, src: &Path) -> PathBuf {
    match src.strip_prefix("/") {
        Ok(rel) => staging.join(rel),
        Err(_) => staging.join(src),
    }
}

fn pbs_datastore_paths(cfg_path: &Path) -> Vec<PathBuf> {
    let Ok(text) = fs::read_to_string(cfg_path) else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for line in text.lines() {
        let trimmed = line.trim();
        if let Some(path) = trimmed.strip_prefix("path ") {
            out.push(PathBuf::from(path.trim()));
        }
    }
    out
}
