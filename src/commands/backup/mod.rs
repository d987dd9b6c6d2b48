pub mod archive;
pub mod collect;
pub mod fanout;
pub mod optimize;
pub mod preflight;
pub mod retention;
pub mod rules;

use std::panic::AssertUnwindSafe;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing as log;

use crate::AppCtx;
use crate::errors::{ExitCode, Fault, RunStatus, exit_code_for};
use crate::identity;
use crate::job::{self, BackupJob, Counters};
use crate::manifest::Manifest;
use crate::metrics::{self, RunMetrics};
use crate::notify::{self, TerminalEvent};
use crate::storage::{self, BackupSet, Layout, LocalTier, sibling};
use crate::utils::{hash, lock::LockGuard, staging::OwnedTempDir, time};

struct PipelineOutcome {
    archive: Option<PathBuf>,
    archive_bytes: u64,
    tier_results: Vec<fanout::TierResult>,
    retention_results: Vec<(fanout::TierResult, retention::RetentionOutcome)>,
}

/// The strictly phased backup driver. Everything from collection onward
/// runs behind a panic boundary; notifications, metrics and the lock
/// release happen on every exit path.
pub fn run(ctx: &AppCtx) -> i32 {
    let runner = ctx.toolbox.runner();
    let ctl = ctx.toolbox.ctl();

    // phase: preflight
    if let Err(e) = preflight::run(&ctx.cfg, runner.as_ref(), &ctl) {
        log::error!("preflight failed: {e:#}");
        return exit_code_for(&e);
    }

    let started_at = time::current_epoch();
    let job_id = job::new_job_id();
    let started_rfc = time::fmt_utc(started_at).unwrap_or_default();
    log::info!("backup job {job_id} starting");

    // phase: acquire_lock (dry-run must not create the lockfile)
    let _lock = if ctx.dry_run {
        log::info!("DRY-RUN: skipping lock acquisition");
        None
    } else {
        match LockGuard::acquire(&ctx.cfg.base_dir, &job_id, &started_rfc, ctx.cfg.lock_grace)
        {
            Ok(guard) => Some(guard),
            Err(e) => {
                log::error!("cannot acquire job lock: {e:#}");
                return ExitCode::Environment.code();
            }
        }
    };

    // phase: resolve_identity
    let hostname = job::detect_hostname(runner.as_ref(), &ctl);
    let ident = match identity::resolve(
        &ctx.cfg.base_dir,
        &hostname,
        ctx.toolbox.cipher().as_ref(),
    ) {
        Ok(ident) => ident,
        Err(e) => {
            log::error!("identity resolution failed: {e:#}");
            return exit_code_for(&e);
        }
    };

    let proxmox_type = job::resolve_proxmox_type(ctx.cfg.proxmox_type);
    let proxmox_version = job::probe_proxmox_version(proxmox_type, runner.as_ref(), &ctl);
    let backup_job = BackupJob {
        job_id,
        started_at,
        proxmox_type,
        proxmox_version,
        hostname,
        server_id: ident.server_id,
        dry_run: ctx.dry_run,
        counters: Counters::default(),
    };
    log::info!(
        "host {} ({}, server-id {}), type {}",
        backup_job.hostname,
        backup_job.proxmox_version,
        backup_job.server_id,
        backup_job.proxmox_type.wire_name()
    );

    // phases collect..retention behind the panic boundary
    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| pipeline(ctx, &backup_job)))
    {
        Ok(result) => result,
        Err(payload) => {
            let msg = panic_message(payload);
            log::error!(critical = true, "pipeline panicked: {msg}");
            Err(anyhow::Error::new(Fault::Panic).context(msg))
        }
    };

    finish(ctx, &backup_job, started_at, outcome)
}

/// Terminal phases: status mapping, notification, metrics. Best-effort
/// by contract; the computed exit code is returned unchanged.
fn finish(
    ctx: &AppCtx,
    backup_job: &BackupJob,
    started_at: u64,
    outcome: Result<PipelineOutcome>,
) -> i32 {
    let finished_at = time::current_epoch();
    let snap = backup_job.counters.snapshot();

    let (status, exit_code, message) = match &outcome {
        Ok(out) => {
            let tier_trouble = out.tier_results.iter().any(|r| !r.ok())
                || out.retention_results.iter().any(|(r, _)| !r.ok());
            if snap.files_failed > 0 || tier_trouble {
                (
                    RunStatus::Warning,
                    ExitCode::Success.code(),
                    format!(
                        "backup finished with warnings ({} file failure(s))",
                        snap.files_failed
                    ),
                )
            } else {
                (
                    RunStatus::Success,
                    ExitCode::Success.code(),
                    "backup finished".to_string(),
                )
            }
        }
        Err(e) => {
            let mut code = exit_code_for(e);
            if code == ExitCode::Generic.code() {
                code = ExitCode::Backup.code();
            }
            let status = if matches!(
                e.chain().find_map(|c| c.downcast_ref::<Fault>()),
                Some(Fault::Canceled { .. })
            ) {
                RunStatus::Aborted
            } else {
                RunStatus::Failure
            };
            log::error!("backup failed: {e:#}");
            (status, code, format!("{e:#}"))
        }
    };

    let empty = PipelineOutcome {
        archive: None,
        archive_bytes: 0,
        tier_results: Vec::new(),
        retention_results: Vec::new(),
    };
    let out = outcome.as_ref().unwrap_or(&empty);

    let event = TerminalEvent {
        status: status.as_str(),
        exit_code,
        job_id: backup_job.job_id.clone(),
        hostname: backup_job.hostname.clone(),
        proxmox_type: backup_job.proxmox_type.wire_name().to_string(),
        started_at: time::fmt_utc(started_at).unwrap_or_default(),
        finished_at: time::fmt_utc(finished_at).unwrap_or_default(),
        files_collected: snap.files_collected,
        files_failed: snap.files_failed,
        archive_bytes: out.archive_bytes,
        archives: out
            .archive
            .iter()
            .map(|p| p.display().to_string())
            .collect(),
        tier_errors: out
            .tier_results
            .iter()
            .chain(out.retention_results.iter().map(|(r, _)| r))
            .filter_map(|r| r.error.as_ref().map(|e| format!("{}: {e}", r.tier)))
            .collect(),
        message,
    };
    notify::send(
        &event,
        ctx.cfg.notify_hook.as_deref(),
        ctx.toolbox.runner().as_ref(),
        ctx.cancel,
    );

    metrics::write(
        &RunMetrics {
            exit_code,
            started_at,
            duration_seconds: finished_at.saturating_sub(started_at),
            files_collected: snap.files_collected,
            files_failed: snap.files_failed,
            archive_bytes: out.archive_bytes,
            tiers_succeeded: out.tier_results.iter().filter(|r| r.ok()).count() as u64,
            tiers_failed: out.tier_results.iter().filter(|r| !r.ok()).count() as u64,
            retention_deleted: out
                .retention_results
                .iter()
                .map(|(_, o)| o.deleted as u64)
                .sum(),
        },
        ctx.cfg.metrics_path.as_deref(),
    );

    log::info!(
        "job {} done: status={}, exit={}",
        backup_job.job_id,
        status.as_str(),
        exit_code
    );
    exit_code
}

fn pipeline(ctx: &AppCtx, backup_job: &BackupJob) -> Result<PipelineOutcome> {
    let runner = ctx.toolbox.runner();
    let ctl = ctx.toolbox.ctl();
    let layout = if ctx.cfg.bundle_associated {
        Layout::Bundle
    } else {
        Layout::Loose
    };

    // crashed predecessors may have left archives without checksums
    let primary = LocalTier::new("local", ctx.cfg.backup_path.clone());
    match primary.clean_orphans() {
        Ok(0) => {}
        Ok(n) => log::warn!("removed {n} orphaned archive(s) from the local tier"),
        Err(e) => log::warn!("orphan cleanup failed: {e:#}"),
    }

    let tmp_parent = ctx.cfg.base_dir.join("tmp");
    std::fs::create_dir_all(&tmp_parent)
        .with_context(|| format!("create {}", tmp_parent.display()))
        .context(Fault::Environment)?;
    let staging = OwnedTempDir::create(&tmp_parent, "staging").context(Fault::Environment)?;

    // phase: collect
    ctx.cancel.check()?;
    let collector = collect::Collector::new(&ctx.cfg, backup_job, runner.as_ref(), ctl)
        .context(Fault::Config)?;
    let collected = collector.run(staging.path()).map_err(|e| {
        let failed = backup_job.counters.snapshot().files_failed;
        e.context(Fault::Collection { failed })
    })?;

    // phase: optimize
    ctx.cancel.check()?;
    optimize::run(&ctx.cfg.optimizer, staging.path(), &collected.user_roots)
        .context(Fault::Collection { failed: 0 })?;

    let categories = categories_from_staging(staging.path());

    let compact = backup_job.started_at_compact()?;
    let codec = ctx.cfg.compression.codec;
    let archive_name = storage::archive_file_name(
        backup_job.proxmox_type,
        &backup_job.hostname,
        &compact,
        codec.archive_ext(),
    );
    let final_path = ctx.cfg.backup_path.join(&archive_name);

    if backup_job.dry_run {
        log_plan(ctx, &final_path, &categories);
        return Ok(PipelineOutcome {
            archive: None,
            archive_bytes: 0,
            tier_results: Vec::new(),
            retention_results: Vec::new(),
        });
    }

    // phase: archive (tar + compress + hash, one pass)
    ctx.cancel.check()?;
    let mut outcome = archive::write_archive(
        staging.path(),
        &final_path,
        codec,
        ctx.cfg.compression.level,
        ctx.cfg.compression.mode,
        ctx.cfg.compression.threads,
    )?;

    // phase: encrypt
    let encryption_mode = if ctx.cfg.encryption.enabled {
        outcome = encrypt_archive(ctx, outcome)?;
        "age"
    } else {
        "none"
    };

    // phase: manifest
    let manifest = build_manifest(ctx, backup_job, &outcome, encryption_mode, &categories)?;
    let metadata_path = sibling(&outcome.archive, ".metadata");
    manifest.write(&metadata_path).context(Fault::Archive)?;
    let meta_sha = hash::hash_file(&metadata_path)?;
    std::fs::write(
        sibling(&outcome.archive, ".metadata.sha256"),
        format!("{meta_sha}\n"),
    )
    .context(Fault::Archive)?;

    // phase: verify_primary (fatal on mismatch)
    ctx.cancel.check()?;
    if !archive::verify_against_sidecar(&outcome.archive).context(Fault::Verification)? {
        return Err(anyhow::Error::new(Fault::Verification)
            .context("primary archive does not match its checksum"));
    }
    log::info!("primary verification passed");

    // bundle layout packs the set into a single object
    if layout == Layout::Bundle {
        storage::build_bundle(&outcome.archive).context(Fault::Archive)?;
        remove_loose_set(&outcome.archive);
    }
    let set = BackupSet {
        archive: outcome.archive.clone(),
        layout,
    };

    // phase: fan_out
    let tiers = fanout::build_tiers(&ctx.cfg, &ctx.toolbox);
    let tier_results = fanout::fan_out(&tiers, &set, &ctx.cancel)?;

    // phase: retention, per tier, only after fan-out completed
    let object_name = set
        .objects()
        .first()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default();
    let stored_names: Vec<(&'static str, String)> = tiers
        .iter()
        .map(|setup| {
            let path = match setup.tier.name() {
                "local" => ctx.cfg.backup_path.join(&object_name).display().to_string(),
                "secondary" => ctx
                    .cfg
                    .secondary
                    .as_ref()
                    .map(|s| s.path.join(&object_name).display().to_string())
                    .unwrap_or_default(),
                _ => object_name.clone(),
            };
            (setup.tier.name(), path)
        })
        .collect();
    let retention_results = fanout::run_retention_all(
        &tiers,
        &stored_names,
        backup_job.started_at,
        &ctx.cancel,
    );

    for setup in &tiers {
        match setup.tier.get_stats() {
            Ok(stats) => log::info!(
                "tier '{}': {} backup(s), {} total, newest {}",
                setup.tier.name(),
                stats.total_backups,
                crate::ui::human_size(stats.total_bytes),
                time::fmt_utc(stats.newest_mtime).unwrap_or_else(|_| "-".into())
            ),
            Err(e) => log::debug!("stats for tier '{}' unavailable: {e:#}", setup.tier.name()),
        }
    }

    Ok(PipelineOutcome {
        archive: Some(set.objects().remove(0)),
        archive_bytes: outcome.size_bytes,
        tier_results,
        retention_results,
    })
}

/// Re-stream through the recipient encryptor, then shred the plaintext.
/// The `.sha256` sidecar follows the stored object.
fn encrypt_archive(
    ctx: &AppCtx,
    outcome: archive::ArchiveOutcome,
) -> Result<archive::ArchiveOutcome> {
    let age = ctx.toolbox.age();
    let recipients = ctx
        .cfg
        .encryption
        .recipients_file
        .as_ref()
        .context("encryption enabled without recipients file")
        .context(Fault::Config)?;

    let encrypted_path = sibling(&outcome.archive, ".age");
    age.encrypt(recipients, &outcome.archive, &encrypted_path)
        .context(Fault::Security)?;

    let sha256 = hash::hash_file(&encrypted_path)?;
    std::fs::write(sibling(&encrypted_path, ".sha256"), format!("{sha256}\n"))
        .context(Fault::Archive)?;
    let size_bytes = std::fs::metadata(&encrypted_path)
        .map(|m| m.len())
        .unwrap_or(0);

    secure_delete(&outcome.archive);
    let _ = std::fs::remove_file(sibling(&outcome.archive, ".sha256"));

    log::info!("archive encrypted: {}", encrypted_path.display());
    Ok(archive::ArchiveOutcome {
        archive: encrypted_path,
        sha256,
        size_bytes,
        entries: outcome.entries,
    })
}

/// Overwrite once, sync, unlink. Best-effort shredding of plaintext.
fn secure_delete(path: &std::path::Path) {
    use std::io::{Seek, Write};
    let result = (|| -> std::io::Result<()> {
        let len = std::fs::metadata(path)?.len();
        let mut f = std::fs::OpenOptions::new().write(true).open(path)?;
        f.seek(std::io::SeekFrom::Start(0))?;
        let zeros = vec![0u8; 64 * 1024];
        let mut remaining = len;
        while remaining > 0 {
            let n = remaining.min(zeros.len() as u64) as usize;
            f.write_all(&zeros[..n])?;
            remaining -= n as u64;
        }
        f.sync_all()?;
        std::fs::remove_file(path)
    })();
    if let Err(e) = result {
        log::warn!("secure delete of {} incomplete: {e}", path.display());
        let _ = std::fs::remove_file(path);
    }
}

fn remove_loose_set(archive: &std::path::Path) {
    let _ = std::fs::remove_file(archive);
    for suffix in storage::ASSOCIATED_SUFFIXES {
        let _ = std::fs::remove_file(sibling(archive, suffix));
    }
}

fn build_manifest(
    ctx: &AppCtx,
    backup_job: &BackupJob,
    outcome: &archive::ArchiveOutcome,
    encryption_mode: &str,
    categories: &[String],
) -> Result<Manifest> {
    Ok(Manifest {
        archive_path: outcome.archive.display().to_string(),
        archive_size: outcome.size_bytes,
        sha256: outcome.sha256.clone(),
        created_at: backup_job.started_at_rfc3339()?,
        compression_type: ctx.cfg.compression.codec.wire_name().to_string(),
        compression_level: ctx.cfg.compression.level,
        compression_mode: ctx.cfg.compression.mode.wire_name().to_string(),
        proxmox_type: backup_job.proxmox_type.wire_name().to_string(),
        proxmox_targets: ctx
            .cfg
            .enabled_tiers()
            .into_iter()
            .map(str::to_string)
            .collect(),
        proxmox_version: backup_job.proxmox_version.clone(),
        hostname: backup_job.hostname.clone(),
        script_version: env!("CARGO_PKG_VERSION").to_string(),
        encryption_mode: encryption_mode.to_string(),
        categories_present: categories.to_vec(),
        supports_selective_restore: true,
    })
}

fn categories_from_staging(staging: &std::path::Path) -> Vec<String> {
    let rels: Vec<PathBuf> = walkdir::WalkDir::new(staging)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .flatten()
        .filter_map(|e| e.path().strip_prefix(staging).ok().map(|p| p.to_path_buf()))
        .collect();
    super::restore::categories::categories_present(rels.iter().map(PathBuf::as_path))
}

fn log_plan(ctx: &AppCtx, final_path: &std::path::Path, categories: &[String]) {
    log::info!("DRY-RUN plan:");
    log::info!("  archive: {}", final_path.display());
    log::info!(
        "  compression: {} level {} ({})",
        ctx.cfg.compression.codec.wire_name(),
        ctx.cfg.compression.level,
        ctx.cfg.compression.mode.wire_name()
    );
    log::info!(
        "  encryption: {}",
        if ctx.cfg.encryption.enabled { "age" } else { "none" }
    );
    log::info!("  tiers: {}", ctx.cfg.enabled_tiers().join(", "));
    log::info!("  categories: {}", categories.join(", "));
    log::info!(
        "  layout: {}",
        if ctx.cfg.bundle_associated { "bundle" } else { "loose" }
    );
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
