pub mod categories;
pub mod extract;
pub mod safety;

use std::{
    collections::HashSet,
    io::{BufRead, Write as _},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, bail};
use clap::Args;
use thiserror::Error;
use tracing as log;

use crate::AppCtx;
use crate::errors::{ExitCode, Fault, exit_code_for};
use crate::job::{self, ProxmoxType};
use crate::manifest::Manifest;
use crate::storage::{LocalTier, StorageTier, sibling};
use crate::ui;
use crate::utils::process::{CmdSpec, Pipeline, StdioSpec};
use crate::utils::{staging::OwnedTempDir, time};

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    /// Archive to restore from; picked interactively when omitted
    pub archive: Option<PathBuf>,

    #[arg(long, default_value = "/")]
    pub dest_root: PathBuf,

    /// full | storage | base | custom (asked interactively when omitted)
    #[arg(long)]
    pub mode: Option<String>,

    /// Comma-separated category ids for --mode custom
    #[arg(long)]
    pub categories: Option<String>,

    /// age identity file for encrypted archives
    #[arg(long)]
    pub identity: Option<PathBuf>,

    /// Answer yes to confirmable warnings
    #[arg(long)]
    pub yes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreMode {
    Full,
    Storage,
    Base,
    Custom,
}

#[derive(Debug, Error)]
pub enum DecryptFailure {
    #[error("decryption aborted by user")]
    Aborted,
    #[error("decryption failed: {0}")]
    Error(String),
}

pub fn run(ctx: &AppCtx, args: &RestoreArgs) -> i32 {
    match run_inner(ctx, args) {
        Ok(code) => code,
        Err(e) => {
            log::error!("restore failed: {e:#}");
            if e.downcast_ref::<DecryptFailure>()
                .is_some_and(|d| matches!(d, DecryptFailure::Error(_)))
            {
                return ExitCode::Security.code();
            }
            exit_code_for(&e)
        }
    }
}

fn run_inner(ctx: &AppCtx, args: &RestoreArgs) -> Result<i32> {
    // a candidate can come from any tier: local path, secondary mount
    // path, or a cloud object name fetched into a marker-validated dir
    let mut _fetch_holder: Option<OwnedTempDir> = None;
    let archive_path = match &args.archive {
        Some(p) if !p.exists() && ctx.cfg.cloud.is_some() => {
            let (holder, local) = fetch_from_cloud(ctx, p)?;
            _fetch_holder = Some(holder);
            local
        }
        Some(p) => p.clone(),
        None => pick_archive(ctx)?,
    };
    if !archive_path.exists() {
        bail!("archive not found: {}", archive_path.display());
    }
    log::info!("restoring from {}", archive_path.display());

    // decrypt first when the name says so; plaintext only ever lands in a
    // marker-validated temp dir that is removed on all paths
    let mut _decrypt_holder: Option<OwnedTempDir> = None;
    let plain_archive = if archive_path.extension().is_some_and(|e| e == "age") {
        let (holder, plain) = decrypt_to_temp(ctx, args, &archive_path)?;
        _decrypt_holder = Some(holder);
        plain
    } else {
        archive_path.clone()
    };

    // one pass over the headers: entry list and categories present
    let entries = scan_entries(&plain_archive)?;
    let present = categories::categories_present(entries.iter().map(PathBuf::as_path));
    if present.is_empty() {
        bail!("archive contains no recognizable configuration categories");
    }

    // compatibility: manifest type vs live host type
    let manifest = Manifest::load(&sibling(&archive_path, ".metadata")).ok();
    if let Some(m) = &manifest {
        let live = job::resolve_proxmox_type(ctx.cfg.proxmox_type);
        let archived = ProxmoxType::from_wire(&m.proxmox_type);
        if archived != live && archived != ProxmoxType::Unknown {
            let ok = confirm(
                &format!(
                    "archive was taken on a {} host but this host is {}; continue?",
                    m.proxmox_type,
                    live.wire_name()
                ),
                args.yes,
            )?;
            if !ok {
                log::info!("restore canceled");
                return Ok(ExitCode::Generic.code());
            }
        }
    }

    ui::print_categories(&present, None);
    let mode = match &args.mode {
        Some(m) => parse_mode(m)?,
        None => ask_mode()?,
    };
    let selected = resolve_selection(mode, &present, args.categories.as_deref())?;
    if selected.is_empty() {
        bail!("no categories selected");
    }
    ui::print_categories(&present, Some(&selected));

    // safety backup of everything the extraction will overwrite
    let to_overwrite: Vec<PathBuf> = entries
        .iter()
        .filter(|rel| {
            categories::category_of_entry(rel).is_some_and(|c| selected.contains(c))
        })
        .cloned()
        .collect();
    let now = time::current_epoch();
    match safety::create_safety_backup(&to_overwrite, &args.dest_root, now) {
        Ok(Some(path)) => log::info!("safety backup at {}", path.display()),
        Ok(None) => {}
        Err(e) => {
            log::warn!("safety backup failed: {e:#}");
            if !confirm("continue without a safety backup?", args.yes)? {
                log::info!("restore canceled");
                return Ok(ExitCode::Generic.code());
            }
        }
    }

    let report =
        extract::extract_selected(&plain_archive, &args.dest_root, &selected, &ctx.cancel)?;

    let log_path = write_restore_log(ctx, &archive_path, &selected, &report, now);
    log::info!(
        "restore complete: {} restored, {} skipped, {} failed, {} refused",
        report.restored.len(),
        report.skipped,
        report.failed,
        report.refused.len()
    );
    if let Some(p) = log_path {
        log::info!("detailed log: {}", p.display());
    }

    post_restore_hints(ctx, &selected);
    Ok(ExitCode::Success.code())
}

// ---------------------------------------------------------------------------
// steps

fn pick_archive(ctx: &AppCtx) -> Result<PathBuf> {
    let tier = LocalTier::new("local", ctx.cfg.backup_path.clone());
    let records = tier.list()?;
    if records.is_empty() {
        bail!(
            "no backups found under {}; pass an archive path explicitly",
            ctx.cfg.backup_path.display()
        );
    }
    ui::print_backups(&records);

    let answer = prompt("select a backup by number: ")?;
    let idx: usize = answer
        .trim()
        .parse()
        .with_context(|| format!("not a number: '{}'", answer.trim()))?;
    let record = records
        .get(idx.saturating_sub(1))
        .with_context(|| format!("no backup #{idx}"))?;
    Ok(PathBuf::from(&record.path))
}

/// Pull a cloud object (by name) plus its manifest sidecar down for the
/// restore; everything lands in a temp dir removed on all paths.
fn fetch_from_cloud(ctx: &AppCtx, name: &Path) -> Result<(OwnedTempDir, PathBuf)> {
    let cloud = ctx.cfg.cloud.as_ref().context("no cloud tier configured")?;
    let rclone = ctx.toolbox.rclone().context("cloud tooling unavailable")?;

    let object = name.to_string_lossy();
    let remote = format!("{}:{}/{}", cloud.remote, cloud.path, object);

    let tmp_parent = ctx.cfg.base_dir.join("tmp");
    std::fs::create_dir_all(&tmp_parent).context(Fault::Environment)?;
    let holder = OwnedTempDir::create(&tmp_parent, "fetch")?;
    let local = holder.path().join(object.as_ref());

    log::info!("fetching {remote}");
    rclone
        .copyto_local(&remote, &local)
        .context(Fault::storage("cloud", "fetch"))?;
    // manifest sidecar is best-effort; the compat check just skips it
    let _ = rclone.copyto_local(
        &format!("{remote}.metadata"),
        &sibling(&local, ".metadata"),
    );
    Ok((holder, local))
}

fn decrypt_to_temp(
    ctx: &AppCtx,
    args: &RestoreArgs,
    encrypted: &Path,
) -> Result<(OwnedTempDir, PathBuf)> {
    let identity = match &args.identity {
        Some(p) => p.clone(),
        None => {
            let answer = prompt("path to age identity file (empty to abort): ")?;
            let trimmed = answer.trim();
            if trimmed.is_empty() {
                return Err(DecryptFailure::Aborted.into());
            }
            PathBuf::from(trimmed)
        }
    };
    if !identity.exists() {
        return Err(
            DecryptFailure::Error(format!("identity file not found: {}", identity.display()))
                .into(),
        );
    }

    let age = ctx.toolbox.age();

    let tmp_parent = ctx.cfg.base_dir.join("tmp");
    std::fs::create_dir_all(&tmp_parent).context(Fault::Environment)?;
    let holder = OwnedTempDir::create(&tmp_parent, "decrypt")?;

    let plain_name = encrypted
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .context("encrypted archive has no name")?;
    let plain = holder.path().join(plain_name);

    log::info!("decrypting {}", encrypted.display());
    age.decrypt(&identity, encrypted, &plain)
        .map_err(|e| DecryptFailure::Error(format!("{e:#}")))?;
    Ok((holder, plain))
}

/// Header-only scan; file contents are not read.
fn scan_entries(archive: &Path) -> Result<Vec<PathBuf>> {
    let mut tar = crate::commands::backup::archive::open_archive(archive)?;
    let mut entries = Vec::new();
    for entry in tar.entries().context("scan archive headers")? {
        let entry = entry.context("archive entry")?;
        entries.push(entry.path().context("entry path")?.into_owned());
    }
    Ok(entries)
}

pub fn parse_mode(s: &str) -> Result<RestoreMode> {
    Ok(match s.to_ascii_lowercase().as_str() {
        "full" => RestoreMode::Full,
        "storage" => RestoreMode::Storage,
        "base" => RestoreMode::Base,
        "custom" => RestoreMode::Custom,
        other => bail!("unknown restore mode '{other}' (full|storage|base|custom)"),
    })
}

fn ask_mode() -> Result<RestoreMode> {
    println!("restore modes: [1] full  [2] storage  [3] base  [4] custom");
    let answer = prompt("mode: ")?;
    Ok(match answer.trim() {
        "1" | "full" => RestoreMode::Full,
        "2" | "storage" => RestoreMode::Storage,
        "3" | "base" => RestoreMode::Base,
        "4" | "custom" => RestoreMode::Custom,
        other => bail!("unknown selection '{other}'"),
    })
}

/// Selection per mode, limited to what the archive actually contains.
pub fn resolve_selection(
    mode: RestoreMode,
    present: &[String],
    custom: Option<&str>,
) -> Result<HashSet<String>> {
    let present_set: HashSet<&str> = present.iter().map(String::as_str).collect();
    Ok(match mode {
        RestoreMode::Full => present.iter().cloned().collect(),
        RestoreMode::Storage => categories::STORAGE_CATEGORIES
            .iter()
            .filter(|c| present_set.contains(**c))
            .map(|c| c.to_string())
            .collect(),
        RestoreMode::Base => present
            .iter()
            .filter(|c| c.as_str() == "system_base")
            .cloned()
            .collect(),
        RestoreMode::Custom => {
            let input = match custom {
                Some(list) => list.to_string(),
                None => prompt("categories (comma-separated): ")?,
            };
            let mut out = HashSet::new();
            for raw in input.split(',') {
                let id = raw.trim();
                if id.is_empty() {
                    continue;
                }
                if categories::by_id(id).is_none() {
                    bail!("unknown category '{id}'");
                }
                if !present_set.contains(id) {
                    log::warn!("category '{id}' not present in this archive, ignoring");
                    continue;
                }
                out.insert(id.to_string());
            }
            out
        }
    })
}

fn write_restore_log(
    ctx: &AppCtx,
    archive: &Path,
    selected: &HashSet<String>,
    report: &extract::ExtractReport,
    now: u64,
) -> Option<PathBuf> {
    let dir = ctx.cfg.base_dir.join("logs");
    if let Err(e) = std::fs::create_dir_all(&dir) {
        log::warn!("cannot create log dir: {e}");
        return None;
    }
    let compact = time::fmt_compact(now).unwrap_or_else(|_| now.to_string());
    let path = dir.join(format!("restore-{compact}.log"));

    let mut selected_list: Vec<&str> = selected.iter().map(String::as_str).collect();
    selected_list.sort_unstable();

    let mut body = format!(
        "archive: {}\nwhen: {}\ncategories: {}\nrestored: {}\nskipped: {}\nfailed: {}\nrefused: {}\nchunks rebuilt: {} ({} failed)\n\n",
        archive.display(),
        time::fmt_utc(now).unwrap_or_default(),
        selected_list.join(","),
        report.restored.len(),
        report.skipped,
        report.failed,
        report.refused.len(),
        report.chunks_rebuilt,
        report.chunk_failures,
    );
    for f in &report.restored {
        body.push_str(&format!("restored {f}\n"));
    }
    for f in &report.refused {
        body.push_str(&format!("REFUSED {f}\n"));
    }

    match std::fs::write(&path, body) {
        Ok(()) => Some(path),
        Err(e) => {
            log::warn!("cannot write restore log: {e}");
            None
        }
    }
}

/// Guidance only; the engine never restarts services itself.
fn post_restore_hints(ctx: &AppCtx, selected: &HashSet<String>) {
    if selected.contains("zfs") {
        log::info!("ZFS configuration was restored; checking for importable pools");
        let cmd = CmdSpec::new("zpool")
            .arg("import")
            .stdout(StdioSpec::Pipe)
            .stderr(StdioSpec::Null);
        match ctx
            .toolbox
            .runner()
            .run_capture(&Pipeline::new().cmd(cmd), &ctx.toolbox.ctl())
        {
            Ok(cap) if cap.ok() && !cap.stdout.trim().is_empty() => {
                log::info!("importable pools found:\n{}", cap.stdout.trim());
                log::info!("import with: zpool import <pool>");
            }
            _ => log::info!("no importable pools reported"),
        }
    }

    if selected.contains("cluster_pve") || selected.contains("vzdump") {
        log::info!(
            "PVE configuration was restored; review and restart services manually:\n  \
             systemctl restart pve-cluster corosync pvedaemon pveproxy"
        );
    }
    if selected.contains("datastore_pbs") {
        log::info!(
            "PBS configuration was restored; review and restart services manually:\n  \
             systemctl restart proxmox-backup proxmox-backup-proxy"
        );
    }
}

// ---------------------------------------------------------------------------
// terminal helpers

fn prompt(message: &str) -> Result<String> {
    print!("{message}");
    std::io::stdout().flush().ok();
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("read from terminal")?;
    Ok(line)
}

fn confirm(message: &str, assume_yes: bool) -> Result<bool> {
    if assume_yes {
        log::warn!("{message} -- assuming yes (--yes)");
        return Ok(true);
    }
    let answer = prompt(&format!("{message} [y/N] "))?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}
