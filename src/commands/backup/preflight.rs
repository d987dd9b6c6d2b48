use anyhow::{Context, Result, bail};
use tracing as log;

use crate::config::Config;
use crate::errors::Fault;
use crate::utils::process::{CmdSpec, ExecCtl, Pipeline, Runner, StdioSpec};

/// Environment checks before any mutation: free disk on the primary tier,
/// reachability when an outbound feature is enabled, runtime sanity.
pub fn run(cfg: &Config, runner: &dyn Runner, ctl: &ExecCtl) -> Result<()> {
    check_backup_path_writable(cfg)?;
    check_disk_space(cfg).context(Fault::DiskSpace)?;
    check_network(cfg, runner, ctl)?;
    check_runtime();
    Ok(())
}

fn check_backup_path_writable(cfg: &Config) -> Result<()> {
    if crate::utils::exec_policy::is_dry_run() {
        return Ok(());
    }
    std::fs::create_dir_all(&cfg.backup_path)
        .with_context(|| format!("create backup path {}", cfg.backup_path.display()))
        .context(Fault::Permission)?;
    let probe = cfg.backup_path.join(".proxsave-write-test");
    std::fs::write(&probe, b"")
        .with_context(|| format!("backup path {} is not writable", cfg.backup_path.display()))
        .context(Fault::Permission)?;
    let _ = std::fs::remove_file(&probe);
    Ok(())
}

fn check_disk_space(cfg: &Config) -> Result<()> {
    // the backup path may not exist yet on first run; probe the nearest
    // existing ancestor
    let mut probe = cfg.backup_path.as_path();
    while !probe.exists() {
        probe = probe.parent().unwrap_or(std::path::Path::new("/"));
    }

    let free = fs2::available_space(probe)
        .with_context(|| format!("query free space for {}", probe.display()))?;
    let free_mb = free / (1024 * 1024);
    if free_mb < cfg.min_free_mb {
        bail!(
            "{} has {free_mb} MiB free, {} MiB required",
            probe.display(),
            cfg.min_free_mb
        );
    }
    log::debug!("disk check: {free_mb} MiB free at {}", probe.display());
    Ok(())
}

fn check_network(cfg: &Config, runner: &dyn Runner, ctl: &ExecCtl) -> Result<()> {
    let outbound = cfg.cloud.is_some() || cfg.notify_hook.is_some();
    let Some(host) = cfg.network_check_host.as_deref() else {
        if outbound {
            log::debug!("no NETWORK_CHECK_HOST configured, skipping probe");
        }
        return Ok(());
    };
    if !outbound {
        return Ok(());
    }

    let cmd = CmdSpec::new("ping")
        .args(["-c", "1", "-W", "2", host])
        .stdout(StdioSpec::Null)
        .stderr(StdioSpec::Null);
    let cap = runner
        .run_capture(&Pipeline::new().cmd(cmd), ctl)
        .context(Fault::Network)?;
    if !cap.ok() {
        return Err(anyhow::anyhow!("host {host} is unreachable").context(Fault::Network));
    }
    log::debug!("network check: {host} reachable");
    Ok(())
}

fn check_runtime() {
    if !nix::unistd::Uid::effective().is_root() {
        log::warn!("not running as root; system files may be unreadable and ownership lost");
    }
}
