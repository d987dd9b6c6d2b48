use std::{path::Path, sync::Arc};

use anyhow::{Context, Result, bail};

use crate::utils::process::{Captured, CmdSpec, ExecCtl, Pipeline, Runner, StdioSpec};

type DynRunner = dyn Runner + Send + Sync;

/// One entry of a long listing: `lsl` prints
/// `     size YYYY-MM-DD HH:MM:SS.nnnnnnnnn path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub size: u64,
    pub mtime_epoch: u64,
    pub name: String,
}

/// Cloud object operations, all implemented by shelling out to the
/// configured sync binary. "Directory not found" on the remote is a normal
/// answer, surfaced as `None` so callers can cache the absence.
pub trait RclonePort: Send + Sync {
    fn copyto(&self, src: &Path, remote: &str) -> Result<()>;
    /// Download direction of `copyto`, used by remote verification.
    fn copyto_local(&self, remote: &str, dst: &Path) -> Result<()>;
    fn lsl(&self, remote: &str) -> Result<Option<Vec<RemoteEntry>>>;
    /// Returns whether the file existed. A missing file is a no-op success.
    fn deletefile(&self, remote: &str) -> Result<bool>;
    fn lsf_files(&self, remote: &str) -> Result<Option<Vec<String>>>;
}

pub struct RcloneCli {
    runner: Arc<DynRunner>,
    ctl: ExecCtl,
    bin: String,
}

impl RcloneCli {
    pub fn new(runner: Arc<DynRunner>, ctl: ExecCtl, bin: impl Into<String>) -> Self {
        Self {
            runner,
            ctl,
            bin: bin.into(),
        }
    }

    fn cmd(&self) -> CmdSpec {
        CmdSpec::new(&self.bin)
            .stdout(StdioSpec::Pipe)
            .stderr(StdioSpec::Pipe)
    }
}

fn is_missing_dir(cap: &Captured) -> bool {
    let text = if cap.stderr.is_empty() {
        &cap.stdout
    } else {
        &cap.stderr
    };
    text.to_ascii_lowercase().contains("directory not found")
}

fn is_missing_file(cap: &Captured) -> bool {
    let text = cap.stderr.to_ascii_lowercase();
    text.contains("object not found")
        || text.contains("file not found")
        || text.contains("directory not found")
}

impl RclonePort for RcloneCli {
    fn copyto(&self, src: &Path, remote: &str) -> Result<()> {
        let cmd = CmdSpec::new(&self.bin)
            .args(["copyto", "--progress", "--stats", "10s"])
            .arg(src.display().to_string())
            .arg(remote)
            .stdout(StdioSpec::Inherit)
            .stderr(StdioSpec::Inherit);

        self.runner
            .run(&Pipeline::new().cmd(cmd), &self.ctl)
            .with_context(|| format!("{} copyto {} -> {}", self.bin, src.display(), remote))
    }

    fn copyto_local(&self, remote: &str, dst: &Path) -> Result<()> {
        let cmd = CmdSpec::new(&self.bin)
            .args(["copyto", "--progress", "--stats", "10s"])
            .arg(remote)
            .arg(dst.display().to_string())
            .stdout(StdioSpec::Inherit)
            .stderr(StdioSpec::Inherit);

        self.runner
            .run(&Pipeline::new().cmd(cmd), &self.ctl)
            .with_context(|| format!("{} copyto {remote} -> {}", self.bin, dst.display()))
    }

    fn lsl(&self, remote: &str) -> Result<Option<Vec<RemoteEntry>>> {
        let cmd = self.cmd().arg("lsl").arg(remote);
        let cap = self
            .runner
            .run_capture(&Pipeline::new().cmd(cmd), &self.ctl)
            .with_context(|| format!("{} lsl {remote}", self.bin))?;

        if !cap.ok() {
            if is_missing_dir(&cap) {
                return Ok(None);
            }
            bail!("{} lsl {remote} failed: {}", self.bin, cap.stderr.trim());
        }

        let mut entries = Vec::new();
        for line in cap.stdout.lines() {
            if let Some(e) = parse_lsl_line(line) {
                entries.push(e);
            }
        }
        Ok(Some(entries))
    }

    fn deletefile(&self, remote: &str) -> Result<bool> {
        let cmd = self.cmd().arg("deletefile").arg(remote);
        let cap = self
            .runner
            .run_capture(&Pipeline::new().cmd(cmd), &self.ctl)
            .with_context(|| format!("{} deletefile {remote}", self.bin))?;

        if cap.ok() {
            return Ok(true);
        }
        if is_missing_file(&cap) {
            return Ok(false);
        }
        bail!(
            "{} deletefile {remote} failed: {}",
            self.bin,
            cap.stderr.trim()
        )
    }

    fn lsf_files(&self, remote: &str) -> Result<Option<Vec<String>>> {
        let cmd = self.cmd().args(["lsf", remote, "--files-only"]);
        let cap = self
            .runner
            .run_capture(&Pipeline::new().cmd(cmd), &self.ctl)
            .with_context(|| format!("{} lsf {remote}", self.bin))?;

        if !cap.ok() {
            if is_missing_dir(&cap) {
                return Ok(None);
            }
            bail!("{} lsf {remote} failed: {}", self.bin, cap.stderr.trim());
        }
        Ok(Some(
            cap.stdout
                .lines()
                .map(|l| l.trim().to_string())
                .filter(|l| !l.is_empty())
                .collect(),
        ))
    }
}

fn parse_lsl_line(line: &str) -> Option<RemoteEntry> {
    let mut parts = line.trim_start().splitn(4, ' ');
    let size: u64 = parts.next()?.parse().ok()?;
    let date = parts.next()?;
    let time = parts.next()?;
    let name = parts.next()?.to_string();
    if name.is_empty() {
        return None;
    }

    let secs = time.split('.').next().unwrap_or(time);
    let rfc = format!("{date}T{secs}Z");
    let mtime_epoch = crate::utils::time::parse_rfc3339_to_unix(&rfc).ok()?;

    Some(RemoteEntry {
        size,
        mtime_epoch,
        name,
    })
}
