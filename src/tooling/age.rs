use std::{path::Path, sync::Arc};

use anyhow::{Context, Result, bail};

use crate::utils::process::{CmdSpec, ExecCtl, Pipeline, Runner, StdioSpec};

pub const REQ_BINS: &[&str] = &["age"];
pub const KEYGEN_BIN: &str = "age-keygen";

type DynRunner = dyn Runner + Send + Sync;

/// Recipient-based stream encryption for finished archives.
pub trait AgePort: Send + Sync {
    fn encrypt(&self, recipients_file: &Path, src: &Path, dst: &Path) -> Result<()>;
    fn decrypt(&self, identity_file: &Path, src: &Path, dst: &Path) -> Result<()>;
    /// Generates a new identity at `out`; returns the public key line.
    fn keygen(&self, out: &Path) -> Result<String>;
}

pub struct AgeCli {
    runner: Arc<DynRunner>,
    ctl: ExecCtl,
}

impl AgeCli {
    pub fn new(runner: Arc<DynRunner>, ctl: ExecCtl) -> Self {
        Self { runner, ctl }
    }
}

impl AgePort for AgeCli {
    fn encrypt(&self, recipients_file: &Path, src: &Path, dst: &Path) -> Result<()> {
        let cmd = CmdSpec::new("age")
            .args(["--encrypt", "-R"])
            .arg(recipients_file.display().to_string())
            .arg("-o")
            .arg(dst.display().to_string())
            .arg(src.display().to_string())
            .stdout(StdioSpec::Null)
            .stderr(StdioSpec::Inherit);

        self.runner
            .run(&Pipeline::new().cmd(cmd), &self.ctl)
            .with_context(|| format!("age encrypt {}", src.display()))
    }

    fn decrypt(&self, identity_file: &Path, src: &Path, dst: &Path) -> Result<()> {
        let cmd = CmdSpec::new("age")
            .args(["--decrypt", "-i"])
            .arg(identity_file.display().to_string())
            .arg("-o")
            .arg(dst.display().to_string())
            .arg(src.display().to_string())
            .stdout(StdioSpec::Null)
            .stderr(StdioSpec::Pipe);

        // run_capture so the identity error text is available to classify
        let cap = self
            .runner
            .run_capture(&Pipeline::new().cmd(cmd), &self.ctl)
            .with_context(|| format!("age decrypt {}", src.display()))?;
        if !cap.ok() {
            bail!("age decrypt failed: {}", cap.stderr.trim());
        }
        Ok(())
    }

    fn keygen(&self, out: &Path) -> Result<String> {
        let cmd = CmdSpec::new(KEYGEN_BIN)
            .arg("-o")
            .arg(out.display().to_string())
            .stdout(StdioSpec::Pipe)
            .stderr(StdioSpec::Pipe);

        let cap = self
            .runner
            .run_capture(&Pipeline::new().cmd(cmd), &self.ctl)
            .context("run age-keygen")?
            .require_success("age-keygen")?;

        // age-keygen prints "Public key: age1..." on stderr
        for line in cap.stderr.lines().chain(cap.stdout.lines()) {
            if let Some(pk) = line.trim().strip_prefix("Public key:") {
                return Ok(pk.trim().to_string());
            }
        }
        bail!("age-keygen produced no public key line")
    }
}
