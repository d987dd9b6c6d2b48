use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args;
use tracing as log;

use crate::AppCtx;
use crate::errors::{ExitCode, exit_code_for};
use crate::utils::hash;

#[derive(Args, Debug, Clone)]
pub struct DecryptArgs {
    /// Encrypted archive (`*.age`)
    pub archive: Option<PathBuf>,

    /// age identity file
    #[arg(long)]
    pub identity: Option<PathBuf>,

    /// Output path; defaults to the archive name without `.age`
    #[arg(long)]
    pub output: Option<PathBuf>,
}

/// Standalone decrypt verb: produce the plaintext archive next to the
/// ciphertext so it can be inspected or restored elsewhere.
pub fn run(ctx: &AppCtx, args: &DecryptArgs) -> i32 {
    match run_inner(ctx, args) {
        Ok(()) => ExitCode::Success.code(),
        Err(e) => {
            log::error!("decrypt failed: {e:#}");
            if e.downcast_ref::<super::restore::DecryptFailure>().is_some() {
                ExitCode::Security.code()
            } else {
                exit_code_for(&e)
            }
        }
    }
}

fn run_inner(ctx: &AppCtx, args: &DecryptArgs) -> Result<()> {
    let archive = args
        .archive
        .as_ref()
        .context("pass the encrypted archive path")?;
    if !archive.exists() {
        bail!("archive not found: {}", archive.display());
    }
    if archive.extension().is_none_or(|e| e != "age") {
        bail!("{} does not look encrypted (.age)", archive.display());
    }

    let identity = args
        .identity
        .as_ref()
        .context("pass --identity <age key file>")?;
    if !identity.exists() {
        bail!("identity file not found: {}", identity.display());
    }

    let output = match &args.output {
        Some(p) => p.clone(),
        None => archive.with_extension(""),
    };
    if output.exists() {
        bail!("output already exists: {}", output.display());
    }

    ctx.toolbox
        .age()
        .decrypt(identity, archive, &output)
        .map_err(|e| super::restore::DecryptFailure::Error(format!("{e:#}")))?;

    let sha = hash::hash_file(&output)?;
    log::info!("decrypted to {} (sha256 {sha})", output.display());
    Ok(())
}
