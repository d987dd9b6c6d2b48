use std::io::{BufRead, Write as _};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use tracing as log;

use crate::AppCtx;
use crate::errors::{ExitCode, exit_code_for};

#[derive(Args, Debug, Clone)]
pub struct KeygenArgs {
    /// Where to write the identity; defaults to <BASE_DIR>/env/age.key
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Overwrite an existing key without asking
    #[arg(long)]
    pub force: bool,
}

/// `--newkey`: generate an age identity and register its public key as
/// the archive recipient.
pub fn run(ctx: &AppCtx, args: &KeygenArgs) -> i32 {
    match run_inner(ctx, args) {
        Ok(()) => ExitCode::Success.code(),
        Err(e) => {
            log::error!("key generation failed: {e:#}");
            exit_code_for(&e)
        }
    }
}

fn run_inner(ctx: &AppCtx, args: &KeygenArgs) -> Result<()> {
    let key_file = args
        .key_file
        .clone()
        .unwrap_or_else(|| ctx.cfg.base_dir.join("env").join("age.key"));

    if key_file.exists() && !args.force {
        let answer = prompt(&format!(
            "{} already exists; replacing it makes OLD BACKUPS UNREADABLE. Type 'replace' to continue: ",
            key_file.display()
        ))?;
        if answer.trim() != "replace" {
            log::info!("keeping the existing key");
            return Ok(());
        }
    }

    if let Some(dir) = key_file.parent() {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    if key_file.exists() {
        std::fs::remove_file(&key_file)
            .with_context(|| format!("remove old key {}", key_file.display()))?;
    }

    crate::utils::bins::ensure_bins([crate::tooling::age::KEYGEN_BIN])?;
    let public_key = ctx.toolbox.age().keygen(&key_file)?;

    if confirm("protect the identity file with a passphrase?")? {
        loop {
            let pw = prompt("passphrase (input echoes; blank to skip wrapping): ")?;
            let pw = pw.trim_end_matches(['\r', '\n']);
            if pw.is_empty() {
                log::info!("leaving the identity unwrapped");
                break;
            }
            match validate_passphrase(pw) {
                Ok(()) => {
                    wrap_identity(ctx, &key_file)?;
                    break;
                }
                Err(reason) => log::warn!("{reason}; try again"),
            }
        }
    }

    let recipients = ctx
        .cfg
        .encryption
        .recipients_file
        .clone()
        .unwrap_or_else(|| ctx.cfg.base_dir.join("env").join("age.recipients"));
    std::fs::write(&recipients, format!("{public_key}\n"))
        .with_context(|| format!("write recipients {}", recipients.display()))?;

    log::info!("new identity: {}", key_file.display());
    log::info!("recipient registered: {public_key}");
    log::warn!(
        "store a copy of {} somewhere safe; without it encrypted backups cannot be read",
        key_file.display()
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// passphrase policy, for wrapping the identity with `age -p`

const WEAK_PASSWORDS: &[&str] = &[
    "password",
    "password1",
    "passw0rd",
    "123456789012",
    "qwertyuiop12",
    "proxmox",
    "proxmoxbackup",
    "backup123456",
    "changeme1234",
    "administrator",
];

/// Minimum 12 chars, at least three of {lower, upper, digit,
/// punctuation}, and not a known-weak password.
pub fn validate_passphrase(pw: &str) -> Result<(), &'static str> {
    if pw.chars().count() < 12 {
        return Err("passphrase must be at least 12 characters");
    }
    if WEAK_PASSWORDS.contains(&pw.to_ascii_lowercase().as_str()) {
        return Err("passphrase is on the weak-password list");
    }
    let classes = [
        pw.chars().any(|c| c.is_ascii_lowercase()),
        pw.chars().any(|c| c.is_ascii_uppercase()),
        pw.chars().any(|c| c.is_ascii_digit()),
        pw.chars().any(|c| c.is_ascii_punctuation()),
    ];
    if classes.iter().filter(|b| **b).count() < 3 {
        return Err("passphrase needs three of: lowercase, uppercase, digits, punctuation");
    }
    Ok(())
}

/// `age -p` does the actual wrapping (and asks for the passphrase again
/// on its own terminal); the plaintext key is removed afterwards.
fn wrap_identity(ctx: &AppCtx, key_file: &std::path::Path) -> Result<()> {
    use crate::utils::process::{CmdSpec, Pipeline, StdioSpec};

    let wrapped = key_file.with_extension("key.age");
    let cmd = CmdSpec::new("age")
        .args(["-p", "-o"])
        .arg(wrapped.display().to_string())
        .arg(key_file.display().to_string())
        .stdout(StdioSpec::Inherit)
        .stderr(StdioSpec::Inherit);
    ctx.toolbox
        .runner()
        .run(&Pipeline::new().cmd(cmd), &ctx.toolbox.ctl())
        .context("wrap identity with age -p")?;

    std::fs::remove_file(key_file)
        .with_context(|| format!("remove plaintext key {}", key_file.display()))?;
    log::info!("wrapped identity: {}", wrapped.display());
    Ok(())
}

fn confirm(message: &str) -> Result<bool> {
    let answer = prompt(&format!("{message} [y/N] "))?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

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
