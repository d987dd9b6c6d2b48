use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt};

mod commands;
mod config;
mod errors;
mod identity;
mod job;
mod manifest;
mod metrics;
mod notify;
mod storage;
mod tooling;
mod ui;
mod utils;

use commands::{backup, decrypt, keygen, restore};
use config::{Config, EnvFile};
use errors::ExitCode;
use tooling::Toolbox;
use utils::cancel::CancelToken;
use utils::process::ProcessRunner;
use utils::{basedir, exec_policy};

pub struct AppCtx {
    pub cfg: Config,
    pub toolbox: Toolbox,
    pub cancel: CancelToken,
    pub dry_run: bool,
}

#[derive(Parser, Debug)]
#[command(
    name = "proxsave",
    about = "Configuration backup engine for Proxmox PVE/PBS hosts",
    version = env!("CARGO_PKG_VERSION")
)]
struct Cli {
    /// Config file; defaults to <BASE_DIR>/env/backup.env
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    debug: bool,

    /// Explicit log level (trace|debug|info|warn|error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Compute and report the plan without mutating anything
    #[arg(long)]
    dry_run: bool,

    // verb flags; at most one may be set
    #[arg(long)]
    restore: bool,
    #[arg(long)]
    decrypt: bool,
    #[arg(long)]
    newkey: bool,
    #[arg(long)]
    install: bool,
    #[arg(long)]
    upgrade_config: bool,
    #[arg(long)]
    upgrade_config_dry_run: bool,
    #[arg(long)]
    env_migration: bool,
    #[arg(long)]
    env_migration_dry_run: bool,

    #[command(flatten)]
    restore_opts: restore::RestoreArgs,

    /// age identity output for --decrypt
    #[arg(long)]
    output: Option<PathBuf>,

    /// key file override for --newkey
    #[arg(long)]
    key_file: Option<PathBuf>,

    /// overwrite without asking (--newkey)
    #[arg(long)]
    force: bool,
}

fn init_tracing(cli: &Cli, config_level: Option<&str>) {
    let default = if cli.debug {
        "trace".to_string()
    } else if let Some(level) = &cli.log_level {
        level.clone()
    } else if let Some(level) = config_level {
        level.to_string()
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(std::io::IsTerminal::is_terminal(&std::io::stderr()))
        .with_writer(std::io::stderr)
        .with_file(cli.debug)
        .with_line_number(cli.debug)
        .try_init();
}

fn main() {
    let cli = Cli::parse();

    let base_dir = basedir::resolve();
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| base_dir.join("env").join("backup.env"));

    // peek LOG_LEVEL before the subscriber is installed
    let env_file = if config_path.exists() {
        EnvFile::load(&config_path).ok()
    } else {
        None
    };
    let peeked_level = env_file
        .as_ref()
        .and_then(|e| e.get("LOG_LEVEL"))
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    init_tracing(&cli, peeked_level.as_deref());

    let verbs = [
        cli.restore,
        cli.decrypt,
        cli.newkey,
        cli.install,
        cli.upgrade_config,
        cli.upgrade_config_dry_run,
        cli.env_migration,
        cli.env_migration_dry_run,
    ];
    if verbs.iter().filter(|v| **v).count() > 1 {
        tracing::error!("mutually exclusive verb flags given");
        std::process::exit(ExitCode::Config.code());
    }

    // verbs that only need the raw env file
    if cli.upgrade_config || cli.upgrade_config_dry_run {
        std::process::exit(upgrade_config(
            &config_path,
            env_file.as_ref(),
            cli.upgrade_config_dry_run,
        ));
    }
    if cli.install || cli.env_migration || cli.env_migration_dry_run {
        tracing::info!(
            "this step is handled by the interactive installer; run the installer script from the release package"
        );
        std::process::exit(ExitCode::Success.code());
    }

    exec_policy::set_dry_run(cli.dry_run);

    let cfg = match load_config(env_file.as_ref(), &config_path, &base_dir) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("{e:#}");
            std::process::exit(errors::exit_code_for(&e));
        }
    };

    let cancel = CancelToken::new();
    if let Err(e) = cancel.install_handlers() {
        tracing::error!("cannot install signal handlers: {e:#}");
        std::process::exit(ExitCode::Environment.code());
    }

    let runner = Arc::new(ProcessRunner::new());
    let toolbox = match Toolbox::new(&cfg, runner, cancel) {
        Ok(t) => t,
        Err(e) => {
            tracing::error!("{e:#}");
            std::process::exit(ExitCode::Environment.code());
        }
    };

    let ctx = AppCtx {
        cfg,
        toolbox,
        cancel,
        dry_run: cli.dry_run,
    };

    let code = if cli.restore {
        restore::run(&ctx, &cli.restore_opts)
    } else if cli.decrypt {
        let args = decrypt::DecryptArgs {
            archive: cli.restore_opts.archive.clone(),
            identity: cli.restore_opts.identity.clone(),
            output: cli.output.clone(),
        };
        decrypt::run(&ctx, &args)
    } else if cli.newkey {
        let args = keygen::KeygenArgs {
            key_file: cli.key_file.clone(),
            force: cli.force,
        };
        keygen::run(&ctx, &args)
    } else {
        backup::run(&ctx)
    };

    std::process::exit(code);
}

fn load_config(env_file: Option<&EnvFile>, path: &PathBuf, base_dir: &PathBuf) -> Result<Config> {
    match env_file {
        Some(env) => Config::from_env(env, base_dir)
            .map_err(|e| e.context(format!("validate config {}", path.display())))
            .map_err(|e| e.context(errors::Fault::Config)),
        None => {
            tracing::warn!(
                "config {} not found, using built-in defaults",
                path.display()
            );
            Config::from_env(&EnvFile::parse(""), base_dir)
                .map_err(|e| e.context(errors::Fault::Config))
        }
    }
}

/// Add missing known keys with their defaults, preserving every existing
/// line, comment and unknown key.
fn upgrade_config(path: &PathBuf, env_file: Option<&EnvFile>, dry_run: bool) -> i32 {
    let empty = EnvFile::parse("");
    let env = env_file.unwrap_or(&empty);

    let missing = env.missing_known_keys();
    if missing.is_empty() {
        tracing::info!("config is complete, nothing to add");
        return ExitCode::Success.code();
    }
    tracing::info!("missing keys: {}", missing.join(", "));

    if dry_run {
        tracing::info!("DRY-RUN: {} key(s) would be appended", missing.len());
        return ExitCode::Success.code();
    }

    let upgraded = env.render_upgraded();
    if path.exists() {
        let backup_path = path.with_extension("env.bak");
        if let Err(e) = std::fs::copy(path, &backup_path) {
            tracing::error!("cannot back up config before rewrite: {e}");
            return ExitCode::Environment.code();
        }
    } else if let Some(dir) = path.parent()
        && let Err(e) = std::fs::create_dir_all(dir)
    {
        tracing::error!("cannot create {}: {e}", dir.display());
        return ExitCode::Environment.code();
    }

    match std::fs::write(path, upgraded) {
        Ok(()) => {
            tracing::info!("config upgraded: {} key(s) appended", missing.len());
            ExitCode::Success.code()
        }
        Err(e) => {
            tracing::error!("cannot rewrite config: {e}");
            ExitCode::Environment.code()
        }
    }
}
