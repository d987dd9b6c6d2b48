use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Write as _},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use fs2::FileExt;
use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
use tracing as log;

/// Exclusive per-BASE_DIR job lock. A pidfile created O_CREAT|O_EXCL under
/// `<base>/locks/backup.lock`, flocked for the lifetime of the job and
/// unlinked on every exit path via Drop.
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.path)
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        let _ = fs::remove_file(&self.path);
    }
}

impl LockGuard {
    /// Acquire the job lock. On EEXIST the holder PID is probed; a dead
    /// holder's lock is reaped once its file age exceeds `stale_grace`,
    /// then acquisition is retried exactly once.
    pub fn acquire(
        base_dir: &Path,
        job_id: &str,
        started_at_rfc3339: &str,
        stale_grace: Duration,
    ) -> Result<Self> {
        let path = base_dir.join("locks").join("backup.lock");
        ensure_lock_dir(&path)?;

        match try_create(&path, job_id, started_at_rfc3339)? {
            Some(guard) => Ok(guard),
            None => {
                reap_if_stale(&path, stale_grace)?;
                match try_create(&path, job_id, started_at_rfc3339)? {
                    Some(guard) => Ok(guard),
                    None => bail!(
                        "another backup job holds the lock: {} ({})",
                        path.display(),
                        describe_holder(&path)
                    ),
                }
            }
        }
    }
}

fn try_create(path: &Path, job_id: &str, started_at: &str) -> Result<Option<LockGuard>> {
    let mut opts = OpenOptions::new();
    opts.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o644);
    }
    let mut file = match opts.open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::AlreadyExists => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("create lockfile {}", path.display())),
    };

    file.try_lock_exclusive()
        .with_context(|| format!("flock {}", path.display()))?;

    writeln!(file, "PID={}", std::process::id())
        .and_then(|_| writeln!(file, "STARTED_AT={started_at}"))
        .and_then(|_| writeln!(file, "JOB_ID={job_id}"))
        .with_context(|| format!("write lockfile {}", path.display()))?;
    file.flush()?;

    Ok(Some(LockGuard {
        file,
        path: path.to_path_buf(),
    }))
}

fn reap_if_stale(path: &Path, grace: Duration) -> Result<()> {
    let Some(pid) = holder_pid(path) else {
        // Unreadable or malformed lock: only age can justify removal.
        return reap_by_age_only(path, grace);
    };

    if pid_alive(pid) {
        bail!(
            "backup lock held by running pid {pid}: {}",
            path.display()
        );
    }

    let age = lock_age(path)?;
    if age < grace {
        bail!(
            "lock holder pid {pid} is gone but lock is only {}s old (grace {}s): {}",
            age.as_secs(),
            grace.as_secs(),
            path.display()
        );
    }

    log::warn!(
        "reaping stale lock from dead pid {pid} (age {}s): {}",
        age.as_secs(),
        path.display()
    );
    fs::remove_file(path).with_context(|| format!("remove stale lock {}", path.display()))
}

fn reap_by_age_only(path: &Path, grace: Duration) -> Result<()> {
    let age = lock_age(path)?;
    if age < grace {
        bail!(
            "unreadable lockfile younger than grace period: {}",
            path.display()
        );
    }
    log::warn!("reaping unreadable stale lock: {}", path.display());
    fs::remove_file(path).with_context(|| format!("remove stale lock {}", path.display()))
}

fn lock_age(path: &Path) -> Result<Duration> {
    let meta = fs::metadata(path).with_context(|| format!("stat {}", path.display()))?;
    let mtime = meta.modified().context("lockfile mtime")?;
    Ok(mtime.elapsed().unwrap_or_default())
}

fn holder_pid(path: &Path) -> Option<i32> {
    let content = fs::read_to_string(path).ok()?;
    for line in content.lines() {
        if let Some(v) = line.strip_prefix("PID=") {
            return v.trim().parse().ok();
        }
    }
    None
}

fn describe_holder(path: &Path) -> String {
    match holder_pid(path) {
        Some(pid) => format!("held by pid {pid}"),
        None => "holder unknown".to_string(),
    }
}

fn pid_alive(pid: i32) -> bool {
    // kill -0 semantics: EPERM still means the process exists.
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

fn ensure_lock_dir(path: &Path) -> Result<()> {
    if let Some(dir) = path.parent()
        && !dir.exists()
    {
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            let mut b = fs::DirBuilder::new();
            b.recursive(true)
                .mode(0o755)
                .create(dir)
                .with_context(|| format!("create lock dir {}", dir.display()))?;
        }
        #[cfg(not(unix))]
        {
            fs::create_dir_all(dir)
                .with_context(|| format!("create lock dir {}", dir.display()))?;
        }
    }
    Ok(())
}
