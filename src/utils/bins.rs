use std::{
    env,
    path::{Path, PathBuf},
};

use anyhow::{Result, anyhow};

/// Hard requirements: the job cannot run without these.
pub fn ensure_bins<I, S>(bins: I) -> Result<()>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut missing = Vec::new();
    for b in bins {
        let b = b.as_ref();
        if which(b).is_none() {
            missing.push(b.to_string());
        }
    }
    if missing.is_empty() {
        Ok(())
    } else {
        Err(anyhow!(
            "missing required binaries in PATH: {}",
            missing.join(", ")
        ))
    }
}

/// Optional tools (synthetic-data collectors, codec sidecars). Absence is
/// never fatal; callers skip at DEBUG.
#[inline]
pub fn have_bin(bin: &str) -> bool {
    which(bin).is_some()
}

pub fn which(bin: &str) -> Option<PathBuf> {
    let p = Path::new(bin);
    if p.is_absolute() && is_executable(p) {
        return Some(p.to_path_buf());
    }
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let cand = dir.join(bin);
        if is_executable(&cand) {
            return Some(cand);
        }
    }
    None
}

fn is_executable(p: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(p) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_sh_and_rejects_nonsense() {
        assert!(which("sh").is_some());
        assert!(have_bin("sh"));
        assert!(which("definitely-not-a-binary-7f3a").is_none());
    }

    #[test]
    fn ensure_bins_names_all_missing() {
        let err = ensure_bins(["no-such-tool-a", "no-such-tool-b"])
            .unwrap_err()
            .to_string();
        assert!(err.contains("no-such-tool-a"));
        assert!(err.contains("no-such-tool-b"));
    }
}
