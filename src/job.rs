use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;

use crate::config::ProxmoxTypeSetting;
use crate::utils::process::{CmdSpec, ExecCtl, Pipeline, Runner, StdioSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxmoxType {
    Pve,
    Pbs,
    Unknown,
}

impl ProxmoxType {
    pub fn wire_name(self) -> &'static str {
        match self {
            ProxmoxType::Pve => "pve",
            ProxmoxType::Pbs => "pbs",
            ProxmoxType::Unknown => "unknown",
        }
    }

    pub fn from_wire(s: &str) -> Self {
        match s {
            "pve" => ProxmoxType::Pve,
            "pbs" => ProxmoxType::Pbs,
            _ => ProxmoxType::Unknown,
        }
    }
}

/// Resolve the configured type; `auto` probes the filesystem markers.
pub fn resolve_proxmox_type(setting: ProxmoxTypeSetting) -> ProxmoxType {
    match setting {
        ProxmoxTypeSetting::Pve => ProxmoxType::Pve,
        ProxmoxTypeSetting::Pbs => ProxmoxType::Pbs,
        ProxmoxTypeSetting::Unknown => ProxmoxType::Unknown,
        ProxmoxTypeSetting::Auto => {
            if std::path::Path::new("/etc/pve").is_dir() {
                ProxmoxType::Pve
            } else if std::path::Path::new("/etc/proxmox-backup").is_dir() {
                ProxmoxType::Pbs
            } else {
                ProxmoxType::Unknown
            }
        }
    }
}

/// Best-effort version probe; never fails the run.
pub fn probe_proxmox_version(
    kind: ProxmoxType,
    runner: &dyn Runner,
    ctl: &ExecCtl,
) -> String {
    let cmd = match kind {
        ProxmoxType::Pve => CmdSpec::new("pveversion"),
        ProxmoxType::Pbs => CmdSpec::new("proxmox-backup-manager").arg("version"),
        ProxmoxType::Unknown => return "unknown".to_string(),
    }
    .stdout(StdioSpec::Pipe)
    .stderr(StdioSpec::Null);

    match runner.run_capture(&Pipeline::new().cmd(cmd), ctl) {
        Ok(cap) if cap.ok() => cap
            .stdout
            .lines()
            .next()
            .unwrap_or("unknown")
            .trim()
            .to_string(),
        _ => "unknown".to_string(),
    }
}

/// FQDN when available, short name otherwise, literal `unknown` as the
/// last resort.
pub fn detect_hostname(runner: &dyn Runner, ctl: &ExecCtl) -> String {
    let cmd = CmdSpec::new("hostname")
        .arg("-f")
        .stdout(StdioSpec::Pipe)
        .stderr(StdioSpec::Null);
    if let Ok(cap) = runner.run_capture(&Pipeline::new().cmd(cmd), ctl)
        && cap.ok()
    {
        let fqdn = cap.stdout.trim();
        if !fqdn.is_empty() && fqdn != "localhost" {
            return fqdn.to_string();
        }
    }

    match nix::unistd::gethostname() {
        Ok(name) => {
            let s = name.to_string_lossy().trim().to_string();
            if s.is_empty() { "unknown".to_string() } else { s }
        }
        Err(_) => "unknown".to_string(),
    }
}

// ---------------------------------------------------------------------------
// job id

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
static JOB_SEQ: AtomicU64 = AtomicU64::new(0);

/// ULID-like identifier: 10 chars of millisecond timestamp, 16 chars
/// derived from process-local entropy. Monotonic within a process via the
/// sequence counter.
pub fn new_job_id() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let ms = now.as_millis() as u64;
    let seq = JOB_SEQ.fetch_add(1, Ordering::Relaxed);

    let mut id = String::with_capacity(26);
    // 48-bit timestamp, most significant first
    for shift in (0..10).rev() {
        let idx = ((ms >> (shift * 5)) & 0x1f) as usize;
        id.push(CROCKFORD[idx] as char);
    }

    let entropy = crate::utils::hash::hash_bytes(
        format!("{}:{}:{}:{}", std::process::id(), ms, now.subsec_nanos(), seq).as_bytes(),
    );
    for c in entropy.bytes().take(16) {
        let idx = (c as usize) % 32;
        id.push(CROCKFORD[idx] as char);
    }
    id
}

// ---------------------------------------------------------------------------
// job state

/// Race-free run counters, updated from the collector walk and the
/// fan-out threads.
#[derive(Debug, Default)]
pub struct Counters {
    pub files_collected: AtomicU64,
    pub files_failed: AtomicU64,
    pub dirs_created: AtomicU64,
    pub bytes_staged: AtomicU64,
}

impl Counters {
    #[inline]
    pub fn add_file(&self, bytes: u64) {
        self.files_collected.fetch_add(1, Ordering::Relaxed);
        self.bytes_staged.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_failure(&self) {
        self.files_failed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_dir(&self) {
        self.dirs_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            files_collected: self.files_collected.load(Ordering::Relaxed),
            files_failed: self.files_failed.load(Ordering::Relaxed),
            dirs_created: self.dirs_created.load(Ordering::Relaxed),
            bytes_staged: self.bytes_staged.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSnapshot {
    pub files_collected: u64,
    pub files_failed: u64,
    pub dirs_created: u64,
    pub bytes_staged: u64,
}

/// Everything a run knows about itself. Created at invocation, dropped at
/// exit; phases receive it immutably and report through `counters`.
#[derive(Debug)]
pub struct BackupJob {
    pub job_id: String,
    pub started_at: u64,
    pub proxmox_type: ProxmoxType,
    pub proxmox_version: String,
    pub hostname: String,
    pub server_id: String,
    pub dry_run: bool,
    pub counters: Counters,
}

impl BackupJob {
    pub fn started_at_rfc3339(&self) -> Result<String> {
        crate::utils::time::fmt_utc(self.started_at)
    }

    pub fn started_at_compact(&self) -> Result<String> {
        crate::utils::time::fmt_compact(self.started_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_ids_are_unique_sorted_and_well_formed() {
        let a = new_job_id();
        let b = new_job_id();
        assert_eq!(a.len(), 26);
        assert_eq!(b.len(), 26);
        assert_ne!(a, b);
        for c in a.bytes() {
            assert!(CROCKFORD.contains(&c), "bad char {}", c as char);
        }
        // same millisecond or later: timestamp prefix never decreases
        assert!(b[..10] >= a[..10]);
    }

    #[test]
    fn counters_aggregate_across_threads() {
        let counters = Counters::default();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..100 {
                        counters.add_file(10);
                    }
                    counters.add_failure();
                });
            }
        });
        let snap = counters.snapshot();
        assert_eq!(snap.files_collected, 800);
        assert_eq!(snap.bytes_staged, 8000);
        assert_eq!(snap.files_failed, 8);
    }

    #[test]
    fn wire_names_roundtrip() {
        for t in [ProxmoxType::Pve, ProxmoxType::Pbs, ProxmoxType::Unknown] {
            assert_eq!(ProxmoxType::from_wire(t.wire_name()), t);
        }
        assert_eq!(ProxmoxType::from_wire("weird"), ProxmoxType::Unknown);
    }
}
