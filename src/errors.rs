use thiserror::Error;

/// Fixed exit-code contract. The integer values are part of the external
/// interface and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    Generic = 1,
    Config = 2,
    Environment = 3,
    Backup = 4,
    Storage = 5,
    Network = 6,
    Permission = 7,
    Verification = 8,
    Collection = 9,
    Archive = 10,
    Compression = 11,
    DiskSpace = 12,
    Panic = 13,
    Security = 14,
}

impl ExitCode {
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Typed failure classes. Attached to `anyhow` chains at the point of
/// failure and downcast once, at the orchestrator boundary, to pick the
/// process exit code.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("configuration error")]
    Config,
    #[error("environment error")]
    Environment,
    #[error("insufficient disk space")]
    DiskSpace,
    #[error("permission denied")]
    Permission,
    #[error("network error")]
    Network,
    #[error("collection error ({failed} file(s) failed)")]
    Collection { failed: u64 },
    #[error("archive pipeline error")]
    Archive,
    #[error("compression error")]
    Compression,
    #[error("verification mismatch")]
    Verification,
    #[error("storage error on tier '{tier}' during {op}")]
    Storage { tier: String, op: &'static str },
    #[error("security error")]
    Security,
    #[error("canceled by signal {signo}")]
    Canceled { signo: i32 },
    #[error("panic in pipeline")]
    Panic,
}

impl Fault {
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Fault::Config => ExitCode::Config,
            Fault::Environment => ExitCode::Environment,
            Fault::DiskSpace => ExitCode::DiskSpace,
            Fault::Permission => ExitCode::Permission,
            Fault::Network => ExitCode::Network,
            Fault::Collection { .. } => ExitCode::Collection,
            Fault::Archive => ExitCode::Archive,
            Fault::Compression => ExitCode::Compression,
            Fault::Verification => ExitCode::Verification,
            Fault::Storage { .. } => ExitCode::Storage,
            Fault::Security => ExitCode::Security,
            // user-canceled runs exit 128 + signo, see exit_code_for()
            Fault::Canceled { .. } => ExitCode::Generic,
            Fault::Panic => ExitCode::Panic,
        }
    }

    pub fn storage(tier: impl Into<String>, op: &'static str) -> Self {
        Fault::Storage {
            tier: tier.into(),
            op,
        }
    }
}

/// Map a failed pipeline result to the process exit code. Walks the anyhow
/// chain for the first `Fault`; unclassified errors are `Generic`.
pub fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(fault) = cause.downcast_ref::<Fault>() {
            if let Fault::Canceled { signo } = fault {
                return 128 + signo;
            }
            return fault.exit_code().code();
        }
    }
    ExitCode::Generic.code()
}

/// Terminal status of a run, as carried by the notification event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Success,
    Warning,
    Failure,
    Aborted,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Success => "success",
            RunStatus::Warning => "warning",
            RunStatus::Failure => "failure",
            RunStatus::Aborted => "aborted",
        }
    }
}
