pub mod bins;
pub mod cancel;
pub mod exec_policy;
pub mod fsmeta;
pub mod hash;
pub mod lock;
pub mod process;
pub mod staging;

pub mod time {
    use anyhow::{Context, Result, anyhow};
    use time::{OffsetDateTime, UtcOffset, format_description::well_known::Rfc3339};

    #[inline]
    pub fn current_epoch() -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    pub fn fmt_utc(ts: u64) -> Result<String> {
        let dt = to_utc(ts)?;
        Ok(dt.format(&Rfc3339)?) // "YYYY-MM-DDTHH:MM:SSZ"
    }

    pub fn parse_rfc3339_to_unix(s: &str) -> Result<u64> {
        let dt = OffsetDateTime::parse(s, &Rfc3339)
            .with_context(|| format!("invalid RFC3339 datetime: {s}"))?
            .to_offset(UtcOffset::UTC);

        let ts = dt.unix_timestamp();
        u64::try_from(ts).map_err(|_| anyhow!("timestamp is negative: {}", ts))
    }

    /// Archive-name timestamp: "YYYYMMDD-HHMMSS" in UTC.
    pub fn fmt_compact(ts: u64) -> Result<String> {
        let dt = to_utc(ts)?;
        Ok(format!(
            "{:04}{:02}{:02}-{:02}{:02}{:02}",
            dt.year(),
            u8::from(dt.month()),
            dt.day(),
            dt.hour(),
            dt.minute(),
            dt.second()
        ))
    }

    pub fn parse_compact(s: &str) -> Result<u64> {
        let bad = || anyhow!("invalid compact timestamp: {s}");
        if s.len() != 15 || s.as_bytes()[8] != b'-' {
            return Err(bad());
        }
        let num = |r: std::ops::Range<usize>| -> Result<u32> {
            s[r].parse::<u32>().map_err(|_| bad())
        };
        let year = num(0..4)? as i32;
        let month = time::Month::try_from(num(4..6)? as u8).map_err(|_| bad())?;
        let date = time::Date::from_calendar_date(year, month, num(6..8)? as u8)
            .map_err(|_| bad())?;
        let t = time::Time::from_hms(num(9..11)? as u8, num(11..13)? as u8, num(13..15)? as u8)
            .map_err(|_| bad())?;
        let ts = date.with_time(t).assume_utc().unix_timestamp();
        u64::try_from(ts).map_err(|_| bad())
    }

    pub fn to_utc(ts: u64) -> Result<OffsetDateTime> {
        let ts = i64::try_from(ts).map_err(|_| anyhow!("unix timestamp doesn't fit into i64"))?;
        Ok(OffsetDateTime::from_unix_timestamp(ts)?)
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn epoch_nonzero() {
            assert!(current_epoch() > 1_600_000_000);
        }

        #[test]
        fn compact_roundtrip() {
            // 2025-03-14T07:00:00Z
            let ts = parse_rfc3339_to_unix("2025-03-14T07:00:00Z").unwrap();
            let compact = fmt_compact(ts).unwrap();
            assert_eq!(compact, "20250314-070000");
            assert_eq!(parse_compact(&compact).unwrap(), ts);
        }

        #[test]
        fn compact_rejects_garbage() {
            assert!(parse_compact("20250314070000").is_err());
            assert!(parse_compact("2025031x-070000").is_err());
            assert!(parse_compact("20251301-070000").is_err());
        }
    }
}

pub mod retry {
    use std::time::Duration;

    use anyhow::Result;
    use tracing as log;

    use crate::utils::cancel::CancelToken;

    /// Exponential backoff schedule, capped. Shared by the cloud tier and
    /// any other retriable subprocess call.
    #[derive(Debug, Clone, Copy)]
    pub struct Backoff {
        pub attempts: u32,
        pub base: Duration,
        pub cap: Duration,
    }

    impl Backoff {
        pub fn new(attempts: u32, base: Duration, cap: Duration) -> Self {
            Self {
                attempts: attempts.max(1),
                base,
                cap,
            }
        }

        fn delay(&self, attempt: u32) -> Duration {
            let factor = 1u32 << attempt.min(16);
            (self.base * factor).min(self.cap)
        }
    }

    pub fn with_backoff<T>(
        what: &str,
        cancel: &CancelToken,
        policy: &Backoff,
        mut f: impl FnMut() -> Result<T>,
    ) -> Result<T> {
        let mut last_err = None;
        for attempt in 0..policy.attempts {
            cancel.check()?;
            match f() {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt + 1 < policy.attempts {
                        let delay = policy.delay(attempt);
                        log::warn!(
                            "{what} failed (attempt {}/{}), retrying in {:?}: {e:#}",
                            attempt + 1,
                            policy.attempts,
                            delay
                        );
                        cancel.sleep(delay)?;
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("{what}: no attempts made")))
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use anyhow::bail;

        #[test]
        fn succeeds_after_transient_failures() {
            let policy = Backoff::new(4, Duration::from_millis(1), Duration::from_millis(4));
            let mut calls = 0;
            let out = with_backoff("op", &CancelToken::new(), &policy, || {
                calls += 1;
                if calls < 3 {
                    bail!("transient")
                }
                Ok(calls)
            })
            .unwrap();
            assert_eq!(out, 3);
        }

        #[test]
        fn exhausts_attempts_and_keeps_last_error() {
            let policy = Backoff::new(2, Duration::from_millis(1), Duration::from_millis(1));
            let mut calls = 0;
            let err = with_backoff("op", &CancelToken::new(), &policy, || -> Result<()> {
                calls += 1;
                bail!("always broken")
            })
            .unwrap_err();
            assert_eq!(calls, 2);
            assert!(err.to_string().contains("always broken"));
        }

        #[test]
        fn delay_is_capped() {
            let policy = Backoff::new(10, Duration::from_secs(1), Duration::from_secs(8));
            assert_eq!(policy.delay(0), Duration::from_secs(1));
            assert_eq!(policy.delay(2), Duration::from_secs(4));
            assert_eq!(policy.delay(6), Duration::from_secs(8));
        }
    }
}

pub mod basedir {
    use std::path::{Path, PathBuf};

    pub const FALLBACK: &str = "/opt/proxmox-backup";

    /// Install root resolution: `BASE_DIR` env wins; otherwise walk up from
    /// the executable to the first directory containing `env/` or
    /// `script/`; otherwise the packaged default.
    pub fn resolve() -> PathBuf {
        if let Some(dir) = std::env::var_os("BASE_DIR") {
            return PathBuf::from(dir);
        }
        if let Ok(exe) = std::env::current_exe()
            && let Some(found) = walk_up(&exe)
        {
            return found;
        }
        PathBuf::from(FALLBACK)
    }

    fn walk_up(start: &Path) -> Option<PathBuf> {
        let mut cur = start.parent();
        while let Some(dir) = cur {
            if dir.join("env").is_dir() || dir.join("script").is_dir() {
                return Some(dir.to_path_buf());
            }
            cur = dir.parent();
        }
        None
    }

}
