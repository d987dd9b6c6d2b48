use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing as log;

use crate::config::Retention;
use crate::errors::Fault;
use crate::storage::{BackupRecord, StorageTier};
use crate::utils::cancel::CancelToken;

/// Why a record survives retention, or that it does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mark {
    /// The record produced by the running job; never deleted.
    Protected,
    Simple,
    Daily,
    Weekly,
    Monthly,
    Yearly,
    Delete,
}

impl Mark {
    pub fn keeps(self) -> bool {
        !matches!(self, Mark::Delete)
    }
}

/// Classify `records` (already sorted newest-first) under `policy`.
/// Returns one mark per input record, index-aligned.
pub fn classify(
    records: &[BackupRecord],
    policy: &Retention,
    protect_path: Option<&str>,
    now: u64,
) -> Vec<Mark> {
    let mut marks: Vec<Option<Mark>> = vec![None; records.len()];

    if let Some(protect) = protect_path {
        for (i, r) in records.iter().enumerate() {
            if r.path == protect {
                marks[i] = Some(Mark::Protected);
            }
        }
    }

    match policy {
        Retention::Simple { max_backups } => {
            let mut kept = marks.iter().filter(|m| m.is_some()).count();
            for (i, mark) in marks.iter_mut().enumerate() {
                if mark.is_some() {
                    continue;
                }
                *mark = if kept < *max_backups && i < *max_backups {
                    kept += 1;
                    Some(Mark::Simple)
                } else {
                    Some(Mark::Delete)
                };
            }
        }
        Retention::Gfs {
            daily,
            weekly,
            monthly,
            yearly,
        } => {
            classify_daily(records, &mut marks, *daily, now);
            select_bucket(records, &mut marks, *weekly as usize, Mark::Weekly, week_key);
            select_bucket(
                records,
                &mut marks,
                *monthly as usize,
                Mark::Monthly,
                month_key,
            );
            select_bucket(records, &mut marks, *yearly as usize, Mark::Yearly, year_key);
        }
    }

    marks
        .into_iter()
        .map(|m| m.unwrap_or(Mark::Delete))
        .collect()
}

/// The newest `daily` records within the `daily`-day window, preferring
/// one per distinct calendar day; when fewer distinct days exist than the
/// quota, the newest remaining in-window records fill it up.
fn classify_daily(records: &[BackupRecord], marks: &mut [Option<Mark>], daily: u32, now: u64) {
    let daily = daily.max(1) as usize;
    let window_start = now.saturating_sub(daily as u64 * 24 * 3600);
    let in_window = |r: &BackupRecord| r.mtime >= window_start && r.mtime <= now;

    let mut kept = 0usize;
    let mut seen_days: HashSet<String> = HashSet::new();

    // protected records cover their day and consume daily quota
    for (i, r) in records.iter().enumerate() {
        if marks[i] == Some(Mark::Protected) && in_window(r) {
            seen_days.insert(day_key(r.mtime));
            kept += 1;
        }
    }

    for (i, r) in records.iter().enumerate() {
        if kept >= daily {
            break;
        }
        if marks[i].is_some() || !in_window(r) {
            continue;
        }
        if seen_days.insert(day_key(r.mtime)) {
            marks[i] = Some(Mark::Daily);
            kept += 1;
        }
    }

    // fill pass: distinct days were fewer than the quota
    for (i, r) in records.iter().enumerate() {
        if kept >= daily {
            break;
        }
        if marks[i].is_some() || !in_window(r) {
            continue;
        }
        marks[i] = Some(Mark::Daily);
        kept += 1;
    }
}

/// One record per calendar bucket, newest wins, buckets already covered by
/// higher-priority marks are skipped without consuming quota.
fn select_bucket(
    records: &[BackupRecord],
    marks: &mut [Option<Mark>],
    keep: usize,
    mark: Mark,
    key_of: fn(u64) -> String,
) {
    if keep == 0 {
        return;
    }

    let mut covered: HashSet<String> = HashSet::new();
    for (i, r) in records.iter().enumerate() {
        if marks[i].is_some_and(|m| m.keeps()) {
            covered.insert(key_of(r.mtime));
        }
    }

    let mut selected: HashSet<String> = HashSet::new();
    for (i, r) in records.iter().enumerate() {
        if marks[i].is_some() {
            continue;
        }
        let key = key_of(r.mtime);
        if covered.contains(&key) || selected.contains(&key) {
            continue;
        }
        if selected.len() >= keep {
            break;
        }
        selected.insert(key);
        marks[i] = Some(mark);
    }
}

fn day_key(ts: u64) -> String {
    match crate::utils::time::to_utc(ts) {
        Ok(dt) => format!("{}/{}", dt.year(), dt.ordinal()),
        Err(_) => format!("?{ts}"),
    }
}

fn week_key(ts: u64) -> String {
    match crate::utils::time::to_utc(ts) {
        Ok(dt) => {
            let (year, week, _) = dt.to_iso_week_date();
            format!("{year}/w{week}")
        }
        Err(_) => format!("?{ts}"),
    }
}

fn month_key(ts: u64) -> String {
    match crate::utils::time::to_utc(ts) {
        Ok(dt) => format!("{}/{}", dt.year(), u8::from(dt.month())),
        Err(_) => format!("?{ts}"),
    }
}

fn year_key(ts: u64) -> String {
    match crate::utils::time::to_utc(ts) {
        Ok(dt) => dt.year().to_string(),
        Err(_) => format!("?{ts}"),
    }
}

/// Outcome counts for the job summary.
#[derive(Debug, Default, Clone, Copy)]
pub struct RetentionOutcome {
    pub kept: usize,
    pub deleted: usize,
}

/// List, classify and delete on one tier. Cloud deletions are throttled
/// by the `batch` parameter.
pub fn run_retention(
    tier: &dyn StorageTier,
    policy: &Retention,
    protect_path: Option<&str>,
    now: u64,
    cancel: &CancelToken,
    batch: Option<(usize, Duration)>,
) -> Result<RetentionOutcome> {
    let records = tier
        .list()
        .with_context(|| format!("list tier '{}'", tier.name()))
        .context(Fault::storage(tier.name().to_string(), "retention"))?;

    let marks = classify(&records, policy, protect_path, now);

    let mut outcome = RetentionOutcome::default();
    let mut since_pause = 0usize;
    for (record, mark) in records.iter().zip(&marks) {
        cancel.check()?;
        if mark.keeps() {
            log::debug!(
                "retention[{}] keep {} ({mark:?})",
                tier.name(),
                record.file_name()
            );
            outcome.kept += 1;
            continue;
        }

        log::info!("retention[{}] delete {}", tier.name(), record.file_name());
        tier.delete(&record.path)
            .context(Fault::storage(tier.name().to_string(), "retention"))?;
        outcome.deleted += 1;
        since_pause += 1;

        if let Some((size, pause)) = batch
            && since_pause >= size
        {
            since_pause = 0;
            cancel.sleep(pause)?;
        }
    }

    log::info!(
        "retention[{}]: kept {}, deleted {}",
        tier.name(),
        outcome.kept,
        outcome.deleted
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: u64 = 3600;
    const DAY: u64 = 24 * HOUR;
    // 2025-03-14T07:00:00Z
    const NOW: u64 = 1_741_935_600;

    fn rec(name: &str, mtime: u64) -> BackupRecord {
        BackupRecord {
            tier: "local",
            path: format!("/b/{name}"),
            size: 1,
            mtime,
            parsed: None,
            manifest: None,
        }
    }

    fn sorted(mut records: Vec<BackupRecord>) -> Vec<BackupRecord> {
        crate::storage::sort_newest_first(&mut records);
        records
    }

    #[test]
    fn simple_keeps_k_newest_including_current() {
        // scenario: five pre-existing archives one hour apart plus the
        // record just produced at now
        let mut records = vec![rec("current.tar", NOW)];
        for i in 0..5u64 {
            records.push(rec(&format!("old-{i}.tar"), NOW - 60 - i * HOUR));
        }
        let records = sorted(records);

        let marks = classify(
            &records,
            &Retention::Simple { max_backups: 3 },
            Some("/b/current.tar"),
            NOW,
        );

        let kept: Vec<&str> = records
            .iter()
            .zip(&marks)
            .filter(|(_, m)| m.keeps())
            .map(|(r, _)| r.file_name())
            .collect();
        assert_eq!(kept, vec!["current.tar", "old-0.tar", "old-1.tar"]);
        assert_eq!(marks.iter().filter(|m| !m.keeps()).count(), 3);
    }

    #[test]
    fn simple_invariant_after_count_is_min_k_n() {
        for k in 1..=6 {
            let records = sorted((0..4u64).map(|i| rec(&format!("r{i}.tar"), NOW - i)).collect());
            let marks = classify(&records, &Retention::Simple { max_backups: k }, None, NOW);
            let kept = marks.iter().filter(|m| m.keeps()).count();
            assert_eq!(kept, k.min(4), "k={k}");
        }
    }

    #[test]
    fn gfs_daily_takes_newest_within_window() {
        // scenario: five records an hour apart, gfs daily=3 and nothing
        // else: three newest are Daily, the rest deleted
        let records = sorted(
            (0..5u64)
                .map(|i| rec(&format!("r{i}.tar"), NOW - i * HOUR))
                .collect(),
        );
        let marks = classify(
            &records,
            &Retention::Gfs {
                daily: 3,
                weekly: 0,
                monthly: 0,
                yearly: 0,
            },
            None,
            NOW,
        );

        assert_eq!(
            marks,
            vec![Mark::Daily, Mark::Daily, Mark::Daily, Mark::Delete, Mark::Delete]
        );
    }

    #[test]
    fn gfs_daily_count_is_min_of_quota_and_candidates() {
        for d in 1..=4u32 {
            let records = sorted(
                (0..3u64)
                    .map(|i| rec(&format!("r{i}.tar"), NOW - i * HOUR))
                    .collect(),
            );
            let marks = classify(
                &records,
                &Retention::Gfs {
                    daily: d,
                    weekly: 0,
                    monthly: 0,
                    yearly: 0,
                },
                None,
                NOW,
            );
            let daily = marks.iter().filter(|m| **m == Mark::Daily).count();
            assert_eq!(daily, (d as usize).min(3), "d={d}");
        }
    }

    #[test]
    fn gfs_prefers_one_per_distinct_day() {
        // two records today, one yesterday; daily=2 keeps newest of each day
        let records = sorted(vec![
            rec("today-late.tar", NOW),
            rec("today-early.tar", NOW - 2 * HOUR),
            rec("yesterday.tar", NOW - DAY),
        ]);
        let marks = classify(
            &records,
            &Retention::Gfs {
                daily: 2,
                weekly: 0,
                monthly: 0,
                yearly: 0,
            },
            None,
            NOW,
        );
        assert_eq!(marks, vec![Mark::Daily, Mark::Delete, Mark::Daily]);
    }

    #[test]
    fn gfs_weekly_picks_newest_per_week_after_daily() {
        let records = sorted(vec![
            rec("d0.tar", NOW),
            rec("w1-new.tar", NOW - 8 * DAY),
            rec("w1-old.tar", NOW - 9 * DAY),
            rec("w2.tar", NOW - 15 * DAY),
            rec("w3.tar", NOW - 22 * DAY),
        ]);
        let marks = classify(
            &records,
            &Retention::Gfs {
                daily: 1,
                weekly: 2,
                monthly: 0,
                yearly: 0,
            },
            None,
            NOW,
        );

        assert_eq!(marks[0], Mark::Daily);
        assert_eq!(marks[1], Mark::Weekly); // newest of its week
        assert_eq!(marks[2], Mark::Delete); // same week, older
        assert_eq!(marks[3], Mark::Weekly);
        assert_eq!(marks[4], Mark::Delete); // weekly quota exhausted
    }

    #[test]
    fn gfs_monthly_and_yearly_strata() {
        let records = sorted(vec![
            rec("d.tar", NOW),
            rec("m1.tar", NOW - 40 * DAY),
            rec("m2.tar", NOW - 70 * DAY),
            rec("y1.tar", NOW - 400 * DAY),
        ]);
        let marks = classify(
            &records,
            &Retention::Gfs {
                daily: 1,
                weekly: 0,
                monthly: 2,
                yearly: 1,
            },
            None,
            NOW,
        );
        assert_eq!(marks[0], Mark::Daily);
        assert_eq!(marks[1], Mark::Monthly);
        assert_eq!(marks[2], Mark::Monthly);
        assert_eq!(marks[3], Mark::Yearly);
    }

    #[test]
    fn current_record_is_never_deleted() {
        let records = sorted(vec![
            rec("current.tar", NOW - 90 * DAY), // would classify Delete
            rec("newer.tar", NOW),
        ]);
        let marks = classify(
            &records,
            &Retention::Simple { max_backups: 1 },
            Some("/b/current.tar"),
            NOW,
        );
        let current_idx = records
            .iter()
            .position(|r| r.file_name() == "current.tar")
            .unwrap();
        assert_eq!(marks[current_idx], Mark::Protected);
    }

    #[test]
    fn equal_mtime_tie_breaks_by_greatest_filename() {
        let records = sorted(vec![rec("aaa.tar", NOW), rec("zzz.tar", NOW)]);
        let marks = classify(&records, &Retention::Simple { max_backups: 1 }, None, NOW);
        let kept: Vec<&str> = records
            .iter()
            .zip(&marks)
            .filter(|(_, m)| m.keeps())
            .map(|(r, _)| r.file_name())
            .collect();
        assert_eq!(kept, vec!["zzz.tar"]);
    }
}
