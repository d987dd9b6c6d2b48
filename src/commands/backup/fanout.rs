use std::time::Duration;

use anyhow::{Context, Result};
use tracing as log;

use super::retention::{self, RetentionOutcome};
use crate::config::{Config, Retention};
use crate::errors::Fault;
use crate::storage::{BackupSet, CloudTier, LocalTier, StorageTier};
use crate::tooling::Toolbox;
use crate::utils::cancel::CancelToken;

/// One participating tier with its retention policy and optional delete
/// throttling.
pub struct TierSetup {
    pub tier: Box<dyn StorageTier>,
    pub retention: Retention,
    pub batch: Option<(usize, Duration)>,
}

/// Build the enabled tiers in fan-out order: local is always first and
/// always primary.
pub fn build_tiers(cfg: &Config, toolbox: &Toolbox) -> Vec<TierSetup> {
    let mut tiers = vec![TierSetup {
        tier: Box::new(LocalTier::new("local", cfg.backup_path.clone()))
            as Box<dyn StorageTier>,
        retention: cfg.local_retention.clone(),
        batch: None,
    }];

    if let Some(secondary) = &cfg.secondary {
        tiers.push(TierSetup {
            tier: Box::new(LocalTier::new("secondary", secondary.path.clone())),
            retention: secondary.retention.clone(),
            batch: None,
        });
    }

    if let Some(cloud) = &cfg.cloud
        && let Some(rclone) = toolbox.rclone()
    {
        tiers.push(TierSetup {
            tier: Box::new(CloudTier::new(cloud.clone(), rclone, toolbox.cancel())),
            retention: cloud.retention.clone(),
            batch: Some((cloud.batch_size, cloud.batch_pause)),
        });
    }

    tiers
}

/// Per-tier result of the fan-out or retention pass.
#[derive(Debug)]
pub struct TierResult {
    pub tier: &'static str,
    pub error: Option<String>,
}

impl TierResult {
    pub fn ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Primary first, then the remaining tiers in parallel, each independent.
/// A primary failure is pipeline-fatal; any other tier failing downgrades
/// the run to a warning.
pub fn fan_out(
    tiers: &[TierSetup],
    set: &BackupSet,
    cancel: &CancelToken,
) -> Result<Vec<TierResult>> {
    let (primary, rest) = tiers
        .split_first()
        .context("no storage tiers configured")?;

    cancel.check()?;
    primary
        .tier
        .store(set)
        .with_context(|| format!("store on primary tier '{}'", primary.tier.name()))
        .context(Fault::storage(primary.tier.name().to_string(), "store"))?;
    log::info!("primary tier '{}' stored {}", primary.tier.name(), set.archive_name());

    let mut results = vec![TierResult {
        tier: primary.tier.name(),
        error: None,
    }];

    let secondary_results: Vec<TierResult> = std::thread::scope(|scope| {
        let handles: Vec<_> = rest
            .iter()
            .map(|setup| {
                scope.spawn(move || {
                    let name = setup.tier.name();
                    match cancel.check().and_then(|_| setup.tier.store(set)) {
                        Ok(()) => {
                            log::info!("tier '{name}' stored {}", set.archive_name());
                            TierResult {
                                tier: name,
                                error: None,
                            }
                        }
                        Err(e) => {
                            log::error!("tier '{name}' store failed: {e:#}");
                            TierResult {
                                tier: name,
                                error: Some(format!("{e:#}")),
                            }
                        }
                    }
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or(TierResult {
                    tier: "unknown",
                    error: Some("tier thread panicked".to_string()),
                })
            })
            .collect()
    });

    results.extend(secondary_results);
    Ok(results)
}

/// Retention runs after fan-out completes, per tier, in parallel.
/// Failures are tier-local warnings.
pub fn run_retention_all(
    tiers: &[TierSetup],
    stored_names: &[(&'static str, String)],
    now: u64,
    cancel: &CancelToken,
) -> Vec<(TierResult, RetentionOutcome)> {
    std::thread::scope(|scope| {
        let handles: Vec<_> = tiers
            .iter()
            .map(|setup| {
                scope.spawn(move || {
                    let name = setup.tier.name();
                    let protect = stored_names
                        .iter()
                        .find(|(tier, _)| *tier == name)
                        .map(|(_, path)| path.as_str());
                    match retention::run_retention(
                        setup.tier.as_ref(),
                        &setup.retention,
                        protect,
                        now,
                        cancel,
                        setup.batch,
                    ) {
                        Ok(outcome) => (
                            TierResult {
                                tier: name,
                                error: None,
                            },
                            outcome,
                        ),
                        Err(e) => {
                            log::error!("retention on tier '{name}' failed: {e:#}");
                            (
                                TierResult {
                                    tier: name,
                                    error: Some(format!("{e:#}")),
                                },
                                RetentionOutcome::default(),
                            )
                        }
                    }
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join().unwrap_or((
                    TierResult {
                        tier: "unknown",
                        error: Some("retention thread panicked".to_string()),
                    },
                    RetentionOutcome::default(),
                ))
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{BackupRecord, FsInfo, Layout, TierStats};
    use std::path::PathBuf;

    struct FakeTier {
        name: &'static str,
        fail_store: bool,
    }

    impl FakeTier {
        fn new(name: &'static str, fail_store: bool) -> Self {
            Self { name, fail_store }
        }
    }

    impl StorageTier for FakeTier {
        fn name(&self) -> &'static str {
            self.name
        }
        fn is_enabled(&self) -> bool {
            true
        }
        fn detect_filesystem(&self) -> FsInfo {
            FsInfo {
                fs_type: "fake".into(),
                mount_point: PathBuf::from("/"),
                supports_ownership: true,
                is_network: false,
            }
        }
        fn store(&self, _set: &BackupSet) -> Result<()> {
            if self.fail_store {
                anyhow::bail!("simulated store failure");
            }
            Ok(())
        }
        fn list(&self) -> Result<Vec<BackupRecord>> {
            Ok(vec![])
        }
        fn delete(&self, _path: &str) -> Result<()> {
            Ok(())
        }
        fn get_stats(&self) -> Result<TierStats> {
            Ok(TierStats::default())
        }
        fn verify(&self, _path: &str) -> Result<bool> {
            Ok(true)
        }
    }

    fn setup(tier: FakeTier) -> TierSetup {
        TierSetup {
            tier: Box::new(tier),
            retention: Retention::Simple { max_backups: 5 },
            batch: None,
        }
    }

    fn set() -> BackupSet {
        BackupSet {
            archive: PathBuf::from("/b/pve-backup-n-20250314-070000.tar"),
            layout: Layout::Bundle,
        }
    }

    #[test]
    fn primary_failure_is_fatal() {
        let tiers = vec![
            setup(FakeTier::new("local", true)),
            setup(FakeTier::new("cloud", false)),
        ];
        let err = fan_out(&tiers, &set(), &CancelToken::new()).unwrap_err();
        assert_eq!(crate::errors::exit_code_for(&err), 5);
    }

    #[test]
    fn secondary_failure_does_not_cancel_cloud() {
        let tiers = vec![
            setup(FakeTier::new("local", false)),
            setup(FakeTier::new("secondary", true)),
            setup(FakeTier::new("cloud", false)),
        ];
        let results = fan_out(&tiers, &set(), &CancelToken::new()).unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().find(|r| r.tier == "local").unwrap().ok());
        assert!(!results.iter().find(|r| r.tier == "secondary").unwrap().ok());
        assert!(results.iter().find(|r| r.tier == "cloud").unwrap().ok());
    }

    #[test]
    fn retention_runs_on_every_tier_independently() {
        let tiers = vec![
            setup(FakeTier::new("local", false)),
            setup(FakeTier::new("cloud", false)),
        ];
        let results = run_retention_all(
            &tiers,
            &[("local", "/b/x.tar".to_string()), ("cloud", "x.tar".to_string())],
            1_741_935_600,
            &CancelToken::new(),
        );
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(r, _)| r.ok()));
    }
}
