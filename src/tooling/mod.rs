use std::{collections::BTreeSet, sync::Arc, time::Duration};

use anyhow::Result;

use crate::{
    config::Config,
    utils::{
        bins::ensure_bins,
        cancel::CancelToken,
        process::{ExecCtl, Runner},
    },
};

pub mod age;
pub mod cipher;
pub mod codec;
pub mod rclone;

pub use age::{AgeCli, AgePort};
pub use cipher::{CipherPort, OpensslCli};
pub use rclone::{RcloneCli, RclonePort};

type DynRunner = dyn Runner + Send + Sync;

/// Bundle of subprocess ports, built once per invocation from the config.
/// Everything that leaves the process goes through one of these.
pub struct Toolbox {
    runner: Arc<DynRunner>,
    cancel: CancelToken,
    subproc_timeout: Duration,
    term_grace: Duration,
    cipher: Arc<dyn CipherPort>,
    age: Arc<dyn AgePort>,
    rclone: Option<Arc<dyn RclonePort>>,
}

impl Toolbox {
    pub fn new(cfg: &Config, runner: Arc<DynRunner>, cancel: CancelToken) -> Result<Self> {
        ensure_bins_for_cfg(cfg)?;

        let ctl = ExecCtl::new(cancel, Some(cfg.subproc_timeout)).with_grace(cfg.term_grace);
        let cipher: Arc<dyn CipherPort> = Arc::new(OpensslCli::new(runner.clone(), ctl));

        // always constructed: restore/decrypt/keygen need it regardless
        // of whether this host encrypts its own backups
        let age: Arc<dyn AgePort> = Arc::new(AgeCli::new(runner.clone(), ctl));

        let rclone: Option<Arc<dyn RclonePort>> = cfg.cloud.as_ref().map(|cloud| {
            let cloud_ctl =
                ExecCtl::new(cancel, Some(cloud.op_timeout)).with_grace(cfg.term_grace);
            Arc::new(RcloneCli::new(runner.clone(), cloud_ctl, cloud.bin.clone()))
                as Arc<dyn RclonePort>
        });

        Ok(Self {
            runner,
            cancel,
            subproc_timeout: cfg.subproc_timeout,
            term_grace: cfg.term_grace,
            cipher,
            age,
            rclone,
        })
    }

    #[inline]
    pub fn runner(&self) -> Arc<DynRunner> {
        self.runner.clone()
    }

    #[inline]
    pub fn cancel(&self) -> CancelToken {
        self.cancel
    }

    #[inline]
    pub fn ctl(&self) -> ExecCtl {
        ExecCtl::new(self.cancel, Some(self.subproc_timeout)).with_grace(self.term_grace)
    }

    #[inline]
    pub fn cipher(&self) -> Arc<dyn CipherPort> {
        self.cipher.clone()
    }

    #[inline]
    pub fn age(&self) -> Arc<dyn AgePort> {
        self.age.clone()
    }

    #[inline]
    pub fn rclone(&self) -> Option<Arc<dyn RclonePort>> {
        self.rclone.clone()
    }
}

fn ensure_bins_for_cfg(cfg: &Config) -> Result<()> {
    let mut all: BTreeSet<&str> = BTreeSet::new();

    for b in cipher::REQ_BINS {
        all.insert(b);
    }
    if cfg.encryption.enabled {
        for b in age::REQ_BINS {
            all.insert(b);
        }
    }
    if let Some(cloud) = &cfg.cloud {
        all.insert(cloud.bin.as_str());
    }
    if let Some(bin) = cfg.compression.codec.sidecar_bin() {
        all.insert(bin);
    }

    let list: Vec<&str> = all.into_iter().collect();
    ensure_bins(list)
}
