use std::sync::Arc;

use anyhow::{Context, Result, bail};

use crate::utils::process::{CmdSpec, ExecCtl, Pipeline, Runner, StdioSpec};

pub const REQ_BINS: &[&str] = &["openssl"];

type DynRunner = dyn Runner + Send + Sync;

/// Symmetric cipher for the server-identity envelope. Key and IV are
/// hex-encoded and derived by the caller; the port only moves bytes.
pub trait CipherPort: Send + Sync {
    fn encrypt_b64(&self, key_hex: &str, iv_hex: &str, plaintext: &[u8]) -> Result<String>;
    fn decrypt_b64(&self, key_hex: &str, iv_hex: &str, b64: &str) -> Result<Vec<u8>>;
}

pub struct OpensslCli {
    runner: Arc<DynRunner>,
    ctl: ExecCtl,
}

impl OpensslCli {
    pub fn new(runner: Arc<DynRunner>, ctl: ExecCtl) -> Self {
        Self { runner, ctl }
    }

    fn enc_cmd(&self, key_hex: &str, iv_hex: &str, decrypt: bool) -> CmdSpec {
        let mut cmd = CmdSpec::new("openssl").args(["enc", "-aes-256-cbc"]);
        if decrypt {
            cmd = cmd.arg("-d");
        }
        cmd.args(["-a", "-A", "-K", key_hex, "-iv", iv_hex])
            .stdin(StdioSpec::Pipe)
            .stdout(StdioSpec::Pipe)
            .stderr(StdioSpec::Pipe)
    }
}

impl CipherPort for OpensslCli {
    fn encrypt_b64(&self, key_hex: &str, iv_hex: &str, plaintext: &[u8]) -> Result<String> {
        let cmd = self.enc_cmd(key_hex, iv_hex, false);
        let cap = self
            .runner
            .run_capture_with_input(&Pipeline::new().cmd(cmd), &self.ctl, plaintext)
            .context("run openssl enc")?
            .require_success("openssl enc")?;
        Ok(cap.stdout.trim().to_string())
    }

    fn decrypt_b64(&self, key_hex: &str, iv_hex: &str, b64: &str) -> Result<Vec<u8>> {
        let cmd = self.enc_cmd(key_hex, iv_hex, true);
        let cap = self
            .runner
            .run_capture_with_input(&Pipeline::new().cmd(cmd), &self.ctl, b64.as_bytes())
            .context("run openssl enc -d")?;
        if !cap.ok() {
            // wrong key produces "bad decrypt" here
            bail!("openssl decrypt failed: {}", cap.stderr.trim());
        }
        Ok(cap.stdout.into_bytes())
    }
}
