use anyhow::{Context, Result};
use serde::Serialize;
use tracing as log;

use crate::utils::cancel::CancelToken;
use crate::utils::process::{CmdSpec, ExecCtl, Pipeline, Runner, StdioSpec};

/// The single terminal event a run emits. Transports (Telegram, email,
/// Gotify, webhooks) live behind the configured hook command; this is
/// only the event shape on that boundary.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalEvent {
    pub status: &'static str,
    pub exit_code: i32,
    pub job_id: String,
    pub hostname: String,
    pub proxmox_type: String,
    pub started_at: String,
    pub finished_at: String,
    pub files_collected: u64,
    pub files_failed: u64,
    pub archive_bytes: u64,
    pub archives: Vec<String>,
    pub tier_errors: Vec<String>,
    pub message: String,
}

/// Pipe the event JSON to the hook command's stdin. Best-effort by
/// contract: every failure is swallowed into a warning.
pub fn send(
    event: &TerminalEvent,
    hook_cmd: Option<&str>,
    runner: &dyn Runner,
    cancel: CancelToken,
) {
    let Some(hook) = hook_cmd else {
        log::debug!("no notification hook configured");
        return;
    };
    if let Err(e) = send_inner(event, hook, runner, cancel) {
        log::warn!("notification hook failed: {e:#}");
    }
}

fn send_inner(
    event: &TerminalEvent,
    hook: &str,
    runner: &dyn Runner,
    cancel: CancelToken,
) -> Result<()> {
    let payload = serde_json::to_vec(event).context("serialize terminal event")?;

    let mut parts = hook.split_whitespace();
    let bin = parts.next().context("empty notification hook command")?;
    let cmd = CmdSpec::new(bin)
        .args(parts)
        .stdin(StdioSpec::Pipe)
        .stdout(StdioSpec::Null)
        .stderr(StdioSpec::Pipe);

    let ctl = ExecCtl::new(cancel, Some(std::time::Duration::from_secs(30)));
    runner
        .run_capture_with_input(&Pipeline::new().cmd(cmd), &ctl, &payload)?
        .require_success("notification hook")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::process::testing::{Scripted, ScriptedRunner};
    use std::sync::Arc;

    fn event() -> TerminalEvent {
        TerminalEvent {
            status: "warning",
            exit_code: 0,
            job_id: "01TEST".into(),
            hostname: "node01".into(),
            proxmox_type: "pve".into(),
            started_at: "2025-03-14T07:00:00Z".into(),
            finished_at: "2025-03-14T07:02:00Z".into(),
            files_collected: 120,
            files_failed: 2,
            archive_bytes: 1024,
            archives: vec!["/b/pve-backup-node01-20250314-070000.tar.zst".into()],
            tier_errors: vec!["cloud: connection refused".into()],
            message: "backup finished with warnings".into(),
        }
    }

    #[test]
    fn event_json_is_fed_to_the_hook_stdin() {
        let runner = Arc::new(ScriptedRunner::new(vec![Scripted::ok("")]));
        send(
            &event(),
            Some("notify-send --backup"),
            runner.as_ref(),
            CancelToken::new(),
        );

        let calls = runner.rendered_calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].starts_with("notify-send --backup"));

        let inputs = runner.inputs.lock().unwrap();
        let payload: serde_json::Value = serde_json::from_slice(&inputs[0]).unwrap();
        assert_eq!(payload["status"], "warning");
        assert_eq!(payload["exitCode"], 0);
        assert_eq!(payload["filesFailed"], 2);
        assert_eq!(payload["archives"][0], event().archives[0]);
    }

    #[test]
    fn hook_failures_are_swallowed() {
        let runner = Arc::new(ScriptedRunner::new(vec![Scripted::fail("boom")]));
        // must not panic or propagate
        send(&event(), Some("broken-hook"), runner.as_ref(), CancelToken::new());
        assert_eq!(runner.rendered_calls().len(), 1);
    }

    #[test]
    fn absent_hook_issues_nothing() {
        let runner = Arc::new(ScriptedRunner::new(vec![]));
        send(&event(), None, runner.as_ref(), CancelToken::new());
        assert!(runner.rendered_calls().is_empty());
    }
}
