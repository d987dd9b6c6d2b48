use anyhow::{Context, Result, bail};
use std::collections::HashMap;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

use crate::utils::cancel::CancelToken;
use crate::utils::exec_policy;

/// Value for environment variables
#[derive(Clone, Debug)]
pub enum EnvValue {
    Plain(String),
    Secret(String),
}

/// How to configure stdio
#[derive(Clone, Debug)]
pub enum StdioSpec {
    Inherit,
    Null,
    Pipe,
}

/// Command specification
#[derive(Clone, Debug)]
pub struct CmdSpec {
    pub program: String,
    pub args: Vec<String>,
    pub envs: Vec<(String, EnvValue)>,
    pub stdin: StdioSpec,
    pub stdout: StdioSpec,
    pub stderr: StdioSpec,
}

impl CmdSpec {
    pub fn new<S: Into<String>>(program: S) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            stdin: StdioSpec::Inherit,
            stdout: StdioSpec::Inherit,
            stderr: StdioSpec::Inherit,
        }
    }

    pub fn arg(mut self, a: impl Into<String>) -> Self {
        self.args.push(a.into());
        self
    }

    pub fn args<I, S>(mut self, it: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(it.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, k: impl Into<String>, v: EnvValue) -> Self {
        self.envs.push((k.into(), v));
        self
    }

    pub fn stdin(mut self, s: StdioSpec) -> Self {
        self.stdin = s;
        self
    }
    pub fn stdout(mut self, s: StdioSpec) -> Self {
        self.stdout = s;
        self
    }
    pub fn stderr(mut self, s: StdioSpec) -> Self {
        self.stderr = s;
        self
    }

    /// Render this command with redacted secrets
    pub fn render(&self) -> String {
        let prog = sh_quote(&self.program);
        let args: Vec<String> = self.args.iter().map(|a| sh_quote(a)).collect();
        let mut env_prefix = String::new();
        for (k, v) in &self.envs {
            match v {
                EnvValue::Plain(val) => env_prefix.push_str(&format!("{k}={} ", sh_quote(val))),
                EnvValue::Secret(_) => env_prefix.push_str(&format!("{k}=<redacted> ")),
            }
        }
        format!("{}{} {}", env_prefix, prog, args.join(" "))
    }
}

/// A sequence of commands, possibly piped
#[derive(Clone, Debug, Default)]
pub struct Pipeline {
    pub cmds: Vec<CmdSpec>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self { cmds: Vec::new() }
    }

    pub fn cmd(mut self, c: CmdSpec) -> Self {
        self.cmds.push(c);
        self
    }

    /// Base rendering for dry-run/logging
    pub fn render(&self) -> String {
        self.cmds
            .iter()
            .map(|c| c.render())
            .collect::<Vec<_>>()
            .join(" | ")
    }
}

/// Per-invocation execution controls. Every outbound subprocess gets an
/// operation-scoped timeout and honors the root cancellation token; there
/// is no global wall-clock bound on the job.
#[derive(Clone, Copy, Debug)]
pub struct ExecCtl {
    pub cancel: CancelToken,
    pub timeout: Option<Duration>,
    /// How long a child gets to unwind after cancellation before it is
    /// killed.
    pub cancel_grace: Duration,
}

impl ExecCtl {
    pub fn new(cancel: CancelToken, timeout: Option<Duration>) -> Self {
        Self {
            cancel,
            timeout,
            cancel_grace: Duration::ZERO,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn unbounded(cancel: CancelToken) -> Self {
        Self::new(cancel, None)
    }
}

/// Captured result of a finished command. Non-zero exit is data here, not
/// an error: callers like the cloud tier inspect stderr ("directory not
/// found") before deciding what a failure means.
#[derive(Debug)]
pub struct Captured {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl Captured {
    #[inline]
    pub fn ok(&self) -> bool {
        self.status.success()
    }

    pub fn require_success(self, what: &str) -> Result<Captured> {
        if self.ok() {
            Ok(self)
        } else {
            bail!(
                "{} failed with {}: {}",
                what,
                self.status,
                self.stderr.trim()
            )
        }
    }
}

pub trait Runner: Send + Sync {
    /// Run to completion with inherited/derived stdio. Mutating commands go
    /// through here, so dry-run short-circuits with a log line.
    fn run(&self, pipeline: &Pipeline, ctl: &ExecCtl) -> Result<()>;

    /// Run a single command and capture stdout/stderr. Read-only by
    /// convention; executes even under dry-run.
    fn run_capture(&self, pipeline: &Pipeline, ctl: &ExecCtl) -> Result<Captured>;

    /// Like `run_capture`, but feeds `input` to the child's stdin. Used by
    /// the identity cipher and the notification hook.
    fn run_capture_with_input(
        &self,
        pipeline: &Pipeline,
        ctl: &ExecCtl,
        input: &[u8],
    ) -> Result<Captured>;
}

#[derive(Default, Clone)]
pub struct ProcessRunner {
    bin_overrides: HashMap<String, String>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self {
            bin_overrides: HashMap::new(),
        }
    }

    #[allow(dead_code)]
    pub fn with_override(mut self, bin: &str, path: &str) -> Self {
        self.bin_overrides.insert(bin.to_string(), path.to_string());
        self
    }

    fn resolve_bin<'a>(&'a self, bin: &'a str) -> &'a str {
        self.bin_overrides
            .get(bin)
            .map(|s| s.as_str())
            .unwrap_or(bin)
    }

    fn build_command(&self, spec: &CmdSpec) -> Command {
        let mut cmd = Command::new(self.resolve_bin(&spec.program));
        cmd.args(&spec.args);
        for (k, v) in &spec.envs {
            match v {
                EnvValue::Plain(val) => cmd.env(k, val),
                EnvValue::Secret(val) => cmd.env(k, val),
            };
        }
        cmd
    }
}

fn as_stdio(spec: &StdioSpec) -> Stdio {
    match spec {
        StdioSpec::Inherit => Stdio::inherit(),
        StdioSpec::Null => Stdio::null(),
        StdioSpec::Pipe => Stdio::piped(),
    }
}

/// Wait for a set of children, polling so cancellation and the timeout are
/// honored. On either, every still-running child is killed and reaped.
fn wait_all(children: &mut [(String, Child)], ctl: &ExecCtl) -> Result<Vec<ExitStatus>> {
    const TICK: Duration = Duration::from_millis(50);
    let deadline = ctl.timeout.map(|t| Instant::now() + t);
    let mut statuses: Vec<Option<ExitStatus>> = vec![None; children.len()];
    let mut cancel_deadline: Option<Instant> = None;

    loop {
        let mut pending = false;
        for (i, (label, child)) in children.iter_mut().enumerate() {
            if statuses[i].is_some() {
                continue;
            }
            match child.try_wait().with_context(|| format!("wait for {label}"))? {
                Some(st) => statuses[i] = Some(st),
                None => pending = true,
            }
        }
        if !pending {
            // a canceled run still propagates Canceled once the children
            // have unwound
            if cancel_deadline.is_some() {
                return Err(canceled_error(ctl));
            }
            return Ok(statuses.into_iter().flatten().collect());
        }

        if ctl.cancel.is_canceled() {
            // the first observation starts the grace window; children get
            // a chance to unwind before the hard kill
            let hard = *cancel_deadline.get_or_insert_with(|| Instant::now() + ctl.cancel_grace);
            if Instant::now() >= hard {
                kill_remaining(children, &statuses);
                return Err(canceled_error(ctl));
            }
        }
        if let Some(d) = deadline
            && Instant::now() >= d
        {
            kill_remaining(children, &statuses);
            let labels: Vec<&str> = children.iter().map(|(l, _)| l.as_str()).collect();
            bail!("subprocess timed out: {}", labels.join(" | "));
        }
        std::thread::sleep(TICK);
    }
}

fn canceled_error(ctl: &ExecCtl) -> anyhow::Error {
    crate::errors::Fault::Canceled {
        signo: ctl.cancel.signo().unwrap_or(libc::SIGTERM),
    }
    .into()
}

fn kill_remaining(children: &mut [(String, Child)], statuses: &[Option<ExitStatus>]) {
    for (i, (_, child)) in children.iter_mut().enumerate() {
        if statuses[i].is_none() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

impl Runner for ProcessRunner {
    fn run(&self, pipeline: &Pipeline, ctl: &ExecCtl) -> Result<()> {
        if exec_policy::is_dry_run() {
            tracing::info!("DRY-RUN: {}", pipeline.render());
            return Ok(());
        }

        let mut children: Vec<(String, Child)> = Vec::new();
        let mut prev_stdout = None;

        for (i, spec) in pipeline.cmds.iter().enumerate() {
            let mut cmd = self.build_command(spec);

            if i == 0 {
                cmd.stdin(as_stdio(&spec.stdin));
            } else {
                cmd.stdin(prev_stdout.take().unwrap());
            }

            if i == pipeline.cmds.len() - 1 {
                cmd.stdout(as_stdio(&spec.stdout));
            } else {
                cmd.stdout(Stdio::piped());
            }

            cmd.stderr(as_stdio(&spec.stderr));

            let mut child = cmd
                .spawn()
                .with_context(|| format!("spawn {}", spec.render()))?;

            prev_stdout = child.stdout.take().map(Stdio::from);
            children.push((spec.render(), child));
        }

        let statuses = wait_all(&mut children, ctl)?;
        for ((label, _), status) in children.iter().zip(&statuses) {
            if !status.success() {
                bail!("command failed: {label} with {status}");
            }
        }
        Ok(())
    }

    fn run_capture(&self, pipeline: &Pipeline, ctl: &ExecCtl) -> Result<Captured> {
        self.capture_inner(pipeline, ctl, None)
    }

    fn run_capture_with_input(
        &self,
        pipeline: &Pipeline,
        ctl: &ExecCtl,
        input: &[u8],
    ) -> Result<Captured> {
        self.capture_inner(pipeline, ctl, Some(input.to_vec()))
    }
}

impl ProcessRunner {
    fn capture_inner(
        &self,
        pipeline: &Pipeline,
        ctl: &ExecCtl,
        input: Option<Vec<u8>>,
    ) -> Result<Captured> {
        if pipeline.cmds.len() != 1 {
            bail!(
                "capture only works with single command, got {}",
                pipeline.cmds.len()
            );
        }
        let spec = &pipeline.cmds[0];
        let mut cmd = self.build_command(spec);
        cmd.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn {}", spec.render()))?;

        let stdin = child.stdin.take();
        let in_t = input.map(|data| {
            std::thread::spawn(move || {
                use std::io::Write as _;
                if let Some(mut w) = stdin {
                    let _ = w.write_all(&data);
                    // drop closes the pipe so the child sees EOF
                }
            })
        });

        // Drain pipes off-thread so a chatty child cannot deadlock against
        // the polling wait below.
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_t = std::thread::spawn(move || read_to_string_opt(stdout));
        let err_t = std::thread::spawn(move || read_to_string_opt(stderr));

        let mut children = vec![(spec.render(), child)];
        let wait_res = wait_all(&mut children, ctl);

        if let Some(t) = in_t {
            let _ = t.join();
        }
        let stdout = out_t.join().unwrap_or_default();
        let stderr = err_t.join().unwrap_or_default();
        let statuses = wait_res?;

        Ok(Captured {
            status: statuses[0],
            stdout,
            stderr,
        })
    }
}

fn read_to_string_opt<R: std::io::Read>(r: Option<R>) -> String {
    let mut s = String::new();
    if let Some(mut r) = r {
        let _ = r.read_to_string(&mut s);
    }
    s
}

/// Single-quote a word for log and dry-run rendering unless every
/// character is shell-inert. Inside single quotes only `'` needs care:
/// close, emit an escaped quote, reopen.
pub fn sh_quote(s: &str) -> String {
    let inert = |c: char| c.is_ascii_alphanumeric() || "_-./=:@%+,".contains(c);
    if !s.is_empty() && s.chars().all(inert) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// Scripted stand-in for `ProcessRunner`, for units that drive external
/// binaries. Responses are consumed in call order; every invocation is
/// recorded for assertions.
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    pub struct Scripted {
        pub ok: bool,
        pub stdout: String,
        pub stderr: String,
    }

    impl Scripted {
        pub fn ok(stdout: &str) -> Self {
            Self {
                ok: true,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }
        }

        pub fn fail(stderr: &str) -> Self {
            Self {
                ok: false,
                stdout: String::new(),
                stderr: stderr.to_string(),
            }
        }
    }

    #[derive(Default)]
    pub struct ScriptedRunner {
        responses: Mutex<std::collections::VecDeque<Scripted>>,
        pub calls: Mutex<Vec<String>>,
        pub inputs: Mutex<Vec<Vec<u8>>>,
    }

    impl ScriptedRunner {
        pub fn new(responses: Vec<Scripted>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
                inputs: Mutex::new(Vec::new()),
            }
        }

        pub fn rendered_calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn next(&self, pipeline: &Pipeline) -> Result<Captured> {
            self.calls.lock().unwrap().push(pipeline.render());
            let scripted = self
                .responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Scripted {
                    ok: true,
                    stdout: String::new(),
                    stderr: String::new(),
                });
            Ok(Captured {
                status: exit_status(if scripted.ok { 0 } else { 1 }),
                stdout: scripted.stdout,
                stderr: scripted.stderr,
            })
        }
    }

    impl Runner for ScriptedRunner {
        fn run(&self, pipeline: &Pipeline, _ctl: &ExecCtl) -> Result<()> {
            let cap = self.next(pipeline)?;
            if cap.ok() {
                Ok(())
            } else {
                bail!("command failed: {} ({})", pipeline.render(), cap.stderr)
            }
        }

        fn run_capture(&self, pipeline: &Pipeline, _ctl: &ExecCtl) -> Result<Captured> {
            self.next(pipeline)
        }

        fn run_capture_with_input(
            &self,
            pipeline: &Pipeline,
            _ctl: &ExecCtl,
            input: &[u8],
        ) -> Result<Captured> {
            self.inputs.lock().unwrap().push(input.to_vec());
            self.next(pipeline)
        }
    }

    fn exit_status(code: i32) -> ExitStatus {
        use std::os::unix::process::ExitStatusExt;
        ExitStatus::from_raw(code << 8)
    }
}
