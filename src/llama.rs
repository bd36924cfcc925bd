//! Lifecycle of the external llama-server process.
//!
//! The child is spawned into its own process group so a graceful stop can
//! signal the whole tree: SIGINT first, then SIGTERM, then SIGKILL, each
//! phase bounded by its own timeout.

use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Substrings of child output that mean the HTTP interface is up. Matched
/// case-insensitively; a configured `ready_text` is checked alongside.
pub const READY_MARKERS: &[&str] = &[
    "http server is listening",
    "server is listening",
    "listening on",
    "starting http server",
    "starting the main loop",
    "all slots are idle",
];

#[derive(Debug, Clone)]
pub struct LlamaServerConfig {
    pub binary: PathBuf,
    pub model: PathBuf,
    pub port: u16,
    pub threads: Option<u32>,
    pub parallel: Option<u32>,
    pub context: Option<u32>,
    pub batch: Option<u32>,
    pub mlock: bool,
    pub embeddings: bool,
    pub extra_args: Vec<String>,
    pub ready_text: Option<String>,
}

impl LlamaServerConfig {
    pub fn new(binary: impl Into<PathBuf>, model: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            model: model.into(),
            port: 8080,
            threads: None,
            parallel: None,
            context: None,
            batch: None,
            mlock: false,
            embeddings: false,
            extra_args: Vec::new(),
            ready_text: None,
        }
    }

    /// Argument list passed to the binary.
    pub fn command_args(&self) -> Vec<String> {
        let mut args = vec![
            "-m".to_string(),
            self.model.display().to_string(),
            "--port".to_string(),
            self.port.to_string(),
        ];
        if let Some(threads) = self.threads {
            args.push("-t".into());
            args.push(threads.to_string());
        }
        if let Some(parallel) = self.parallel {
            args.push("--parallel".into());
            args.push(parallel.to_string());
        }
        if let Some(context) = self.context {
            args.push("-c".into());
            args.push(context.to_string());
        }
        if let Some(batch) = self.batch {
            args.push("-b".into());
            args.push(batch.to_string());
        }
        if self.mlock {
            args.push("--mlock".into());
        }
        if self.embeddings {
            args.push("--embeddings".into());
        }
        args.extend(self.extra_args.iter().cloned());
        args
    }
}

/// Errors callers must be able to tell apart.
#[derive(Debug)]
pub enum LlamaServerError {
    NotStarted,
    ProcessExited(Option<i32>),
}

impl fmt::Display for LlamaServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "llama-server was never started"),
            Self::ProcessExited(code) => {
                write!(f, "llama-server exited before becoming ready (code {code:?})")
            }
        }
    }
}

impl std::error::Error for LlamaServerError {}

struct ProcessState {
    child: Option<Child>,
    pgid: Option<i32>,
    readers: Vec<JoinHandle<()>>,
}

/// Supervisor owning the llama-server child process.
pub struct LlamaServer {
    cfg: LlamaServerConfig,
    http: reqwest::Client,
    ready_tx: watch::Sender<bool>,
    state: Mutex<ProcessState>,
    exit_code: std::sync::Mutex<Option<i32>>,
}

impl LlamaServer {
    /// Validates the binary and model paths up front.
    pub fn new(cfg: LlamaServerConfig) -> Result<Self> {
        if !cfg.binary.exists() {
            bail!("llama_binary not found: {}", cfg.binary.display());
        }
        if !cfg.model.exists() {
            bail!("model_path not found: {}", cfg.model.display());
        }
        let (ready_tx, _) = watch::channel(false);
        Ok(Self {
            cfg,
            http: reqwest::Client::new(),
            ready_tx,
            state: Mutex::new(ProcessState {
                child: None,
                pgid: None,
                readers: Vec::new(),
            }),
            exit_code: std::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &LlamaServerConfig {
        &self.cfg
    }

    /// Spawns the child in its own process group and starts the output
    /// readers that watch for readiness markers.
    pub async fn start(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(child) = state.child.as_mut() {
            if child.try_wait()?.is_none() {
                bail!("llama-server already running");
            }
        }
        self.ready_tx.send_replace(false);
        *self.exit_code.lock().unwrap() = None;

        let args = self.cfg.command_args();
        info!(binary = %self.cfg.binary.display(), ?args, "starting llama-server");

        let mut cmd = Command::new(&self.cfg.binary);
        cmd.args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().context("spawning llama-server")?;
        let pgid = child.id().map(|id| id as i32);

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(scan_output(
                stdout,
                false,
                self.cfg.ready_text.clone(),
                self.ready_tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(scan_output(
                stderr,
                true,
                self.cfg.ready_text.clone(),
                self.ready_tx.clone(),
            )));
        }

        state.child = Some(child);
        state.pgid = pgid;
        state.readers = readers;
        Ok(())
    }

    /// Exit code of the child if it has terminated.
    pub async fn poll(&self) -> Option<i32> {
        if let Some(code) = *self.exit_code.lock().unwrap() {
            return Some(code);
        }
        let mut state = self.state.lock().await;
        let child = state.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                let code = exit_code_of(status);
                *self.exit_code.lock().unwrap() = Some(code);
                Some(code)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(error = ?e, "polling llama-server failed");
                None
            }
        }
    }

    pub async fn is_running(&self) -> bool {
        let started = self.state.lock().await.child.is_some();
        started && self.poll().await.is_none()
    }

    /// Blocks until a readiness marker has been observed, the child exits,
    /// or the timeout elapses.
    pub async fn wait_ready(&self, timeout: Duration) -> Result<bool, LlamaServerError> {
        {
            let state = self.state.lock().await;
            if state.child.is_none() && self.exit_code.lock().unwrap().is_none() {
                return Err(LlamaServerError::NotStarted);
            }
        }

        let mut rx = self.ready_tx.subscribe();
        let deadline = Instant::now() + timeout;
        loop {
            if *rx.borrow() {
                return Ok(true);
            }
            if let Some(code) = self.poll().await {
                // A marker seen just before exit still counts as ready.
                if *rx.borrow() {
                    return Ok(true);
                }
                return Err(LlamaServerError::ProcessExited(Some(code)));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(false);
            }
            let slice = remaining.min(Duration::from_millis(100));
            tokio::select! {
                _ = rx.changed() => {}
                _ = tokio::time::sleep(slice) => {}
            }
        }
    }

    /// Pings `base_url + endpoint` until it answers 2xx. Retries with
    /// exponential backoff but never past `timeout`, and gives up early if
    /// the child dies.
    pub async fn poll_health(
        &self,
        base_url: &str,
        endpoint: &str,
        timeout: Duration,
        interval: Duration,
        max_retries: u32,
        backoff: f64,
    ) -> bool {
        if base_url.is_empty() {
            warn!("health polling skipped: no base url");
            return false;
        }
        let interval = interval.max(Duration::from_millis(50));
        let backoff = backoff.max(1.0);
        let deadline = Instant::now() + timeout;
        let attempts = max_retries + 1;
        let url = format!("{}{}", base_url.trim_end_matches('/'), endpoint);
        let request_timeout = timeout.min(interval.max(Duration::from_millis(100)));
        let mut sleep_for = interval;

        for attempt in 0..attempts {
            if self.poll().await.is_some() {
                return false;
            }
            match self
                .http
                .get(&url)
                .timeout(request_timeout)
                .send()
                .await
            {
                Ok(resp) if resp.status().is_success() => return true,
                Ok(resp) => {
                    debug!(status = %resp.status(), %url, attempt, "health check not ready")
                }
                Err(e) => debug!(error = %e, %url, attempt, "health check request failed"),
            }

            if attempt == attempts - 1 {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let nap = sleep_for.min(deadline - now);
            tokio::time::sleep(nap).await;
            sleep_for = sleep_for.mul_f64(backoff);
        }
        false
    }

    /// Three-phase shutdown of the whole process group. Idempotent: a second
    /// call returns immediately.
    pub async fn stop(&self, graceful: Duration, force: Duration) {
        let mut state = self.state.lock().await;
        let readers = std::mem::take(&mut state.readers);
        let pgid = state.pgid.take();

        if let Some(mut child) = state.child.take() {
            match child.try_wait() {
                Ok(Some(status)) => self.record_exit(status),
                _ => {
                    info!("stopping llama-server (SIGINT to group)");
                    signal_group(pgid, &mut child, TermSignal::Interrupt);
                    match tokio::time::timeout(graceful, child.wait()).await {
                        Ok(Ok(status)) => self.record_exit(status),
                        _ => {
                            warn!("llama-server ignored SIGINT, escalating to SIGTERM");
                            signal_group(pgid, &mut child, TermSignal::Terminate);
                            match tokio::time::timeout(force, child.wait()).await {
                                Ok(Ok(status)) => self.record_exit(status),
                                _ => {
                                    warn!("force killing llama-server");
                                    signal_group(pgid, &mut child, TermSignal::Kill);
                                    let _ = child.kill().await;
                                    if let Ok(status) = child.wait().await {
                                        self.record_exit(status);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }

        for reader in readers {
            if tokio::time::timeout(Duration::from_secs(1), reader).await.is_err() {
                warn!("llama-server output reader did not finish");
            }
        }
        self.ready_tx.send_replace(false);
    }

    fn record_exit(&self, status: std::process::ExitStatus) {
        let code = exit_code_of(status);
        info!(code, "llama-server exited");
        *self.exit_code.lock().unwrap() = Some(code);
    }
}

enum TermSignal {
    Interrupt,
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: Option<i32>, child: &mut Child, signal: TermSignal) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        TermSignal::Interrupt => Signal::SIGINT,
        TermSignal::Terminate => Signal::SIGTERM,
        TermSignal::Kill => Signal::SIGKILL,
    };
    match pgid {
        Some(pgid) => {
            if let Err(e) = killpg(Pid::from_raw(pgid), signal) {
                debug!(?e, %signal, "killpg failed, signalling child directly");
                let _ = child.start_kill();
            }
        }
        None => {
            let _ = child.start_kill();
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: Option<i32>, child: &mut Child, _signal: TermSignal) {
    let _ = child.start_kill();
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| -s))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

fn is_ready_marker(line: &str, ready_text: Option<&str>) -> bool {
    let lowered = line.to_lowercase();
    if let Some(text) = ready_text {
        if lowered.contains(&text.to_lowercase()) {
            return true;
        }
    }
    READY_MARKERS.iter().any(|m| lowered.contains(m))
}

async fn scan_output(
    stream: impl AsyncRead + Unpin + Send + 'static,
    is_stderr: bool,
    ready_text: Option<String>,
    ready_tx: watch::Sender<bool>,
) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.is_empty() {
            continue;
        }
        if is_stderr {
            warn!(%line, "llama-server stderr");
        } else {
            debug!(%line, "llama-server stdout");
        }
        if is_ready_marker(&line, ready_text.as_deref()) {
            ready_tx.send_replace(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_args_reflect_config() {
        let mut cfg = LlamaServerConfig::new("/bin/true", "/tmp/model.gguf");
        cfg.port = 9090;
        cfg.threads = Some(4);
        cfg.parallel = Some(2);
        cfg.mlock = true;
        cfg.extra_args = vec!["--verbose".into()];
        let args = cfg.command_args();
        assert_eq!(args[0], "-m");
        assert!(args.contains(&"--port".to_string()));
        assert!(args.contains(&"9090".to_string()));
        assert!(args.contains(&"-t".to_string()));
        assert!(args.contains(&"4".to_string()));
        assert!(args.contains(&"--parallel".to_string()));
        assert!(args.contains(&"--mlock".to_string()));
        assert!(!args.contains(&"--embeddings".to_string()));
        assert_eq!(args.last().unwrap(), "--verbose");
    }

    #[test]
    fn constructor_rejects_missing_paths() {
        let cfg = LlamaServerConfig::new("/nonexistent/llama", "/nonexistent/model");
        assert!(LlamaServer::new(cfg).is_err());
    }

    #[test]
    fn ready_markers_match_case_insensitively() {
        assert!(is_ready_marker("HTTP Server is Listening on port 8080", None));
        assert!(is_ready_marker("main: starting the main loop", None));
        assert!(is_ready_marker("custom READY line", Some("ready")));
        assert!(!is_ready_marker("loading model", None));
    }

    #[tokio::test]
    async fn wait_ready_errors_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("llama");
        let model = dir.path().join("model.gguf");
        std::fs::write(&bin, "#!/bin/sh\nsleep 10\n").unwrap();
        std::fs::write(&model, "stub").unwrap();
        let server = LlamaServer::new(LlamaServerConfig::new(&bin, &model)).unwrap();
        match server.wait_ready(Duration::from_millis(10)).await {
            Err(LlamaServerError::NotStarted) => {}
            other => panic!("expected NotStarted, got {other:?}"),
        }
    }
}
