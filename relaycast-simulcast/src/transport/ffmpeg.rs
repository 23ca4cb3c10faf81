//! Relay process driver.
//!
//! Each link is one ffmpeg child reading the ingest and publishing to a single
//! destination with stream copy. Progress comes from `-progress pipe:1`, the
//! tail of stderr is kept for error messages, and a graceful stop sends `q` on
//! stdin before falling back to a kill.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use relaycast_core::RelayConfig;

use super::{LinkEvent, LinkHealth, RelayLink};
use crate::destination::RelayMetrics;
use crate::error::{SimulcastError, SimulcastResult};
use crate::util::redact_credential;

const PROGRESS_CHANNEL_CAPACITY: usize = 16;
/// Stderr lines quoted in an exit reason
const EXIT_REASON_LINES: usize = 3;
/// How long an exited process's last stderr lines are waited for
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(200);

/// How relay processes are launched and supervised.
#[derive(Debug, Clone)]
pub struct FfmpegSettings {
    pub binary: String,
    /// Time allowed between spawn and the first byte written to the destination
    pub connect_timeout: Duration,
    pub stall_timeout: Duration,
    pub stderr_tail_lines: usize,
}

impl Default for FfmpegSettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl From<&RelayConfig> for FfmpegSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            binary: config.ffmpeg_path.clone(),
            connect_timeout: Duration::from_secs(config.connect_timeout_seconds),
            stall_timeout: Duration::from_secs(config.stall_timeout_seconds),
            stderr_tail_lines: config.stderr_tail_lines.max(1),
        }
    }
}

impl FfmpegSettings {
    /// Find the relay binary: a path must point at a file, a bare name must be
    /// on `PATH`.
    pub fn locate_binary(&self) -> Result<PathBuf, String> {
        let binary = Path::new(&self.binary);
        if self.binary.trim().is_empty() {
            return Err("no relay binary configured".to_string());
        }
        if binary.components().count() > 1 {
            return if binary.is_file() {
                Ok(binary.to_path_buf())
            } else {
                Err(format!("relay binary {} not found", self.binary))
            };
        }
        std::env::var_os("PATH")
            .and_then(|paths| {
                std::env::split_paths(&paths)
                    .map(|dir| dir.join(binary))
                    .find(|candidate| candidate.is_file())
            })
            .ok_or_else(|| format!("relay binary {} not found on PATH", self.binary))
    }
}

/// Full command line: read the ingest in real time, report progress on stdout.
#[must_use]
pub fn build_args(ingest_url: &str, output_args: Vec<String>) -> Vec<String> {
    let mut args: Vec<String> = [
        "-hide_banner",
        "-loglevel",
        "error",
        "-nostats",
        "-progress",
        "pipe:1",
        "-re",
        "-i",
        ingest_url,
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    args.extend(output_args);
    args
}

/// Accumulates `key=value` lines of ffmpeg's `-progress` output into one
/// [`RelayMetrics`] per block.
#[derive(Debug, Default)]
pub(crate) struct ProgressParser {
    current: RelayMetrics,
}

impl ProgressParser {
    /// Feed one line, returning the finished block on its `progress=` line.
    pub(crate) fn feed(&mut self, line: &str) -> Option<RelayMetrics> {
        let (key, value) = line.trim().split_once('=')?;
        let value = value.trim();
        match key.trim() {
            "frame" => self.current.frames = value.parse().unwrap_or(0),
            "fps" => self.current.fps = value.parse().unwrap_or(0.0),
            "bitrate" => {
                self.current.bitrate_kbps = value
                    .trim_end_matches("kbits/s")
                    .trim()
                    .parse()
                    .unwrap_or(0.0);
            }
            "total_size" => self.current.total_size_bytes = value.parse().unwrap_or(0),
            "out_time_us" => {
                let micros: i64 = value.parse().unwrap_or(0);
                self.current.out_time_ms = u64::try_from(micros / 1000).unwrap_or(0);
            }
            "drop_frames" => self.current.dropped_frames = value.parse().unwrap_or(0),
            "speed" => {
                self.current.speed = value.trim_end_matches('x').trim().parse().unwrap_or(0.0);
            }
            "progress" => return Some(std::mem::take(&mut self.current)),
            _ => {}
        }
        None
    }
}

/// Hide a credential that ffmpeg echoes back in its error output.
fn scrub(line: &str, secret: &str) -> String {
    if secret.is_empty() {
        return line.to_string();
    }
    let redacted = redact_credential(secret);
    let encoded: String = url::form_urlencoded::byte_serialize(secret.as_bytes()).collect();
    line.replace(secret, &redacted).replace(&encoded, &redacted)
}

enum Observed {
    Progress(RelayMetrics),
    Exited(io::Result<ExitStatus>),
}

/// One running relay process.
pub struct FfmpegLink {
    child: Child,
    stdin: Option<ChildStdin>,
    progress_rx: mpsc::Receiver<RelayMetrics>,
    stdout_closed: bool,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    progress_reader: JoinHandle<()>,
    stderr_reader: Option<JoinHandle<()>>,
    last_progress: Instant,
    connect_timeout: Duration,
    stall_timeout: Duration,
    /// Set once the child's exit has been observed
    exit_reason: Option<String>,
}

impl FfmpegLink {
    /// Launch the relay process.
    ///
    /// `secret` is scrubbed from everything read back from the process.
    pub fn spawn(
        settings: &FfmpegSettings,
        ingest_url: &str,
        output_args: Vec<String>,
        secret: &str,
    ) -> SimulcastResult<Self> {
        let mut cmd = Command::new(&settings.binary);
        cmd.args(build_args(ingest_url, output_args))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            SimulcastError::SpawnFailure(format!("cannot start {}: {e}", settings.binary))
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or_else(|| {
            SimulcastError::SpawnFailure("relay process has no stdout handle".to_string())
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            SimulcastError::SpawnFailure("relay process has no stderr handle".to_string())
        })?;

        let (progress_tx, progress_rx) = mpsc::channel(PROGRESS_CHANNEL_CAPACITY);
        let progress_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            let mut parser = ProgressParser::default();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(metrics) = parser.feed(&line) {
                    // A slow consumer loses intermediate reports, never the process
                    if let Err(mpsc::error::TrySendError::Closed(_)) = progress_tx.try_send(metrics)
                    {
                        break;
                    }
                }
            }
        });

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(
            settings.stderr_tail_lines,
        )));
        let tail = Arc::clone(&stderr_tail);
        let capacity = settings.stderr_tail_lines;
        let secret = secret.to_string();
        let stderr_reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let line = scrub(line, &secret);
                debug!(line = %line, "relay stderr");
                let mut tail = tail.lock();
                if tail.len() >= capacity {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        });

        Ok(Self {
            child,
            stdin,
            progress_rx,
            stdout_closed: false,
            stderr_tail,
            progress_reader,
            stderr_reader: Some(stderr_reader),
            last_progress: Instant::now(),
            connect_timeout: settings.connect_timeout,
            stall_timeout: settings.stall_timeout,
            exit_reason: None,
        })
    }

    /// Wait until the destination has accepted data.
    ///
    /// The first progress block with output written counts as a completed
    /// handshake. On timeout the process is killed.
    pub async fn wait_for_handshake(&mut self) -> SimulcastResult<()> {
        let deadline = tokio::time::sleep(self.connect_timeout);
        tokio::pin!(deadline);

        loop {
            let observed = tokio::select! {
                observed = self.observe() => observed,
                () = &mut deadline => {
                    let _ = self.child.kill().await;
                    return Err(SimulcastError::Connection(format!(
                        "handshake timed out after {:.1}s",
                        self.connect_timeout.as_secs_f64()
                    )));
                }
            };
            match observed {
                Observed::Progress(metrics) => {
                    self.last_progress = Instant::now();
                    if metrics.total_size_bytes > 0 || metrics.out_time_ms > 0 {
                        return Ok(());
                    }
                }
                Observed::Exited(status) => {
                    return Err(SimulcastError::Connection(self.record_exit(status).await));
                }
            }
        }
    }

    /// Next progress block or the process exit. Cancel safe.
    async fn observe(&mut self) -> Observed {
        if self.stdout_closed {
            return Observed::Exited(self.child.wait().await);
        }
        tokio::select! {
            metrics = self.progress_rx.recv() => match metrics {
                Some(metrics) => Observed::Progress(metrics),
                // stdout closed, the process is on its way out
                None => {
                    self.stdout_closed = true;
                    Observed::Exited(self.child.wait().await)
                }
            },
            status = self.child.wait() => Observed::Exited(status),
        }
    }

    /// Wait for the stderr reader to reach EOF so the exit reason carries the
    /// process's last words. Cancel safe.
    async fn drain_stderr(&mut self) {
        if let Some(reader) = self.stderr_reader.as_mut() {
            if tokio::time::timeout(STDERR_DRAIN_TIMEOUT, reader).await.is_err() {
                debug!("Relay stderr still open after exit");
            }
            if let Some(reader) = self.stderr_reader.take() {
                reader.abort();
            }
        }
    }

    fn abort_readers(&self) {
        self.progress_reader.abort();
        if let Some(reader) = &self.stderr_reader {
            reader.abort();
        }
    }

    async fn record_exit(&mut self, status: io::Result<ExitStatus>) -> String {
        self.drain_stderr().await;
        let mut reason = match status {
            Ok(status) => format!("relay process exited ({status})"),
            Err(e) => format!("relay process lost: {e}"),
        };
        let tail = self.stderr_tail.lock();
        if !tail.is_empty() {
            let skip = tail.len().saturating_sub(EXIT_REASON_LINES);
            let last: Vec<&str> = tail.iter().skip(skip).map(String::as_str).collect();
            reason.push_str(": ");
            reason.push_str(&last.join(" | "));
        }
        drop(tail);
        self.exit_reason = Some(reason.clone());
        reason
    }
}

#[async_trait]
impl RelayLink for FfmpegLink {
    async fn next_event(&mut self) -> LinkEvent {
        if let Some(reason) = &self.exit_reason {
            return LinkEvent::Closed {
                reason: reason.clone(),
            };
        }
        match self.observe().await {
            Observed::Progress(metrics) => {
                self.last_progress = Instant::now();
                LinkEvent::Progress(metrics)
            }
            Observed::Exited(status) => LinkEvent::Closed {
                reason: self.record_exit(status).await,
            },
        }
    }

    async fn health_check(&mut self) -> LinkHealth {
        if let Some(reason) = &self.exit_reason {
            return LinkHealth::Unhealthy(reason.clone());
        }
        match self.child.try_wait() {
            Ok(Some(status)) => LinkHealth::Unhealthy(self.record_exit(Ok(status)).await),
            Ok(None) if self.last_progress.elapsed() > self.stall_timeout => {
                LinkHealth::Unhealthy(format!(
                    "no progress for {}s",
                    self.last_progress.elapsed().as_secs()
                ))
            }
            Ok(None) => LinkHealth::Healthy,
            Err(e) => LinkHealth::Unhealthy(format!("cannot poll relay process: {e}")),
        }
    }

    async fn disconnect(&mut self, grace: Duration) {
        if self.exit_reason.is_none() {
            let stdin = self.stdin.take();
            let child = &mut self.child;
            let graceful = tokio::time::timeout(grace, async move {
                if let Some(mut stdin) = stdin {
                    // ffmpeg finishes the output and exits on `q`
                    let _ = stdin.write_all(b"q").await;
                    let _ = stdin.flush().await;
                }
                child.wait().await
            })
            .await;

            match graceful {
                Ok(Ok(status)) => debug!(%status, "Relay process exited"),
                Ok(Err(e)) => warn!(error = %e, "Failed to wait for relay process"),
                Err(_) => {
                    warn!(
                        grace_secs = grace.as_secs_f64(),
                        "Relay process ignored stop request, killing it"
                    );
                    if let Err(e) = self.child.kill().await {
                        warn!(error = %e, "Failed to kill relay process");
                    }
                }
            }
        }
        self.abort_readers();
    }
}

impl Drop for FfmpegLink {
    fn drop(&mut self) {
        self.abort_readers();
    }
}
