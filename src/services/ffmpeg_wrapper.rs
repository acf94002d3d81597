//! Spawning and plumbing of transcoder processes.
//!
//! Every process of a generation goes through [`spawn_process`], which
//! configures stdio, kill-on-drop and the per-process stderr log. Output
//! streams are fanned out to consumers with a [`StreamTee`].

use chrono::Local;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command as TokioCommand};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::errors::{PipelineError, PipelineResult};
use crate::services::ffmpeg_command_builder::ProcessRole;

/// Everything needed to start one member of a generation
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub role: ProcessRole,
    pub args: Vec<String>,
    pub channel_id: String,
    pub generation: u64,
}

/// Produces the command for a process; stdio and lifetime are configured by [`spawn_process`].
pub trait ProcessLauncher: Send + Sync {
    fn command(&self, spec: &ProcessSpec) -> TokioCommand;
}

/// Launches the configured ffmpeg binary with the process arguments
#[derive(Debug, Clone)]
pub struct FfmpegLauncher {
    ffmpeg_path: PathBuf,
}

impl FfmpegLauncher {
    pub fn new(ffmpeg_path: impl Into<PathBuf>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
        }
    }
}

impl ProcessLauncher for FfmpegLauncher {
    fn command(&self, spec: &ProcessSpec) -> TokioCommand {
        let mut cmd = TokioCommand::new(&self.ffmpeg_path);
        cmd.args(&spec.args);
        cmd
    }
}

/// A started process with its pipe ends detached
pub struct SpawnedProcess {
    pub spec: ProcessSpec,
    pub child: Child,
    pub pid: Option<u32>,
    pub stdin: Option<ChildStdin>,
    pub stdout: Option<ChildStdout>,
}

/// How a member of a generation ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberOutcome {
    /// Exited on its own
    Exited { code: Option<i32> },
    /// Terminated by the cascade or a shutdown
    Killed,
    /// Could not be started or waited on
    Failed { message: String },
}

impl MemberOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, MemberOutcome::Exited { code: Some(0) })
    }
}

pub fn spawn_process(
    launcher: &dyn ProcessLauncher,
    spec: ProcessSpec,
    logs_dir: &Path,
) -> PipelineResult<SpawnedProcess> {
    let role = spec.role;
    let mut cmd = launcher.command(&spec);
    cmd.kill_on_drop(true);
    cmd.stdin(if role.reads_stdin() { Stdio::piped() } else { Stdio::null() });
    cmd.stdout(if role.writes_stdout() { Stdio::piped() } else { Stdio::null() });
    cmd.stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .map_err(|e| PipelineError::spawn(role.to_string(), e.to_string()))?;
    let pid = child.id();

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    if role.reads_stdin() && stdin.is_none() {
        return Err(PipelineError::MissingStdio { role: role.to_string(), stream: "stdin" });
    }
    if role.writes_stdout() && stdout.is_none() {
        return Err(PipelineError::MissingStdio { role: role.to_string(), stream: "stdout" });
    }

    if let Some(stderr) = child.stderr.take() {
        let log_path = log_file_path(logs_dir, &spec, pid);
        tokio::spawn(persist_stderr(stderr, log_path));
    }

    info!(
        "channel_id={} generation={} role={} pid={:?} status=started",
        spec.channel_id, spec.generation, role, pid
    );

    Ok(SpawnedProcess {
        spec,
        child,
        pid,
        stdin,
        stdout,
    })
}

/// First line of `ffmpeg -version`, if the binary runs at all
pub async fn probe_version(ffmpeg_path: &Path) -> Option<String> {
    match TokioCommand::new(ffmpeg_path).arg("-version").output().await {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(str::to_string),
        Ok(output) => {
            warn!("{} -version exited with {}", ffmpeg_path.display(), output.status);
            None
        }
        Err(e) => {
            warn!("{} -version failed: {}", ffmpeg_path.display(), e);
            None
        }
    }
}

/// `{logs}/{prefix}-{channel}-g{generation}-{pid}.log`
pub fn log_file_path(logs_dir: &Path, spec: &ProcessSpec, pid: Option<u32>) -> PathBuf {
    let pid = pid.map(|p| p.to_string()).unwrap_or_else(|| "unknown".to_string());
    logs_dir.join(format!(
        "{}-{}-g{}-{}.log",
        spec.role.log_prefix(),
        spec.channel_id,
        spec.generation,
        pid
    ))
}

async fn persist_stderr(stderr: ChildStderr, log_path: PathBuf) {
    let mut lines = BufReader::new(stderr).lines();
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .await
    {
        Ok(file) => Some(file),
        Err(e) => {
            warn!("Cannot open process log {}: {}", log_path.display(), e);
            None
        }
    };

    while let Ok(Some(line)) = lines.next_line().await {
        match file.as_mut() {
            Some(f) => {
                let entry = format!("{} {}\n", Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"), line);
                if let Err(e) = f.write_all(entry.as_bytes()).await {
                    warn!("Writing process log {} failed: {}", log_path.display(), e);
                    file = None;
                }
            }
            None => debug!("{}", line),
        }
    }

    if let Some(mut f) = file {
        let _ = f.flush().await;
    }
}

/// Waits for the child to exit, or kills it once `kill` fires.
pub async fn wait_or_kill(child: &mut Child, kill: &CancellationToken) -> MemberOutcome {
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => MemberOutcome::Exited { code: status.code() },
            Err(e) => MemberOutcome::Failed { message: e.to_string() },
        },
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                debug!("start_kill failed: {}", e);
            }
            let _ = child.wait().await;
            MemberOutcome::Killed
        }
    }
}

/// One consumer of a tee
pub struct TeeOutput {
    pub label: String,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
    /// Incremented with every chunk successfully handed to this consumer
    pub counter: Option<Arc<AtomicU64>>,
}

impl TeeOutput {
    pub fn new(label: impl Into<String>, writer: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        Self {
            label: label.into(),
            writer: Box::new(writer),
            counter: None,
        }
    }

    pub fn with_counter(mut self, counter: Arc<AtomicU64>) -> Self {
        self.counter = Some(counter);
        self
    }
}

/// Copies one stream into any number of consumers.
///
/// A consumer whose write fails is dropped; the rest keep receiving data.
/// With no consumers left the source is still drained so the producer never
/// blocks on a full pipe.
pub struct StreamTee;

impl StreamTee {
    pub fn spawn<R>(
        label: String,
        reader: R,
        outputs: Vec<TeeOutput>,
        cancel: CancellationToken,
    ) -> JoinHandle<u64>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        tokio::spawn(Self::run(label, reader, outputs, cancel))
    }

    async fn run<R>(label: String, mut reader: R, mut outputs: Vec<TeeOutput>, cancel: CancellationToken) -> u64
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let mut buf = vec![0u8; 8192];
        let mut total = 0u64;

        loop {
            let n = tokio::select! {
                _ = cancel.cancelled() => break,
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        debug!("{} stream ended", label);
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        debug!("{} read error: {}", label, e);
                        break;
                    }
                },
            };
            total += n as u64;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = Self::fan_out(&label, &mut outputs, &buf[..n]) => {}
            }
        }

        for output in outputs.iter_mut() {
            let _ = output.writer.shutdown().await;
        }
        total
    }

    async fn fan_out(label: &str, outputs: &mut Vec<TeeOutput>, chunk: &[u8]) {
        let mut failed = Vec::new();
        for (idx, output) in outputs.iter_mut().enumerate() {
            match output.writer.write_all(chunk).await {
                Ok(()) => {
                    if let Some(counter) = &output.counter {
                        counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    }
                }
                Err(e) => {
                    debug!("{} -> {} closed: {}", label, output.label, e);
                    failed.push(idx);
                }
            }
        }
        for idx in failed.into_iter().rev() {
            outputs.remove(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::task::PackageFormat;

    #[test]
    fn log_file_names_carry_role_channel_generation_and_pid() {
        let spec = ProcessSpec {
            role: ProcessRole::Package(PackageFormat::Mpd),
            args: vec![],
            channel_id: "abc".into(),
            generation: 3,
        };
        assert_eq!(
            log_file_path(Path::new("logs"), &spec, Some(42)),
            PathBuf::from("logs/convert-mpd-abc-g3-42.log")
        );
    }

    #[tokio::test]
    async fn tee_copies_to_every_output_and_counts() {
        let (mut src_w, src_r) = tokio::io::duplex(64);
        let (a_w, mut a_r) = tokio::io::duplex(1024);
        let (b_w, mut b_r) = tokio::io::duplex(1024);
        let counter = Arc::new(AtomicU64::new(0));

        let handle = StreamTee::spawn(
            "test".into(),
            src_r,
            vec![
                TeeOutput::new("a", a_w).with_counter(counter.clone()),
                TeeOutput::new("b", b_w),
            ],
            CancellationToken::new(),
        );

        src_w.write_all(b"hello world").await.unwrap();
        drop(src_w);
        assert_eq!(handle.await.unwrap(), 11);

        let mut a = Vec::new();
        a_r.read_to_end(&mut a).await.unwrap();
        let mut b = Vec::new();
        b_r.read_to_end(&mut b).await.unwrap();
        assert_eq!(a, b"hello world");
        assert_eq!(b, b"hello world");
        assert_eq!(counter.load(Ordering::Relaxed), 11);
    }

    #[tokio::test]
    async fn tee_survives_a_closed_output() {
        let (mut src_w, src_r) = tokio::io::duplex(64);
        let (dead_w, dead_r) = tokio::io::duplex(16);
        let (live_w, mut live_r) = tokio::io::duplex(1024);
        drop(dead_r);

        let handle = StreamTee::spawn(
            "test".into(),
            src_r,
            vec![TeeOutput::new("dead", dead_w), TeeOutput::new("live", live_w)],
            CancellationToken::new(),
        );

        src_w.write_all(b"abc").await.unwrap();
        src_w.write_all(b"def").await.unwrap();
        drop(src_w);
        handle.await.unwrap();

        let mut live = Vec::new();
        live_r.read_to_end(&mut live).await.unwrap();
        assert_eq!(live, b"abcdef");
    }

    #[tokio::test]
    async fn tee_stops_on_cancel() {
        let (_src_w, src_r) = tokio::io::duplex(64);
        let cancel = CancellationToken::new();
        let handle = StreamTee::spawn("test".into(), src_r, vec![], cancel.clone());
        cancel.cancel();
        assert_eq!(handle.await.unwrap(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_token_terminates_child() {
        let mut child = TokioCommand::new("sh")
            .arg("-c")
            .arg("sleep 30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let kill = CancellationToken::new();
        kill.cancel();
        assert_eq!(wait_or_kill(&mut child, &kill).await, MemberOutcome::Killed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn natural_exit_reports_code() {
        let mut child = TokioCommand::new("sh").arg("-c").arg("exit 3").spawn().unwrap();
        let outcome = wait_or_kill(&mut child, &CancellationToken::new()).await;
        assert_eq!(outcome, MemberOutcome::Exited { code: Some(3) });
        assert!(!outcome.is_success());
    }
}
