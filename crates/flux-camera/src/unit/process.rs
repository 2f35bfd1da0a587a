use super::{ExecutionUnit, UnitContext, UnitFactory, UnitLifecycle, UnitMonitor};
use crate::error::WorkerError;
use crate::protocol::{ControlMessage, PipelineMessage};
use crate::types::CameraId;
use async_trait::async_trait;
use flux_occupancy::CrossingTracker;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 子进程退出后最多等读取任务这么久，把剩余的帧消息计完
const READER_DRAIN: Duration = Duration::from_millis(500);

/// 子进程后端
///
/// 每个相机一个子进程，参数为
/// `<program> <args..> --camera-id <id> --source <source> --line <json>`。
/// 子进程只上报帧，计数在父进程的读取任务里完成。
#[derive(Debug, Clone)]
pub struct ProcessBackend {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessBackend {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl UnitFactory for ProcessBackend {
    fn create(&self, ctx: UnitContext) -> Box<dyn ExecutionUnit> {
        Box::new(ProcessUnit {
            ctx,
            program: self.program.clone(),
            args: self.args.clone(),
            stdin: None,
            signals: None,
            reaper: None,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum KillSignal {
    Terminate,
    Kill,
}

struct ProcessUnit {
    ctx: UnitContext,
    program: PathBuf,
    args: Vec<String>,
    stdin: Option<ChildStdin>,
    signals: Option<mpsc::UnboundedSender<KillSignal>>,
    reaper: Option<JoinHandle<()>>,
}

impl ProcessUnit {
    fn send(&self, signal: KillSignal) {
        if let Some(signals) = &self.signals {
            if signals.send(signal).is_err() {
                debug!(camera_id = %self.ctx.spec.id, "Pipeline process already reaped");
            }
        }
    }
}

#[async_trait]
impl ExecutionUnit for ProcessUnit {
    fn backend(&self) -> &'static str {
        "process"
    }

    async fn launch(&mut self) -> Result<UnitMonitor, WorkerError> {
        let camera_id = self.ctx.spec.id;
        let line = serde_json::to_string(&self.ctx.spec.line)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg("--camera-id")
            .arg(camera_id.to_string())
            .arg("--source")
            .arg(&self.ctx.spec.source)
            .arg("--line")
            .arg(line)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| WorkerError::Spawn { camera_id, source })?;

        let stdout = child.stdout.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::BrokenPipe, "pipeline stdout not captured")
        })?;
        self.stdin = child.stdin.take();

        info!(
            camera_id = %camera_id,
            pid = ?child.id(),
            program = %self.program.display(),
            "Pipeline process spawned"
        );

        let (lifecycle, monitor) = UnitLifecycle::new(camera_id);
        let reader = tokio::spawn(read_messages(
            camera_id,
            stdout,
            lifecycle.clone(),
            self.ctx.tracker(),
            self.ctx.counters.frames.clone(),
        ));

        let (tx, rx) = mpsc::unbounded_channel();
        self.signals = Some(tx);
        self.reaper = Some(tokio::spawn(reap_child(
            camera_id, child, rx, reader, lifecycle,
        )));

        Ok(monitor)
    }

    async fn request_stop(&mut self) -> Result<(), WorkerError> {
        let Some(mut stdin) = self.stdin.take() else {
            return Ok(());
        };

        let line = ControlMessage::Stop
            .to_line()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        // 关闭 stdin，不解析控制消息的管道也能看到 EOF
        drop(stdin);
        Ok(())
    }

    async fn terminate(&mut self) -> Result<(), WorkerError> {
        self.send(KillSignal::Terminate);
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), WorkerError> {
        self.send(KillSignal::Kill);
        Ok(())
    }

    async fn reap(&mut self) {
        self.stdin = None;
        self.signals = None;

        let Some(reaper) = self.reaper.take() else {
            return;
        };

        if !reaper.is_finished() {
            warn!(camera_id = %self.ctx.spec.id, "Pipeline process still running, detaching it");
            return;
        }

        if let Err(e) = reaper.await {
            error!(camera_id = %self.ctx.spec.id, error = %e, "Process reaper task failed");
        }
    }
}

/// 读取子进程 stdout，驱动生命周期与计数
async fn read_messages(
    camera_id: CameraId,
    stdout: ChildStdout,
    lifecycle: Arc<UnitLifecycle>,
    mut tracker: CrossingTracker,
    frames: Arc<AtomicU64>,
) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(camera_id = %camera_id, error = %e, "Failed to read pipeline output");
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match PipelineMessage::parse(&line) {
            Ok(PipelineMessage::Started) => {
                debug!(camera_id = %camera_id, "Pipeline process reported started");
                lifecycle.started();
            }
            Ok(PipelineMessage::Frame { objects }) => {
                tracker.observe_frame(&objects);
                frames.fetch_add(1, Ordering::Relaxed);
            }
            Ok(PipelineMessage::Error { message }) => {
                error!(camera_id = %camera_id, error = %message, "Pipeline process reported error");
                lifecycle.failed(message);
            }
            Ok(PipelineMessage::Finished) => {
                debug!(camera_id = %camera_id, "Pipeline process reported finished");
                lifecycle.finished();
            }
            Err(_) => {
                debug!(camera_id = %camera_id, line = %line, "Ignoring non-protocol output");
            }
        }
    }
}

/// 等待子进程退出，期间转发终止信号
async fn reap_child(
    camera_id: CameraId,
    mut child: Child,
    mut signals: mpsc::UnboundedReceiver<KillSignal>,
    mut reader: JoinHandle<()>,
    lifecycle: Arc<UnitLifecycle>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(signal) = signals.recv() => {
                if let Err(e) = send_signal(&mut child, signal) {
                    warn!(camera_id = %camera_id, signal = ?signal, error = %e, "Failed to signal pipeline process");
                }
            }
        }
    };

    if tokio::time::timeout(READER_DRAIN, &mut reader).await.is_err() {
        reader.abort();
    }

    match status {
        Ok(status) if status.success() => {
            debug!(camera_id = %camera_id, "Pipeline process exited");
            lifecycle.finished();
        }
        Ok(status) => {
            debug!(camera_id = %camera_id, status = %status, "Pipeline process exited abnormally");
            lifecycle.failed(format!("pipeline process exited with {}", status));
        }
        Err(e) => {
            lifecycle.failed(format!("failed to wait for pipeline process: {}", e));
        }
    }

    lifecycle.mark_exited();
}

#[cfg(unix)]
fn send_signal(child: &mut Child, signal: KillSignal) -> io::Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    match signal {
        KillSignal::Terminate => {
            let Some(pid) = child.id() else {
                return Ok(());
            };
            kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(io::Error::from)
        }
        KillSignal::Kill => child.start_kill(),
    }
}

#[cfg(not(unix))]
fn send_signal(child: &mut Child, _signal: KillSignal) -> io::Result<()> {
    child.start_kill()
}
