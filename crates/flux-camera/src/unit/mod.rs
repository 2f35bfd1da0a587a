//! 执行单元：承载一个相机分析管道的线程或子进程
//!
//! 监督器只通过 [`ExecutionUnit`] 与 [`UnitMonitor`] 操作执行单元，
//! 不关心它是同进程的线程还是独立的子进程。

mod process;
mod thread;

pub use process::ProcessBackend;
pub use thread::ThreadBackend;

use crate::error::WorkerError;
use crate::types::{CameraId, CameraSpec};
use async_trait::async_trait;
use flux_occupancy::{CrossingTracker, OccupancyCounter, OccupancySnapshot, TrackerOptions};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// 管道上报给监督器的生命周期信号
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineSignal {
    /// 还没有任何报告
    Pending,
    /// 初始化完成，开始处理帧
    Started,
    /// 管道报告错误或异常退出
    Failed(String),
    /// 管道自行结束
    Finished,
}

impl PipelineSignal {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineSignal::Failed(_) | PipelineSignal::Finished)
    }
}

#[derive(Debug, Clone)]
struct UnitStatus {
    /// 是否曾经报告过就绪，之后很快结束的管道仍算启动成功
    started: bool,
    signal: PipelineSignal,
}

/// 执行单元一侧持有的生命周期写端
///
/// 终态（`Failed`/`Finished`）一旦写入就不会再改变。
/// 最后一个引用释放时，如果管道没有报告结束，就记为失败并标记已退出。
pub(crate) struct UnitLifecycle {
    camera_id: CameraId,
    status: watch::Sender<UnitStatus>,
    exited: watch::Sender<bool>,
}

impl UnitLifecycle {
    pub(crate) fn new(camera_id: CameraId) -> (Arc<Self>, UnitMonitor) {
        let (status, status_rx) = watch::channel(UnitStatus {
            started: false,
            signal: PipelineSignal::Pending,
        });
        let (exited, exited_rx) = watch::channel(false);

        let lifecycle = Arc::new(Self {
            camera_id,
            status,
            exited,
        });
        let monitor = UnitMonitor {
            status: status_rx,
            exited: exited_rx,
        };
        (lifecycle, monitor)
    }

    pub(crate) fn started(&self) {
        self.status.send_if_modified(|status| {
            if status.signal == PipelineSignal::Pending {
                status.started = true;
                status.signal = PipelineSignal::Started;
                true
            } else {
                false
            }
        });
    }

    pub(crate) fn failed(&self, message: impl Into<String>) {
        self.settle(PipelineSignal::Failed(message.into()));
    }

    pub(crate) fn finished(&self) {
        self.settle(PipelineSignal::Finished);
    }

    pub(crate) fn mark_exited(&self) {
        self.exited.send_replace(true);
    }

    fn settle(&self, terminal: PipelineSignal) {
        self.status.send_if_modified(|status| {
            if status.signal.is_terminal() {
                false
            } else {
                status.signal = terminal;
                true
            }
        });
    }
}

impl Drop for UnitLifecycle {
    fn drop(&mut self) {
        if std::thread::panicking() {
            tracing::error!(camera_id = %self.camera_id, "Pipeline panicked");
            self.failed("pipeline panicked");
        } else {
            self.failed("pipeline exited without reporting");
        }
        self.mark_exited();
    }
}

/// 监督器一侧的只读视图
#[derive(Debug, Clone)]
pub struct UnitMonitor {
    status: watch::Receiver<UnitStatus>,
    exited: watch::Receiver<bool>,
}

impl UnitMonitor {
    /// 执行单元是否还存活
    pub fn is_alive(&self) -> bool {
        !*self.exited.borrow()
    }

    /// 最新的生命周期信号
    pub fn signal(&self) -> PipelineSignal {
        self.status.borrow().signal.clone()
    }

    /// 等待管道报告就绪或结束，超时返回 `None`
    ///
    /// 报告过就绪的管道总是返回 `Started`，即使随后已经结束。
    pub async fn wait_ready(&mut self, timeout: Duration) -> Option<PipelineSignal> {
        let status = &mut self.status;
        let wait = async move {
            status
                .wait_for(|s| s.started || s.signal != PipelineSignal::Pending)
                .await
                .map(|s| {
                    if s.started {
                        PipelineSignal::Started
                    } else {
                        s.signal.clone()
                    }
                })
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(signal)) => Some(signal),
            Ok(Err(_)) => Some(PipelineSignal::Failed(
                "exited before signaling ready".to_string(),
            )),
            Err(_) => None,
        }
    }

    /// 在超时内等待退出，返回是否已退出
    pub async fn wait_exit(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait_exited())
            .await
            .is_ok()
    }

    pub async fn wait_exited(&mut self) {
        let _ = self.exited.wait_for(|exited| *exited).await;
    }
}

/// 单个执行单元（线程或子进程）
///
/// 停止按 `request_stop -> terminate -> kill` 逐级升级，由 [`crate::CameraWorker`] 驱动。
#[async_trait]
pub trait ExecutionUnit: Send {
    /// 后端名称，用于日志
    fn backend(&self) -> &'static str;

    /// 启动管道，返回用于观察它的监视器
    async fn launch(&mut self) -> Result<UnitMonitor, WorkerError>;

    /// 协作式停止请求
    async fn request_stop(&mut self) -> Result<(), WorkerError>;

    /// 强制终止
    async fn terminate(&mut self) -> Result<(), WorkerError>;

    /// 无条件杀死
    async fn kill(&mut self) -> Result<(), WorkerError>;

    /// 回收已退出单元的资源
    async fn reap(&mut self);
}

/// 跨重启保留的计数状态
#[derive(Debug, Clone, Default)]
pub struct SharedCounters {
    pub counter: Arc<OccupancyCounter>,
    pub frames: Arc<AtomicU64>,
}

impl SharedCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> OccupancySnapshot {
        self.counter.snapshot()
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }
}

/// 创建执行单元所需的全部信息
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub spec: CameraSpec,
    pub counting: TrackerOptions,
    pub counters: SharedCounters,
}

impl UnitContext {
    /// 每次启动都用新的跟踪状态，计数器沿用
    pub(crate) fn tracker(&self) -> CrossingTracker {
        CrossingTracker::new(
            self.spec.name.clone(),
            &self.spec.line,
            self.counters.counter.clone(),
            self.counting.clone(),
        )
    }
}

/// 执行单元工厂（线程后端或进程后端）
pub trait UnitFactory: Send + Sync {
    fn create(&self, ctx: UnitContext) -> Box<dyn ExecutionUnit>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_terminal_signal_is_sticky() {
        let (lifecycle, monitor) = UnitLifecycle::new(CameraId(1));

        lifecycle.started();
        lifecycle.failed("decoder lost");
        lifecycle.finished();
        lifecycle.started();

        assert_eq!(
            monitor.signal(),
            PipelineSignal::Failed("decoder lost".to_string())
        );
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let (_lifecycle, mut monitor) = UnitLifecycle::new(CameraId(1));

        let signal = monitor.wait_ready(Duration::from_millis(20)).await;
        assert!(signal.is_none());
        assert!(monitor.is_alive());
    }

    #[tokio::test]
    async fn test_drop_without_report_marks_failed_and_exited() {
        let (lifecycle, mut monitor) = UnitLifecycle::new(CameraId(2));
        drop(lifecycle);

        let signal = monitor.wait_ready(Duration::from_millis(100)).await;
        assert!(matches!(signal, Some(PipelineSignal::Failed(_))));
        assert!(!monitor.is_alive());
        assert!(monitor.wait_exit(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_quick_finish_still_counts_as_started() {
        let (lifecycle, mut monitor) = UnitLifecycle::new(CameraId(4));
        lifecycle.started();
        lifecycle.finished();

        let signal = monitor.wait_ready(Duration::from_millis(100)).await;
        assert_eq!(signal, Some(PipelineSignal::Started));
        assert_eq!(monitor.signal(), PipelineSignal::Finished);
    }

    #[tokio::test]
    async fn test_finished_survives_drop() {
        let (lifecycle, monitor) = UnitLifecycle::new(CameraId(3));
        lifecycle.started();
        lifecycle.finished();
        drop(lifecycle);

        assert_eq!(monitor.signal(), PipelineSignal::Finished);
        assert!(!monitor.is_alive());
    }
}
