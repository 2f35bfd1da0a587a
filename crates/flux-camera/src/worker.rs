use crate::error::{EscalationLevel, WorkerError};
use crate::types::{CameraId, CameraSpec, StopOutcome, WorkerState};
use crate::unit::{ExecutionUnit, PipelineSignal, SharedCounters, UnitContext, UnitFactory, UnitMonitor};
use flux_occupancy::{OccupancySnapshot, TrackerOptions};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

/// 停止升级的各级等待时间
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    /// 协作式停止后等待自行退出的时间
    pub stop_timeout: Duration,
    /// 强制终止后的宽限期
    pub terminate_grace: Duration,
    /// 杀死后确认退出的等待时间
    pub kill_wait: Duration,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(8),
            terminate_grace: Duration::from_secs(2),
            kill_wait: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
struct RateSample {
    at: Instant,
    frames: u64,
    fps: f64,
}

/// 单个相机的工作单元
///
/// 拥有一个执行单元（线程或子进程），负责它的启动、停止升级和状态机。
/// `start`/`stop` 通过执行单元上的异步锁串行化。
pub struct CameraWorker {
    spec: CameraSpec,
    state: Arc<RwLock<WorkerState>>,
    /// 每次启动递增，旧的退出监听据此识别自己已过期
    launches: Arc<AtomicU64>,
    /// 已从监督器移除，只在持有 `unit` 锁时写入
    retired: AtomicBool,
    unit: AsyncMutex<Box<dyn ExecutionUnit>>,
    monitor: Mutex<Option<UnitMonitor>>,
    counters: SharedCounters,
    escalation: EscalationPolicy,
    rate: Mutex<RateSample>,
}

impl CameraWorker {
    pub fn new(
        spec: CameraSpec,
        units: &dyn UnitFactory,
        counting: TrackerOptions,
        escalation: EscalationPolicy,
    ) -> Self {
        let counters = SharedCounters::new();
        let unit = units.create(UnitContext {
            spec: spec.clone(),
            counting,
            counters: counters.clone(),
        });

        Self {
            spec,
            state: Arc::new(RwLock::new(WorkerState::Created)),
            launches: Arc::new(AtomicU64::new(0)),
            retired: AtomicBool::new(false),
            unit: AsyncMutex::new(unit),
            monitor: Mutex::new(None),
            counters,
            escalation,
            rate: Mutex::new(RateSample {
                at: Instant::now(),
                frames: 0,
                fps: 0.0,
            }),
        }
    }

    pub fn id(&self) -> CameraId {
        self.spec.id
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &CameraSpec {
        &self.spec
    }

    pub fn state(&self) -> WorkerState {
        *self.state.read()
    }

    pub fn escalation(&self) -> EscalationPolicy {
        self.escalation
    }

    /// 执行单元是否存活（未启动视为不存活）
    pub fn is_alive(&self) -> bool {
        self.monitor
            .lock()
            .as_ref()
            .map(UnitMonitor::is_alive)
            .unwrap_or(false)
    }

    /// 计数快照，从未启动时为全零
    pub fn stats(&self) -> OccupancySnapshot {
        self.counters.snapshot()
    }

    pub fn frames_processed(&self) -> u64 {
        self.counters.frames()
    }

    /// 距上次采样以来的帧率
    pub fn fps(&self) -> f64 {
        let mut rate = self.rate.lock();
        let now = Instant::now();
        let frames = self.counters.frames();
        let elapsed = now.duration_since(rate.at).as_secs_f64();

        if elapsed >= 0.001 {
            rate.fps = frames.saturating_sub(rate.frames) as f64 / elapsed;
            rate.at = now;
            rate.frames = frames;
        }
        rate.fps
    }

    /// 启动执行单元并等待就绪信号
    ///
    /// 超时或启动期间管道报错时，会先按停止升级清理执行单元再返回错误。
    pub async fn start(&self, timeout: Duration) -> Result<(), WorkerError> {
        let mut unit = self.unit.lock().await;
        let camera_id = self.spec.id;

        if self.retired.load(Ordering::SeqCst) {
            return Err(WorkerError::Removed(camera_id));
        }
        if self.is_alive() {
            return Err(WorkerError::AlreadyRunning(camera_id));
        }

        self.set_state(WorkerState::Starting);
        info!(
            camera_id = %camera_id,
            name = %self.spec.name,
            backend = unit.backend(),
            "Starting camera worker"
        );

        let mut monitor = match unit.launch().await {
            Ok(monitor) => monitor,
            Err(e) => {
                error!(camera_id = %camera_id, error = %e, "Failed to launch execution unit");
                self.set_state(WorkerState::Failed);
                return Err(e);
            }
        };
        *self.monitor.lock() = Some(monitor.clone());
        let launch = self.launches.fetch_add(1, Ordering::SeqCst) + 1;

        let failure = match monitor.wait_ready(timeout).await {
            Some(PipelineSignal::Started) => {
                self.set_state(WorkerState::Running);
                self.reset_rate();
                self.watch_exit(monitor, launch);
                info!(camera_id = %camera_id, name = %self.spec.name, "Camera worker running");
                return Ok(());
            }
            Some(PipelineSignal::Failed(message)) => WorkerError::pipeline(camera_id, message),
            Some(PipelineSignal::Finished) => {
                WorkerError::pipeline(camera_id, "pipeline finished before signaling ready")
            }
            Some(PipelineSignal::Pending) | None => {
                warn!(camera_id = %camera_id, timeout = ?timeout, "Camera worker start timed out");
                WorkerError::StartTimeout { camera_id, timeout }
            }
        };

        // 清理可能要经过整个升级过程，状态先行
        self.set_state(WorkerState::Failed);
        if let Err(e) = self
            .escalate(&mut **unit, &mut monitor, self.escalation.stop_timeout)
            .await
        {
            error!(camera_id = %camera_id, error = %e, "Failed to clean up after start failure");
        }
        unit.reap().await;

        error!(camera_id = %camera_id, error = %failure, "Camera worker failed to start");
        Err(failure)
    }

    /// 停止执行单元，幂等
    ///
    /// 先协作式停止并等待 `timeout`，仍存活则升级到强制终止，最后杀死。
    /// 只有确认执行单元已退出（或已放弃）后才返回。
    pub async fn stop(&self, timeout: Duration) -> Result<StopOutcome, WorkerError> {
        let mut unit = self.unit.lock().await;
        let camera_id = self.spec.id;

        let monitor = self.monitor.lock().clone();
        let Some(mut monitor) = monitor.filter(UnitMonitor::is_alive) else {
            self.settle_stopped();
            unit.reap().await;
            debug!(camera_id = %camera_id, "Camera worker already stopped");
            return Ok(StopOutcome::AlreadyStopped);
        };

        self.set_state(WorkerState::Stopping);
        info!(camera_id = %camera_id, name = %self.spec.name, "Stopping camera worker");

        let result = self.escalate(&mut **unit, &mut monitor, timeout).await;
        unit.reap().await;

        match &result {
            Ok(outcome) => {
                self.set_state(WorkerState::Stopped);
                let stats = self.stats();
                info!(
                    camera_id = %camera_id,
                    outcome = ?outcome,
                    entries = stats.entries,
                    exits = stats.exits,
                    occupancy = stats.occupancy,
                    "Camera worker stopped"
                );
            }
            Err(e) => {
                self.set_state(WorkerState::Failed);
                error!(camera_id = %camera_id, error = %e, "Camera worker could not be stopped");
            }
        }

        result
    }

    /// 标记为已移除，之后的 `start` 都会被拒绝
    ///
    /// 只有没有进行中的启动/停止且执行单元未存活时才会成功。
    pub(crate) fn retire(&self) -> bool {
        let Ok(_unit) = self.unit.try_lock() else {
            return false;
        };
        if self.is_alive() || self.state() == WorkerState::Starting {
            return false;
        }
        self.retired.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// 等待执行单元退出（未启动则立即返回）
    pub async fn wait_exited(&self) {
        let monitor = self.monitor.lock().clone();
        if let Some(mut monitor) = monitor {
            monitor.wait_exited().await;
        }
    }

    async fn escalate(
        &self,
        unit: &mut dyn ExecutionUnit,
        monitor: &mut UnitMonitor,
        timeout: Duration,
    ) -> Result<StopOutcome, WorkerError> {
        let camera_id = self.spec.id;
        if !monitor.is_alive() {
            return Ok(StopOutcome::Graceful);
        }

        info!(
            camera_id = %camera_id,
            escalation = %EscalationLevel::Cooperative,
            timeout = ?timeout,
            "Requesting cooperative stop"
        );
        if let Err(e) = unit.request_stop().await {
            warn!(camera_id = %camera_id, error = %e, "Cooperative stop request failed");
        }
        if monitor.wait_exit(timeout).await {
            return Ok(StopOutcome::Graceful);
        }

        warn!(
            camera_id = %camera_id,
            escalation = %EscalationLevel::Terminate,
            grace = ?self.escalation.terminate_grace,
            "Camera worker ignored stop request, terminating"
        );
        if let Err(e) = unit.terminate().await {
            warn!(camera_id = %camera_id, error = %e, "Terminate failed");
        }
        if monitor.wait_exit(self.escalation.terminate_grace).await {
            return Ok(StopOutcome::Forced(EscalationLevel::Terminate));
        }

        error!(
            camera_id = %camera_id,
            escalation = %EscalationLevel::Kill,
            "Camera worker survived terminate, killing"
        );
        if let Err(e) = unit.kill().await {
            error!(camera_id = %camera_id, error = %e, "Kill failed");
        }
        if monitor.wait_exit(self.escalation.kill_wait).await {
            return Ok(StopOutcome::Forced(EscalationLevel::Kill));
        }

        Err(WorkerError::StopTimeout {
            camera_id,
            level: EscalationLevel::Kill,
        })
    }

    /// 管道自行结束时把 `Running` 转为终态
    fn watch_exit(&self, mut monitor: UnitMonitor, launch: u64) {
        let state = self.state.clone();
        let launches = self.launches.clone();
        let camera_id = self.spec.id;

        tokio::spawn(async move {
            monitor.wait_exited().await;

            let signal = monitor.signal();
            let mut state = state.write();
            if *state != WorkerState::Running || launches.load(Ordering::SeqCst) != launch {
                return;
            }

            match signal {
                PipelineSignal::Failed(message) => {
                    *state = WorkerState::Failed;
                    error!(camera_id = %camera_id, error = %message, "Camera worker exited unexpectedly");
                }
                _ => {
                    *state = WorkerState::Stopped;
                    info!(camera_id = %camera_id, "Camera pipeline finished");
                }
            }
        });
    }

    fn set_state(&self, next: WorkerState) {
        let mut state = self.state.write();
        let previous = *state;
        if previous != next {
            debug!(camera_id = %self.spec.id, from = %previous, to = %next, "Worker state changed");
            *state = next;
        }
    }

    fn settle_stopped(&self) {
        let mut state = self.state.write();
        if matches!(
            *state,
            WorkerState::Starting | WorkerState::Running | WorkerState::Stopping
        ) {
            *state = WorkerState::Stopped;
        }
    }

    fn reset_rate(&self) {
        let mut rate = self.rate.lock();
        rate.at = Instant::now();
        rate.frames = self.counters.frames();
        rate.fps = 0.0;
    }
}
