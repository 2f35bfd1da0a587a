use crate::error::{Result, SupervisorError, WorkerError};
use crate::types::{
    CameraId, CameraSpec, CameraSummary, FleetSummary, StartMode, StartReport, StopOutcome,
    StopReport, WorkerState,
};
use crate::unit::UnitFactory;
use crate::worker::{CameraWorker, EscalationPolicy};
use async_trait::async_trait;
use flux_occupancy::{OccupancySnapshot, TrackerOptions};
use flux_shutdown::{Resource, ResourceError};
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, error, info, warn};

/// 监督器配置
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// 最大相机数量
    pub max_cameras: usize,
    /// 单个相机的启动超时
    pub start_timeout: Duration,
    /// 并发启动上限（0 = 不限制）
    ///
    /// 每个相机的 `start_timeout` 从拿到许可时开始计算，排队时间不计入。
    /// 卡住的相机会占着许可直到超时和清理结束，排在后面的相机因此晚一些才有结果。
    pub max_parallel_starts: usize,
    pub escalation: EscalationPolicy,
    pub counting: TrackerOptions,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_cameras: 16,
            start_timeout: Duration::from_secs(30),
            max_parallel_starts: 0,
            escalation: EscalationPolicy::default(),
            counting: TrackerOptions::default(),
        }
    }
}

/// 相机工作单元监督器
///
/// 持有所有相机，负责容量控制、批量启动/停止以及统计汇总。
/// 克隆得到的是同一个监督器的句柄。
#[derive(Clone)]
pub struct WorkerSupervisor {
    workers: Arc<RwLock<BTreeMap<CameraId, Arc<CameraWorker>>>>,
    config: Arc<SupervisorConfig>,
    units: Arc<dyn UnitFactory>,
}

impl WorkerSupervisor {
    pub fn new(config: SupervisorConfig, units: impl UnitFactory + 'static) -> Self {
        Self::with_factory(config, Arc::new(units))
    }

    pub fn with_factory(config: SupervisorConfig, units: Arc<dyn UnitFactory>) -> Self {
        Self {
            workers: Arc::new(RwLock::new(BTreeMap::new())),
            config: Arc::new(config),
            units,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// 注册相机
    pub async fn add_camera(&self, spec: CameraSpec) -> Result<()> {
        let mut workers = self.workers.write().await;

        if workers.len() >= self.config.max_cameras {
            warn!(
                camera_id = %spec.id,
                max = self.config.max_cameras,
                "Camera capacity exceeded"
            );
            return Err(SupervisorError::CapacityExceeded {
                max: self.config.max_cameras,
            });
        }

        if workers.contains_key(&spec.id) {
            return Err(SupervisorError::DuplicateCamera(spec.id));
        }

        info!(
            camera_id = %spec.id,
            name = %spec.name,
            source = %spec.source,
            "Camera registered"
        );

        let id = spec.id;
        let worker = CameraWorker::new(
            spec,
            self.units.as_ref(),
            self.config.counting.clone(),
            self.config.escalation,
        );
        workers.insert(id, Arc::new(worker));
        Ok(())
    }

    /// 移除相机，运行中或正在启动/停止的相机必须先停止
    ///
    /// 已被批量启动取走但尚未启动的相机在移除后不会再被启动。
    pub async fn remove_camera(&self, id: CameraId) -> Result<()> {
        let mut workers = self.workers.write().await;

        let worker = workers.get(&id).ok_or(SupervisorError::NotFound(id))?;
        if !worker.retire() {
            return Err(SupervisorError::StillRunning(id));
        }

        workers.remove(&id);
        info!(camera_id = %id, "Camera removed");
        Ok(())
    }

    pub async fn worker(&self, id: CameraId) -> Option<Arc<CameraWorker>> {
        self.workers.read().await.get(&id).cloned()
    }

    async fn snapshot(&self) -> Vec<Arc<CameraWorker>> {
        self.workers.read().await.values().cloned().collect()
    }

    /// 启动单个相机
    pub async fn start_camera(&self, id: CameraId) -> Result<()> {
        let worker = self.worker(id).await.ok_or(SupervisorError::NotFound(id))?;
        match worker.start(self.config.start_timeout).await {
            Ok(()) => Ok(()),
            Err(WorkerError::Removed(_)) => Err(SupervisorError::NotFound(id)),
            Err(e) => Err(e.into()),
        }
    }

    /// 停止单个相机
    pub async fn stop_camera(&self, id: CameraId, timeout: Duration) -> Result<StopOutcome> {
        let worker = self.worker(id).await.ok_or(SupervisorError::NotFound(id))?;
        Ok(worker.stop(timeout).await?)
    }

    /// 启动全部相机，单个相机失败不影响其它相机
    pub async fn start_all(&self, mode: StartMode) -> StartReport {
        let workers = self.snapshot().await;
        let begin = Instant::now();

        info!(cameras = workers.len(), mode = %mode, "Starting cameras");

        let report = match mode {
            StartMode::Sequential => self.start_sequential(workers).await,
            StartMode::Parallel => self.start_parallel(workers).await,
        };

        if report.is_complete() {
            info!(
                started = report.started.len(),
                elapsed = ?begin.elapsed(),
                "All cameras started"
            );
        } else {
            warn!(
                started = report.started.len(),
                failed = report.failed.len(),
                failed_ids = ?report.failed_ids(),
                elapsed = ?begin.elapsed(),
                "Some cameras failed to start"
            );
        }

        report
    }

    async fn start_sequential(&self, workers: Vec<Arc<CameraWorker>>) -> StartReport {
        let mut report = StartReport::default();

        for worker in workers {
            let result = worker.start(self.config.start_timeout).await;
            record_start(&mut report, worker.id(), result);
        }

        report
    }

    async fn start_parallel(&self, workers: Vec<Arc<CameraWorker>>) -> StartReport {
        let limit = match self.config.max_parallel_starts {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        };
        let timeout = self.config.start_timeout;

        let tasks: Vec<_> = workers
            .into_iter()
            .map(|worker| {
                let id = worker.id();
                let limit = limit.clone();
                let handle = tokio::spawn(async move {
                    let _permit = match limit {
                        Some(limit) => Some(limit.acquire_owned().await.map_err(|e| {
                            WorkerError::TaskFailed {
                                camera_id: worker.id(),
                                message: e.to_string(),
                            }
                        })?),
                        None => None,
                    };
                    worker.start(timeout).await
                });
                (id, handle)
            })
            .collect();

        let (ids, handles): (Vec<_>, Vec<_>) = tasks.into_iter().unzip();
        let results = join_all(handles).await;

        let mut report = StartReport::default();
        for (id, joined) in ids.into_iter().zip(results) {
            let result = joined.unwrap_or_else(|e| {
                Err(WorkerError::TaskFailed {
                    camera_id: id,
                    message: e.to_string(),
                })
            });
            record_start(&mut report, id, result);
        }

        report
    }

    /// 并发停止全部相机，收集每个相机的结果
    pub async fn stop_all(&self) -> StopReport {
        let workers = self.snapshot().await;
        let timeout = self.config.escalation.stop_timeout;

        info!(cameras = workers.len(), timeout = ?timeout, "Stopping cameras");

        let (ids, handles): (Vec<_>, Vec<_>) = workers
            .into_iter()
            .map(|worker| {
                let id = worker.id();
                (id, tokio::spawn(async move { worker.stop(timeout).await }))
            })
            .unzip();
        let results = join_all(handles).await;

        let mut report = StopReport::default();
        for (id, joined) in ids.into_iter().zip(results) {
            let result = joined.unwrap_or_else(|e| {
                Err(WorkerError::TaskFailed {
                    camera_id: id,
                    message: e.to_string(),
                })
            });

            match result {
                Ok(StopOutcome::Forced(level)) => {
                    report.stopped.push(id);
                    report.escalated.push(WorkerError::ForcedTermination {
                        camera_id: id,
                        level,
                    });
                }
                Ok(_) => report.stopped.push(id),
                Err(e) => {
                    error!(camera_id = %id, error = %e, "Failed to stop camera");
                    report.failed.push((id, e));
                }
            }
        }

        if report.is_clean() {
            info!(stopped = report.stopped.len(), "All cameras stopped");
        } else {
            warn!(
                stopped = report.stopped.len(),
                escalated = report.escalated.len(),
                failed = report.failed.len(),
                "Cameras stopped with escalation or failures"
            );
        }

        report
    }

    /// 每个相机的计数快照
    pub async fn all_stats(&self) -> BTreeMap<CameraId, OccupancySnapshot> {
        self.workers
            .read()
            .await
            .iter()
            .map(|(id, worker)| (*id, worker.stats()))
            .collect()
    }

    /// 执行单元存活的相机
    pub async fn running_camera_ids(&self) -> BTreeSet<CameraId> {
        self.workers
            .read()
            .await
            .iter()
            .filter(|(_, worker)| worker.is_alive())
            .map(|(id, _)| *id)
            .collect()
    }

    /// 单个相机的计数快照，未知相机返回全零
    pub async fn camera_stats(&self, id: CameraId) -> OccupancySnapshot {
        self.worker(id)
            .await
            .map(|worker| worker.stats())
            .unwrap_or_default()
    }

    pub async fn camera_state(&self, id: CameraId) -> Option<WorkerState> {
        self.worker(id).await.map(|worker| worker.state())
    }

    pub async fn camera_count(&self) -> usize {
        self.workers.read().await.len()
    }

    pub async fn summary(&self) -> FleetSummary {
        let workers = self.snapshot().await;

        let cameras: Vec<CameraSummary> = workers
            .iter()
            .map(|worker| CameraSummary {
                id: worker.id(),
                name: worker.name().to_string(),
                state: worker.state(),
                alive: worker.is_alive(),
                stats: worker.stats(),
                frames: worker.frames_processed(),
                fps: worker.fps(),
            })
            .collect();

        FleetSummary {
            total: cameras.len(),
            running: cameras.iter().filter(|c| c.alive).count(),
            stopped: cameras.iter().filter(|c| !c.alive).count(),
            cameras,
        }
    }

    /// 等待所有执行单元退出（相机全部自行结束时返回）
    pub async fn wait_all_exited(&self) {
        let workers = self.snapshot().await;
        join_all(workers.iter().map(|worker| worker.wait_exited())).await;
        debug!(cameras = workers.len(), "All execution units exited");
    }
}

fn record_start(
    report: &mut StartReport,
    id: CameraId,
    result: std::result::Result<(), WorkerError>,
) {
    match result {
        Ok(()) => report.started.push(id),
        Err(WorkerError::AlreadyRunning(_)) => {
            debug!(camera_id = %id, "Camera already running");
            report.started.push(id);
        }
        Err(WorkerError::Removed(_)) => {
            debug!(camera_id = %id, "Camera removed before it was started, skipping");
        }
        Err(e) => {
            error!(camera_id = %id, error = %e, "Camera failed to start");
            report.failed.push((id, e));
        }
    }
}

#[async_trait]
impl Resource for WorkerSupervisor {
    async fn cleanup(&self) -> std::result::Result<(), ResourceError> {
        let report = self.stop_all().await;

        if report.failed.is_empty() {
            Ok(())
        } else {
            let ids: Vec<String> = report
                .failed
                .iter()
                .map(|(id, _)| id.to_string())
                .collect();
            Err(ResourceError::CleanupFailed(format!(
                "cameras still alive: {}",
                ids.join(", ")
            )))
        }
    }

    fn name(&self) -> &str {
        "camera-supervisor"
    }

    fn priority(&self) -> u32 {
        10
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{AnalyticsPipeline, PipelineContext, PipelineFailure};
    use crate::unit::ThreadBackend;
    use flux_occupancy::LineConfig;

    struct Idle;

    impl AnalyticsPipeline for Idle {
        fn run(&mut self, ctx: &mut PipelineContext) -> std::result::Result<(), PipelineFailure> {
            ctx.notify_started();
            while ctx.sleep_unless_stopped(Duration::from_millis(5)) {}
            Ok(())
        }
    }

    fn supervisor(max_cameras: usize) -> WorkerSupervisor {
        let backend = ThreadBackend::new(
            |_: &CameraSpec| -> std::result::Result<Box<dyn AnalyticsPipeline>, PipelineFailure> {
                Ok(Box::new(Idle))
            },
        );
        WorkerSupervisor::new(
            SupervisorConfig {
                max_cameras,
                start_timeout: Duration::from_secs(2),
                ..Default::default()
            },
            backend,
        )
    }

    fn camera(id: u32) -> CameraSpec {
        CameraSpec::new(id, format!("cam{}", id), "test://", LineConfig::default())
    }

    #[tokio::test]
    async fn test_capacity_and_duplicates() {
        let supervisor = supervisor(2);

        supervisor.add_camera(camera(1)).await.unwrap();
        assert!(matches!(
            supervisor.add_camera(camera(1)).await,
            Err(SupervisorError::DuplicateCamera(CameraId(1)))
        ));
        supervisor.add_camera(camera(2)).await.unwrap();
        assert!(matches!(
            supervisor.add_camera(camera(3)).await,
            Err(SupervisorError::CapacityExceeded { max: 2 })
        ));
        assert_eq!(supervisor.camera_count().await, 2);
    }

    #[tokio::test]
    async fn test_unknown_camera() {
        let supervisor = supervisor(4);

        assert!(matches!(
            supervisor.remove_camera(CameraId(9)).await,
            Err(SupervisorError::NotFound(CameraId(9)))
        ));
        assert!(matches!(
            supervisor.start_camera(CameraId(9)).await,
            Err(SupervisorError::NotFound(_))
        ));
        assert_eq!(
            supervisor.camera_stats(CameraId(9)).await,
            OccupancySnapshot::default()
        );
        assert_eq!(supervisor.camera_state(CameraId(9)).await, None);
    }

    #[tokio::test]
    async fn test_single_camera_control() {
        let supervisor = supervisor(4);
        supervisor.add_camera(camera(1)).await.unwrap();
        assert_eq!(
            supervisor.camera_state(CameraId(1)).await,
            Some(WorkerState::Created)
        );

        supervisor.start_camera(CameraId(1)).await.unwrap();
        assert_eq!(
            supervisor.running_camera_ids().await,
            BTreeSet::from([CameraId(1)])
        );

        let outcome = supervisor
            .stop_camera(CameraId(1), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(outcome, StopOutcome::Graceful);
        assert!(supervisor.running_camera_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_stops_everything() {
        let supervisor = supervisor(4);
        supervisor.add_camera(camera(1)).await.unwrap();
        supervisor.add_camera(camera(2)).await.unwrap();

        let report = supervisor.start_all(StartMode::Parallel).await;
        assert_eq!(report.started.len(), 2);

        supervisor.cleanup().await.unwrap();
        assert!(supervisor.running_camera_ids().await.is_empty());

        let summary = supervisor.summary().await;
        assert_eq!(summary.total, 2);
        assert_eq!(summary.stopped, 2);
    }
}
