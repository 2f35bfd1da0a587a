//! 进程内分析管道的接口
//!
//! 视频采集、推理和跟踪都在管道里完成，这里只定义它与工作单元之间的约定：
//! 管道通过 [`PipelineContext`] 报告就绪、提交每帧的目标位置，并轮询停止请求。

pub mod replay;

pub use replay::{RecordedFrame, ReplayFactory, ReplayPipeline, ReplaySource};

use crate::types::CameraSpec;
use crate::unit::UnitLifecycle;
use flux_occupancy::{CrossingEvent, CrossingTracker, LineConfig, ObjectSample};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

/// 管道报告的错误
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct PipelineFailure {
    pub message: String,
}

impl PipelineFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for PipelineFailure {
    fn from(e: std::io::Error) -> Self {
        PipelineFailure::new(e.to_string())
    }
}

/// 一个相机的分析管道（阻塞执行）
pub trait AnalyticsPipeline: Send {
    /// 运行直到结束或收到停止请求
    ///
    /// 初始化完成后必须调用 [`PipelineContext::notify_started`]。
    fn run(&mut self, ctx: &mut PipelineContext) -> Result<(), PipelineFailure>;
}

/// 每次启动都会创建一个新的管道实例
pub trait PipelineFactory: Send + Sync {
    fn create(&self, camera: &CameraSpec) -> Result<Box<dyn AnalyticsPipeline>, PipelineFailure>;
}

impl<F> PipelineFactory for F
where
    F: Fn(&CameraSpec) -> Result<Box<dyn AnalyticsPipeline>, PipelineFailure> + Send + Sync,
{
    fn create(&self, camera: &CameraSpec) -> Result<Box<dyn AnalyticsPipeline>, PipelineFailure> {
        self(camera)
    }
}

/// 停止与中止标志，由工作单元写、管道读
#[derive(Debug, Default)]
pub(crate) struct PipelineControl {
    stop: AtomicBool,
    abort: AtomicBool,
}

impl PipelineControl {
    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub(crate) fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }
}

/// 管道与工作单元之间的上下文
pub struct PipelineContext {
    camera: CameraSpec,
    control: Arc<PipelineControl>,
    lifecycle: Arc<UnitLifecycle>,
    tracker: CrossingTracker,
    frames: Arc<AtomicU64>,
}

impl PipelineContext {
    pub(crate) fn new(
        camera: CameraSpec,
        control: Arc<PipelineControl>,
        lifecycle: Arc<UnitLifecycle>,
        tracker: CrossingTracker,
        frames: Arc<AtomicU64>,
    ) -> Self {
        Self {
            camera,
            control,
            lifecycle,
            tracker,
            frames,
        }
    }

    pub fn camera(&self) -> &CameraSpec {
        &self.camera
    }

    pub fn line(&self) -> &LineConfig {
        &self.camera.line
    }

    /// 报告初始化完成，释放等待中的 `start`
    pub fn notify_started(&self) {
        self.lifecycle.started();
    }

    /// 提交一帧的目标位置，返回本帧产生的穿越事件
    pub fn publish_frame(&mut self, samples: &[ObjectSample]) -> Vec<CrossingEvent> {
        let events = self.tracker.observe_frame(samples);
        self.frames.fetch_add(1, Ordering::Relaxed);
        events
    }

    /// 收到停止或中止请求
    pub fn should_stop(&self) -> bool {
        self.control.stop.load(Ordering::SeqCst) || self.should_abort()
    }

    /// 收到中止请求，管道应立即放弃当前工作
    pub fn should_abort(&self) -> bool {
        self.control.abort.load(Ordering::SeqCst)
    }

    /// 分片睡眠，期间收到停止请求立即返回 `false`
    pub fn sleep_unless_stopped(&self, duration: Duration) -> bool {
        const SLICE: Duration = Duration::from_millis(10);

        let deadline = Instant::now() + duration;
        loop {
            if self.should_stop() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep(SLICE.min(deadline - now));
        }
    }

    pub(crate) fn lifecycle(&self) -> &Arc<UnitLifecycle> {
        &self.lifecycle
    }
}
