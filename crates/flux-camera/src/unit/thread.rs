use super::{ExecutionUnit, UnitContext, UnitFactory, UnitLifecycle, UnitMonitor};
use crate::error::WorkerError;
use crate::pipeline::{PipelineContext, PipelineControl, PipelineFactory};
use async_trait::async_trait;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

/// 同进程线程后端
///
/// 每个相机一个命名线程。线程无法被外部杀死，
/// `kill` 只能放弃句柄，此时工作单元报告 `StopTimeout`。
#[derive(Clone)]
pub struct ThreadBackend {
    pipelines: Arc<dyn PipelineFactory>,
}

impl ThreadBackend {
    pub fn new(pipelines: impl PipelineFactory + 'static) -> Self {
        Self {
            pipelines: Arc::new(pipelines),
        }
    }

    pub fn from_arc(pipelines: Arc<dyn PipelineFactory>) -> Self {
        Self { pipelines }
    }
}

impl UnitFactory for ThreadBackend {
    fn create(&self, ctx: UnitContext) -> Box<dyn ExecutionUnit> {
        Box::new(ThreadUnit {
            ctx,
            pipelines: self.pipelines.clone(),
            control: None,
            handle: None,
        })
    }
}

struct ThreadUnit {
    ctx: UnitContext,
    pipelines: Arc<dyn PipelineFactory>,
    control: Option<Arc<PipelineControl>>,
    handle: Option<JoinHandle<()>>,
}

#[async_trait]
impl ExecutionUnit for ThreadUnit {
    fn backend(&self) -> &'static str {
        "thread"
    }

    async fn launch(&mut self) -> Result<UnitMonitor, WorkerError> {
        let camera_id = self.ctx.spec.id;
        let (lifecycle, monitor) = UnitLifecycle::new(camera_id);
        let control = Arc::new(PipelineControl::default());

        let pipeline_ctx = PipelineContext::new(
            self.ctx.spec.clone(),
            control.clone(),
            lifecycle,
            self.ctx.tracker(),
            self.ctx.counters.frames.clone(),
        );
        let pipelines = self.pipelines.clone();

        let handle = std::thread::Builder::new()
            .name(format!("camera-{}", camera_id))
            .spawn(move || run_pipeline(pipelines, pipeline_ctx))
            .map_err(|source| WorkerError::Spawn { camera_id, source })?;

        self.control = Some(control);
        self.handle = Some(handle);
        Ok(monitor)
    }

    async fn request_stop(&mut self) -> Result<(), WorkerError> {
        if let Some(control) = &self.control {
            control.request_stop();
        }
        Ok(())
    }

    async fn terminate(&mut self) -> Result<(), WorkerError> {
        if let Some(control) = &self.control {
            control.request_abort();
        }
        Ok(())
    }

    async fn kill(&mut self) -> Result<(), WorkerError> {
        if let Some(handle) = self.handle.take() {
            if !handle.is_finished() {
                error!(
                    camera_id = %self.ctx.spec.id,
                    thread = ?handle.thread().name(),
                    "Pipeline thread cannot be killed, detaching it"
                );
            }
        }
        Ok(())
    }

    async fn reap(&mut self) {
        self.control = None;

        let Some(handle) = self.handle.take() else {
            return;
        };

        if !handle.is_finished() {
            warn!(camera_id = %self.ctx.spec.id, "Pipeline thread still running, detaching it");
            return;
        }

        if handle.join().is_err() {
            error!(camera_id = %self.ctx.spec.id, "Pipeline thread panicked");
        }
    }
}

fn run_pipeline(pipelines: Arc<dyn PipelineFactory>, mut ctx: PipelineContext) {
    let camera_id = ctx.camera().id;
    let lifecycle = ctx.lifecycle().clone();

    let result = pipelines
        .create(ctx.camera())
        .and_then(|mut pipeline| pipeline.run(&mut ctx));

    match result {
        Ok(()) => {
            debug!(camera_id = %camera_id, "Pipeline finished");
            lifecycle.finished();
        }
        Err(e) => {
            error!(camera_id = %camera_id, error = %e, "Pipeline failed");
            lifecycle.failed(e.message);
        }
    }

    drop(ctx);
    lifecycle.mark_exited();
}
