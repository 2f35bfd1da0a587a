use super::{AnalyticsPipeline, PipelineContext, PipelineFactory, PipelineFailure};
use crate::types::CameraSpec;
use flux_occupancy::ObjectSample;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// 录制下来的一帧跟踪结果（JSONL 中的一行）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordedFrame {
    #[serde(default)]
    pub objects: Vec<ObjectSample>,
}

/// 逐行读取录制文件，跳过空行
pub struct ReplaySource<R> {
    reader: R,
    line_no: usize,
}

impl ReplaySource<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PipelineFailure> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            PipelineFailure::new(format!("cannot open replay source {}: {}", path.display(), e))
        })?;
        Ok(Self::new(BufReader::new(file)))
    }
}

impl<R: BufRead> ReplaySource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader, line_no: 0 }
    }
}

impl<R: BufRead> Iterator for ReplaySource<R> {
    type Item = Result<RecordedFrame, PipelineFailure>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut line = String::new();
        loop {
            line.clear();
            self.line_no += 1;
            match self.reader.read_line(&mut line) {
                Ok(0) => return None,
                Ok(_) if line.trim().is_empty() => continue,
                Ok(_) => {
                    return Some(serde_json::from_str(line.trim()).map_err(|e| {
                        PipelineFailure::new(format!("bad frame at line {}: {}", self.line_no, e))
                    }))
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }
}

/// 按固定帧率回放录制的跟踪结果，读到文件末尾即结束
pub struct ReplayPipeline {
    source: ReplaySource<BufReader<File>>,
    interval: Duration,
}

impl ReplayPipeline {
    pub fn new(source: ReplaySource<BufReader<File>>, fps: f64) -> Self {
        Self {
            source,
            interval: frame_interval(fps),
        }
    }
}

impl AnalyticsPipeline for ReplayPipeline {
    fn run(&mut self, ctx: &mut PipelineContext) -> Result<(), PipelineFailure> {
        ctx.notify_started();

        let mut frames = 0u64;
        for frame in self.source.by_ref() {
            if ctx.should_stop() {
                break;
            }
            let frame = frame?;
            ctx.publish_frame(&frame.objects);
            frames += 1;

            if !ctx.sleep_unless_stopped(self.interval) {
                break;
            }
        }

        info!(camera_id = %ctx.camera().id, frames, "Replay finished");
        Ok(())
    }
}

/// 以相机的 `source` 作为录制文件路径
#[derive(Debug, Clone)]
pub struct ReplayFactory {
    fps: f64,
}

impl ReplayFactory {
    pub fn new(fps: f64) -> Self {
        Self { fps }
    }
}

impl PipelineFactory for ReplayFactory {
    fn create(&self, camera: &CameraSpec) -> Result<Box<dyn AnalyticsPipeline>, PipelineFailure> {
        let source = ReplaySource::open(&camera.source)?;
        Ok(Box::new(ReplayPipeline::new(source, self.fps)))
    }
}

/// 帧间隔，fps <= 0 或间隔无法表示时不限速
pub fn frame_interval(fps: f64) -> Duration {
    if fps > 0.0 && fps.is_finite() {
        Duration::try_from_secs_f64(1.0 / fps).unwrap_or(Duration::ZERO)
    } else {
        Duration::ZERO
    }
}
