use crate::counter::OccupancyCounter;
use crate::detector::LineCrossingDetector;
use crate::geometry::{CrossingEvent, LineConfig, Point};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// 跟踪器分配的目标 ID（在单个相机内稳定）
pub type ObjectId = u64;

/// 跟踪器每帧输出的一个目标位置
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ObjectSample {
    pub id: ObjectId,
    pub x: f64,
    pub y: f64,
    #[serde(default = "default_person")]
    pub person: bool,
}

fn default_person() -> bool {
    true
}

impl ObjectSample {
    pub fn person(id: ObjectId, x: f64, y: f64) -> Self {
        Self {
            id,
            x,
            y,
            person: true,
        }
    }

    pub fn position(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    /// 只统计行人
    pub person_only: bool,

    /// 每隔多少帧输出一次计数日志（0 = 不输出）
    pub log_every_frames: u64,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            person_only: true,
            log_every_frames: 30,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct TrackedObject {
    /// 最近一次观测到的位置
    last: Point,
    /// 最近一次不在线上的位置，穿越判断以它为起点
    anchor: Option<Point>,
}

/// 单相机的穿越跟踪状态
///
/// 持有目标 ID 到位置的映射、检测器以及共享计数器。
/// 只能由一个计数路径（相机的回调线程或 IPC 读取任务）写入。
pub struct CrossingTracker {
    label: String,
    detector: LineCrossingDetector,
    counter: Arc<OccupancyCounter>,
    objects: HashMap<ObjectId, TrackedObject>,
    options: TrackerOptions,
    frames: u64,
}

impl CrossingTracker {
    pub fn new(
        label: impl Into<String>,
        line: &LineConfig,
        counter: Arc<OccupancyCounter>,
        options: TrackerOptions,
    ) -> Self {
        let label = label.into();
        info!(
            camera = %label,
            start = ?line.start,
            end = ?line.end,
            entry_side = %line.entry_side,
            "Line crossing tracker initialized"
        );

        Self {
            label,
            detector: LineCrossingDetector::from_config(line),
            counter,
            objects: HashMap::new(),
            options,
            frames: 0,
        }
    }

    /// 处理一个目标位置
    ///
    /// 首次出现只记录位置。之后用最近一次不在线上的位置与当前位置比较，
    /// 这样在线上停留一帧再继续穿过的轨迹仍然只计一次。
    pub fn observe(&mut self, sample: &ObjectSample) -> Option<CrossingEvent> {
        if self.options.person_only && !sample.person {
            return None;
        }

        let position = sample.position();
        let on_line = self.detector.side(position) == Some(0.0);

        let event = match self.objects.entry(sample.id) {
            Entry::Vacant(slot) => {
                slot.insert(TrackedObject {
                    last: position,
                    anchor: (!on_line).then_some(position),
                });
                return None;
            }
            Entry::Occupied(mut slot) => {
                let tracked = slot.get_mut();
                let event = tracked
                    .anchor
                    .and_then(|anchor| self.detector.classify(position, anchor));

                tracked.last = position;
                if !on_line {
                    tracked.anchor = Some(position);
                }
                event
            }
        };

        if let Some(event) = event {
            let counts = self.counter.update(event);
            info!(
                camera = %self.label,
                object_id = sample.id,
                event = %event,
                entries = counts.entries,
                exits = counts.exits,
                occupancy = counts.occupancy,
                "Line crossing detected"
            );
        }

        event
    }

    /// 处理一帧内的所有目标
    pub fn observe_frame(&mut self, samples: &[ObjectSample]) -> Vec<CrossingEvent> {
        let events = samples
            .iter()
            .filter_map(|sample| self.observe(sample))
            .collect();

        self.frames += 1;
        if self.options.log_every_frames > 0 && self.frames % self.options.log_every_frames == 0 {
            let counts = self.counter.snapshot();
            debug!(
                camera = %self.label,
                frames = self.frames,
                entries = counts.entries,
                exits = counts.exits,
                occupancy = counts.occupancy,
                "Counting progress"
            );
        }

        events
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn tracked_objects(&self) -> usize {
        self.objects.len()
    }

    /// 目标最近一次观测到的位置
    pub fn last_position(&self, id: ObjectId) -> Option<Point> {
        self.objects.get(&id).map(|tracked| tracked.last)
    }

    pub fn counter(&self) -> &Arc<OccupancyCounter> {
        &self.counter
    }
}
