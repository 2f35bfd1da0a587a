use crate::geometry::CrossingEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// 计数快照（一致的三元组）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OccupancySnapshot {
    pub entries: u64,
    pub exits: u64,
    pub occupancy: u64,
}

/// 单相机的人数计数器
///
/// 写入方只有所属相机的计数路径，读取方可以是任意线程；
/// 三个字段在同一把锁下更新，读取永远不会看到更新到一半的状态。
#[derive(Debug, Default)]
pub struct OccupancyCounter {
    inner: Mutex<OccupancySnapshot>,
}

impl OccupancyCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 应用一次穿越事件，返回更新后的快照
    pub fn update(&self, event: CrossingEvent) -> OccupancySnapshot {
        let mut counts = self.inner.lock();
        match event {
            CrossingEvent::Entry => {
                counts.entries += 1;
                counts.occupancy += 1;
            }
            CrossingEvent::Exit => {
                counts.exits += 1;
                // 遮挡或跟踪丢失造成的多余离开不会让人数变成负数
                counts.occupancy = counts.occupancy.saturating_sub(1);
            }
        }
        *counts
    }

    pub fn snapshot(&self) -> OccupancySnapshot {
        *self.inner.lock()
    }

    pub fn reset(&self) {
        *self.inner.lock() = OccupancySnapshot::default();
    }
}
