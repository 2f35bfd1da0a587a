use crate::geometry::{CrossingDirection, CrossingEvent, EntrySide, LineConfig, LineSegment, Point};

/// 线穿越检测器
///
/// 无状态：每次调用只比较两个位置相对于线段的带符号面积。
/// 任一位置恰好在线上（面积为 0）都不算穿越，避免擦线轨迹被重复计数。
#[derive(Debug, Clone, Default)]
pub struct LineCrossingDetector {
    line: Option<LineSegment>,
    entry_side: EntrySide,
}

impl LineCrossingDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &LineConfig) -> Self {
        let mut detector = Self::new();
        detector.set_line(config.start, config.end);
        detector.set_direction(config.entry_side);
        detector
    }

    pub fn set_line(&mut self, start: Point, end: Point) {
        self.line = Some(LineSegment::new(start, end));
    }

    pub fn clear_line(&mut self) {
        self.line = None;
    }

    pub fn set_direction(&mut self, entry_side: EntrySide) {
        self.entry_side = entry_side;
    }

    pub fn has_line(&self) -> bool {
        self.line.is_some()
    }

    pub fn line(&self) -> Option<LineSegment> {
        self.line
    }

    pub fn entry_side(&self) -> EntrySide {
        self.entry_side
    }

    /// 点相对于线的带符号面积，未配置线时为 `None`
    pub fn side(&self, p: Point) -> Option<f64> {
        self.line.map(|line| line.side(p))
    }

    /// 原始穿越方向（不考虑进入侧配置）
    pub fn direction(&self, current: Point, previous: Point) -> Option<CrossingDirection> {
        let line = self.line?;
        let now = line.side(current);
        let before = line.side(previous);

        // 严格变号才算穿越
        if now * before >= 0.0 {
            return None;
        }

        if before < 0.0 {
            Some(CrossingDirection::LeftToRight)
        } else {
            Some(CrossingDirection::RightToLeft)
        }
    }

    /// 判断从 `previous` 移动到 `current` 是否构成进入或离开
    pub fn classify(&self, current: Point, previous: Point) -> Option<CrossingEvent> {
        self.direction(current, previous)
            .map(|direction| self.entry_side.classify(direction))
    }
}
