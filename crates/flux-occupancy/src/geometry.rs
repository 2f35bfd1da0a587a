use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LineConfigError {
    #[error("Unknown entry side: {0}")]
    UnknownEntrySide(String),

    #[error("Invalid line config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// 二维点（图像坐标）
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[f64; 2]")]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

impl From<[f64; 2]> for Point {
    fn from([x, y]: [f64; 2]) -> Self {
        Self { x, y }
    }
}

impl From<Point> for [f64; 2] {
    fn from(p: Point) -> Self {
        [p.x, p.y]
    }
}

impl From<(f64, f64)> for Point {
    fn from((x, y): (f64, f64)) -> Self {
        Self { x, y }
    }
}

/// 计数线段，`start -> end` 的方向决定左右两侧
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineSegment {
    pub start: Point,
    pub end: Point,
}

impl LineSegment {
    pub fn new(start: Point, end: Point) -> Self {
        Self { start, end }
    }

    /// 带符号面积（二维叉积）：`Lx*(Py - Sy) - Ly*(Px - Sx)`
    ///
    /// 为 0 表示点恰好在线上。线段退化为一个点时恒为 0。
    pub fn side(&self, p: Point) -> f64 {
        let lx = self.end.x - self.start.x;
        let ly = self.end.y - self.start.y;
        lx * (p.y - self.start.y) - ly * (p.x - self.start.x)
    }

    pub fn is_degenerate(&self) -> bool {
        self.start == self.end
    }
}

/// 哪一种穿越方向算作"进入"
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntrySide {
    /// 从负侧穿到正侧（`LeftToRight`）为进入
    #[default]
    #[serde(alias = "izquierda")]
    Left,
    /// 从正侧穿到负侧（`RightToLeft`）为进入
    #[serde(alias = "derecha")]
    Right,
}

impl EntrySide {
    /// 把原始穿越方向映射为进入/离开
    pub fn classify(self, direction: CrossingDirection) -> CrossingEvent {
        match (self, direction) {
            (EntrySide::Left, CrossingDirection::LeftToRight)
            | (EntrySide::Right, CrossingDirection::RightToLeft) => CrossingEvent::Entry,
            (EntrySide::Left, CrossingDirection::RightToLeft)
            | (EntrySide::Right, CrossingDirection::LeftToRight) => CrossingEvent::Exit,
        }
    }
}

impl FromStr for EntrySide {
    type Err = LineConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" | "izquierda" => Ok(EntrySide::Left),
            "right" | "derecha" => Ok(EntrySide::Right),
            other => Err(LineConfigError::UnknownEntrySide(other.to_string())),
        }
    }
}

impl fmt::Display for EntrySide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntrySide::Left => write!(f, "left"),
            EntrySide::Right => write!(f, "right"),
        }
    }
}

/// 原始穿越方向（相对于线段的带符号面积）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrossingDirection {
    /// side(previous) < 0 且 side(current) > 0
    LeftToRight,
    /// side(previous) > 0 且 side(current) < 0
    RightToLeft,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrossingEvent {
    Entry,
    Exit,
}

impl fmt::Display for CrossingEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CrossingEvent::Entry => write!(f, "entry"),
            CrossingEvent::Exit => write!(f, "exit"),
        }
    }
}

/// 相机的计数线配置
///
/// JSON 形式：`{"start": [x, y], "end": [x, y], "entry_side": "left"}`
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LineConfig {
    #[serde(default)]
    pub start: Point,
    #[serde(default)]
    pub end: Point,
    #[serde(default, alias = "direccion_entrada")]
    pub entry_side: EntrySide,
}

impl LineConfig {
    pub fn new(start: impl Into<Point>, end: impl Into<Point>, entry_side: EntrySide) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            entry_side,
        }
    }

    pub fn from_json(raw: &str) -> Result<Self, LineConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    pub fn segment(&self) -> LineSegment {
        LineSegment::new(self.start, self.end)
    }

    /// 起点与终点重合的线永远不会产生穿越
    pub fn is_degenerate(&self) -> bool {
        self.segment().is_degenerate()
    }
}
