use crate::error::{EscalationLevel, WorkerError};
use flux_occupancy::{LineConfig, OccupancySnapshot};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 相机 ID（监督器内唯一）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u32);

impl fmt::Display for CameraId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for CameraId {
    fn from(id: u32) -> Self {
        CameraId(id)
    }
}

/// 相机工作单元描述
///
/// `source` 与 `line` 对监督器是不透明的，原样交给分析管道。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraSpec {
    pub id: CameraId,
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub line: LineConfig,
}

impl CameraSpec {
    pub fn new(
        id: impl Into<CameraId>,
        name: impl Into<String>,
        source: impl Into<String>,
        line: LineConfig,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source: source.into(),
            line,
        }
    }
}

/// 工作单元状态机
///
/// `Created -> Starting -> Running -> Stopping -> {Stopped, Failed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Stopped | WorkerState::Failed)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerState::Created => "created",
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
            WorkerState::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// 批量启动方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartMode {
    /// 逐个启动，失败不影响后续相机
    #[default]
    Sequential,
    /// 并发启动，每个相机各自超时
    Parallel,
}

impl fmt::Display for StartMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartMode::Sequential => write!(f, "sequential"),
            StartMode::Parallel => write!(f, "parallel"),
        }
    }
}

/// 单个工作单元的停止结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// 本来就没有运行
    AlreadyStopped,
    /// 协作式停止成功
    Graceful,
    /// 升级到强制终止才退出
    Forced(EscalationLevel),
}

impl StopOutcome {
    pub fn is_forced(&self) -> bool {
        matches!(self, StopOutcome::Forced(_))
    }
}

/// 批量启动结果
#[derive(Debug, Default)]
pub struct StartReport {
    pub started: Vec<CameraId>,
    pub failed: Vec<(CameraId, WorkerError)>,
}

impl StartReport {
    pub fn total(&self) -> usize {
        self.started.len() + self.failed.len()
    }

    pub fn failed_ids(&self) -> Vec<CameraId> {
        self.failed.iter().map(|(id, _)| *id).collect()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// 批量停止结果
///
/// `escalated` 中是 `ForcedTermination`，只做报告，不算失败。
#[derive(Debug, Default)]
pub struct StopReport {
    pub stopped: Vec<CameraId>,
    pub escalated: Vec<WorkerError>,
    pub failed: Vec<(CameraId, WorkerError)>,
}

impl StopReport {
    pub fn is_clean(&self) -> bool {
        self.escalated.is_empty() && self.failed.is_empty()
    }
}

/// 单相机摘要
#[derive(Debug, Clone, Serialize)]
pub struct CameraSummary {
    pub id: CameraId,
    pub name: String,
    pub state: WorkerState,
    pub alive: bool,
    pub stats: OccupancySnapshot,
    pub frames: u64,
    pub fps: f64,
}

/// 整个相机组的摘要
#[derive(Debug, Clone, Default, Serialize)]
pub struct FleetSummary {
    pub total: usize,
    pub running: usize,
    pub stopped: usize,
    pub cameras: Vec<CameraSummary>,
}
