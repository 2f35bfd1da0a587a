use crate::types::CameraId;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// 停止升级级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EscalationLevel {
    /// 协作式停止请求
    Cooperative,
    /// 强制终止信号（SIGTERM / 中止标志）
    Terminate,
    /// 无条件杀死
    Kill,
}

impl fmt::Display for EscalationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EscalationLevel::Cooperative => write!(f, "cooperative"),
            EscalationLevel::Terminate => write!(f, "terminate"),
            EscalationLevel::Kill => write!(f, "kill"),
        }
    }
}

/// 单个相机工作单元的错误
#[derive(Debug, Error)]
pub enum WorkerError {
    /// 在超时内未收到就绪信号
    #[error("Camera {camera_id} did not signal ready within {timeout:?}")]
    StartTimeout {
        camera_id: CameraId,
        timeout: Duration,
    },

    /// 分析管道报告内部错误
    #[error("Camera {camera_id} pipeline error: {message}")]
    PipelineError { camera_id: CameraId, message: String },

    /// 已经在运行
    #[error("Camera {0} is already running")]
    AlreadyRunning(CameraId),

    /// 已从监督器移除
    #[error("Camera {0} has been removed")]
    Removed(CameraId),

    /// 所有升级步骤之后仍然存活
    #[error("Camera {camera_id} still alive after {level} escalation")]
    StopTimeout {
        camera_id: CameraId,
        level: EscalationLevel,
    },

    /// 需要强制终止才停下（报告用，非致命）
    #[error("Camera {camera_id} required forced termination ({level})")]
    ForcedTermination {
        camera_id: CameraId,
        level: EscalationLevel,
    },

    /// 无法创建线程或子进程
    #[error("Failed to spawn execution unit for camera {camera_id}: {source}")]
    Spawn {
        camera_id: CameraId,
        #[source]
        source: std::io::Error,
    },

    /// 协调任务异常退出
    #[error("Camera {camera_id} coordination task failed: {message}")]
    TaskFailed { camera_id: CameraId, message: String },

    #[error("Execution unit I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn pipeline(camera_id: CameraId, message: impl Into<String>) -> Self {
        WorkerError::PipelineError {
            camera_id,
            message: message.into(),
        }
    }
}

/// 监督器错误
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("Camera capacity exceeded (max {max})")]
    CapacityExceeded { max: usize },

    #[error("Camera already exists: {0}")]
    DuplicateCamera(CameraId),

    #[error("Camera not found: {0}")]
    NotFound(CameraId),

    #[error("Camera {0} is still running, stop it first")]
    StillRunning(CameraId),

    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config load error: {0}")]
    Load(#[from] config::ConfigError),

    #[error("Invalid config path: {0}")]
    InvalidPath(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
