use crate::error::ConfigError;
use crate::supervisor::SupervisorConfig;
use crate::types::{CameraId, CameraSpec, StartMode};
use crate::worker::EscalationPolicy;
use config::{Config, Environment, File, FileFormat};
use flux_occupancy::{LineConfig, TrackerOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// 环境变量前缀，例如 `FLUX_CAMERA__SUPERVISOR__MAX_CAMERAS=32`
pub const ENV_PREFIX: &str = "FLUX_CAMERA";

/// 相机组配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConfig {
    pub supervisor: SupervisorSection,
    pub escalation: EscalationConfig,
    pub backend: BackendConfig,
    pub counting: CountingConfig,
    pub logging: LoggingConfig,
    /// 本地计数线覆盖目录（`camera_<id>_line.json`）
    pub line_overrides_dir: Option<PathBuf>,
    pub cameras: Vec<CameraConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSection {
    pub max_cameras: usize,
    pub start_mode: StartMode,
    pub start_timeout_ms: u64,
    /// 并发启动上限（0 = 不限制）
    ///
    /// 排队等待的相机不计入它自己的启动超时，限流时最后一个相机的结果
    /// 最迟在前面各相机的超时与清理时间之和之后才出来。
    pub max_parallel_starts: usize,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            max_cameras: 16,
            start_mode: StartMode::Sequential,
            start_timeout_ms: 30_000,
            max_parallel_starts: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    pub stop_timeout_ms: u64,
    pub terminate_grace_ms: u64,
    pub kill_wait_ms: u64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 8_000,
            terminate_grace_ms: 2_000,
            kill_wait_ms: 2_000,
        }
    }
}

impl EscalationConfig {
    pub fn policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            stop_timeout: Duration::from_millis(self.stop_timeout_ms),
            terminate_grace: Duration::from_millis(self.terminate_grace_ms),
            kill_wait: Duration::from_millis(self.kill_wait_ms),
        }
    }
}

/// 执行单元后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// 同进程线程
    #[default]
    Thread,
    /// 独立子进程
    Process,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// 子进程程序，缺省为当前可执行文件
    pub program: Option<PathBuf>,
    /// 子进程程序参数，缺省为 `["pipeline"]`
    pub args: Option<Vec<String>>,
    /// 内置回放管道的帧率
    pub replay_fps: f64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Thread,
            program: None,
            args: None,
            replay_fps: 25.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CountingConfig {
    pub person_only: bool,
    pub log_every_frames: u64,
}

impl Default for CountingConfig {
    fn default() -> Self {
        Self {
            person_only: true,
            log_every_frames: 30,
        }
    }
}

impl CountingConfig {
    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            person_only: self.person_only,
            log_every_frames: self.log_every_frames,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `pretty` 或 `json`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// 单个相机的配置项
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    pub id: CameraId,
    #[serde(default)]
    pub name: String,
    pub source: String,
    #[serde(default)]
    pub line: LineConfig,
}

impl CameraConfig {
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("camera_{}", self.id)
        } else {
            self.name.clone()
        }
    }
}

impl FleetConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.supervisor.max_cameras == 0 {
            return Err(ConfigError::Validation(
                "supervisor.max_cameras must be greater than 0".to_string(),
            ));
        }

        if self.supervisor.start_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "supervisor.start_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.escalation.stop_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "escalation.stop_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if !self.backend.replay_fps.is_finite() || self.backend.replay_fps < 0.0 {
            return Err(ConfigError::Validation(format!(
                "backend.replay_fps must be a finite non-negative number, got {}",
                self.backend.replay_fps
            )));
        }

        if self.backend.kind == BackendKind::Process {
            if let Some(program) = &self.backend.program {
                if program.as_os_str().is_empty() {
                    return Err(ConfigError::Validation(
                        "backend.program must not be empty".to_string(),
                    ));
                }
            }
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            if !seen.insert(camera.id) {
                return Err(ConfigError::Validation(format!(
                    "duplicate camera id {}",
                    camera.id
                )));
            }
        }

        match self.logging.format.as_str() {
            "pretty" | "json" => Ok(()),
            other => Err(ConfigError::Validation(format!(
                "logging.format must be \"pretty\" or \"json\", got \"{}\"",
                other
            ))),
        }
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.supervisor.start_timeout_ms)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            max_cameras: self.supervisor.max_cameras,
            start_timeout: self.start_timeout(),
            max_parallel_starts: self.supervisor.max_parallel_starts,
            escalation: self.escalation.policy(),
            counting: self.counting.tracker_options(),
        }
    }

    /// 相机的计数线，本地覆盖文件优先
    pub fn resolve_line(&self, camera: &CameraConfig) -> LineConfig {
        let Some(dir) = &self.line_overrides_dir else {
            return camera.line;
        };

        let path = dir.join(format!("camera_{}_line.json", camera.id));
        if !path.exists() {
            return camera.line;
        }

        match std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| LineConfig::from_json(&raw).map_err(|e| e.to_string()))
        {
            Ok(line) => {
                info!(camera_id = %camera.id, path = %path.display(), "Using local line override");
                line
            }
            Err(e) => {
                warn!(
                    camera_id = %camera.id,
                    path = %path.display(),
                    error = %e,
                    "Ignoring unreadable line override"
                );
                camera.line
            }
        }
    }

    pub fn camera_specs(&self) -> Vec<CameraSpec> {
        self.cameras
            .iter()
            .map(|camera| {
                CameraSpec::new(
                    camera.id,
                    camera.display_name(),
                    camera.source.clone(),
                    self.resolve_line(camera),
                )
            })
            .collect()
    }
}

/// 配置加载器
pub struct ConfigLoader {
    path: PathBuf,
    use_env: bool,
}

impl ConfigLoader {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            use_env: true,
        }
    }

    /// 不读取环境变量覆盖
    pub fn without_env(mut self) -> Self {
        self.use_env = false;
        self
    }

    /// 加载并校验配置，文件不存在时使用默认配置
    pub fn load(&self) -> Result<FleetConfig, ConfigError> {
        let mut builder = Config::builder();

        if self.path.exists() {
            let path = self
                .path
                .to_str()
                .ok_or_else(|| ConfigError::InvalidPath(self.path.display().to_string()))?;
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        }

        if self.use_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: FleetConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }
}
