use crate::resource::{ResourceError, ResourceManager};
use crate::signal::{ShutdownSignal, SignalHandler};
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{error, info, warn};

/// 关闭阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Cleaning,
    Complete,
}

/// 一次关闭的结果
#[derive(Debug)]
pub struct ShutdownReport {
    pub signal: ShutdownSignal,
    pub phase: ShutdownPhase,
    pub elapsed: Duration,
    pub failures: Vec<(String, ResourceError)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.phase == ShutdownPhase::Complete && self.failures.is_empty()
    }
}

/// 关闭协调器
///
/// 等待关闭信号，然后在 `shutdown_timeout` 内按优先级清理已注册的资源。
pub struct ShutdownCoordinator {
    signal_handler: SignalHandler,
    resource_manager: ResourceManager,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn builder() -> ShutdownCoordinatorBuilder {
        ShutdownCoordinatorBuilder::new()
    }

    /// 等待关闭信号并执行关闭
    pub async fn run(self) -> ShutdownReport {
        info!("Shutdown coordinator started, waiting for signal");
        let signal = self.signal_handler.wait().await;
        self.shutdown(signal).await
    }

    /// 立即执行关闭
    pub async fn shutdown(mut self, signal: ShutdownSignal) -> ShutdownReport {
        info!(signal = ?signal, "Shutting down");
        let start = Instant::now();

        let cleanup = timeout(self.shutdown_timeout, self.resource_manager.cleanup_all()).await;
        let (phase, failures) = match cleanup {
            Ok(failures) => (ShutdownPhase::Complete, failures),
            Err(_) => {
                error!(timeout = ?self.shutdown_timeout, "Resource cleanup timed out");
                (
                    ShutdownPhase::Cleaning,
                    vec![(
                        "shutdown".to_string(),
                        ResourceError::Timeout(format!("{:?}", self.shutdown_timeout)),
                    )],
                )
            }
        };

        let elapsed = start.elapsed();
        if failures.is_empty() {
            info!(elapsed = ?elapsed, "Graceful shutdown complete");
        } else {
            warn!(elapsed = ?elapsed, failures = failures.len(), "Shutdown finished with failures");
        }

        ShutdownReport {
            signal,
            phase,
            elapsed,
            failures,
        }
    }

    pub fn signal_handler(&self) -> &SignalHandler {
        &self.signal_handler
    }
}

/// 关闭协调器构建器
pub struct ShutdownCoordinatorBuilder {
    signal_handler: Option<SignalHandler>,
    resource_manager: Option<ResourceManager>,
    shutdown_timeout: Duration,
}

impl ShutdownCoordinatorBuilder {
    pub fn new() -> Self {
        Self {
            signal_handler: None,
            resource_manager: None,
            shutdown_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_signal_handler(mut self, handler: SignalHandler) -> Self {
        self.signal_handler = Some(handler);
        self
    }

    pub fn with_resource_manager(mut self, manager: ResourceManager) -> Self {
        self.resource_manager = Some(manager);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn build(self) -> ShutdownCoordinator {
        ShutdownCoordinator {
            signal_handler: self.signal_handler.unwrap_or_default(),
            resource_manager: self.resource_manager.unwrap_or_default(),
            shutdown_timeout: self.shutdown_timeout,
        }
    }
}

impl Default for ShutdownCoordinatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
