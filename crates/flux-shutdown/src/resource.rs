use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("Cleanup failed: {0}")]
    CleanupFailed(String),

    #[error("Cleanup timed out: {0}")]
    Timeout(String),
}

/// 关闭时需要清理的资源
#[async_trait]
pub trait Resource: Send + Sync {
    /// 清理资源
    async fn cleanup(&self) -> Result<(), ResourceError>;

    /// 资源名称
    fn name(&self) -> &str;

    /// 清理优先级（数字越小越先清理）
    fn priority(&self) -> u32 {
        100
    }
}

/// 资源管理器
pub struct ResourceManager {
    resources: Vec<Arc<dyn Resource>>,
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            resources: Vec::new(),
        }
    }

    /// 注册资源
    pub fn register(&mut self, resource: Arc<dyn Resource>) {
        info!(resource = resource.name(), "Registering resource");
        self.resources.push(resource);
    }

    /// 按优先级清理所有资源，一个资源失败不影响其它资源
    ///
    /// 返回失败的资源名称与错误。
    pub async fn cleanup_all(&mut self) -> Vec<(String, ResourceError)> {
        self.resources.sort_by_key(|r| r.priority());

        info!(count = self.resources.len(), "Cleaning up resources");

        let mut failures = Vec::new();
        for resource in &self.resources {
            match resource.cleanup().await {
                Ok(()) => {
                    info!(resource = resource.name(), "Resource cleaned up");
                }
                Err(e) => {
                    error!(resource = resource.name(), error = %e, "Resource cleanup failed");
                    failures.push((resource.name().to_string(), e));
                }
            }
        }

        failures
    }

    pub fn count(&self) -> usize {
        self.resources.len()
    }

    /// 已注册资源的名称（按注册顺序，清理后按优先级）
    pub fn names(&self) -> Vec<String> {
        self.resources.iter().map(|r| r.name().to_string()).collect()
    }
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}
