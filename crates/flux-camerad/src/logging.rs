use anyhow::{anyhow, Result};
use flux_camera::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// 初始化日志，输出到 stderr
///
/// `RUST_LOG` 优先于配置中的级别。
pub fn init(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(&config.level))?;
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = match config.format.as_str() {
        "json" => builder.json().try_init(),
        _ => builder.try_init(),
    };
    result.map_err(|e| anyhow!("failed to initialize logging: {}", e))
}
