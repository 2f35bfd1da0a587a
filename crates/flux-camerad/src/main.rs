mod child;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flux_camera::{
    BackendKind, ConfigLoader, FleetConfig, LoggingConfig, ProcessBackend, ReplayFactory,
    StartMode, ThreadBackend, UnitFactory, WorkerSupervisor,
};
use flux_shutdown::{ResourceManager, ShutdownCoordinator, ShutdownSignal, SignalHandler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "./config/camerad.toml")]
    config: PathBuf,

    /// 并发启动所有相机（覆盖配置）
    #[arg(long)]
    parallel: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// 以子进程方式运行回放管道（由进程后端启动）
    Pipeline(child::PipelineArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.command.clone() {
        Some(Command::Pipeline(pipeline)) => {
            logging::init(&LoggingConfig {
                level: "warn".to_string(),
                ..Default::default()
            })?;
            tokio::task::spawn_blocking(move || child::run(pipeline)).await?
        }
        None => run(args).await,
    }
}

async fn run(args: Args) -> Result<()> {
    let config = ConfigLoader::new(&args.config)
        .load()
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    logging::init(&config.logging)?;

    info!(
        config = %args.config.display(),
        cameras = config.cameras.len(),
        backend = ?config.backend.kind,
        "Starting flux-camerad"
    );

    let supervisor = WorkerSupervisor::with_factory(config.supervisor_config(), backend(&config)?);
    for spec in config.camera_specs() {
        let id = spec.id;
        if let Err(e) = supervisor.add_camera(spec).await {
            warn!(camera_id = %id, error = %e, "Skipping camera");
        }
    }

    let mode = if args.parallel {
        StartMode::Parallel
    } else {
        config.supervisor.start_mode
    };
    let report = supervisor.start_all(mode).await;
    info!(
        started = report.started.len(),
        failed = report.failed.len(),
        "Camera fleet running"
    );

    let (signals, _rx) = SignalHandler::new();
    let mut resources = ResourceManager::new();
    resources.register(Arc::new(supervisor.clone()));
    let coordinator = ShutdownCoordinator::builder()
        .with_signal_handler(signals.clone())
        .with_resource_manager(resources)
        .with_shutdown_timeout(shutdown_timeout(&config))
        .build();

    let signal = tokio::select! {
        signal = signals.wait() => signal,
        _ = supervisor.wait_all_exited() => {
            info!("All cameras finished on their own");
            ShutdownSignal::Completed
        }
    };

    let shutdown = coordinator.shutdown(signal).await;
    if !shutdown.is_clean() {
        warn!(failures = shutdown.failures.len(), "Shutdown was not clean");
    }

    let summary = supervisor.summary().await;
    for camera in &summary.cameras {
        info!(
            camera_id = %camera.id,
            name = %camera.name,
            state = %camera.state,
            entries = camera.stats.entries,
            exits = camera.stats.exits,
            occupancy = camera.stats.occupancy,
            frames = camera.frames,
            "Camera summary"
        );
    }
    info!(
        total = summary.total,
        running = summary.running,
        stopped = summary.stopped,
        "Fleet summary"
    );

    Ok(())
}

fn backend(config: &FleetConfig) -> Result<Arc<dyn UnitFactory>> {
    let units: Arc<dyn UnitFactory> = match config.backend.kind {
        BackendKind::Thread => Arc::new(ThreadBackend::new(ReplayFactory::new(
            config.backend.replay_fps,
        ))),
        BackendKind::Process => {
            let program = match &config.backend.program {
                Some(program) => program.clone(),
                None => std::env::current_exe().context("cannot locate own executable")?,
            };
            let args = config.backend.args.clone().unwrap_or_else(|| {
                vec![
                    "pipeline".to_string(),
                    "--fps".to_string(),
                    config.backend.replay_fps.to_string(),
                ]
            });
            info!(program = %program.display(), args = ?args, "Using process backend");
            Arc::new(ProcessBackend::new(program).with_args(args))
        }
    };
    Ok(units)
}

/// 停止是并发的，只需覆盖单个相机最长的升级时间
fn shutdown_timeout(config: &FleetConfig) -> Duration {
    let escalation = config.escalation.policy();
    escalation.stop_timeout + escalation.terminate_grace + escalation.kill_wait + Duration::from_secs(5)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pipeline_subcommand() {
        let args = Args::try_parse_from([
            "flux-camerad",
            "pipeline",
            "--fps",
            "10",
            "--camera-id",
            "3",
            "--source",
            "/tmp/replay.jsonl",
            "--line",
            r#"{"start":[0,0],"end":[0,10],"entry_side":"left"}"#,
        ])
        .unwrap();

        match args.command {
            Some(Command::Pipeline(pipeline)) => {
                assert_eq!(pipeline.camera_id, 3);
                assert_eq!(pipeline.fps, 10.0);
                assert!(pipeline.line.is_some());
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_default_process_backend_uses_pipeline_subcommand() {
        let mut config = FleetConfig::default();
        config.backend.kind = BackendKind::Process;
        assert!(backend(&config).is_ok());
        assert!(shutdown_timeout(&config) > config.escalation.policy().stop_timeout);
    }
}
