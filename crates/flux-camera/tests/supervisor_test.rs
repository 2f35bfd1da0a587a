use flux_camera::{
    AnalyticsPipeline, CameraId, CameraSpec, EntrySide, EscalationLevel, EscalationPolicy,
    LineConfig, ObjectSample, OccupancySnapshot, PipelineContext, PipelineFailure,
    StartMode, StopOutcome, SupervisorConfig, SupervisorError, ThreadBackend, TrackerOptions,
    WorkerError, WorkerState, WorkerSupervisor,
};
use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};
use tokio::time::sleep;

#[derive(Clone)]
enum Script {
    /// 就绪后发布这些帧，然后等待停止或自行结束
    Run {
        frames: Vec<Vec<ObjectSample>>,
        finish: bool,
    },
    /// 初始化失败
    FailOnStart(&'static str),
    /// 永远不报告就绪
    NeverReady,
    /// 忽略协作式停止，只响应中止
    IgnoreStop,
    /// 停止和中止都忽略，一段时间后自行退出
    Stubborn(Duration),
}

struct Scripted(Script);

impl AnalyticsPipeline for Scripted {
    fn run(&mut self, ctx: &mut PipelineContext) -> Result<(), PipelineFailure> {
        match &self.0 {
            Script::FailOnStart(message) => Err(PipelineFailure::new(*message)),
            Script::NeverReady => {
                while ctx.sleep_unless_stopped(Duration::from_millis(5)) {}
                Ok(())
            }
            Script::Run { frames, finish } => {
                ctx.notify_started();
                for frame in frames {
                    ctx.publish_frame(frame);
                }
                if !finish {
                    while ctx.sleep_unless_stopped(Duration::from_millis(5)) {}
                }
                Ok(())
            }
            Script::IgnoreStop => {
                ctx.notify_started();
                while !ctx.should_abort() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            }
            Script::Stubborn(duration) => {
                ctx.notify_started();
                std::thread::sleep(*duration);
                Ok(())
            }
        }
    }
}

fn idle() -> Script {
    Script::Run {
        frames: Vec::new(),
        finish: false,
    }
}

fn backend(scripts: HashMap<u32, Script>) -> ThreadBackend {
    ThreadBackend::new(
        move |camera: &CameraSpec| -> Result<Box<dyn AnalyticsPipeline>, PipelineFailure> {
            let script = scripts.get(&camera.id.0).cloned().unwrap_or_else(idle);
            Ok(Box::new(Scripted(script)))
        },
    )
}

fn config() -> SupervisorConfig {
    SupervisorConfig {
        max_cameras: 8,
        start_timeout: Duration::from_secs(2),
        max_parallel_starts: 0,
        escalation: EscalationPolicy {
            stop_timeout: Duration::from_millis(300),
            terminate_grace: Duration::from_millis(300),
            kill_wait: Duration::from_millis(100),
        },
        counting: TrackerOptions::default(),
    }
}

/// 竖线 (0,0)-(0,10)，从右侧（x>0）走到左侧算进入
fn doorway() -> LineConfig {
    LineConfig::new((0.0, 0.0), (0.0, 10.0), EntrySide::Left)
}

fn camera(id: u32) -> CameraSpec {
    CameraSpec::new(id, format!("cam{}", id), format!("test://{}", id), doorway())
}

async fn supervisor_with(
    config: SupervisorConfig,
    ids: &[u32],
    scripts: HashMap<u32, Script>,
) -> WorkerSupervisor {
    let supervisor = WorkerSupervisor::new(config, backend(scripts));
    for id in ids {
        supervisor.add_camera(camera(*id)).await.unwrap();
    }
    supervisor
}

#[tokio::test]
async fn test_remove_requires_stop() {
    let supervisor = supervisor_with(config(), &[1], HashMap::new()).await;

    tokio_test::assert_ok!(supervisor.start_camera(CameraId(1)).await);
    assert!(matches!(
        supervisor.remove_camera(CameraId(1)).await,
        Err(SupervisorError::StillRunning(CameraId(1)))
    ));

    supervisor
        .stop_camera(CameraId(1), Duration::from_secs(1))
        .await
        .unwrap();
    tokio_test::assert_ok!(supervisor.remove_camera(CameraId(1)).await);
    assert_eq!(supervisor.camera_count().await, 0);
}

#[tokio::test]
async fn test_sequential_start_continues_past_failure() {
    let scripts = HashMap::from([(2, Script::FailOnStart("rtsp connect refused"))]);
    let supervisor = supervisor_with(config(), &[1, 2, 3], scripts).await;

    let report = supervisor.start_all(StartMode::Sequential).await;

    assert_eq!(report.started, vec![CameraId(1), CameraId(3)]);
    assert_eq!(report.failed.len(), 1);
    match &report.failed[0] {
        (CameraId(2), WorkerError::PipelineError { message, .. }) => {
            assert_eq!(message, "rtsp connect refused")
        }
        other => panic!("unexpected failure: {:?}", other),
    }
    assert_eq!(
        supervisor.running_camera_ids().await,
        BTreeSet::from([CameraId(1), CameraId(3)])
    );
    assert_eq!(
        supervisor.camera_state(CameraId(2)).await,
        Some(WorkerState::Failed)
    );

    let stop = supervisor.stop_all().await;
    assert!(stop.is_clean());
    assert_eq!(stop.stopped.len(), 3);
}

#[tokio::test]
async fn test_parallel_start_bounds_slow_camera() {
    let scripts = HashMap::from([(4, Script::NeverReady)]);
    let config = SupervisorConfig {
        start_timeout: Duration::from_millis(300),
        ..config()
    };
    let supervisor = supervisor_with(config, &[1, 2, 3, 4], scripts).await;

    let begin = Instant::now();
    let report = supervisor.start_all(StartMode::Parallel).await;

    assert_eq!(report.started.len(), 3);
    assert_eq!(report.failed_ids(), vec![CameraId(4)]);
    assert!(matches!(
        report.failed[0].1,
        WorkerError::StartTimeout { camera_id: CameraId(4), .. }
    ));
    // 慢相机只占用它自己的超时加一次清理
    assert!(begin.elapsed() < Duration::from_secs(2));
    assert!(!supervisor.running_camera_ids().await.contains(&CameraId(4)));

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_parallel_start_with_limit() {
    let config = SupervisorConfig {
        max_parallel_starts: 1,
        ..config()
    };
    let supervisor = supervisor_with(config, &[1, 2, 3], HashMap::new()).await;

    let report = supervisor.start_all(StartMode::Parallel).await;
    assert!(report.is_complete());
    assert_eq!(report.total(), 3);
    assert_eq!(supervisor.running_camera_ids().await.len(), 3);

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_queued_camera_gets_its_own_start_timeout() {
    let scripts = HashMap::from([(1, Script::NeverReady)]);
    let config = SupervisorConfig {
        start_timeout: Duration::from_millis(300),
        max_parallel_starts: 1,
        ..config()
    };
    let supervisor = supervisor_with(config, &[1, 2], scripts).await;

    let report = supervisor.start_all(StartMode::Parallel).await;

    // 排队等许可的时间不算进相机 2 的超时
    assert_eq!(report.started, vec![CameraId(2)]);
    assert_eq!(report.failed_ids(), vec![CameraId(1)]);
    assert_eq!(
        supervisor.running_camera_ids().await,
        BTreeSet::from([CameraId(2)])
    );

    supervisor.stop_all().await;
}

#[tokio::test]
async fn test_remove_during_start_all_is_never_launched() {
    let scripts = HashMap::from([(1, Script::NeverReady)]);
    let config = SupervisorConfig {
        start_timeout: Duration::from_millis(400),
        ..config()
    };
    let supervisor = supervisor_with(config, &[1, 2], scripts).await;
    let second = supervisor.worker(CameraId(2)).await.unwrap();

    let starting = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.start_all(StartMode::Sequential).await })
    };

    // 相机 1 还在等就绪，相机 2 已被批量启动取走但尚未启动
    sleep(Duration::from_millis(100)).await;
    tokio_test::assert_ok!(supervisor.remove_camera(CameraId(2)).await);

    let report = starting.await.unwrap();
    assert!(report.started.is_empty());
    assert_eq!(report.failed_ids(), vec![CameraId(1)]);

    assert!(second.is_retired());
    assert!(!second.is_alive());
    assert_eq!(second.state(), WorkerState::Created);
    assert_eq!(supervisor.camera_count().await, 1);
    assert!(supervisor.running_camera_ids().await.is_empty());

    let stop = supervisor.stop_all().await;
    assert_eq!(stop.stopped, vec![CameraId(1)]);
}

#[tokio::test]
async fn test_remove_while_starting_is_refused() {
    let scripts = HashMap::from([(1, Script::NeverReady)]);
    let config = SupervisorConfig {
        start_timeout: Duration::from_millis(400),
        ..config()
    };
    let supervisor = supervisor_with(config, &[1], scripts).await;

    let starting = {
        let supervisor = supervisor.clone();
        tokio::spawn(async move { supervisor.start_camera(CameraId(1)).await })
    };

    sleep(Duration::from_millis(100)).await;
    assert!(matches!(
        supervisor.remove_camera(CameraId(1)).await,
        Err(SupervisorError::StillRunning(CameraId(1)))
    ));

    assert!(matches!(
        starting.await.unwrap(),
        Err(SupervisorError::Worker(WorkerError::StartTimeout { .. }))
    ));
    tokio_test::assert_ok!(supervisor.remove_camera(CameraId(1)).await);
}

#[tokio::test]
async fn test_start_after_remove_is_not_found() {
    let supervisor = supervisor_with(config(), &[1], HashMap::new()).await;
    let worker = supervisor.worker(CameraId(1)).await.unwrap();

    tokio_test::assert_ok!(supervisor.remove_camera(CameraId(1)).await);

    assert!(matches!(
        worker.start(Duration::from_secs(1)).await,
        Err(WorkerError::Removed(CameraId(1)))
    ));
    assert!(!worker.is_alive());
}

#[tokio::test]
async fn test_stop_twice_is_idempotent() {
    let supervisor = supervisor_with(config(), &[1, 2], HashMap::new()).await;
    supervisor.start_all(StartMode::Sequential).await;

    let first = supervisor.stop_all().await;
    assert!(first.is_clean());

    let begin = Instant::now();
    let second = supervisor.stop_all().await;
    assert!(second.is_clean());
    assert_eq!(second.stopped.len(), 2);
    assert!(begin.elapsed() < Duration::from_millis(300));

    let outcome = supervisor
        .stop_camera(CameraId(1), Duration::from_secs(1))
        .await
        .unwrap();
    assert_eq!(outcome, StopOutcome::AlreadyStopped);
}

#[tokio::test]
async fn test_occupancy_end_to_end() {
    let frames = vec![
        vec![
            ObjectSample::person(7, 5.0, 5.0),
            ObjectSample::person(8, 5.0, 2.0),
            ObjectSample {
                id: 9,
                x: 5.0,
                y: 8.0,
                person: false,
            },
        ],
        vec![
            ObjectSample::person(7, -5.0, 5.0),
            ObjectSample::person(8, -5.0, 2.0),
            ObjectSample {
                id: 9,
                x: -5.0,
                y: 8.0,
                person: false,
            },
        ],
        vec![ObjectSample::person(7, 5.0, 5.0)],
    ];
    let scripts = HashMap::from([(
        1,
        Script::Run {
            frames,
            finish: false,
        },
    )]);
    let supervisor = supervisor_with(config(), &[1, 2], scripts).await;
    supervisor.start_all(StartMode::Sequential).await;

    let worker = supervisor.worker(CameraId(1)).await.unwrap();
    for _ in 0..200 {
        if worker.frames_processed() == 3 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(worker.frames_processed(), 3);

    let stats = supervisor.all_stats().await;
    assert_eq!(
        stats[&CameraId(1)],
        OccupancySnapshot {
            entries: 2,
            exits: 1,
            occupancy: 1
        }
    );
    assert_eq!(stats[&CameraId(2)], OccupancySnapshot::default());

    supervisor.stop_all().await;
    // 停止后计数保留
    assert_eq!(supervisor.camera_stats(CameraId(1)).await.occupancy, 1);
}

#[tokio::test]
async fn test_counters_survive_restart() {
    let frames = vec![
        vec![ObjectSample::person(1, 5.0, 5.0)],
        vec![ObjectSample::person(1, -5.0, 5.0)],
    ];
    let scripts = HashMap::from([(
        1,
        Script::Run {
            frames,
            finish: true,
        },
    )]);
    let supervisor = supervisor_with(config(), &[1], scripts).await;

    for _ in 0..2 {
        supervisor.start_camera(CameraId(1)).await.unwrap();
        supervisor.wait_all_exited().await;
    }

    assert_eq!(supervisor.camera_stats(CameraId(1)).await.entries, 2);
    let worker = supervisor.worker(CameraId(1)).await.unwrap();
    assert_eq!(worker.frames_processed(), 4);
}

#[tokio::test]
async fn test_stop_all_reports_forced_termination() {
    let scripts = HashMap::from([(2, Script::IgnoreStop)]);
    let supervisor = supervisor_with(config(), &[1, 2], scripts).await;
    supervisor.start_all(StartMode::Parallel).await;

    let report = supervisor.stop_all().await;

    assert_eq!(report.stopped.len(), 2);
    assert!(report.failed.is_empty());
    assert_eq!(report.escalated.len(), 1);
    assert!(matches!(
        report.escalated[0],
        WorkerError::ForcedTermination {
            camera_id: CameraId(2),
            level: EscalationLevel::Terminate
        }
    ));
    assert!(supervisor.running_camera_ids().await.is_empty());
}

#[tokio::test]
async fn test_unkillable_thread_is_reported() {
    let scripts = HashMap::from([(1, Script::Stubborn(Duration::from_secs(2)))]);
    let supervisor = supervisor_with(config(), &[1, 2], scripts).await;
    supervisor.start_all(StartMode::Sequential).await;

    let report = supervisor.stop_all().await;

    assert_eq!(report.stopped, vec![CameraId(2)]);
    assert_eq!(report.failed.len(), 1);
    assert!(matches!(
        report.failed[0],
        (
            CameraId(1),
            WorkerError::StopTimeout {
                level: EscalationLevel::Kill,
                ..
            }
        )
    ));
    assert_eq!(
        supervisor.camera_state(CameraId(1)).await,
        Some(WorkerState::Failed)
    );
    assert!(matches!(
        supervisor.remove_camera(CameraId(1)).await,
        Err(SupervisorError::StillRunning(CameraId(1)))
    ));
}

#[tokio::test]
async fn test_pipelines_finishing_on_their_own() {
    let finished = Script::Run {
        frames: vec![vec![ObjectSample::person(1, 5.0, 5.0)]],
        finish: true,
    };
    let scripts = HashMap::from([(1, finished.clone()), (2, finished)]);
    let supervisor = supervisor_with(config(), &[1, 2], scripts).await;
    supervisor.start_all(StartMode::Parallel).await;

    tokio::time::timeout(Duration::from_secs(2), supervisor.wait_all_exited())
        .await
        .unwrap();

    let summary = supervisor.summary().await;
    assert_eq!(summary.total, 2);
    assert_eq!(summary.running, 0);
    assert!(summary.cameras.iter().all(|c| c.frames == 1));
}
