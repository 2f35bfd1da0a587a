pub mod config;
pub mod error;
pub mod pipeline;
pub mod protocol;
pub mod supervisor;
pub mod types;
pub mod unit;
pub mod worker;

pub use config::{
    BackendConfig, BackendKind, CameraConfig, ConfigLoader, CountingConfig, EscalationConfig,
    FleetConfig, LoggingConfig, SupervisorSection,
};
pub use error::{ConfigError, EscalationLevel, SupervisorError, WorkerError};
pub use pipeline::{
    AnalyticsPipeline, PipelineContext, PipelineFactory, PipelineFailure, RecordedFrame,
    ReplayFactory, ReplayPipeline, ReplaySource,
};
pub use protocol::{ControlMessage, PipelineMessage};
pub use supervisor::{SupervisorConfig, WorkerSupervisor};
pub use types::{
    CameraId, CameraSpec, CameraSummary, FleetSummary, StartMode, StartReport, StopOutcome,
    StopReport, WorkerState,
};
pub use unit::{
    ExecutionUnit, PipelineSignal, ProcessBackend, SharedCounters, ThreadBackend, UnitContext,
    UnitFactory, UnitMonitor,
};
pub use worker::{CameraWorker, EscalationPolicy};

pub use flux_occupancy::{
    CrossingEvent, EntrySide, LineConfig, ObjectSample, OccupancySnapshot, Point, TrackerOptions,
};
