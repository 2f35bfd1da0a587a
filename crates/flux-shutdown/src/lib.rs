pub mod coordinator;
pub mod resource;
pub mod signal;

pub use coordinator::{ShutdownCoordinator, ShutdownCoordinatorBuilder, ShutdownPhase, ShutdownReport};
pub use resource::{Resource, ResourceError, ResourceManager};
pub use signal::{ShutdownSignal, SignalHandler};
