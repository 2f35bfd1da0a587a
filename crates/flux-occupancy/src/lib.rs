pub mod counter;
pub mod detector;
pub mod geometry;
pub mod tracker;

pub use counter::{OccupancyCounter, OccupancySnapshot};
pub use detector::LineCrossingDetector;
pub use geometry::{
    CrossingDirection, CrossingEvent, EntrySide, LineConfig, LineConfigError, LineSegment, Point,
};
pub use tracker::{CrossingTracker, ObjectId, ObjectSample, TrackerOptions};
