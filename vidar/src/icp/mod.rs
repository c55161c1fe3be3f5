//! Instantaneous capture point trajectory planning.

mod planner;
mod trajectory;

pub use planner::{IcpDesired, IcpPlanner, IcpPlannerConfig};
pub use trajectory::{PlanarTrajectory, QuarticTrajectory};
