//! Footstep data model and the upcoming footstep queue.

mod message;
mod queue;

pub use message::{FootstepMessage, MAX_POSITION_WAYPOINTS};
pub use queue::{FootstepProvider, FootstepQueue};

use nalgebra::{Isometry3, Point2, Point3};
use serde::{Deserialize, Serialize};

/// A robot side.
#[derive(Serialize, Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    #[default]
    Left,
    Right,
}

impl Side {
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }
}

/// A pair of values, one per robot side.
#[derive(Serialize, Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideDependent<T> {
    pub left: T,
    pub right: T,
}

impl<T> SideDependent<T> {
    pub fn new(left: T, right: T) -> Self {
        Self { left, right }
    }

    pub fn get(&self, side: Side) -> &T {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn get_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Left => &mut self.left,
            Side::Right => &mut self.right,
        }
    }
}

/// Frame the footstep pose is expressed in by the external planner.
#[derive(Serialize, Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FootstepOrigin {
    #[default]
    AnkleFrame,
    SoleFrame,
}

/// Requested swing trajectory shape.
#[derive(Serialize, Deserialize, Default, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwingTrajectoryType {
    #[default]
    Default,
    ObstacleClearance,
    PushRecovery,
    Custom,
}

/// Swing and transfer durations for one footstep.
///
/// Valid timings have non-negative finite times. An absent timing on a
/// [`Footstep`] means "use the configured defaults".
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FootstepTiming {
    swing_time: f32,
    transfer_time: f32,
    swing_start_time: Option<f32>,
}

impl FootstepTiming {
    #[must_use]
    pub fn new(swing_time: f32, transfer_time: f32) -> Self {
        Self {
            swing_time,
            transfer_time,
            swing_start_time: None,
        }
    }

    #[must_use]
    pub fn swing_time(&self) -> f32 {
        self.swing_time
    }

    #[must_use]
    pub fn transfer_time(&self) -> f32 {
        self.transfer_time
    }

    /// Total step duration.
    #[must_use]
    pub fn step_time(&self) -> f32 {
        self.swing_time + self.transfer_time
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.swing_time.is_finite()
            && self.transfer_time.is_finite()
            && self.swing_time >= 0.0
            && self.transfer_time >= 0.0
    }

    /// Pin the swing start to an absolute controller time.
    pub fn set_absolute_time(&mut self, swing_start_time: f32) {
        self.swing_start_time = Some(swing_start_time);
    }

    pub fn remove_absolute_time(&mut self) {
        self.swing_start_time = None;
    }

    #[must_use]
    pub fn swing_start_time(&self) -> Option<f32> {
        self.swing_start_time
    }
}

/// A single planned footstep.
///
/// Created by the external planner, immutable once taken off the queue for
/// execution except for [`Footstep::patch_position_xy`] during push-recovery
/// re-targeting. Retired through the queue's completion notification.
#[derive(Debug, Clone, PartialEq)]
pub struct Footstep {
    pub side: Side,
    /// Target pose in the world frame.
    pub pose: Isometry3<f32>,
    pub origin: FootstepOrigin,
    /// Predicted contact polygon in the sole frame; `None` means the full
    /// default foot polygon.
    pub predicted_contact_points: Option<Vec<Point2<f32>>>,
    pub trajectory_type: SwingTrajectoryType,
    /// Apex height of the swing foot above the stance plane, in meters.
    pub swing_height: f32,
    /// Optional custom swing waypoints in the world frame.
    pub custom_waypoints: Vec<Point3<f32>>,
    /// Timing override; `None` means use the configured defaults.
    pub timing: Option<FootstepTiming>,
}

impl Footstep {
    /// A footstep at the given world pose with default swing parameters.
    #[must_use]
    pub fn at_pose(side: Side, pose: Isometry3<f32>) -> Self {
        Self {
            side,
            pose,
            origin: FootstepOrigin::default(),
            predicted_contact_points: None,
            trajectory_type: SwingTrajectoryType::default(),
            swing_height: 0.0,
            custom_waypoints: Vec::new(),
            timing: None,
        }
    }

    /// Horizontal position of the footstep in the world frame.
    #[must_use]
    pub fn position2d(&self) -> Point2<f32> {
        let translation = self.pose.translation.vector;
        Point2::new(translation.x, translation.y)
    }

    /// Re-target the footstep horizontally, keeping height and orientation.
    ///
    /// Only push recovery is allowed to do this to a footstep that is already
    /// executing.
    pub fn patch_position_xy(&mut self, position: Point2<f32>) {
        self.pose.translation.vector.x = position.x;
        self.pose.translation.vector.y = position.y;
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{Isometry3, Point2, Translation3, UnitQuaternion};

    use super::{Footstep, FootstepTiming, Side};

    #[test]
    fn step_time_is_exact_sum() {
        let timing = FootstepTiming::new(0.7, 0.25);
        assert_eq!(timing.step_time(), 0.7 + 0.25);
        assert!(timing.is_valid());
    }

    #[test]
    fn negative_or_non_finite_timings_are_invalid() {
        assert!(!FootstepTiming::new(-1.0, 0.25).is_valid());
        assert!(!FootstepTiming::new(0.7, f32::NAN).is_valid());
        assert!(!FootstepTiming::new(f32::INFINITY, 0.25).is_valid());
    }

    #[test]
    fn absolute_time_round_trip() {
        let mut timing = FootstepTiming::new(0.7, 0.25);
        assert_eq!(timing.swing_start_time(), None);

        timing.set_absolute_time(12.5);
        assert_eq!(timing.swing_start_time(), Some(12.5));

        timing.remove_absolute_time();
        assert_eq!(timing.swing_start_time(), None);
    }

    #[test]
    fn patch_position_keeps_height_and_orientation() {
        let orientation = UnitQuaternion::from_euler_angles(0.0, 0.0, 0.4);
        let pose = Isometry3::from_parts(Translation3::new(0.1, 0.2, 0.05), orientation);
        let mut footstep = Footstep::at_pose(Side::Left, pose);

        footstep.patch_position_xy(Point2::new(0.5, -0.1));

        assert_eq!(footstep.position2d(), Point2::new(0.5, -0.1));
        assert_eq!(footstep.pose.translation.vector.z, 0.05);
        assert_eq!(footstep.pose.rotation, orientation);
    }
}
