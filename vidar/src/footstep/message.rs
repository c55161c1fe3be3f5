use nalgebra::{Isometry3, Point2, Point3, Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{Footstep, FootstepOrigin, FootstepTiming, Side, SwingTrajectoryType};

/// Maximum number of custom swing waypoints accepted from the wire.
pub const MAX_POSITION_WAYPOINTS: usize = 12;

/// Wire contract for a planned footstep.
///
/// This mirrors the external planner's message bit for bit: empty contact
/// points mean "use the full default foot polygon" and negative durations mean
/// "use the configured default timing". Do not change field meanings without
/// coordinating with every producer of planned steps.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct FootstepMessage {
    pub side: Side,
    #[serde(default)]
    pub origin: FootstepOrigin,
    /// Target position in the world frame.
    pub location: Point3<f32>,
    /// Target orientation in the world frame.
    pub orientation: UnitQuaternion<f32>,
    /// Predicted 2D contact points in the sole frame.
    #[serde(default)]
    pub predicted_contact_points: Vec<Point2<f32>>,
    #[serde(default)]
    pub trajectory_type: SwingTrajectoryType,
    #[serde(default)]
    pub swing_height: f32,
    /// Custom swing waypoints, at most [`MAX_POSITION_WAYPOINTS`].
    #[serde(default)]
    pub position_waypoints: Vec<Point3<f32>>,
    /// Swing duration override in seconds; negative means default.
    #[serde(default = "unset_duration")]
    pub swing_duration: f32,
    /// Transfer duration override in seconds; negative means default.
    #[serde(default = "unset_duration")]
    pub transfer_duration: f32,
}

fn unset_duration() -> f32 {
    -1.0
}

impl FootstepMessage {
    #[must_use]
    pub fn new(side: Side, location: Point3<f32>, orientation: UnitQuaternion<f32>) -> Self {
        Self {
            side,
            origin: FootstepOrigin::default(),
            location,
            orientation,
            predicted_contact_points: Vec::new(),
            trajectory_type: SwingTrajectoryType::default(),
            swing_height: 0.0,
            position_waypoints: Vec::new(),
            swing_duration: unset_duration(),
            transfer_duration: unset_duration(),
        }
    }

    /// Timing override carried by this message, if both durations are set.
    ///
    /// A message overriding only one of the two durations is treated as fully
    /// unset; partial overrides are not part of the wire contract.
    #[must_use]
    pub fn timing(&self) -> Option<FootstepTiming> {
        if self.swing_duration < 0.0 || self.transfer_duration < 0.0 {
            return None;
        }

        let timing = FootstepTiming::new(self.swing_duration, self.transfer_duration);
        timing.is_valid().then_some(timing)
    }
}

impl From<FootstepMessage> for Footstep {
    fn from(message: FootstepMessage) -> Self {
        let timing = message.timing();

        let mut waypoints = message.position_waypoints;
        if waypoints.len() > MAX_POSITION_WAYPOINTS {
            warn!(
                count = waypoints.len(),
                "footstep message has too many waypoints, truncating"
            );
            waypoints.truncate(MAX_POSITION_WAYPOINTS);
        }

        Footstep {
            side: message.side,
            pose: Isometry3::from_parts(
                Translation3::from(message.location.coords),
                message.orientation,
            ),
            origin: message.origin,
            predicted_contact_points: (!message.predicted_contact_points.is_empty())
                .then_some(message.predicted_contact_points),
            trajectory_type: message.trajectory_type,
            swing_height: message.swing_height,
            custom_waypoints: waypoints,
            timing,
        }
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{Point2, Point3, UnitQuaternion};

    use super::{FootstepMessage, MAX_POSITION_WAYPOINTS};
    use crate::footstep::{Footstep, Side};

    fn message() -> FootstepMessage {
        FootstepMessage::new(
            Side::Right,
            Point3::new(0.3, -0.1, 0.0),
            UnitQuaternion::identity(),
        )
    }

    #[test]
    fn negative_durations_mean_default_timing() {
        let footstep = Footstep::from(message());
        assert!(footstep.timing.is_none());
    }

    #[test]
    fn explicit_durations_become_a_timing_override() {
        let mut msg = message();
        msg.swing_duration = 0.6;
        msg.transfer_duration = 0.2;

        let footstep = Footstep::from(msg);
        let timing = footstep.timing.expect("timing should be set");
        assert_eq!(timing.step_time(), 0.8);
    }

    #[test]
    fn partial_duration_override_is_ignored() {
        let mut msg = message();
        msg.swing_duration = 0.6;

        assert!(msg.timing().is_none());
    }

    #[test]
    fn empty_contact_points_mean_default_polygon() {
        let footstep = Footstep::from(message());
        assert!(footstep.predicted_contact_points.is_none());

        let mut msg = message();
        msg.predicted_contact_points = vec![Point2::new(0.1, 0.05)];
        let footstep = Footstep::from(msg);
        assert_eq!(footstep.predicted_contact_points.map(|p| p.len()), Some(1));
    }

    #[test]
    fn waypoints_are_capped() {
        let mut msg = message();
        msg.position_waypoints = vec![Point3::origin(); MAX_POSITION_WAYPOINTS + 3];

        let footstep = Footstep::from(msg);
        assert_eq!(footstep.custom_waypoints.len(), MAX_POSITION_WAYPOINTS);
    }
}
