use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::geometry::ConvexPolygon2;

/// Configuration for the toe-off decision.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct ToeOffConfig {
    /// Allow toe-off at all.
    pub do_toe_off_if_possible: bool,
    /// Also evaluate the eCMP proximity trigger.
    pub check_ecmp_location_to_trigger: bool,
    /// Fraction of the way from the trailing foot to the final desired ICP
    /// the desired ICP must have travelled before the ICP trigger fires.
    pub icp_percent_of_stance_for_toe_off: f32,
    /// Distance of the eCMP to the trailing foot polygon below which the eCMP
    /// trigger fires, in meters.
    pub ecmp_proximity_for_toe_off: f32,
    /// Minimum horizontal stance length before toe-off makes sense, in
    /// meters.
    pub min_step_length_for_toe_off: f32,
}

impl Default for ToeOffConfig {
    fn default() -> Self {
        Self {
            do_toe_off_if_possible: true,
            check_ecmp_location_to_trigger: true,
            icp_percent_of_stance_for_toe_off: 0.7,
            ecmp_proximity_for_toe_off: 0.015,
            min_step_length_for_toe_off: 0.05,
        }
    }
}

/// Decides when the trailing foot may roll onto its toe during the transfer.
///
/// Two independent triggers exist: an ICP progress trigger and an eCMP
/// proximity trigger. Either may request toe-off; once granted the decision is
/// latched until the next double support entry, because flipping the trailing
/// contact back and forth would invalidate all downstream support geometry.
#[derive(Debug, Clone)]
pub struct ToeOffManager {
    config: ToeOffConfig,
    granted: bool,
    ecmp_trigger_evaluated: bool,
}

impl ToeOffManager {
    #[must_use]
    pub fn new(config: ToeOffConfig) -> Self {
        Self {
            config,
            granted: false,
            ecmp_trigger_evaluated: false,
        }
    }

    /// Clear the latch on double support entry.
    pub fn reset(&mut self) {
        self.granted = false;
        self.ecmp_trigger_evaluated = false;
    }

    /// Whether toe-off has been granted in the current double support.
    #[must_use]
    pub fn do_toe_off(&self) -> bool {
        self.granted
    }

    /// Whether the eCMP trigger still needs evaluating this double support.
    #[must_use]
    pub fn ecmp_trigger_pending(&self) -> bool {
        !self.ecmp_trigger_evaluated && self.config.check_ecmp_location_to_trigger
    }

    /// ICP trigger: grant toe-off once the desired ICP has progressed far
    /// enough from the trailing foot towards the final desired ICP.
    ///
    /// Returns whether toe-off was *newly* granted; a latched grant never
    /// re-triggers.
    pub fn request_toe_off_based_on_icp(
        &mut self,
        trailing_centroid: Point2<f32>,
        desired_icp: Point2<f32>,
        final_desired_icp: Point2<f32>,
    ) -> bool {
        if !self.config.do_toe_off_if_possible || self.granted {
            return false;
        }

        let stance_span = (final_desired_icp - trailing_centroid).norm();
        if stance_span < self.config.min_step_length_for_toe_off {
            return false;
        }

        let progress = (desired_icp - trailing_centroid).norm() / stance_span;
        if progress < self.config.icp_percent_of_stance_for_toe_off {
            return false;
        }

        info!(progress, "toe-off granted (ICP trigger)");
        self.granted = true;
        true
    }

    /// eCMP trigger: grant toe-off when the eCMP has reached the trailing
    /// foot and the capture point has already left it.
    ///
    /// Returns whether toe-off was *newly* granted.
    pub fn request_toe_off_based_on_ecmp(
        &mut self,
        ecmp: Point2<f32>,
        capture_point: Point2<f32>,
        trailing_foot_polygon: &ConvexPolygon2,
    ) -> bool {
        self.ecmp_trigger_evaluated = true;

        if !self.config.do_toe_off_if_possible
            || !self.config.check_ecmp_location_to_trigger
            || self.granted
            || trailing_foot_polygon.is_empty()
        {
            return false;
        }

        let ecmp_close = trailing_foot_polygon.distance_to(&ecmp)
            < self.config.ecmp_proximity_for_toe_off;
        let capture_point_has_left = !trailing_foot_polygon.contains(&capture_point);

        if !(ecmp_close && capture_point_has_left) {
            return false;
        }

        info!("toe-off granted (eCMP trigger)");
        self.granted = true;
        true
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{Point2, point};

    use super::{ToeOffConfig, ToeOffManager};
    use crate::geometry::ConvexPolygon2;

    fn trailing_polygon() -> ConvexPolygon2 {
        ConvexPolygon2::from_points(&[
            point![0.07, 0.045],
            point![0.07, -0.045],
            point![-0.07, -0.045],
            point![-0.07, 0.045],
        ])
    }

    #[test]
    fn icp_trigger_requires_progress() {
        let mut manager = ToeOffManager::new(ToeOffConfig::default());
        let trailing = Point2::origin();
        let final_icp = Point2::new(0.3, 0.0);

        assert!(!manager.request_toe_off_based_on_icp(
            trailing,
            Point2::new(0.05, 0.0),
            final_icp
        ));
        assert!(!manager.do_toe_off());

        assert!(manager.request_toe_off_based_on_icp(trailing, Point2::new(0.25, 0.0), final_icp));
        assert!(manager.do_toe_off());
    }

    #[test]
    fn grant_is_latched_until_reset() {
        let mut manager = ToeOffManager::new(ToeOffConfig::default());
        let trailing = Point2::origin();
        let final_icp = Point2::new(0.3, 0.0);

        assert!(manager.request_toe_off_based_on_icp(trailing, Point2::new(0.28, 0.0), final_icp));

        // the latch swallows both triggers
        assert!(!manager.request_toe_off_based_on_icp(
            trailing,
            Point2::new(0.29, 0.0),
            final_icp
        ));
        assert!(!manager.request_toe_off_based_on_ecmp(
            Point2::origin(),
            Point2::new(0.3, 0.0),
            &trailing_polygon()
        ));
        assert!(manager.do_toe_off());

        manager.reset();
        assert!(!manager.do_toe_off());
    }

    #[test]
    fn short_stance_never_toes_off() {
        let mut manager = ToeOffManager::new(ToeOffConfig::default());
        let trailing = Point2::origin();
        let final_icp = Point2::new(0.02, 0.0);

        assert!(!manager.request_toe_off_based_on_icp(trailing, final_icp, final_icp));
    }

    #[test]
    fn ecmp_trigger_needs_the_capture_point_gone() {
        let mut manager = ToeOffManager::new(ToeOffConfig::default());

        // eCMP on the foot but capture point still above it: no toe-off
        assert!(!manager.request_toe_off_based_on_ecmp(
            Point2::new(0.05, 0.0),
            Point2::new(0.0, 0.0),
            &trailing_polygon()
        ));

        // capture point escaped forward: toe-off
        assert!(manager.request_toe_off_based_on_ecmp(
            Point2::new(0.05, 0.0),
            Point2::new(0.3, 0.0),
            &trailing_polygon()
        ));
    }

    #[test]
    fn disabled_toe_off_is_inert() {
        let mut manager = ToeOffManager::new(ToeOffConfig {
            do_toe_off_if_possible: false,
            ..ToeOffConfig::default()
        });

        assert!(!manager.request_toe_off_based_on_icp(
            Point2::origin(),
            Point2::new(0.29, 0.0),
            Point2::new(0.3, 0.0)
        ));
        assert!(!manager.request_toe_off_based_on_ecmp(
            Point2::origin(),
            Point2::new(0.3, 0.0),
            &trailing_polygon()
        ));
    }
}
