use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};

use crate::geometry::ConvexPolygon2;

/// Gains for the capture point feedback law.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct IcpFeedbackConfig {
    /// Proportional gain on the ICP error component along the desired ICP
    /// motion.
    pub kp_parallel_to_motion: f32,
    /// Proportional gain on the ICP error component orthogonal to the desired
    /// ICP motion.
    pub kp_orthogonal_to_motion: f32,
    /// Project the commanded CMP back into the support polygon.
    pub keep_cmp_inside_support_polygon: bool,
}

impl Default for IcpFeedbackConfig {
    fn default() -> Self {
        Self {
            kp_parallel_to_motion: 2.0,
            kp_orthogonal_to_motion: 1.5,
            keep_cmp_inside_support_polygon: true,
        }
    }
}

/// Proportional capture point controller.
///
/// Inverts the pendulum dynamics around the measured capture point:
/// `cmp = icp + K·(icp − icp_des) − icṗ_des/ω₀`. Pushing the CMP beyond the
/// tracking error is what generates restoring momentum.
#[derive(Debug, Clone)]
pub struct IcpProportionalController {
    config: IcpFeedbackConfig,
}

impl IcpProportionalController {
    #[must_use]
    pub fn new(config: IcpFeedbackConfig) -> Self {
        Self { config }
    }

    /// Compute the desired CMP for the momentum controller.
    #[must_use]
    pub fn compute_desired_cmp(
        &self,
        capture_point: Point2<f32>,
        desired_icp: Point2<f32>,
        desired_icp_velocity: Vector2<f32>,
        omega0: f32,
        support_polygon: &ConvexPolygon2,
        keep_cmp_inside_support_polygon: bool,
    ) -> Point2<f32> {
        let error = capture_point - desired_icp;

        let speed = desired_icp_velocity.norm();
        let feedback = if speed > 1e-6 {
            let parallel = desired_icp_velocity / speed;
            let orthogonal = Vector2::new(-parallel.y, parallel.x);
            parallel * (self.config.kp_parallel_to_motion * error.dot(&parallel))
                + orthogonal * (self.config.kp_orthogonal_to_motion * error.dot(&orthogonal))
        } else {
            error * self.config.kp_orthogonal_to_motion
        };

        let cmp = capture_point + feedback - desired_icp_velocity / omega0;

        if keep_cmp_inside_support_polygon
            && self.config.keep_cmp_inside_support_polygon
            && !support_polygon.is_empty()
        {
            support_polygon.orthogonal_projection(&cmp)
        } else {
            cmp
        }
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{Point2, Vector2, point};

    use super::{IcpFeedbackConfig, IcpProportionalController};
    use crate::geometry::ConvexPolygon2;

    fn support() -> ConvexPolygon2 {
        ConvexPolygon2::from_points(&[
            point![0.2, 0.2],
            point![0.2, -0.2],
            point![-0.2, -0.2],
            point![-0.2, 0.2],
        ])
    }

    #[test]
    fn zero_error_and_zero_velocity_put_the_cmp_on_the_icp() {
        let controller = IcpProportionalController::new(IcpFeedbackConfig::default());
        let icp = Point2::new(0.05, 0.02);

        let cmp = controller.compute_desired_cmp(icp, icp, Vector2::zeros(), 3.5, &support(), true);
        assert!((cmp - icp).norm() < 1e-6);
    }

    #[test]
    fn cmp_overshoots_the_error_to_push_the_icp_back() {
        let controller = IcpProportionalController::new(IcpFeedbackConfig::default());
        let desired = Point2::origin();
        let capture = Point2::new(0.05, 0.0);

        let cmp =
            controller.compute_desired_cmp(capture, desired, Vector2::zeros(), 3.5, &support(), true);

        // the CMP must lie beyond the capture point, away from the desired ICP
        assert!(cmp.x > capture.x);
    }

    #[test]
    fn cmp_is_projected_into_the_support_polygon() {
        let controller = IcpProportionalController::new(IcpFeedbackConfig::default());
        let desired = Point2::origin();
        let capture = Point2::new(0.5, 0.0);

        let cmp =
            controller.compute_desired_cmp(capture, desired, Vector2::zeros(), 3.5, &support(), true);
        assert!(support().contains(&cmp));

        let free = controller.compute_desired_cmp(
            capture,
            desired,
            Vector2::zeros(),
            3.5,
            &support(),
            false,
        );
        assert!(!support().contains(&free));
    }

    #[test]
    fn feed_forward_shifts_the_cmp_against_the_motion() {
        let controller = IcpProportionalController::new(IcpFeedbackConfig::default());
        let icp = Point2::origin();
        let velocity = Vector2::new(0.35, 0.0);

        let cmp = controller.compute_desired_cmp(icp, icp, velocity, 3.5, &support(), true);
        assert!((cmp.x - (-0.1)).abs() < 1e-6);
    }
}
