//! CoM/pelvis height control pipeline.
//!
//! Raw spline trajectory over the upcoming footstep geometry → time
//! derivatives → jerk/acceleration-limited smoothing → singularity/knee-limit
//! correction → PD tracking with feed-forward. The commanded vertical
//! acceleration can never reach free fall.

mod smoother;

pub use smoother::HeightSmoother;

use nalgebra::{Point2, Point3, Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    estimation::GRAVITY,
    footstep::{Footstep, Side, SideDependent},
    walking::TransferToAndNextFootsteps,
};

/// Hard floor on the commanded vertical acceleration: never command free fall
/// or beyond.
pub const MINIMUM_HEIGHT_ACCELERATION: f32 = -GRAVITY + 1e-12;

/// Configuration for the height pipeline.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct HeightConfig {
    /// Nominal CoM height above the support sole, in meters.
    pub nominal_height: f32,
    /// Proportional gain of the height tracking controller.
    pub kp: f32,
    /// Derivative gain of the height tracking controller.
    pub kd: f32,
    /// Acceleration bound of the smoother, in m/s².
    pub max_acceleration: f32,
    /// Jerk bound of the smoother, in m/s³.
    pub max_jerk: f32,
    /// Bandwidth of the smoothing filter, in rad/s.
    pub smoothing_bandwidth: f32,
    /// Track the pelvis height instead of the CoM height.
    ///
    /// The low level currently controls pelvis height more faithfully than
    /// CoM height.
    pub control_pelvis_height_instead_of_com: bool,
    /// Fully stretched leg length, in meters.
    pub max_leg_length: f32,
    /// Fraction of the maximum leg length above which a support leg counts as
    /// near its kinematic singularity.
    pub singularity_fraction: f32,
    /// Height margin used to decide between locking the knee and escaping the
    /// singularity, in meters.
    pub knee_lock_height_threshold: f32,
}

impl Default for HeightConfig {
    fn default() -> Self {
        Self {
            nominal_height: 0.78,
            kp: 40.0,
            kd: 13.0,
            max_acceleration: 0.5,
            max_jerk: 0.5,
            smoothing_bandwidth: 6.0,
            control_pelvis_height_instead_of_com: true,
            max_leg_length: 0.89,
            singularity_fraction: 0.97,
            knee_lock_height_threshold: 0.01,
        }
    }
}

/// Height with its first and second time derivative.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct HeightDerivatives {
    pub height: f32,
    pub velocity: f32,
    pub acceleration: f32,
}

/// Knee-level correction requested next to the height command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KneeAction {
    /// The desired height is unreachable: hold the knee instead of chasing it.
    LockKnee,
    /// Drop the height enough to move the leg away from its singularity.
    SingularityEscape,
}

/// Raw height trajectory: a smooth blend between the stance height at the
/// transfer-from foot and at the upcoming foothold, parameterized by the
/// horizontal progress of the CoM along the step line.
#[derive(Debug, Clone, Default)]
pub struct ComHeightTrajectory {
    start: Point2<f32>,
    end: Point2<f32>,
    start_height: f32,
    end_height: f32,
    initialized_with_next_step: bool,
}

struct HeightPartials {
    height: f32,
    dz_ds: f32,
    d2z_ds2: f32,
    direction: Vector2<f32>,
    length: f32,
}

impl ComHeightTrajectory {
    /// (Re)build the trajectory from a planning snapshot.
    pub fn initialize(
        &mut self,
        data: &TransferToAndNextFootsteps,
        _support_side: Option<Side>,
        next_footstep: Option<&Footstep>,
        nominal_height: f32,
    ) {
        let from = &data.transfer_from_footstep;
        let to = next_footstep.unwrap_or(&data.transfer_to_footstep);

        self.start = from.position2d();
        self.end = to.position2d();
        self.start_height = from.pose.translation.vector.z + nominal_height;
        self.end_height = to.pose.translation.vector.z + nominal_height;
        self.initialized_with_next_step = next_footstep.is_some();
    }

    #[must_use]
    pub fn has_been_initialized_with_next_step(&self) -> bool {
        self.initialized_with_next_step
    }

    /// Mark the trajectory stale so the next double support entry rebuilds it.
    pub fn invalidate_next_step(&mut self) {
        self.initialized_with_next_step = false;
    }

    /// Height and its spatial derivatives at the given horizontal position.
    fn solve(&self, query: Point2<f32>) -> HeightPartials {
        let step = self.end - self.start;
        let length = step.norm();

        if length < 1e-3 {
            return HeightPartials {
                height: self.end_height,
                dz_ds: 0.0,
                d2z_ds2: 0.0,
                direction: Vector2::zeros(),
                length: 1.0,
            };
        }

        let direction = step / length;
        let s = ((query - self.start).dot(&direction) / length).clamp(0.0, 1.0);

        // cubic smoothstep keeps the height velocity zero at both footholds
        let rise = self.end_height - self.start_height;
        let height = self.start_height + rise * (3.0 * s * s - 2.0 * s * s * s);
        let dz_ds = rise * (6.0 * s - 6.0 * s * s);
        let d2z_ds2 = rise * (6.0 - 12.0 * s);

        HeightPartials {
            height,
            dz_ds,
            d2z_ds2,
            direction,
            length,
        }
    }
}

/// Inputs to one height pipeline evaluation.
#[derive(Debug, Clone, Copy)]
pub struct HeightInputs {
    pub com_position: Point3<f32>,
    pub com_velocity: Vector3<f32>,
    pub pelvis_position: Point3<f32>,
    pub desired_icp_velocity: Vector2<f32>,
    pub omega0: f32,
    /// Current leg extension per side, in meters.
    pub leg_lengths: SideDependent<f32>,
    /// Whether each foot is in flat support.
    pub feet_flat: SideDependent<bool>,
}

/// Output of one height pipeline evaluation.
#[derive(Debug, Clone)]
pub struct HeightCommand {
    /// Commanded vertical acceleration, ≥ [`MINIMUM_HEIGHT_ACCELERATION`].
    pub acceleration: f32,
    pub desired_height: f32,
    pub knee_actions: Vec<(Side, KneeAction)>,
}

/// The full height pipeline.
#[derive(Debug, Clone)]
pub struct HeightPipeline {
    config: HeightConfig,
    trajectory: ComHeightTrajectory,
    smoother: HeightSmoother,
}

impl HeightPipeline {
    #[must_use]
    pub fn new(config: HeightConfig, control_dt: f32) -> Self {
        let smoother = HeightSmoother::new(
            config.max_acceleration,
            config.max_jerk,
            config.smoothing_bandwidth,
            control_dt,
        );

        Self {
            config,
            trajectory: ComHeightTrajectory::default(),
            smoother,
        }
    }

    pub fn initialize(
        &mut self,
        data: &TransferToAndNextFootsteps,
        support_side: Option<Side>,
        next_footstep: Option<&Footstep>,
    ) {
        self.trajectory
            .initialize(data, support_side, next_footstep, self.config.nominal_height);
    }

    #[must_use]
    pub fn has_been_initialized_with_next_step(&self) -> bool {
        self.trajectory.has_been_initialized_with_next_step()
    }

    pub fn invalidate_next_step(&mut self) {
        self.trajectory.invalidate_next_step();
    }

    /// Run the pipeline once and produce the commanded vertical acceleration.
    pub fn compute(&mut self, inputs: &HeightInputs) -> HeightCommand {
        let (z_current, zd_current) = if self.config.control_pelvis_height_instead_of_com {
            // CoM vertical velocity still provides the damping term
            (inputs.pelvis_position.z, inputs.com_velocity.z)
        } else {
            (inputs.com_position.z, inputs.com_velocity.z)
        };

        let com_xy = Point2::new(inputs.com_position.x, inputs.com_position.y);
        let com_xy_velocity = Vector2::new(inputs.com_velocity.x, inputs.com_velocity.y);

        let com_xy_acceleration = if inputs.desired_icp_velocity.iter().any(|v| !v.is_finite()) {
            warn!("desired ICP velocity contains NaN, zeroing the CoM feed-forward");
            Vector2::zeros()
        } else {
            (inputs.desired_icp_velocity - com_xy_velocity) * inputs.omega0
        };

        let partials = self.trajectory.solve(com_xy);
        let before_smoothing = time_derivatives(&partials, com_xy_velocity, com_xy_acceleration);
        let after_smoothing = self.smoother.smooth(before_smoothing);

        let tracking = self.config.kp * (after_smoothing.height - z_current)
            + self.config.kd * (after_smoothing.velocity - zd_current);
        let mut acceleration = tracking + after_smoothing.acceleration;

        let mut knee_actions = Vec::new();
        for side in [Side::Left, Side::Right] {
            let near_singularity = *inputs.leg_lengths.get(side)
                > self.config.singularity_fraction * self.config.max_leg_length;
            if !inputs.feet_flat.get(side) || !near_singularity {
                continue;
            }

            if after_smoothing.height >= z_current - self.config.knee_lock_height_threshold {
                // can't reach the desired height, just hold the knee
                knee_actions.push((side, KneeAction::LockKnee));
                acceleration = 0.0;
            } else {
                knee_actions.push((side, KneeAction::SingularityEscape));
            }
        }

        acceleration = acceleration.max(MINIMUM_HEIGHT_ACCELERATION);

        HeightCommand {
            acceleration,
            desired_height: after_smoothing.height,
            knee_actions,
        }
    }
}

/// Chain rule from spatial partials to time derivatives of the height.
fn time_derivatives(
    partials: &HeightPartials,
    com_xy_velocity: Vector2<f32>,
    com_xy_acceleration: Vector2<f32>,
) -> HeightDerivatives {
    let s_dot = partials.direction.dot(&com_xy_velocity) / partials.length;
    let s_ddot = partials.direction.dot(&com_xy_acceleration) / partials.length;

    HeightDerivatives {
        height: partials.height,
        velocity: partials.dz_ds * s_dot,
        acceleration: partials.dz_ds * s_ddot + partials.d2z_ds2 * s_dot * s_dot,
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{Isometry3, Point2, Point3, Vector2, Vector3, point};

    use super::{
        HeightConfig, HeightInputs, HeightPipeline, KneeAction, MINIMUM_HEIGHT_ACCELERATION,
    };
    use crate::{
        estimation::GRAVITY,
        footstep::{Footstep, Side, SideDependent},
        geometry::ConvexPolygon2,
        walking::TransferToAndNextFootsteps,
    };

    fn transfer_data(step_up: f32) -> TransferToAndNextFootsteps {
        TransferToAndNextFootsteps {
            transfer_from_footstep: Footstep::at_pose(
                Side::Left,
                Isometry3::translation(0.0, 0.1, 0.0),
            ),
            transfer_to_footstep: Footstep::at_pose(
                Side::Right,
                Isometry3::translation(0.3, -0.1, step_up),
            ),
            transfer_from_desired_footstep: None,
            next_footstep: None,
            next_next_footstep: None,
            transfer_to_side: Some(Side::Right),
            transfer_to_polygon_in_sole_frame: ConvexPolygon2::from_points(&[
                point![0.07, 0.045],
                point![0.07, -0.045],
                point![-0.07, -0.045],
                point![-0.07, 0.045],
            ]),
            double_support_duration: 0.25,
            single_support_duration: 0.8,
            initial_transfer_duration: 0.4,
            estimated_step_time: 1.05,
            omega0: 3.5,
            current_desired_icp: Point2::origin(),
            current_desired_icp_velocity: Vector2::zeros(),
            stop_if_reached_end: false,
        }
    }

    fn inputs() -> HeightInputs {
        HeightInputs {
            com_position: Point3::new(0.0, 0.0, 0.78),
            com_velocity: Vector3::zeros(),
            pelvis_position: Point3::new(0.0, 0.0, 0.88),
            desired_icp_velocity: Vector2::zeros(),
            omega0: 3.5,
            leg_lengths: SideDependent::new(0.7, 0.7),
            feet_flat: SideDependent::new(true, true),
        }
    }

    fn pipeline() -> HeightPipeline {
        let mut pipeline = HeightPipeline::new(HeightConfig::default(), 0.004);
        pipeline.initialize(&transfer_data(0.0), None, None);
        pipeline
    }

    #[test]
    fn command_never_reaches_free_fall() {
        let mut pipeline = pipeline();

        // a pelvis far above the trajectory demands a huge downward correction
        let mut absurd = inputs();
        absurd.pelvis_position.z = 10.0;
        absurd.com_velocity.z = 5.0;

        for _ in 0..50 {
            let command = pipeline.compute(&absurd);
            assert!(command.acceleration >= MINIMUM_HEIGHT_ACCELERATION);
            assert!(command.acceleration >= -GRAVITY + 1e-12);
        }
    }

    #[test]
    fn nan_icp_velocity_is_recovered_not_propagated() {
        let mut pipeline = pipeline();

        let mut degenerate = inputs();
        degenerate.desired_icp_velocity = Vector2::new(f32::NAN, 0.0);

        let command = pipeline.compute(&degenerate);
        assert!(command.acceleration.is_finite());
    }

    #[test]
    fn trajectory_tracks_a_step_up() {
        let mut pipeline = HeightPipeline::new(HeightConfig::default(), 0.004);
        pipeline.initialize(&transfer_data(0.1), None, None);

        // settle the smoother at the start of the step line
        let mut at_start = inputs();
        at_start.com_position = Point3::new(0.0, 0.1, 0.78);
        let mut desired_start = 0.0;
        for _ in 0..2000 {
            desired_start = pipeline.compute(&at_start).desired_height;
        }

        let mut at_end = at_start;
        at_end.com_position = Point3::new(0.3, -0.1, 0.88);
        let mut desired_end = 0.0;
        for _ in 0..2000 {
            desired_end = pipeline.compute(&at_end).desired_height;
        }

        assert!((desired_end - desired_start - 0.1).abs() < 0.01);
    }

    #[test]
    fn unreachable_height_near_singularity_locks_the_knee() {
        let mut pipeline = pipeline();

        let mut stretched = inputs();
        stretched.leg_lengths = SideDependent::new(0.88, 0.7);
        // pelvis below the desired trajectory: it cannot be pushed up further
        stretched.pelvis_position.z = 0.7;

        let command = pipeline.compute(&stretched);
        assert_eq!(command.knee_actions, vec![(Side::Left, KneeAction::LockKnee)]);
        assert_eq!(command.acceleration, 0.0);
    }

    #[test]
    fn singularity_with_headroom_escapes_instead() {
        let mut pipeline = pipeline();

        let mut stretched = inputs();
        stretched.leg_lengths = SideDependent::new(0.88, 0.7);
        // desired height is well below the current pelvis: room to come down
        stretched.pelvis_position.z = 1.2;

        let command = pipeline.compute(&stretched);
        assert_eq!(
            command.knee_actions,
            vec![(Side::Left, KneeAction::SingularityEscape)]
        );
    }

    #[test]
    fn initialized_with_next_step_flag() {
        let mut pipeline = HeightPipeline::new(HeightConfig::default(), 0.004);
        assert!(!pipeline.has_been_initialized_with_next_step());

        let data = transfer_data(0.0);
        let next = Footstep::at_pose(Side::Left, Isometry3::translation(0.6, 0.1, 0.0));
        pipeline.initialize(&data, Some(Side::Right), Some(&next));
        assert!(pipeline.has_been_initialized_with_next_step());

        pipeline.invalidate_next_step();
        assert!(!pipeline.has_been_initialized_with_next_step());
    }
}
