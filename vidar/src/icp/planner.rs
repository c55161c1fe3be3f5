use nalgebra::{Point2, Vector2};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::trajectory::PlanarTrajectory;
use crate::{footstep::Side, walking::TransferToAndNextFootsteps};

/// Configuration for the ICP trajectory planner.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct IcpPlannerConfig {
    /// Slack on the plan duration before `is_done` fires, in seconds.
    ///
    /// Negative: the plan reports done slightly before its nominal end so the
    /// state machine never waits on floating point equality.
    pub is_done_time_threshold: f32,
    /// Enable partial time freezing when the measured capture point lags the
    /// plan.
    pub do_time_freezing: bool,
    /// Rate at which plan time advances while frozen (0 stalls, 1 disables).
    pub freeze_time_factor: f32,
    /// Capture point error above which partial time freezing engages, in
    /// meters.
    pub max_error_without_partial_time_freeze: f32,
    /// Lateral offset of the reference CMP from the sole centre, in meters.
    /// Positive moves the CMP towards the inside edge.
    pub reference_cmp_inside_offset: f32,
    /// Forward offset of the reference CMP from the sole centre, in meters.
    pub reference_cmp_forward_offset: f32,
    /// Blend between the transfer-to stance centroid and the upcoming stance
    /// when computing the final desired ICP.
    pub final_icp_stance_blend: f32,
}

impl Default for IcpPlannerConfig {
    fn default() -> Self {
        Self {
            is_done_time_threshold: -1e-4,
            do_time_freezing: true,
            freeze_time_factor: 0.9,
            max_error_without_partial_time_freeze: 0.03,
            reference_cmp_inside_offset: -0.005,
            reference_cmp_forward_offset: 0.0,
            final_icp_stance_blend: 0.5,
        }
    }
}

/// Desired capture point state for one tick.
#[derive(Debug, Clone, Copy)]
pub struct IcpDesired {
    pub position: Point2<f32>,
    pub velocity: Vector2<f32>,
    /// The eCMP realising this capture point motion.
    pub ecmp: Point2<f32>,
}

impl Default for IcpDesired {
    fn default() -> Self {
        Self {
            position: Point2::origin(),
            velocity: Vector2::zeros(),
            ecmp: Point2::origin(),
        }
    }
}

#[derive(Debug, Clone)]
enum PlanMode {
    /// No active plan; the planner holds its last output and reports done.
    Inactive,
    /// Double support: polynomial interpolation towards the final desired ICP.
    DoubleSupport {
        trajectory: PlanarTrajectory,
        omega0: f32,
    },
    /// Single support: first-order divergence away from a constant exit CMP.
    SingleSupport {
        initial_icp: Point2<f32>,
        exit_cmp: Point2<f32>,
        duration: f32,
        omega0: f32,
    },
}

/// The ICP trajectory planner.
///
/// Owns its trajectory coefficients between (re)initializations; produces a
/// position-continuous, velocity-continuous desired ICP whose terminal value
/// is the final desired ICP derived from the stance geometry. Supports
/// re-targeting mid-flight for push recovery with position continuity (the
/// velocity and feed-forward terms may jump).
#[derive(Debug, Clone)]
pub struct IcpPlanner {
    config: IcpPlannerConfig,
    mode: PlanMode,
    /// Plan-local time, subject to partial freezing.
    plan_time: f32,
    last_query_time: Option<f32>,
    final_desired_icp: Point2<f32>,
    last_desired: IcpDesired,
}

impl IcpPlanner {
    #[must_use]
    pub fn new(config: IcpPlannerConfig) -> Self {
        Self {
            config,
            mode: PlanMode::Inactive,
            plan_time: 0.0,
            last_query_time: None,
            final_desired_icp: Point2::origin(),
            last_desired: IcpDesired::default(),
        }
    }

    /// Whether the planner is currently executing a double support plan.
    #[must_use]
    pub fn is_performing_double_support(&self) -> bool {
        matches!(self.mode, PlanMode::DoubleSupport { .. })
    }

    /// Plan the double support weight shift described by `data`.
    pub fn initialize_double_support(&mut self, data: &TransferToAndNextFootsteps, now: f32) {
        let duration = if data.transfer_to_side.is_some() {
            data.double_support_duration
        } else {
            data.initial_transfer_duration
        };

        self.final_desired_icp = self.compute_final_desired_icp(data);

        let trajectory = PlanarTrajectory::new(
            duration,
            data.current_desired_icp,
            data.current_desired_icp_velocity,
            self.final_desired_icp,
            Vector2::zeros(),
        );

        self.mode = PlanMode::DoubleSupport {
            trajectory,
            omega0: data.omega0,
        };
        self.restart_clock(now);
    }

    /// Plan the single support phase: the desired ICP diverges from the
    /// support foot's exit CMP towards the upcoming footstep.
    pub fn initialize_single_support(&mut self, data: &TransferToAndNextFootsteps, now: f32) {
        self.initialize_single_support_from(data.current_desired_icp, data, now);
    }

    /// Re-plan a single support phase already in flight, keeping position
    /// continuity with the last desired ICP.
    pub fn re_initialize_single_support(&mut self, data: &TransferToAndNextFootsteps, now: f32) {
        self.initialize_single_support_from(self.last_desired.position, data, now);
    }

    /// Re-target the plan after a push detected in single support.
    ///
    /// The new plan starts from the *measured* capture point: desired and
    /// actual coincide at the hand-over, so the position stays continuous
    /// while the feed-forward terms jump to the recovery trajectory.
    pub fn update_plan_for_single_support_push(
        &mut self,
        data: &TransferToAndNextFootsteps,
        capture_point: Point2<f32>,
        now: f32,
    ) {
        self.initialize_single_support_from(capture_point, data, now);
    }

    /// Re-target the plan for a recovery step out of a double support fall.
    pub fn update_plan_for_double_support_push(
        &mut self,
        data: &TransferToAndNextFootsteps,
        capture_point: Point2<f32>,
        now: f32,
    ) {
        self.initialize_single_support_from(capture_point, data, now);
    }

    fn initialize_single_support_from(
        &mut self,
        initial_icp: Point2<f32>,
        data: &TransferToAndNextFootsteps,
        now: f32,
    ) {
        let exit_cmp = self.exit_cmp(data);
        let duration = data.single_support_duration;

        self.final_desired_icp =
            propagate_icp(initial_icp, exit_cmp, data.omega0, duration);

        self.mode = PlanMode::SingleSupport {
            initial_icp,
            exit_cmp,
            duration,
            omega0: data.omega0,
        };
        self.restart_clock(now);
    }

    /// Abandon the current plan; `is_done` reports true until the next
    /// initialization.
    pub fn reset(&mut self, now: f32) {
        self.mode = PlanMode::Inactive;
        self.restart_clock(now);
    }

    /// Desired ICP position, velocity and eCMP at `now`.
    ///
    /// Advances the plan clock; with time freezing enabled the clock slows
    /// down while the measured capture point lags the plan, giving the robot
    /// time to catch up instead of racing ahead of it.
    pub fn desired_icp_at(&mut self, capture_point: Point2<f32>, now: f32) -> IcpDesired {
        self.advance_clock(capture_point, now);

        let desired = match &self.mode {
            PlanMode::Inactive => IcpDesired {
                velocity: Vector2::zeros(),
                ..self.last_desired
            },
            PlanMode::DoubleSupport { trajectory, omega0 } => {
                let position = trajectory.position(self.plan_time);
                let velocity = trajectory.velocity(self.plan_time);
                IcpDesired {
                    position,
                    velocity,
                    ecmp: ecmp_from_dynamics(position, velocity, *omega0),
                }
            }
            PlanMode::SingleSupport {
                initial_icp,
                exit_cmp,
                duration,
                omega0,
            } => {
                let t = self.plan_time.clamp(0.0, *duration);
                let position = propagate_icp(*initial_icp, *exit_cmp, *omega0, t);
                let velocity = (position - exit_cmp) * *omega0;
                IcpDesired {
                    position,
                    velocity,
                    ecmp: *exit_cmp,
                }
            }
        };

        let desired = sanitize(desired, &self.last_desired);
        self.last_desired = desired;
        desired
    }

    /// Whether the active plan has run out.
    #[must_use]
    pub fn is_done(&self, now: f32) -> bool {
        let Some(duration) = self.plan_duration() else {
            return true;
        };

        self.projected_plan_time(now) >= duration + self.config.is_done_time_threshold
    }

    /// Time the active plan still needs, in seconds.
    #[must_use]
    pub fn estimated_time_remaining(&self, now: f32) -> f32 {
        self.plan_duration()
            .map_or(0.0, |duration| (duration - self.projected_plan_time(now)).max(0.0))
    }

    /// Terminal value of the current plan.
    #[must_use]
    pub fn final_desired_icp(&self) -> Point2<f32> {
        self.final_desired_icp
    }

    fn plan_duration(&self) -> Option<f32> {
        match &self.mode {
            PlanMode::Inactive => None,
            PlanMode::DoubleSupport { trajectory, .. } => Some(trajectory.duration()),
            PlanMode::SingleSupport { duration, .. } => Some(*duration),
        }
    }

    fn restart_clock(&mut self, now: f32) {
        self.plan_time = 0.0;
        self.last_query_time = Some(now);
    }

    fn advance_clock(&mut self, capture_point: Point2<f32>, now: f32) {
        let elapsed = self
            .last_query_time
            .map_or(0.0, |last| (now - last).max(0.0));
        self.last_query_time = Some(now);

        let lag = (capture_point - self.last_desired.position).norm();
        let freezing = self.config.do_time_freezing
            && !matches!(self.mode, PlanMode::Inactive)
            && lag > self.config.max_error_without_partial_time_freeze;

        if freezing {
            self.plan_time += elapsed * self.config.freeze_time_factor;
        } else {
            self.plan_time += elapsed;
        }
    }

    fn projected_plan_time(&self, now: f32) -> f32 {
        // conditions may be checked before the tick queries the trajectory;
        // project the unfrozen clock forward for them
        let ahead = self
            .last_query_time
            .map_or(0.0, |last| (now - last).max(0.0));
        self.plan_time + ahead
    }

    /// Final desired ICP for a double support plan: blend of the transfer-to
    /// stance centroid and the upcoming stance position.
    fn compute_final_desired_icp(&self, data: &TransferToAndNextFootsteps) -> Point2<f32> {
        let stance_centroid = data.transfer_to_polygon_world().centroid();

        if data.stop_if_reached_end && data.next_footstep.is_none() {
            return stance_centroid;
        }

        let upcoming = data.upcoming_stance_position();
        let blend = self.config.final_icp_stance_blend;
        Point2::from(stance_centroid.coords * (1.0 - blend) + upcoming.coords * blend)
    }

    /// Reference exit CMP: the support sole centre pushed by the configured
    /// forward/inside offsets.
    fn exit_cmp(&self, data: &TransferToAndNextFootsteps) -> Point2<f32> {
        let support_footstep = &data.transfer_from_footstep;
        let inside_sign = match support_footstep.side {
            Side::Left => -1.0,
            Side::Right => 1.0,
        };

        let offset = nalgebra::Point3::new(
            self.config.reference_cmp_forward_offset,
            inside_sign * self.config.reference_cmp_inside_offset,
            0.0,
        );
        let world = support_footstep.pose.transform_point(&offset);
        Point2::new(world.x, world.y)
    }
}

/// First-order LIPM capture point propagation,
/// `icp(t) = cmp + e^{ω₀ t}·(icp₀ − cmp)`.
fn propagate_icp(
    initial_icp: Point2<f32>,
    cmp: Point2<f32>,
    omega0: f32,
    time: f32,
) -> Point2<f32> {
    cmp + (initial_icp - cmp) * (omega0 * time).exp()
}

/// Invert the capture point dynamics to recover the eCMP,
/// `cmp = icp − icṗ/ω₀`.
fn ecmp_from_dynamics(position: Point2<f32>, velocity: Vector2<f32>, omega0: f32) -> Point2<f32> {
    position - velocity / omega0
}

/// Replace non-finite outputs with the previous tick's values.
fn sanitize(desired: IcpDesired, fallback: &IcpDesired) -> IcpDesired {
    let finite = desired.position.coords.iter().all(|v| v.is_finite())
        && desired.velocity.iter().all(|v| v.is_finite())
        && desired.ecmp.coords.iter().all(|v| v.is_finite());

    if finite {
        return desired;
    }

    warn!("ICP plan produced a non-finite target, holding the previous value");
    IcpDesired {
        velocity: Vector2::zeros(),
        ..*fallback
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{Isometry3, Point2, Vector2, point};

    use super::{IcpPlanner, IcpPlannerConfig, propagate_icp};
    use crate::{
        footstep::{Footstep, Side},
        geometry::ConvexPolygon2,
        walking::TransferToAndNextFootsteps,
    };

    fn transfer_data() -> TransferToAndNextFootsteps {
        let sole_polygon = ConvexPolygon2::from_points(&[
            point![0.07, 0.045],
            point![0.07, -0.045],
            point![-0.07, -0.045],
            point![-0.07, 0.045],
        ]);

        TransferToAndNextFootsteps {
            transfer_from_footstep: Footstep::at_pose(
                Side::Left,
                Isometry3::translation(0.0, 0.1, 0.0),
            ),
            transfer_to_footstep: Footstep::at_pose(
                Side::Right,
                Isometry3::translation(0.0, -0.1, 0.0),
            ),
            transfer_from_desired_footstep: None,
            next_footstep: Some(Footstep::at_pose(
                Side::Left,
                Isometry3::translation(0.3, 0.1, 0.0),
            )),
            next_next_footstep: None,
            transfer_to_side: Some(Side::Right),
            transfer_to_polygon_in_sole_frame: sole_polygon,
            double_support_duration: 0.25,
            single_support_duration: 0.8,
            initial_transfer_duration: 0.4,
            estimated_step_time: 1.05,
            omega0: 3.5,
            current_desired_icp: Point2::new(0.0, 0.0),
            current_desired_icp_velocity: Vector2::zeros(),
            stop_if_reached_end: false,
        }
    }

    #[test]
    fn fresh_planner_reports_done() {
        let planner = IcpPlanner::new(IcpPlannerConfig::default());
        assert!(planner.is_done(0.0));
        assert_eq!(planner.estimated_time_remaining(0.0), 0.0);
    }

    #[test]
    fn double_support_plan_reaches_the_final_icp() {
        let mut planner = IcpPlanner::new(IcpPlannerConfig::default());
        let data = transfer_data();
        planner.initialize_double_support(&data, 0.0);

        assert!(!planner.is_done(0.0));

        // walk the plan to its end; feed the capture point right on the plan
        // so time freezing never engages
        let mut desired = planner.desired_icp_at(Point2::origin(), 0.0);
        let mut time = 0.0;
        while time < 0.3 {
            time += 0.004;
            desired = planner.desired_icp_at(desired.position, time);
        }

        assert!(planner.is_done(time));
        assert!((desired.position - planner.final_desired_icp()).norm() < 1e-3);
    }

    #[test]
    fn final_icp_blends_stance_and_upcoming_step() {
        let mut planner = IcpPlanner::new(IcpPlannerConfig::default());
        planner.initialize_double_support(&transfer_data(), 0.0);

        // blend 0.5 between the right stance centroid (0, -0.1) and the next
        // footstep (0.3, 0.1)
        let expected = Point2::new(0.15, 0.0);
        assert!((planner.final_desired_icp() - expected).norm() < 1e-5);
    }

    #[test]
    fn single_support_follows_the_pendulum_dynamics() {
        let mut planner = IcpPlanner::new(IcpPlannerConfig::default());
        let data = transfer_data();
        planner.initialize_single_support(&data, 0.0);

        let start = planner.desired_icp_at(data.current_desired_icp, 0.0);
        let later = planner.desired_icp_at(start.position, 0.2);

        let expected = propagate_icp(data.current_desired_icp, start.ecmp, data.omega0, 0.2);
        assert!((later.position - expected).norm() < 1e-4);
        // the eCMP stays pinned to the support foot
        assert!((later.ecmp - start.ecmp).norm() < 1e-6);
    }

    #[test]
    fn push_retarget_is_position_continuous_with_the_measured_icp() {
        let mut planner = IcpPlanner::new(IcpPlannerConfig::default());
        let data = transfer_data();
        planner.initialize_single_support(&data, 0.0);
        planner.desired_icp_at(Point2::origin(), 0.1);

        let pushed_capture_point = Point2::new(0.1, 0.05);
        planner.update_plan_for_single_support_push(&data, pushed_capture_point, 0.1);

        let desired = planner.desired_icp_at(pushed_capture_point, 0.1);
        assert!((desired.position - pushed_capture_point).norm() < 1e-5);
    }

    #[test]
    fn time_freezing_slows_the_plan_when_the_robot_lags() {
        let mut frozen = IcpPlanner::new(IcpPlannerConfig::default());
        let mut free = IcpPlanner::new(IcpPlannerConfig {
            do_time_freezing: false,
            ..IcpPlannerConfig::default()
        });

        let data = transfer_data();
        frozen.initialize_double_support(&data, 0.0);
        free.initialize_double_support(&data, 0.0);

        // a capture point far from the plan engages freezing
        let lagging = Point2::new(1.0, 1.0);
        for step in 1..=10 {
            let time = step as f32 * 0.01;
            frozen.desired_icp_at(lagging, time);
            free.desired_icp_at(lagging, time);
        }

        assert!(frozen.estimated_time_remaining(0.1) > free.estimated_time_remaining(0.1));
    }

    #[test]
    fn reset_abandons_the_plan() {
        let mut planner = IcpPlanner::new(IcpPlannerConfig::default());
        planner.initialize_double_support(&transfer_data(), 0.0);
        assert!(!planner.is_done(0.0));

        planner.reset(0.05);
        assert!(planner.is_done(0.05));
    }
}
