//! Push recovery: monitors the divergence between the measured capture point
//! and the support region, replaces the footstep plan when a fall is
//! imminent, and adjusts the in-flight swing footstep after a push.

use std::sync::{Arc, Mutex};

use nalgebra::{Isometry2, Isometry3, Point2, Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    footstep::{Footstep, Side, SwingTrajectoryType},
    geometry::ConvexPolygon2,
};

/// Configuration for the push recovery module.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PushRecoveryConfig {
    /// Master switch. When false the module is inert: it never signals
    /// falling and never touches a footstep.
    pub enabled: bool,
    /// Reset the ICP planner when leaving a recovered single support phase.
    pub use_icp_planner_reset: bool,
    /// Distance the capture point may travel outside the support polygon
    /// before double support counts as falling, in meters.
    pub falling_distance_threshold: f32,
    /// Swing time below which re-targeting the swing foot is no longer safe,
    /// in seconds.
    pub min_swing_time_remaining_for_adjustment: f32,
    /// Predicted touch-down capture point offset (amplified tracking error)
    /// above which the swing footstep is adjusted, in meters.
    pub footstep_adjustment_threshold: f32,
    /// Maximum horizontal distance of a recovery step from the support foot,
    /// in meters.
    pub max_step_reach: f32,
    /// Time after which a recovery swing is trusted to have landed even
    /// without a foot switch report, in seconds.
    pub trust_time_to_consider_swing_finished: f32,
}

impl Default for PushRecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            use_icp_planner_reset: true,
            falling_distance_threshold: 0.02,
            min_swing_time_remaining_for_adjustment: 0.1,
            footstep_adjustment_threshold: 0.03,
            max_step_reach: 0.6,
            trust_time_to_consider_swing_finished: 0.4,
        }
    }
}

/// A recovery step computed by the anytime footstep search planner.
#[derive(Debug, Clone)]
pub struct RecoveryStepPlan {
    pub footstep: Footstep,
}

/// Mailbox between the anytime recovery planner thread and the control loop.
///
/// The planner publishes its best plan so far whenever it improves; the
/// control tick polls the latest without ever blocking or waiting for a
/// better one.
#[derive(Debug, Clone, Default)]
pub struct RecoveryPlanMailbox {
    latest: Arc<Mutex<Option<RecoveryStepPlan>>>,
}

impl RecoveryPlanMailbox {
    /// Publish a new best plan, replacing any previous one.
    pub fn publish(&self, plan: RecoveryStepPlan) {
        *self.latest.lock().expect("recovery mailbox poisoned") = Some(plan);
    }

    /// The latest published plan, if any.
    #[must_use]
    pub fn latest(&self) -> Option<RecoveryStepPlan> {
        self.latest
            .lock()
            .expect("recovery mailbox poisoned")
            .clone()
    }

    pub fn clear(&self) {
        *self.latest.lock().expect("recovery mailbox poisoned") = None;
    }
}

/// The push recovery control module.
#[derive(Debug)]
pub struct PushRecoveryModule {
    config: PushRecoveryConfig,
    capture_point: Point2<f32>,
    desired_icp: Point2<f32>,
    support_polygon: ConvexPolygon2,
    mid_feet: Isometry2<f32>,
    omega0: f32,
    recovering: bool,
    recovering_from_double_support: bool,
    recover_footstep: Option<Footstep>,
    mailbox: RecoveryPlanMailbox,
}

impl PushRecoveryModule {
    #[must_use]
    pub fn new(config: PushRecoveryConfig) -> Self {
        Self {
            config,
            capture_point: Point2::origin(),
            desired_icp: Point2::origin(),
            support_polygon: ConvexPolygon2::default(),
            mid_feet: Isometry2::identity(),
            omega0: 3.5,
            recovering: false,
            recovering_from_double_support: false,
            recover_footstep: None,
            mailbox: RecoveryPlanMailbox::default(),
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    #[must_use]
    pub fn use_icp_planner_reset(&self) -> bool {
        self.config.use_icp_planner_reset
    }

    #[must_use]
    pub fn trust_time_to_consider_swing_finished(&self) -> f32 {
        self.config.trust_time_to_consider_swing_finished
    }

    /// Handle for the anytime recovery planner thread.
    #[must_use]
    pub fn mailbox(&self) -> RecoveryPlanMailbox {
        self.mailbox.clone()
    }

    /// Refresh the module's view of the world; call once per tick before any
    /// predicate is evaluated.
    pub fn update_inputs(
        &mut self,
        capture_point: Point2<f32>,
        desired_icp: Point2<f32>,
        support_polygon: &ConvexPolygon2,
        mid_feet: Isometry2<f32>,
        omega0: f32,
    ) {
        self.capture_point = capture_point;
        self.desired_icp = desired_icp;
        self.support_polygon = support_polygon.clone();
        self.mid_feet = mid_feet;
        self.omega0 = omega0;
    }

    /// Transition predicate: is the robot falling out of double support such
    /// that `support_side` must become the single support leg?
    ///
    /// The escape direction picks the recovery swing foot (a fall to the left
    /// is caught with the left foot), so the condition bound to the *opposite*
    /// side fires. On fire the recovery footstep is computed and latched.
    pub fn check_falling_from_double_support(
        &mut self,
        support_side: Side,
        swing_foot_pose: &Isometry3<f32>,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }

        let distance = self.support_polygon.distance_to(&self.capture_point);
        if distance <= self.config.falling_distance_threshold {
            return false;
        }

        let local = self.mid_feet.inverse_transform_point(&self.capture_point);
        let swing_side = if local.y >= 0.0 { Side::Left } else { Side::Right };
        if support_side != swing_side.opposite() {
            return false;
        }

        let footstep = self
            .mailbox
            .latest()
            .map(|plan| plan.footstep)
            .unwrap_or_else(|| self.default_recovery_footstep(swing_side, swing_foot_pose));

        info!(
            ?swing_side,
            distance, "capture point left the support polygon, recovering"
        );

        self.recover_footstep = Some(footstep);
        self.recovering = true;
        self.recovering_from_double_support = true;

        true
    }

    /// Step onto the capture point, overshooting along the escape direction
    /// and clamped to the reachable range.
    fn default_recovery_footstep(
        &self,
        swing_side: Side,
        swing_foot_pose: &Isometry3<f32>,
    ) -> Footstep {
        let centroid = self.support_polygon.centroid();
        let target = clamp_reach(centroid, self.capture_point, self.config.max_step_reach);

        let yaw = self.mid_feet.rotation.angle();
        let pose = Isometry3::from_parts(
            Translation3::new(target.x, target.y, swing_foot_pose.translation.vector.z),
            UnitQuaternion::from_euler_angles(0.0, 0.0, yaw),
        );

        let mut footstep = Footstep::at_pose(swing_side, pose);
        footstep.trajectory_type = SwingTrajectoryType::PushRecovery;
        footstep
    }

    /// Check the in-flight swing footstep against the push-induced capture
    /// point offset and laterally/longitudinally adjust it when the offset
    /// grows too large. Returns whether the footstep was changed.
    ///
    /// The tracking error between the measured and the desired capture point
    /// is what a push leaves behind; propagated over the remaining swing time
    /// it is the distance by which the touch-down will miss the plan, so the
    /// footstep is shifted by exactly that offset.
    pub fn check_and_update_footstep(
        &mut self,
        swing_side: Side,
        swing_time_remaining: f32,
        next_footstep: &mut Footstep,
        support_polygon: &ConvexPolygon2,
    ) -> bool {
        if !self.config.enabled {
            return false;
        }

        if swing_time_remaining < self.config.min_swing_time_remaining_for_adjustment {
            return false;
        }

        let growth = (self.omega0 * swing_time_remaining.max(0.0)).exp();
        let offset = (self.capture_point - self.desired_icp) * growth;

        let error = offset.norm();
        if error < self.config.footstep_adjustment_threshold {
            return false;
        }

        let support_centroid = support_polygon.centroid();
        let target = clamp_reach(
            support_centroid,
            next_footstep.position2d() + offset,
            self.config.max_step_reach,
        );
        next_footstep.patch_position_xy(target);

        info!(?swing_side, error, "adjusted swing footstep for push recovery");
        self.recovering = true;

        true
    }

    #[must_use]
    pub fn is_recovering(&self) -> bool {
        self.recovering
    }

    #[must_use]
    pub fn is_recovering_from_double_support_fall(&self) -> bool {
        self.recovering_from_double_support
    }

    #[must_use]
    pub fn recover_from_double_support_footstep(&self) -> Option<Footstep> {
        self.recover_footstep.clone()
    }

    pub fn set_recover_from_double_support_footstep(&mut self, footstep: Option<Footstep>) {
        self.recover_footstep = footstep;
    }

    pub fn set_recovering_from_double_support_state(&mut self, recovering: bool) {
        self.recovering_from_double_support = recovering;
    }

    /// Forget the recovery episode at the end of the swing.
    pub fn reset(&mut self) {
        self.recovering = false;
        self.recovering_from_double_support = false;
        self.recover_footstep = None;
        self.mailbox.clear();
    }
}

/// Clamp `target` so it stays within `reach` of `origin`.
fn clamp_reach(origin: Point2<f32>, target: Point2<f32>, reach: f32) -> Point2<f32> {
    let offset = target - origin;
    let distance = offset.norm();
    if distance <= reach || distance < f32::EPSILON {
        return target;
    }

    origin + offset * (reach / distance)
}
