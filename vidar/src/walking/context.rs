use nalgebra::{Point2, Vector2};

use crate::{
    footstep::{Footstep, Side},
    walking::TransferToAndNextFootsteps,
};

/// Shared mutable state of the walking state machine.
///
/// One instance lives for the whole controller lifetime; the transition and
/// action functions all operate on this struct by reference instead of
/// spreading the state over per-state objects.
#[derive(Debug, Clone)]
pub struct WalkingContext {
    /// Current desired ICP, carried between ticks for plan continuity.
    pub desired_icp: Point2<f32>,
    pub desired_icp_velocity: Vector2<f32>,
    pub desired_ecmp: Point2<f32>,
    pub desired_cmp: Point2<f32>,

    /// Side currently carrying the robot; `None` in double support.
    pub support_leg: Option<Side>,
    /// Side that will carry the robot during the next single support.
    pub upcoming_support_leg: Side,
    pub previous_support_side: Option<Side>,
    pub trailing_leg: Option<Side>,

    /// Set when the controller wants the next footstep from the queue.
    pub ready_to_grab_next_footstep: bool,
    /// Whether the footstep lookahead has advanced this double support.
    pub footstep_list_updated: bool,
    pub done_finishing_single_support_transfer: bool,

    pub icp_trajectory_initialized: bool,
    pub initializing_icp_trajectory: bool,
    /// First-time initialization of the standing plan happened.
    pub initialized_at_start: bool,
    /// Final desired ICP remembered across the single support → transfer
    /// boundary; NaN components mean "not valid".
    pub final_desired_icp_in_world: Point2<f32>,

    pub has_icp_planner_finished: bool,
    pub time_icp_planner_finished: f32,
    pub has_minimum_time_passed: bool,

    pub is_in_flamingo_stance: bool,
    /// Stand offset applied to the desired ICP, in the mid-feet frame.
    pub icp_stand_offset: Vector2<f32>,
    /// Offset added to the planner query time during single support.
    pub icp_projection_time_offset: f32,
    /// In-state time at which push recovery re-planned the swing.
    pub capture_time: f32,

    /// Freeze the transfer state, e.g. while probing a foothold.
    pub stay_in_transfer: bool,

    /// The footstep currently being executed by the swing foot.
    pub next_footstep: Option<Footstep>,
    /// Where the previous swing was planned to land.
    pub transfer_from_desired_footstep: Option<Footstep>,
    /// Horizontal target of the executing footstep.
    pub transfer_to_footstep_location: Point2<f32>,

    /// Neutral standing plan captured at startup, reused when recovering from
    /// a double support fall.
    pub neutral_footsteps_data: Option<TransferToAndNextFootsteps>,
}

impl Default for WalkingContext {
    fn default() -> Self {
        Self {
            desired_icp: Point2::origin(),
            desired_icp_velocity: Vector2::zeros(),
            desired_ecmp: Point2::origin(),
            desired_cmp: Point2::origin(),
            support_leg: None,
            // leading leg used for the very first transfer
            upcoming_support_leg: Side::Right,
            previous_support_side: None,
            trailing_leg: None,
            ready_to_grab_next_footstep: true,
            footstep_list_updated: false,
            done_finishing_single_support_transfer: false,
            icp_trajectory_initialized: false,
            initializing_icp_trajectory: false,
            initialized_at_start: false,
            final_desired_icp_in_world: Point2::new(f32::NAN, f32::NAN),
            has_icp_planner_finished: false,
            time_icp_planner_finished: 0.0,
            has_minimum_time_passed: false,
            is_in_flamingo_stance: false,
            icp_stand_offset: Vector2::zeros(),
            icp_projection_time_offset: 0.0,
            capture_time: 0.0,
            stay_in_transfer: false,
            next_footstep: None,
            transfer_from_desired_footstep: None,
            transfer_to_footstep_location: Point2::origin(),
            neutral_footsteps_data: None,
        }
    }
}

impl WalkingContext {
    /// Whether a final desired ICP from single support is remembered.
    #[must_use]
    pub fn has_remembered_final_icp(&self) -> bool {
        self.final_desired_icp_in_world.x.is_finite()
            && self.final_desired_icp_in_world.y.is_finite()
    }

    /// Invalidate the remembered final desired ICP.
    pub fn forget_final_icp(&mut self) {
        self.final_desired_icp_in_world = Point2::new(f32::NAN, f32::NAN);
    }
}
