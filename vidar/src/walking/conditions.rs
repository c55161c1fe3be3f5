//! State transition predicates of the walking state machine.
//!
//! Each condition is an explicit function over the shared [`WalkingContext`]
//! and the modules it needs, bound to a robot side by its caller.

use nalgebra::Point2;

use super::{
    FootPoseRequests, LandingMode, WalkingConfig, context::WalkingContext,
    exploration::FootExploration, timing::TimingProvider,
};
use crate::{
    contact::{ContactState, ContactStates},
    estimation::FootSwitches,
    footstep::{FootstepQueue, Side},
    icp::IcpPlanner,
    push_recovery::PushRecoveryModule,
};

/// Ready to start a transfer towards `transfer_to_side`: a footstep has been
/// grabbed, the double support time has passed, and the grabbed step makes
/// `transfer_to_side` the upcoming support leg.
pub(super) fn start_walking(
    ctx: &WalkingContext,
    timing: &TimingProvider,
    transfer_to_side: Side,
    time_in_state: f32,
) -> bool {
    if ctx.ready_to_grab_next_footstep {
        return false;
    }

    let double_support_time_has_passed = time_in_state > timing.transfer_time();
    let transferring_to_this_side = transfer_to_side == ctx.upcoming_support_leg;

    transferring_to_this_side && double_support_time_has_passed
}

/// Ready to shift onto `transfer_to_side` for a flamingo stance: no footstep
/// is pending, but a foot pose request exists for the opposite foot.
///
/// Fires only after the double support time has passed; on fire the upcoming
/// support leg is re-bound to the stance side.
pub(super) fn flamingo_stance(
    ctx: &mut WalkingContext,
    foot_pose_requests: &FootPoseRequests,
    timing: &TimingProvider,
    transfer_to_side: Side,
    time_in_state: f32,
) -> bool {
    if !ctx.ready_to_grab_next_footstep {
        return false;
    }

    let double_support_time_has_passed = time_in_state > timing.transfer_time();
    let transferring_to_this_side = foot_pose_requests.has_new(transfer_to_side.opposite());

    if transferring_to_this_side && double_support_time_has_passed {
        ctx.upcoming_support_leg = transfer_to_side;
    }

    transferring_to_this_side && double_support_time_has_passed
}

/// The transfer onto `side` is complete: touch-down finished, the ICP plan is
/// initialized and done, and the measured capture point tracks the desired
/// ICP closely enough for single support.
#[allow(clippy::too_many_arguments)]
pub(super) fn done_with_transfer(
    config: &WalkingConfig,
    ctx: &WalkingContext,
    planner: &IcpPlanner,
    contacts: &ContactStates,
    switches: &FootSwitches,
    exploration: &FootExploration,
    capture_point: Point2<f32>,
    side: Side,
    now: f32,
) -> bool {
    if exploration.is_controlling_swing_foot() && !ctx.stay_in_transfer {
        return exploration.is_done();
    }

    if ctx.stay_in_transfer {
        return false;
    }

    let edge_touch_down_done = contacts.foot(side).state == ContactState::Flat
        || switches.0.get(side).has_foot_hit_ground();
    if !edge_touch_down_done {
        return false;
    }

    let icp_trajectory_is_done = ctx.icp_trajectory_initialized && planner.is_done(now);
    if !icp_trajectory_is_done {
        return false;
    }

    let icp_error = (capture_point - ctx.desired_icp).norm();
    icp_error < config.max_icp_error_before_single_support
}

/// The single support phase with `support_side` is over.
///
/// The minimum swing fraction must always have elapsed; after that either the
/// configured foot switch reports the touch-down, a recovery swing runs into
/// its trust timeout, or (when enabled) the ICP-finished dwell timeout
/// expires. Foothold exploration overrides all of it with its own done
/// signal.
#[allow(clippy::too_many_arguments)]
pub(super) fn done_with_single_support(
    config: &WalkingConfig,
    ctx: &mut WalkingContext,
    planner: &IcpPlanner,
    push_recovery: &PushRecoveryModule,
    exploration: &FootExploration,
    timing: &TimingProvider,
    switches: &FootSwitches,
    support_side: Side,
    now: f32,
    time_in_state: f32,
) -> bool {
    let swing_side = support_side.opposite();

    let minimum_swing_time = timing.swing_time() * config.minimum_swing_fraction;
    ctx.has_minimum_time_passed = time_in_state > minimum_swing_time;

    if !ctx.has_icp_planner_finished && planner.is_done(now) {
        ctx.has_icp_planner_finished = true;
        ctx.time_icp_planner_finished = now;
    }

    if exploration.is_controlling_swing_foot() {
        return ctx.has_minimum_time_passed && exploration.is_done();
    }

    let switch = switches.0.get(swing_side);
    let foot_switch_activated = match config.landing_mode {
        LandingMode::Toes => switch.has_toe_hit_ground(),
        LandingMode::Heel => switch.has_heel_hit_ground(),
        LandingMode::Flat => switch.has_foot_hit_ground(),
    };

    if push_recovery.is_enabled()
        && push_recovery.is_recovering_from_double_support_fall()
        && time_in_state > push_recovery.trust_time_to_consider_swing_finished()
    {
        return true;
    }

    if config.do_transition_when_time_is_up
        && ctx.has_icp_planner_finished
        && now > ctx.time_icp_planner_finished + config.dwell_in_single_support_duration
    {
        return true;
    }

    ctx.has_minimum_time_passed && foot_switch_activated
}

/// Single support may hand over to the transfer onto `transfer_to_side`
/// (bound per side): the footstep after the executing one must match, and the
/// plain single-support done condition must hold.
#[allow(clippy::too_many_arguments)]
pub(super) fn single_support_to_transfer_to(
    config: &WalkingConfig,
    ctx: &mut WalkingContext,
    planner: &IcpPlanner,
    push_recovery: &PushRecoveryModule,
    exploration: &FootExploration,
    timing: &TimingProvider,
    switches: &FootSwitches,
    queue: &FootstepQueue,
    condition_side: Side,
    support_side: Side,
    now: f32,
    time_in_state: f32,
) -> bool {
    let done = |ctx: &mut WalkingContext| {
        done_with_single_support(
            config,
            ctx,
            planner,
            push_recovery,
            exploration,
            timing,
            switches,
            support_side,
            now,
            time_in_state,
        )
    };

    let Some(next_next) = queue.next_next_footstep() else {
        return done(ctx);
    };

    if condition_side != next_next.side {
        return false;
    }

    done(ctx)
}

/// No more work for this side: stop walking and settle into double support.
#[allow(clippy::too_many_arguments)]
pub(super) fn stop_walking(
    config: &WalkingConfig,
    ctx: &mut WalkingContext,
    planner: &IcpPlanner,
    push_recovery: &PushRecoveryModule,
    exploration: &FootExploration,
    timing: &TimingProvider,
    switches: &FootSwitches,
    queue: &FootstepQueue,
    foot_pose_requests: &FootPoseRequests,
    side: Side,
    now: f32,
    time_in_state: f32,
) -> bool {
    let is_not_exploring_foothold = !exploration.is_controlling_swing_foot();
    let is_next_footstep_null = queue.next_footstep().is_none();

    // when the lookahead has not advanced yet, a step received mid-transfer
    // still sits one slot further down the queue
    let is_next_footstep_for_this_side = if ctx.footstep_list_updated {
        is_next_footstep_null
            || queue.next_footstep().map(|footstep| footstep.side) != Some(side)
    } else {
        let next_next = queue.next_next_footstep();
        next_next.is_none() || next_next.map(|footstep| footstep.side) != Some(side)
    };

    let is_support_leg_null = ctx.support_leg.is_none();
    let no_more_footsteps_for_this_side = (queue.is_provider_empty() && is_next_footstep_null)
        || !is_next_footstep_for_this_side;
    let no_more_foot_poses = !foot_pose_requests.has_new(side.opposite());

    let single_support_done = is_support_leg_null
        || done_with_single_support(
            config,
            ctx,
            planner,
            push_recovery,
            exploration,
            timing,
            switches,
            side,
            now,
            time_in_state,
        );

    no_more_footsteps_for_this_side
        && no_more_foot_poses
        && single_support_done
        && is_not_exploring_foothold
}
